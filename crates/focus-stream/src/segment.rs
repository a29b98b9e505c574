//! Segmentation of raw focus ticks into session-correct events.
//!
//! Capture sources report durations cumulatively from the moment an app gained
//! focus. A window-title or browser-tab change inside the same app starts a new
//! segment: the segmenter emits a `tabChange` for the closing segment and
//! re-bases subsequent durations on the segment origin.

use tracing::{debug, trace};

use crate::{
    Error, Result,
    config::PipelineConfig,
    event::{EventType, FocusEvent, FocusMetadata, RawTick, TabSwitch, TickKind},
};

/// Stateful tick normalizer for one tracking session.
#[derive(Debug, Default)]
pub struct Segmenter {
    /// Gate for all title/tab segmentation.
    include_metadata: bool,
    /// Gate for browser lost/gained coalescing.
    track_tabs: bool,
    /// Session stamped onto emitted events.
    session_id: Option<String>,
    /// App instance of the most recent tick.
    app_key: Option<String>,
    /// Last observed window title for the current app.
    title: Option<String>,
    /// Last observed tab identity for the current app.
    tab: Option<String>,
    /// Cumulative duration at which the current segment began.
    origin: u64,
    /// Browser `lost` awaiting the next tick.
    pending_lost: Option<RawTick>,
    /// Latest tick of a session that has not seen its `lost`.
    open: Option<RawTick>,
}

impl Segmenter {
    /// Create a segmenter gated by `cfg`.
    pub fn new(cfg: &PipelineConfig) -> Self {
        Self {
            include_metadata: cfg.include_metadata,
            track_tabs: cfg.enable_browser_tab_tracking,
            ..Self::default()
        }
    }

    /// Stamp emitted events with `session_id`.
    pub fn set_session(&mut self, session_id: Option<String>) {
        self.session_id = session_id;
    }

    /// Current session id.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Segment origin of the current app, in microseconds.
    pub fn segment_origin(&self) -> u64 {
        self.origin
    }

    /// Whether a browser `lost` is buffered.
    pub fn has_pending_lost(&self) -> bool {
        self.pending_lost.is_some()
    }

    /// Normalize one tick into zero, one or two events.
    pub fn process(&mut self, tick: RawTick) -> Result<Vec<FocusEvent>> {
        if tick.app_name.trim().is_empty() {
            return Err(Error::MalformedTick(format!(
                "{} tick at {} has no app name",
                EventType::from(tick.kind),
                tick.timestamp
            )));
        }

        self.open = (tick.kind != TickKind::Lost).then(|| tick.clone());
        let mut out = Vec::new();
        let key = tick.app_key();
        if self.app_key.as_deref() != Some(key.as_str()) {
            if let Some(lost) = self.pending_lost.take() {
                out.push(self.event(&lost, EventType::Lost, lost.duration_us));
            }
            debug!(app = %tick.app_name, key = %key, "app_switch");
            self.origin = 0;
            self.app_key = Some(key);
            self.title = tick.window_title().map(str::to_string);
            self.tab = tick.tab_identity();
            out.push(self.forward(&tick));
            return Ok(out);
        }

        if self.include_metadata && self.track_tabs && tick.is_browser() {
            self.browser_tick(tick, &mut out);
        } else if self.include_metadata && !tick.is_browser() {
            self.window_tick(&tick, &mut out);
        } else {
            self.refresh(&tick);
            out.push(self.forward(&tick));
        }
        Ok(out)
    }

    /// Close the session when tracking stops.
    ///
    /// Flushes a buffered browser `lost`; otherwise, if the current app never
    /// lost focus, emits a `lost` at its last known duration.
    pub fn finish(&mut self) -> Option<FocusEvent> {
        if let Some(lost) = self.pending_lost.take() {
            self.open = None;
            return Some(self.event(&lost, EventType::Lost, lost.duration_us));
        }
        let last = self.open.take()?;
        let segment = last.duration_us.saturating_sub(self.origin);
        debug!(app = %last.app_name, segment, "session_closed_on_stop");
        Some(self.event(&last, EventType::Lost, segment))
    }

    /// Drop all per-session state. The session id is kept.
    pub fn reset(&mut self) {
        self.app_key = None;
        self.title = None;
        self.tab = None;
        self.origin = 0;
        self.pending_lost = None;
        self.open = None;
    }

    /// Same-app tick from a browser window.
    fn browser_tick(&mut self, tick: RawTick, out: &mut Vec<FocusEvent>) {
        match tick.kind {
            TickKind::Lost => {
                if let Some(prev) = self.pending_lost.take() {
                    out.push(self.event(&prev, EventType::Lost, prev.duration_us));
                }
                trace!(app = %tick.app_name, "browser_lost_buffered");
                self.pending_lost = Some(tick);
            }
            TickKind::Gained => {
                let current = tick.tab_identity();
                match self.pending_lost.take() {
                    Some(lost) if tab_changed(self.tab.as_deref(), current.as_deref()) => {
                        trace!(
                            app = %tick.app_name,
                            from = ?self.tab,
                            to = ?current,
                            "browser_tab_change"
                        );
                        let switch = TabSwitch {
                            previous: self.tab.clone(),
                            current: current.clone(),
                        };
                        out.push(self.tab_change(&tick, lost.duration_us, switch));
                    }
                    Some(lost) => {
                        out.push(self.event(&lost, EventType::Lost, lost.duration_us));
                        out.push(self.forward(&tick));
                    }
                    None => out.push(self.forward(&tick)),
                }
                self.refresh(&tick);
            }
            TickKind::DurationUpdate => {
                if let Some(lost) = self.pending_lost.take() {
                    out.push(self.event(&lost, EventType::Lost, lost.duration_us));
                }
                self.refresh(&tick);
                out.push(self.forward(&tick));
            }
        }
    }

    /// Same-app tick from a plain window.
    fn window_tick(&mut self, tick: &RawTick, out: &mut Vec<FocusEvent>) {
        match tick.kind {
            TickKind::DurationUpdate => {
                let current = tick.window_title().map(str::to_string);
                let segment = tick.duration_us.saturating_sub(self.origin);
                if let (Some(prev), Some(cur)) = (&self.title, &current)
                    && prev != cur
                {
                    trace!(app = %tick.app_name, segment, "title_change");
                    let switch = TabSwitch {
                        previous: Some(prev.clone()),
                        current: Some(cur.clone()),
                    };
                    out.push(self.tab_change(tick, segment, switch));
                    self.origin = tick.duration_us;
                    self.title = current;
                    return;
                }
                if current.is_some() {
                    self.title = current;
                }
                out.push(self.event(tick, EventType::DurationUpdate, segment));
            }
            TickKind::Lost => {
                let segment = tick.duration_us.saturating_sub(self.origin);
                out.push(self.event(tick, EventType::Lost, segment));
                self.origin = 0;
                self.title = None;
            }
            TickKind::Gained => {
                self.origin = 0;
                self.refresh(tick);
                out.push(self.forward(tick));
            }
        }
    }

    /// Update the stored title and tab identity from a tick that carries them.
    fn refresh(&mut self, tick: &RawTick) {
        if let Some(title) = tick.window_title() {
            self.title = Some(title.to_string());
        }
        if let Some(tab) = tick.tab_identity() {
            self.tab = Some(tab);
        }
    }

    /// Tick as an event of its own kind and duration.
    fn forward(&self, tick: &RawTick) -> FocusEvent {
        self.event(tick, tick.kind.into(), tick.duration_us)
    }

    /// `tabChange` carrying `switch` in its metadata.
    fn tab_change(&self, tick: &RawTick, duration_us: u64, switch: TabSwitch) -> FocusEvent {
        let mut ev = self.event(tick, EventType::TabChange, duration_us);
        let mut meta = ev.metadata.take().unwrap_or_default();
        meta.tab_switch = Some(switch);
        ev.metadata = Some(meta);
        ev
    }

    /// Build an event from `tick` with overridden type and duration.
    fn event(&self, tick: &RawTick, event_type: EventType, duration_us: u64) -> FocusEvent {
        let mut ev = FocusEvent::from_tick(tick, self.session_id.as_deref());
        ev.event_type = event_type;
        ev.duration_us = duration_us;
        if !self.include_metadata {
            ev.metadata = None;
        } else if event_type == EventType::TabChange && ev.metadata.is_none() {
            ev.metadata = Some(FocusMetadata::default());
        }
        ev
    }
}

/// A switch needs both identities known and different.
fn tab_changed(previous: Option<&str>, current: Option<&str>) -> bool {
    matches!((previous, current), (Some(p), Some(c)) if p != c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event::BrowserTabInfo, tab};

    fn window(kind: TickKind, ts_ms: u64, dur_us: u64, title: &str) -> RawTick {
        RawTick::new("Editor", kind, ts_ms * 1000, dur_us)
            .with_pid(7)
            .with_metadata(FocusMetadata::window(title))
    }

    fn browser(kind: TickKind, ts_ms: u64, dur_us: u64, title: &str) -> RawTick {
        let info: BrowserTabInfo = tab::extract_tab_info(title, "chrome.exe");
        RawTick::new("Chrome", kind, ts_ms * 1000, dur_us)
            .with_pid(9)
            .with_metadata(FocusMetadata::browser(title, info))
    }

    fn types(events: &[FocusEvent]) -> Vec<EventType> {
        events.iter().map(|e| e.event_type).collect()
    }

    #[test]
    fn rejects_empty_app_name() {
        let mut seg = Segmenter::new(&PipelineConfig::default());
        let err = seg
            .process(RawTick::new("  ", TickKind::Gained, 0, 0))
            .unwrap_err();
        assert!(matches!(err, Error::MalformedTick(_)));
    }

    #[test]
    fn title_change_rebases_segment() {
        let mut seg = Segmenter::new(&PipelineConfig::default());
        seg.process(window(TickKind::Gained, 0, 0, "a.rs")).unwrap();
        let upd = seg
            .process(window(TickKind::DurationUpdate, 1000, 1_000_000, "a.rs"))
            .unwrap();
        assert_eq!(upd[0].duration_us, 1_000_000);

        let change = seg
            .process(window(TickKind::DurationUpdate, 2000, 2_000_000, "b.rs"))
            .unwrap();
        assert_eq!(types(&change), vec![EventType::TabChange]);
        assert_eq!(change[0].duration_us, 2_000_000);
        let switch = change[0]
            .metadata
            .as_ref()
            .and_then(|m| m.tab_switch.clone())
            .unwrap();
        assert_eq!(switch.previous.as_deref(), Some("a.rs"));
        assert_eq!(switch.current.as_deref(), Some("b.rs"));
        assert_eq!(seg.segment_origin(), 2_000_000);

        let next = seg
            .process(window(TickKind::DurationUpdate, 3500, 3_500_000, "b.rs"))
            .unwrap();
        assert_eq!(next[0].duration_us, 1_500_000);

        let lost = seg
            .process(window(TickKind::Lost, 4000, 4_000_000, "b.rs"))
            .unwrap();
        assert_eq!(types(&lost), vec![EventType::Lost]);
        assert_eq!(lost[0].duration_us, 2_000_000);
        assert_eq!(seg.segment_origin(), 0);
    }

    #[test]
    fn browser_tab_switch_coalesces_pair() {
        let mut seg = Segmenter::new(&PipelineConfig::default());
        seg.process(browser(TickKind::Gained, 0, 0, "github.com - Google Chrome"))
            .unwrap();
        let buffered = seg
            .process(browser(TickKind::Lost, 3000, 3_000_000, "github.com - Google Chrome"))
            .unwrap();
        assert!(buffered.is_empty());
        assert!(seg.has_pending_lost());

        let out = seg
            .process(browser(TickKind::Gained, 3010, 0, "docs.rs - Google Chrome"))
            .unwrap();
        assert_eq!(types(&out), vec![EventType::TabChange]);
        assert_eq!(out[0].duration_us, 3_000_000);
        let switch = out[0]
            .metadata
            .as_ref()
            .and_then(|m| m.tab_switch.clone())
            .unwrap();
        assert_eq!(switch.previous.as_deref(), Some("github.com"));
        assert_eq!(switch.current.as_deref(), Some("docs.rs"));
    }

    #[test]
    fn browser_same_tab_forwards_both() {
        let mut seg = Segmenter::new(&PipelineConfig::default());
        seg.process(browser(TickKind::Gained, 0, 0, "github.com - Google Chrome"))
            .unwrap();
        seg.process(browser(TickKind::Lost, 100, 100_000, "github.com - Google Chrome"))
            .unwrap();
        let out = seg
            .process(browser(TickKind::Gained, 200, 0, "github.com - Google Chrome"))
            .unwrap();
        assert_eq!(types(&out), vec![EventType::Lost, EventType::Gained]);
    }

    #[test]
    fn pending_lost_flushes_on_app_switch_and_finish() {
        let mut seg = Segmenter::new(&PipelineConfig::default());
        seg.process(browser(TickKind::Gained, 0, 0, "a.com - Google Chrome"))
            .unwrap();
        seg.process(browser(TickKind::Lost, 100, 100_000, "a.com - Google Chrome"))
            .unwrap();
        let out = seg.process(window(TickKind::Gained, 200, 0, "x")).unwrap();
        assert_eq!(types(&out), vec![EventType::Lost, EventType::Gained]);
        assert_eq!(out[0].app_name, "Chrome");

        seg.reset();
        seg.process(browser(TickKind::Gained, 0, 0, "a.com - Google Chrome"))
            .unwrap();
        seg.process(browser(TickKind::Lost, 100, 100_000, "a.com - Google Chrome"))
            .unwrap();
        let last = seg.finish().unwrap();
        assert_eq!(last.event_type, EventType::Lost);
        assert!(seg.finish().is_none());
    }

    #[test]
    fn finish_closes_open_session() {
        let mut seg = Segmenter::new(&PipelineConfig::default());
        seg.process(window(TickKind::Gained, 0, 0, "a.rs")).unwrap();
        seg.process(window(TickKind::DurationUpdate, 1000, 1_000_000, "b.rs"))
            .unwrap();
        seg.process(window(TickKind::DurationUpdate, 2500, 2_500_000, "b.rs"))
            .unwrap();
        let lost = seg.finish().unwrap();
        assert_eq!(lost.event_type, EventType::Lost);
        assert_eq!(lost.duration_us, 1_500_000);
        assert!(seg.finish().is_none());

        seg.process(window(TickKind::Lost, 3000, 3_000_000, "b.rs"))
            .unwrap();
        assert!(seg.finish().is_none());
    }

    #[test]
    fn metadata_disabled_forwards_verbatim() {
        let cfg = PipelineConfig {
            include_metadata: false,
            ..PipelineConfig::default()
        };
        let mut seg = Segmenter::new(&cfg);
        seg.set_session(Some("session_1".into()));
        seg.process(window(TickKind::Gained, 0, 0, "a")).unwrap();
        let out = seg
            .process(window(TickKind::DurationUpdate, 1000, 1_000_000, "b"))
            .unwrap();
        assert_eq!(types(&out), vec![EventType::DurationUpdate]);
        assert_eq!(out[0].duration_us, 1_000_000);
        assert!(out[0].metadata.is_none());
        assert_eq!(out[0].session_id.as_deref(), Some("session_1"));
    }

    #[test]
    fn unknown_previous_title_is_not_a_change() {
        let mut seg = Segmenter::new(&PipelineConfig::default());
        seg.process(RawTick::new("Editor", TickKind::Gained, 0, 0).with_pid(7))
            .unwrap();
        let out = seg
            .process(window(TickKind::DurationUpdate, 1000, 1_000_000, "a.rs"))
            .unwrap();
        assert_eq!(types(&out), vec![EventType::DurationUpdate]);
    }
}
