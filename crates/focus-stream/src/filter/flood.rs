use std::collections::HashMap;

use super::{DropReason, EventFilter, MAX_TRACKED_APPS, Verdict};
use crate::event::{EventType, FocusEvent};

/// Non-significant events closer than this to the last kept one are dropped (100 ms).
pub const ANTI_FLOOD_WINDOW_US: u64 = 100_000;

/// Smallest duration advance between kept duration updates (0.5 s).
pub const MIN_DURATION_DELTA_US: u64 = 500_000;

/// The last event kept for an app.
#[derive(Clone, Copy, Debug)]
struct Retained {
    /// Event timestamp.
    timestamp: u64,
    /// Event kind.
    event_type: EventType,
    /// Segment-relative duration.
    duration_us: u64,
}

/// Tier-1 deduplication: drops bursts and negligible duration updates.
///
/// Significant events (gained, lost, or duration updates of at least 5 s) are
/// always kept.
#[derive(Debug, Default)]
pub struct AntiFlood {
    /// Last kept event per app.
    last: HashMap<String, Retained>,
}

impl AntiFlood {
    /// Create a filter with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of apps with history.
    pub fn tracked_apps(&self) -> usize {
        self.last.len()
    }

    /// Whether `event` repeats what was last kept for its app.
    fn is_duplicate(&self, event: &FocusEvent) -> bool {
        if event.is_significant() {
            return false;
        }
        let Some(prev) = self.last.get(event.app_key()) else {
            return false;
        };
        if event.timestamp.saturating_sub(prev.timestamp) < ANTI_FLOOD_WINDOW_US {
            return true;
        }
        event.event_type == EventType::DurationUpdate
            && prev.event_type == EventType::DurationUpdate
            && event.duration_us.saturating_sub(prev.duration_us) < MIN_DURATION_DELTA_US
    }

    /// Record `event` as the last kept one for its app.
    fn remember(&mut self, event: &FocusEvent) {
        if self.last.len() >= MAX_TRACKED_APPS && !self.last.contains_key(event.app_key()) {
            let oldest = self
                .last
                .iter()
                .min_by_key(|(_, r)| r.timestamp)
                .map(|(k, _)| k.clone());
            if let Some(key) = oldest {
                self.last.remove(&key);
            }
        }
        self.last.insert(
            event.app_key().to_string(),
            Retained {
                timestamp: event.timestamp,
                event_type: event.event_type,
                duration_us: event.duration_us,
            },
        );
    }
}

impl EventFilter for AntiFlood {
    fn name(&self) -> &'static str {
        "anti_flood"
    }

    fn check(&mut self, event: &FocusEvent) -> Verdict {
        if self.is_duplicate(event) {
            return Verdict::Drop(DropReason::Duplicate);
        }
        self.remember(event);
        Verdict::Keep
    }

    fn clear(&mut self) {
        self.last.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(app: &str, ty: EventType, ts_ms: u64, dur_ms: u64) -> FocusEvent {
        FocusEvent::new(app, ty, ts_ms * 1000, dur_ms * 1000)
    }

    #[test]
    fn burst_within_window_is_dropped() {
        let mut f = AntiFlood::new();
        assert_eq!(f.check(&ev("A", EventType::Gained, 0, 0)), Verdict::Keep);
        assert_eq!(
            f.check(&ev("A", EventType::DurationUpdate, 50, 1000)),
            Verdict::Drop(DropReason::Duplicate)
        );
        assert_eq!(f.check(&ev("A", EventType::DurationUpdate, 100, 1000)), Verdict::Keep);
    }

    #[test]
    fn significant_events_always_pass() {
        let mut f = AntiFlood::new();
        f.check(&ev("A", EventType::Gained, 0, 0));
        assert_eq!(f.check(&ev("A", EventType::Lost, 10, 10)), Verdict::Keep);
        assert_eq!(f.check(&ev("A", EventType::Gained, 20, 0)), Verdict::Keep);
        assert_eq!(
            f.check(&ev("A", EventType::DurationUpdate, 30, 6000)),
            Verdict::Keep
        );
    }

    #[test]
    fn small_duration_delta_is_dropped() {
        let mut f = AntiFlood::new();
        f.check(&ev("A", EventType::DurationUpdate, 0, 1000));
        assert_eq!(
            f.check(&ev("A", EventType::DurationUpdate, 1000, 1400)),
            Verdict::Drop(DropReason::Duplicate)
        );
        assert_eq!(f.check(&ev("A", EventType::DurationUpdate, 2000, 1500)), Verdict::Keep);
    }

    #[test]
    fn delta_rule_needs_prior_update() {
        let mut f = AntiFlood::new();
        f.check(&ev("A", EventType::Gained, 0, 0));
        assert_eq!(f.check(&ev("A", EventType::DurationUpdate, 200, 100)), Verdict::Keep);
    }

    #[test]
    fn tab_change_is_subject_to_window() {
        let mut f = AntiFlood::new();
        f.check(&ev("A", EventType::DurationUpdate, 0, 1000));
        assert_eq!(
            f.check(&ev("A", EventType::TabChange, 40, 1040)),
            Verdict::Drop(DropReason::Duplicate)
        );
        assert_eq!(f.check(&ev("A", EventType::TabChange, 150, 1150)), Verdict::Keep);
        // A kept tab change is the new reference point.
        assert_eq!(
            f.check(&ev("A", EventType::DurationUpdate, 200, 100)),
            Verdict::Drop(DropReason::Duplicate)
        );
    }

    #[test]
    fn apps_are_independent() {
        let mut f = AntiFlood::new();
        f.check(&ev("A", EventType::DurationUpdate, 0, 1000));
        assert_eq!(f.check(&ev("B", EventType::DurationUpdate, 10, 1000)), Verdict::Keep);
        assert_eq!(f.tracked_apps(), 2);
        f.clear();
        assert_eq!(f.tracked_apps(), 0);
    }

    #[test]
    fn history_is_bounded() {
        let mut f = AntiFlood::new();
        for i in 0..(MAX_TRACKED_APPS as u64 + 10) {
            f.check(&ev(&format!("app{i}"), EventType::Gained, i, 0));
        }
        assert_eq!(f.tracked_apps(), MAX_TRACKED_APPS);
    }
}
