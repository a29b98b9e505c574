//! Predictability suppression.
//!
//! Some capture sources tick on a fixed cadence. When the inter-arrival times
//! of an app's duration updates are regular, most of those updates carry no
//! information and only a sample is kept.
//!
//! Sampling runs over the app's whole duration-update series: every
//! `retain_every`th update is kept. Updates are let through off-cadence only
//! once enough history exists to show the arrivals are irregular.

use std::collections::{HashMap, VecDeque};

use super::{DropReason, EventFilter, MAX_TRACKED_APPS, Verdict};
use crate::event::{EventType, FocusEvent};

/// Timestamps kept per app.
pub const SERIES_LEN: usize = 10;

/// Coefficient of variation below which a series counts as predictable.
pub const PREDICTABLE_CV: f64 = 0.2;

/// Prior duration updates needed before a series can be classified.
const MIN_PRIOR: usize = 3;

/// Recent duration-update timestamps for one app.
#[derive(Clone, Debug, Default)]
pub struct EventSeries {
    /// Timestamps in arrival order, at most [`SERIES_LEN`].
    stamps: VecDeque<u64>,
    /// Duration updates seen since the series began.
    seen: u64,
}

impl EventSeries {
    /// Record an arrival, evicting the oldest beyond [`SERIES_LEN`].
    pub fn push(&mut self, timestamp: u64) {
        if self.stamps.len() == SERIES_LEN {
            self.stamps.pop_front();
        }
        self.stamps.push_back(timestamp);
    }

    /// Number of recorded arrivals.
    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    /// True when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    /// Most recent arrival.
    pub fn last(&self) -> Option<u64> {
        self.stamps.back().copied()
    }

    /// Coefficient of variation of the inter-arrival intervals.
    ///
    /// `None` with fewer than two intervals or a zero mean.
    pub fn interval_cv(&self) -> Option<f64> {
        let intervals: Vec<f64> = self
            .stamps
            .iter()
            .zip(self.stamps.iter().skip(1))
            .map(|(a, b)| b.saturating_sub(*a) as f64)
            .collect();
        if intervals.len() < 2 {
            return None;
        }
        let n = intervals.len() as f64;
        let mean = intervals.iter().sum::<f64>() / n;
        if mean <= 0.0 {
            return None;
        }
        let var = intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / n;
        Some(var.sqrt() / mean)
    }

    /// Whether the series is regular enough to sample. Counts the latest
    /// arrival as the current event, so at least [`MIN_PRIOR`] earlier ones are
    /// required.
    pub fn is_predictable(&self) -> bool {
        self.stamps.len() > MIN_PRIOR && self.interval_cv().is_some_and(|cv| cv < PREDICTABLE_CV)
    }

    /// Whether enough history exists to show the series is not predictable.
    pub fn is_irregular(&self) -> bool {
        self.stamps.len() > MIN_PRIOR && self.interval_cv().is_some_and(|cv| cv >= PREDICTABLE_CV)
    }

    /// Duration updates seen since the series began.
    pub fn seen(&self) -> u64 {
        self.seen
    }
}

/// Tier-2 filter: keeps one of every `retain_every` duration updates of a
/// series that is predictable or not yet classified.
#[derive(Debug)]
pub struct Predictability {
    /// Sampling period for predictable events.
    retain_every: u32,
    /// Series per app.
    series: HashMap<String, EventSeries>,
}

impl Predictability {
    /// Create a filter sampling every `retain_every`th duration update.
    pub fn new(retain_every: u32) -> Self {
        Self {
            retain_every: retain_every.max(1),
            series: HashMap::new(),
        }
    }

    /// Series for `app`, if any.
    pub fn series(&self, app: &str) -> Option<&EventSeries> {
        self.series.get(app)
    }

    /// Make room for a new app by evicting the one heard from least recently.
    fn evict_if_full(&mut self, app: &str) {
        if self.series.len() < MAX_TRACKED_APPS || self.series.contains_key(app) {
            return;
        }
        let stale = self
            .series
            .iter()
            .min_by_key(|(_, s)| s.last().unwrap_or(0))
            .map(|(k, _)| k.clone());
        if let Some(key) = stale {
            self.series.remove(&key);
        }
    }
}

impl EventFilter for Predictability {
    fn name(&self) -> &'static str {
        "predictability"
    }

    fn check(&mut self, event: &FocusEvent) -> Verdict {
        match event.event_type {
            EventType::DurationUpdate => {}
            EventType::Gained | EventType::Lost => {
                // Session boundaries restart the series.
                self.series.remove(event.app_key());
                return Verdict::Keep;
            }
            EventType::TabChange => return Verdict::Keep,
        }

        self.evict_if_full(event.app_key());
        let retain_every = self.retain_every;
        let series = self.series.entry(event.app_key().to_string()).or_default();
        series.push(event.timestamp);
        series.seen = series.seen.saturating_add(1);
        if series.is_irregular() || series.seen % u64::from(retain_every) == 0 {
            Verdict::Keep
        } else {
            Verdict::Drop(DropReason::Predictable)
        }
    }

    fn clear(&mut self) {
        self.series.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(app: &str, ts_ms: u64) -> FocusEvent {
        FocusEvent::new(app, EventType::DurationUpdate, ts_ms * 1000, ts_ms * 1000)
    }

    #[test]
    fn cv_of_periodic_series_is_zero() {
        let mut s = EventSeries::default();
        for i in 0..5 {
            s.push(i * 1_000_000);
        }
        assert_eq!(s.interval_cv(), Some(0.0));
        assert!(s.is_predictable());
    }

    #[test]
    fn irregular_series_is_not_predictable() {
        let mut s = EventSeries::default();
        for ts in [0, 100, 2_000, 2_100, 9_000] {
            s.push(ts * 1000);
        }
        assert!(!s.is_predictable());
    }

    #[test]
    fn series_is_bounded() {
        let mut s = EventSeries::default();
        for i in 0..25 {
            s.push(i);
        }
        assert_eq!(s.len(), SERIES_LEN);
        assert_eq!(s.last(), Some(24));
    }

    #[test]
    fn ten_periodic_updates_keep_two() {
        let mut f = Predictability::new(5);
        let kept: Vec<u64> = (0..10)
            .filter(|i| f.check(&update("A", i * 1000)) == Verdict::Keep)
            .collect();
        assert_eq!(kept, vec![4, 9]);
        assert_eq!(f.series("A").map(EventSeries::seen), Some(10));
    }

    #[test]
    fn irregular_series_passes_after_warm_up() {
        let mut f = Predictability::new(5);
        let stamps = [0, 100, 2_000, 2_100, 9_000, 9_050];
        let verdicts: Vec<Verdict> = stamps.iter().map(|ts| f.check(&update("A", *ts))).collect();
        // Too little history to tell for the first three; sampled like a periodic run.
        assert!(verdicts[..3].iter().all(|v| *v != Verdict::Keep));
        assert!(verdicts[3..].iter().all(|v| *v == Verdict::Keep));
    }

    #[test]
    fn apps_are_sampled_independently() {
        let mut f = Predictability::new(2);
        assert_eq!(f.check(&update("A", 0)), Verdict::Drop(DropReason::Predictable));
        assert_eq!(f.check(&update("B", 0)), Verdict::Drop(DropReason::Predictable));
        assert_eq!(f.check(&update("A", 1000)), Verdict::Keep);
        assert_eq!(f.check(&update("B", 1000)), Verdict::Keep);
    }

    #[test]
    fn session_boundary_clears_series() {
        let mut f = Predictability::new(5);
        for i in 0..6 {
            f.check(&update("A", i * 1000));
        }
        f.check(&FocusEvent::new("A", EventType::Lost, 7_000_000, 0));
        assert!(f.series("A").is_none());
    }
}
