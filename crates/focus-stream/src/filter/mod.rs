//! Ordered event filters applied before events are queued.
//!
//! Each filter sees only events that every earlier filter kept. The pipeline
//! built from a [`PipelineConfig`] runs app scoping, then predictability
//! suppression, then anti-flood deduplication.

/// Anti-flood deduplication.
mod flood;
mod pattern;
/// Include/exclude app scoping.
mod scope;

pub use flood::{ANTI_FLOOD_WINDOW_US, AntiFlood, MIN_DURATION_DELTA_US};
pub use pattern::{EventSeries, PREDICTABLE_CV, Predictability, SERIES_LEN};
pub use scope::AppScope;

use crate::{config::PipelineConfig, event::FocusEvent};

/// Upper bound on per-app entries any filter keeps.
pub const MAX_TRACKED_APPS: usize = 256;

/// Why a filter rejected an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The app is excluded or not included.
    OutOfScope,
    /// The event belongs to a predictable series and was not sampled.
    Predictable,
    /// The event repeats recent information for the same app.
    Duplicate,
}

/// Outcome of running an event through a filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Pass the event on.
    Keep,
    /// Discard the event.
    Drop(DropReason),
}

/// A stage in the filter pipeline.
///
/// Filters own their per-app bookkeeping and are driven serially by the buffer
/// actor, so they need no interior locking.
pub trait EventFilter: Send {
    /// Short name used in trace output.
    fn name(&self) -> &'static str;

    /// Decide whether `event` continues down the pipeline.
    fn check(&mut self, event: &FocusEvent) -> Verdict;

    /// Forget all per-app state.
    fn clear(&mut self);
}

/// An ordered list of filters; the first rejection wins.
#[derive(Default)]
pub struct FilterPipeline {
    /// Filters in evaluation order.
    filters: Vec<Box<dyn EventFilter>>,
}

impl FilterPipeline {
    /// An empty pipeline that keeps everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard pipeline for `cfg`.
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        let mut pipeline = Self::new();
        if cfg.has_app_scope() {
            pipeline.push(AppScope::new(
                cfg.included_apps.clone(),
                cfg.excluded_apps.clone(),
            ));
        }
        if cfg.enable_predictability {
            pipeline.push(Predictability::new(cfg.predictable_retain_every));
        }
        pipeline.push(AntiFlood::new());
        pipeline
    }

    /// Append a filter.
    pub fn push(&mut self, filter: impl EventFilter + 'static) {
        self.filters.push(Box::new(filter));
    }

    /// Filter names in evaluation order.
    pub fn names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Run `event` through every filter.
    pub fn check(&mut self, event: &FocusEvent) -> Verdict {
        for filter in &mut self.filters {
            if let Verdict::Drop(reason) = filter.check(event) {
                tracing::trace!(
                    filter = filter.name(),
                    app = %event.app_name,
                    ty = %event.event_type,
                    ?reason,
                    "event_dropped"
                );
                return Verdict::Drop(reason);
            }
        }
        Verdict::Keep
    }

    /// Reset every filter.
    pub fn clear(&mut self) {
        for filter in &mut self.filters {
            filter.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;

    #[test]
    fn pipeline_order_follows_config() {
        let mut cfg = PipelineConfig::default();
        assert_eq!(FilterPipeline::from_config(&cfg).names(), vec!["anti_flood"]);

        cfg.enable_predictability = true;
        cfg.excluded_apps.insert("Finder".into());
        assert_eq!(
            FilterPipeline::from_config(&cfg).names(),
            vec!["app_scope", "predictability", "anti_flood"]
        );
    }

    #[test]
    fn first_rejection_wins() {
        let mut cfg = PipelineConfig::default();
        cfg.excluded_apps.insert("Finder".into());
        let mut pipeline = FilterPipeline::from_config(&cfg);
        let ev = FocusEvent::new("Finder", EventType::Gained, 0, 0);
        assert_eq!(pipeline.check(&ev), Verdict::Drop(DropReason::OutOfScope));
        let ev = FocusEvent::new("Editor", EventType::Gained, 0, 0);
        assert_eq!(pipeline.check(&ev), Verdict::Keep);
    }
}
