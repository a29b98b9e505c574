//! Pipeline configuration.
//!
//! All fields have defaults, so a partial RON document such as
//! `(enable_batching: false)` is a valid configuration.

use std::{collections::BTreeSet, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{Error, Result, buffer::MAX_QUEUE_LEN};

/// Default number of predictable events between retained ones.
pub const PREDICTABLE_RETAIN_EVERY: u32 = 5;

/// Configuration for segmentation, filtering and batching.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Expected cadence of duration ticks from the capture source.
    pub update_interval_ms: u64,
    /// Enables title/tab segmentation.
    pub include_metadata: bool,
    /// Enables browser tab-switch coalescing.
    pub enable_browser_tab_tracking: bool,
    /// Queue events and flush in batches; when false every event is its own batch.
    pub enable_batching: bool,
    /// Flush as soon as the queue reaches this length.
    pub max_batch_size: usize,
    /// Longest time an accepted event may wait in the queue.
    pub max_batch_wait_ms: u64,
    /// Enables the predictability suppressor.
    pub enable_predictability: bool,
    /// Retain one of every N predictable events.
    pub predictable_retain_every: u32,
    /// When non-empty, only these app identifiers (or names) are tracked.
    pub included_apps: BTreeSet<String>,
    /// App identifiers (or names) that are never tracked.
    pub excluded_apps: BTreeSet<String>,
    /// Fan-out settings.
    pub stream: StreamConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 1000,
            include_metadata: true,
            enable_browser_tab_tracking: true,
            enable_batching: true,
            max_batch_size: 10,
            max_batch_wait_ms: 100,
            enable_predictability: false,
            predictable_retain_every: PREDICTABLE_RETAIN_EVERY,
            included_apps: BTreeSet::new(),
            excluded_apps: BTreeSet::new(),
            stream: StreamConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse a configuration from RON text and validate it.
    pub fn from_ron(text: &str) -> Result<Self> {
        let cfg: Self = ron::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(Error::Config("max_batch_size must be at least 1".into()));
        }
        if self.max_batch_size > MAX_QUEUE_LEN {
            return Err(Error::Config(format!(
                "max_batch_size must be at most {MAX_QUEUE_LEN}"
            )));
        }
        if self.max_batch_wait_ms == 0 {
            return Err(Error::Config("max_batch_wait_ms must be positive".into()));
        }
        if self.predictable_retain_every == 0 {
            return Err(Error::Config(
                "predictable_retain_every must be at least 1".into(),
            ));
        }
        if self.update_interval_ms == 0 {
            return Err(Error::Config("update_interval_ms must be positive".into()));
        }
        self.stream.validate()
    }

    /// Batch wait window as a duration.
    pub fn max_batch_wait(&self) -> Duration {
        Duration::from_millis(self.max_batch_wait_ms)
    }

    /// Whether app scoping is configured.
    pub fn has_app_scope(&self) -> bool {
        !self.included_apps.is_empty() || !self.excluded_apps.is_empty()
    }
}

/// Settings for the stream manager.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Interval between health checks.
    pub health_check_interval_ms: u64,
    /// Inactivity after which a health check forces a flush.
    pub stale_threshold_ms: u64,
    /// Interval between per-app channel cleanup passes.
    pub cleanup_interval_ms: u64,
    /// Delay before the flush retry that follows a delivery error.
    pub retry_delay_ms: u64,
    /// Per-subscriber ring capacity.
    pub channel_capacity: usize,
    /// Enables the high-throughput variant.
    pub high_throughput: Option<HighThroughputConfig>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: 60_000,
            stale_threshold_ms: 120_000,
            cleanup_interval_ms: 60_000,
            retry_delay_ms: 20,
            channel_capacity: 4096,
            high_throughput: None,
        }
    }
}

impl StreamConfig {
    /// Check value ranges.
    fn validate(&self) -> Result<()> {
        if self.health_check_interval_ms == 0 || self.cleanup_interval_ms == 0 {
            return Err(Error::Config("periodic intervals must be positive".into()));
        }
        if self.channel_capacity == 0 {
            return Err(Error::Config("channel_capacity must be at least 1".into()));
        }
        if let Some(ht) = &self.high_throughput
            && ht.max_app_channels == 0
        {
            return Err(Error::Config("max_app_channels must be at least 1".into()));
        }
        Ok(())
    }

    /// Health check interval.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Stale threshold.
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    /// Cleanup interval.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    /// Retry delay.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Settings for the high-throughput variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HighThroughputConfig {
    /// Per-app debounce window.
    pub debounce_ms: u64,
    /// Hard cap on concurrently open per-app channels.
    pub max_app_channels: usize,
}

impl Default for HighThroughputConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            max_app_channels: 64,
        }
    }
}

impl HighThroughputConfig {
    /// Debounce window.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_ron_uses_defaults() {
        let cfg = PipelineConfig::from_ron("(enable_batching: false, max_batch_size: 3)")
            .expect("parse");
        assert!(!cfg.enable_batching);
        assert_eq!(cfg.max_batch_size, 3);
        assert_eq!(cfg.max_batch_wait_ms, 100);
        assert!(cfg.include_metadata);
        assert_eq!(cfg.stream, StreamConfig::default());
    }

    #[test]
    fn nested_high_throughput() {
        let cfg = PipelineConfig::from_ron(
            "(stream: (high_throughput: Some((max_app_channels: 2))), excluded_apps: [\"Finder\"])",
        )
        .expect("parse");
        let ht = cfg.stream.high_throughput.expect("high throughput");
        assert_eq!(ht.max_app_channels, 2);
        assert_eq!(ht.debounce_ms, 50);
        assert!(cfg.excluded_apps.contains("Finder"));
        assert!(cfg.has_app_scope());
    }

    #[test]
    fn rejects_zero_batch_size() {
        let err = PipelineConfig::from_ron("(max_batch_size: 0)").unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
    }

    #[test]
    fn rejects_batch_size_above_queue_bound() {
        let err = PipelineConfig::from_ron("(max_batch_size: 1001)").unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
        let cfg = PipelineConfig::from_ron("(max_batch_size: 1000)").unwrap();
        assert_eq!(cfg.max_batch_size, MAX_QUEUE_LEN);
    }

    #[test]
    fn rejects_bad_syntax() {
        let err = PipelineConfig::from_ron("(max_batch_size: )").unwrap_err();
        assert!(matches!(err, Error::Ron(_)), "{err}");
    }
}
