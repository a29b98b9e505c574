#![warn(missing_docs)]

//! Shared logging helpers for the focus-stream workspace.
//!
//! - [`LogSettings`]: level controls, deserializable next to the pipeline config
//! - [`compute_spec`]: resolve settings and `RUST_LOG` into a filter directive
//! - [`init`] / [`try_init`]: install a compact fmt subscriber

use std::env;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    EnvFilter, fmt, layer::SubscriberExt, registry, util::SubscriberInitExt,
    util::TryInitError,
};

/// Logging controls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Set global log level to trace (our crates only)
    pub trace: bool,

    /// Set global log level to debug (our crates only)
    pub debug: bool,

    /// Set a single global log level for our crates (error|warn|info|debug|trace)
    pub log_level: Option<String>,

    /// Set an explicit tracing filter directive (overrides other settings)
    /// e.g. "focus_stream=trace"
    pub log_filter: Option<String>,
}

impl LogSettings {
    /// Resolve these settings into a filter directive.
    pub fn spec(&self) -> String {
        compute_spec(
            self.trace,
            self.debug,
            self.log_level.as_deref(),
            self.log_filter.as_deref(),
        )
    }
}

/// List of crate targets that constitute "our" logs.
pub fn our_crates() -> &'static [&'static str] {
    &["focus_stream", "logging"]
}

/// Build a filter directive string that sets the same `level` for all of our crates.
pub fn level_spec_for(level: &str) -> String {
    let lvl = level.to_ascii_lowercase();
    our_crates()
        .iter()
        .map(|t| format!("{t}={lvl}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Compute the final filter spec string with precedence:
/// - `log_filter`
/// - `trace`/`debug`/`log_level` (crate-scoped)
/// - `RUST_LOG` env
/// - default to crate-scoped `info`
pub fn compute_spec(
    trace: bool,
    debug: bool,
    log_level: Option<&str>,
    log_filter: Option<&str>,
) -> String {
    if let Some(spec) = log_filter {
        return spec.to_string();
    }
    if trace {
        return level_spec_for("trace");
    }
    if debug {
        return level_spec_for("debug");
    }
    if let Some(lvl) = log_level {
        return level_spec_for(lvl);
    }
    env::var("RUST_LOG").unwrap_or_else(|_| level_spec_for("info"))
}

/// Create an `EnvFilter` from a spec string.
pub fn env_filter_from_spec(spec: &str) -> EnvFilter {
    EnvFilter::new(spec)
}

/// Install a compact fmt subscriber filtered by `settings`.
///
/// Fails if a global subscriber is already installed.
pub fn try_init(settings: &LogSettings) -> Result<(), TryInitError> {
    registry()
        .with(env_filter_from_spec(&settings.spec()))
        .with(fmt::layer().without_time())
        .try_init()
}

/// Like [`try_init`], ignoring an already-installed subscriber.
pub fn init(settings: &LogSettings) {
    try_init(settings).ok();
}

/// Install a test-writer subscriber at `level` for our crates. Safe to call
/// from every test.
pub fn init_for_tests(level: &str) {
    registry()
        .with(env_filter_from_spec(&level_spec_for(level)))
        .with(fmt::layer().without_time().with_test_writer())
        .try_init()
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_spec_covers_our_crates() {
        assert_eq!(level_spec_for("DEBUG"), "focus_stream=debug,logging=debug");
    }

    #[test]
    fn explicit_filter_wins() {
        let spec = compute_spec(true, true, Some("warn"), Some("focus_stream::hub=trace"));
        assert_eq!(spec, "focus_stream::hub=trace");
        assert_eq!(compute_spec(true, false, Some("warn"), None), level_spec_for("trace"));
        assert_eq!(compute_spec(false, false, Some("warn"), None), level_spec_for("warn"));
    }

    #[test]
    fn settings_parse_from_ron() {
        let settings: LogSettings = ron::from_str("(debug: true)").expect("parse");
        assert!(settings.debug);
        assert_eq!(settings.spec(), level_spec_for("debug"));
    }

    #[test]
    fn repeated_init_is_harmless() {
        init_for_tests("trace");
        init_for_tests("trace");
        init(&LogSettings::default());
        assert!(try_init(&LogSettings::default()).is_err());
    }
}
