use std::result::Result as StdResult;

use ron::error::SpannedError;
use thiserror::Error;

/// Convenient result type for the focus-stream crate.
pub type Result<T> = StdResult<T, Error>;

/// Unified error type for the focus pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// A raw tick was missing required fields and was rejected.
    #[error("Malformed tick: {0}")]
    MalformedTick(String),

    /// Publishing to a consumer channel failed or lost items.
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// An internal channel was closed by its receiver.
    #[error("Channel closed")]
    ChannelClosed,

    /// The per-app channel cap was reached; no channel was created.
    #[error("Per-app channel capacity exceeded (limit {limit})")]
    Capacity {
        /// Maximum number of concurrently open per-app channels.
        limit: usize,
    },

    /// The component has been disposed and accepts no further work.
    #[error("Pipeline disposed")]
    Disposed,

    /// Configuration failed validation.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Configuration text could not be parsed.
    #[error("Config parse error: {0}")]
    Ron(#[from] SpannedError),

    /// The capture collaborator failed.
    #[error("Capture source error: {0}")]
    Source(String),
}

impl Error {
    /// True for transport/delivery failures, which trigger a flush retry
    /// instead of propagating to callers.
    pub fn is_delivery(&self) -> bool {
        matches!(self, Self::Delivery(_) | Self::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_classification() {
        assert!(Error::Delivery("overflow".into()).is_delivery());
        assert!(Error::ChannelClosed.is_delivery());
        assert!(!Error::Capacity { limit: 4 }.is_delivery());
        assert!(!Error::MalformedTick("no app".into()).is_delivery());
        assert!(!Error::Disposed.is_delivery());
    }

    #[test]
    fn capacity_message_names_limit() {
        let msg = Error::Capacity { limit: 3 }.to_string();
        assert!(msg.contains("limit 3"), "{msg}");
    }
}
