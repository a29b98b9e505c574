//! focus-stream: focus event processing pipeline
//!
//! Raw focus ticks from a capture source are turned into a clean, batched
//! stream of per-application focus events:
//! - [`Segmenter`]: splits ticks into window/tab segments and coalesces
//!   browser tab switches
//! - [`FocusBuffer`]: filters, queues and batches events on its own task
//! - [`StreamManager`]: fans batches out to global, batch and per-app
//!   subscribers, with health checks, channel cleanup and retry
//! - [`FocusTracker`]: wires a [`CaptureSource`] through the whole pipeline
//!
//! All long-lived components are Tokio actors and must be created inside a
//! runtime.

mod buffer;
mod config;
mod debounce;
/// Error type and result alias.
mod error;
mod event;
pub mod filter;
mod hub;
mod manager;
mod segment;
mod source;
pub mod tab;
mod ticker;
mod tracker;

pub mod test_support;

pub use buffer::{AppBatch, BufferStats, FocusBuffer, MAX_QUEUE_LEN, collapse_batch};
pub use config::{HighThroughputConfig, PREDICTABLE_RETAIN_EVERY, PipelineConfig, StreamConfig};
pub use debounce::Debouncer;
pub use error::{Error, Result};
pub use event::{
    BrowserTabInfo, EventType, FocusEvent, FocusMetadata, RawTick, SIGNIFICANT_DURATION_US,
    TabSwitch, TickKind, now_micros, sanitize_title,
};
pub use hub::{DEFAULT_CHANNEL_CAPACITY, Delivery, Hub, StreamError, Subscription};
pub use manager::{StreamManager, StreamStats};
pub use segment::Segmenter;
pub use source::{CaptureSource, ChannelSource, TickSink};
pub use ticker::Ticker;
pub use tracker::FocusTracker;
