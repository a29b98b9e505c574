//! Capture collaborator boundary.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::{
    Error, Result,
    event::{FocusMetadata, RawTick, TickKind, now_micros},
    tab,
};

/// Where a capture source delivers ticks.
pub type TickSink = UnboundedSender<RawTick>;

/// Something that observes application focus and reports raw ticks.
///
/// Implementations deliver ticks from any thread into the sink given to
/// [`CaptureSource::start`] and must release the sink on [`CaptureSource::stop`].
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Begin capturing into `sink`.
    async fn start(&self, sink: TickSink) -> Result<()>;

    /// Stop capturing and drop the sink. Must be idempotent.
    async fn stop(&self);
}

/// A capture source driven by the host program.
///
/// Ticks pushed while the source is stopped are rejected.
#[derive(Debug, Default)]
pub struct ChannelSource {
    /// Active sink, while started.
    sink: Mutex<Option<TickSink>>,
}

impl ChannelSource {
    /// Create a stopped source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the source is started.
    pub fn is_active(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// Deliver a tick.
    pub fn push(&self, tick: RawTick) -> Result<()> {
        let sink = self.sink.lock();
        let Some(tx) = sink.as_ref() else {
            return Err(Error::Source("capture source is not started".into()));
        };
        tx.send(tick).map_err(|_| Error::ChannelClosed)
    }

    /// Deliver a tick for a focused window, deriving browser and tab metadata
    /// from the process name, executable path and window title.
    pub fn push_window(
        &self,
        kind: TickKind,
        process_name: &str,
        executable_path: &str,
        window_title: &str,
        duration_us: u64,
    ) -> Result<()> {
        let metadata: FocusMetadata =
            tab::metadata_for_window(process_name, executable_path, window_title);
        let tick = RawTick::new(process_name, kind, now_micros(), duration_us)
            .with_identifier(executable_path)
            .with_metadata(metadata);
        self.push(tick)
    }
}

#[async_trait]
impl CaptureSource for ChannelSource {
    async fn start(&self, sink: TickSink) -> Result<()> {
        let mut slot = self.sink.lock();
        if slot.is_some() {
            return Err(Error::Source("capture source already started".into()));
        }
        *slot = Some(sink);
        debug!("channel_source_started");
        Ok(())
    }

    async fn stop(&self) {
        if self.sink.lock().take().is_some() {
            debug!("channel_source_stopped");
        }
    }
}
