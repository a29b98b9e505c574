//! Tracker: wires a capture source through the segmenter into a stream manager.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    Error, Result,
    buffer::AppBatch,
    config::PipelineConfig,
    event::{FocusEvent, RawTick, next_session_id},
    hub::Subscription,
    manager::{StreamManager, StreamStats},
    segment::Segmenter,
    source::CaptureSource,
};

/// Lifecycle state guarded by the tracker.
#[derive(Default)]
struct TrackerState {
    /// Current session, while running.
    session_id: Option<String>,
    /// Stops the pump.
    cancel: Option<CancellationToken>,
    /// Pump task; yields the segmenter when it ends.
    pump: Option<JoinHandle<Segmenter>>,
    /// Set once stopped; a tracker is not restartable.
    stopped: bool,
}

/// End-to-end focus tracking pipeline.
pub struct FocusTracker {
    /// Capture collaborator.
    source: Arc<dyn CaptureSource>,
    /// Pipeline configuration.
    cfg: PipelineConfig,
    /// Fan-out front end.
    manager: StreamManager,
    /// Lifecycle state.
    state: Mutex<TrackerState>,
}

impl FocusTracker {
    /// Build a tracker around `source`. Must be called within a Tokio runtime.
    pub fn new(source: Arc<dyn CaptureSource>, cfg: PipelineConfig) -> Result<Self> {
        let manager = StreamManager::new(&cfg)?;
        Ok(Self {
            source,
            cfg,
            manager,
            state: Mutex::new(TrackerState::default()),
        })
    }

    /// Start a session and return its id. Starting a running tracker returns
    /// the current session.
    pub async fn start(&self) -> Result<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = {
            let mut state = self.state.lock();
            if state.stopped {
                return Err(Error::Disposed);
            }
            if let Some(id) = &state.session_id {
                return Ok(id.clone());
            }
            let id = next_session_id();
            let mut segmenter = Segmenter::new(&self.cfg);
            segmenter.set_session(Some(id.clone()));
            let cancel = CancellationToken::new();
            state.pump = Some(tokio::spawn(run_pump(
                segmenter,
                rx,
                self.manager.clone(),
                cancel.clone(),
            )));
            state.cancel = Some(cancel);
            state.session_id = Some(id.clone());
            id
        };

        if let Err(e) = self.source.start(tx).await {
            warn!(error = %e, "capture_source_start_failed");
            let (cancel, pump) = {
                let mut state = self.state.lock();
                state.session_id = None;
                (state.cancel.take(), state.pump.take())
            };
            if let Some(cancel) = cancel {
                cancel.cancel();
            }
            if let Some(pump) = pump {
                let _ = pump.await;
            }
            return Err(e);
        }
        info!(session = %session_id, "focus_tracking_started");
        Ok(session_id)
    }

    /// Stop the source, process queued ticks, close the session and dispose
    /// the manager. Idempotent.
    pub async fn stop(&self) {
        let (cancel, pump) = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            (state.cancel.take(), state.pump.take())
        };

        self.source.stop().await;
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(pump) = pump {
            match pump.await {
                Ok(mut segmenter) => {
                    if let Some(lost) = segmenter.finish()
                        && let Err(e) = self.manager.add_event(lost)
                    {
                        warn!(error = %e, "final_lost_dropped");
                    }
                }
                Err(e) => warn!(error = %e, "tracker_pump_failed"),
            }
        }
        self.manager.dispose().await;
        let session = self.state.lock().session_id.take();
        info!(session = ?session, "focus_tracking_stopped");
    }

    /// Current session id, while running.
    pub fn session_id(&self) -> Option<String> {
        self.state.lock().session_id.clone()
    }

    /// Whether a session is running.
    pub fn is_running(&self) -> bool {
        let state = self.state.lock();
        state.session_id.is_some() && !state.stopped
    }

    /// The underlying stream manager.
    pub fn manager(&self) -> &StreamManager {
        &self.manager
    }

    /// Subscribe to every event.
    pub fn subscribe(&self) -> Subscription<FocusEvent> {
        self.manager.subscribe()
    }

    /// Subscribe to whole batches.
    pub fn subscribe_batches(&self) -> Subscription<AppBatch> {
        self.manager.subscribe_batches()
    }

    /// Subscribe to one app's events.
    pub fn subscribe_app(&self, app: &str) -> Result<Subscription<FocusEvent>> {
        self.manager.subscribe_app(app)
    }

    /// Flush everything processed so far.
    pub async fn flush(&self) -> Result<()> {
        self.manager.flush().await
    }

    /// Diagnostics snapshot.
    pub fn stats(&self) -> StreamStats {
        self.manager.stats()
    }
}

/// Feed ticks through the segmenter into the manager until cancelled or the
/// source drops its sink; queued ticks are processed before returning.
async fn run_pump(
    mut segmenter: Segmenter,
    mut rx: mpsc::UnboundedReceiver<RawTick>,
    manager: StreamManager,
    cancel: CancellationToken,
) -> Segmenter {
    loop {
        tokio::select! {
            biased;
            tick = rx.recv() => match tick {
                Some(tick) => handle_tick(&mut segmenter, &manager, tick),
                None => break,
            },
            _ = cancel.cancelled() => {
                while let Ok(tick) = rx.try_recv() {
                    handle_tick(&mut segmenter, &manager, tick);
                }
                break;
            }
        }
    }
    debug!("tracker_pump_stopped");
    segmenter
}

/// Segment one tick and submit the result. Malformed ticks are dropped.
fn handle_tick(segmenter: &mut Segmenter, manager: &StreamManager, tick: RawTick) {
    match segmenter.process(tick) {
        Ok(events) => {
            if let Err(e) = manager.add_events(events) {
                debug!(error = %e, "events_rejected");
            }
        }
        Err(e) => warn!(error = %e, "malformed_tick_dropped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::{EventType, TickKind},
        source::ChannelSource,
    };

    fn no_batching() -> PipelineConfig {
        PipelineConfig {
            enable_batching: false,
            ..PipelineConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_and_stop_is_final() {
        let src = Arc::new(ChannelSource::new());
        let tracker = FocusTracker::new(src.clone(), no_batching()).unwrap();
        let a = tracker.start().await.unwrap();
        let b = tracker.start().await.unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("session_"));
        assert!(tracker.is_running());

        tracker.stop().await;
        tracker.stop().await;
        assert!(!tracker.is_running());
        assert!(!src.is_active());
        assert!(matches!(tracker.start().await, Err(Error::Disposed)));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_ticks_are_dropped() {
        let src = Arc::new(ChannelSource::new());
        let tracker = FocusTracker::new(src.clone(), no_batching()).unwrap();
        let mut events = tracker.subscribe();
        let session = tracker.start().await.unwrap();
        src.push(RawTick::new("", TickKind::Gained, 0, 0)).unwrap();
        src.push(RawTick::new("Editor", TickKind::Gained, 0, 0)).unwrap();
        tracker.stop().await;

        let first = events.recv_item().await.unwrap();
        assert_eq!(first.app_name, "Editor");
        assert_eq!(first.session_id.as_deref(), Some(session.as_str()));
        // The open session is closed on stop.
        let last = events.recv_item().await.unwrap();
        assert_eq!(last.event_type, EventType::Lost);
        assert!(events.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_source_start_is_reported() {
        let src = Arc::new(ChannelSource::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        src.start(tx).await.unwrap();
        let tracker = FocusTracker::new(src, no_batching()).unwrap();
        assert!(matches!(tracker.start().await, Err(Error::Source(_))));
        assert!(tracker.session_id().is_none());
    }
}
