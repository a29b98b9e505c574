//! Per-app debounce stage for the high-throughput manager.
//!
//! Within a window, only the latest `durationUpdate` per app is passed on.
//! Any other event first releases its app's pending update, so per-app order
//! is preserved.

use std::{collections::HashMap, future, time::Duration};

use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tracing::trace;

use crate::event::{EventType, FocusEvent};

/// Messages handled by the debounce actor.
enum Command {
    /// Debounce an event.
    Event(FocusEvent),
    /// Release everything pending.
    Drain {
        /// Completion signal.
        respond: oneshot::Sender<()>,
    },
}

/// Handle to a running debounce actor.
pub struct Debouncer {
    /// Command channel; dropped on shutdown.
    tx: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    /// Actor task.
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    /// Spawn a debouncer that hands released events to `sink`.
    pub fn spawn<F>(window: Duration, sink: F) -> Self
    where
        F: FnMut(FocusEvent) + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Actor {
            window,
            sink,
            pending: HashMap::new(),
        };
        Self {
            tx: Mutex::new(Some(tx)),
            task: Mutex::new(Some(tokio::spawn(actor.run(rx)))),
        }
    }

    /// Submit an event. Returns false once shut down.
    pub fn push(&self, event: FocusEvent) -> bool {
        self.tx
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(Command::Event(event)).is_ok())
    }

    /// Release all pending events and wait until they reached the sink.
    pub async fn drain(&self) {
        let (respond, done) = oneshot::channel();
        let sent = self
            .tx
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(Command::Drain { respond }).is_ok());
        if sent {
            let _ = done.await;
        }
    }

    /// Release pending events and stop the actor. Idempotent.
    pub async fn shutdown(&self) {
        drop(self.tx.lock().take());
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// A held duration update.
struct Pending {
    /// Latest update seen in the window.
    event: FocusEvent,
    /// When the window closes.
    release_at: Instant,
}

/// Owner of the pending updates.
struct Actor<F> {
    /// Debounce window.
    window: Duration,
    /// Receives released events.
    sink: F,
    /// Held update per app.
    pending: HashMap<String, Pending>,
}

impl<F> Actor<F>
where
    F: FnMut(FocusEvent) + Send + 'static,
{
    /// Process commands until every sender is gone, then release the rest.
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let next = self.pending.values().map(|p| p.release_at).min();
            let timer = async move {
                match next {
                    Some(at) => sleep_until(at).await,
                    None => future::pending::<()>().await,
                }
            };
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Event(event)) => self.accept(event),
                    Some(Command::Drain { respond }) => {
                        self.release(None);
                        let _ = respond.send(());
                    }
                    None => {
                        self.release(None);
                        break;
                    }
                },
                () = timer => self.release(Some(Instant::now())),
            }
        }
    }

    /// Hold duration updates; pass everything else after its app's held update.
    fn accept(&mut self, event: FocusEvent) {
        if event.event_type == EventType::DurationUpdate {
            let window = self.window;
            match self.pending.get_mut(&event.app_name) {
                Some(held) => {
                    trace!(app = %event.app_name, "debounce_replace");
                    held.event = event;
                }
                None => {
                    self.pending.insert(
                        event.app_name.clone(),
                        Pending {
                            event,
                            release_at: Instant::now() + window,
                        },
                    );
                }
            }
            return;
        }
        if let Some(held) = self.pending.remove(&event.app_name) {
            (self.sink)(held.event);
        }
        (self.sink)(event);
    }

    /// Release held updates due by `now`, or all of them, in timestamp order.
    fn release(&mut self, now: Option<Instant>) {
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now.is_none_or(|now| p.release_at <= now))
            .map(|(k, _)| k.clone())
            .collect();
        let mut events: Vec<FocusEvent> = due
            .iter()
            .filter_map(|k| self.pending.remove(k))
            .map(|p| p.event)
            .collect();
        events.sort_by_key(|e| e.timestamp);
        for event in events {
            (self.sink)(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::time::sleep;

    use super::*;

    fn collector() -> (Arc<Mutex<Vec<FocusEvent>>>, impl FnMut(FocusEvent) + Send + 'static) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink_out = out.clone();
        (out, move |ev| sink_out.lock().push(ev))
    }

    fn update(app: &str, ts_ms: u64) -> FocusEvent {
        FocusEvent::new(app, EventType::DurationUpdate, ts_ms * 1000, ts_ms * 1000)
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_last_update_per_window() {
        let (out, sink) = collector();
        let d = Debouncer::spawn(Duration::from_millis(50), sink);
        for ts in [1, 2, 3] {
            assert!(d.push(update("A", ts)));
        }
        d.push(update("B", 4));
        sleep(Duration::from_millis(60)).await;
        let got: Vec<(String, u64)> = out
            .lock()
            .iter()
            .map(|e| (e.app_name.clone(), e.timestamp / 1000))
            .collect();
        assert_eq!(got, vec![("A".to_string(), 3), ("B".to_string(), 4)]);
    }

    #[tokio::test(start_paused = true)]
    async fn other_events_release_held_update_first() {
        let (out, sink) = collector();
        let d = Debouncer::spawn(Duration::from_millis(50), sink);
        d.push(update("A", 1));
        d.push(FocusEvent::new("A", EventType::Lost, 2000, 2000));
        d.drain().await;
        let types: Vec<EventType> = out.lock().iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![EventType::DurationUpdate, EventType::Lost]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_pending() {
        let (out, sink) = collector();
        let d = Debouncer::spawn(Duration::from_secs(10), sink);
        d.push(update("A", 1));
        d.shutdown().await;
        d.shutdown().await;
        assert_eq!(out.lock().len(), 1);
        assert!(!d.push(update("A", 2)));
    }
}
