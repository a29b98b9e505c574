//! Named periodic tasks with cancellation.
//!
//! Each ticker runs a closure after an initial delay and then on every
//! interval until it is stopped. The stream manager uses these for its health
//! and cleanup passes and awaits them before releasing resources.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Longest wait for a cancelled ticker task to finish.
pub const STOP_WAIT_TIMEOUT_MS: u64 = 100;

/// A running ticker.
struct TickerEntry {
    /// Cancels the task.
    token: CancellationToken,
    /// The task itself.
    handle: JoinHandle<()>,
}

/// Set of named periodic tasks.
#[derive(Clone, Default)]
pub struct Ticker {
    /// Running tickers by id.
    entries: Arc<Mutex<HashMap<String, TickerEntry>>>,
}

impl Ticker {
    /// Create an empty ticker set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a ticker is running for `id`.
    pub fn is_active(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    /// Number of running tickers.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no ticker is running.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Start or replace the ticker for `id`.
    pub fn start<F>(&self, id: &str, initial: Duration, interval: Duration, mut on_tick: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.stop(id);

        let token = CancellationToken::new();
        let cancel = token.clone();
        let id_for_log = id.to_string();

        let fut = async move {
            trace!(
                ticker = %id_for_log,
                init_ms = initial.as_millis(),
                int_ms = interval.as_millis(),
                "ticker_start"
            );

            tokio::select! {
                _ = time::sleep(initial) => {}
                _ = cancel.cancelled() => {
                    trace!(ticker = %id_for_log, "ticker_cancelled_initial");
                    return;
                }
            }

            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        trace!(ticker = %id_for_log, "ticker_cancelled");
                        return;
                    }
                    _ = ticker.tick() => on_tick(),
                }
            }
        };

        let handle = tokio::spawn(fut);
        self.entries
            .lock()
            .insert(id.to_string(), TickerEntry { token, handle });
    }

    /// Cancel the ticker for `id` without waiting.
    pub fn stop(&self, id: &str) {
        if let Some(entry) = self.entries.lock().remove(id) {
            entry.token.cancel();
            trace!(ticker = %id, "ticker_stop");
        }
    }

    /// Cancel every ticker and wait for the tasks to finish.
    pub async fn clear_async(&self) {
        let entries: Vec<TickerEntry> = {
            let mut map = self.entries.lock();
            map.drain().map(|(_, e)| e).collect()
        };

        for e in &entries {
            e.token.cancel();
        }

        for e in entries {
            let _ = time::timeout(Duration::from_millis(STOP_WAIT_TIMEOUT_MS), e.handle).await;
        }
        trace!("ticker_clear_async");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_after_initial_delay_then_on_interval() {
        let ticker = Ticker::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        ticker.start(
            "health",
            Duration::from_millis(100),
            Duration::from_millis(100),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        time::sleep(Duration::from_millis(260)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(ticker.is_active("health"));

        ticker.clear_async().await;
        assert!(ticker.is_empty());
        let seen = count.load(Ordering::SeqCst);
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn start_replaces_existing() {
        let ticker = Ticker::new();
        ticker.start("cleanup", Duration::ZERO, Duration::from_secs(1), || {});
        ticker.start("cleanup", Duration::ZERO, Duration::from_secs(1), || {});
        assert_eq!(ticker.len(), 1);
        ticker.stop("cleanup");
        assert!(!ticker.is_active("cleanup"));
    }
}
