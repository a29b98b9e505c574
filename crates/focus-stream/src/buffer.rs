//! Filter/Buffer: deduplicates, batches and flushes segmented events.
//!
//! All mutable state lives in a single actor task. [`FocusBuffer`] is a cheap
//! handle that enqueues commands, so `add_event` never blocks and the flush
//! timer is a single deadline slot owned by the actor.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tracing::{debug, trace, warn};

use crate::{
    Error, Result,
    config::PipelineConfig,
    event::{EventType, FocusEvent},
    filter::{DropReason, FilterPipeline, MAX_TRACKED_APPS, Verdict},
};

/// Maximum queued events; the oldest are dropped beyond this.
pub const MAX_QUEUE_LEN: usize = 1000;

/// One flush worth of events, ordered by timestamp.
pub type AppBatch = Vec<FocusEvent>;

/// Diagnostics snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Events handed to `add_event`.
    pub total_received: u64,
    /// Events emitted in batches.
    pub total_sent: u64,
    /// Batches emitted.
    pub batches_sent: u64,
    /// Events dropped by anti-flood deduplication.
    pub duplicates_filtered: u64,
    /// Events dropped by predictability sampling.
    pub predictable_suppressed: u64,
    /// Events dropped by app scoping.
    pub out_of_scope: u64,
    /// Queued events discarded because the queue was full.
    pub overflow_dropped: u64,
    /// Accepted events per app name.
    pub per_app: BTreeMap<String, u64>,
    /// Time of the last non-empty flush.
    pub last_flush: Option<Instant>,
    /// Events currently queued.
    pub queue_len: usize,
}

impl BufferStats {
    /// Count an accepted event, evicting the least-counted app when full.
    fn count_app(&mut self, app: &str) {
        if let Some(n) = self.per_app.get_mut(app) {
            *n += 1;
            return;
        }
        if self.per_app.len() >= MAX_TRACKED_APPS {
            let least = self
                .per_app
                .iter()
                .min_by_key(|(_, n)| **n)
                .map(|(k, _)| k.clone());
            if let Some(key) = least {
                self.per_app.remove(&key);
            }
        }
        self.per_app.insert(app.to_string(), 1);
    }
}

/// Messages handled by the buffer actor.
enum Command {
    /// Filter and queue an event.
    Add(FocusEvent),
    /// Flush now, optionally signalling completion.
    Flush {
        /// Completion signal.
        respond: Option<oneshot::Sender<()>>,
    },
    /// Drop the queue and all filter state.
    Clear,
    /// Flush and stop.
    Dispose {
        /// Completion signal.
        respond: oneshot::Sender<()>,
    },
}

/// Handle to a running buffer actor.
pub struct FocusBuffer {
    /// Command channel to the actor.
    tx: mpsc::UnboundedSender<Command>,
    /// Stats shared with the actor.
    stats: Arc<Mutex<BufferStats>>,
    /// Set once disposal starts.
    disposed: AtomicBool,
    /// Actor task, taken on disposal.
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FocusBuffer {
    /// Spawn a buffer with the standard filter pipeline for `cfg`.
    ///
    /// Batches are delivered on the returned receiver. Must be called within a
    /// Tokio runtime.
    pub fn spawn(cfg: &PipelineConfig) -> (Self, mpsc::UnboundedReceiver<AppBatch>) {
        Self::with_filters(cfg, FilterPipeline::from_config(cfg))
    }

    /// Spawn a buffer with a custom filter pipeline.
    pub fn with_filters(
        cfg: &PipelineConfig,
        filters: FilterPipeline,
    ) -> (Self, mpsc::UnboundedReceiver<AppBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(Mutex::new(BufferStats::default()));
        let actor = Actor {
            batching: cfg.enable_batching,
            max_batch_size: cfg.max_batch_size.max(1),
            max_batch_wait: cfg.max_batch_wait(),
            filters,
            queue: VecDeque::new(),
            out: out_tx,
            stats: stats.clone(),
            last_flush: Instant::now(),
            deadline: None,
        };
        let task = tokio::spawn(actor.run(rx));
        let buffer = Self {
            tx,
            stats,
            disposed: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        };
        (buffer, out_rx)
    }

    /// Submit an event. Never blocks.
    pub fn add_event(&self, event: FocusEvent) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        self.tx
            .send(Command::Add(event))
            .map_err(|_| Error::Disposed)
    }

    /// Flush the queue and wait until the batch has been handed off.
    pub async fn flush(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush { respond: Some(tx) })
            .map_err(|_| Error::Disposed)?;
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    /// Ask for a flush without waiting. Ignored after disposal.
    pub fn request_flush(&self) {
        if !self.is_disposed() {
            let _ = self.tx.send(Command::Flush { respond: None });
        }
    }

    /// Drop queued events and reset all per-app filter state.
    pub fn clear(&self) {
        if !self.is_disposed() {
            let _ = self.tx.send(Command::Clear);
        }
    }

    /// Snapshot of the diagnostics counters.
    pub fn stats(&self) -> BufferStats {
        self.stats.lock().clone()
    }

    /// Whether `dispose` has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Flush remaining events, stop the actor and close the output. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Dispose { respond: tx }).is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        debug!("focus_buffer_disposed");
    }
}

/// Owner of the queue, filters and flush timer.
struct Actor {
    /// Queue and flush in batches; otherwise deliver each event alone.
    batching: bool,
    /// Queue length that forces a flush.
    max_batch_size: usize,
    /// Longest an event may wait.
    max_batch_wait: Duration,
    /// Filter pipeline.
    filters: FilterPipeline,
    /// Accepted, unflushed events.
    queue: VecDeque<FocusEvent>,
    /// Batch output.
    out: mpsc::UnboundedSender<AppBatch>,
    /// Shared diagnostics.
    stats: Arc<Mutex<BufferStats>>,
    /// Time of the last flush attempt.
    last_flush: Instant,
    /// Pending flush deadline; the single coalesced timer.
    deadline: Option<Instant>,
}

impl Actor {
    /// Process commands until disposal or until every handle is gone.
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = self.deadline;
            let timer = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => future::pending::<()>().await,
                }
            };
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Add(event)) => self.add(event),
                    Some(Command::Flush { respond }) => {
                        self.flush();
                        if let Some(respond) = respond {
                            let _ = respond.send(());
                        }
                    }
                    Some(Command::Clear) => self.clear(),
                    Some(Command::Dispose { respond }) => {
                        self.flush();
                        let _ = respond.send(());
                        break;
                    }
                    None => {
                        self.flush();
                        break;
                    }
                },
                () = timer => {
                    trace!("batch_timer_fired");
                    self.flush();
                }
            }
        }
    }

    /// Filter, queue and maybe flush one event.
    fn add(&mut self, event: FocusEvent) {
        self.stats.lock().total_received += 1;
        if let Verdict::Drop(reason) = self.filters.check(&event) {
            let mut stats = self.stats.lock();
            match reason {
                DropReason::Duplicate => stats.duplicates_filtered += 1,
                DropReason::Predictable => stats.predictable_suppressed += 1,
                DropReason::OutOfScope => stats.out_of_scope += 1,
            }
            return;
        }

        let significant = event.is_significant();
        {
            let mut stats = self.stats.lock();
            stats.count_app(&event.app_name);
            self.queue.push_back(event);
            if self.queue.len() > MAX_QUEUE_LEN {
                self.queue.pop_front();
                stats.overflow_dropped += 1;
            }
            stats.queue_len = self.queue.len();
        }

        let now = Instant::now();
        if !self.batching
            || significant
            || self.queue.len() >= self.max_batch_size
            || now.duration_since(self.last_flush) > self.max_batch_wait
        {
            self.flush();
        } else if self.deadline.is_none() {
            self.deadline = Some(now + self.max_batch_wait);
        }
    }

    /// Emit the queue as one collapsed batch.
    fn flush(&mut self) {
        self.deadline = None;
        self.last_flush = Instant::now();
        if self.queue.is_empty() {
            return;
        }
        let batch = collapse_batch(self.queue.drain(..).collect());
        {
            let mut stats = self.stats.lock();
            stats.total_sent += batch.len() as u64;
            stats.batches_sent += 1;
            stats.last_flush = Some(self.last_flush);
            stats.queue_len = 0;
        }
        debug!(len = batch.len(), "batch_flushed");
        if self.out.send(batch).is_err() {
            warn!("batch output closed; batch discarded");
        }
    }

    /// Drop the queue and filter state.
    fn clear(&mut self) {
        self.queue.clear();
        self.filters.clear();
        self.deadline = None;
        let mut stats = self.stats.lock();
        stats.queue_len = 0;
        stats.per_app.clear();
    }
}

/// Group by app, keep only the latest of each run of duration updates, and
/// order the result by timestamp.
///
/// Lossy: intermediate cumulative durations within one flush window are
/// superseded by the latest one.
pub fn collapse_batch(events: Vec<FocusEvent>) -> AppBatch {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Vec<FocusEvent>> = Vec::new();
    for event in events {
        let slot = *index.entry(event.app_name.clone()).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(event);
    }

    let mut batch = Vec::new();
    for mut group in groups {
        group.sort_by_key(|e| e.timestamp);
        let mut iter = group.into_iter().peekable();
        while let Some(event) = iter.next() {
            let superseded = event.event_type == EventType::DurationUpdate
                && iter
                    .peek()
                    .is_some_and(|next| next.event_type == EventType::DurationUpdate);
            if !superseded {
                batch.push(event);
            }
        }
    }
    batch.sort_by_key(|e| e.timestamp);
    batch
}
