//! Stream manager: owns the buffer and fans batches out to subscribers.
//!
//! Every flushed batch is published verbatim on the batch channel, then event
//! by event on the primary channel and on the matching per-app channel. Per-app
//! channels are created on first subscription and removed only by the cleanup
//! pass once nobody listens. Delivery problems are reported in-band on every
//! open channel and trigger a delayed flush retry; they never surface as
//! errors from the public methods.

use std::{
    collections::BTreeMap,
    mem,
    pin::pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tokio::{
    sync::{Notify, mpsc},
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, trace, warn};

use crate::{
    Error, Result,
    buffer::{AppBatch, BufferStats, FocusBuffer},
    config::{PipelineConfig, StreamConfig},
    debounce::Debouncer,
    event::FocusEvent,
    hub::{Hub, StreamError, Subscription},
    ticker::Ticker,
};

/// Ticker id of the health pass.
const HEALTH_TICKER: &str = "health";
/// Ticker id of the cleanup pass.
const CLEANUP_TICKER: &str = "cleanup";

/// Diagnostics for the manager and its buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Buffer counters.
    pub buffer: BufferStats,
    /// Open per-app channels.
    pub app_channels: usize,
    /// Live subscriptions on the primary channel.
    pub subscribers: usize,
    /// Live subscriptions on the batch channel.
    pub batch_subscribers: usize,
    /// Batches published to consumers.
    pub batches_published: u64,
    /// Errors reported to consumers.
    pub error_count: u64,
    /// Forced flushes scheduled after delivery errors.
    pub retries: u64,
}

/// Shared manager state.
struct Inner {
    /// Fan-out settings.
    cfg: StreamConfig,
    /// The filter/buffer.
    buffer: Arc<FocusBuffer>,
    /// Debounce stage, in high-throughput mode.
    debouncer: Option<Debouncer>,
    /// Per-event channel.
    primary: Hub<FocusEvent>,
    /// Per-batch channel.
    batches: Hub<AppBatch>,
    /// Per-app channels by app name.
    apps: Mutex<BTreeMap<String, Arc<Hub<FocusEvent>>>>,
    /// Health and cleanup passes.
    tickers: Ticker,
    /// Task moving batches from the buffer to the hubs.
    pump: Mutex<Option<JoinHandle<()>>>,
    /// Signalled after each published batch and when the pump ends.
    pumped: Notify,
    /// Batches published so far.
    batches_published: AtomicU64,
    /// Set when the pump has stopped.
    pump_done: AtomicBool,
    /// Time the last event was submitted.
    last_event: Mutex<Instant>,
    /// A retry flush is scheduled.
    retry_pending: AtomicBool,
    /// Errors reported so far.
    error_count: AtomicU64,
    /// Retries scheduled so far.
    retries: AtomicU64,
    /// Set once disposal starts.
    disposed: AtomicBool,
}

impl Inner {
    /// Fan a batch out to all channels.
    fn publish_batch(self: &Arc<Self>, batch: AppBatch) {
        trace!(len = batch.len(), "publish_batch");
        let mut failure = self.batches.publish(batch.clone()).err();
        for event in batch {
            let app = self.apps.lock().get(&event.app_name).cloned();
            if let Some(hub) = app {
                match hub.publish(event.clone()) {
                    // Closed by cleanup after the lookup; nobody was listening.
                    Ok(()) | Err(Error::ChannelClosed) => {}
                    Err(e) => {
                        failure.get_or_insert(e);
                    }
                }
            }
            if let Err(e) = self.primary.publish(event) {
                failure.get_or_insert(e);
            }
        }
        self.batches_published.fetch_add(1, Ordering::AcqRel);
        self.pumped.notify_waiters();
        if let Some(err) = failure {
            self.report_error(&err);
        }
    }

    /// Broadcast `err` on every open channel and schedule a retry for delivery errors.
    fn report_error(self: &Arc<Self>, err: &Error) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        warn!(error = %err, "stream_delivery_error");
        let signal = StreamError::from(err);
        self.primary.publish_error(signal.clone());
        self.batches.publish_error(signal.clone());
        let apps: Vec<Arc<Hub<FocusEvent>>> = self.apps.lock().values().cloned().collect();
        for hub in apps {
            hub.publish_error(signal.clone());
        }
        if err.is_delivery() {
            self.schedule_retry();
        }
    }

    /// Force a flush after the retry delay. At most one retry is pending.
    fn schedule_retry(self: &Arc<Self>) {
        if self.is_disposed() || self.retry_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        self.retries.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(self);
        let delay = self.cfg.retry_delay();
        tokio::spawn(async move {
            time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.retry_pending.store(false, Ordering::Release);
                debug!("stream_retry_flush");
                inner.buffer.request_flush();
            }
        });
    }

    /// Flush if nothing was submitted for longer than the stale threshold.
    fn run_health_check(&self) -> bool {
        let idle = self.last_event.lock().elapsed();
        if idle <= self.cfg.stale_threshold() {
            return false;
        }
        debug!(idle_ms = idle.as_millis(), "stale_pipeline_flush");
        self.buffer.request_flush();
        true
    }

    /// Remove per-app channels without live subscribers.
    fn run_cleanup(&self) -> usize {
        let mut apps = self.apps.lock();
        let before = apps.len();
        apps.retain(|app, hub| {
            let live = hub.subscriber_count() > 0;
            if !live {
                trace!(app = %app, "app_channel_removed");
                hub.close();
            }
            live
        });
        before - apps.len()
    }

    /// Wait until the pump has published every batch the buffer emitted.
    async fn wait_pumped(&self) {
        loop {
            let mut notified = pin!(self.pumped.notified());
            notified.as_mut().enable();
            let sent = self.buffer.stats().batches_sent;
            if self.batches_published.load(Ordering::Acquire) >= sent
                || self.pump_done.load(Ordering::Acquire)
            {
                return;
            }
            notified.await;
        }
    }

    /// Whether disposal has started.
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.tickers.stop(HEALTH_TICKER);
        self.tickers.stop(CLEANUP_TICKER);
    }
}

/// Move batches from the buffer output to the hubs until the output closes.
async fn run_pump(weak: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<AppBatch>) {
    while let Some(batch) = rx.recv().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        inner.publish_batch(batch);
    }
    if let Some(inner) = weak.upgrade() {
        if !inner.is_disposed() {
            inner.report_error(&Error::ChannelClosed);
        }
        inner.pump_done.store(true, Ordering::Release);
        inner.pumped.notify_waiters();
    }
}

/// Multi-subscriber front end of the pipeline. Clones share one pipeline.
#[derive(Clone)]
pub struct StreamManager {
    /// Shared state.
    inner: Arc<Inner>,
}

impl StreamManager {
    /// Build a manager and start its buffer, pump and periodic passes.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(cfg: &PipelineConfig) -> Result<Self> {
        cfg.validate()?;
        let (buffer, rx) = FocusBuffer::spawn(cfg);
        let buffer = Arc::new(buffer);
        let debouncer = cfg.stream.high_throughput.map(|ht| {
            let sink = buffer.clone();
            Debouncer::spawn(ht.debounce(), move |event| {
                if let Err(e) = sink.add_event(event) {
                    trace!(error = %e, "debounced_event_rejected");
                }
            })
        });
        let capacity = cfg.stream.channel_capacity;
        let inner = Arc::new(Inner {
            cfg: cfg.stream.clone(),
            buffer,
            debouncer,
            primary: Hub::new(capacity),
            batches: Hub::new(capacity),
            apps: Mutex::new(BTreeMap::new()),
            tickers: Ticker::new(),
            pump: Mutex::new(None),
            pumped: Notify::new(),
            batches_published: AtomicU64::new(0),
            pump_done: AtomicBool::new(false),
            last_event: Mutex::new(Instant::now()),
            retry_pending: AtomicBool::new(false),
            error_count: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        });

        let pump = tokio::spawn(run_pump(Arc::downgrade(&inner), rx));
        *inner.pump.lock() = Some(pump);

        let health = inner.cfg.health_check_interval();
        let weak = Arc::downgrade(&inner);
        inner.tickers.start(HEALTH_TICKER, health, health, move || {
            if let Some(inner) = weak.upgrade() {
                inner.run_health_check();
            }
        });
        let cleanup = inner.cfg.cleanup_interval();
        let weak = Arc::downgrade(&inner);
        inner.tickers.start(CLEANUP_TICKER, cleanup, cleanup, move || {
            if let Some(inner) = weak.upgrade() {
                inner.run_cleanup();
            }
        });

        debug!(
            high_throughput = inner.debouncer.is_some(),
            capacity, "stream_manager_started"
        );
        Ok(Self { inner })
    }

    /// Submit an event.
    pub fn add_event(&self, event: FocusEvent) -> Result<()> {
        if self.inner.is_disposed() {
            return Err(Error::Disposed);
        }
        *self.inner.last_event.lock() = Instant::now();
        match &self.inner.debouncer {
            Some(debouncer) => {
                if debouncer.push(event) {
                    Ok(())
                } else {
                    Err(Error::Disposed)
                }
            }
            None => self.inner.buffer.add_event(event),
        }
    }

    /// Submit several events in order.
    pub fn add_events(&self, events: impl IntoIterator<Item = FocusEvent>) -> Result<()> {
        events.into_iter().try_for_each(|e| self.add_event(e))
    }

    /// Subscribe to every event.
    pub fn subscribe(&self) -> Subscription<FocusEvent> {
        self.inner.primary.subscribe()
    }

    /// Subscribe to whole batches.
    pub fn subscribe_batches(&self) -> Subscription<AppBatch> {
        self.inner.batches.subscribe()
    }

    /// Subscribe to events of one app, creating its channel if needed.
    ///
    /// In high-throughput mode this fails with [`Error::Capacity`] when the
    /// channel cap is reached and `app` has no channel yet.
    pub fn subscribe_app(&self, app: &str) -> Result<Subscription<FocusEvent>> {
        if self.inner.is_disposed() {
            return Err(Error::Disposed);
        }
        let mut apps = self.inner.apps.lock();
        if let Some(hub) = apps.get(app) {
            return Ok(hub.subscribe());
        }
        if let Some(ht) = self.inner.cfg.high_throughput
            && apps.len() >= ht.max_app_channels
        {
            warn!(app = %app, limit = ht.max_app_channels, "app_channel_cap");
            return Err(Error::Capacity {
                limit: ht.max_app_channels,
            });
        }
        let hub = Arc::new(Hub::new(self.inner.cfg.channel_capacity));
        let sub = hub.subscribe();
        apps.insert(app.to_string(), hub);
        trace!(app = %app, "app_channel_created");
        Ok(sub)
    }

    /// Flush everything submitted so far and wait until it has been published.
    pub async fn flush(&self) -> Result<()> {
        if self.inner.is_disposed() {
            return Err(Error::Disposed);
        }
        if let Some(debouncer) = &self.inner.debouncer {
            debouncer.drain().await;
        }
        self.inner.buffer.flush().await?;
        self.inner.wait_pumped().await;
        Ok(())
    }

    /// Run the health pass now. Returns true if it forced a flush.
    pub fn run_health_check(&self) -> bool {
        self.inner.run_health_check()
    }

    /// Run the cleanup pass now. Returns the number of channels removed.
    pub fn run_cleanup(&self) -> usize {
        self.inner.run_cleanup()
    }

    /// Diagnostics snapshot.
    pub fn stats(&self) -> StreamStats {
        StreamStats {
            buffer: self.inner.buffer.stats(),
            app_channels: self.inner.apps.lock().len(),
            subscribers: self.inner.primary.subscriber_count(),
            batch_subscribers: self.inner.batches.subscriber_count(),
            batches_published: self.inner.batches_published.load(Ordering::Acquire),
            error_count: self.inner.error_count.load(Ordering::Relaxed),
            retries: self.inner.retries.load(Ordering::Relaxed),
        }
    }

    /// Whether `dispose` has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Stop intake, flush and publish everything accepted, then close all
    /// channels: per-app channels by name, then primary, then batch. Idempotent.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.tickers.clear_async().await;
        if let Some(debouncer) = &inner.debouncer {
            debouncer.shutdown().await;
        }
        inner.buffer.dispose().await;
        let pump = inner.pump.lock().take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }
        let apps = mem::take(&mut *inner.apps.lock());
        for (app, hub) in apps {
            trace!(app = %app, "app_channel_closed");
            hub.close();
        }
        inner.primary.close();
        inner.batches.close();
        debug!("stream_manager_disposed");
    }
}
