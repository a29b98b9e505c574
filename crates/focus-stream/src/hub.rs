//! Fan-out hub with a bounded ring per subscriber.
//!
//! Publishing never blocks: when a subscriber falls behind, its oldest item is
//! discarded and the publish reports a delivery error so the owner can react.
//! Closing a hub lets subscribers drain what is buffered before they see the
//! end of the stream.

use std::{
    collections::VecDeque,
    fmt, mem,
    pin::pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tokio::{
    sync::Notify,
    time::{Instant, timeout_at},
};

use crate::{Error, Result};

/// Default per-subscriber ring capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Error signal delivered in-band to subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamError {
    /// Human-readable description.
    pub message: String,
    /// Whether the pipeline will retry on its own.
    pub retrying: bool,
}

impl From<&Error> for StreamError {
    fn from(err: &Error) -> Self {
        Self {
            message: err.to_string(),
            retrying: err.is_delivery(),
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// What a subscription yields.
#[derive(Clone, Debug, PartialEq)]
pub enum Delivery<T> {
    /// A published item.
    Item(T),
    /// An error signal.
    Error(StreamError),
}

impl<T> Delivery<T> {
    /// The item, if this is one.
    pub fn item(self) -> Option<T> {
        match self {
            Self::Item(item) => Some(item),
            Self::Error(_) => None,
        }
    }
}

/// Bounded FIFO for one subscriber.
struct Ring<T> {
    /// Buffered deliveries, oldest first.
    items: VecDeque<Delivery<T>>,
    /// Items discarded on overflow.
    lost_count: u64,
    /// Maximum buffered deliveries.
    capacity: usize,
}

impl<T> Ring<T> {
    /// Append, evicting the oldest entry when full. Returns true on eviction.
    fn push(&mut self, delivery: Delivery<T>) -> bool {
        let evicted = self.items.len() == self.capacity;
        if evicted {
            self.items.pop_front();
            self.lost_count = self.lost_count.saturating_add(1);
        }
        self.items.push_back(delivery);
        evicted
    }
}

/// State shared between the hub and one subscription.
struct StreamInner<T> {
    /// Buffered deliveries.
    ring: Mutex<Ring<T>>,
    /// Wakes a waiting receiver.
    notify: Notify,
    /// No further pushes will arrive.
    closed: AtomicBool,
}

impl<T: Clone> StreamInner<T> {
    /// Create an empty stream.
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            ring: Mutex::new(Ring {
                items: VecDeque::new(),
                lost_count: 0,
                capacity,
            }),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Buffer a delivery. Returns true if an older one was discarded.
    fn push(&self, delivery: Delivery<T>) -> bool {
        if self.is_closed() {
            return false;
        }
        let evicted = self.ring.lock().push(delivery);
        self.notify.notify_waiters();
        evicted
    }

    /// Pop the oldest delivery.
    fn try_next(&self) -> Option<Delivery<T>> {
        self.ring.lock().items.pop_front()
    }

    /// Mark closed and wake the receiver. Buffered items stay readable.
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.notify.notify_waiters();
    }

    /// Whether the stream was closed.
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Receiving side of a hub subscription. Dropping it unsubscribes.
pub struct Subscription<T> {
    /// Shared stream state.
    stream: Arc<StreamInner<T>>,
}

impl<T: Clone> Subscription<T> {
    /// Next delivery without waiting.
    pub fn try_recv(&mut self) -> Option<Delivery<T>> {
        self.stream.try_next()
    }

    /// Await the next delivery; `None` once the hub is closed and drained.
    pub async fn recv(&mut self) -> Option<Delivery<T>> {
        loop {
            let mut notified = pin!(self.stream.notify.notified());
            notified.as_mut().enable();
            if let Some(delivery) = self.stream.try_next() {
                return Some(delivery);
            }
            if self.stream.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Await the next delivery until `deadline`; `None` on timeout or end of stream.
    pub async fn recv_until(&mut self, deadline: Instant) -> Option<Delivery<T>> {
        timeout_at(deadline, self.recv()).await.ok().flatten()
    }

    /// Await the next item, skipping error signals.
    pub async fn recv_item(&mut self) -> Option<T> {
        while let Some(delivery) = self.recv().await {
            if let Delivery::Item(item) = delivery {
                return Some(item);
            }
        }
        None
    }

    /// Items discarded because this subscription fell behind.
    pub fn lost_count(&self) -> u64 {
        self.stream.ring.lock().lost_count
    }

    /// Whether the hub has closed this subscription.
    pub fn is_closed(&self) -> bool {
        self.stream.is_closed()
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("lost_count", &self.stream.ring.lock().lost_count)
            .field("closed", &self.stream.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

/// Fan-out of `T` to any number of subscribers.
pub struct Hub<T> {
    /// Items published so far.
    published: AtomicU64,
    /// Per-subscriber ring capacity.
    capacity: usize,
    /// Live and dead subscriptions.
    subscribers: Mutex<Vec<Weak<StreamInner<T>>>>,
    /// Set once the hub is closed.
    closed: AtomicBool,
}

impl<T: Clone> Hub<T> {
    /// Create a hub with the given per-subscriber capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            published: AtomicU64::new(0),
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Subscribe to items published from now on. A subscription to a closed
    /// hub ends immediately.
    pub fn subscribe(&self) -> Subscription<T> {
        let stream = StreamInner::new(self.capacity);
        if self.is_closed() {
            stream.close();
        } else {
            self.subscribers.lock().push(Arc::downgrade(&stream));
        }
        Subscription { stream }
    }

    /// Deliver `item` to every live subscriber.
    ///
    /// Fails with [`Error::Delivery`] when a subscriber ring overflowed; the
    /// item is still delivered to everyone.
    pub fn publish(&self, item: T) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        let overflowed = self.push_all(&Delivery::Item(item));
        if overflowed > 0 {
            return Err(Error::Delivery(format!(
                "{overflowed} subscriber(s) overflowed and lost items"
            )));
        }
        Ok(())
    }

    /// Deliver an error signal to every live subscriber.
    pub fn publish_error(&self, err: StreamError) {
        if !self.is_closed() {
            self.push_all(&Delivery::Error(err));
        }
    }

    /// Push to every live stream, pruning dead ones. Returns the overflow count.
    fn push_all(&self, delivery: &Delivery<T>) -> usize {
        let mut overflowed = 0;
        let mut stale = false;
        {
            let subscribers = self.subscribers.lock();
            for weak in subscribers.iter() {
                match weak.upgrade() {
                    Some(stream) => {
                        if stream.push(delivery.clone()) {
                            overflowed += 1;
                        }
                    }
                    None => stale = true,
                }
            }
        }
        if stale {
            self.prune();
        }
        overflowed
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.prune();
        self.subscribers.lock().len()
    }

    /// Items published so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Close every subscription. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let subscribers = mem::take(&mut *self.subscribers.lock());
        for weak in subscribers {
            if let Some(stream) = weak.upgrade() {
                stream.close();
            }
        }
    }

    /// Whether [`Hub::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drop references to dropped subscriptions.
    fn prune(&self) {
        self.subscribers
            .lock()
            .retain(|weak| weak.upgrade().is_some_and(|stream| !stream.is_closed()));
    }
}

impl<T> Drop for Hub<T> {
    fn drop(&mut self) {
        let subscribers = self.subscribers.lock();
        for weak in subscribers.iter() {
            if let Some(stream) = weak.upgrade() {
                stream.closed.store(true, Ordering::Release);
                stream.notify.notify_waiters();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::sleep;

    use super::*;

    #[tokio::test]
    async fn fans_out_in_order() {
        let hub = Hub::new(8);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        for i in 0..3 {
            hub.publish(i).unwrap();
        }
        for sub in [&mut a, &mut b] {
            let got: Vec<i32> = (0..3).filter_map(|_| sub.try_recv()?.item()).collect();
            assert_eq!(got, vec![0, 1, 2]);
        }
    }

    #[tokio::test]
    async fn overflow_reports_delivery_error_and_keeps_newest() {
        let hub = Hub::new(2);
        let mut sub = hub.subscribe();
        hub.publish(1).unwrap();
        hub.publish(2).unwrap();
        let err = hub.publish(3).unwrap_err();
        assert!(err.is_delivery());
        assert_eq!(sub.lost_count(), 1);
        assert_eq!(sub.try_recv(), Some(Delivery::Item(2)));
        assert_eq!(sub.try_recv(), Some(Delivery::Item(3)));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let hub = Hub::new(8);
        let mut sub = hub.subscribe();
        hub.publish("a").unwrap();
        hub.close();
        hub.close();
        assert_eq!(sub.recv().await, Some(Delivery::Item("a")));
        assert_eq!(sub.recv().await, None);
        assert!(matches!(hub.publish("b"), Err(Error::ChannelClosed)));
        let mut late = hub.subscribe();
        assert!(late.is_closed());
        assert_eq!(late.recv().await, None);
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned() {
        let hub: Hub<u8> = Hub::new(8);
        let keep = hub.subscribe();
        let gone = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);
        drop(gone);
        assert_eq!(hub.subscriber_count(), 1);
        drop(keep);
        hub.publish(1).unwrap();
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn recv_wakes_on_publish() {
        let hub = Arc::new(Hub::new(8));
        let mut sub = hub.subscribe();
        let publisher = hub.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(5)).await;
            publisher.publish(7u32).unwrap();
        });
        let deadline = Instant::now() + Duration::from_secs(2);
        assert_eq!(sub.recv_until(deadline).await, Some(Delivery::Item(7)));
    }

    #[tokio::test]
    async fn error_signals_reach_subscribers() {
        let hub: Hub<u8> = Hub::new(8);
        let mut sub = hub.subscribe();
        hub.publish_error(StreamError::from(&Error::ChannelClosed));
        match sub.try_recv() {
            Some(Delivery::Error(err)) => assert!(err.retrying),
            other => panic!("unexpected {other:?}"),
        }
    }
}
