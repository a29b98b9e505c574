//! Test support utilities for focus-stream unit and integration tests.
//! These helpers are public to avoid dead_code warnings and are lightweight.
//! They are intended for use by the test suite only.

use std::time::Duration;

use tokio::time::{Instant, timeout};

use crate::{
    event::{EventType, FocusEvent, FocusMetadata, RawTick, TickKind},
    hub::{Delivery, Subscription},
    tab,
};

/// Microseconds in a millisecond.
const US_PER_MS: u64 = 1000;

/// Build an event with millisecond timestamp and duration.
pub fn event(app: &str, ty: EventType, ts_ms: u64, dur_ms: u64) -> FocusEvent {
    FocusEvent::new(app, ty, ts_ms * US_PER_MS, dur_ms * US_PER_MS)
}

/// Build a raw tick with millisecond timestamp and duration.
pub fn tick(app: &str, kind: TickKind, ts_ms: u64, dur_ms: u64) -> RawTick {
    RawTick::new(app, kind, ts_ms * US_PER_MS, dur_ms * US_PER_MS)
}

/// Build a raw tick for a window with `title`, deriving browser metadata the
/// same way a capture source would.
pub fn window_tick(process: &str, title: &str, kind: TickKind, ts_ms: u64, dur_ms: u64) -> RawTick {
    let metadata: FocusMetadata = tab::metadata_for_window(process, "", title);
    tick(process, kind, ts_ms, dur_ms).with_metadata(metadata)
}

/// Receive the next item within `timeout_ms`, skipping error signals.
pub async fn recv_within<T: Clone>(sub: &mut Subscription<T>, timeout_ms: u64) -> Option<T> {
    timeout(Duration::from_millis(timeout_ms), sub.recv_item())
        .await
        .ok()
        .flatten()
}

/// Take every item already delivered, without waiting.
pub fn drain_items<T: Clone>(sub: &mut Subscription<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Some(delivery) = sub.try_recv() {
        if let Delivery::Item(item) = delivery {
            out.push(item);
        }
    }
    out
}

/// Collect items until the channel closes or `timeout_ms` passes.
pub async fn collect_until_closed<T: Clone>(sub: &mut Subscription<T>, timeout_ms: u64) -> Vec<T> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let mut out = Vec::new();
    while let Some(delivery) = sub.recv_until(deadline).await {
        if let Delivery::Item(item) = delivery {
            out.push(item);
        }
    }
    out
}

/// Event types of `events`, in order.
pub fn types(events: &[FocusEvent]) -> Vec<EventType> {
    events.iter().map(|e| e.event_type).collect()
}
