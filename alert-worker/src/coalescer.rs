//! Per-subscriber batching of matched slots.
//!
//! A scrape run frequently surfaces dozens of matching slots for one
//! subscriber within seconds; emailing each one separately is user-hostile.
//! Matched slots accumulate in a per-subscriber buffer and a per-subscriber
//! debounce timer, armed by the first add and untouched by later ones, flushes
//! the whole buffer as a single consolidated dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::dispatcher::Dispatch;
use alert_common::slot::Slot;

#[derive(Default)]
struct SubscriberBuffer {
    slots: Vec<Slot>,
    timer_armed: bool,
    /// Held for the whole of a dispatch. At most one in-flight email per
    /// subscriber, ever; flushes queue up behind it in timer-fire order.
    dispatch_lock: Arc<tokio::sync::Mutex<()>>,
}

pub struct Coalescer {
    buffers: Arc<Mutex<HashMap<i64, SubscriberBuffer>>>,
    dispatcher: Arc<dyn Dispatch>,
    debounce: Duration,
    buffer_cap: usize,
}

impl Coalescer {
    pub fn new(dispatcher: Arc<dyn Dispatch>, debounce: Duration, buffer_cap: usize) -> Self {
        Self {
            buffers: Default::default(),
            dispatcher,
            debounce,
            buffer_cap,
        }
    }

    /// Buffer a matched slot for the subscriber. `instant` subscribers skip
    /// the debounce window entirely and get a single-slot dispatch.
    pub async fn add(&self, subscriber_id: i64, slot: Slot, instant: bool) {
        if instant {
            let lock = {
                let mut buffers = self.buffers.lock().expect("poisoned coalescer lock");
                buffers
                    .entry(subscriber_id)
                    .or_default()
                    .dispatch_lock
                    .clone()
            };
            let _guard = lock.lock().await;
            let outcome = self.dispatcher.dispatch(subscriber_id, vec![slot]).await;
            debug!(subscriber_id, ?outcome, "instant dispatch");
            return;
        }

        let arm_timer = {
            let mut buffers = self.buffers.lock().expect("poisoned coalescer lock");
            let entry = buffers.entry(subscriber_id).or_default();
            if entry.slots.len() >= self.buffer_cap {
                entry.slots.remove(0);
                metrics::counter!("coalescer_slots_dropped_total").increment(1);
                warn!(subscriber_id, "buffer full, evicting oldest slot");
            }
            entry.slots.push(slot);
            if entry.timer_armed {
                false
            } else {
                entry.timer_armed = true;
                true
            }
        };

        if arm_timer {
            let buffers = self.buffers.clone();
            let dispatcher = self.dispatcher.clone();
            let debounce = self.debounce;
            tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                flush_one(&buffers, dispatcher.as_ref(), subscriber_id).await;
            });
        }
    }

    /// Flush every non-empty buffer now. Used at shutdown, bounded by the
    /// grace window on the caller's side.
    pub async fn flush_all(&self) {
        let subscriber_ids: Vec<i64> = {
            let buffers = self.buffers.lock().expect("poisoned coalescer lock");
            buffers
                .iter()
                .filter(|(_, buffer)| !buffer.slots.is_empty())
                .map(|(id, _)| *id)
                .collect()
        };
        for subscriber_id in subscriber_ids {
            flush_one(&self.buffers, self.dispatcher.as_ref(), subscriber_id).await;
        }
    }

    /// Drop whatever is still buffered, returning how many slots were lost.
    pub fn discard_remaining(&self) -> usize {
        let mut buffers = self.buffers.lock().expect("poisoned coalescer lock");
        buffers
            .values_mut()
            .map(|buffer| std::mem::take(&mut buffer.slots).len())
            .sum()
    }

    /// Total slots currently buffered across all subscribers.
    pub fn pending_slots(&self) -> usize {
        let buffers = self.buffers.lock().expect("poisoned coalescer lock");
        buffers.values().map(|buffer| buffer.slots.len()).sum()
    }
}

/// Swap the subscriber's buffer for an empty one, then dispatch the taken
/// slots under the subscriber's dispatch lock. Adds that arrive while the
/// dispatch is in flight land in the fresh buffer and arm a new timer.
async fn flush_one(
    buffers: &Mutex<HashMap<i64, SubscriberBuffer>>,
    dispatcher: &dyn Dispatch,
    subscriber_id: i64,
) {
    let (slots, lock) = {
        let mut map = buffers.lock().expect("poisoned coalescer lock");
        let Some(entry) = map.get_mut(&subscriber_id) else {
            return;
        };
        entry.timer_armed = false;
        (
            std::mem::take(&mut entry.slots),
            entry.dispatch_lock.clone(),
        )
    };
    if slots.is_empty() {
        return;
    }

    let slot_count = slots.len();
    let _guard = lock.lock().await;
    let outcome = dispatcher.dispatch(subscriber_id, slots).await;
    metrics::counter!("coalescer_flushes_total").increment(1);
    debug!(subscriber_id, slot_count, ?outcome, "flushed batch");
}
