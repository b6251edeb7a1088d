//! Bounded lane queue
//!
//! Multi-producer, single-consumer. A full queue evicts its oldest entry
//! so the freshest beats survive; the producer never blocks.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

use super::RouteTarget;
use crate::channel::BeatEvent;

/// A routed event waiting for its lane
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Delivery {
    pub event: BeatEvent,
    pub route: RouteTarget,
}

/// Lock-free ring of pending deliveries plus a wake-up for the consumer
#[derive(Debug)]
pub struct LaneQueue {
    queue: ArrayQueue<Delivery>,
    notify: Notify,
    overflow_count: AtomicU64,
}

impl LaneQueue {
    /// Create a queue holding at most `capacity` deliveries
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            notify: Notify::new(),
            overflow_count: AtomicU64::new(0),
        }
    }

    /// Enqueue a delivery, evicting the oldest one when full.
    ///
    /// Returns `false` if something was evicted.
    pub fn push(&self, delivery: Delivery) -> bool {
        let evicted = self.queue.force_push(delivery);
        self.notify.notify_one();
        match evicted {
            Some(_) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                false
            }
            None => true,
        }
    }

    pub fn pop(&self) -> Option<Delivery> {
        self.queue.pop()
    }

    /// Wait until something has been pushed since the last wake-up
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// Wake the consumer without enqueuing anything
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Deliveries evicted because the queue was full
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }
}
