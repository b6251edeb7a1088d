//! Per-channel counters
//!
//! Written only by the owning channel worker, read by snapshots.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use super::{ChannelId, Lifecycle};

/// Lock-free counters for one channel
#[derive(Debug, Default)]
pub struct ChannelStats {
    pub samples_accepted: AtomicU64,
    pub out_of_order: AtomicU64,
    pub gap_resets: AtomicU64,
    pub beats_detected: AtomicU64,
    pub events_emitted: AtomicU64,
    pub noise_rejected: AtomicU64,
    pub suppressed_samples: AtomicU64,
    /// Batches the worker queue could not take
    pub batches_dropped: AtomicU64,
    lifecycle: AtomicU8,
    disconnected: AtomicBool,
}

impl ChannelStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.lifecycle.store(lifecycle as u8, Ordering::Relaxed);
    }

    pub fn set_disconnected(&self, disconnected: bool) {
        self.disconnected.store(disconnected, Ordering::Relaxed);
    }

    /// Read a consistent-enough view of the counters
    pub fn snapshot(&self, channel: ChannelId) -> ChannelSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ChannelSnapshot {
            channel,
            lifecycle: Lifecycle::from_u8(self.lifecycle.load(Ordering::Relaxed)),
            disconnected: self.disconnected.load(Ordering::Relaxed),
            samples_accepted: load(&self.samples_accepted),
            out_of_order: load(&self.out_of_order),
            gap_resets: load(&self.gap_resets),
            beats_detected: load(&self.beats_detected),
            events_emitted: load(&self.events_emitted),
            noise_rejected: load(&self.noise_rejected),
            suppressed_samples: load(&self.suppressed_samples),
            batches_dropped: load(&self.batches_dropped),
        }
    }
}

/// Point-in-time copy of a channel's counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSnapshot {
    pub channel: ChannelId,
    pub lifecycle: Lifecycle,
    pub disconnected: bool,
    pub samples_accepted: u64,
    pub out_of_order: u64,
    pub gap_resets: u64,
    pub beats_detected: u64,
    pub events_emitted: u64,
    pub noise_rejected: u64,
    pub suppressed_samples: u64,
    pub batches_dropped: u64,
}
