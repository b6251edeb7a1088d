//! Consumer lanes
//!
//! Each lane is one tokio task draining its own [`LaneQueue`] into a
//! [`BeatSink`]. A slow, failing or panicking sink only ever affects its
//! own lane.

use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::queue::{Delivery, LaneQueue};
use super::RouteTarget;
use crate::channel::{BeatEvent, Clock};
use crate::constants::{DEFAULT_LANE_CAPACITY, FRESHNESS_WINDOW_MS, MAX_FUTURE_SKEW_MS};
use crate::error::SinkError;

/// Downstream consumer of routed beats
pub trait BeatSink: Send + 'static {
    fn deliver(
        &mut self,
        event: &BeatEvent,
        route: &RouteTarget,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Lane settings
#[derive(Debug, Clone, PartialEq)]
pub struct LaneConfig {
    pub name: String,
    pub capacity: usize,
    /// Banks this lane accepts; `None` accepts all
    pub banks: Option<Vec<u8>>,
    pub freshness_window: Duration,
    /// Consecutive sink failures before the lane goes idle
    pub max_consecutive_failures: u32,
}

impl LaneConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: DEFAULT_LANE_CAPACITY,
            banks: None,
            freshness_window: Duration::from_millis(FRESHNESS_WINDOW_MS),
            max_consecutive_failures: 10,
        }
    }

    pub fn with_banks(mut self, banks: Vec<u8>) -> Self {
        self.banks = Some(banks);
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Lane lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LaneState {
    Running = 0,
    /// Gave up on its sink; drains and drops
    Idle = 1,
    Stopped = 2,
}

impl LaneState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LaneState::Running,
            1 => LaneState::Idle,
            _ => LaneState::Stopped,
        }
    }
}

/// Counters for one lane
#[derive(Debug, Default)]
pub struct LaneStats {
    pub enqueued: AtomicU64,
    pub delivered: AtomicU64,
    pub stale: AtomicU64,
    pub failures: AtomicU64,
    pub dropped_idle: AtomicU64,
    consecutive_failures: AtomicU32,
    state: AtomicU8,
}

impl LaneStats {
    pub fn state(&self) -> LaneState {
        LaneState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: LaneState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }
}

/// Point-in-time copy of a lane's counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaneSnapshot {
    pub name: String,
    pub state: LaneState,
    pub banks: Option<Vec<u8>>,
    pub queued: usize,
    pub enqueued: u64,
    pub delivered: u64,
    pub stale: u64,
    pub overflow: u64,
    pub failures: u64,
    pub dropped_idle: u64,
}

/// Producer side of a running lane
#[derive(Debug)]
pub struct LaneHandle {
    name: String,
    banks: Option<Vec<u8>>,
    queue: Arc<LaneQueue>,
    stats: Arc<LaneStats>,
    task: JoinHandle<()>,
}

impl LaneHandle {
    /// Start a lane task draining into `sink`
    pub fn spawn<S: BeatSink>(
        config: LaneConfig,
        sink: S,
        clock: Arc<dyn Clock>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let queue = Arc::new(LaneQueue::new(config.capacity));
        let stats = Arc::new(LaneStats::default());

        let worker = LaneWorker {
            name: config.name.clone(),
            sink,
            queue: queue.clone(),
            stats: stats.clone(),
            clock,
            freshness_ms: config.freshness_window.as_secs_f64() * 1000.0,
            max_consecutive_failures: config.max_consecutive_failures.max(1),
        };
        let task = tokio::spawn(worker.run(shutdown));

        info!("Lane '{}' started (capacity {})", config.name, config.capacity);

        Self {
            name: config.name,
            banks: config.banks,
            queue,
            stats,
            task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this lane takes beats routed to `bank`
    pub fn accepts(&self, bank: u8) -> bool {
        self.banks.as_ref().map_or(true, |b| b.contains(&bank))
    }

    /// Hand a delivery to the lane; never blocks
    pub fn offer(&self, delivery: Delivery) {
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        if !self.queue.push(delivery) {
            trace!("Lane '{}' full, oldest beat dropped", self.name);
        }
    }

    pub fn state(&self) -> LaneState {
        if self.task.is_finished() {
            LaneState::Stopped
        } else {
            self.stats.state()
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub(crate) fn abort(&self) {
        self.task.abort();
    }

    pub fn snapshot(&self) -> LaneSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        LaneSnapshot {
            name: self.name.clone(),
            state: self.state(),
            banks: self.banks.clone(),
            queued: self.queue.len(),
            enqueued: load(&self.stats.enqueued),
            delivered: load(&self.stats.delivered),
            stale: load(&self.stats.stale),
            overflow: self.queue.overflow_count(),
            failures: load(&self.stats.failures),
            dropped_idle: load(&self.stats.dropped_idle),
        }
    }
}

struct LaneWorker<S> {
    name: String,
    sink: S,
    queue: Arc<LaneQueue>,
    stats: Arc<LaneStats>,
    clock: Arc<dyn Clock>,
    freshness_ms: f64,
    max_consecutive_failures: u32,
}

impl<S: BeatSink> LaneWorker<S> {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut stopping = false;
        loop {
            while let Some(delivery) = self.queue.pop() {
                self.process(delivery).await;
            }
            if stopping || *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = self.queue.notified() => {}
                changed = shutdown.changed() => {
                    // Drain whatever is left, then exit
                    stopping = changed.is_err() || *shutdown.borrow();
                }
            }
        }
        self.stats.set_state(LaneState::Stopped);
        debug!("Lane '{}' stopped", self.name);
    }

    async fn process(&mut self, delivery: Delivery) {
        if self.stats.state() == LaneState::Idle {
            self.stats.dropped_idle.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // NaN ages fail the range check and are dropped with the rest
        let age_ms = delivery.event.age_ms(self.clock.now());
        if !(-(MAX_FUTURE_SKEW_MS as f64)..self.freshness_ms).contains(&age_ms) {
            self.stats.stale.fetch_add(1, Ordering::Relaxed);
            trace!("Lane '{}': beat age {:.0}ms out of window, dropped", self.name, age_ms);
            return;
        }

        match self.sink.deliver(&delivery.event, &delivery.route).await {
            Ok(()) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                self.stats.consecutive_failures.store(0, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                let consecutive = self.stats.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("Lane '{}' delivery failed: {}", self.name, e);
                if consecutive >= self.max_consecutive_failures {
                    self.stats.set_state(LaneState::Idle);
                    error!(
                        "Lane '{}' idle after {} consecutive failures",
                        self.name, consecutive
                    );
                }
            }
        }
    }
}
