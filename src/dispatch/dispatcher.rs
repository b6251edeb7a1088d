//! Event fan-out

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use super::lane::{BeatSink, LaneConfig, LaneHandle, LaneSnapshot};
use super::queue::Delivery;
use super::routing::{RouteTarget, RoutingTable};
use crate::channel::{BeatEvent, ChannelId, Clock};
use crate::error::DispatchError;

/// Dispatcher-level counters plus every lane's
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchSnapshot {
    pub dispatched: u64,
    pub unrouted: u64,
    pub lanes: Vec<LaneSnapshot>,
}

/// Routes beats to every lane whose bank filter matches
#[derive(Debug)]
pub struct Dispatcher {
    routing: RwLock<Arc<RoutingTable>>,
    lanes: Vec<LaneHandle>,
    clock: Arc<dyn Clock>,
    shutdown_tx: watch::Sender<bool>,
    dispatched: AtomicU64,
    unrouted: AtomicU64,
}

impl Dispatcher {
    pub fn new(routing: RoutingTable, clock: Arc<dyn Clock>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            routing: RwLock::new(Arc::new(routing)),
            lanes: Vec::new(),
            clock,
            shutdown_tx,
            dispatched: AtomicU64::new(0),
            unrouted: AtomicU64::new(0),
        }
    }

    /// Start a lane. Must be called from within a tokio runtime.
    pub fn add_lane<S: BeatSink>(&mut self, config: LaneConfig, sink: S) -> Result<(), DispatchError> {
        if self.lanes.iter().any(|l| l.name() == config.name) {
            return Err(DispatchError::DuplicateLane(config.name));
        }
        let lane = LaneHandle::spawn(config, sink, self.clock.clone(), self.shutdown_tx.subscribe());
        self.lanes.push(lane);
        Ok(())
    }

    /// Fan an event out. Returns the number of lanes it was queued on.
    pub fn dispatch(&self, event: &BeatEvent) -> Result<usize, DispatchError> {
        let route = match self.routing.read().get(event.channel) {
            Some(route) => route,
            None => {
                self.unrouted.fetch_add(1, Ordering::Relaxed);
                return Err(DispatchError::UnknownChannel(event.channel.as_u8()));
            }
        };

        let delivery = Delivery { event: *event, route };
        let mut reached = 0;
        for lane in self.lanes.iter().filter(|l| l.accepts(route.bank)) {
            lane.offer(delivery);
            reached += 1;
        }
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        Ok(reached)
    }

    /// Current routing table
    pub fn routing(&self) -> Arc<RoutingTable> {
        self.routing.read().clone()
    }

    /// Replace one channel's route
    pub fn update_route(&self, channel: ChannelId, target: RouteTarget) -> Result<(), DispatchError> {
        let mut routing = self.routing.write();
        let next = routing.with_route(channel, target)?;
        *routing = Arc::new(next);
        info!("Channel {} routed to bank {} pan {:.2}", channel, target.bank, target.pan);
        Ok(())
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
            lanes: self.lanes.iter().map(LaneHandle::snapshot).collect(),
        }
    }

    /// Ask every lane to drain and stop; abort those still busy after `grace`
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + grace;
        while self.lanes.iter().any(|l| !l.is_finished()) {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for lane in self.lanes.iter().filter(|l| !l.is_finished()) {
            warn!("Lane '{}' did not drain within {:?}, aborting", lane.name(), grace);
            lane.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ManualClock;
    use crate::dispatch::lane::LaneState;
    use crate::dispatch::sinks::MpscSink;
    use crate::error::SinkError;
    use std::future::Future;
    use tokio::sync::mpsc;

    const NOW: f64 = 1_700_000_000.0;

    fn event(channel: u8, ts: f64) -> BeatEvent {
        BeatEvent::from_interval(ChannelId::new(channel).unwrap(), ts, 800.0, 0.0).unwrap()
    }

    fn dispatcher(clock: Arc<ManualClock>) -> Dispatcher {
        Dispatcher::new(RoutingTable::default(), clock)
    }

    async fn recv(rx: &mut mpsc::Receiver<(BeatEvent, RouteTarget)>) -> Option<(BeatEvent, RouteTarget)> {
        tokio::time::timeout(Duration::from_millis(500), rx.recv()).await.ok().flatten()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Fails every delivery
    struct FailingSink;

    impl BeatSink for FailingSink {
        fn deliver(
            &mut self,
            _event: &BeatEvent,
            _route: &RouteTarget,
        ) -> impl Future<Output = Result<(), SinkError>> + Send {
            async { Err(SinkError::SendFailed("unreachable".into())) }
        }
    }

    /// Never finishes a delivery
    struct StuckSink;

    impl BeatSink for StuckSink {
        async fn deliver(&mut self, _event: &BeatEvent, _route: &RouteTarget) -> Result<(), SinkError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    /// Panics on first use
    struct PanickingSink;

    impl BeatSink for PanickingSink {
        async fn deliver(&mut self, _event: &BeatEvent, _route: &RouteTarget) -> Result<(), SinkError> {
            panic!("sink exploded")
        }
    }

    #[tokio::test]
    async fn test_fresh_event_reaches_every_lane() {
        let clock = Arc::new(ManualClock::new(NOW));
        let mut d = dispatcher(clock);
        let (sound, mut sound_rx) = MpscSink::channel(8);
        let (light, mut light_rx) = MpscSink::channel(8);
        d.add_lane(LaneConfig::new("sound"), sound).unwrap();
        d.add_lane(LaneConfig::new("light"), light).unwrap();

        assert_eq!(d.dispatch(&event(1, NOW - 0.01)).unwrap(), 2);

        let (ev, route) = recv(&mut sound_rx).await.unwrap();
        assert_eq!(ev.channel.as_u8(), 1);
        assert_eq!(route, RouteTarget { bank: 1, pan: -0.33 });
        assert!(recv(&mut light_rx).await.is_some());
    }

    #[tokio::test]
    async fn test_stale_event_dropped_at_lane() {
        let clock = Arc::new(ManualClock::new(NOW));
        let mut d = dispatcher(clock);
        let (sink, mut rx) = MpscSink::channel(8);
        d.add_lane(LaneConfig::new("sound"), sink).unwrap();

        d.dispatch(&event(0, NOW - 0.5)).unwrap();
        d.dispatch(&event(0, NOW - 0.499)).unwrap();

        let (ev, _) = recv(&mut rx).await.unwrap();
        assert_eq!(ev.timestamp, NOW - 0.499);
        let snap = d.snapshot();
        let lane = &snap.lanes[0];
        assert_eq!(lane.stale, 1);
        assert_eq!(lane.delivered, 1);
    }

    #[tokio::test]
    async fn test_unbounded_age_dropped_at_lane() {
        let clock = Arc::new(ManualClock::new(NOW));
        let mut d = dispatcher(clock);
        let (sink, mut rx) = MpscSink::channel(8);
        d.add_lane(LaneConfig::new("sound"), sink).unwrap();

        for ts in [f64::NAN, f64::INFINITY, NOW + 3600.0] {
            d.dispatch(&event(0, ts)).unwrap();
        }
        d.dispatch(&event(0, NOW + 0.1)).unwrap();

        let (ev, _) = recv(&mut rx).await.unwrap();
        assert_eq!(ev.timestamp, NOW + 0.1);
        assert!(recv(&mut rx).await.is_none());
        let lane = &d.snapshot().lanes[0];
        assert_eq!(lane.stale, 3);
        assert_eq!(lane.delivered, 1);
    }

    #[tokio::test]
    async fn test_bank_filter() {
        let clock = Arc::new(ManualClock::new(NOW));
        let mut d = dispatcher(clock);
        let (left, mut left_rx) = MpscSink::channel(8);
        d.add_lane(LaneConfig::new("left").with_banks(vec![0]), left).unwrap();

        assert_eq!(d.dispatch(&event(3, NOW)).unwrap(), 0);
        // Channel 4 mirrors sensor 0 and shares its bank
        assert_eq!(d.dispatch(&event(4, NOW)).unwrap(), 1);
        assert_eq!(recv(&mut left_rx).await.unwrap().0.channel.as_u8(), 4);
    }

    #[tokio::test]
    async fn test_unrouted_channel_rejected() {
        let clock = Arc::new(ManualClock::new(NOW));
        let d = Dispatcher::new(RoutingTable::empty(), clock);
        assert_eq!(d.dispatch(&event(2, NOW)), Err(DispatchError::UnknownChannel(2)));
        assert_eq!(d.snapshot().unrouted, 1);
    }

    #[tokio::test]
    async fn test_duplicate_lane_name() {
        let mut d = dispatcher(Arc::new(ManualClock::new(NOW)));
        d.add_lane(LaneConfig::new("a"), MpscSink::channel(1).0).unwrap();
        let err = d.add_lane(LaneConfig::new("a"), MpscSink::channel(1).0).unwrap_err();
        assert_eq!(err, DispatchError::DuplicateLane("a".into()));
    }

    #[tokio::test]
    async fn test_route_update_is_atomic_swap() {
        let d = dispatcher(Arc::new(ManualClock::new(NOW)));
        let before = d.routing();
        d.update_route(ChannelId::new(0).unwrap(), RouteTarget { bank: 7, pan: 0.5 }).unwrap();
        assert_eq!(before.get(ChannelId::new(0).unwrap()).unwrap().bank, 0);
        assert_eq!(d.routing().get(ChannelId::new(0).unwrap()).unwrap().bank, 7);
        assert!(d
            .update_route(ChannelId::new(0).unwrap(), RouteTarget { bank: 7, pan: 2.0 })
            .is_err());
    }

    #[tokio::test]
    async fn test_failing_lane_goes_idle_without_affecting_others() {
        let clock = Arc::new(ManualClock::new(NOW));
        let mut d = dispatcher(clock);
        let (good, mut good_rx) = MpscSink::channel(64);
        let mut bad = LaneConfig::new("bad");
        bad.max_consecutive_failures = 3;
        d.add_lane(bad, FailingSink).unwrap();
        d.add_lane(LaneConfig::new("good"), good).unwrap();

        for _ in 0..5 {
            d.dispatch(&event(0, NOW)).unwrap();
        }
        for _ in 0..5 {
            assert!(recv(&mut good_rx).await.is_some());
        }
        settle().await;

        let snap = d.snapshot();
        let bad = snap.lanes.iter().find(|l| l.name == "bad").unwrap();
        assert_eq!(bad.state, LaneState::Idle);
        assert_eq!(bad.failures, 3);
        assert_eq!(bad.dropped_idle, 2);
        let good = snap.lanes.iter().find(|l| l.name == "good").unwrap();
        assert_eq!(good.delivered, 5);
        assert_eq!(good.state, LaneState::Running);
    }

    #[tokio::test]
    async fn test_stuck_lane_overflows_and_others_continue() {
        let clock = Arc::new(ManualClock::new(NOW));
        let mut d = dispatcher(clock);
        let (good, mut good_rx) = MpscSink::channel(64);
        d.add_lane(LaneConfig::new("stuck").with_capacity(4), StuckSink).unwrap();
        d.add_lane(LaneConfig::new("good"), good).unwrap();

        for i in 0..20 {
            d.dispatch(&event(0, NOW + i as f64 * 0.001)).unwrap();
        }
        for _ in 0..20 {
            assert!(recv(&mut good_rx).await.is_some());
        }

        let stuck = d.snapshot().lanes.into_iter().find(|l| l.name == "stuck").unwrap();
        // The burst keeps its last four; one of them is stuck in flight
        assert_eq!(stuck.overflow, 16);
        assert_eq!(stuck.queued, 3);

        d.shutdown(Duration::from_millis(50)).await;
        settle().await;
        assert!(d.snapshot().lanes.iter().all(|l| l.state == LaneState::Stopped));
    }

    #[tokio::test]
    async fn test_panicking_lane_is_isolated() {
        let clock = Arc::new(ManualClock::new(NOW));
        let mut d = dispatcher(clock);
        let (good, mut good_rx) = MpscSink::channel(8);
        d.add_lane(LaneConfig::new("boom"), PanickingSink).unwrap();
        d.add_lane(LaneConfig::new("good"), good).unwrap();

        d.dispatch(&event(2, NOW)).unwrap();
        assert!(recv(&mut good_rx).await.is_some());
        settle().await;
        d.dispatch(&event(2, NOW)).unwrap();
        assert!(recv(&mut good_rx).await.is_some());

        let boom = d.snapshot().lanes.into_iter().find(|l| l.name == "boom").unwrap();
        assert_eq!(boom.state, LaneState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_events() {
        let clock = Arc::new(ManualClock::new(NOW));
        let mut d = dispatcher(clock);
        let (sink, mut rx) = MpscSink::channel(64);
        d.add_lane(LaneConfig::new("sound"), sink).unwrap();
        for _ in 0..10 {
            d.dispatch(&event(1, NOW)).unwrap();
        }
        d.shutdown(Duration::from_millis(500)).await;

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 10);
        assert_eq!(d.snapshot().lanes[0].state, LaneState::Stopped);
    }
}
