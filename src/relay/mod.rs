//! Relay orchestration
//!
//! Wires the ingest receiver, one worker per channel id, the optional
//! capture recorder and the dispatcher into a running pipeline, and
//! aggregates their counters into a [`RelaySnapshot`].

pub mod worker;

pub use worker::ChannelWorker;

use parking_lot::Mutex;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capture::{CaptureRecorder, RecorderSnapshot};
use crate::channel::{BeatEvent, Channel, ChannelId, ChannelSnapshot, ChannelStats, Clock, EventPublisher};
use crate::config::{AppConfig, DispatchConfig, RoutingConfig, SinkKind};
use crate::dispatch::{DispatchSnapshot, Dispatcher, LogSink, RouteTarget, UdpSink};
use crate::error::Result;
use crate::network::{
    create_socket, sender_socket, InboundHandler, IngestReceiver, ReceiverSnapshot, ReceiverStats,
    SocketOptions,
};
use crate::protocol::{AdminCommand, Inbound, MessageDecoder, SampleBatch};

/// Everything the relay counts, at one point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelaySnapshot {
    pub uptime_secs: u64,
    pub receiver: ReceiverSnapshot,
    pub channels: Vec<ChannelSnapshot>,
    pub dispatch: DispatchSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture: Option<RecorderSnapshot>,
}

/// Shared state of a running relay.
///
/// Receives validated datagrams from the ingest loop and answers snapshot
/// and routing queries from the API.
pub struct RelayHub {
    started: Instant,
    queues: Vec<mpsc::Sender<SampleBatch>>,
    channel_stats: Vec<Arc<ChannelStats>>,
    receiver_stats: Arc<ReceiverStats>,
    dispatcher: Arc<Dispatcher>,
    recorder: Mutex<Option<CaptureRecorder>>,
    admin_tx: mpsc::UnboundedSender<AdminCommand>,
}

impl RelayHub {
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> RelaySnapshot {
        RelaySnapshot {
            uptime_secs: self.uptime().as_secs(),
            receiver: self.receiver_stats.snapshot(),
            channels: ChannelId::all()
                .zip(&self.channel_stats)
                .map(|(id, stats)| stats.snapshot(id))
                .collect(),
            dispatch: self.dispatcher.snapshot(),
            capture: self.recorder.lock().as_ref().map(CaptureRecorder::snapshot),
        }
    }

    /// Log a condensed snapshot
    pub fn log_snapshot(&self) {
        let snap = self.snapshot();
        let rx = &snap.receiver;
        info!(
            "Uptime {}s: {} packets, {} accepted, {} malformed, {} unknown, {} stale",
            snap.uptime_secs,
            rx.packets_received,
            rx.accepted,
            rx.malformed,
            rx.unknown_channel + rx.unknown_address,
            rx.stale
        );
        for ch in snap.channels.iter().filter(|c| c.samples_accepted > 0) {
            info!(
                "  Channel {}: {:?}{}, {} samples, {} beats, {} out-of-order, {} gap resets, {} queue drops",
                ch.channel,
                ch.lifecycle,
                if ch.disconnected { " (no signal)" } else { "" },
                ch.samples_accepted,
                ch.events_emitted,
                ch.out_of_order,
                ch.gap_resets,
                ch.batches_dropped
            );
        }
        for lane in &snap.dispatch.lanes {
            info!(
                "  Lane '{}': {:?}, {} delivered, {} stale, {} overflow, {} failures",
                lane.name, lane.state, lane.delivered, lane.stale, lane.overflow, lane.failures
            );
        }
        if let Some(capture) = snap.capture {
            info!(
                "  Capture: {} recorded, {} dropped, {} write errors",
                capture.recorded, capture.dropped, capture.write_errors
            );
        }
    }

    fn forward_samples(&self, batch: SampleBatch) {
        if let Some(recorder) = self.recorder.lock().as_ref() {
            recorder.record(&batch);
        }

        let channel = batch.channel;
        match self.queues[channel.index()].try_send(batch) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                ChannelStats::incr(&self.channel_stats[channel.index()].batches_dropped);
                debug!("Channel {} queue full, batch dropped", channel);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Channel {} worker gone, batch dropped", channel);
            }
        }
    }

    fn forward_beat(&self, event: BeatEvent) {
        if let Err(e) = self.dispatcher.dispatch(&event) {
            debug!("Upstream beat on channel {} not dispatched: {}", event.channel, e);
        }
    }

    /// Close the capture files and return the recorder's final counters.
    ///
    /// The writer thread is joined on the blocking pool, outside the lock.
    async fn stop_capture(&self) -> Option<RecorderSnapshot> {
        let mut recorder = self.recorder.lock().take()?;
        let joined = tokio::task::spawn_blocking(move || {
            recorder.stop();
            recorder.snapshot()
        })
        .await;
        match joined {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Capture recorder did not stop cleanly: {}", e);
                None
            }
        }
    }
}

impl InboundHandler for RelayHub {
    fn handle(&self, inbound: Inbound, source: SocketAddr) {
        match inbound {
            Inbound::Samples(batch) => self.forward_samples(batch),
            Inbound::Beat(event) => self.forward_beat(event),
            Inbound::Route { channel, bank, pan } => {
                let result = RouteTarget::new(bank, pan)
                    .and_then(|target| self.dispatcher.update_route(channel, target));
                if let Err(e) = result {
                    warn!("Route update from {} rejected: {}", source, e);
                }
            }
            Inbound::Admin(command) => {
                info!("Admin command {:?} from {}", command, source);
                let _ = self.admin_tx.send(command);
            }
        }
    }
}

/// Build the dispatcher and its lanes from configuration.
///
/// Must be called from within a tokio runtime.
pub fn build_dispatcher(
    dispatch: &DispatchConfig,
    routing: &RoutingConfig,
    clock: Arc<dyn Clock>,
) -> Result<Dispatcher> {
    let mut dispatcher = Dispatcher::new(routing.table()?, clock);
    for lane in &dispatch.lanes {
        match lane.sink {
            SinkKind::Udp => {
                let target = lane.target_addr()?;
                let socket = Arc::new(sender_socket(lane.broadcast)?);
                dispatcher.add_lane(lane.lane_config(), UdpSink::new(socket, target))?;
                info!("Lane '{}' sends beats to {}", lane.name, target);
            }
            SinkKind::Log => dispatcher.add_lane(lane.lane_config(), LogSink)?,
        }
    }
    Ok(dispatcher)
}

/// A running relay pipeline
pub struct Relay {
    hub: Arc<RelayHub>,
    ingest_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    admin_rx: mpsc::UnboundedReceiver<AdminCommand>,
    shutdown_grace: Duration,
}

impl Relay {
    /// Start the pipeline described by `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &AppConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let dispatcher = build_dispatcher(&config.dispatch, &config.routing, clock.clone())?;
        Self::start_with_dispatcher(config, clock, dispatcher)
    }

    /// Start the pipeline around an already configured dispatcher
    pub fn start_with_dispatcher(config: &AppConfig, clock: Arc<dyn Clock>, dispatcher: Dispatcher) -> Result<Self> {
        config.validate()?;
        let dispatcher = Arc::new(dispatcher);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (admin_tx, admin_rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();

        let params = config.detection.params();
        let mut queues = Vec::new();
        let mut channel_stats = Vec::new();
        for id in ChannelId::all() {
            let stats = Arc::new(ChannelStats::new());
            let channel = Channel::with_stats(id, params, EventPublisher::new(clock.clone()), stats.clone());
            let (tx, rx) = mpsc::channel(config.ingest.channel_queue.max(1));
            let worker = ChannelWorker::new(channel, rx, dispatcher.clone());
            tasks.push(tokio::spawn(worker.run(shutdown_rx.clone())));
            queues.push(tx);
            channel_stats.push(stats);
        }

        let recorder = if config.capture.enabled {
            Some(CaptureRecorder::start(&config.capture.directory, config.capture.queue)?)
        } else {
            None
        };

        let receiver_stats = Arc::new(ReceiverStats::default());
        let hub = Arc::new(RelayHub {
            started: Instant::now(),
            queues,
            channel_stats,
            receiver_stats: receiver_stats.clone(),
            dispatcher,
            recorder: Mutex::new(recorder),
            admin_tx,
        });

        let socket = create_socket(
            config.network.ingest_addr()?,
            SocketOptions {
                reuse_port: config.network.reuse_port,
                broadcast: false,
                recv_buffer_size: config.network.recv_buffer_size,
            },
        )?;
        let decoder = MessageDecoder::new(clock)
            .with_bundle_size(config.ingest.bundle_size)
            .with_sample_rate(config.ingest.sample_rate_hz)
            .with_adc_max(config.ingest.adc_max)
            .with_freshness_window_ms(config.ingest.freshness_window_ms);
        let receiver = IngestReceiver::with_stats(socket, decoder, hub.clone(), receiver_stats);
        let ingest_addr = receiver.local_addr()?;
        tasks.push(tokio::spawn(receiver.run(shutdown_rx.clone())));

        if config.dispatch.stats_interval_secs > 0 {
            let period = Duration::from_secs(config.dispatch.stats_interval_secs);
            tasks.push(tokio::spawn(log_periodically(hub.clone(), period, shutdown_rx)));
        }

        info!(
            "Relay running: ingest on {}, {} lanes",
            ingest_addr,
            hub.dispatcher.lane_count()
        );

        Ok(Self {
            hub,
            ingest_addr,
            shutdown_tx,
            tasks,
            admin_rx,
            shutdown_grace: Duration::from_millis(config.dispatch.shutdown_grace_ms),
        })
    }

    pub fn hub(&self) -> Arc<RelayHub> {
        self.hub.clone()
    }

    /// Bound ingest address
    pub fn ingest_addr(&self) -> SocketAddr {
        self.ingest_addr
    }

    pub fn snapshot(&self) -> RelaySnapshot {
        self.hub.snapshot()
    }

    /// Next admin command received over the wire
    pub async fn next_admin(&mut self) -> Option<AdminCommand> {
        self.admin_rx.recv().await
    }

    /// Stop ingest and workers, drain the lanes, close capture files.
    ///
    /// Returns the final snapshot.
    pub async fn shutdown(self) -> RelaySnapshot {
        info!("Shutting down relay");
        let _ = self.shutdown_tx.send(true);

        for task in self.tasks {
            match tokio::time::timeout(self.shutdown_grace, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Relay task ended abnormally: {}", e),
                Err(_) => warn!("Relay task did not stop within {:?}", self.shutdown_grace),
            }
        }

        self.hub.dispatcher.shutdown(self.shutdown_grace).await;
        let capture = self.hub.stop_capture().await;
        RelaySnapshot {
            capture,
            ..self.hub.snapshot()
        }
    }
}

async fn log_periodically(hub: Arc<RelayHub>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => hub.log_snapshot(),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureReader;
    use crate::channel::{Lifecycle, SystemClock};
    use crate::dispatch::{LaneConfig, MpscSink, RoutingTable};
    use crate::protocol::{encode_route, OscMessage, ADMIN_STATS};
    use crate::signal::PulseWave;
    use tokio::net::UdpSocket;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.network.bind_address = "127.0.0.1".into();
        config.network.ingest_port = 0;
        config.network.reuse_port = false;
        config.api.enabled = false;
        config.dispatch.lanes.clear();
        config.dispatch.stats_interval_secs = 0;
        config.ingest.channel_queue = 1024;
        config
    }

    fn source() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    /// Ten seconds of a 75 BPM pulse as ingest batches
    fn pulse_batches(channel: u8) -> Vec<SampleBatch> {
        let id = ChannelId::new(channel).unwrap();
        let values: Vec<i32> = PulseWave::new(75.0).samples(50, 10.0).map(|(_, v)| v).collect();
        values
            .chunks(5)
            .enumerate()
            .map(|(i, chunk)| SampleBatch {
                channel: id,
                timestamp_ms: i as i64 * 100,
                values: chunk.to_vec(),
                interval_ms: 20.0,
            })
            .collect()
    }

    fn relay_with_sink(config: &AppConfig) -> (Relay, mpsc::Receiver<(BeatEvent, RouteTarget)>) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let mut dispatcher = Dispatcher::new(RoutingTable::default(), clock.clone());
        let (sink, rx) = MpscSink::channel(64);
        dispatcher.add_lane(LaneConfig::new("test"), sink).unwrap();
        (Relay::start_with_dispatcher(config, clock, dispatcher).unwrap(), rx)
    }

    #[tokio::test]
    async fn test_pulse_reaches_lane() {
        let (relay, mut rx) = relay_with_sink(&test_config());
        let hub = relay.hub();
        for batch in pulse_batches(2) {
            hub.handle(Inbound::Samples(batch), source());
        }

        let mut events = Vec::new();
        while let Ok(Some((event, route))) = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await {
            assert_eq!(event.channel.as_u8(), 2);
            assert_eq!(route, RouteTarget { bank: 2, pan: 0.33 });
            events.push(event);
        }
        assert!((10..=12).contains(&events.len()), "got {}", events.len());
        assert!(events.iter().all(|e| (73.0..=77.0).contains(&e.rate_bpm)));

        let snap = relay.shutdown().await;
        let ch = &snap.channels[2];
        assert_eq!(ch.samples_accepted, 500);
        assert_eq!(ch.lifecycle, Lifecycle::Active);
        assert_eq!(snap.channels[0].samples_accepted, 0);
        assert_eq!(snap.dispatch.lanes[0].delivered, events.len() as u64);
    }

    #[tokio::test]
    async fn test_full_channel_queue_drops_batch() {
        let mut config = test_config();
        config.ingest.channel_queue = 1;
        let (relay, _rx) = relay_with_sink(&config);
        let hub = relay.hub();

        // Workers cannot run until this task yields
        let batches = pulse_batches(1);
        hub.handle(Inbound::Samples(batches[0].clone()), source());
        hub.handle(Inbound::Samples(batches[1].clone()), source());

        assert_eq!(hub.snapshot().channels[1].batches_dropped, 1);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_route_update_applied_and_invalid_ignored() {
        let (relay, _rx) = relay_with_sink(&test_config());
        let hub = relay.hub();
        let ch = ChannelId::new(5).unwrap();

        hub.handle(Inbound::Route { channel: ch, bank: 3, pan: 0.5 }, source());
        assert_eq!(hub.dispatcher().routing().get(ch), Some(RouteTarget { bank: 3, pan: 0.5 }));

        hub.handle(Inbound::Route { channel: ch, bank: 0, pan: 4.0 }, source());
        assert_eq!(hub.dispatcher().routing().get(ch), Some(RouteTarget { bank: 3, pan: 0.5 }));
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_upstream_beat_forwarded() {
        let (relay, mut rx) = relay_with_sink(&test_config());
        let hub = relay.hub();
        let now = SystemClock.now();
        let event = BeatEvent::from_rate(ChannelId::new(6).unwrap(), now, 64.0, 0.7).unwrap();
        hub.handle(Inbound::Beat(event), source());

        let (got, route) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, event);
        assert_eq!(route.bank, 2);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_datagrams_over_udp() {
        let (mut relay, _rx) = relay_with_sink(&test_config());
        let addr = relay.ingest_addr();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        sender
            .send_to(&encode_route(ChannelId::new(0).unwrap(), 7, 0.0), addr)
            .await
            .unwrap();
        sender.send_to(&OscMessage::new(ADMIN_STATS).encode(), addr).await.unwrap();

        let command = tokio::time::timeout(Duration::from_secs(1), relay.next_admin())
            .await
            .unwrap();
        assert_eq!(command, Some(AdminCommand::Stats));
        // Datagrams are handled in order, so the route is already in place
        let route = relay.hub().dispatcher().routing().get(ChannelId::new(0).unwrap());
        assert_eq!(route, Some(RouteTarget { bank: 7, pan: 0.0 }));

        let snap = relay.shutdown().await;
        assert_eq!(snap.receiver.accepted, 2);
    }

    #[tokio::test]
    async fn test_capture_written_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.capture.enabled = true;
        config.capture.directory = dir.path().to_path_buf();
        let (relay, _rx) = relay_with_sink(&config);
        let hub = relay.hub();
        for batch in pulse_batches(3).into_iter().take(3) {
            hub.handle(Inbound::Samples(batch), source());
        }
        let snapshot = relay.shutdown().await;
        // Counted after the writer thread drained its queue
        assert_eq!(snapshot.capture.unwrap().recorded, 3);

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().path()).collect();
        assert_eq!(files.len(), 1);
        let reader = CaptureReader::open(&files[0]).unwrap();
        assert_eq!(reader.header().channel.as_u8(), 3);
        let stamps: Vec<i32> = reader.map(|r| r.unwrap().timestamp_ms).collect();
        assert_eq!(stamps, vec![0, 100, 200]);
    }

    #[tokio::test]
    async fn test_capture_stops_off_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.capture.enabled = true;
        config.capture.directory = dir.path().to_path_buf();
        let (relay, _rx) = relay_with_sink(&config);
        let hub = relay.hub();
        for batch in pulse_batches(1).into_iter().take(4) {
            hub.handle(Inbound::Samples(batch), source());
        }

        let stopped = hub.stop_capture().await.unwrap();
        assert_eq!(stopped.recorded, 4);
        // Slot released: snapshots and later batches no longer see a recorder
        assert!(hub.snapshot().capture.is_none());
        hub.handle(Inbound::Samples(pulse_batches(1).remove(0)), source());
        assert!(hub.stop_capture().await.is_none());

        assert!(relay.shutdown().await.capture.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_serializes() {
        let (relay, _rx) = relay_with_sink(&test_config());
        let json = serde_json::to_value(relay.snapshot()).unwrap();
        assert_eq!(json["channels"].as_array().unwrap().len(), 8);
        assert_eq!(json["dispatch"]["lanes"][0]["name"], "test");
        assert!(json.get("capture").is_none());
        relay.shutdown().await;
    }
}
