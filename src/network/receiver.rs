//! Ingest receive loop
//!
//! One task reads datagrams, decodes and validates them, and hands the
//! typed result to an [`InboundHandler`]. Invalid datagrams are dropped
//! and counted here; nothing downstream ever sees them.

use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::constants::MAX_PACKET_SIZE;
use crate::error::MessageError;
use crate::protocol::{Inbound, MessageDecoder};

/// Consumer of validated datagrams
pub trait InboundHandler: Send + Sync + 'static {
    fn handle(&self, inbound: Inbound, source: SocketAddr);
}

/// Receiver counters
#[derive(Debug, Default)]
pub struct ReceiverStats {
    pub packets_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub accepted: AtomicU64,
    pub malformed: AtomicU64,
    pub unknown_channel: AtomicU64,
    pub unknown_address: AtomicU64,
    pub negative_timestamp: AtomicU64,
    pub stale: AtomicU64,
    pub oversized: AtomicU64,
    pub receive_errors: AtomicU64,
}

/// Point-in-time copy of [`ReceiverStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReceiverSnapshot {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub accepted: u64,
    pub malformed: u64,
    pub unknown_channel: u64,
    pub unknown_address: u64,
    pub negative_timestamp: u64,
    pub stale: u64,
    pub oversized: u64,
    pub receive_errors: u64,
}

impl ReceiverStats {
    pub fn snapshot(&self) -> ReceiverSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ReceiverSnapshot {
            packets_received: load(&self.packets_received),
            bytes_received: load(&self.bytes_received),
            accepted: load(&self.accepted),
            malformed: load(&self.malformed),
            unknown_channel: load(&self.unknown_channel),
            unknown_address: load(&self.unknown_address),
            negative_timestamp: load(&self.negative_timestamp),
            stale: load(&self.stale),
            oversized: load(&self.oversized),
            receive_errors: load(&self.receive_errors),
        }
    }

    fn count_rejection(&self, err: &MessageError) {
        let counter = match err {
            MessageError::Malformed(_) => &self.malformed,
            MessageError::UnknownChannel(_) => &self.unknown_channel,
            MessageError::UnknownAddress(_) => &self.unknown_address,
            MessageError::NegativeTimestamp(_) => &self.negative_timestamp,
            MessageError::Stale { .. } => &self.stale,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Datagram receiver bound to the ingest socket
pub struct IngestReceiver<H> {
    socket: UdpSocket,
    decoder: MessageDecoder,
    handler: Arc<H>,
    stats: Arc<ReceiverStats>,
}

impl<H: InboundHandler> IngestReceiver<H> {
    pub fn new(socket: UdpSocket, decoder: MessageDecoder, handler: Arc<H>) -> Self {
        Self::with_stats(socket, decoder, handler, Arc::new(ReceiverStats::default()))
    }

    /// Create a receiver reporting into existing counters
    pub fn with_stats(
        socket: UdpSocket,
        decoder: MessageDecoder,
        handler: Arc<H>,
        stats: Arc<ReceiverStats>,
    ) -> Self {
        Self {
            socket,
            decoder,
            handler,
            stats,
        }
    }

    pub fn stats(&self) -> Arc<ReceiverStats> {
        self.stats.clone()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive until the shutdown signal flips to `true`
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        // One spare byte detects datagrams over the limit
        let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];
        if let Ok(addr) = self.socket.local_addr() {
            info!("Listening for sensor data on {}", addr);
        }

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, source)) => self.process(&buf[..len], source),
                    Err(e) => {
                        self.stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                        warn!("Receive error: {}", e);
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Ingest receiver stopped");
    }

    /// Validate one datagram and pass it on
    pub fn process(&self, datagram: &[u8], source: SocketAddr) {
        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_received
            .fetch_add(datagram.len() as u64, Ordering::Relaxed);

        if datagram.len() > MAX_PACKET_SIZE {
            self.stats.oversized.fetch_add(1, Ordering::Relaxed);
            warn!("Dropped oversized datagram from {}", source);
            return;
        }

        match self.decoder.decode(datagram) {
            Ok(inbound) => {
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                self.handler.handle(inbound, source);
            }
            Err(e @ MessageError::Stale { .. }) => {
                self.stats.count_rejection(&e);
                debug!("Dropped datagram from {}: {}", source, e);
            }
            Err(e) => {
                self.stats.count_rejection(&e);
                warn!("Dropped datagram from {}: {}", source, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ManualClock;
    use crate::protocol::{OscArg, OscMessage};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Inbound>>);

    impl InboundHandler for Collect {
        fn handle(&self, inbound: Inbound, _source: SocketAddr) {
            self.0.lock().push(inbound);
        }
    }

    async fn receiver() -> (IngestReceiver<Collect>, Arc<Collect>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let handler = Arc::new(Collect::default());
        let decoder = MessageDecoder::new(Arc::new(ManualClock::new(1_700_000_000.0)));
        (IngestReceiver::new(socket, decoder, handler.clone()), handler)
    }

    fn source() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    fn ppg(id: i32) -> Vec<u8> {
        (0..5)
            .fold(OscMessage::new(format!("/ppg/{id}")), |m, v| m.with_arg(OscArg::Int(2000 + v)))
            .with_arg(OscArg::Int(0))
            .encode()
            .to_vec()
    }

    #[tokio::test]
    async fn test_rejections_counted_by_kind() {
        let (rx, handler) = receiver().await;
        rx.process(&ppg(1), source());
        rx.process(&ppg(12), source());
        rx.process(b"garbage", source());
        rx.process(&OscMessage::new("/nope").encode(), source());
        let four_args = OscMessage::new("/beat/0")
            .with_arg(OscArg::Double(1_700_000_000.0))
            .with_arg(OscArg::Float(60.0))
            .with_arg(OscArg::Float(0.0))
            .with_arg(OscArg::Float(0.0))
            .encode();
        rx.process(&four_args, source());
        rx.process(&vec![0u8; MAX_PACKET_SIZE + 1], source());

        let stats = rx.stats().snapshot();
        assert_eq!(stats.packets_received, 6);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.unknown_channel, 1);
        assert_eq!(stats.malformed, 2);
        assert_eq!(stats.unknown_address, 1);
        assert_eq!(stats.oversized, 1);
        assert_eq!(handler.0.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_run_loop_receives_and_stops() {
        let (rx, handler) = receiver().await;
        let addr = rx.local_addr().unwrap();
        let stats = rx.stats();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(rx.run(shutdown_rx));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for id in 0..3 {
            sender.send_to(&ppg(id), addr).await.unwrap();
        }
        for _ in 0..50 {
            if stats.snapshot().accepted == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handler.0.lock().len(), 3);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
