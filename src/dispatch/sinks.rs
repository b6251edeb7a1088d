//! Built-in sinks

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::info;

use super::lane::BeatSink;
use super::RouteTarget;
use crate::channel::BeatEvent;
use crate::error::SinkError;
use crate::protocol::encode_beat;

/// Sends `/beat/{id}` datagrams to a downstream consumer
#[derive(Debug, Clone)]
pub struct UdpSink {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
}

impl UdpSink {
    pub fn new(socket: Arc<UdpSocket>, target: SocketAddr) -> Self {
        Self { socket, target }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

impl BeatSink for UdpSink {
    async fn deliver(&mut self, event: &BeatEvent, _route: &RouteTarget) -> Result<(), SinkError> {
        let datagram = encode_beat(event);
        let sent = self.socket.send_to(&datagram, self.target).await?;
        if sent != datagram.len() {
            return Err(SinkError::SendFailed(format!(
                "short send to {}: {} of {} bytes",
                self.target,
                sent,
                datagram.len()
            )));
        }
        Ok(())
    }
}

/// Logs every beat
#[derive(Debug, Clone, Default)]
pub struct LogSink;

impl BeatSink for LogSink {
    async fn deliver(&mut self, event: &BeatEvent, route: &RouteTarget) -> Result<(), SinkError> {
        info!(
            channel = event.channel.as_u8(),
            bank = route.bank,
            pan = route.pan,
            "beat {:.1} BPM ({:.0}ms)",
            event.rate_bpm,
            event.inter_beat_interval_ms
        );
        Ok(())
    }
}

/// Forwards beats into an in-process channel
#[derive(Debug, Clone)]
pub struct MpscSink {
    tx: mpsc::Sender<(BeatEvent, RouteTarget)>,
}

impl MpscSink {
    pub fn new(tx: mpsc::Sender<(BeatEvent, RouteTarget)>) -> Self {
        Self { tx }
    }

    /// Sink plus its receiving end
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<(BeatEvent, RouteTarget)>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

impl BeatSink for MpscSink {
    async fn deliver(&mut self, event: &BeatEvent, route: &RouteTarget) -> Result<(), SinkError> {
        self.tx.send((*event, *route)).await.map_err(|_| SinkError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelId;
    use crate::protocol::{Inbound, MessageDecoder};
    use crate::channel::ManualClock;

    fn event(ts: f64) -> BeatEvent {
        BeatEvent::from_interval(ChannelId::new(1).unwrap(), ts, 750.0, 0.25).unwrap()
    }

    const ROUTE: RouteTarget = RouteTarget { bank: 1, pan: -0.33 };

    #[tokio::test]
    async fn test_udp_sink_sends_beat_message() {
        let rx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tx = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let mut sink = UdpSink::new(tx, rx.local_addr().unwrap());

        sink.deliver(&event(1_000.0), &ROUTE).await.unwrap();

        let mut buf = [0u8; 256];
        let (n, _) = rx.recv_from(&mut buf).await.unwrap();
        let decoder = MessageDecoder::new(Arc::new(ManualClock::new(1_000.1)));
        let Inbound::Beat(beat) = decoder.decode(&buf[..n]).unwrap() else {
            panic!("expected a beat")
        };
        assert_eq!(beat.channel.as_u8(), 1);
        assert!((beat.rate_bpm - 80.0).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_mpsc_sink_closed() {
        let (mut sink, rx) = MpscSink::channel(1);
        sink.deliver(&event(0.0), &ROUTE).await.unwrap();
        drop(rx);
        assert!(matches!(sink.deliver(&event(0.0), &ROUTE).await, Err(SinkError::Closed)));
    }

    #[tokio::test]
    async fn test_log_sink_never_fails() {
        assert!(LogSink.deliver(&event(0.0), &ROUTE).await.is_ok());
    }
}
