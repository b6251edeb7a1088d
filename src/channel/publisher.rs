//! Canonical beat events
//!
//! Intervals are measured on the producer's clock; the published timestamp
//! is wall-clock time at detection so consumers can judge freshness.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use super::ChannelId;
use crate::constants::DEFAULT_INTENSITY;

/// Source of wall-clock time, seconds since the Unix epoch
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> f64;
}

/// Wall clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// Hand-driven clock for replays and tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: f64) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, seconds: f64) {
        *self.now.lock() += seconds;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}

/// A validated, immutable beat
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BeatEvent {
    pub channel: ChannelId,
    /// Wall-clock seconds since the Unix epoch at detection
    pub timestamp: f64,
    pub inter_beat_interval_ms: f64,
    pub rate_bpm: f64,
    pub intensity: f32,
}

impl BeatEvent {
    /// Build an event from an inter-beat interval.
    ///
    /// Returns `None` unless the interval is finite and strictly positive.
    pub fn from_interval(
        channel: ChannelId,
        timestamp: f64,
        inter_beat_interval_ms: f64,
        intensity: f32,
    ) -> Option<Self> {
        if !inter_beat_interval_ms.is_finite() || inter_beat_interval_ms <= 0.0 {
            return None;
        }
        Some(Self {
            channel,
            timestamp,
            inter_beat_interval_ms,
            rate_bpm: 60_000.0 / inter_beat_interval_ms,
            intensity: intensity.clamp(0.0, 1.0),
        })
    }

    /// Build an event from a rate, as carried on the wire
    pub fn from_rate(channel: ChannelId, timestamp: f64, rate_bpm: f64, intensity: f32) -> Option<Self> {
        if !rate_bpm.is_finite() || rate_bpm <= 0.0 {
            return None;
        }
        Self::from_interval(channel, timestamp, 60_000.0 / rate_bpm, intensity)
    }

    /// Age of the event at wall-clock time `now`, in milliseconds
    pub fn age_ms(&self, now: f64) -> f64 {
        (now - self.timestamp) * 1000.0
    }
}

/// Turns accepted beat transitions into [`BeatEvent`]s
#[derive(Debug, Clone)]
pub struct EventPublisher {
    clock: Arc<dyn Clock>,
}

impl EventPublisher {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn publish(
        &self,
        channel: ChannelId,
        inter_beat_interval_ms: f64,
        intensity: Option<f32>,
    ) -> Option<BeatEvent> {
        BeatEvent::from_interval(
            channel,
            self.clock.now(),
            inter_beat_interval_ms,
            intensity.unwrap_or(DEFAULT_INTENSITY),
        )
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch(id: u8) -> ChannelId {
        ChannelId::new(id).unwrap()
    }

    #[test]
    fn test_rate_derived_from_interval() {
        let ev = BeatEvent::from_interval(ch(0), 10.0, 800.0, 0.5).unwrap();
        assert!((ev.rate_bpm - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_non_positive_interval_rejected() {
        assert!(BeatEvent::from_interval(ch(0), 10.0, 0.0, 0.0).is_none());
        assert!(BeatEvent::from_interval(ch(0), 10.0, -5.0, 0.0).is_none());
        assert!(BeatEvent::from_rate(ch(0), 10.0, 0.0, 0.0).is_none());
    }

    #[test]
    fn test_publisher_uses_clock_and_default_intensity() {
        let clock = Arc::new(ManualClock::new(1_700_000_000.25));
        let publisher = EventPublisher::new(clock.clone());
        let ev = publisher.publish(ch(2), 1000.0, None).unwrap();
        assert_eq!(ev.timestamp, 1_700_000_000.25);
        assert_eq!(ev.intensity, DEFAULT_INTENSITY);

        clock.advance(1.0);
        let ev = publisher.publish(ch(2), 1000.0, Some(3.0)).unwrap();
        assert_eq!(ev.timestamp, 1_700_000_001.25);
        assert_eq!(ev.intensity, 1.0);
    }

    #[test]
    fn test_age() {
        let ev = BeatEvent::from_interval(ch(1), 100.0, 800.0, 0.0).unwrap();
        assert!((ev.age_ms(100.5) - 500.0).abs() < 1e-6);
    }
}
