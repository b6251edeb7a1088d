//! Channel state machine
//!
//! ```text
//!   WARMUP --first beat (reference)--> ACTIVE
//!     ^                                  |
//!     +------- gap > gap_threshold ------+
//! ```
//!
//! Samples are validated against the last accepted producer timestamp:
//! anything older is rejected without touching state, and a jump forward
//! past the gap threshold throws the whole record away before the sample
//! is processed.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{BeatEvent, ChannelId, ChannelStats, EventPublisher, Sample};
use crate::error::IngestError;
use crate::signal::{BeatDetector, Connectivity, DetectionParams, SignalConditioner};

/// Lifecycle of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Lifecycle {
    /// No reference beat yet
    Warmup = 0,
    /// Intervals can be measured
    Active = 1,
}

impl Lifecycle {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Lifecycle::Active,
            _ => Lifecycle::Warmup,
        }
    }
}

/// Everything a channel remembers between samples
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelState {
    conditioner: SignalConditioner,
    detector: BeatDetector,
    last_beat_timestamp: Option<f64>,
    lifecycle: Lifecycle,
    last_accepted_timestamp: Option<f64>,
}

impl ChannelState {
    /// Fresh state, as after start-up or a gap reset
    pub fn new(params: &DetectionParams) -> Self {
        Self {
            conditioner: SignalConditioner::new(params),
            detector: BeatDetector::new(params),
            last_beat_timestamp: None,
            lifecycle: Lifecycle::Warmup,
            last_accepted_timestamp: None,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// True once a reference beat exists
    pub fn warmed_up(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }

    pub fn last_beat_timestamp(&self) -> Option<f64> {
        self.last_beat_timestamp
    }

    pub fn last_accepted_timestamp(&self) -> Option<f64> {
        self.last_accepted_timestamp
    }

    pub fn conditioner(&self) -> &SignalConditioner {
        &self.conditioner
    }
}

/// Noteworthy transitions, logged and counted by the channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChannelNotice {
    GapReset { gap_s: f64 },
    Disconnected,
    Reconnected,
}

/// One sensor channel: validation, detection and event publication
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    params: DetectionParams,
    state: ChannelState,
    publisher: EventPublisher,
    stats: Arc<ChannelStats>,
}

impl Channel {
    pub fn new(id: ChannelId, params: DetectionParams, publisher: EventPublisher) -> Self {
        Self::with_stats(id, params, publisher, Arc::new(ChannelStats::new()))
    }

    /// Create a channel reporting into existing counters
    pub fn with_stats(
        id: ChannelId,
        params: DetectionParams,
        publisher: EventPublisher,
        stats: Arc<ChannelStats>,
    ) -> Self {
        stats.set_lifecycle(Lifecycle::Warmup);
        Self {
            id,
            state: ChannelState::new(&params),
            params,
            publisher,
            stats,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    pub fn stats(&self) -> &Arc<ChannelStats> {
        &self.stats
    }

    /// Validate and process one sample.
    ///
    /// Returns the beat event produced by this sample, if any. An
    /// out-of-order sample is rejected and leaves the state untouched.
    pub fn ingest(&mut self, sample: &Sample) -> Result<Option<BeatEvent>, IngestError> {
        let ts = sample.timestamp;

        if !ts.is_finite() {
            ChannelStats::incr(&self.stats.out_of_order);
            warn!("Channel {}: non-finite sample timestamp {}", self.id, ts);
            return Err(IngestError::OutOfOrder {
                timestamp: ts,
                last_accepted: self.state.last_accepted_timestamp.unwrap_or(f64::NAN),
            });
        }

        if let Some(last) = self.state.last_accepted_timestamp {
            if ts < last {
                ChannelStats::incr(&self.stats.out_of_order);
                warn!(
                    "Channel {}: out-of-order sample {:.3}s (last accepted {:.3}s)",
                    self.id, ts, last
                );
                return Err(IngestError::OutOfOrder {
                    timestamp: ts,
                    last_accepted: last,
                });
            }

            let gap = ts - last;
            if gap > self.params.gap_threshold.as_secs_f64() {
                self.reset();
                self.note(ChannelNotice::GapReset { gap_s: gap });
            }
        }

        self.state.last_accepted_timestamp = Some(ts);
        ChannelStats::incr(&self.stats.samples_accepted);

        let filtered = self.state.conditioner.condition(sample.value);
        match self.state.conditioner.update_baseline(filtered, ts) {
            Some(Connectivity::Disconnected) => self.note(ChannelNotice::Disconnected),
            Some(Connectivity::Reconnected) => self.note(ChannelNotice::Reconnected),
            None => {}
        }

        let envelope = if self.state.conditioner.is_disconnected() {
            ChannelStats::incr(&self.stats.suppressed_samples);
            None
        } else {
            self.state.conditioner.envelope()
        };

        if !self.state.detector.detect(filtered, ts, envelope) {
            return Ok(None);
        }
        ChannelStats::incr(&self.stats.beats_detected);

        let last_beat = match (self.state.lifecycle, self.state.last_beat_timestamp) {
            (Lifecycle::Active, Some(last)) => last,
            _ => {
                self.state.last_beat_timestamp = Some(ts);
                self.state.lifecycle = Lifecycle::Active;
                self.stats.set_lifecycle(Lifecycle::Active);
                debug!("Channel {}: reference beat at {:.3}s", self.id, ts);
                return Ok(None);
            }
        };

        let ibi_ms = (ts - last_beat) * 1000.0;
        if ibi_ms < self.params.refractory_period.as_secs_f64() * 1000.0 {
            ChannelStats::incr(&self.stats.noise_rejected);
            debug!("Channel {}: {:.0}ms interval rejected as noise", self.id, ibi_ms);
            return Ok(None);
        }

        let event = self.publisher.publish(self.id, ibi_ms, sample.intensity);
        self.state.last_beat_timestamp = Some(ts);

        if let Some(ev) = &event {
            ChannelStats::incr(&self.stats.events_emitted);
            debug!(
                "Channel {}: beat {:.0}ms ({:.1} BPM)",
                self.id, ev.inter_beat_interval_ms, ev.rate_bpm
            );
        }
        Ok(event)
    }

    /// Discard all per-channel memory and return to warm-up
    pub fn reset(&mut self) {
        self.state = ChannelState::new(&self.params);
        self.stats.set_lifecycle(Lifecycle::Warmup);
        self.stats.set_disconnected(false);
    }

    fn note(&self, notice: ChannelNotice) {
        match notice {
            ChannelNotice::GapReset { gap_s } => {
                ChannelStats::incr(&self.stats.gap_resets);
                warn!("Channel {}: {:.0}ms gap, back to warm-up", self.id, gap_s * 1000.0);
            }
            ChannelNotice::Disconnected => {
                self.stats.set_disconnected(true);
                warn!("Channel {}: signal lost", self.id);
            }
            ChannelNotice::Reconnected => {
                self.stats.set_disconnected(false);
                info!("Channel {}: signal restored", self.id);
            }
        }
    }
}
