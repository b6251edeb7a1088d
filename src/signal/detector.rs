//! Baseline-relative rising-edge beat detector

use super::{DetectionParams, Envelope};

/// Rising-edge detector with refractory enforcement
#[derive(Debug, Clone, PartialEq)]
pub struct BeatDetector {
    threshold_fraction: f64,
    refractory_s: f64,
    /// Whether the previous sample sat below its threshold
    previous_below: bool,
    last_beat: Option<f64>,
}

impl BeatDetector {
    pub fn new(params: &DetectionParams) -> Self {
        Self {
            threshold_fraction: params.threshold_fraction,
            refractory_s: params.refractory_period.as_secs_f64(),
            previous_below: false,
            last_beat: None,
        }
    }

    /// Threshold for the given envelope
    pub fn threshold(&self, envelope: &Envelope) -> f64 {
        envelope.min + self.threshold_fraction * envelope.range()
    }

    /// Feed one filtered sample.
    ///
    /// `envelope` is `None` when detection is suppressed (no baseline yet or
    /// the sensor is disconnected). A flat envelope never yields a beat.
    pub fn detect(&mut self, filtered: f64, now: f64, envelope: Option<Envelope>) -> bool {
        let envelope = match envelope {
            Some(env) if !env.is_flat() => env,
            _ => {
                self.previous_below = false;
                return false;
            }
        };

        let below = filtered < self.threshold(&envelope);
        let rising_edge = self.previous_below && !below;
        self.previous_below = below;

        if !rising_edge {
            return false;
        }

        if let Some(last) = self.last_beat {
            if now - last < self.refractory_s {
                tracing::trace!("Crossing ignored, {:.0}ms since last beat", (now - last) * 1000.0);
                return false;
            }
        }

        self.last_beat = Some(now);
        true
    }

    /// Timestamp of the last accepted crossing
    pub fn last_beat(&self) -> Option<f64> {
        self.last_beat
    }
}
