//! Signal conditioning and beat detection
//!
//! Pure, per-channel DSP: no clocks, no I/O. Time is always the
//! producer's sample timestamp in seconds.

pub mod conditioner;
pub mod detector;
pub mod synth;

pub use conditioner::{Connectivity, Envelope, SignalConditioner};
pub use detector::BeatDetector;
pub use synth::PulseWave;

use std::time::Duration;

/// Tunables for the whole per-channel detection path
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    /// Moving-average window (samples)
    pub moving_average_window: usize,
    /// Fraction of the distance to the current value the baseline moves per decay step
    pub baseline_decay_rate: f64,
    /// Samples between baseline decay steps
    pub baseline_decay_interval: u32,
    /// Threshold position between baseline min (0.0) and max (1.0)
    pub threshold_fraction: f64,
    /// Minimum envelope width (raw units) for a connected sensor
    pub min_signal_range: f64,
    /// How long the envelope may stay narrower than `min_signal_range`
    pub disconnect_timeout: Duration,
    /// Minimum spacing between two accepted beats
    pub refractory_period: Duration,
    /// Silence longer than this resets the channel to warm-up
    pub gap_threshold: Duration,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            moving_average_window: 5,
            baseline_decay_rate: 0.1,
            baseline_decay_interval: 150,
            threshold_fraction: 0.6,
            min_signal_range: 50.0,
            disconnect_timeout: Duration::from_millis(1000),
            refractory_period: Duration::from_millis(300),
            gap_threshold: Duration::from_millis(1000),
        }
    }
}
