//! Synthetic pulse waveform
//!
//! Stands in for a sensor unit: a clean periodic wave in ADC units,
//! starting at its trough.

use std::f64::consts::PI;

use crate::constants::ADC_MAX;

/// Sinusoidal PPG-like waveform
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseWave {
    pub bpm: f64,
    pub baseline: f64,
    pub amplitude: f64,
}

impl PulseWave {
    pub fn new(bpm: f64) -> Self {
        Self {
            bpm,
            baseline: 2000.0,
            amplitude: 800.0,
        }
    }

    /// Raw reading `t` seconds after the wave started
    pub fn sample_at(&self, t: f64) -> i32 {
        let freq = self.bpm / 60.0;
        let value = self.baseline + self.amplitude * (2.0 * PI * freq * t - PI / 2.0).sin();
        (value.round() as i32).clamp(0, ADC_MAX)
    }

    /// `(timestamp_s, value)` pairs for `duration_s` seconds at `rate_hz`
    pub fn samples(&self, rate_hz: u32, duration_s: f64) -> impl Iterator<Item = (f64, i32)> + '_ {
        let interval = 1.0 / rate_hz as f64;
        let count = (duration_s * rate_hz as f64).round() as usize;
        (0..count).map(move |i| {
            let t = i as f64 * interval;
            (t, self.sample_at(t))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wave_starts_at_trough() {
        let wave = PulseWave::new(60.0);
        assert_eq!(wave.sample_at(0.0), 1200);
        assert_eq!(wave.sample_at(0.5), 2800);
    }

    #[test]
    fn test_sample_count() {
        let wave = PulseWave::new(75.0);
        assert_eq!(wave.samples(50, 10.0).count(), 500);
    }
}
