//! Moving-average filter and adaptive baseline envelope
//!
//! The envelope tracks the running min/max of the filtered signal. Every
//! `baseline_decay_interval` samples both bounds are pulled toward the
//! current value, so a slowly drifting DC offset cannot pin the threshold.

use super::DetectionParams;

/// Current baseline envelope of a channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    pub min: f64,
    pub max: f64,
}

impl Envelope {
    /// Width of the envelope
    pub fn range(&self) -> f64 {
        self.max - self.min
    }

    /// True when the envelope carries no usable amplitude
    pub fn is_flat(&self) -> bool {
        self.max <= self.min
    }
}

/// Connectivity transition reported by [`SignalConditioner::update_baseline`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Disconnected,
    Reconnected,
}

/// Per-channel signal conditioner
#[derive(Debug, Clone, PartialEq)]
pub struct SignalConditioner {
    /// Circular buffer of recent raw values
    window: Vec<f64>,
    /// Number of valid slots in `window`
    filled: usize,
    /// Next slot to overwrite
    next: usize,
    envelope: Option<Envelope>,
    samples_since_decay: u32,
    /// Producer time at which the envelope first became too narrow
    narrow_since: Option<f64>,
    disconnected: bool,
    decay_rate: f64,
    decay_interval: u32,
    min_signal_range: f64,
    disconnect_timeout_s: f64,
}

impl SignalConditioner {
    /// Create a cold conditioner
    pub fn new(params: &DetectionParams) -> Self {
        let size = params.moving_average_window.max(1);
        Self {
            window: vec![0.0; size],
            filled: 0,
            next: 0,
            envelope: None,
            samples_since_decay: 0,
            narrow_since: None,
            disconnected: false,
            decay_rate: params.baseline_decay_rate,
            decay_interval: params.baseline_decay_interval.max(1),
            min_signal_range: params.min_signal_range,
            disconnect_timeout_s: params.disconnect_timeout.as_secs_f64(),
        }
    }

    /// Push a raw value and return the mean of the filter window
    pub fn condition(&mut self, raw: f64) -> f64 {
        self.window[self.next] = raw;
        self.next = (self.next + 1) % self.window.len();
        if self.filled < self.window.len() {
            self.filled += 1;
        }

        let sum: f64 = if self.filled == self.window.len() {
            self.window.iter().sum()
        } else {
            // Slots fill from index 0 until the first wrap
            self.window[..self.filled].iter().sum()
        };
        sum / self.filled as f64
    }

    /// Fold a filtered value into the envelope and re-evaluate connectivity.
    ///
    /// Returns a transition when the channel just lost or regained its signal.
    pub fn update_baseline(&mut self, filtered: f64, now: f64) -> Option<Connectivity> {
        let envelope = self.envelope.get_or_insert(Envelope {
            min: filtered,
            max: filtered,
        });
        envelope.min = envelope.min.min(filtered);
        envelope.max = envelope.max.max(filtered);

        self.samples_since_decay += 1;
        if self.samples_since_decay >= self.decay_interval {
            envelope.min += self.decay_rate * (filtered - envelope.min);
            envelope.max += self.decay_rate * (filtered - envelope.max);
            self.samples_since_decay = 0;
        }

        let narrow = envelope.range() < self.min_signal_range;
        if !narrow {
            self.narrow_since = None;
            if self.disconnected {
                // Bounds left over from the flat stretch would skew the threshold
                *envelope = Envelope {
                    min: filtered,
                    max: filtered,
                };
                self.disconnected = false;
                return Some(Connectivity::Reconnected);
            }
            return None;
        }

        let since = *self.narrow_since.get_or_insert(now);
        if !self.disconnected && now - since > self.disconnect_timeout_s {
            self.disconnected = true;
            return Some(Connectivity::Disconnected);
        }
        None
    }

    /// Current envelope, if at least one sample has been seen
    pub fn envelope(&self) -> Option<Envelope> {
        self.envelope
    }

    /// True while the signal is considered absent
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Number of raw values currently held by the filter
    pub fn buffered(&self) -> usize {
        self.filled
    }
}
