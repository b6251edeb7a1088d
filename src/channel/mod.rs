//! Per-channel ingest validation and beat lifecycle
//!
//! Each sensor id owns exactly one [`Channel`]. Nothing in here is shared
//! between channels; the only outward surfaces are the published
//! [`BeatEvent`]s and the atomic [`ChannelStats`] counters.

pub mod publisher;
pub mod state;
pub mod stats;

pub use publisher::{BeatEvent, Clock, EventPublisher, ManualClock, SystemClock};
pub use state::{Channel, ChannelNotice, ChannelState, Lifecycle};
pub use stats::{ChannelSnapshot, ChannelStats};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::{MAX_CHANNELS, PHYSICAL_CHANNELS};
use crate::error::MessageError;

/// Validated channel identifier.
///
/// Ids `0..PHYSICAL_CHANNELS` are physical sensors; the rest up to
/// `MAX_CHANNELS` are virtual channels fed by aliasing or replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ChannelId(u8);

impl ChannelId {
    /// Create a channel id, `None` when out of range
    pub fn new(id: u8) -> Option<Self> {
        ((id as usize) < MAX_CHANNELS).then_some(Self(id))
    }

    /// All valid channel ids in ascending order
    pub fn all() -> impl Iterator<Item = ChannelId> {
        (0..MAX_CHANNELS as u8).map(ChannelId)
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// Position in per-channel tables
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_virtual(self) -> bool {
        self.index() >= PHYSICAL_CHANNELS
    }

    /// Physical sensor this channel mirrors (identity for physical ids)
    pub fn physical(self) -> ChannelId {
        Self(self.0 % PHYSICAL_CHANNELS as u8)
    }
}

impl TryFrom<i64> for ChannelId {
    type Error = MessageError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .ok()
            .and_then(ChannelId::new)
            .ok_or(MessageError::UnknownChannel(value))
    }
}

impl TryFrom<u8> for ChannelId {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        ChannelId::new(value).ok_or(MessageError::UnknownChannel(value as i64))
    }
}

impl From<ChannelId> for u8 {
    fn from(id: ChannelId) -> Self {
        id.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One raw, producer-timestamped reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub channel: ChannelId,
    pub value: f64,
    /// Producer clock, seconds
    pub timestamp: f64,
    /// Signal strength in `[0, 1]` when the sensor reports one
    pub intensity: Option<f32>,
}

impl Sample {
    pub fn new(channel: ChannelId, value: f64, timestamp: f64) -> Self {
        Self {
            channel,
            value,
            timestamp,
            intensity: None,
        }
    }
}
