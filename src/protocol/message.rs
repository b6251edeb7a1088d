//! Typed relay messages
//!
//! Every datagram is checked in a fixed order and rejected at the first
//! failure: channel id, argument shape, timestamp sign, then staleness for
//! messages that carry wall-clock time. Ordering and gaps are left to the
//! channel itself.

use bytes::Bytes;
use std::sync::Arc;

use super::osc::{OscArg, OscMessage};
use crate::channel::{BeatEvent, ChannelId, Clock, Sample};
use crate::constants::{
    ADC_MAX, DEFAULT_BUNDLE_SIZE, DEFAULT_SAMPLE_RATE_HZ, FRESHNESS_WINDOW_MS, MAX_FUTURE_SKEW_MS,
};
use crate::error::MessageError;

pub const PPG_PREFIX: &str = "/ppg/";
pub const BEAT_PREFIX: &str = "/beat/";
pub const ROUTE_PREFIX: &str = "/route/";
pub const ADMIN_RESTART: &str = "/admin/restart";
pub const ADMIN_STATS: &str = "/admin/stats";

/// One sensor bundle: consecutive raw readings sharing a base timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBatch {
    pub channel: ChannelId,
    /// Producer clock of the first reading, milliseconds
    pub timestamp_ms: i64,
    pub values: Vec<i32>,
    /// Spacing between readings, milliseconds
    pub interval_ms: f64,
}

impl SampleBatch {
    /// Expand into individually timestamped samples
    pub fn samples(&self) -> impl Iterator<Item = Sample> + '_ {
        self.values.iter().enumerate().map(move |(k, value)| {
            let ts_ms = self.timestamp_ms as f64 + k as f64 * self.interval_ms;
            Sample::new(self.channel, *value as f64, ts_ms / 1000.0)
        })
    }

    /// Encode as an ingest message
    ///
    /// Timestamps past `i32::MAX` ms go out as a 64-bit `h` argument.
    pub fn encode(&self) -> Bytes {
        let timestamp = i32::try_from(self.timestamp_ms)
            .map(OscArg::Int)
            .unwrap_or(OscArg::Long(self.timestamp_ms));
        let msg = self
            .values
            .iter()
            .fold(OscMessage::new(format!("{PPG_PREFIX}{}", self.channel)), |m, v| {
                m.with_arg(OscArg::Int(*v))
            })
            .with_arg(timestamp);
        msg.encode()
    }
}

/// Commands addressed to the relay process itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCommand {
    Restart,
    Stats,
}

/// A decoded, validated inbound datagram
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Samples(SampleBatch),
    /// A beat detected upstream, forwarded without local detection
    Beat(BeatEvent),
    Route { channel: ChannelId, bank: u8, pan: f32 },
    Admin(AdminCommand),
}

/// Encode a beat for downstream consumers: `[timestamp_s, bpm, intensity]`
pub fn encode_beat(event: &BeatEvent) -> Bytes {
    OscMessage::new(format!("{BEAT_PREFIX}{}", event.channel))
        .with_arg(OscArg::Double(event.timestamp))
        .with_arg(OscArg::Float(event.rate_bpm as f32))
        .with_arg(OscArg::Float(event.intensity))
        .encode()
}

/// Encode a routing update
pub fn encode_route(channel: ChannelId, bank: u8, pan: f32) -> Bytes {
    OscMessage::new(format!("{ROUTE_PREFIX}{channel}"))
        .with_arg(OscArg::Int(bank as i32))
        .with_arg(OscArg::Float(pan))
        .encode()
}

/// Datagram decoder with the relay's shape and freshness rules
#[derive(Debug, Clone)]
pub struct MessageDecoder {
    bundle_size: usize,
    adc_max: i32,
    interval_ms: f64,
    freshness_window_ms: f64,
    clock: Arc<dyn Clock>,
}

impl MessageDecoder {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            bundle_size: DEFAULT_BUNDLE_SIZE,
            adc_max: ADC_MAX,
            interval_ms: 1000.0 / DEFAULT_SAMPLE_RATE_HZ as f64,
            freshness_window_ms: FRESHNESS_WINDOW_MS as f64,
            clock,
        }
    }

    pub fn with_bundle_size(mut self, bundle_size: usize) -> Self {
        self.bundle_size = bundle_size;
        self
    }

    pub fn with_sample_rate(mut self, rate_hz: u32) -> Self {
        self.interval_ms = 1000.0 / rate_hz.max(1) as f64;
        self
    }

    pub fn with_adc_max(mut self, adc_max: i32) -> Self {
        self.adc_max = adc_max;
        self
    }

    pub fn with_freshness_window_ms(mut self, window_ms: u64) -> Self {
        self.freshness_window_ms = window_ms as f64;
        self
    }

    pub fn decode(&self, datagram: &[u8]) -> Result<Inbound, MessageError> {
        let msg = OscMessage::decode(datagram)?;
        let address = msg.address.as_str();

        match address {
            ADMIN_RESTART => return Ok(Inbound::Admin(AdminCommand::Restart)),
            ADMIN_STATS => return Ok(Inbound::Admin(AdminCommand::Stats)),
            _ => {}
        }

        if let Some(id) = address.strip_prefix(PPG_PREFIX) {
            let channel = parse_channel(id)?;
            self.decode_samples(channel, &msg.args)
        } else if let Some(id) = address.strip_prefix(BEAT_PREFIX) {
            let channel = parse_channel(id)?;
            self.decode_beat(channel, &msg.args)
        } else if let Some(id) = address.strip_prefix(ROUTE_PREFIX) {
            let channel = parse_channel(id)?;
            decode_route(channel, &msg.args)
        } else {
            Err(MessageError::UnknownAddress(address.to_owned()))
        }
    }

    fn decode_samples(&self, channel: ChannelId, args: &[OscArg]) -> Result<Inbound, MessageError> {
        if args.len() != self.bundle_size + 1 {
            return Err(MessageError::Malformed(format!(
                "expected {} arguments, got {}",
                self.bundle_size + 1,
                args.len()
            )));
        }

        let int = |a: &OscArg| {
            a.as_int()
                .ok_or_else(|| MessageError::Malformed(format!("expected int, got '{}'", a.tag() as char)))
        };
        let (readings, timestamp) = args.split_at(self.bundle_size);
        let values = readings
            .iter()
            .map(|a| {
                let v = int(a)?;
                if !(0..=self.adc_max as i64).contains(&v) {
                    return Err(MessageError::Malformed(format!("sample {v} outside 0..={}", self.adc_max)));
                }
                Ok(v as i32)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let timestamp_ms = int(&timestamp[0])?;

        if timestamp_ms < 0 {
            return Err(MessageError::NegativeTimestamp(timestamp_ms as f64 / 1000.0));
        }

        Ok(Inbound::Samples(SampleBatch {
            channel,
            timestamp_ms,
            values,
            interval_ms: self.interval_ms,
        }))
    }

    fn decode_beat(&self, channel: ChannelId, args: &[OscArg]) -> Result<Inbound, MessageError> {
        let [ts, bpm, intensity] = args else {
            return Err(MessageError::Malformed(format!("beat expects 3 arguments, got {}", args.len())));
        };
        let float = |a: &OscArg| {
            a.as_float()
                .ok_or_else(|| MessageError::Malformed(format!("expected float, got '{}'", a.tag() as char)))
        };
        let (timestamp, bpm, intensity) = (float(ts)?, float(bpm)?, float(intensity)?);

        if !timestamp.is_finite() || !intensity.is_finite() {
            return Err(MessageError::Malformed(format!(
                "non-finite beat field (timestamp {timestamp}, intensity {intensity})"
            )));
        }
        if timestamp < 0.0 {
            return Err(MessageError::NegativeTimestamp(timestamp));
        }

        let age_ms = (self.clock.now() - timestamp) * 1000.0;
        if age_ms < -(MAX_FUTURE_SKEW_MS as f64) {
            return Err(MessageError::Malformed(format!("beat timestamp {:.0} ms ahead of clock", -age_ms)));
        }
        if age_ms >= self.freshness_window_ms {
            return Err(MessageError::Stale { age_ms });
        }

        BeatEvent::from_rate(channel, timestamp, bpm, intensity as f32)
            .map(Inbound::Beat)
            .ok_or_else(|| MessageError::Malformed(format!("invalid rate {bpm}")))
    }
}

fn decode_route(channel: ChannelId, args: &[OscArg]) -> Result<Inbound, MessageError> {
    let [bank, pan] = args else {
        return Err(MessageError::Malformed(format!("route expects 2 arguments, got {}", args.len())));
    };
    let bank = bank
        .as_int()
        .and_then(|b| u8::try_from(b).ok())
        .ok_or_else(|| MessageError::Malformed("route bank must be an int in 0..=255".into()))?;
    let pan = pan
        .as_float()
        .ok_or_else(|| MessageError::Malformed("route pan must be a float".into()))?;
    Ok(Inbound::Route {
        channel,
        bank,
        pan: pan as f32,
    })
}

fn parse_channel(id: &str) -> Result<ChannelId, MessageError> {
    let raw: i64 = id
        .parse()
        .map_err(|_| MessageError::UnknownAddress(id.to_owned()))?;
    ChannelId::try_from(raw)
}
