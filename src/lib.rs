//! # Pulse Relay
//!
//! Real-time heartbeat detection for multiple PPG sensors, with fan-out of
//! the detected beats to independent sound and lighting consumers over UDP.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐
//! │ Sensor 0 │ │ Sensor 1 │ │ Sensor 2 │ │ Sensor 3 │   /ppg/N  [s0..s4, ts_ms]
//! └────┬─────┘ └────┬─────┘ └────┬─────┘ └────┬─────┘
//!      └────────────┴─────┬──────┴────────────┘          UDP (at-most-once)
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │           Ingest Receiver (network::receiver) - Single Socket       │
//! │   decode → channel id → arg shape → timestamp → per-channel queue   │
//! └─────────────────────────────────────────────────────────────────────┘
//!        │              │              │              │
//!        ▼              ▼              ▼              ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                 Channel Workers (relay::worker)                   │
//! │  ┌────────────┐ ┌────────────┐ ┌────────────┐ ┌────────────┐     │
//! │  │ order/gap  │ │ order/gap  │ │ order/gap  │ │ order/gap  │     │
//! │  │ conditioner│ │ conditioner│ │ conditioner│ │ conditioner│     │
//! │  │ detector   │ │ detector   │ │ detector   │ │ detector   │     │
//! │  │ WARMUP→ACT │ │ WARMUP→ACT │ │ WARMUP→ACT │ │ WARMUP→ACT │     │
//! │  └─────┬──────┘ └─────┬──────┘ └─────┬──────┘ └─────┬──────┘     │
//! └────────┼──────────────┼──────────────┼──────────────┼────────────┘
//!          └──────────────┴──────┬───────┴──────────────┘   BeatEvent
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │       Dispatcher (dispatch::dispatcher) - routing table lookup      │
//! └─────────────────────────────────────────────────────────────────────┘
//!        │                       │                       │
//!        ▼                       ▼                       ▼
//! ┌─────────────┐         ┌─────────────┐         ┌─────────────┐
//! │ Lane queue  │         │ Lane queue  │         │ Lane queue  │  drop-oldest
//! │ freshness   │         │ freshness   │         │ freshness   │  < 500 ms
//! │ Sound sink  │         │ Light sink  │         │  Log sink   │
//! └─────────────┘         └─────────────┘         └─────────────┘
//! ```

pub mod api;
pub mod capture;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod network;
pub mod protocol;
pub mod relay;
pub mod signal;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Number of addressable channels (0-3 physical sensors, 4-7 virtual)
    pub const MAX_CHANNELS: usize = 8;

    /// Number of physical sensor units
    pub const PHYSICAL_CHANNELS: usize = 4;

    /// Nominal sensor sampling rate
    pub const DEFAULT_SAMPLE_RATE_HZ: u32 = 50;

    /// Samples carried by one ingest message
    pub const DEFAULT_BUNDLE_SIZE: usize = 5;

    /// Largest raw value a 12-bit ADC can report
    pub const ADC_MAX: i32 = 4095;

    /// Default UDP port for sensor ingest
    pub const DEFAULT_INGEST_PORT: u16 = 8000;

    /// Default UDP port for beat output to the sound engine
    pub const DEFAULT_AUDIO_PORT: u16 = 8001;

    /// Default UDP port for beat output to the lighting controller
    pub const DEFAULT_LIGHTING_PORT: u16 = 8002;

    /// Default HTTP port for the status API
    pub const DEFAULT_HTTP_PORT: u16 = 8080;

    /// Maximum datagram size accepted by the receiver
    pub const MAX_PACKET_SIZE: usize = 1472; // MTU - IP/UDP headers

    /// Events older than this at a consumer lane are dropped
    pub const FRESHNESS_WINDOW_MS: u64 = 500;

    /// How far ahead of the local clock a beat timestamp may be
    pub const MAX_FUTURE_SKEW_MS: u64 = 200;

    /// Default per-lane queue capacity (events)
    pub const DEFAULT_LANE_CAPACITY: usize = 64;

    /// Default per-channel ingest queue capacity (sample batches)
    pub const DEFAULT_CHANNEL_QUEUE: usize = 256;

    /// Intensity published when the sensor does not provide one
    pub const DEFAULT_INTENSITY: f32 = 0.0;
}
