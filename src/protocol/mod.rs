//! Datagram wire protocol
//!
//! OSC 1.0 messages over UDP. `/ppg/{id}` carries raw sensor bundles in,
//! `/beat/{id}` carries validated beats out, `/route/{id}` and `/admin/*`
//! control the relay.

pub mod message;
pub mod osc;

pub use message::{
    encode_beat, encode_route, AdminCommand, Inbound, MessageDecoder, SampleBatch, ADMIN_RESTART, ADMIN_STATS,
    BEAT_PREFIX, PPG_PREFIX, ROUTE_PREFIX,
};
pub use osc::{OscArg, OscMessage};
