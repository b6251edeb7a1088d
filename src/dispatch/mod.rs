//! Event distribution
//!
//! The dispatcher resolves a beat's route and queues it on every lane
//! whose bank filter matches. Lanes run independently: each has its own
//! bounded queue, freshness check and failure policy.

pub mod dispatcher;
pub mod lane;
pub mod queue;
pub mod routing;
pub mod sinks;

pub use dispatcher::{DispatchSnapshot, Dispatcher};
pub use lane::{BeatSink, LaneConfig, LaneHandle, LaneSnapshot, LaneState};
pub use queue::{Delivery, LaneQueue};
pub use routing::{RouteTarget, RoutingEntry, RoutingTable, DEFAULT_PANS};
pub use sinks::{LogSink, MpscSink, UdpSink};
