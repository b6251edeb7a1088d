//! Error types for the pulse relay

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inbound message validation errors.
///
/// Every variant is recovered by dropping the message and bumping a counter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MessageError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unknown channel: {0}")]
    UnknownChannel(i64),

    #[error("Unknown address: {0}")]
    UnknownAddress(String),

    #[error("Negative timestamp: {0}")]
    NegativeTimestamp(f64),

    #[error("Stale message: {age_ms:.0} ms old")]
    Stale { age_ms: f64 },
}

/// Per-channel ingest errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    #[error("Out-of-order sample: {timestamp:.3}s < {last_accepted:.3}s")]
    OutOfOrder { timestamp: f64, last_accepted: f64 },
}

/// Event distribution errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("No route for channel {0}")]
    UnknownChannel(u8),

    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    #[error("Lane name already registered: {0}")]
    DuplicateLane(String),
}

/// Failure reported by a consumer lane's sink
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Consumer closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),
}

/// Capture file errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Not a capture file (bad magic)")]
    BadMagic,

    #[error("Unsupported capture version: {0}")]
    UnsupportedVersion(u8),

    #[error("Truncated record at offset {0}")]
    Truncated(u64),

    #[error("Recorder stopped")]
    RecorderStopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
