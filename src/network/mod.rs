//! UDP transport: socket setup and the ingest receive loop

pub mod receiver;
pub mod udp;

pub use receiver::{InboundHandler, IngestReceiver, ReceiverSnapshot, ReceiverStats};
pub use udp::{create_socket, sender_socket, SocketOptions};
