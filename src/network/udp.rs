//! UDP socket setup

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

use crate::error::NetworkError;

/// Socket options applied before binding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketOptions {
    /// SO_REUSEPORT, so a second process can listen on the same port
    pub reuse_port: bool,
    pub broadcast: bool,
    /// SO_RCVBUF in bytes; 0 keeps the OS default
    pub recv_buffer_size: usize,
}

/// Create a non-blocking UDP socket bound to `addr` and hand it to tokio.
///
/// Must be called from within a tokio runtime.
pub fn create_socket(addr: SocketAddr, options: SocketOptions) -> Result<UdpSocket, NetworkError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(format!("socket: {e}")))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::BindFailed(format!("SO_REUSEADDR: {e}")))?;

    if options.reuse_port {
        set_reuse_port(&socket).map_err(|e| NetworkError::BindFailed(format!("SO_REUSEPORT: {e}")))?;
    }

    if options.broadcast {
        socket
            .set_broadcast(true)
            .map_err(|e| NetworkError::BindFailed(format!("SO_BROADCAST: {e}")))?;
    }

    if options.recv_buffer_size > 0 {
        if let Err(e) = socket.set_recv_buffer_size(options.recv_buffer_size) {
            tracing::warn!("Could not set receive buffer to {} bytes: {}", options.recv_buffer_size, e);
        }
    }

    socket
        .set_nonblocking(true)
        .map_err(|e| NetworkError::BindFailed(format!("non-blocking: {e}")))?;
    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{addr}: {e}")))?;

    UdpSocket::from_std(socket.into()).map_err(|e| NetworkError::BindFailed(format!("{addr}: {e}")))
}

#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
fn set_reuse_port(socket: &Socket) -> io::Result<()> {
    socket.set_reuse_port(true)
}

#[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
fn set_reuse_port(_socket: &Socket) -> io::Result<()> {
    Ok(())
}

/// Unbound-port sender socket for outbound datagrams
pub fn sender_socket(broadcast: bool) -> Result<UdpSocket, NetworkError> {
    let addr: SocketAddr = ([0, 0, 0, 0], 0).into();
    create_socket(
        addr,
        SocketOptions {
            broadcast,
            ..Default::default()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral() {
        let socket = create_socket("127.0.0.1:0".parse().unwrap(), SocketOptions::default()).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reuse_port_allows_second_listener() {
        let opts = SocketOptions {
            reuse_port: true,
            ..Default::default()
        };
        let first = create_socket("127.0.0.1:0".parse().unwrap(), opts).unwrap();
        let addr = first.local_addr().unwrap();
        assert!(create_socket(addr, opts).is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_sender() {
        let socket = sender_socket(true).unwrap();
        assert!(socket.broadcast().unwrap());
    }
}
