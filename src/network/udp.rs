//! UDP socket helpers

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use tokio::net::UdpSocket;

use crate::error::NetworkError;

/// Create a non-blocking tokio UDP socket bound to `addr` with enlarged
/// kernel buffers.
///
/// Must be called from within a tokio runtime.
pub fn create_socket(addr: SocketAddr, buffer_size: usize) -> Result<UdpSocket, NetworkError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    // Buffer sizes are hints; the kernel may clamp them
    if let Err(e) = socket.set_recv_buffer_size(buffer_size) {
        tracing::debug!("Could not set receive buffer size: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(buffer_size) {
        tracing::debug!("Could not set send buffer size: {}", e);
    }

    socket
        .set_nonblocking(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;

    UdpSocket::from_std(socket.into()).map_err(|e| NetworkError::BindFailed(e.to_string()))
}

/// Unbound sender socket on the given local interface
pub fn create_sender(local_ip: IpAddr, buffer_size: usize) -> Result<UdpSocket, NetworkError> {
    create_socket(SocketAddr::new(local_ip, 0), buffer_size)
}

/// Discover the address of the interface that routes to the internet.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
pub fn local_ip() -> Result<IpAddr, NetworkError> {
    let route = std::net::UdpSocket::bind("0.0.0.0:0")
        .map_err(|e| NetworkError::NoLocalAddress(e.to_string()))?;
    route
        .connect("8.8.8.8:80")
        .map_err(|e| NetworkError::NoLocalAddress(e.to_string()))?;

    let ip = route
        .local_addr()
        .map_err(|e| NetworkError::NoLocalAddress(e.to_string()))?
        .ip();

    if ip.is_unspecified() {
        return Err(NetworkError::NoLocalAddress("no routable interface".into()));
    }
    Ok(ip)
}
