//! Privsep client socket interface.
//!
//! A pre-opened file descriptor through which the engine asks a privileged
//! helper process to bind low-numbered ports; the returned bound fd becomes
//! the listener fd. The helper process itself lives outside this crate.

use crate::error::Result;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

/// Client side of the privsep handshake: request a bound socket for `addr`
/// from the privileged helper reachable over `socket_fd`.
pub trait PrivsepClient: Send + Sync {
    /// Asks the helper to bind `addr` and returns the bound, listening fd.
    fn request_bind(&self, addr: SocketAddr) -> Result<RawFd>;
}

/// A `PrivsepClient` that has no privileged helper and binds directly
/// in-process. Used when the proxy already has the required capability
/// (e.g. `CAP_NET_BIND_SERVICE`) or is listening only on unprivileged ports.
pub struct DirectBind;

impl PrivsepClient for DirectBind {
    fn request_bind(&self, addr: SocketAddr) -> Result<RawFd> {
        use crate::error::Error;
        use socket2::{Domain, Protocol, Socket, Type};
        use std::os::unix::io::IntoRawFd;

        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| Error::network(format!("failed to create socket: {e}")))?;
        socket.set_nonblocking(true)
            .map_err(|e| Error::network(format!("failed to set nonblocking: {e}")))?;
        socket.set_reuse_address(true)
            .map_err(|e| Error::network(format!("failed to set SO_REUSEADDR: {e}")))?;
        socket.bind(&addr.into())
            .map_err(|e| Error::network(format!("failed to bind {addr}: {e}")))?;
        socket.listen(1024)
            .map_err(|e| Error::network(format!("failed to listen on {addr}: {e}")))?;

        Ok(socket.into_raw_fd())
    }
}
