//! Networking primitives: buffers, connection descriptors, and socket setup.

pub mod buffer;
pub mod descriptor;

pub use buffer::Buffer;
pub use descriptor::{Descriptor, Endpoint, ReadOutcome, DEFAULT_HIGH_WATERMARK};

use crate::error::{Error, Result};
use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use tracing::debug;

/// Bind options for a listening socket (ported from a
/// socket2-based `TcpListener::bind`).
#[derive(Debug, Clone)]
pub struct ListenOptions {
    pub reuse_address: bool,
    pub reuse_port: bool,
    pub backlog: i32,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            reuse_address: true,
            reuse_port: true,
            backlog: 1024,
        }
    }
}

/// Binds and listens on `addr`, returning a non-blocking mio listener ready
/// for reactor registration. Used once per `ListenerSpec` and, for
/// `divert`-mode TLS handlers, once per child listener fd.
pub fn bind_listener(addr: SocketAddr, opts: &ListenOptions) -> Result<MioTcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| Error::network(format!("failed to create listening socket: {e}")))?;

    socket.set_nonblocking(true)
        .map_err(|e| Error::network(format!("failed to set nonblocking: {e}")))?;
    if opts.reuse_address {
        socket.set_reuse_address(true)
            .map_err(|e| Error::network(format!("failed to set SO_REUSEADDR: {e}")))?;
    }
    #[cfg(unix)]
    if opts.reuse_port {
        socket.set_reuse_port(true)
            .map_err(|e| Error::network(format!("failed to set SO_REUSEPORT: {e}")))?;
    }

    socket.bind(&addr.into())
        .map_err(|e| Error::network(format!("failed to bind {addr}: {e}")))?;
    socket.listen(opts.backlog)
        .map_err(|e| Error::network(format!("failed to listen on {addr}: {e}")))?;

    debug!(%addr, "listening");
    MioTcpListener::from_std(socket.into())
        .map_err(|e| Error::network(format!("failed to adopt listener socket: {e}")))
}

/// Initiates a non-blocking connect to `addr` for use as a `dst`/`srvdst`
/// descriptor in the "server-first connected" phase. Readiness (and thus
/// connect success/failure) is discovered via the reactor's writable event.
pub fn dial(addr: SocketAddr) -> Result<MioTcpStream> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| Error::network(format!("failed to create socket: {e}")))?;
    socket.set_nonblocking(true)
        .map_err(|e| Error::network(format!("failed to set nonblocking: {e}")))?;

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) if e.raw_os_error() == Some(libc_eintr_or_einprogress()) => {}
        Err(e) => return Err(Error::network(format!("connect to {addr} failed: {e}"))),
    }

    let std_stream: std::net::TcpStream = socket.into();
    MioTcpStream::from_std(std_stream)
        .map_err(|e| Error::network(format!("failed to adopt connecting socket: {e}")))
}

#[cfg(unix)]
fn libc_eintr_or_einprogress() -> i32 {
    115 // EINPROGRESS on Linux; WouldBlock already covers the common case above
}

#[cfg(not(unix))]
fn libc_eintr_or_einprogress() -> i32 {
    -1
}

/// Applies standard socket tuning (`TCP_NODELAY`) to a freshly accepted or
/// connected stream.
pub fn tune_stream(stream: &MioTcpStream) -> Result<()> {
    let sock = socket2::SockRef::from(stream);
    sock.set_nodelay(true)
        .map_err(|e| Error::network(format!("failed to set TCP_NODELAY: {e}")))?;
    Ok(())
}
