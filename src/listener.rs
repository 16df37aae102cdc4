//! Accept loop: one OS listening socket per [`ListenerSpec`], handing each
//! accepted connection to the thread pool's least-loaded worker.
//!
//! Grounded in `proxy.c`'s listener setup (`proxy_listener_setup` binds one
//! socket per spec and registers an accept callback) and `pxythrmgr.c`'s
//! `pxy_thrmgr_assign_thr` call from that same callback. All listener
//! sockets share one `mio::Poll` here rather than one `evconnlistener` per
//! socket, since a single OS thread polling N listening fds is equivalent
//! and avoids spinning up a thread per listener.

use crate::config::ListenerSpec;
use crate::error::{Error, Result};
use crate::net::{self, ListenOptions};
use crate::reactor::{Assignment, ThreadPool};

use mio::net::TcpListener as MioTcpListener;
use mio::{Events, Interest, Poll, Token};
use std::sync::Arc;
use tracing::{info, warn};

/// One bound, registered listening socket plus the spec it was opened for.
struct Bound {
    listener: MioTcpListener,
    spec: Arc<ListenerSpec>,
}

/// Owns every listening socket for the proxy's current configuration and
/// drives the accept loop that feeds the thread pool.
pub struct ListenerSet {
    poll: Poll,
    events: Events,
    bound: Vec<Bound>,
}

impl ListenerSet {
    /// Binds one socket per spec and registers it with a fresh `Poll`.
    /// Token `i` identifies `specs[i]`.
    pub fn bind(specs: &[ListenerSpec]) -> Result<Self> {
        let poll = Poll::new().map_err(|e| Error::network(format!("failed to create listener poll: {e}")))?;
        let mut bound = Vec::with_capacity(specs.len());

        for (i, spec) in specs.iter().enumerate() {
            let mut listener = net::bind_listener(spec.listen_addr, &ListenOptions::default())?;
            poll.registry()
                .register(&mut listener, Token(i), Interest::READABLE)
                .map_err(|e| Error::network(format!("failed to register listener {}: {e}", spec.name())))?;
            info!(listener = %spec.name(), addr = %spec.listen_addr, "listening");
            bound.push(Bound { listener, spec: Arc::new(spec.clone()) });
        }

        Ok(Self { poll, events: Events::with_capacity(128), bound })
    }

    /// Polls for pending connections and hands each to `pool`. Intended to
    /// be called in a loop from the orchestrator's own thread; `timeout`
    /// bounds how long a single call blocks when nothing is pending, so the
    /// caller can interleave shutdown checks.
    pub fn poll_once(&mut self, pool: &ThreadPool, timeout: std::time::Duration) -> Result<()> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(Error::network(format!("listener poll failed: {e}"))),
        }

        for event in self.events.iter() {
            let Token(idx) = event.token();
            let Some(bound) = self.bound.get(idx) else { continue };
            self.accept_all(idx, &bound.spec.clone(), pool);
        }
        Ok(())
    }

    fn accept_all(&mut self, idx: usize, spec: &Arc<ListenerSpec>, pool: &ThreadPool) {
        loop {
            let accepted = self.bound[idx].listener.accept();
            match accepted {
                Ok((mio_stream, src_addr)) => {
                    let stream = match mio_stream.into_raw_fd_stream() {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(listener = %spec.name(), "failed to convert accepted socket: {}", e);
                            continue;
                        }
                    };
                    let assignment = Assignment { stream, src_addr, spec: spec.clone() };
                    if let Err(e) = pool.assign(assignment) {
                        warn!(listener = %spec.name(), "failed to assign accepted connection: {}", e);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(listener = %spec.name(), "accept failed: {}", e);
                    break;
                }
            }
        }
    }
}

/// Converts a `mio::net::TcpStream` into the `std::net::TcpStream` that
/// [`Assignment`] carries, so ownership can cross the channel to a worker
/// thread and be re-registered against that worker's own `Poll` there.
trait IntoRawFdStream {
    fn into_raw_fd_stream(self) -> Result<std::net::TcpStream>;
}

impl IntoRawFdStream for mio::net::TcpStream {
    fn into_raw_fd_stream(self) -> Result<std::net::TcpStream> {
        use std::os::unix::io::{FromRawFd, IntoRawFd};
        Ok(unsafe { std::net::TcpStream::from_raw_fd(self.into_raw_fd()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DestinationMode, ListenerProto};
    use std::net::SocketAddr;

    fn spec(addr: &str) -> ListenerSpec {
        ListenerSpec {
            proto: ListenerProto::Tcp,
            listen_addr: addr.parse::<SocketAddr>().unwrap(),
            destination: DestinationMode::Static("127.0.0.1:1".parse().unwrap()),
            sni_port: None,
            divert_addr: None,
            return_addr: None,
            divert: false,
        }
    }

    #[test]
    fn binds_ephemeral_port() {
        let specs = vec![spec("127.0.0.1:0")];
        let set = ListenerSet::bind(&specs);
        assert!(set.is_ok());
    }
}
