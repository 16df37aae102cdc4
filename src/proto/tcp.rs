//! Baseline TCP passthrough handler.
//!
//! Every other protocol handler calls these free functions first and layers
//! interception on top, mirroring `prototcp.c`'s role as the setup routine
//! `proxy_setup_proto` falls through to and that the SSL/HTTP/POP3/SMTP
//! modules in the original call directly from their own setup functions.

use crate::conn::{ConnCtx, RelayOutcome};
use crate::error::Result;
use crate::net::Endpoint;
use crate::proto::{ProtoKind, ProtocolHandler};
use tracing::trace;

/// Called once per connection before any event fires. TCP has no per-protocol
/// state to prepare.
pub fn init_conn(_conn: &mut ConnCtx) -> Result<()> {
    Ok(())
}

/// Called when `srvdst` (or, in split mode, `dst`) completes its connect.
/// TCP has nothing beyond the generic bookkeeping `ConnCtx` already performs
/// when dispatch calls `on_srvdst_connected`.
pub fn on_connect(conn: &mut ConnCtx) -> Result<()> {
    trace!(conn_id = ?conn.id, "tcp connect complete");
    Ok(())
}

/// Relays bytes from `which` to its peer unmodified. A `ShouldTerminate`
/// outcome (fixed protocol error banner already queued onto `src`'s output
/// buffer) is left alone here: `relay_writable` closes the connection once
/// that banner has actually drained to the client, so the error reaches it
/// instead of being lost to an immediate close. TCP itself never rejects
/// content, but downstream protocols layered on top of this function do via
/// `ConnCtx::relay_readable`'s `proto.validate` hook.
pub fn on_readable(which: Endpoint, conn: &mut ConnCtx) -> Result<()> {
    match conn.relay_readable(which)? {
        RelayOutcome::Continue => {}
        RelayOutcome::PeerEof => {
            conn.terminate(crate::conn::TermRequestor::Server);
        }
        RelayOutcome::ShouldTerminate => {}
    }
    Ok(())
}

/// Drains `which`'s output buffer. Crossing the low watermark is surfaced
/// here only as a trace; the worker loop is responsible for re-arming the
/// paired read interest.
pub fn on_writable(which: Endpoint, conn: &mut ConnCtx) -> Result<()> {
    if conn.relay_writable(which)? {
        trace!(conn_id = ?conn.id, ?which, "drained below low watermark");
    }
    Ok(())
}

/// Bare TCP protocol handler. Also the fallback implementation every other
/// `ProtocolHandler` delegates to via the default trait methods.
pub struct TcpHandler;

impl ProtocolHandler for TcpHandler {
    fn kind(&self) -> ProtoKind {
        ProtoKind::Tcp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Descriptor;
    use std::net::SocketAddr;

    fn fake_descriptor(endpoint: Endpoint) -> Descriptor {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        Descriptor::new(endpoint, mio::net::TcpStream::from_std(client))
    }

    #[test]
    fn kind_is_tcp() {
        assert_eq!(TcpHandler.kind(), ProtoKind::Tcp);
    }

    #[test]
    fn on_writable_is_noop_when_buffer_empty() {
        let mut map: slotmap::SlotMap<crate::conn::ConnId, ()> = slotmap::SlotMap::with_key();
        let id = map.insert(());
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut conn = ConnCtx::new(
            id,
            "t".into(),
            addr,
            addr,
            fake_descriptor(Endpoint::Src),
            true,
            Box::new(TcpHandler),
            false,
        );
        assert!(on_writable(Endpoint::Src, &mut conn).is_ok());
    }
}
