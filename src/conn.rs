//! Paired connection context and lifecycle state machine.
//!
//! Field layout and phase names are ported from
//! `original_source/NIOMan/Classes/pxyconn.h` and
//! `original_source/NIOMan/Classes/proto/prototcp.c`. The intrusive
//! prev/next list pointers collapse into the owning worker's `slotmap`
//! arena; `ConnId` is the stable key.

use crate::error::{Error, Result};
use crate::filter::LogBits;
use crate::net::{Descriptor, Endpoint, ReadOutcome};
use crate::proto::ProtocolHandler;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{trace, warn};

slotmap::new_key_type! {
    /// Stable identity for a connection within its owning worker's arena.
    pub struct ConnId;
}

/// Literal protocol-error banner, ported from `pxyconn.h`'s
/// `PROTOERROR_MSG`.
pub const PROTOERROR_MSG: &[u8] = b"Connection is terminated due to protocol error\r\n";

/// SSLproxy header key (ported from `pxyconn.h`'s `SSLPROXY_KEY`).
pub const SSLPROXY_KEY: &str = "SSLproxy:";

/// Parent vs. child connection (child connections are spawned by the
/// per-connection child listener during TLS re-identification hops).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Parent,
    Child,
}

/// Who initiated connection termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermRequestor {
    Client,
    Server,
}

/// Timing stamps, seconds-with-microsecond-fraction.
#[derive(Debug, Clone, Default)]
pub struct Timing {
    pub time_s: Option<Instant>,
    pub dns_time_s: Option<Instant>,
    pub dns_time_e: Option<Instant>,
    pub connect_s: Option<Instant>,
    pub connect_e: Option<Instant>,
    pub send_s: Option<Instant>,
    pub send_e: Option<Instant>,
    pub receive_s: Option<Instant>,
    pub receive_e: Option<Instant>,
    pub time_c: Option<Instant>,
}

/// Outcome of a single readable-event relay step, used by the worker loop
/// to decide whether to schedule teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Continue,
    PeerEof,
    ShouldTerminate,
}

/// Per-connection state. Allocated by the listener on accept, attached to
/// exactly one worker thread's arena, detached and freed on teardown.
pub struct ConnCtx {
    pub id: ConnId,
    pub task_id: String,
    pub role: Role,

    pub src: Descriptor,
    pub dst: Option<Descriptor>,
    pub srvdst: Option<Descriptor>,
    /// True once `srvdst`'s socket ownership has moved into `dst` (split
    /// mode). Modeled as an explicit transfer rather than aliasing the same
    /// buffered event.
    pub srvdst_xferred: bool,

    pub proto: Box<dyn ProtocolHandler>,

    pub attached: bool,
    pub connected: bool,
    pub term: bool,
    pub term_requestor: Option<TermRequestor>,
    pub enomem: bool,
    pub divert: bool,
    pub pass: bool,

    pub log_bits: LogBits,
    pub filter_precedence: u32,

    pub timing: Timing,
    pub in_bytes: u64,
    pub out_bytes: u64,

    pub src_addr: SocketAddr,
    pub dst_addr: SocketAddr,

    pub sslproxy_header: Option<String>,
    pub sent_sslproxy_header: bool,
    pub sent_protoerror_msg: bool,

    pub children: Vec<ConnId>,

    pub atime: Instant,
    pub ctime: Instant,
}

impl ConnCtx {
    pub fn new(
        id: ConnId,
        task_id: String,
        src_addr: SocketAddr,
        dst_addr: SocketAddr,
        src: Descriptor,
        divert: bool,
        proto: Box<dyn ProtocolHandler>,
        has_filter: bool,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            task_id,
            role: Role::Parent,
            src,
            dst: None,
            srvdst: None,
            srvdst_xferred: false,
            proto,
            attached: false,
            connected: false,
            term: false,
            term_requestor: None,
            enomem: false,
            divert,
            pass: false,
            // Ported from `proxy_conn_ctx_new`: all five log bits default on
            // only when no filter is configured.
            log_bits: LogBits {
                connect: !has_filter,
                master: !has_filter,
                cert: !has_filter,
                content: !has_filter,
                pcap: !has_filter,
            },
            filter_precedence: 0,
            timing: Timing { time_s: Some(now), ..Default::default() },
            in_bytes: 0,
            out_bytes: 0,
            src_addr,
            dst_addr,
            sslproxy_header: None,
            sent_sslproxy_header: false,
            sent_protoerror_msg: false,
            children: Vec::new(),
            atime: now,
            ctime: now,
        }
    }

    /// Sets the connection's precedence, enforcing the monotonic-rise
    /// invariant.
    pub fn raise_precedence(&mut self, precedence: u32) {
        if precedence > self.filter_precedence {
            self.filter_precedence = precedence;
        }
    }

    pub fn touch(&mut self) {
        self.atime = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.atime)
    }

    /// The descriptor whose outbound buffer an endpoint's inbound bytes
    /// feed into. `Srvdst` has no direct peer; it only exists pre-connect
    /// or, in split mode prior to transfer, as the source of the initial
    /// bytes that seed `dst`.
    pub fn peer_of(endpoint: Endpoint) -> Option<Endpoint> {
        match endpoint {
            Endpoint::Src => Some(Endpoint::Dst),
            Endpoint::Dst => Some(Endpoint::Src),
            Endpoint::Srvdst => None,
        }
    }

    pub fn descriptor(&self, endpoint: Endpoint) -> Option<&Descriptor> {
        match endpoint {
            Endpoint::Src => Some(&self.src),
            Endpoint::Dst => self.dst.as_ref(),
            Endpoint::Srvdst => self.srvdst.as_ref(),
        }
    }

    pub fn descriptor_mut(&mut self, endpoint: Endpoint) -> Option<&mut Descriptor> {
        match endpoint {
            Endpoint::Src => Some(&mut self.src),
            Endpoint::Dst => self.dst.as_mut(),
            Endpoint::Srvdst => self.srvdst.as_mut(),
        }
    }

    /// Moves `srvdst`'s socket into `dst` (split mode) by explicit
    /// ownership transfer rather than aliasing. After this call `srvdst`
    /// is `None` and `srvdst_xferred` is permanently `true`.
    pub fn transfer_srvdst_to_dst(&mut self) {
        if let Some(srvdst) = self.srvdst.take() {
            self.dst = Some(srvdst);
            self.srvdst_xferred = true;
            trace!(conn_id = ?self.id, "srvdst ownership transferred to dst (split mode)");
        }
    }

    /// "Server-first connected" phase. Sets up `dst` per
    /// divert/split mode and opens the gate on `src`. Filter consultation
    /// happens in the caller (the engine owns the `Filter` trait object);
    /// this only performs the mechanical setup once a decision is made.
    pub fn on_srvdst_connected(&mut self, dst: Option<Descriptor>) -> Result<()> {
        self.timing.connect_e = Some(Instant::now());

        if self.divert {
            let dst = dst.ok_or_else(|| Error::proxy("divert mode requires a dst descriptor"))?;
            self.dst = Some(dst);
        } else {
            self.transfer_srvdst_to_dst();
        }

        self.connected = true;
        self.touch();
        Ok(())
    }

    /// Generic relay step for a readable event: moves bytes from
    /// `endpoint`'s input buffer into its peer's output buffer, giving the
    /// protocol handler a chance to intercept first. Returns the
    /// watermark/termination outcome the worker loop should act on.
    pub fn relay_readable(&mut self, endpoint: Endpoint) -> Result<RelayOutcome> {
        let read_result = match self.descriptor_mut(endpoint) {
            Some(d) => d.read_into_buffer(),
            None => return Ok(RelayOutcome::Continue),
        };

        let n = match read_result {
            Ok(ReadOutcome::Data(n)) => n,
            Ok(ReadOutcome::WouldBlock) => return Ok(RelayOutcome::Continue),
            Ok(ReadOutcome::Eof) => return Ok(self.handle_eof(endpoint)),
            Err(e) => {
                warn!(conn_id = ?self.id, ?endpoint, "read error: {}", e);
                self.close_endpoint(endpoint);
                return Ok(RelayOutcome::PeerEof);
            }
        };

        self.touch();
        // Only the client-facing side's reads count as bytes received from
        // the client (the original's `intif` counter); the origin side's
        // reads are accounted on the way out below.
        if endpoint == Endpoint::Src {
            self.in_bytes += n as u64;
        }

        let Some(peer) = Self::peer_of(endpoint) else {
            return Ok(RelayOutcome::Continue);
        };

        let data = self.descriptor(endpoint).map(|d| d.readable_data().to_vec()).unwrap_or_default();
        let consumed = data.len();

        if !self.proto.validate(&data) {
            self.sent_protoerror_msg = true;
            if let Some(src) = self.descriptor_mut(Endpoint::Src) {
                let _ = src.enqueue_write(PROTOERROR_MSG);
            }
            if let Some(d) = self.descriptor_mut(endpoint) {
                d.consume_read(consumed);
            }
            return Ok(RelayOutcome::ShouldTerminate);
        }

        let data = self.stamp_sslproxy_header(endpoint, data);

        if let Some(peer_desc) = self.descriptor_mut(peer) {
            peer_desc.enqueue_write(&data)?;
            // Only bytes relayed back toward the client count as `out_bytes`
            // (the original's `extif` counter).
            if peer == Endpoint::Src {
                self.out_bytes += data.len() as u64;
            }
            // Crossing the high watermark here is what makes
            // `reconcile_interests` stop polling `endpoint` for readability;
            // without this call the flag `reconcile_interests` reads never
            // flips and backpressure never engages.
            peer_desc.crossed_high_watermark();
        }
        if let Some(d) = self.descriptor_mut(endpoint) {
            d.consume_read(consumed);
        }

        Ok(RelayOutcome::Continue)
    }

    /// Prepends the one-time SSLproxy header to the first `src`-to-`dst`
    /// chunk of relayed data, ported from `prototcp.c`'s
    /// `pxy_try_prepend_sslproxy_header`. A no-op once `sent_sslproxy_header`
    /// is set, or when no header has been assigned (e.g. plain TCP).
    fn stamp_sslproxy_header(&mut self, endpoint: Endpoint, data: Vec<u8>) -> Vec<u8> {
        if endpoint != Endpoint::Src || self.sent_sslproxy_header {
            return data;
        }
        let Some(header) = self.sslproxy_header.as_ref() else { return data };
        self.sent_sslproxy_header = true;
        let mut out = Vec::with_capacity(header.len() + 2 + data.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&data);
        out
    }

    /// Half-close: EOF before the connection finished connecting is a
    /// protocol violation and tears the connection down immediately. EOF on
    /// an already-connected side sets its `closed` flag after draining
    /// whatever it had already read into its peer's output buffer; full
    /// teardown waits until `is_fully_closed` sees both sides closed and
    /// drained.
    fn handle_eof(&mut self, endpoint: Endpoint) -> RelayOutcome {
        if !self.connected {
            warn!(conn_id = ?self.id, ?endpoint, "EOF before connected");
            self.close_endpoint(endpoint);
            return RelayOutcome::PeerEof;
        }

        self.touch();
        if let Some(peer) = Self::peer_of(endpoint) {
            let data = self.descriptor(endpoint).map(|d| d.readable_data().to_vec()).unwrap_or_default();
            if !data.is_empty() {
                let consumed = data.len();
                if let Some(peer_desc) = self.descriptor_mut(peer) {
                    let _ = peer_desc.enqueue_write(&data);
                    if peer == Endpoint::Src {
                        self.out_bytes += data.len() as u64;
                    }
                    peer_desc.crossed_high_watermark();
                }
                if let Some(d) = self.descriptor_mut(endpoint) {
                    d.consume_read(consumed);
                }
            }
        }

        if let Some(d) = self.descriptor_mut(endpoint) {
            d.close();
        }

        RelayOutcome::PeerEof
    }

    /// Generic relay step for a writable event: drains the endpoint's
    /// output buffer and, on crossing the low watermark, signals that the
    /// paired read side should be re-enabled.
    pub fn relay_writable(&mut self, endpoint: Endpoint) -> Result<bool> {
        let Some(d) = self.descriptor_mut(endpoint) else { return Ok(false) };
        match d.write_from_buffer() {
            Ok(_) => {}
            Err(e) => {
                warn!(conn_id = ?self.id, ?endpoint, "write error: {}", e);
                self.close_endpoint(endpoint);
                return Ok(false);
            }
        }
        self.touch();

        if self.sent_protoerror_msg && endpoint == Endpoint::Src {
            if let Some(src) = self.descriptor(Endpoint::Src) {
                if !src.has_pending_write() {
                    self.terminate(TermRequestor::Client);
                }
            }
        }

        let Some(d) = self.descriptor_mut(endpoint) else { return Ok(false) };
        Ok(d.crossed_low_watermark())
    }

    /// Closes `endpoint` and its peer: every caller reaches this only on a
    /// hard socket error or a pre-connect EOF, conditions the relay can't
    /// recover from on either leg. Closing both immediately (rather than
    /// waiting for the peer to separately error out) is what lets
    /// `is_fully_closed` become true and the connection actually get reaped.
    fn close_endpoint(&mut self, endpoint: Endpoint) {
        if let Some(d) = self.descriptor_mut(endpoint) {
            d.close();
        }
        if let Some(peer) = Self::peer_of(endpoint) {
            if let Some(d) = self.descriptor_mut(peer) {
                d.close();
            }
        }
        self.term = true;
    }

    /// Explicit cancellation entry point, mirroring `pxy_conn_term`. Closes
    /// every descriptor immediately rather than only flagging intent to
    /// close, since `reap_terminated` only collects connections where
    /// `term` and `is_fully_closed()` both hold.
    pub fn terminate(&mut self, requestor: TermRequestor) {
        self.term = true;
        self.term_requestor = Some(requestor);
        self.src.close();
        if let Some(dst) = self.dst.as_mut() {
            dst.close();
        }
        if let Some(srvdst) = self.srvdst.as_mut() {
            srvdst.close();
        }
    }

    /// Close ordering invariant: both sides closed and drained.
    pub fn is_fully_closed(&self) -> bool {
        let src_done = self.src.is_closed() && !self.src.has_pending_write();
        let dst_done = self.dst.as_ref().map(|d| d.is_closed() && !d.has_pending_write()).unwrap_or(true);
        src_done && dst_done
    }

    /// Tears down the connection: records `time_c`, drops descriptors, and
    /// returns a summary for the connect logger. Does not touch the
    /// worker's arena membership — the caller (threadpool) removes this
    /// context from its slotmap and decrements `load`.
    pub fn teardown(&mut self) -> TeardownSummary {
        self.timing.time_c = Some(Instant::now());
        self.src.close();
        if let Some(dst) = self.dst.as_mut() {
            dst.close();
        }
        if let Some(srvdst) = self.srvdst.as_mut() {
            srvdst.close();
        }
        TeardownSummary {
            id: self.id,
            in_bytes: self.in_bytes,
            out_bytes: self.out_bytes,
            log_connect: self.log_bits.connect,
        }
    }
}

/// Summary handed to the connect logger on teardown.
#[derive(Debug, Clone)]
pub struct TeardownSummary {
    pub id: ConnId,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub log_connect: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::tcp::TcpHandler;
    use std::io::{Read, Write};

    fn fake_descriptor(endpoint: Endpoint) -> Descriptor {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        Descriptor::new(endpoint, mio::net::TcpStream::from_std(client))
    }

    /// Like [`fake_descriptor`] but also returns the accepted remote end, so
    /// a test can push real bytes at the descriptor's socket.
    fn fake_descriptor_with_remote(endpoint: Endpoint) -> (Descriptor, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        let (remote, _) = listener.accept().unwrap();
        (Descriptor::new(endpoint, mio::net::TcpStream::from_std(client)), remote)
    }

    fn new_test_conn() -> (slotmap::SlotMap<ConnId, ()>, ConnCtx) {
        let mut map: slotmap::SlotMap<ConnId, ()> = slotmap::SlotMap::with_key();
        let id = map.insert(());
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let ctx = ConnCtx::new(
            id,
            "task".into(),
            addr,
            addr,
            fake_descriptor(Endpoint::Src),
            true,
            Box::new(TcpHandler),
            false,
        );
        (map, ctx)
    }

    #[test]
    fn precedence_is_monotonic() {
        let (_map, mut ctx) = new_test_conn();
        ctx.raise_precedence(5);
        ctx.raise_precedence(2);
        assert_eq!(ctx.filter_precedence, 5);
        ctx.raise_precedence(9);
        assert_eq!(ctx.filter_precedence, 9);
    }

    #[test]
    fn log_bits_default_on_without_filter() {
        let (_map, ctx) = new_test_conn();
        assert!(ctx.log_bits.connect && ctx.log_bits.content);
    }

    #[test]
    fn split_mode_transfers_srvdst_ownership() {
        let (_map, mut ctx) = new_test_conn();
        ctx.srvdst = Some(fake_descriptor(Endpoint::Srvdst));
        ctx.on_srvdst_connected(None).unwrap();
        assert!(ctx.srvdst.is_none());
        assert!(ctx.dst.is_some());
        assert!(ctx.srvdst_xferred);
    }

    #[test]
    fn fully_closed_requires_both_sides_drained() {
        let (_map, mut ctx) = new_test_conn();
        assert!(!ctx.is_fully_closed());
        ctx.src.close();
        assert!(ctx.is_fully_closed());
    }

    /// Relaying past the high watermark must disable the paired read side.
    /// `relay_readable` is the only place that can
    /// observe the crossing (it is the one holding both descriptors), so
    /// this exercises that the peer's `watermark_set()` flag actually
    /// flips — regression test for a relay path that updated buffers but
    /// never called `crossed_high_watermark`.
    #[test]
    fn relay_readable_sets_peer_watermark_on_crossing() {
        let (_map, mut ctx) = new_test_conn();
        let (src, mut src_remote) = fake_descriptor_with_remote(Endpoint::Src);
        ctx.src = src;
        ctx.dst = Some(fake_descriptor(Endpoint::Dst).with_watermarks(64));

        let payload = vec![0u8; 128];
        src_remote.write_all(&payload).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let outcome = ctx.relay_readable(Endpoint::Src).unwrap();
        assert_eq!(outcome, RelayOutcome::Continue);
        assert!(ctx.dst.as_ref().unwrap().watermark_set(), "dst output buffer should be above its high watermark");
    }

    /// `in_bytes` must only count client-to-proxy reads (`Src`); relaying
    /// the origin's reply back out must not also add to it.
    #[test]
    fn in_bytes_counts_only_src_side_reads() {
        let (_map, mut ctx) = new_test_conn();
        let (src, mut src_remote) = fake_descriptor_with_remote(Endpoint::Src);
        let (dst, mut dst_remote) = fake_descriptor_with_remote(Endpoint::Dst);
        ctx.src = src;
        ctx.dst = Some(dst);
        ctx.connected = true;

        src_remote.write_all(b"PING\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        ctx.relay_readable(Endpoint::Src).unwrap();

        dst_remote.write_all(b"PONG\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        ctx.relay_readable(Endpoint::Dst).unwrap();

        assert_eq!(ctx.in_bytes, 5);
        assert_eq!(ctx.out_bytes, 5);
    }

    /// The SSLproxy header is prepended exactly once, only on the first
    /// `src`-to-`dst` chunk, and never re-injected on subsequent relays.
    #[test]
    fn sslproxy_header_prepended_once_on_first_src_to_dst_relay() {
        let (_map, mut ctx) = new_test_conn();
        let (src, mut src_remote) = fake_descriptor_with_remote(Endpoint::Src);
        let (dst, dst_remote) = fake_descriptor_with_remote(Endpoint::Dst);
        ctx.src = src;
        ctx.dst = Some(dst);
        ctx.connected = true;
        ctx.sslproxy_header = Some("SSLproxy: 127.0.0.1:20000".to_string());

        src_remote.write_all(b"GET / HTTP/1.1\r\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        ctx.relay_readable(Endpoint::Src).unwrap();
        assert!(ctx.sent_sslproxy_header);

        let mut dst_remote = dst_remote;
        dst_remote.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 256];
        std::thread::sleep(std::time::Duration::from_millis(20));
        let n = dst_remote.read(&mut buf).unwrap();
        let received = &buf[..n];
        assert!(received.starts_with(b"SSLproxy: 127.0.0.1:20000\r\n"));
        assert!(received.ends_with(b"GET / HTTP/1.1\r\n"));

        src_remote.write_all(b"again\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        ctx.relay_readable(Endpoint::Src).unwrap();
        let n2 = dst_remote.read(&mut buf).unwrap();
        assert_eq!(&buf[..n2], b"again\n", "header must not be re-injected on later relays");
    }

    /// EOF on an already-connected side drains its buffered input into the
    /// peer before closing, rather than discarding it.
    #[test]
    fn eof_after_connected_drains_into_peer_before_closing() {
        let (_map, mut ctx) = new_test_conn();
        let (src, src_remote) = fake_descriptor_with_remote(Endpoint::Src);
        let (dst, mut dst_remote) = fake_descriptor_with_remote(Endpoint::Dst);
        ctx.src = src;
        ctx.dst = Some(dst);
        ctx.connected = true;

        let mut src_remote = src_remote;
        src_remote.write_all(b"last words").unwrap();
        drop(src_remote); // triggers EOF on ctx.src once its bytes are read

        std::thread::sleep(std::time::Duration::from_millis(20));
        let outcome = ctx.relay_readable(Endpoint::Src).unwrap();
        assert_eq!(outcome, RelayOutcome::Continue, "bytes still arrive before the EOF is observed");

        std::thread::sleep(std::time::Duration::from_millis(20));
        let outcome = ctx.relay_readable(Endpoint::Src).unwrap();
        assert_eq!(outcome, RelayOutcome::PeerEof);
        assert!(ctx.src.is_closed());
        assert!(!ctx.is_fully_closed(), "dst side is untouched and still open");

        dst_remote.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 64];
        let n = dst_remote.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"last words");
    }

    /// EOF observed before the connection finished connecting is the
    /// warning-level case and terminates immediately rather than waiting
    /// for a peer that was never wired up.
    #[test]
    fn eof_before_connected_terminates() {
        let (_map, mut ctx) = new_test_conn();
        let (src, src_remote) = fake_descriptor_with_remote(Endpoint::Src);
        ctx.src = src;
        drop(src_remote);
        std::thread::sleep(std::time::Duration::from_millis(20));

        let outcome = ctx.relay_readable(Endpoint::Src).unwrap();
        assert_eq!(outcome, RelayOutcome::PeerEof);
        assert!(ctx.term);
    }

}
