//! Bidirectional buffered socket endpoint (`src` / `dst` / `srvdst`).
//!
//! Grounded in `original_source/NIOMan/Classes/proto/prototcp.c`'s
//! bufferevent setup and `pxy_try_set_watermark`/`pxy_try_unset_watermark`.

use crate::error::{Error, Result};
use crate::net::buffer::Buffer;
use mio::net::TcpStream;
use std::io::{self, Read, Write};

/// Default high watermark on a descriptor's output buffer (256 KiB).
pub const DEFAULT_HIGH_WATERMARK: usize = 256 * 1024;

/// Which of the three sockets in a connection an event fired for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Src,
    Dst,
    Srvdst,
}

/// Outcome of a single non-blocking attempt to read from the socket.
/// Keeping EOF distinct from `WouldBlock` and from a hard error is what
/// lets callers implement half-close instead of tearing the connection
/// down on every orderly peer shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were read into the input buffer.
    Data(usize),
    /// No data available right now (EAGAIN); try again on the next
    /// readable event.
    WouldBlock,
    /// Orderly EOF: the peer closed its write side.
    Eof,
}

/// One of the three per-connection sockets, with its own inbound/outbound
/// buffers, TLS session slot, and close state.
///
/// Invariant: `closed` transitions false -> true exactly once; after that no
/// further writes may be enqueued (enforced by `enqueue_write` returning an
/// error rather than silently dropping data).
pub struct Descriptor {
    pub endpoint: Endpoint,
    stream: Option<TcpStream>,
    inbuf: Buffer,
    outbuf: Buffer,
    closed: bool,
    connected: bool,
    high_watermark: usize,
    low_watermark: usize,
    watermark_set: bool,
    /// Set when a TLS session has been established on this descriptor.
    /// The session payload itself is opaque to the engine (stored by the
    /// protocol handler through `CertForger`/cache interfaces).
    pub tls_active: bool,
}

impl Descriptor {
    pub fn new(endpoint: Endpoint, stream: TcpStream) -> Self {
        Self {
            endpoint,
            stream: Some(stream),
            inbuf: Buffer::with_capacity(16 * 1024),
            outbuf: Buffer::with_capacity(16 * 1024),
            closed: false,
            connected: false,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            low_watermark: DEFAULT_HIGH_WATERMARK / 2,
            watermark_set: false,
            tls_active: false,
        }
    }

    pub fn with_watermarks(mut self, high: usize) -> Self {
        self.high_watermark = high;
        self.low_watermark = high / 2;
        self
    }

    pub fn mio_stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    pub fn mio_stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn set_connected(&mut self) {
        self.connected = true;
    }

    /// Marks this descriptor closed. Idempotent at the call site's
    /// discretion, but only the first call has effect (invariant: 0->1 once).
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.stream = None;
        }
    }

    pub fn readable_data(&self) -> &[u8] {
        self.inbuf.readable()
    }

    pub fn consume_read(&mut self, count: usize) {
        self.inbuf.advance_read(count);
    }

    pub fn has_pending_write(&self) -> bool {
        !self.outbuf.is_empty()
    }

    pub fn out_len(&self) -> usize {
        self.outbuf.len()
    }

    /// Reads available bytes from the socket into the input buffer.
    /// Returns [`ReadOutcome::WouldBlock`] on EAGAIN and
    /// [`ReadOutcome::Eof`] on an orderly `read() == 0`; only a genuine
    /// socket error is surfaced as `Err`.
    pub fn read_into_buffer(&mut self) -> Result<ReadOutcome> {
        let stream = self.stream.as_mut().ok_or_else(|| Error::proxy("read on closed descriptor"))?;
        let writable = self.inbuf.writable();
        match stream.read(writable) {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(n) => {
                self.inbuf.advance_write(n);
                Ok(ReadOutcome::Data(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(e) => Err(Error::Io { source: e }),
        }
    }

    /// Appends data to this descriptor's output buffer. Returns the new
    /// fill level so the caller can check watermark crossing. Grows the
    /// buffer to fit the whole slice in one shot rather than copying a
    /// truncated prefix.
    pub fn enqueue_write(&mut self, data: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(Error::proxy("enqueue on closed descriptor"));
        }
        self.outbuf.reserve(data.len());
        let writable = self.outbuf.writable();
        writable[..data.len()].copy_from_slice(data);
        self.outbuf.advance_write(data.len());
        Ok(self.outbuf.len())
    }

    /// Drains as much of the output buffer to the socket as will fit without
    /// blocking. Returns bytes written.
    pub fn write_from_buffer(&mut self) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or_else(|| Error::proxy("write on closed descriptor"))?;
        let readable = self.outbuf.readable();
        if readable.is_empty() {
            return Ok(0);
        }
        match stream.write(readable) {
            Ok(n) => {
                self.outbuf.advance_read(n);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(Error::Io { source: e }),
        }
    }

    /// True if the output buffer just crossed above the high watermark and
    /// the watermark wasn't already set (i.e. this is the edge, not the level).
    pub fn crossed_high_watermark(&mut self) -> bool {
        if !self.watermark_set && self.outbuf.len() >= self.high_watermark {
            self.watermark_set = true;
            true
        } else {
            false
        }
    }

    /// True if the output buffer just dropped below the low watermark and
    /// the watermark was previously set (the drain edge).
    pub fn crossed_low_watermark(&mut self) -> bool {
        if self.watermark_set && self.outbuf.len() <= self.low_watermark {
            self.watermark_set = false;
            true
        } else {
            false
        }
    }

    pub fn watermark_set(&self) -> bool {
        self.watermark_set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_stream() -> TcpStream {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        TcpStream::from_std(client)
    }

    #[test]
    fn watermark_hysteresis() {
        let mut d = Descriptor::new(Endpoint::Src, fake_stream()).with_watermarks(100);
        assert!(!d.crossed_high_watermark());
        let data = vec![0u8; 120];
        d.enqueue_write(&data).unwrap();
        assert!(d.crossed_high_watermark());
        assert!(!d.crossed_high_watermark(), "must not re-fire until it drains");
        d.consume_read(0); // no-op, outbuf unaffected by inbuf consume
    }

    /// A single write much larger than the descriptor's starting outbuf
    /// capacity must land whole, not get truncated to one doubling step.
    #[test]
    fn enqueue_write_does_not_truncate_large_bursts() {
        let mut d = Descriptor::new(Endpoint::Dst, fake_stream());
        let payload = vec![9u8; 64 * 1024];
        d.enqueue_write(&payload).unwrap();
        assert_eq!(d.out_len(), payload.len());
        assert_eq!(d.outbuf.readable(), &payload[..]);
    }

    #[test]
    fn close_is_one_way() {
        let mut d = Descriptor::new(Endpoint::Src, fake_stream());
        assert!(!d.is_closed());
        d.close();
        assert!(d.is_closed());
        assert!(d.enqueue_write(b"x").is_err());
    }
}
