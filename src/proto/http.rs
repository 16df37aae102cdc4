//! Plain HTTP handler.
//!
//! Layers a single consultation point over `prototcp.c`'s baseline relay the
//! same way the original's protocol-specific setups call `prototcp_setup`
//! first, overriding only the slots it cares about. Only the first request
//! line of the first `src`-side read is inspected; once relayed, bytes flow
//! through the generic TCP path for the rest of the connection's life.
//! Wire-format details beyond this validation hook live outside this crate.

use crate::conn::{ConnCtx, TermRequestor, SSLPROXY_KEY};
use crate::error::Result;
use crate::filter::{FilterAction, HttpContext};
use crate::net::Endpoint;
use crate::proto::{tcp, HandlerDeps, ProtoKind, ProtocolHandler};
use std::sync::Arc;
use tracing::trace;

pub struct HttpHandler {
    filter: Arc<dyn crate::filter::Filter>,
    request_line_seen: bool,
}

impl HttpHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { filter: deps.filter, request_line_seen: false }
    }

    fn consult_on_first_line(&mut self, conn: &mut ConnCtx) {
        let Some(src) = conn.descriptor(Endpoint::Src) else { return };
        let Some(line) = first_line(src.readable_data()) else { return };
        let Some((method, path)) = parse_request_line(&line) else { return };
        let host = extract_host_header(src.readable_data()).unwrap_or_default();

        let decision = self.filter.on_http_request(&HttpContext { method, host, path });
        conn.raise_precedence(decision.precedence);
        if self.filter.is_configured() {
            conn.log_bits = decision.log_bits;
        }
        match decision.action {
            FilterAction::Block => conn.terminate(TermRequestor::Server),
            FilterAction::Divert => conn.divert = true,
            _ => {}
        }
        conn.sslproxy_header = Some(format!("{SSLPROXY_KEY} {}", conn.dst_addr));
        self.request_line_seen = true;
        trace!(conn_id = ?conn.id, "HTTP request line consulted");
    }
}

impl ProtocolHandler for HttpHandler {
    fn kind(&self) -> ProtoKind {
        ProtoKind::Http
    }

    fn init_conn(&mut self, conn: &mut ConnCtx) -> Result<()> {
        tcp::init_conn(conn)
    }

    fn on_connect(&mut self, conn: &mut ConnCtx) -> Result<()> {
        tcp::on_connect(conn)
    }

    fn on_readable(&mut self, which: Endpoint, conn: &mut ConnCtx) -> Result<()> {
        if which == Endpoint::Src && !self.request_line_seen {
            if let Some(src) = conn.descriptor_mut(Endpoint::Src) {
                let _ = src.read_into_buffer();
            }
            self.consult_on_first_line(conn);
        }
        tcp::on_readable(which, conn)
    }

    fn on_writable(&mut self, which: Endpoint, conn: &mut ConnCtx) -> Result<()> {
        tcp::on_writable(which, conn)
    }
}

/// Returns the first CRLF- or LF-terminated line, if one is complete.
fn first_line(buf: &[u8]) -> Option<Vec<u8>> {
    let end = buf.iter().position(|&b| b == b'\n')?;
    let line = &buf[..end];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Some(line.to_vec())
}

fn parse_request_line(line: &[u8]) -> Option<(String, String)> {
    let text = std::str::from_utf8(line).ok()?;
    let mut parts = text.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    parts.next()?; // HTTP version
    Some((method, path))
}

fn extract_host_header(buf: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(buf).ok()?;
    for line in text.split("\r\n") {
        if let Some(rest) = line.strip_prefix("Host: ").or_else(|| line.strip_prefix("host: ")) {
            return Some(rest.trim().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_request_line() {
        let (method, path) = parse_request_line(b"GET /index.html HTTP/1.1").unwrap();
        assert_eq!(method, "GET");
        assert_eq!(path, "/index.html");
    }

    #[test]
    fn extracts_host_header_case_insensitively() {
        let buf = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(extract_host_header(buf), Some("example.com".to_string()));
    }

    #[test]
    fn first_line_requires_newline() {
        assert_eq!(first_line(b"GET / HTTP/1.1"), None);
        assert_eq!(first_line(b"GET / HTTP/1.1\r\n"), Some(b"GET / HTTP/1.1".to_vec()));
    }
}
