//! Filter collaborator interface.
//!
//! The engine consults a filter at three points: server-first connected,
//! first HTTP request line, and TLS handshake completion. Rule storage and
//! matching live outside this crate — only the interface is specified.

use std::net::SocketAddr;

/// Action selected by a filter decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    /// Allow the connection to proceed as configured (TCP/TLS/etc).
    Pass,
    /// Terminate the connection immediately.
    Block,
    /// Force divert mode (`dst` connects to the configured intermediary).
    Divert,
    /// Force split mode (`dst` aliases `srvdst`).
    Split,
}

/// Per-logger enable bits a filter rule may override.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogBits {
    pub connect: bool,
    pub master: bool,
    pub cert: bool,
    pub content: bool,
    pub pcap: bool,
}

/// The result of one filter consultation. `precedence` may only rise
/// monotonically across a single connection's lifetime.
#[derive(Debug, Clone)]
pub struct FilterDecision {
    pub action: FilterAction,
    pub log_bits: LogBits,
    pub precedence: u32,
}

/// Context available to the filter at "server-first connected" time.
#[derive(Debug, Clone)]
pub struct ConnectContext {
    pub src_addr: SocketAddr,
    pub dst_addr: SocketAddr,
    pub sni: Option<String>,
}

/// Context available at "first HTTP request line" time.
#[derive(Debug, Clone)]
pub struct HttpContext {
    pub method: String,
    pub host: String,
    pub path: String,
}

/// Context available at "TLS handshake completion" time.
#[derive(Debug, Clone)]
pub struct TlsContext {
    pub sni: Option<String>,
    pub negotiated_cert_cn: Option<String>,
}

/// External filter collaborator. Implementations live outside this crate;
/// the engine only calls through this trait.
pub trait Filter: Send + Sync {
    fn on_connect(&self, ctx: &ConnectContext) -> FilterDecision;
    fn on_http_request(&self, ctx: &HttpContext) -> FilterDecision;
    fn on_tls_handshake(&self, ctx: &TlsContext) -> FilterDecision;

    /// Whether this filter represents actually configured rules, as opposed
    /// to the no-op default. New connections default their log bits on when
    /// no rules are configured (ported from `proxy_conn_ctx_new`'s
    /// `opts->filter_rules` check).
    fn is_configured(&self) -> bool {
        true
    }
}

/// Default filter that passes everything through, used when no rule file
/// is configured. Rule loading is out of scope for this crate.
pub struct PassthroughFilter;

impl Filter for PassthroughFilter {
    fn on_connect(&self, _ctx: &ConnectContext) -> FilterDecision {
        FilterDecision { action: FilterAction::Pass, log_bits: LogBits::default(), precedence: 0 }
    }

    fn on_http_request(&self, _ctx: &HttpContext) -> FilterDecision {
        FilterDecision { action: FilterAction::Pass, log_bits: LogBits::default(), precedence: 0 }
    }

    fn on_tls_handshake(&self, _ctx: &TlsContext) -> FilterDecision {
        FilterDecision { action: FilterAction::Pass, log_bits: LogBits::default(), precedence: 0 }
    }

    fn is_configured(&self) -> bool {
        false
    }
}
