//! Protocol dispatch layer.
//!
//! Each connection carries one `Box<dyn ProtocolHandler>` selected at setup
//! time by [`select_proto`], mirroring `proxy.c`'s `proxy_setup_proto`. This
//! is the tagged-variant/polymorphic-handler alternative to the original's
//! vtable of function pointers.

pub mod autossl;
pub mod http;
pub mod pop3;
pub mod smtp;
pub mod tcp;
pub mod tls;

use crate::cache::manager::CacheManager;
use crate::certforge::CertForger;
use crate::conn::ConnCtx;
use crate::error::Result;
use crate::filter::Filter;
use crate::net::Endpoint;
use std::sync::Arc;

/// Protocol tag, one per listener configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoKind {
    Passthrough,
    Tcp,
    Ssl,
    Http,
    Https,
    Pop3,
    Pop3s,
    Smtp,
    Smtps,
    AutoSsl,
}

/// Listener-spec protocol selection flags, as consumed by [`select_proto`].
/// Field names and precedence match `proxy_setup_proto` exactly.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoFlags {
    pub upgrade: bool,
    pub http: bool,
    pub pop3: bool,
    pub smtp: bool,
    pub ssl: bool,
}

/// Ports `proxy_setup_proto`'s selection order verbatim: `upgrade` wins
/// first, then `http`, then `pop3`, then `smtp`, then bare `ssl`, else TCP.
pub fn select_proto(flags: ProtoFlags) -> ProtoKind {
    if flags.upgrade {
        ProtoKind::AutoSsl
    } else if flags.http {
        if flags.ssl { ProtoKind::Https } else { ProtoKind::Http }
    } else if flags.pop3 {
        if flags.ssl { ProtoKind::Pop3s } else { ProtoKind::Pop3 }
    } else if flags.smtp {
        if flags.ssl { ProtoKind::Smtps } else { ProtoKind::Smtp }
    } else if flags.ssl {
        ProtoKind::Ssl
    } else {
        ProtoKind::Tcp
    }
}

/// Collaborators a handler needs beyond the bytes on the wire: the
/// forged-cert cache and its forger (TLS variants), and the filter for the
/// "first HTTP request line" / "TLS handshake completion" consultation
/// points. The "server-first connected" consultation happens in the thread
/// pool itself, before a handler's `on_connect` runs.
#[derive(Clone)]
pub struct HandlerDeps {
    pub cache: Arc<CacheManager>,
    pub forger: Arc<dyn CertForger>,
    pub filter: Arc<dyn Filter>,
}

/// Builds the handler for a connection's selected [`ProtoKind`], mirroring
/// `proxy_setup_proto`'s dispatch to `prototcp_setup`/`protossl_setup`/etc.
pub fn build_handler(kind: ProtoKind, deps: HandlerDeps) -> Box<dyn ProtocolHandler> {
    match kind {
        ProtoKind::Passthrough | ProtoKind::Tcp => Box::new(tcp::TcpHandler),
        ProtoKind::Ssl | ProtoKind::Https | ProtoKind::Pop3s | ProtoKind::Smtps => Box::new(tls::TlsHandler::new(kind, deps)),
        ProtoKind::Http => Box::new(http::HttpHandler::new(deps)),
        ProtoKind::Pop3 => Box::new(pop3::Pop3Handler::new(deps)),
        ProtoKind::Smtp => Box::new(smtp::SmtpHandler::new(deps)),
        ProtoKind::AutoSsl => Box::new(autossl::AutoSslHandler::new(deps)),
    }
}

/// Per-connection protocol handler. The TCP handler populates every method
/// with baseline passthrough relay behavior; other protocols call it first
/// and layer interception on top, overriding only the slots they care about.
pub trait ProtocolHandler: Send {
    fn kind(&self) -> ProtoKind;

    /// Runs once, before any callback fires.
    fn init_conn(&mut self, conn: &mut ConnCtx) -> Result<()> {
        tcp::init_conn(conn)
    }

    /// Fires on `srvdst`'s connect-completed event.
    fn on_connect(&mut self, conn: &mut ConnCtx) -> Result<()> {
        tcp::on_connect(conn)
    }

    /// Fires on a readable event for `which`.
    fn on_readable(&mut self, which: Endpoint, conn: &mut ConnCtx) -> Result<()> {
        tcp::on_readable(which, conn)
    }

    /// Fires on a writable event for `which`.
    fn on_writable(&mut self, which: Endpoint, conn: &mut ConnCtx) -> Result<()> {
        tcp::on_writable(which, conn)
    }

    /// Validates newly relayed bytes; `false` triggers the fixed protocol
    /// error banner. TCP has nothing to validate.
    fn validate(&mut self, _data: &[u8]) -> bool {
        true
    }
}
