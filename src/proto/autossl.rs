//! Autossl handler: starts as plain TCP, upgrades to TLS interception once a
//! `STARTTLS`-style command line is observed.
//!
//! The exact command syntax is protocol-specific (STARTTLS for SMTP/IMAP,
//! STLS for POP3) and wire-format details beyond the validation hook live
//! outside this crate, so the scan below matches any line
//! containing the case-insensitive substring "starttls" or "stls" — broad
//! enough to catch the common cases without parsing a specific protocol
//! grammar. Once matched, every later byte is handled exactly as the plain
//! TLS handler would (SNI peek, forged-cert cache), by delegating into an
//! inner [`TlsHandler`].

use crate::conn::ConnCtx;
use crate::error::Result;
use crate::net::Endpoint;
use crate::proto::tls::TlsHandler;
use crate::proto::{tcp, HandlerDeps, ProtoKind, ProtocolHandler};

pub struct AutoSslHandler {
    upgraded: bool,
    tls: TlsHandler,
}

impl AutoSslHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { upgraded: false, tls: TlsHandler::new(ProtoKind::Ssl, deps) }
    }

    fn saw_starttls(conn: &ConnCtx) -> bool {
        let Some(src) = conn.descriptor(Endpoint::Src) else { return false };
        let text = String::from_utf8_lossy(src.readable_data()).to_lowercase();
        text.contains("starttls") || text.contains("stls")
    }
}

impl ProtocolHandler for AutoSslHandler {
    fn kind(&self) -> ProtoKind {
        ProtoKind::AutoSsl
    }

    fn init_conn(&mut self, conn: &mut ConnCtx) -> Result<()> {
        tcp::init_conn(conn)
    }

    fn on_connect(&mut self, conn: &mut ConnCtx) -> Result<()> {
        tcp::on_connect(conn)
    }

    fn on_readable(&mut self, which: Endpoint, conn: &mut ConnCtx) -> Result<()> {
        if !self.upgraded {
            if which == Endpoint::Src {
                if let Some(src) = conn.descriptor_mut(Endpoint::Src) {
                    let _ = src.read_into_buffer();
                }
                if Self::saw_starttls(conn) {
                    tracing::trace!(conn_id = ?conn.id, "autossl upgraded to TLS interception");
                    self.upgraded = true;
                }
            }
            return tcp::on_readable(which, conn);
        }
        self.tls.on_readable(which, conn)
    }

    fn on_writable(&mut self, which: Endpoint, conn: &mut ConnCtx) -> Result<()> {
        tcp::on_writable(which, conn)
    }
}
