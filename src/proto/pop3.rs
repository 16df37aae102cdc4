//! POP3 handler.
//!
//! Wire-format details of POP3 beyond the validation hook contract live
//! outside this crate — this delegates every callback to `tcp::*`, the same
//! baseline every protocol handler layers over. `deps` is retained so a
//! future STLS-aware validator can reach the filter/cache collaborators
//! without a signature change.

use crate::conn::ConnCtx;
use crate::error::Result;
use crate::net::Endpoint;
use crate::proto::{tcp, HandlerDeps, ProtoKind, ProtocolHandler};

pub struct Pop3Handler {
    #[allow(dead_code)]
    deps: HandlerDeps,
}

impl Pop3Handler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { deps }
    }
}

impl ProtocolHandler for Pop3Handler {
    fn kind(&self) -> ProtoKind {
        ProtoKind::Pop3
    }

    fn init_conn(&mut self, conn: &mut ConnCtx) -> Result<()> {
        tcp::init_conn(conn)
    }

    fn on_connect(&mut self, conn: &mut ConnCtx) -> Result<()> {
        tcp::on_connect(conn)
    }

    fn on_readable(&mut self, which: Endpoint, conn: &mut ConnCtx) -> Result<()> {
        tcp::on_readable(which, conn)
    }

    fn on_writable(&mut self, which: Endpoint, conn: &mut ConnCtx) -> Result<()> {
        tcp::on_writable(which, conn)
    }
}
