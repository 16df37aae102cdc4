//! Worker thread pool: one `mio::Poll` event loop per OS thread, with
//! connections load-balanced across threads by currently assigned
//! connection count.
//!
//! Grounded in `original_source/NIOMan/Classes/pxythr/pxythrmgr.c`
//! (`pxy_thrmgr_run` thread/evbase creation, `pxy_thrmgr_assign_thr`'s
//! minimum-load pick, explicitly "does not use mutexes... does not need to
//! be so accurate about balancing thread loads") and `pxythr.c` (`pxy_thr`,
//! the per-thread event loop body and its periodic idle-sweep/stats timer).
//! `evbase`/`dnsbase` become one `mio::Poll` and one [`crate::dns::Resolver`]
//! per thread; the intrusive per-thread connection list becomes a
//! `slotmap` arena.

use crate::cache::manager::CacheManager;
use crate::conn::{ConnCtx, TermRequestor};
use crate::config::{EngineConfig, ListenerSpec};
use crate::dns::Resolver;
use crate::error::{Error, Result};
use crate::filter::{ConnectContext, Filter, FilterAction};
use crate::logging::LogSinks;
use crate::metrics::{MetricsRegistry, ThreadStats};
use crate::net::{self, Descriptor, Endpoint};
use crate::certforge::CertForger;
use crate::proto::{self, HandlerDeps, ProtoFlags, ProtocolHandler};
use crate::timer::{TimerCallback, TimerToken, TimerWheel};

use mio::net::TcpStream as MioTcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use slotmap::{SecondaryMap, SlotMap};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Reserved token for the cross-thread wakeup eventfd/pipe.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Collaborators shared read-only (behind `Arc`) across every worker thread
/// and the listener/orchestrator.
pub struct EngineShared {
    pub cache: Arc<CacheManager>,
    pub forger: Arc<dyn CertForger>,
    pub filter: Arc<dyn Filter>,
    pub logs: Arc<LogSinks>,
    pub metrics: Arc<MetricsRegistry>,
}

impl EngineShared {
    fn handler_deps(self: &Arc<Self>) -> HandlerDeps {
        HandlerDeps { cache: self.cache.clone(), forger: self.forger.clone(), filter: self.filter.clone() }
    }
}

/// One freshly accepted connection, handed from the listener to whichever
/// worker thread has the lowest load.
pub struct Assignment {
    pub stream: std::net::TcpStream,
    pub src_addr: SocketAddr,
    pub spec: Arc<ListenerSpec>,
}

enum WorkerMsg {
    Accept(Assignment),
    Shutdown,
}

/// mio tokens for a connection's up-to-three sockets. Tokens are a
/// worker-local numbering scheme; they never leave the worker that
/// allocated them, unlike `ConnId` which is meaningful only within the
/// same worker's arena anyway — connections never migrate threads after
/// the initial assignment.
#[derive(Default, Clone, Copy)]
struct ConnTokens {
    src: Option<Token>,
    dst: Option<Token>,
    srvdst: Option<Token>,
}

/// Flips a shared flag when a recurring timer fires. The actual sweep/stats
/// logic needs `&mut WorkerThread`, which a `TimerCallback` (`&self`, and
/// `Send + Sync` to live in the wheel) cannot hold; this is the seam that
/// hands control back to the single-threaded worker loop after
/// `advance_time` returns.
struct SweepSignal(Arc<AtomicBool>);
impl TimerCallback for SweepSignal {
    fn on_timer(&self, _token: TimerToken) -> Result<()> {
        self.0.store(true, Ordering::Relaxed);
        Ok(())
    }
    fn name(&self) -> &'static str {
        "idle-sweep-signal"
    }
}

struct StatsSignal(Arc<AtomicBool>);
impl TimerCallback for StatsSignal {
    fn on_timer(&self, _token: TimerToken) -> Result<()> {
        self.0.store(true, Ordering::Relaxed);
        Ok(())
    }
    fn name(&self) -> &'static str {
        "stats-signal"
    }
}

/// Runs one connection-handling OS thread: its own poll loop, connection
/// arena, DNS resolver, and stats record (`pxy_thr_ctx_t` equivalent).
struct WorkerThread {
    index: usize,
    task_id: String,
    poll: Poll,
    events: Events,
    rx: mpsc::Receiver<WorkerMsg>,
    conns: SlotMap<crate::conn::ConnId, ConnCtx>,
    tokens: SecondaryMap<crate::conn::ConnId, ConnTokens>,
    token_map: HashMap<Token, (crate::conn::ConnId, Endpoint)>,
    next_token: usize,
    #[allow(dead_code)]
    resolver: Resolver,
    timers: TimerWheel,
    idle_flag: Arc<AtomicBool>,
    stats_flag: Arc<AtomicBool>,
    stats: ThreadStats,
    engine: EngineConfig,
    shared: Arc<EngineShared>,
    load: Arc<AtomicUsize>,
}

impl WorkerThread {
    /// Takes the protocol handler out of `ctx` to call it with `&mut ctx`
    /// simultaneously, then puts it back. `ConnCtx` can't lend out `&mut
    /// self.proto` and `&mut self` at once, so the handler is parked behind
    /// a cheap placeholder for the duration of the call.
    fn with_proto<R>(ctx: &mut ConnCtx, f: impl FnOnce(&mut dyn ProtocolHandler, &mut ConnCtx) -> R) -> R {
        let mut proto = std::mem::replace(&mut ctx.proto, Box::new(proto::tcp::TcpHandler));
        let result = f(proto.as_mut(), ctx);
        ctx.proto = proto;
        result
    }

    fn run(mut self) {
        let idle_period = Duration::from_secs(self.engine.expired_conn_check_period_secs.max(1));
        let idle_signal = Arc::new(SweepSignal(self.idle_flag.clone()));
        let stats_signal = Arc::new(StatsSignal(self.stats_flag.clone()));
        self.timers.schedule_recurring(idle_period, idle_signal);
        self.timers.schedule_recurring(idle_period, stats_signal);

        loop {
            if let Err(e) = self.poll.poll(&mut self.events, Some(Duration::from_millis(250))) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!(thread = self.index, "poll error: {}", e);
                continue;
            }

            let mut woke = false;
            let fired_tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
            for token in fired_tokens {
                if token == WAKE_TOKEN {
                    woke = true;
                    continue;
                }
                self.dispatch(token);
            }
            if woke && !self.drain_incoming() {
                break;
            }

            self.reap_terminated();

            match self.timers.advance_time(Instant::now()) {
                Ok(fired) if fired > 0 => {
                    if self.idle_flag.swap(false, Ordering::Relaxed) {
                        self.sweep_idle();
                    }
                    if self.stats_flag.swap(false, Ordering::Relaxed) {
                        self.emit_stats();
                    }
                }
                Ok(_) => {}
                Err(e) => error!(thread = self.index, "timer advance failed: {}", e),
            }
        }
        debug!(thread = self.index, "worker thread exiting");
    }

    /// Drains accept handoffs queued by the listener. Returns `false` on a
    /// shutdown message.
    fn drain_incoming(&mut self) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(WorkerMsg::Accept(a)) => self.accept(a),
                Ok(WorkerMsg::Shutdown) => return false,
                Err(mpsc::TryRecvError::Empty) => return true,
                Err(mpsc::TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn accept(&mut self, a: Assignment) {
        if let Err(e) = a.stream.set_nonblocking(true) {
            warn!(thread = self.index, "failed to set nonblocking on accepted stream: {}", e);
            return;
        }
        let mio_stream = MioTcpStream::from_std(a.stream);
        let _ = net::tune_stream(&mio_stream);

        let dst_addr = match self.resolve_destination(&a.spec) {
            Ok(addr) => addr,
            Err(e) => {
                warn!(thread = self.index, listener = %a.spec.name(), "destination resolution failed: {}", e);
                self.stats.errors += 1;
                return;
            }
        };

        let srvdst_stream = match net::dial(dst_addr) {
            Ok(s) => s,
            Err(e) => {
                warn!(thread = self.index, %dst_addr, "dial failed: {}", e);
                self.stats.errors += 1;
                return;
            }
        };
        let _ = net::tune_stream(&srvdst_stream);

        let src = Descriptor::new(Endpoint::Src, mio_stream).with_watermarks(self.engine.high_watermark_bytes);
        let srvdst = Descriptor::new(Endpoint::Srvdst, srvdst_stream).with_watermarks(self.engine.high_watermark_bytes);

        let flags = proto_flags_for(&a.spec);
        let kind = proto::select_proto(flags);
        let handler = proto::build_handler(kind, self.shared.handler_deps());
        let has_filter = self.shared.filter.is_configured();

        let id = self.conns.insert_with_key(|id| {
            ConnCtx::new(id, self.task_id.clone(), a.src_addr, dst_addr, src, a.spec.divert, handler, has_filter)
        });

        let srvdst_token = Token(self.next_token);
        self.next_token += 1;

        if let Some(ctx) = self.conns.get_mut(id) {
            let mut srvdst = srvdst;
            if let Some(stream) = srvdst.mio_stream_mut() {
                if let Err(e) = self.poll.registry().register(stream, srvdst_token, Interest::WRITABLE) {
                    warn!(thread = self.index, "failed to register srvdst: {}", e);
                    self.conns.remove(id);
                    return;
                }
            }
            ctx.srvdst = Some(srvdst);
            Self::with_proto(ctx, |proto, ctx| {
                if let Err(e) = proto.init_conn(ctx) {
                    warn!("init_conn failed: {}", e);
                }
            });
        }
        self.token_map.insert(srvdst_token, (id, Endpoint::Srvdst));
        self.tokens.insert(id, ConnTokens { src: None, dst: None, srvdst: Some(srvdst_token) });

        self.load.fetch_add(1, Ordering::Relaxed);
        self.stats.max_load = self.stats.max_load.max(self.load.load(Ordering::Relaxed));
        trace!(thread = self.index, conn = ?id, %dst_addr, "connection accepted, dialing srvdst");
    }

    fn resolve_destination(&self, spec: &ListenerSpec) -> Result<SocketAddr> {
        match &spec.destination {
            crate::config::DestinationMode::Static(addr) => Ok(*addr),
            crate::config::DestinationMode::Nat(engine) => Err(Error::proxy(format!(
                "NAT destination lookup via engine '{engine}' requires a platform NAT backend, which is out of scope for this crate"
            ))),
        }
    }

    fn dispatch(&mut self, token: Token) {
        let Some(&(id, endpoint)) = self.token_map.get(&token) else { return };
        if endpoint == Endpoint::Srvdst {
            self.dispatch_srvdst_connect(id);
            return;
        }
        let Some(ctx) = self.conns.get_mut(id) else { return };

        let before = [Endpoint::Src, Endpoint::Dst].map(|e| ctx.descriptor(e).map(|d| d.watermark_set()));

        Self::with_proto(ctx, |proto, ctx| {
            if let Err(e) = proto.on_readable(endpoint, ctx) {
                warn!(conn = ?id, "on_readable failed: {}", e);
                ctx.terminate(TermRequestor::Server);
            }
            if let Err(e) = proto.on_writable(endpoint, ctx) {
                warn!(conn = ?id, "on_writable failed: {}", e);
                ctx.terminate(TermRequestor::Server);
            }
        });

        if let Some(ctx) = self.conns.get(id) {
            for (i, e) in [Endpoint::Src, Endpoint::Dst].into_iter().enumerate() {
                let after = ctx.descriptor(e).map(|d| d.watermark_set());
                match (before[i], after) {
                    (Some(false), Some(true)) => self.stats.watermark_set_count += 1,
                    (Some(true), Some(false)) => self.stats.watermark_unset_count += 1,
                    _ => {}
                }
            }
        }

        self.reconcile_interests(id);
    }

    /// Handles the `srvdst` writable event that signals connect completion
    /// (or failure): the "server-first connected" transition.
    fn dispatch_srvdst_connect(&mut self, id: crate::conn::ConnId) {
        let Some(ctx) = self.conns.get_mut(id) else { return };
        let Some(srvdst) = ctx.srvdst.as_ref() else { return };
        let Some(stream) = srvdst.mio_stream() else { return };

        match stream.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => {
                warn!(conn = ?id, "srvdst connect failed: {}", e);
                ctx.terminate(TermRequestor::Server);
                self.reconcile_interests(id);
                return;
            }
        }

        let decision = self.shared.filter.on_connect(&ConnectContext {
            src_addr: ctx.src_addr,
            dst_addr: ctx.dst_addr,
            sni: None,
        });
        ctx.raise_precedence(decision.precedence);
        if self.shared.filter.is_configured() {
            ctx.log_bits = decision.log_bits;
        }

        if decision.action == FilterAction::Block {
            ctx.terminate(TermRequestor::Server);
            self.reconcile_interests(id);
            return;
        }
        let force_divert = matches!(decision.action, FilterAction::Divert) || ctx.divert;

        let dst_descriptor = if force_divert && !ctx.divert {
            // Filter overrode split mode into divert mode: dial the same
            // destination again as a distinct `dst` socket.
            match net::dial(ctx.dst_addr) {
                Ok(stream) => {
                    let _ = net::tune_stream(&stream);
                    Some(Descriptor::new(Endpoint::Dst, stream).with_watermarks(self.engine.high_watermark_bytes))
                }
                Err(e) => {
                    warn!(conn = ?id, "divert dst dial failed: {}", e);
                    ctx.terminate(TermRequestor::Server);
                    self.reconcile_interests(id);
                    return;
                }
            }
        } else {
            // Divert mode with a caller-provided intermediary, or split
            // mode, both resolve to `None` here: divert's real dst is wired
            // by the TLS/HTTP handler's own `on_connect` override; split
            // mode transfers `srvdst` into `dst` inside `on_srvdst_connected`.
            None
        };

        ctx.divert = force_divert;
        if let Err(e) = ctx.on_srvdst_connected(dst_descriptor) {
            warn!(conn = ?id, "on_srvdst_connected failed: {}", e);
            ctx.terminate(TermRequestor::Server);
            self.reconcile_interests(id);
            return;
        }

        Self::with_proto(ctx, |proto, ctx| {
            if let Err(e) = proto.on_connect(ctx) {
                warn!(conn = ?id, "on_connect failed: {}", e);
                ctx.terminate(TermRequestor::Server);
            }
        });

        if let Some(toks) = self.tokens.get(id).copied() {
            if let Some(srvdst_token) = toks.srvdst {
                if let Some(ctx) = self.conns.get_mut(id) {
                    // `srvdst` either moved into `dst` (split) or is still
                    // present (divert, with a brand new `dst` beside it);
                    // either way the old writable-only registration must go.
                    if let Some(dst) = ctx.dst.as_mut() {
                        if ctx.srvdst.is_none() {
                            if let Some(stream) = dst.mio_stream_mut() {
                                let _ = self.poll.registry().deregister(stream);
                            }
                        }
                    }
                }
                self.token_map.remove(&srvdst_token);
            }
        }

        self.register_opened_gate(id);
        self.reconcile_interests(id);
    }

    /// Registers `src` (and `dst`, if present) for read/write polling now
    /// that the gate is open.
    fn register_opened_gate(&mut self, id: crate::conn::ConnId) {
        let Some(ctx) = self.conns.get_mut(id) else { return };
        let mut toks = self.tokens.get(id).copied().unwrap_or_default();

        if toks.src.is_none() {
            let token = Token(self.next_token);
            self.next_token += 1;
            if let Some(stream) = ctx.src.mio_stream_mut() {
                if self.poll.registry().register(stream, token, Interest::READABLE | Interest::WRITABLE).is_ok() {
                    self.token_map.insert(token, (id, Endpoint::Src));
                    toks.src = Some(token);
                }
            }
        }
        if toks.dst.is_none() {
            if let Some(dst) = ctx.dst.as_mut() {
                let token = Token(self.next_token);
                self.next_token += 1;
                if let Some(stream) = dst.mio_stream_mut() {
                    if self.poll.registry().register(stream, token, Interest::READABLE | Interest::WRITABLE).is_ok() {
                        self.token_map.insert(token, (id, Endpoint::Dst));
                        toks.dst = Some(token);
                    }
                }
            }
        }
        toks.srvdst = None;
        self.tokens.insert(id, toks);
    }

    /// Re-registers interest sets to reflect watermark backpressure: stop
    /// polling a peer's readable side once this side's output buffer is
    /// above the high watermark, resume once it drains.
    fn reconcile_interests(&mut self, id: crate::conn::ConnId) {
        let Some(ctx) = self.conns.get_mut(id) else { return };
        let toks = self.tokens.get(id).copied().unwrap_or_default();

        for (endpoint, token) in [(Endpoint::Src, toks.src), (Endpoint::Dst, toks.dst)] {
            let Some(token) = token else { continue };
            let Some(peer) = ConnCtx::peer_of(endpoint) else { continue };
            let Some(peer_desc) = ctx.descriptor(peer) else { continue };
            let wants_read = !peer_desc.watermark_set();
            let has_write = ctx.descriptor(endpoint).map(|d| d.has_pending_write()).unwrap_or(false);

            let interest = match (wants_read, has_write) {
                (true, true) => Interest::READABLE | Interest::WRITABLE,
                (true, false) => Interest::READABLE,
                (false, true) => Interest::WRITABLE,
                (false, false) => Interest::READABLE, // never fully silence a live endpoint
            };
            if let Some(stream) = ctx.descriptor_mut(endpoint).and_then(|d| d.mio_stream_mut()) {
                let _ = self.poll.registry().reregister(stream, token, interest);
            }
        }
    }

    /// Removes fully torn-down connections from the arena, submits a
    /// connect-log record, and decrements the thread's load.
    fn reap_terminated(&mut self) {
        let terminated: Vec<crate::conn::ConnId> =
            self.conns.iter().filter(|(_, c)| c.term && c.is_fully_closed()).map(|(id, _)| id).collect();

        for id in terminated {
            if let Some(mut ctx) = self.conns.remove(id) {
                let summary = ctx.teardown();
                if summary.log_connect {
                    let line = format!(
                        "CONN: task={} src={} dst={} in={} out={}",
                        ctx.task_id, ctx.src_addr, ctx.dst_addr, summary.in_bytes, summary.out_bytes
                    );
                    self.shared.logs.submit(crate::logging::LogRecord::connect(line));
                }
                self.stats.total_in_bytes += summary.in_bytes;
                self.stats.total_out_bytes += summary.out_bytes;
            }
            if let Some(toks) = self.tokens.remove(id) {
                for token in [toks.src, toks.dst, toks.srvdst].into_iter().flatten() {
                    self.token_map.remove(&token);
                }
            }
            self.load.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Idle-connection sweep: terminates connections whose `atime` is older
    /// than `conn_idle_timeout`.
    fn sweep_idle(&mut self) {
        let timeout = Duration::from_secs(self.engine.conn_idle_timeout_secs);
        let now = Instant::now();
        let mut timed_out = 0u64;
        for (_, ctx) in self.conns.iter_mut() {
            if !ctx.term && ctx.idle_for(now) > timeout {
                ctx.terminate(crate::conn::TermRequestor::Server);
                timed_out += 1;
            }
        }
        if timed_out > 0 {
            self.stats.timedout_conns += timed_out;
            debug!(thread = self.index, timed_out, "idle sweep terminated connections");
        }
    }

    fn emit_stats(&mut self) {
        self.stats.stats_id += 1;
        self.stats.max_load = self.stats.max_load.max(self.load.load(Ordering::Relaxed));
        let line = self.stats.render_stats_line(self.index);
        tracing::info!("{}", line);
        self.shared.metrics.set_gauge(
            &format!("worker_{}_load", self.index),
            "current connection count for this worker thread",
            self.load.load(Ordering::Relaxed) as u64,
        );
        self.stats.watermark_set_count = 0;
        self.stats.watermark_unset_count = 0;
        self.stats.timedout_conns = 0;
        self.stats.errors = 0;
    }
}

fn proto_flags_for(spec: &ListenerSpec) -> ProtoFlags {
    use crate::config::ListenerProto;
    ProtoFlags {
        upgrade: spec.proto == ListenerProto::Upgrade,
        http: spec.proto == ListenerProto::Http,
        pop3: spec.proto == ListenerProto::Pop3,
        smtp: spec.proto == ListenerProto::Smtp,
        ssl: spec.proto == ListenerProto::Ssl,
    }
}

/// A running worker's externally visible handle: its assignment channel,
/// wakeup, and load counter, used by the listener's thread-assignment pick.
struct WorkerHandle {
    tx: mpsc::Sender<WorkerMsg>,
    waker: Arc<Waker>,
    load: Arc<AtomicUsize>,
    join: JoinHandle<()>,
}

/// The thread pool proper: starts `n` worker threads and routes accepted
/// connections to whichever currently has the fewest. Assignment is racy
/// by design — exactness is not required.
pub struct ThreadPool {
    handles: Vec<WorkerHandle>,
}

impl ThreadPool {
    pub fn start(engine: EngineConfig, task_id: String, shared: Arc<EngineShared>) -> Result<Self> {
        let n = engine.worker_threads.unwrap_or_else(num_cpus::get).max(1);
        let mut handles = Vec::with_capacity(n);

        for index in 0..n {
            let poll = Poll::new().map_err(|e| Error::reactor(format!("failed to create poll for worker {index}: {e}")))?;
            let waker = Arc::new(
                Waker::new(poll.registry(), WAKE_TOKEN)
                    .map_err(|e| Error::reactor(format!("failed to create waker for worker {index}: {e}")))?,
            );
            let (tx, rx) = mpsc::channel();
            let load = Arc::new(AtomicUsize::new(0));

            let worker = WorkerThread {
                index,
                task_id: task_id.clone(),
                poll,
                events: Events::with_capacity(1024),
                rx,
                conns: SlotMap::with_key(),
                tokens: SecondaryMap::new(),
                token_map: HashMap::new(),
                next_token: 0,
                resolver: Resolver::new(&[]),
                timers: TimerWheel::new(),
                idle_flag: Arc::new(AtomicBool::new(false)),
                stats_flag: Arc::new(AtomicBool::new(false)),
                stats: ThreadStats::default(),
                engine: engine.clone(),
                shared: shared.clone(),
                load: load.clone(),
            };

            let join = std::thread::Builder::new()
                .name(format!("relayforge-worker-{index}"))
                .spawn(move || worker.run())
                .map_err(|e| Error::reactor(format!("failed to spawn worker {index}: {e}")))?;

            handles.push(WorkerHandle { tx, waker, load, join });
        }

        debug!(workers = n, "thread pool started");
        Ok(Self { handles })
    }

    /// Assigns one accepted connection to the least-loaded worker. Reading
    /// every worker's load without synchronization is intentional: exactness
    /// isn't required, only rough balance.
    pub fn assign(&self, assignment: Assignment) -> Result<()> {
        let (index, handle) = self
            .handles
            .iter()
            .enumerate()
            .min_by_key(|(_, h)| h.load.load(Ordering::Relaxed))
            .ok_or_else(|| Error::reactor("thread pool has no workers"))?;

        handle
            .tx
            .send(WorkerMsg::Accept(assignment))
            .map_err(|_| Error::reactor(format!("worker {index} channel closed")))?;
        handle.waker.wake().map_err(|e| Error::reactor(format!("failed to wake worker {index}: {e}")))?;
        Ok(())
    }

    /// Signals every worker to stop and joins all threads.
    pub fn shutdown(self) {
        for handle in &self.handles {
            let _ = handle.tx.send(WorkerMsg::Shutdown);
            let _ = handle.waker.wake();
        }
        for handle in self.handles {
            if handle.join.join().is_err() {
                error!("worker thread panicked during shutdown");
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    pub fn total_load(&self) -> usize {
        self.handles.iter().map(|h| h.load.load(Ordering::Relaxed)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::cert_bundle::CertBundle;
    use crate::config::{EngineConfig, ListenerProto};
    use crate::filter::PassthroughFilter;

    struct NullForger;
    impl CertForger for NullForger {
        fn forge(&self, _origin_cert_der: &[u8]) -> Result<CertBundle> {
            Ok(CertBundle::new3(Default::default()))
        }
        fn fingerprint(&self, _origin_cert_der: &[u8]) -> [u8; 32] {
            [0u8; 32]
        }
    }

    fn shared() -> Arc<EngineShared> {
        Arc::new(EngineShared {
            cache: Arc::new(CacheManager::preinit()),
            forger: Arc::new(NullForger),
            filter: Arc::new(PassthroughFilter),
            logs: Arc::new(LogSinks::new(64)),
            metrics: Arc::new(MetricsRegistry::new()),
        })
    }

    #[test]
    fn thread_pool_starts_and_shuts_down() {
        let engine = EngineConfig { worker_threads: Some(2), ..EngineConfig::default() };
        let pool = ThreadPool::start(engine, "t".into(), shared()).unwrap();
        assert_eq!(pool.worker_count(), 2);
        assert_eq!(pool.total_load(), 0);
        pool.shutdown();
    }

    #[test]
    fn assign_routes_to_least_loaded_worker() {
        let engine = EngineConfig { worker_threads: Some(2), ..EngineConfig::default() };
        let pool = ThreadPool::start(engine, "t".into(), shared()).unwrap();

        // The dial to a closed local port fails asynchronously inside the
        // worker, but the assignment/load-increment path is exercised end
        // to end via the real channel + waker handoff.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();

        let spec = Arc::new(ListenerSpec {
            proto: ListenerProto::Tcp,
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            destination: crate::config::DestinationMode::Static("127.0.0.1:1".parse().unwrap()),
            sni_port: None,
            divert_addr: None,
            return_addr: None,
            divert: true,
        });

        pool.assign(Assignment { stream: client, src_addr: addr, spec }).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        pool.shutdown();
    }
}
