//! relayforge: a TLS-intercepting man-in-the-middle forwarding proxy's
//! connection engine.
//!
//! For each accepted TCP connection the engine opens a matching connection
//! to the real destination, transparently intercepts TLS by forging a
//! server certificate signed by a local CA, and relays cleartext bytes
//! between client and server while exposing them to observation, filtering,
//! and logging.
//!
//! This crate is the connection engine proper: the worker thread pool and
//! load balancer, the paired connection state machine, protocol dispatch,
//! the certificate-forgery cache manager, and the bounded logging queue.
//! Option parsing, rule-file loading, certificate signing, the logger's
//! file/pcap writers, and deep protocol parsing are external collaborators
//! reached through the narrow traits in [`certforge`], [`filter`], and
//! [`privsep`].

#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![allow(clippy::type_complexity)]

pub mod cache;
pub mod certforge;
pub mod conn;
pub mod config;
pub mod dns;
pub mod error;
pub mod filter;
pub mod listener;
pub mod logging;
pub mod metrics;
pub mod net;
pub mod privsep;
pub mod proto;
pub mod queue;
pub mod reactor;
pub mod timer;

pub use config::{EngineConfig, ProxyConfig};
pub use error::{Error, Result};
pub use reactor::{EngineShared, ThreadPool};

use crate::cache::manager::CacheManager;
use crate::certforge::CertForger;
use crate::filter::Filter;
use crate::logging::LogSinks;
use crate::metrics::MetricsRegistry;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Owns the running engine: the worker thread pool, the listener set feeding
/// it, and the collaborators shared across both.
///
/// `forger` and `filter` are supplied by the embedder: certificate signing
/// and rule matching live outside this crate.
pub struct Engine {
    pub shared: Arc<EngineShared>,
    pool: ThreadPool,
    listeners: listener::ListenerSet,
}

impl Engine {
    /// Validates `config`, creates the four caches, starts the worker pool,
    /// and binds every configured listener: creates the event base, binds
    /// one `evconnlistener` per proxy spec, and starts the worker pool.
    pub fn start(config: ProxyConfig, forger: Arc<dyn CertForger>, filter: Arc<dyn Filter>) -> Result<Self> {
        config.validate().map_err(|e| Error::config(e.to_string()))?;

        let shared = Arc::new(EngineShared {
            cache: Arc::new(CacheManager::preinit()),
            forger,
            filter,
            logs: Arc::new(LogSinks::new(config.engine.log_queue_capacity)),
            metrics: Arc::new(MetricsRegistry::new()),
        });

        let pool = ThreadPool::start(config.engine.clone(), config.task_id.clone(), shared.clone())?;
        let listeners = listener::ListenerSet::bind(&config.listeners)?;

        info!(listeners = config.listeners.len(), workers = pool.worker_count(), "engine started");
        Ok(Self { shared, pool, listeners })
    }

    /// Runs the accept loop until `should_stop` returns true, interleaving
    /// cache-manager GC on `cache_gc_interval_secs` (a 60-second timer by
    /// default) between polls.
    pub fn run(&mut self, engine: &EngineConfig, should_stop: impl Fn() -> bool) -> Result<()> {
        let gc_interval = Duration::from_secs(engine.cache_gc_interval_secs.max(1));
        let mut last_gc = std::time::Instant::now();

        while !should_stop() {
            self.listeners.poll_once(&self.pool, Duration::from_millis(250))?;
            if last_gc.elapsed() >= gc_interval {
                self.shared.cache.gc();
                last_gc = std::time::Instant::now();
            }
        }
        Ok(())
    }

    /// Graceful shutdown: stop accepting, unblock the log queues, join every
    /// worker thread, tear down the caches in reverse order.
    pub fn shutdown(self) {
        self.pool.shutdown();
        self.shared.logs.shutdown();
        self.shared.cache.fini();
    }
}
