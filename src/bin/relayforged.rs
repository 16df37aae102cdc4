//! Proxy orchestrator binary.
//!
//! Loads configuration, installs signal handlers, starts the engine, and
//! dispatches the main loop until a termination signal requests loopbreak.
//! Option/CLI parsing beyond a single config-path argument, rule-file
//! loading, and the privileged port-binding helper live outside this
//! crate — this binary wires the connection engine to the simplest
//! collaborators that satisfy its traits.

use relayforge::certforge::CertForger;
use relayforge::config::{ConfigManager, ProxyConfig};
use relayforge::error::Result;
use relayforge::filter::PassthroughFilter;
use relayforge::{Engine, Error};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// No-op forger used when the binary is run without a wired CA. A real
/// deployment supplies its own `CertForger`: X.509 signing is an external
/// collaborator, not something this crate implements.
struct NullForger;

impl CertForger for NullForger {
    fn forge(&self, _origin_cert_der: &[u8]) -> Result<relayforge::cache::cert_bundle::CertBundle> {
        Err(Error::certificate("no CertForger configured; pass one to Engine::start"))
    }

    fn fingerprint(&self, origin_cert_der: &[u8]) -> [u8; 32] {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        origin_cert_der.hash(&mut hasher);
        let h = hasher.finish();
        let mut out = [0u8; 32];
        out[..8].copy_from_slice(&h.to_be_bytes());
        out
    }
}

/// Flips to true on SIGTERM/SIGQUIT/SIGINT; the main loop polls it each
/// iteration and breaks out for a graceful shutdown, recording the reason.
static SHOULD_STOP: AtomicBool = AtomicBool::new(false);

fn install_signal_handlers(config: Arc<ConfigManager>) -> Result<()> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGPIPE, SIGQUIT, SIGTERM, SIGUSR1};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGTERM, SIGQUIT, SIGINT, SIGHUP, SIGUSR1, SIGPIPE])
        .map_err(|e| Error::reactor(format!("failed to install signal handlers: {e}")))?;

    std::thread::Builder::new()
        .name("relayforge-signals".into())
        .spawn(move || {
            for signal in signals.forever() {
                match signal {
                    SIGTERM | SIGQUIT | SIGINT => {
                        info!(signal, "received termination signal, requesting loopbreak");
                        SHOULD_STOP.store(true, Ordering::SeqCst);
                    }
                    SIGHUP | SIGUSR1 => {
                        info!(signal, "received reopen signal, reloading configuration");
                        if let Err(e) = config.reload() {
                            warn!("failed to reload configuration: {}", e);
                        }
                    }
                    SIGPIPE => {
                        warn!("received SIGPIPE, ignoring");
                    }
                    other => {
                        warn!(signal = other, "received unhandled signal, ignoring");
                    }
                }
            }
        })
        .map_err(|e| Error::reactor(format!("failed to spawn signal thread: {e}")))?;

    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let config_mgr = Arc::new(match &config_path {
        Some(path) => ConfigManager::from_file(path)?,
        None => {
            warn!("no config path given; a deployment without listeners will exit immediately");
            ConfigManager::with_config(ProxyConfig::default(), None)
        }
    });
    let config = config_mgr.get();

    // SIGHUP/SIGUSR1 reload the on-disk config into `config_mgr`; listener
    // sockets and the worker pool are not re-created from the new snapshot —
    // reload only refreshes tunables a running `ConfigManager::get()` caller
    // would observe.
    install_signal_handlers(config_mgr)?;

    let forger: Arc<dyn CertForger> = Arc::new(NullForger);
    let filter = Arc::new(PassthroughFilter);

    let mut engine = Engine::start(config.clone(), forger, filter)?;
    info!("relayforge engine running");

    engine.run(&config.engine, || SHOULD_STOP.load(Ordering::SeqCst))?;

    info!("loopbreak requested, shutting down");
    engine.shutdown();
    Ok(())
}
