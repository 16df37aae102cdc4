//! Cache manager owning the four concrete caches.
//!
//! Grounded in `original_source/NIOMan/Classes/cache/cachemgr.c`:
//! `preinit` creates all four in a fixed order; `gc` spawns one OS thread
//! per GC-needing cache (fkcrt, ssess, dsess — tgcrt is skipped, matching
//! the comment `/* the tgcrt cache does not need cleanup */`) and joins
//! them all before returning.

use crate::cache::cert_bundle::CertBundle;
use crate::cache::{Cache, CachePolicy};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::error;

/// Forged-leaf cache: GC drops entries whose only remaining reference is
/// the cache's own slot (`references() == 1`).
struct FkcrtPolicy;
impl CachePolicy<[u8; 32], CertBundle> for FkcrtPolicy {
    fn verify_for_retain(&self, _key: &[u8; 32], _value: &CertBundle) -> bool {
        true
    }
    fn verify_for_gc(&self, _key: &[u8; 32], value: &CertBundle) -> bool {
        value.references() > 1
    }
}

/// Target-cert cache: preloaded from disk, never expires.
struct TgcrtPolicy;
impl CachePolicy<String, CertBundle> for TgcrtPolicy {
    fn verify_for_retain(&self, _key: &String, _value: &CertBundle) -> bool {
        true
    }
}

/// A cached TLS session, opaque to the engine beyond its expiry.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub payload: Vec<u8>,
    pub expires_at: Instant,
}

impl SessionEntry {
    pub fn new(payload: Vec<u8>, ttl: Duration) -> Self {
        Self { payload, expires_at: Instant::now() + ttl }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

struct SessionPolicy;
impl CachePolicy<Vec<u8>, SessionEntry> for SessionPolicy {
    fn verify_for_retain(&self, _key: &Vec<u8>, value: &SessionEntry) -> bool {
        value.is_live(Instant::now())
    }
}

/// Key for the destination-session cache: origin address plus optional SNI.
pub type DsessKey = (SocketAddr, Option<String>);

struct DsessPolicy;
impl CachePolicy<DsessKey, SessionEntry> for DsessPolicy {
    fn verify_for_retain(&self, _key: &DsessKey, value: &SessionEntry) -> bool {
        value.is_live(Instant::now())
    }
}

/// Owns the four forged-cert and session caches the engine consults.
pub struct CacheManager {
    pub fkcrt: Cache<[u8; 32], CertBundle, FkcrtPolicy>,
    pub tgcrt: Cache<String, CertBundle, TgcrtPolicy>,
    pub ssess: Cache<Vec<u8>, SessionEntry, SessionPolicy>,
    pub dsess: Cache<DsessKey, SessionEntry, DsessPolicy>,
}

impl CacheManager {
    /// Creates all four caches in order. The C original unwinds partial
    /// construction on failure (`out1`..`out4` labels); cache construction
    /// here is infallible (`HashMap::new` never fails), so there is no
    /// partial-failure path to replicate — noted in DESIGN.md.
    pub fn preinit() -> Self {
        Self {
            fkcrt: Cache::new("fkcrt", FkcrtPolicy),
            tgcrt: Cache::new("tgcrt", TgcrtPolicy),
            ssess: Cache::new("ssess", SessionPolicy),
            dsess: Cache::new("dsess", DsessPolicy),
        }
    }

    /// Re-initializes cache state after a fork-equivalent boundary. Rust
    /// mutexes need no re-creation after fork (no pthread_mutex robustness
    /// issue to work around), so this is a documented no-op kept for
    /// interface parity with `cachemgr_init`.
    pub fn init(&self) {}

    /// Runs GC for fkcrt, ssess, and dsess concurrently on separate
    /// threads, joining all before returning; tgcrt is skipped since its
    /// policy never rejects an entry.
    pub fn gc(&self) {
        std::thread::scope(|scope| {
            let fkcrt = scope.spawn(|| self.fkcrt.gc());
            let ssess = scope.spawn(|| self.ssess.gc());
            let dsess = scope.spawn(|| self.dsess.gc());

            if let Err(e) = fkcrt.join() {
                error!(?e, "fkcrt gc thread panicked");
            }
            if let Err(e) = ssess.join() {
                error!(?e, "ssess gc thread panicked");
            }
            if let Err(e) = dsess.join() {
                error!(?e, "dsess gc thread panicked");
            }
        });
    }

    /// Tears the caches down. Caller must ensure no `gc()` call is in
    /// flight; the orchestrator enforces this by calling `gc` only from its
    /// own single-threaded timer callback and never concurrently with `fini`.
    pub fn fini(&self) {
        self.dsess.clear();
        self.ssess.clear();
        self.tgcrt.clear();
        self.fkcrt.clear();
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::preinit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::cert_bundle::CertBundleInner;

    #[test]
    fn fkcrt_gc_skips_referenced_entries() {
        let mgr = CacheManager::preinit();
        let bundle = CertBundle::new3(CertBundleInner::default());
        let held = bundle.clone();
        mgr.fkcrt.set([0u8; 32], bundle);
        mgr.gc();
        assert_eq!(mgr.fkcrt.len(), 1);
        drop(held);
    }

    #[test]
    fn fkcrt_gc_drops_unreferenced_entries() {
        let mgr = CacheManager::preinit();
        mgr.fkcrt.set([1u8; 32], CertBundle::new3(CertBundleInner::default()));
        mgr.gc();
        assert_eq!(mgr.fkcrt.len(), 0);
    }

    #[test]
    fn tgcrt_never_gced() {
        let mgr = CacheManager::preinit();
        mgr.tgcrt.set("example.com".into(), CertBundle::new3(CertBundleInner::default()));
        mgr.gc();
        assert_eq!(mgr.tgcrt.len(), 1);
    }

    #[test]
    fn ssess_expires() {
        let mgr = CacheManager::preinit();
        mgr.ssess.set(vec![1, 2, 3], SessionEntry::new(vec![], Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(mgr.ssess.get(&vec![1, 2, 3]), None);
    }
}
