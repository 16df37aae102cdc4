//! Certificate-forgery collaborator interface.
//!
//! X.509 signing and key generation live outside this crate; the engine
//! calls through this trait and caches the result keyed by origin
//! fingerprint (`CacheManager::fkcrt`).

use crate::cache::cert_bundle::CertBundle;
use crate::error::Result;

/// Given the origin server's certificate bytes, produces a forged leaf
/// signed by the local CA, its private key, and the chain to present.
pub trait CertForger: Send + Sync {
    fn forge(&self, origin_cert_der: &[u8]) -> Result<CertBundle>;

    /// SHA-256 fingerprint used as the forged-cert cache key.
    fn fingerprint(&self, origin_cert_der: &[u8]) -> [u8; 32];
}
