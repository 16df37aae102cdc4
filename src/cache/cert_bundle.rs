//! Reference-counted certificate bundle.
//!
//! Grounded in `original_source/NIOMan/Classes/utils/cert.c`: `cert_new3`
//! takes ownership without bumping refcounts, `cert_new3_copy` bumps
//! refcounts on key/cert/each chain element. Here reference counting is
//! `Arc`'s own strong count rather than a manual counter, and the mutex
//! guards in-place replacement so existing clones observe setter updates —
//! a bare `Arc<CertBundleInner>` would only let a clone see the bundle at
//! the moment it was cloned, not later mutations.

use std::sync::{Arc, RwLock};

/// The private key, leaf certificate, and chain backing one TLS identity.
/// Opaque byte payloads: the engine never parses or signs these itself
/// (signing happens behind the `CertForger` boundary).
#[derive(Debug, Clone, Default)]
pub struct CertBundleInner {
    pub key: Vec<u8>,
    pub leaf: Vec<u8>,
    pub chain: Vec<Vec<u8>>,
}

/// Shared, mutable certificate bundle. Cloning bumps the `Arc` refcount;
/// the last `Drop` of the last clone frees the inner data.
#[derive(Debug, Clone)]
pub struct CertBundle(Arc<RwLock<CertBundleInner>>);

impl CertBundle {
    /// Takes ownership of `inner` without adopting any prior reference
    /// (`cert_new3` equivalent).
    pub fn new3(inner: CertBundleInner) -> Self {
        Self(Arc::new(RwLock::new(inner)))
    }

    /// Clones the bundle's current contents into a fresh, independently
    /// reference-counted bundle (`cert_new3_copy` equivalent — in the C
    /// original this bumps shared refcounts on key/cert/chain; since this
    /// bundle owns its payload outright there is nothing further to bump).
    pub fn new3_copy(&self) -> Self {
        let snapshot = self.0.read().unwrap().clone();
        Self::new3(snapshot)
    }

    /// Number of outstanding references to this bundle, including the
    /// cache's own slot if cached. Invariant: always >= 1 while any
    /// `CertBundle` handle is held.
    pub fn references(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn key(&self) -> Vec<u8> {
        self.0.read().unwrap().key.clone()
    }

    pub fn leaf(&self) -> Vec<u8> {
        self.0.read().unwrap().leaf.clone()
    }

    pub fn chain(&self) -> Vec<Vec<u8>> {
        self.0.read().unwrap().chain.clone()
    }

    /// Replaces the held key in place; existing clones observe the update.
    pub fn set_key(&self, key: Vec<u8>) {
        self.0.write().unwrap().key = key;
    }

    pub fn set_leaf(&self, leaf: Vec<u8>) {
        self.0.write().unwrap().leaf = leaf;
    }

    pub fn set_chain(&self, chain: Vec<Vec<u8>>) {
        self.0.write().unwrap().chain = chain;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_updates() {
        let bundle = CertBundle::new3(CertBundleInner { key: vec![1], leaf: vec![2], chain: vec![] });
        let clone = bundle.clone();
        assert_eq!(bundle.references(), 2);
        bundle.set_key(vec![9]);
        assert_eq!(clone.key(), vec![9]);
    }

    #[test]
    fn references_drop_to_one_after_clone_dropped() {
        let bundle = CertBundle::new3(CertBundleInner::default());
        {
            let _clone = bundle.clone();
            assert_eq!(bundle.references(), 2);
        }
        assert_eq!(bundle.references(), 1);
    }

    #[test]
    fn new3_copy_is_independent() {
        let bundle = CertBundle::new3(CertBundleInner { key: vec![1], leaf: vec![], chain: vec![] });
        let copy = bundle.new3_copy();
        copy.set_key(vec![2]);
        assert_eq!(bundle.key(), vec![1]);
    }
}
