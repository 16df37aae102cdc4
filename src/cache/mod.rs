//! Generic mutex-protected cache.
//!
//! The C original (`original_source/NIOMan/Classes/cache/cache.c`) wires
//! twelve hooks per concrete cache (begin/end/exist/del/get/put/free-key/
//! free-val/get-key/get-val/set-val/unpack-verify/fini). Storage and policy
//! are split here into a single generic container keyed on real Rust types
//! plus a two-method policy trait — the other ten hooks collapse into
//! `HashMap` itself.

pub mod cert_bundle;
pub mod manager;

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use tracing::trace;

/// Per-cache policy: decides whether an entry should be retained.
///
/// `verify_for_retain` runs on every `get` (reject-and-delete stale hits);
/// `verify_for_gc` runs on every `gc` pass (drop no-longer-valid entries).
/// The two are split because a `get` only inspects the hit entry while
/// `gc` walks the whole table — `cachetgcrt.c`'s `unpackverify_val_cb`
/// always returning valid is the degenerate case of both returning `true`.
pub trait CachePolicy<K, V>: Send + Sync {
    fn verify_for_retain(&self, key: &K, value: &V) -> bool;
    fn verify_for_gc(&self, key: &K, value: &V) -> bool {
        self.verify_for_retain(key, value)
    }
}

/// Mutex-protected key/value cache parameterized by a [`CachePolicy`].
pub struct Cache<K, V, P> {
    table: Mutex<HashMap<K, V>>,
    policy: P,
    name: &'static str,
}

impl<K, V, P> Cache<K, V, P>
where
    K: Eq + Hash + Clone,
    V: Clone,
    P: CachePolicy<K, V>,
{
    pub fn new(name: &'static str, policy: P) -> Self {
        Self { table: Mutex::new(HashMap::new()), policy, name }
    }

    /// Looks up `key`. A stale hit (policy rejects retention) is deleted and
    /// treated as a miss, matching `cache_get`'s "always free caller's
    /// search key, delete stale, return null" contract.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut table = self.table.lock().unwrap();
        match table.get(key) {
            Some(value) if self.policy.verify_for_retain(key, value) => Some(value.clone()),
            Some(_) => {
                trace!(cache = self.name, "stale entry evicted on get");
                table.remove(key);
                None
            }
            None => None,
        }
    }

    /// Inserts `value` at `key`, replacing and dropping any prior value.
    pub fn set(&self, key: K, value: V) {
        self.table.lock().unwrap().insert(key, value);
    }

    /// Removes `key`, returning its value if present.
    pub fn del(&self, key: &K) -> Option<V> {
        self.table.lock().unwrap().remove(key)
    }

    /// Walks every live entry, dropping those the policy rejects for GC.
    /// Returns the number of entries dropped.
    pub fn gc(&self) -> usize {
        let mut table = self.table.lock().unwrap();
        let before = table.len();
        table.retain(|k, v| self.policy.verify_for_gc(k, v));
        let dropped = before - table.len();
        if dropped > 0 {
            trace!(cache = self.name, dropped, "gc pass complete");
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains all entries. Mirrors `cache_free`'s "caller guarantees
    /// quiescence" contract: nothing else may be operating on the cache
    /// concurrently when this is called.
    pub fn clear(&self) {
        self.table.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysValid;
    impl CachePolicy<String, u32> for AlwaysValid {
        fn verify_for_retain(&self, _k: &String, _v: &u32) -> bool {
            true
        }
    }

    struct RejectZero;
    impl CachePolicy<String, u32> for RejectZero {
        fn verify_for_retain(&self, _k: &String, v: &u32) -> bool {
            *v != 0
        }
    }

    #[test]
    fn get_evicts_stale_entry() {
        let c = Cache::new("test", RejectZero);
        c.set("k".to_string(), 0);
        assert_eq!(c.get(&"k".to_string()), None);
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn set_overwrites() {
        let c = Cache::new("test", AlwaysValid);
        c.set("k".to_string(), 1);
        c.set("k".to_string(), 2);
        assert_eq!(c.get(&"k".to_string()), Some(2));
    }

    #[test]
    fn gc_drops_rejected() {
        let c = Cache::new("test", RejectZero);
        c.set("a".to_string(), 1);
        c.set("b".to_string(), 0);
        let dropped = c.gc();
        assert_eq!(dropped, 1);
        assert_eq!(c.len(), 1);
    }
}
