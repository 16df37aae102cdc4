//! Minimal timer wheel used for the per-thread idle sweep, the cache
//! manager's 60-second GC interval, and per-thread stats emission.
//!
//! A prior hierarchical timing-wheel design only ever drained level 0
//! (cascading between levels was left as a `TODO`), so coalescing was
//! silently a no-op and any timer scheduled further out than the base
//! resolution never fired. This proxy's timers are all recurring,
//! second-granularity intervals (idle sweep, GC, stats) where firing a few
//! milliseconds late is harmless but firing *never* is a correctness bug —
//! so this keeps the original `TimerToken`/`TimerCallback` vocabulary but
//! backs it with a `BinaryHeap` ordered by expiration, which fires every
//! scheduled timer exactly once per its own cadence.

use crate::error::Result;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Opaque handle to a scheduled (and possibly recurring) timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(pub usize);

/// Invoked when a timer fires. Returning `Some(next_interval)` from a
/// recurring timer's driver reschedules it; one-shot timers are removed
/// after firing once.
pub trait TimerCallback: Send + Sync {
    fn on_timer(&self, token: TimerToken) -> Result<()>;

    fn name(&self) -> &'static str {
        "timer"
    }
}

struct Entry {
    expires_at: Instant,
    token: TimerToken,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.expires_at == other.expires_at
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, we want the soonest expiration on top.
        other.expires_at.cmp(&self.expires_at)
    }
}

struct Registered {
    callback: Arc<dyn TimerCallback>,
    interval: Option<Duration>,
    cancelled: bool,
}

/// Min-heap of scheduled timers, keyed by an incrementing token.
pub struct TimerWheel {
    heap: BinaryHeap<Entry>,
    registered: HashMap<TimerToken, Registered>,
    next_token_id: usize,
    fired_total: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            registered: HashMap::new(),
            next_token_id: 0,
            fired_total: 0,
        }
    }

    /// Schedules a one-shot timer to fire after `delay`.
    pub fn schedule(&mut self, delay: Duration, callback: Arc<dyn TimerCallback>) -> TimerToken {
        self.insert(delay, callback, None)
    }

    /// Schedules a recurring timer: fires after `interval`, then
    /// re-arms itself for `interval` again each time it fires, until
    /// cancelled. This is the cache manager's 60s GC tick and each
    /// worker's `expired_conn_check_period` sweep.
    pub fn schedule_recurring(&mut self, interval: Duration, callback: Arc<dyn TimerCallback>) -> TimerToken {
        self.insert(interval, callback, Some(interval))
    }

    fn insert(&mut self, delay: Duration, callback: Arc<dyn TimerCallback>, interval: Option<Duration>) -> TimerToken {
        let token = TimerToken(self.next_token_id);
        self.next_token_id += 1;
        let expires_at = Instant::now() + delay;
        self.registered.insert(token, Registered { callback, interval, cancelled: false });
        self.heap.push(Entry { expires_at, token });
        token
    }

    /// Cancels a timer. Recurring timers stop re-arming; a one-shot timer
    /// already past due by the time this is called still fires once (the
    /// entry is already popped from the heap).
    pub fn cancel(&mut self, token: TimerToken) -> bool {
        match self.registered.get_mut(&token) {
            Some(r) => {
                r.cancelled = true;
                true
            }
            None => false,
        }
    }

    /// Fires every timer whose expiration is `<= now`, re-arming recurring
    /// ones. Returns the number of callbacks invoked.
    pub fn advance_time(&mut self, now: Instant) -> Result<usize> {
        let mut fired = 0;
        while let Some(top) = self.heap.peek() {
            if top.expires_at > now {
                break;
            }
            let Entry { token, .. } = self.heap.pop().unwrap();
            let Some(reg) = self.registered.get(&token) else { continue };
            if reg.cancelled {
                self.registered.remove(&token);
                continue;
            }
            if let Err(e) = reg.callback.on_timer(token) {
                tracing::error!(?token, "timer callback failed: {}", e);
            }
            fired += 1;
            self.fired_total += 1;

            match reg.interval {
                Some(interval) => {
                    self.heap.push(Entry { expires_at: now + interval, token });
                }
                None => {
                    self.registered.remove(&token);
                }
            }
        }
        if fired > 0 {
            trace!(fired, "timer wheel fired timers");
        }
        Ok(fired)
    }

    pub fn stats(&self) -> TimerStats {
        TimerStats { pending: self.heap.len(), fired_total: self.fired_total }
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TimerStats {
    pub pending: usize,
    pub fired_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCallback(Arc<AtomicUsize>);
    impl TimerCallback for CountingCallback {
        fn on_timer(&self, _token: TimerToken) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn one_shot_fires_once() {
        let mut wheel = TimerWheel::new();
        let count = Arc::new(AtomicUsize::new(0));
        wheel.schedule(Duration::from_millis(0), Arc::new(CountingCallback(count.clone())));
        wheel.advance_time(Instant::now());
        wheel.advance_time(Instant::now());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn recurring_fires_every_interval() {
        let mut wheel = TimerWheel::new();
        let count = Arc::new(AtomicUsize::new(0));
        wheel.schedule_recurring(Duration::from_millis(1), Arc::new(CountingCallback(count.clone())));
        let t0 = Instant::now();
        wheel.advance_time(t0 + Duration::from_millis(5));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        wheel.advance_time(t0 + Duration::from_millis(10));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancel_stops_recurrence() {
        let mut wheel = TimerWheel::new();
        let count = Arc::new(AtomicUsize::new(0));
        let token = wheel.schedule_recurring(Duration::from_millis(1), Arc::new(CountingCallback(count.clone())));
        wheel.advance_time(Instant::now() + Duration::from_millis(5));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        wheel.cancel(token);
        wheel.advance_time(Instant::now() + Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
