//! Bounded blocking SPMC queue used between worker threads and the logger.
//!
//! Ported field-for-field from `original_source/NIOMan/Classes/log/thrqueue.c`:
//! a fixed-capacity ring, two condvars (not-empty, not-full), and two
//! one-way "unblock" latches that turn every future blocking wait into an
//! immediate return once shutdown has begun.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use tracing::trace;

struct Inner<T> {
    ring: VecDeque<T>,
    capacity: usize,
    block_enqueue: bool,
    block_dequeue: bool,
}

/// Result of a non-blocking enqueue/dequeue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryResult {
    Ok,
    Full,
    Empty,
}

/// Fixed-capacity FIFO queue with blocking and non-blocking enqueue/dequeue,
/// and a permanent unblock mode for graceful shutdown drains.
pub struct Queue<T> {
    inner: Mutex<Inner<T>>,
    notempty: Condvar,
    notfull: Condvar,
}

impl<T> Queue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ring: VecDeque::with_capacity(capacity),
                capacity,
                block_enqueue: true,
                block_dequeue: true,
            }),
            notempty: Condvar::new(),
            notfull: Condvar::new(),
        }
    }

    /// Blocks while the queue is full and blocking is enabled. Returns
    /// `Err(item)` (the "full" signal, handing the item back) if the queue
    /// is full and `unblock_enqueue` has already fired.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        let mut guard = self.inner.lock().unwrap();
        while guard.ring.len() >= guard.capacity && guard.block_enqueue {
            guard = self.notfull.wait(guard).unwrap();
        }
        if guard.ring.len() >= guard.capacity {
            trace!("enqueue: queue full and unblocked, returning item");
            return Err(item);
        }
        guard.ring.push_back(item);
        drop(guard);
        self.notempty.notify_one();
        Ok(())
    }

    /// Non-blocking enqueue; never waits.
    pub fn enqueue_nb(&self, item: T) -> Result<(), T> {
        let mut guard = self.inner.lock().unwrap();
        if guard.ring.len() >= guard.capacity {
            return Err(item);
        }
        guard.ring.push_back(item);
        drop(guard);
        self.notempty.notify_one();
        Ok(())
    }

    /// Blocks while the queue is empty and blocking is enabled. Returns
    /// `None` if empty and `unblock_dequeue` has already fired.
    pub fn dequeue(&self) -> Option<T> {
        let mut guard = self.inner.lock().unwrap();
        while guard.ring.is_empty() && guard.block_dequeue {
            guard = self.notempty.wait(guard).unwrap();
        }
        let item = guard.ring.pop_front();
        drop(guard);
        if item.is_some() {
            self.notfull.notify_one();
        }
        item
    }

    /// Non-blocking dequeue; never waits.
    pub fn dequeue_nb(&self) -> Option<T> {
        let mut guard = self.inner.lock().unwrap();
        let item = guard.ring.pop_front();
        drop(guard);
        if item.is_some() {
            self.notfull.notify_one();
        }
        item
    }

    /// Permanently disables blocking on enqueue. All waiters wake and return
    /// the "full" signal once the queue is at capacity. This is the shutdown
    /// entry point: producers unblock first so they can drain remaining
    /// items before consumers stop waiting.
    pub fn unblock_enqueue(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.block_enqueue = false;
        drop(guard);
        self.notfull.notify_all();
        std::thread::yield_now();
        trace!("queue: enqueue unblocked");
    }

    /// Permanently disables blocking on dequeue.
    pub fn unblock_dequeue(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.block_dequeue = false;
        drop(guard);
        self.notempty.notify_all();
        std::thread::yield_now();
        trace!("queue: dequeue unblocked");
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_single_producer() {
        let q: Queue<i32> = Queue::new(8);
        for i in 0..8 {
            q.enqueue(i).unwrap();
        }
        for i in 0..8 {
            assert_eq!(q.dequeue(), Some(i));
        }
    }

    #[test]
    fn bounded_capacity() {
        let q: Queue<i32> = Queue::new(2);
        assert_eq!(q.enqueue_nb(1), Ok(()));
        assert_eq!(q.enqueue_nb(2), Ok(()));
        assert_eq!(q.enqueue_nb(3), Err(3));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn unblock_enqueue_releases_blocked_producer() {
        let q = Arc::new(Queue::<i32>::new(1));
        q.enqueue(1).unwrap();

        let q2 = q.clone();
        let handle = thread::spawn(move || q2.enqueue(2));

        thread::sleep(std::time::Duration::from_millis(20));
        q.unblock_enqueue();
        assert_eq!(handle.join().unwrap(), Err(2));
    }

    #[test]
    fn unblock_dequeue_releases_blocked_consumer() {
        let q = Arc::new(Queue::<i32>::new(1));
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.dequeue());

        thread::sleep(std::time::Duration::from_millis(20));
        q.unblock_dequeue();
        assert_eq!(handle.join().unwrap(), None);
    }
}
