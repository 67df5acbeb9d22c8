//! The bounded, blocking worker queue.
//!
//! Two distinct synchronization concepts share one `Mutex`: ordinary element
//! availability (a worker is in the queue or it isn't) and the *pool lock*, an
//! exclusive gate that [`crate::protocols::drain_and_refill`] holds while it
//! collects every outstanding worker. Borrowers that don't hold the gate block
//! on it; the thread that does hold it keeps borrowing straight through via
//! [`PoolLockGuard::borrow`].

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::PillCause;

/// A single pooled worker: a stable id, its creation time, and the
/// caller-supplied opaque handle (see [`crate::WorkerLifecycle`]).
#[derive(Debug)]
pub struct Worker<W> {
    pub id: i32,
    pub created_at: Instant,
    pub handle: W,
}

/// One slot in the queue: either a live worker or a sentinel.
enum Element<W> {
    Worker(Worker<W>),
    ErrorPill(PillCause),
    ShutdownPill,
}

/// Why a `borrow` did not return a worker.
#[derive(Debug, Clone)]
pub enum BorrowOutcome {
    /// An `ErrorPill` was observed and consumed; this is its cause.
    Pill(PillCause),
    /// A `ShutdownPill` was observed (and left in place).
    Shutdown,
    /// No worker became available before the deadline.
    Timeout,
}

/// Raised by [`BoundedWorkerQueue::lock_with_timeout`] when the exclusive
/// pool lock could not be acquired in time.
#[derive(Debug, Clone)]
pub struct LockTimeoutError {
    pub waited: Duration,
}

struct Inner<W> {
    elements: VecDeque<Element<W>>,
    capacity: usize,
    locked: bool,
}

/// A fixed-capacity, blocking container of workers with timed-lock
/// acquisition and poison-pill signaling.
pub struct BoundedWorkerQueue<W> {
    inner: Mutex<Inner<W>>,
    /// Signaled whenever an element is offered, returned, or a pill inserted.
    not_empty: Condvar,
    /// Signaled whenever the pool lock is released.
    unlocked: Condvar,
}

impl<W> BoundedWorkerQueue<W> {
    pub fn new(capacity: usize) -> Self {
        BoundedWorkerQueue {
            inner: Mutex::new(Inner {
                elements: VecDeque::with_capacity(capacity),
                capacity,
                locked: false,
            }),
            not_empty: Condvar::new(),
            unlocked: Condvar::new(),
        }
    }

    /// Non-blocking insert. Returns `false` if the queue is already at
    /// capacity.
    pub fn offer(&self, worker: Worker<W>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.elements.len() >= inner.capacity {
            return false;
        }
        inner.elements.push_back(Element::Worker(worker));
        drop(inner);
        self.not_empty.notify_one();
        true
    }

    /// Places a worker that was previously borrowed back into the queue.
    pub fn return_worker(&self, worker: Worker<W>) {
        let mut inner = self.inner.lock().unwrap();
        inner.elements.push_back(Element::Worker(worker));
        drop(inner);
        self.not_empty.notify_one();
    }

    /// Blocks until a worker is available, a pill is observed, or `timeout`
    /// elapses.
    pub fn borrow(&self, timeout: Duration) -> Result<Worker<W>, BorrowOutcome> {
        self.borrow_inner(timeout, false)
    }

    fn borrow_inner(&self, timeout: Duration, bypass_gate: bool) -> Result<Worker<W>, BorrowOutcome> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock().unwrap();

        if !bypass_gate {
            loop {
                if !guard.locked {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    return Err(BorrowOutcome::Timeout);
                }
                let (g, result) = self.unlocked.wait_timeout(guard, deadline - now).unwrap();
                guard = g;
                if result.timed_out() && guard.locked {
                    return Err(BorrowOutcome::Timeout);
                }
            }
        }

        loop {
            match guard.elements.pop_front() {
                Some(Element::Worker(w)) => return Ok(w),
                Some(Element::ErrorPill(cause)) => return Err(BorrowOutcome::Pill(cause)),
                Some(Element::ShutdownPill) => {
                    guard.elements.push_front(Element::ShutdownPill);
                    return Err(BorrowOutcome::Shutdown);
                }
                None => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(BorrowOutcome::Timeout);
                    }
                    let (g, result) = self.not_empty.wait_timeout(guard, deadline - now).unwrap();
                    guard = g;
                    if result.timed_out() && guard.elements.is_empty() {
                        return Err(BorrowOutcome::Timeout);
                    }
                }
            }
        }
    }

    /// Acquires the exclusive pool lock, blocking new (non-bypassing)
    /// borrowers until the returned guard is released.
    pub fn lock_with_timeout(&self, timeout: Duration) -> Result<PoolLockGuard<'_, W>, LockTimeoutError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock().unwrap();
        loop {
            if !guard.locked {
                guard.locked = true;
                return Ok(PoolLockGuard {
                    queue: self,
                    released: false,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LockTimeoutError { waited: timeout });
            }
            let (g, result) = self.unlocked.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
            if result.timed_out() && guard.locked {
                return Err(LockTimeoutError { waited: timeout });
            }
        }
    }

    /// Removes every element (workers and pills alike). Does not touch the
    /// pool-lock gate.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.elements.clear();
    }

    /// Inserts a sentinel so it is observed by the next borrower.
    pub fn insert_error_pill(&self, cause: PillCause) {
        let mut inner = self.inner.lock().unwrap();
        inner.elements.push_front(Element::ErrorPill(cause));
        drop(inner);
        self.not_empty.notify_all();
    }

    /// Inserts a shutdown sentinel so every future borrower observes it.
    pub fn insert_shutdown_pill(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.elements.push_front(Element::ShutdownPill);
        drop(inner);
        self.not_empty.notify_all();
    }

    /// Slots not yet filled.
    pub fn remaining_capacity(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.capacity.saturating_sub(inner.elements.len())
    }

    /// Number of idle workers currently queued (pills excluded).
    pub fn idle_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .elements
            .iter()
            .filter(|e| matches!(e, Element::Worker(_)))
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }
}

/// RAII handle on the exclusive pool lock. Dropping it releases the lock;
/// [`drain_and_refill`](crate::protocols::drain_and_refill) releases it
/// explicitly via [`PoolLockGuard::unlock`] before cleanup begins, per the
/// unlock-before-cleanup invariant.
pub struct PoolLockGuard<'a, W> {
    queue: &'a BoundedWorkerQueue<W>,
    released: bool,
}

impl<'a, W> PoolLockGuard<'a, W> {
    /// Borrows through the gate this guard itself holds.
    pub fn borrow(&self, timeout: Duration) -> Result<Worker<W>, BorrowOutcome> {
        self.queue.borrow_inner(timeout, true)
    }

    /// Releases the lock now rather than at scope end.
    pub fn unlock(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        {
            let mut inner = self.queue.inner.lock().unwrap();
            inner.locked = false;
        }
        self.queue.unlocked.notify_all();
    }
}

impl<'a, W> Drop for PoolLockGuard<'a, W> {
    fn drop(&mut self) {
        self.release();
    }
}
