//! The admission gate underlying every concurrency flow controller
//!
//! A [`ThreadBlocker`] hands out up to `capacity` permits. Callers beyond that
//! wait in a queue until a permit is released to them or their timeout
//! expires. Releases are directed: the permit passes straight to the head of
//! the queue, so a late arrival can never overtake a queued waiter.
//!
//! Two orderings are available:
//! - [`ThreadBlocker::new`]: first come, first served
//! - [`ThreadBlocker::prioritized`]: highest priority first, ties broken by
//!   arrival order
//!
//! # Example
//!
//! ```
//! use flowgate::ThreadBlocker;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let blocker = ThreadBlocker::new(1);
//!
//! assert!(blocker.acquire(Duration::from_secs(1), 0).await);
//! // Full: a second caller times out
//! assert!(!blocker.acquire(Duration::ZERO, 0).await);
//!
//! blocker.release();
//! assert_eq!(blocker.running(), 0);
//! # });
//! ```

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;
use tokio::sync::oneshot;


/// Capacity-gated admission primitive
pub struct ThreadBlocker {
    state: Mutex<State>,
    prioritized: bool,
}

struct State {
    capacity: usize,
    running: usize,
    queue: BinaryHeap<Waiter>,
    next_sequence: u64,
}

/// A queued caller; the heap top is the next one to be admitted
struct Waiter {
    priority: i64,
    sequence: u64,
    grant: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence first
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl State {
    /// Hand permits to queued waiters while capacity allows
    fn grant_waiters(&mut self) {
        while self.running < self.capacity {
            let Some(waiter) = self.queue.pop() else {
                break;
            };
            self.running += 1;
            // A dropped receiver is settled by its PendingWait guard
            let _ = waiter.grant.send(());
        }
    }

    /// Remove a waiter by sequence; false if it was already granted
    fn withdraw(&mut self, sequence: u64) -> bool {
        let before = self.queue.len();
        self.queue.retain(|w| w.sequence != sequence);
        self.queue.len() != before
    }
}

impl ThreadBlocker {
    /// Gate admitting callers in arrival order
    pub fn new(capacity: usize) -> Self {
        Self::with_ordering(capacity, false)
    }

    /// Gate admitting callers by priority, then arrival order
    pub fn prioritized(capacity: usize) -> Self {
        Self::with_ordering(capacity, true)
    }

    fn with_ordering(capacity: usize, prioritized: bool) -> Self {
        ThreadBlocker {
            state: Mutex::new(State {
                capacity,
                running: 0,
                queue: BinaryHeap::new(),
                next_sequence: 0,
            }),
            prioritized,
        }
    }

    /// Wait up to `timeout` for a permit
    ///
    /// Returns `true` once a permit is held; the caller must later call
    /// [`release`](Self::release) exactly once. Returns `false` if the timeout
    /// expired first, in which case nothing is held. `priority` is ignored by
    /// first-come gates.
    ///
    /// Dropping the returned future while it waits abandons the wait: the
    /// queue entry is removed, and a permit granted in the meantime is passed
    /// on to the next waiter.
    pub async fn acquire(&self, timeout: Duration, priority: i64) -> bool {
        let (sequence, granted) = {
            let mut state = self.state.lock();
            if state.running < state.capacity {
                state.running += 1;
                return true;
            }

            let sequence = state.next_sequence;
            state.next_sequence += 1;
            let (grant, granted) = oneshot::channel();
            state.queue.push(Waiter {
                priority: if self.prioritized { priority } else { 0 },
                sequence,
                grant,
            });
            tracing::trace!(
                "Queued waiter {} (priority {}, {} queued)",
                sequence,
                priority,
                state.queue.len()
            );
            (sequence, granted)
        };

        let mut pending = PendingWait {
            blocker: self,
            sequence,
            settled: false,
        };

        match tokio::time::timeout(timeout, granted).await {
            Ok(result) => {
                pending.settled = true;
                result.is_ok()
            }
            Err(_) => pending.expire(),
        }
    }

    /// Give back a permit obtained from [`acquire`](Self::acquire)
    pub fn release(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.running > 0, "release without a matching acquire");
        state.running = state.running.saturating_sub(1);
        state.grant_waiters();
    }

    /// Change the number of permits
    ///
    /// Raising the capacity admits queued waiters in order. Lowering it never
    /// revokes held permits; admissions resume once enough are released.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.state.lock();
        tracing::debug!(
            "Changing capacity from {} to {} ({} running, {} queued)",
            state.capacity,
            capacity,
            state.running,
            state.queue.len()
        );
        state.capacity = capacity;
        state.grant_waiters();
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Permits currently held
    pub fn running(&self) -> usize {
        self.state.lock().running
    }

    /// Callers currently waiting
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Nothing running and nobody waiting
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.running == 0 && state.queue.is_empty()
    }

    pub fn is_prioritized(&self) -> bool {
        self.prioritized
    }
}

impl std::fmt::Debug for ThreadBlocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ThreadBlocker")
            .field("capacity", &state.capacity)
            .field("running", &state.running)
            .field("queued", &state.queue.len())
            .field("prioritized", &self.prioritized)
            .finish()
    }
}

/// Settles a queued wait that did not complete normally
struct PendingWait<'a> {
    blocker: &'a ThreadBlocker,
    sequence: u64,
    settled: bool,
}

impl PendingWait<'_> {
    /// Timeout path: leave the queue, unless a grant already arrived
    fn expire(&mut self) -> bool {
        self.settled = true;
        let mut state = self.blocker.state.lock();
        if state.withdraw(self.sequence) {
            tracing::trace!("Waiter {} timed out", self.sequence);
            false
        } else {
            // Granted between the deadline and taking the lock
            true
        }
    }
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.blocker.state.lock();
        if !state.withdraw(self.sequence) {
            // Granted but never observed: pass the permit on
            state.running = state.running.saturating_sub(1);
            state.grant_waiters();
        }
        tracing::trace!("Waiter {} abandoned", self.sequence);
    }
}
