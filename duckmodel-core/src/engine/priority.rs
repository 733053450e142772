//! Counting semaphore that serves waiters by priority, FIFO within a priority.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::context::Context;
use crate::error::{DriverError, Result};

const WAIT_SLICE: Duration = Duration::from_millis(20);

#[derive(Debug, PartialEq, Eq)]
struct Waiter {
    priority: i32,
    seq: u64,
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct SemaphoreState {
    available: usize,
    waiters: BinaryHeap<Waiter>,
    next_seq: u64,
    closed: bool,
}

pub struct PrioritySemaphore {
    state: Mutex<SemaphoreState>,
    condvar: Condvar,
}

impl PrioritySemaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(SemaphoreState {
                available: permits,
                waiters: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Block until a permit is granted. A cancelled or expired `ctx` removes
    /// the caller from the queue without taking a permit.
    pub fn acquire(&self, ctx: &Context, priority: i32) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| DriverError::poisoned("semaphore"))?;
        if state.closed {
            return Err(DriverError::PoolClosed);
        }
        ctx.check()?;
        if state.available > 0 && state.waiters.is_empty() {
            state.available -= 1;
            return Ok(());
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.waiters.push(Waiter { priority, seq });
        debug!(priority, queued = state.waiters.len(), "waiting for connection permit");

        loop {
            if state.closed {
                state.waiters.retain(|w| w.seq != seq);
                self.condvar.notify_all();
                return Err(DriverError::PoolClosed);
            }
            let at_head = state.waiters.peek().map(|w| w.seq) == Some(seq);
            if at_head && state.available > 0 {
                state.waiters.pop();
                state.available -= 1;
                if state.available > 0 && !state.waiters.is_empty() {
                    self.condvar.notify_all();
                }
                return Ok(());
            }
            if let Err(err) = ctx.check() {
                state.waiters.retain(|w| w.seq != seq);
                // The head may have changed.
                self.condvar.notify_all();
                return Err(err);
            }
            let (guard, _) = self
                .condvar
                .wait_timeout(state, ctx.wait_slice(WAIT_SLICE))
                .map_err(|_| DriverError::poisoned("semaphore"))?;
            state = guard;
        }
    }

    pub fn release(&self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.available += 1;
        self.condvar.notify_all();
    }

    /// Fail every queued and future acquisition with `PoolClosed`.
    pub fn close(&self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.closed = true;
        self.condvar.notify_all();
    }

    pub fn available(&self) -> usize {
        self.state.lock().map(|s| s.available).unwrap_or(0)
    }

    pub fn queued(&self) -> usize {
        self.state.lock().map(|s| s.waiters.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::thread;
    use std::time::Instant;

    fn wait_for_queue(sem: &PrioritySemaphore, len: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while sem.queued() < len {
            assert!(Instant::now() < deadline, "waiters never queued");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn serves_highest_priority_then_fifo() {
        let sem = Arc::new(PrioritySemaphore::new(1));
        let ctx = Context::background();
        sem.acquire(&ctx, 0).unwrap();

        let order = Arc::new(StdMutex::new(Vec::new()));
        let mut handles = Vec::new();
        for (label, priority) in [("low", 0), ("high-1", 10), ("high-2", 10), ("mid", 5)] {
            let worker = Arc::clone(&sem);
            let order = Arc::clone(&order);
            let queued = sem.queued();
            handles.push(thread::spawn(move || {
                worker.acquire(&Context::background(), priority).unwrap();
                order.lock().unwrap().push(label);
                worker.release();
            }));
            wait_for_queue(&sem, queued + 1);
        }

        sem.release();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(
            *order.lock().unwrap(),
            vec!["high-1", "high-2", "mid", "low"]
        );
    }

    #[test]
    fn cancelled_waiter_leaves_queue_without_permit() {
        let sem = Arc::new(PrioritySemaphore::new(1));
        sem.acquire(&Context::background(), 0).unwrap();

        let ctx = Context::background();
        let waiter = {
            let sem = Arc::clone(&sem);
            let ctx = ctx.clone();
            thread::spawn(move || sem.acquire(&ctx, 1))
        };
        wait_for_queue(&sem, 1);
        ctx.cancel();
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(DriverError::Cancelled)));
        assert_eq!(sem.queued(), 0);
        assert_eq!(sem.available(), 0);

        sem.release();
        assert_eq!(sem.available(), 1);
    }

    #[test]
    fn deadline_expires_while_queued() {
        let sem = PrioritySemaphore::new(1);
        sem.acquire(&Context::background(), 0).unwrap();
        let ctx = Context::with_timeout(Duration::from_millis(30));
        let err = sem.acquire(&ctx, 0).unwrap_err();
        assert!(matches!(err, DriverError::DeadlineExceeded));
    }

    #[test]
    fn close_wakes_waiters() {
        let sem = Arc::new(PrioritySemaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.acquire(&Context::background(), 0))
        };
        wait_for_queue(&sem, 1);
        sem.close();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(DriverError::PoolClosed)
        ));
        assert!(matches!(
            sem.acquire(&Context::background(), 0),
            Err(DriverError::PoolClosed)
        ));
    }
}
