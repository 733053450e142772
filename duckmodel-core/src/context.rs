//! Cancellation and deadline propagation for blocking driver calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{DriverError, Result};

/// Cancellation token with an optional deadline.
///
/// Clones share the cancellation flag, so cancelling any clone cancels all of
/// them. Waits inside the driver (pool checkout, reopen) poll this in short
/// slices; a statement already running inside the engine is not interrupted.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Context {
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// Child context sharing this cancellation flag with a tighter deadline.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now().checked_add(timeout);
        let deadline = match (self.deadline, candidate) {
            (Some(current), Some(next)) => Some(current.min(next)),
            (current, next) => current.or(next),
        };
        Self {
            cancelled: Arc::clone(&self.cancelled),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(DriverError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(DriverError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Length of the next wait slice: `max_slice`, or less when the deadline is closer.
    pub(crate) fn wait_slice(&self, max_slice: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => remaining.min(max_slice).max(Duration::from_millis(1)),
            None => max_slice,
        }
    }
}
