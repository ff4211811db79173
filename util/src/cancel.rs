//! # Cooperative cancellation
//!
//! A [`CancelToken`] is shared between a controlling thread and any number of worker threads.
//! Workers pass the token into every blocking call they make and unwind when it reports
//! cancellation. Cancelling is one-way: a cancelled token never becomes active again, a fresh
//! token must be created instead.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use std::{
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Shared cancellation flag.
///
/// Cloning the token gives another handle onto the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    cvar: Condvar,
}

/// Returned from a blocking call which was interrupted by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("The operation was cancelled")]
pub struct Cancelled;

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl CancelToken {
    /// Create a new, active token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the token, waking every thread currently sleeping on it.
    ///
    /// Returns `true` if this call performed the cancellation, `false` if the token was already
    /// cancelled.
    pub fn cancel(&self) -> bool {
        let mut cancelled = match self.inner.cancelled.lock() {
            Ok(c) => c,
            Err(p) => p.into_inner(),
        };

        if *cancelled {
            return false;
        }

        *cancelled = true;
        self.inner.cvar.notify_all();

        true
    }

    /// Check if the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        match self.inner.cancelled.lock() {
            Ok(c) => *c,
            Err(p) => *p.into_inner(),
        }
    }

    /// Return `Err(Cancelled)` if the token has been cancelled.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        }
        else {
            Ok(())
        }
    }

    /// Sleep for the given duration, returning early with `Err(Cancelled)` if the token is
    /// cancelled before the duration elapses.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let deadline = Instant::now() + duration;

        let mut cancelled = match self.inner.cancelled.lock() {
            Ok(c) => c,
            Err(p) => p.into_inner(),
        };

        loop {
            if *cancelled {
                return Err(Cancelled);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }

            // Spurious wakeups just go round the loop again
            cancelled = match self.inner.cvar.wait_timeout(cancelled, deadline - now) {
                Ok((c, _)) => c,
                Err(p) => p.into_inner().0,
            };
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn test_cancel_is_one_way() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert_eq!(token.check(), Ok(()));

        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
        assert_eq!(token.check(), Err(Cancelled));
    }

    #[test]
    fn test_sleep_completes() {
        let token = CancelToken::new();
        let start = Instant::now();
        assert_eq!(token.sleep(Duration::from_millis(20)), Ok(()));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_sleep_wakes_on_cancel() {
        let token = CancelToken::new();
        let other = token.clone();

        let jh = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            other.cancel();
        });

        let start = Instant::now();
        assert_eq!(token.sleep(Duration::from_secs(10)), Err(Cancelled));
        assert!(start.elapsed() < Duration::from_secs(5));

        jh.join().unwrap();
    }
}
