//! Caller-supplied cancellation.
//!
//! Operations are synchronous; a [`CancelToken`] is how a caller bounds
//! how long it is willing to wait. Retry loops check it between attempts
//! and while backing off, and the system command runner kills an
//! in-flight child process once it fires.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Granularity of interruptible sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Cloneable cancellation flag with an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Option<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// A token that never fires.
    #[must_use]
    pub fn never() -> Self {
        Self::default()
    }

    /// A token fired only by [`CancelToken::cancel`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            flag: Some(Arc::new(AtomicBool::new(false))),
            deadline: None,
        }
    }

    /// A token that fires after `timeout` or on [`CancelToken::cancel`].
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Some(Arc::new(AtomicBool::new(false))),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// Fires the token for every clone.
    pub fn cancel(&self) {
        if let Some(flag) = &self.flag {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Returns whether the token has fired or its deadline passed.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.as_ref().is_some_and(|f| f.load(Ordering::SeqCst))
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Returns whether this token can ever fire.
    #[must_use]
    pub const fn is_cancellable(&self) -> bool {
        self.flag.is_some()
    }

    /// Sleeps for `duration`, waking early if the token fires.
    ///
    /// Returns `false` if the sleep was interrupted by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        if !self.is_cancellable() {
            std::thread::sleep(duration);
            return true;
        }
        let until = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(until - now));
        }
    }
}
