//! Bounded polling with a monotonic deadline and interruptible waits.
//!
//! Every readiness wait in the tool goes through [`poll_until`]: an attempt runs
//! immediately, then again after each interval until the budget measured from the
//! first attempt (elapsed wall time on `Instant`, not a decremented counter) is
//! spent. Waiting between attempts blocks on a [`CancelToken`] so a cancel request
//! ends the wait early.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// One-shot cancellation flag that waiters can block on.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        let mut cancelled = lock.lock().unwrap_or_else(|e| e.into_inner());
        *cancelled = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block for up to `timeout`; returns true if the token was (or becomes) cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }

    /// Block until cancelled.
    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let _guard = cvar
            .wait_while(guard, |cancelled| !*cancelled)
            .unwrap_or_else(|e| e.into_inner());
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitPolicy {
    pub interval: Duration,
    pub budget: Duration,
}

impl WaitPolicy {
    pub const fn new(interval: Duration, budget: Duration) -> Self {
        Self { interval, budget }
    }
}

/// 5s interval, 2 minute budget: used by every backend bootstrap stage.
pub const BACKEND_WAIT: WaitPolicy =
    WaitPolicy::new(Duration::from_secs(5), Duration::from_secs(120));

#[derive(Debug)]
pub enum PollError<E> {
    TimedOut { attempts: u32, last: Option<E> },
    Cancelled { attempts: u32, last: Option<E> },
}

impl<E> PollError<E> {
    pub fn last(&self) -> Option<&E> {
        match self {
            PollError::TimedOut { last, .. } | PollError::Cancelled { last, .. } => last.as_ref(),
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            PollError::TimedOut { attempts, .. } | PollError::Cancelled { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Run `attempt` until it yields `Ok(Some(_))`, the budget is spent or `cancel` fires.
///
/// `Ok(None)` means "not yet"; `Err(e)` is remembered as the last error and retried.
pub fn poll_until<T, E, F>(policy: WaitPolicy, cancel: &CancelToken, mut attempt: F) -> Result<T, PollError<E>>
where
    F: FnMut() -> Result<Option<T>, E>,
{
    let started = Instant::now();
    let mut attempts = 0u32;
    let mut last = None;
    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled { attempts, last });
        }
        attempts += 1;
        match attempt() {
            Ok(Some(v)) => return Ok(v),
            Ok(None) => {}
            Err(e) => last = Some(e),
        }
        let elapsed = started.elapsed();
        if elapsed >= policy.budget {
            return Err(PollError::TimedOut { attempts, last });
        }
        let remaining = policy.budget - elapsed;
        if cancel.wait_timeout(policy.interval.min(remaining)) {
            return Err(PollError::Cancelled { attempts, last });
        }
    }
}
