//! Store-wide advisory lock with automatic expiry.

use crate::common::{Error, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

enum LockState {
    Unlocked,
    /// Held. `timer` releases this `generation` when the timeout fires.
    Locked {
        generation: u64,
        timer: JoinHandle<()>,
    },
}

struct Inner {
    state: Mutex<LockState>,
    next_generation: Mutex<u64>,
    released: Notify,
}

impl Inner {
    /// Release only if `generation` still holds the lock.
    fn expire(&self, generation: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*state, LockState::Locked { generation: held, .. } if held == generation) {
            *state = LockState::Unlocked;
            drop(state);
            warn!(generation, "advisory lock expired without release");
            self.released.notify_waiters();
        }
    }
}

/// Single exclusive advisory lock. Not reentrant; waiters are not queued
/// fairly. A holder that never releases loses the lock when its timeout
/// elapses.
#[derive(Clone)]
pub struct AdvisoryLock {
    inner: Arc<Inner>,
}

impl Default for AdvisoryLock {
    fn default() -> Self {
        Self::new()
    }
}

impl AdvisoryLock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(LockState::Unlocked),
                next_generation: Mutex::new(0),
                released: Notify::new(),
            }),
        }
    }

    /// Wait until the lock is free, take it, and arm the expiry timer.
    /// Returns as soon as the lock is held.
    pub async fn acquire(&self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(Error::InvalidArgument("lock timeout must be positive".into()));
        }

        loop {
            let released = self.inner.released.notified();
            tokio::pin!(released);
            // Register before checking so a release in between is not missed.
            released.as_mut().enable();

            if self.try_acquire(timeout) {
                return Ok(());
            }
            released.await;
        }
    }

    fn try_acquire(&self, timeout: Duration) -> bool {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*state, LockState::Locked { .. }) {
            return false;
        }

        let generation = {
            let mut next = self
                .inner
                .next_generation
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *next += 1;
            *next
        };
        let inner = self.inner.clone();
        let timer = tokio::spawn(async move {
            time::sleep(timeout).await;
            inner.expire(generation);
        });
        *state = LockState::Locked { generation, timer };
        debug!(generation, ?timeout, "advisory lock acquired");
        true
    }

    /// Release the lock now. A no-op when not held.
    pub fn release(&self) -> bool {
        let previous = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, LockState::Unlocked)
        };
        match previous {
            LockState::Locked { generation, timer } => {
                timer.abort();
                debug!(generation, "advisory lock released");
                self.inner.released.notify_waiters();
                true
            }
            LockState::Unlocked => false,
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(
            *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()),
            LockState::Locked { .. }
        )
    }
}
