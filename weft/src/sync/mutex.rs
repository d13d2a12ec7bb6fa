// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Routine mutex: a capacity-1 [`Semaphore`] with an RAII guard.

use super::semaphore::{Semaphore, WaitStatus};
use crate::error::Closed;
use core::fmt;
use std::time::Duration;

/// Error returned by [`Mutex::lock_timeout`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockError {
    /// The mutex was disabled.
    Closed,
    /// The timeout elapsed before the lock was acquired.
    Timeout,
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Closed => f.pad("mutex is closed"),
            LockError::Timeout => f.pad("timed out waiting for the mutex"),
        }
    }
}

impl std::error::Error for LockError {}

/// A mutual-exclusion lock for routines. Fair: suspended lockers acquire in
/// FIFO order. Cloning yields another handle to the same lock.
#[derive(Clone)]
pub struct Mutex {
    sema: Semaphore,
}

static_assertions::assert_impl_all!(Mutex: Send, Sync);

/// Holds the lock; releases it on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct MutexGuard {
    mutex: Mutex,
}

// === impl Mutex ===

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub fn new() -> Self {
        Self {
            sema: Semaphore::new(1),
        }
    }

    /// Acquires the lock, suspending the calling routine while it is held
    /// elsewhere.
    pub fn lock(&self) -> Result<MutexGuard, Closed> {
        match self.sema.wait() {
            WaitStatus::Success => Ok(MutexGuard {
                mutex: self.clone(),
            }),
            WaitStatus::Disabled => Err(Closed(())),
            WaitStatus::Timeout => unreachable!("untimed lock timed out"),
        }
    }

    /// Acquires the lock unless the timeout elapses first.
    pub fn lock_timeout(&self, timeout: Duration) -> Result<MutexGuard, LockError> {
        match self.sema.wait_timeout(timeout) {
            WaitStatus::Success => Ok(MutexGuard {
                mutex: self.clone(),
            }),
            WaitStatus::Disabled => Err(LockError::Closed),
            WaitStatus::Timeout => Err(LockError::Timeout),
        }
    }

    /// Acquires the lock only if it is free right now.
    pub fn try_lock(&self) -> Option<MutexGuard> {
        self.sema.try_acquire().then(|| MutexGuard {
            mutex: self.clone(),
        })
    }

    /// Disables the mutex; every pending and future `lock` fails with
    /// [`Closed`].
    pub fn disable(&self) {
        self.sema.disable();
    }

    pub(crate) fn semaphore(&self) -> &Semaphore {
        &self.sema
    }

    pub(crate) fn guard(&self) -> MutexGuard {
        MutexGuard {
            mutex: self.clone(),
        }
    }
}

// === impl MutexGuard ===

impl MutexGuard {
    /// Releases the lock explicitly. Equivalent to dropping the guard.
    pub fn unlock(self) {}
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        self.mutex.sema.post();
    }
}
