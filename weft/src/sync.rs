// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronization primitives for routines: counting [`Semaphore`],
//! [`Mutex`] and the CSP [`Channel`].

pub(crate) mod channel;
pub(crate) mod mutex;
pub(crate) mod semaphore;

pub use channel::Channel;
pub use mutex::{LockError, Mutex, MutexGuard};
pub use semaphore::{Semaphore, WaitStatus};
