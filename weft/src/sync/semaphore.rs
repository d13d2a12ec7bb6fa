// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Counting semaphore for routines.
//!
//! The counter is `capacity + posts - waits`; a wait that drives it negative
//! suspends the calling routine and enqueues it in the waiter FIFO. A post
//! that brings the counter up from below pops exactly one waiter and wakes
//! it through the owning worker's command queue, so wakeups cross threads
//! without ever touching a foreign run queue directly.

use crate::routine::{self, EventType};
use crate::worker::{self, Command, WorkerShared};
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Outcome of [`Semaphore::wait`] and [`Semaphore::wait_timeout`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitStatus {
    /// A ticket was acquired.
    Success,
    /// The bundled timer fired first.
    Timeout,
    /// The semaphore was disabled.
    Disabled,
}

/// One enqueued waiter: the worker owning the suspended routine plus the
/// suspended-slot index identifying it there.
pub(crate) struct Waiter {
    pub(crate) worker: Arc<WorkerShared>,
    pub(crate) slot: usize,
}

pub(crate) struct SemaphoreInner {
    counter: AtomicIsize,
    waiters: SegQueue<Waiter>,
    /// Wakeups whose pop found the waiter FIFO still empty (the decrement/
    /// enqueue window); consumed by the next enqueue so no post is lost.
    undelivered: AtomicUsize,
    disabled: AtomicBool,
    myself: Weak<SemaphoreInner>,
}

static_assertions::assert_impl_all!(SemaphoreInner: Send, Sync);

// === impl SemaphoreInner ===

impl SemaphoreInner {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new_cyclic(|myself| Self {
            counter: AtomicIsize::new(isize::try_from(capacity).expect("capacity too large")),
            waiters: SegQueue::new(),
            undelivered: AtomicUsize::new(0),
            disabled: AtomicBool::new(false),
            myself: myself.clone(),
        })
    }

    /// Takes a ticket, going into debt when none is free. A `false` return
    /// leaves the counter decremented: the caller has committed to either
    /// enqueueing itself or repaying with a [`post`](Self::post).
    pub(crate) fn acquire_or_debt(&self) -> bool {
        self.counter.fetch_sub(1, Ordering::AcqRel) > 0
    }

    /// Takes a ticket only if one is free.
    pub(crate) fn try_acquire(&self) -> bool {
        let mut current = self.counter.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return false;
            }
            match self.counter.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn post(&self) {
        let previous = self.counter.fetch_add(1, Ordering::AcqRel);
        if previous < 0 {
            // At least one waiter is accounted for; wake exactly one.
            self.pop_a_waiter();
        }
    }

    /// Pops one waiter and dispatches the wakeup to its owning worker.
    ///
    /// An empty pop while the counter still shows outstanding debt means a
    /// waiter is between its decrement and its enqueue; the wakeup is banked
    /// for that enqueue instead of being lost. With no debt outstanding the
    /// ticket already rests in the counter and needs no delivery.
    pub(crate) fn pop_a_waiter(&self) {
        match self.waiters.pop() {
            Some(waiter) => {
                waiter.worker.send(Command::ScheduleWaitingRoutine {
                    sema: self.myself.clone(),
                    slot: waiter.slot,
                });
            }
            None => {
                if self.counter.load(Ordering::Acquire) <= 0 {
                    self.undelivered.fetch_add(1, Ordering::Release);
                }
            }
        }
    }

    /// Erases the counter debt of a reservation that will never be claimed:
    /// a cancelled round entry (never enqueued) or a stale waiter entry at
    /// the moment it is popped. Must run exactly once per abandoned
    /// reservation.
    pub(crate) fn undo_reservation(&self) {
        self.counter.fetch_add(1, Ordering::AcqRel);
    }

    /// Enqueues a suspending waiter, then closes the race windows: a post
    /// that raced the enqueue either left the counter positive or banked an
    /// undelivered wakeup, and a disable that raced it drains the queue.
    pub(crate) fn enqueue_waiter(&self, waiter: Waiter) {
        self.waiters.push(waiter);

        if self.counter.load(Ordering::Acquire) > 0 {
            self.pop_a_waiter();
        } else {
            let mut credits = self.undelivered.load(Ordering::Acquire);
            while credits > 0 {
                match self.undelivered.compare_exchange_weak(
                    credits,
                    credits - 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.pop_a_waiter();
                        break;
                    }
                    Err(actual) => credits = actual,
                }
            }
        }

        if self.disabled.load(Ordering::Acquire) {
            self.drain_waiters();
        }
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Permanently disables the semaphore and wakes every waiter; they
    /// observe [`WaitStatus::Disabled`] on resume. Disabled semaphores never
    /// re-enable.
    pub(crate) fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
        self.drain_waiters();
    }

    fn drain_waiters(&self) {
        while let Some(waiter) = self.waiters.pop() {
            waiter.worker.send(Command::ScheduleWaitingRoutine {
                sema: self.myself.clone(),
                slot: waiter.slot,
            });
        }
    }

    #[cfg(test)]
    pub(crate) fn counter(&self) -> isize {
        self.counter.load(Ordering::Acquire)
    }
}

/// A counting semaphore usable from any routine on any worker.
///
/// Cloning yields another handle to the same semaphore.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

static_assertions::assert_impl_all!(Semaphore: Send, Sync);

// === impl Semaphore ===

impl Semaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: SemaphoreInner::new(capacity),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<SemaphoreInner> {
        &self.inner
    }

    /// Takes a ticket, suspending the calling routine until one is posted.
    ///
    /// # Panics
    ///
    /// Panics when it would have to suspend outside a routine.
    pub fn wait(&self) -> WaitStatus {
        self.wait_inner(None)
    }

    /// Like [`wait`](Self::wait), bundling a timer with the acquire; whichever
    /// fires first wins the round.
    pub fn wait_timeout(&self, timeout: Duration) -> WaitStatus {
        self.wait_inner(Some(timeout))
    }

    fn wait_inner(&self, timeout: Option<Duration>) -> WaitStatus {
        if self.inner.is_disabled() {
            return WaitStatus::Disabled;
        }
        if self.inner.acquire_or_debt() {
            return WaitStatus::Success;
        }

        let rt = worker::current_routine();
        // Safety: `rt` is the currently running routine on this thread and
        // no borrow of it is held across the suspension.
        unsafe {
            (*rt).start_round();
            (*rt).add_sema_wait(self.inner.clone());
            if let Some(timeout) = timeout {
                (*rt).add_timer(Instant::now() + timeout);
            }
            routine::commit_and_suspend(rt);
            match (*rt).winner_type() {
                // The losing semaphore subscription stays queued as a stale
                // entry; its reservation is erased when that entry is popped.
                EventType::Timer => WaitStatus::Timeout,
                EventType::SemaWait => {
                    if self.inner.is_disabled() {
                        WaitStatus::Disabled
                    } else {
                        WaitStatus::Success
                    }
                }
                winner => unreachable!("unexpected semaphore wait winner {winner:?}"),
            }
        }
    }

    /// Takes a ticket without ever suspending; `false` when none is free or
    /// the semaphore is disabled.
    pub fn try_acquire(&self) -> bool {
        !self.inner.is_disabled() && self.inner.try_acquire()
    }

    /// Gives a ticket back, waking the longest-suspended waiter if any.
    pub fn post(&self) {
        self.inner.post();
    }

    /// Disables the semaphore: all current and future waits return
    /// [`WaitStatus::Disabled`].
    pub fn disable(&self) {
        self.inner.disable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn uncontended_fast_path() {
        let sema = Semaphore::new(2);
        assert!(sema.try_acquire());
        assert!(sema.try_acquire());
        assert!(!sema.try_acquire());
        sema.post();
        assert!(sema.try_acquire());
    }

    #[test]
    fn disabled_semaphores_reject_everything() {
        let sema = Semaphore::new(1);
        sema.disable();
        assert!(!sema.try_acquire());
        assert!(sema.inner.is_disabled());
    }

    #[test]
    fn waiters_are_served_in_fifo_order() {
        static ORDER: StdMutex<Vec<usize>> = StdMutex::new(Vec::new());
        ORDER.lock().unwrap().clear();

        crate::run(1, || {
            let sema = Semaphore::new(1);
            assert!(sema.try_acquire());

            for i in 0..10 {
                let sema = sema.clone();
                crate::start(move || {
                    assert_eq!(sema.wait(), WaitStatus::Success);
                    ORDER.lock().unwrap().push(i);
                    sema.post();
                });
            }

            // Let every waiter enqueue itself before the first post.
            let sema_for_poster = sema.clone();
            crate::start(move || {
                for _ in 0..3 {
                    crate::yield_now();
                }
                sema_for_poster.post();
            });
        });

        let order = ORDER.lock().unwrap();
        assert_eq!(&*order, &(0..10).collect::<Vec<_>>());
    }

    #[test]
    fn conservation_at_quiescence() {
        let sema = Arc::new(Semaphore::new(3));
        let acquired = Arc::new(AtomicUsize::new(0));
        {
            let sema = sema.clone();
            let acquired = acquired.clone();
            crate::run(2, move || {
                for _ in 0..6 {
                    let sema = sema.clone();
                    let acquired = acquired.clone();
                    crate::start(move || {
                        assert_eq!(sema.wait(), WaitStatus::Success);
                        acquired.fetch_add(1, Ordering::Relaxed);
                        crate::yield_now();
                        sema.post();
                    });
                }
            });
        }
        // All waits returned and every ticket was posted back.
        assert_eq!(acquired.load(Ordering::Relaxed), 6);
        assert_eq!(sema.inner().counter(), 3);
    }

    #[test]
    fn wait_timeout_expires_without_a_post() {
        static OUTCOME: StdMutex<Option<WaitStatus>> = StdMutex::new(None);
        crate::run(1, || {
            let sema = Semaphore::new(0);
            let status = sema.wait_timeout(Duration::from_millis(5));
            *OUTCOME.lock().unwrap() = Some(status);
        });
        assert_eq!(*OUTCOME.lock().unwrap(), Some(WaitStatus::Timeout));
    }

    #[test]
    fn timed_out_reservation_is_erased_when_its_entry_is_popped() {
        let sema = Arc::new(Semaphore::new(0));
        {
            let sema = sema.clone();
            crate::run(1, move || {
                assert_eq!(
                    sema.wait_timeout(Duration::from_millis(5)),
                    WaitStatus::Timeout
                );
                // The abandoned reservation shows as debt until a post pops
                // the stale waiter entry and erases it.
                assert_eq!(sema.inner().counter(), -1);
                sema.post();
                for _ in 0..4 {
                    crate::yield_now();
                }
            });
        }
        // Debt erased, and the unclaimed post rests in the counter.
        assert_eq!(sema.inner().counter(), 1);
    }

    #[test]
    fn disable_unblocks_every_waiter() {
        static DISABLED: AtomicUsize = AtomicUsize::new(0);
        crate::run(2, || {
            let sema = Semaphore::new(0);
            for _ in 0..4 {
                let sema = sema.clone();
                crate::start(move || {
                    if sema.wait() == WaitStatus::Disabled {
                        DISABLED.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
            let sema = sema.clone();
            crate::start(move || {
                for _ in 0..4 {
                    crate::yield_now();
                }
                sema.disable();
            });
        });
        assert_eq!(DISABLED.load(Ordering::Relaxed), 4);
    }
}
