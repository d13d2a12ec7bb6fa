// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The stackful routine: one unit of scheduling.
//!
//! A [`Routine`] owns a [corosensei] coroutine (and through it the stack),
//! its scheduling status and its *event round*: the set of candidate events
//! it registered before suspending. At most one event of a round ever wins;
//! the win invalidates the round's [`RoutineRef`] so every sibling
//! subscription left behind in the worker's tables becomes an inert drop.
//!
//! [corosensei]: https://github.com/Amanieu/corosensei

use crate::sync::semaphore::SemaphoreInner;
use crate::worker::{self, Worker};
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::os::fd::RawFd;
use std::ptr::{self, NonNull};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

pub(crate) type RoutineId = u64;

/// Scheduling status of a routine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Status {
    /// Created but never resumed.
    New,
    /// Currently executing on its worker.
    Running,
    /// Yielded voluntarily and waits to be resumed.
    Yielding,
    /// Suspended on a committed event round.
    WaitEvents,
    /// Still suspended, but selected by a cross-thread semaphore post as a
    /// wakeup candidate.
    SemaCandidate,
    /// The routine function returned.
    Finished,
}

/// Status code delivered with a winning event.
///
/// `0` is plain readiness; negative values carry `-errno` from the poller;
/// [`PANIC_STATUS`] marks an FD torn down by `fd_panic`.
pub(crate) type EventStatus = i32;

pub(crate) const PANIC_STATUS: EventStatus = i32::MIN;

/// Kind tag of a waited event, recorded as the winner type on resume.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum EventType {
    None,
    Timer,
    IoRead,
    IoWrite,
    SemaWait,
}

/// One candidate event of a round.
pub(crate) enum EventKind {
    Timer(Instant),
    IoRead(RawFd),
    IoWrite(RawFd),
    SemaWait(Arc<SemaphoreInner>),
}

impl EventKind {
    pub(crate) fn event_type(&self) -> EventType {
        match self {
            EventKind::Timer(_) => EventType::Timer,
            EventKind::IoRead(_) => EventType::IoRead,
            EventKind::IoWrite(_) => EventType::IoWrite,
            EventKind::SemaWait(_) => EventType::SemaWait,
        }
    }
}

/// Worker-local shared handle to a suspended routine.
///
/// One clone lives in every subscription of the routine's event round; the
/// winning event invalidates the shared cell, turning all other clones into
/// inert drops at once. Not thread safe on purpose: every clone lives on the
/// owning worker's thread, so a plain `Rc` over a `Cell` suffices.
#[derive(Clone)]
pub(crate) struct RoutineRef(Rc<Cell<Option<NonNull<Routine>>>>);

impl RoutineRef {
    pub(crate) fn new(routine: NonNull<Routine>) -> Self {
        Self(Rc::new(Cell::new(Some(routine))))
    }

    /// The routine this handle points at, or `None` once invalidated.
    pub(crate) fn get(&self) -> Option<NonNull<Routine>> {
        self.0.get()
    }

    /// Nulls the pointer for every outstanding clone.
    pub(crate) fn invalidate(&self) {
        self.0.set(None);
    }
}

pub(crate) struct Routine {
    id: RoutineId,
    pub(crate) status: Status,
    pub(crate) previous_status: Status,
    /// `None` only transiently during construction.
    coro: Option<Coroutine<(), (), ()>>,
    /// Live while the coroutine is suspended inside its body; null otherwise.
    yielder: *const Yielder<(), ()>,
    /// Candidate events of the current round, in subscription order.
    events: Vec<EventKind>,
    /// Suspended-slot index each event landed in; parallel to `events`.
    round_slots: Vec<usize>,
    /// The round's shared handle; `Some` only while suspended on a round.
    current_ref: Option<RoutineRef>,
    winner_index: usize,
    winner_type: EventType,
    winner_status: EventStatus,
}

// === impl Routine ===

impl Routine {
    pub(crate) fn new(id: RoutineId, func: Box<dyn FnOnce() + Send + 'static>) -> Box<Routine> {
        let mut routine = Box::new(Routine {
            id,
            status: Status::New,
            previous_status: Status::New,
            coro: None,
            yielder: ptr::null(),
            events: Vec::new(),
            round_slots: Vec::new(),
            current_ref: None,
            winner_index: 0,
            winner_type: EventType::None,
            winner_status: 0,
        });

        routine.coro = Some(Coroutine::new(move |yielder, ()| {
            let rt = worker::current_routine();
            // Safety: the worker publishes the routine pointer before every
            // resume; on first resume that pointer is this very routine.
            unsafe {
                (*rt).yielder = yielder;
                (*rt).status = Status::Running;
            }

            let id = unsafe { (*rt).id };
            tracing::trace!(routine = id, "routine started");
            if panic::catch_unwind(AssertUnwindSafe(func)).is_err() {
                tracing::error!(routine = id, "routine terminated by panic");
            }

            // Safety: same pointer as above; still the running routine.
            unsafe {
                (*rt).yielder = ptr::null();
                (*rt).status = Status::Finished;
            }
        }));
        routine
    }

    pub(crate) fn id(&self) -> RoutineId {
        self.id
    }

    pub(crate) fn winner_index(&self) -> usize {
        self.winner_index
    }

    pub(crate) fn winner_type(&self) -> EventType {
        self.winner_type
    }

    pub(crate) fn winner_status(&self) -> EventStatus {
        self.winner_status
    }

    /// Clears the previous round and prepares a new event set.
    pub(crate) fn start_round(&mut self) {
        debug_assert!(
            self.current_ref.is_none(),
            "starting an event round while one is still committed"
        );
        self.events.clear();
        self.round_slots.clear();
        self.winner_index = 0;
        self.winner_type = EventType::None;
        self.winner_status = 0;
    }

    pub(crate) fn add_timer(&mut self, deadline: Instant) {
        self.events.push(EventKind::Timer(deadline));
    }

    pub(crate) fn add_read(&mut self, fd: RawFd) {
        self.events.push(EventKind::IoRead(fd));
    }

    pub(crate) fn add_write(&mut self, fd: RawFd) {
        self.events.push(EventKind::IoWrite(fd));
    }

    pub(crate) fn add_sema_wait(&mut self, sema: Arc<SemaphoreInner>) {
        self.events.push(EventKind::SemaWait(sema));
    }

    /// Abandons an uncommitted round after one candidate succeeded
    /// synchronously. Semaphore subscriptions already took a counter
    /// reservation at subscribe time and were never enqueued, so the debt is
    /// erased here.
    pub(crate) fn cancel_round(&mut self) {
        for event in self.events.drain(..) {
            if let EventKind::SemaWait(sema) = event {
                sema.undo_reservation();
            }
        }
        self.round_slots.clear();
    }

    /// Marks this still-suspended routine as a semaphore wakeup candidate.
    pub(crate) fn set_sema_candidate(&mut self) {
        debug_assert_eq!(self.status, Status::WaitEvents);
        self.previous_status = self.status;
        self.status = Status::SemaCandidate;
    }

    /// Commits event `index` as the round's winner.
    ///
    /// Returns `false` if another event already won. On success the shared
    /// handle is invalidated (all sibling subscriptions become inert) and the
    /// losing subscriptions are released: timer sets lose an active entry,
    /// I/O waits are dropped from the poller, semaphore slots are marked
    /// stale for lazy reclamation.
    pub(crate) fn event_happened(
        &mut self,
        worker: &mut Worker,
        index: usize,
        status: EventStatus,
    ) -> bool {
        let Some(routine_ref) = self.current_ref.take() else {
            return false;
        };
        debug_assert!(routine_ref.get().is_some(), "round won twice");
        routine_ref.invalidate();

        self.winner_index = index;
        self.winner_type = self.events[index].event_type();
        self.winner_status = status;
        tracing::trace!(
            routine = self.id,
            index,
            status,
            winner = ?self.winner_type,
            "event happened"
        );

        for (i, event) in self.events.iter().enumerate() {
            if i == index {
                continue;
            }
            let slot = self.round_slots[i];
            match event {
                EventKind::Timer(deadline) => worker.cancel_timer(*deadline),
                EventKind::IoRead(fd) => worker.cancel_io_wait(*fd, worker::Direction::Read, slot),
                EventKind::IoWrite(fd) => {
                    worker.cancel_io_wait(*fd, worker::Direction::Write, slot);
                }
                EventKind::SemaWait(_) => {
                    // The waiter entry cannot leave the lock-free FIFO; its
                    // counter reservation is erased when the stale entry is
                    // eventually popped.
                    worker.mark_sema_slot_stale(slot);
                }
            }
        }
        true
    }
}

/// Installs the current round's subscriptions into the worker's structures
/// and suspends the routine until exactly one of them fires.
///
/// # Safety
///
/// `rt` must be the currently running routine of this worker thread; the
/// caller must hold no borrow of it across this call.
pub(crate) unsafe fn commit_and_suspend(rt: *mut Routine) {
    // Safety: per contract, `rt` is live and unaliased.
    let routine_ref = RoutineRef::new(unsafe { NonNull::new_unchecked(rt) });
    unsafe {
        (*rt).current_ref = Some(routine_ref.clone());
    }

    Worker::with(|worker| {
        // Safety: the worker does not touch this routine while registering.
        let nb_events = unsafe { (*rt).events.len() };
        debug_assert!(nb_events > 0, "committing an empty event round");
        let mut slots = Vec::with_capacity(nb_events);
        for index in 0..nb_events {
            // Safety: as above; registration never resumes routines.
            let slot = match unsafe { &(&(*rt).events)[index] } {
                EventKind::Timer(deadline) => {
                    worker.register_timer(*deadline, routine_ref.clone(), index)
                }
                EventKind::IoRead(fd) => worker.register_read(*fd, routine_ref.clone(), index),
                EventKind::IoWrite(fd) => worker.register_write(*fd, routine_ref.clone(), index),
                EventKind::SemaWait(sema) => {
                    worker.register_sema_wait(sema, routine_ref.clone(), index)
                }
            };
            slots.push(slot);
        }
        // Safety: as above.
        unsafe {
            (*rt).round_slots = slots;
        }
    });

    // Safety: per contract.
    unsafe {
        (*rt).previous_status = (*rt).status;
        (*rt).status = Status::WaitEvents;
        suspend(rt);
        (*rt).previous_status = Status::WaitEvents;
        (*rt).status = Status::Running;
    }
}

/// Jumps back to the worker context.
///
/// # Safety
///
/// Only callable from inside the routine's own coroutine body (the yielder
/// pointer is live exactly then).
pub(crate) unsafe fn suspend(rt: *mut Routine) {
    // Safety: per contract the routine is currently executing, so the
    // yielder stored at coroutine entry is valid.
    unsafe {
        let yielder = (*rt).yielder;
        debug_assert!(!yielder.is_null(), "suspend outside a running routine");
        (*yielder).suspend(());
    }
}

/// Resumes a routine, either entering it for the first time or re-entering
/// its saved context.
///
/// # Safety
///
/// `rt` must be uniquely owned by the caller for the duration of the call,
/// and the worker thread-local running pointer must already point at it.
pub(crate) unsafe fn resume(rt: *mut Routine) {
    // Safety: unique ownership per contract; the coroutine body only touches
    // fields disjoint from `coro`.
    let coro = unsafe {
        (*rt).coro
            .as_mut()
            .expect("resumed a routine whose coroutine is gone")
    };
    match coro.resume(()) {
        CoroutineResult::Yield(()) => {}
        CoroutineResult::Return(()) => {
            // Safety: the routine just returned to us; it is ours again.
            debug_assert_eq!(unsafe { (*rt).status }, Status::Finished);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routine_ref_invalidation_reaches_all_clones() {
        let mut routine = Routine::new(1, Box::new(|| {}));
        let ptr = NonNull::from(&mut *routine);

        let a = RoutineRef::new(ptr);
        let b = a.clone();
        let c = b.clone();

        assert_eq!(a.get(), Some(ptr));
        assert_eq!(c.get(), Some(ptr));

        b.invalidate();
        assert!(a.get().is_none());
        assert!(b.get().is_none());
        assert!(c.get().is_none());
    }

    #[test]
    fn round_bookkeeping() {
        let mut routine = Routine::new(2, Box::new(|| {}));
        routine.start_round();
        routine.add_timer(Instant::now());
        routine.add_read(0);
        assert_eq!(routine.events.len(), 2);
        assert_eq!(routine.events[0].event_type(), EventType::Timer);
        assert_eq!(routine.events[1].event_type(), EventType::IoRead);

        routine.cancel_round();
        assert!(routine.events.is_empty());

        routine.start_round();
        assert_eq!(routine.winner_type(), EventType::None);
    }
}
