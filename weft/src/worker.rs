// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! One worker = one OS thread running one scheduler loop.
//!
//! Each worker owns a FIFO run queue, a deadline-sorted timer map, a sparse
//! table of suspended routines and an I/O poller. Every pass it drains its
//! command inbox, resumes every ready routine once, computes the next timer
//! deadline and parks in the poller until something fires.
//!
//! The worker lives in a thread-local for the lifetime of its loop so that
//! code running *inside* a routine (syscall wrappers, channel operations,
//! `select_any`) can reach the scheduler state of the thread it is pinned to.

use crate::engine::{EngineCommand, EngineShared};
use crate::io::{IoEvent, Poller};
use crate::routine::{self, EventStatus, PANIC_STATUS, Routine, RoutineId, RoutineRef, Status};
use crate::sync::semaphore::{SemaphoreInner, Waiter};
use crossbeam_queue::SegQueue;
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub(crate) use crate::io::Direction;

/// Command sent to a worker, either by the engine or by a peer worker.
///
/// New routines travel as their entry closure; the routine itself (stack
/// included) is built on the worker that will own it and never crosses a
/// thread boundary afterwards.
pub(crate) enum Command {
    AddRoutine {
        id: RoutineId,
        func: Box<dyn FnOnce() + Send + 'static>,
    },
    /// A semaphore post elected the routine recorded in suspended slot
    /// `slot` as a wakeup candidate.
    ScheduleWaitingRoutine {
        sema: Weak<SemaphoreInner>,
        slot: usize,
    },
    Finish,
    FdPanic(RawFd),
}

/// The cross-thread face of a worker: its command inbox plus the waker that
/// interrupts its poller.
pub(crate) struct WorkerShared {
    id: usize,
    commands: SegQueue<Command>,
    /// Total number of commands ever enqueued. Compared against the
    /// worker-local processed count for the idle protocol.
    enqueued: AtomicUsize,
    waker: mio::Waker,
}

static_assertions::assert_impl_all!(WorkerShared: Send, Sync);

// === impl WorkerShared ===

impl WorkerShared {
    pub(crate) fn new(id: usize, waker: mio::Waker) -> Self {
        Self {
            id,
            commands: SegQueue::new(),
            enqueued: AtomicUsize::new(0),
            waker,
        }
    }

    pub(crate) fn send(&self, command: Command) {
        self.commands.push(command);
        self.enqueued.fetch_add(1, Ordering::Release);
        if let Err(err) = self.waker.wake() {
            tracing::warn!(worker = self.id, %err, "failed to wake worker");
        }
    }

    pub(crate) fn enqueued(&self) -> usize {
        self.enqueued.load(Ordering::Acquire)
    }
}

/// Entry of the run queue.
pub(crate) enum Scheduled {
    /// A ready routine, exclusively owned.
    Owned(Box<Routine>),
    /// A suspended routine elected by a semaphore post. It stays owned by
    /// its event round until the claim succeeds.
    Candidate {
        routine: RoutineRef,
        event_index: usize,
        sema: Weak<SemaphoreInner>,
    },
}

/// Routines sharing one timer deadline. Cancelled entries only decrement
/// `nb_active`; their slots are swept lazily.
#[derive(Default)]
struct TimedSet {
    slots: Vec<usize>,
    nb_active: usize,
}

/// Record linking an installed event subscription back to its routine.
struct SuspendedSlot {
    routine: RoutineRef,
    event_index: usize,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum WorkerStatus {
    Running,
    Finishing,
    Finished,
}

pub(crate) struct Worker {
    id: usize,
    shared: Arc<WorkerShared>,
    engine: Arc<EngineShared>,
    run_queue: VecDeque<Scheduled>,
    timers: BTreeMap<Instant, TimedSet>,
    suspended: Slab<SuspendedSlot>,
    /// Routines suspended on I/O or semaphores (timers are tracked through
    /// the timer map instead).
    nb_suspended: usize,
    /// Commands handled so far; the counterpart of [`WorkerShared::enqueued`].
    nb_processed: usize,
    poller: Poller,
    status: WorkerStatus,
}

thread_local! {
    static CURRENT: RefCell<Option<Worker>> = const { RefCell::new(None) };
    static RUNNING: Cell<*mut Routine> = const { Cell::new(ptr::null_mut()) };
}

/// The routine currently executing on this thread.
///
/// # Panics
///
/// Panics when called outside a routine; the scheduler operations built on
/// top of this are only available from routine context.
pub(crate) fn current_routine() -> *mut Routine {
    let rt = RUNNING.get();
    assert!(
        !rt.is_null(),
        "this operation is only available from inside a routine"
    );
    rt
}

pub(crate) fn is_routine_context() -> bool {
    !RUNNING.get().is_null()
}

// === impl Worker ===

impl Worker {
    pub(crate) fn new(
        id: usize,
        shared: Arc<WorkerShared>,
        engine: Arc<EngineShared>,
        poller: Poller,
    ) -> Self {
        Self {
            id,
            shared,
            engine,
            run_queue: VecDeque::new(),
            timers: BTreeMap::new(),
            suspended: Slab::new(),
            nb_suspended: 0,
            nb_processed: 0,
            poller,
            status: WorkerStatus::Running,
        }
    }

    /// Grants access to the worker owning the current thread.
    ///
    /// # Panics
    ///
    /// Panics on threads that are not weft workers, and on reentrant use.
    pub(crate) fn with<R>(f: impl FnOnce(&mut Worker) -> R) -> R {
        CURRENT.with(|current| {
            let mut borrow = current.borrow_mut();
            let worker = borrow
                .as_mut()
                .expect("not running on a weft worker thread");
            f(worker)
        })
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn engine(&self) -> &Arc<EngineShared> {
        &self.engine
    }

    fn pending_commands(&self) -> usize {
        self.shared.enqueued().wrapping_sub(self.nb_processed)
    }

    // --- event registration (called while a routine commits its round) ---

    pub(crate) fn register_timer(
        &mut self,
        deadline: Instant,
        routine: RoutineRef,
        event_index: usize,
    ) -> usize {
        let slot = self.suspended.insert(SuspendedSlot {
            routine,
            event_index,
        });
        let set = self.timers.entry(deadline).or_default();
        set.slots.push(slot);
        set.nb_active += 1;
        tracing::trace!(worker = self.id, ?deadline, slot, "registered timer");
        slot
    }

    pub(crate) fn register_read(
        &mut self,
        fd: RawFd,
        routine: RoutineRef,
        event_index: usize,
    ) -> usize {
        let record = SuspendedSlot {
            routine,
            event_index,
        };
        let waiters = self.poller.ensure_registered(fd);
        if let Some(slot) = waiters.read_slot {
            // Same-FD policy: the new subscription replaces the abandoned one.
            self.suspended[slot] = record;
            slot
        } else {
            let slot = self.suspended.insert(record);
            waiters.read_slot = Some(slot);
            self.nb_suspended += 1;
            slot
        }
    }

    pub(crate) fn register_write(
        &mut self,
        fd: RawFd,
        routine: RoutineRef,
        event_index: usize,
    ) -> usize {
        let record = SuspendedSlot {
            routine,
            event_index,
        };
        let waiters = self.poller.ensure_registered(fd);
        if let Some(slot) = waiters.write_slot {
            self.suspended[slot] = record;
            slot
        } else {
            let slot = self.suspended.insert(record);
            waiters.write_slot = Some(slot);
            self.nb_suspended += 1;
            slot
        }
    }

    pub(crate) fn register_sema_wait(
        &mut self,
        sema: &Arc<SemaphoreInner>,
        routine: RoutineRef,
        event_index: usize,
    ) -> usize {
        let slot = self.suspended.insert(SuspendedSlot {
            routine,
            event_index,
        });
        self.nb_suspended += 1;
        sema.enqueue_waiter(Waiter {
            worker: self.shared.clone(),
            slot,
        });
        slot
    }

    /// `true` when the FD can be driven through the poller; regular files
    /// cannot and run their syscalls synchronously instead.
    pub(crate) fn fd_pollable(&mut self, fd: RawFd) -> bool {
        self.poller.ensure_registered(fd).pollable
    }

    // --- losing-subscription cleanup (called from `event_happened`) ---

    pub(crate) fn cancel_timer(&mut self, deadline: Instant) {
        if let Some(set) = self.timers.get_mut(&deadline) {
            set.nb_active = set.nb_active.saturating_sub(1);
        }
    }

    pub(crate) fn cancel_io_wait(&mut self, fd: RawFd, direction: Direction, slot: usize) {
        if let Some(waiters) = self.poller.waiters(fd) {
            let installed = match direction {
                Direction::Read => &mut waiters.read_slot,
                Direction::Write => &mut waiters.write_slot,
            };
            if *installed == Some(slot) {
                *installed = None;
            }
        }
        if self.suspended.try_remove(slot).is_some() {
            self.nb_suspended -= 1;
        }
    }

    /// A semaphore subscription lost its round. The waiter entry cannot be
    /// unlinked from the lock-free queue, so only the suspension count is
    /// released here; the slot stays allocated (invalidated) until the entry
    /// is eventually popped and recognized as stale.
    ///
    /// The slot may already be vacant: a post can promote the routine to a
    /// wakeup candidate (freeing the slot) right before another event of the
    /// same round wins. The candidate entry then handles its own cleanup.
    pub(crate) fn mark_sema_slot_stale(&mut self, slot: usize) {
        if self.suspended.contains(slot) {
            self.nb_suspended -= 1;
        }
    }

    // --- event firing ---

    /// Wakes the routine recorded in `slot` (an I/O or semaphore slot).
    fn fire_slot(&mut self, slot: usize, status: EventStatus) {
        let Some(record) = self.suspended.try_remove(slot) else {
            return;
        };
        self.nb_suspended -= 1;
        match record.routine.get() {
            Some(rt) => {
                // Safety: the routine is suspended and owned by this worker's
                // tables; the valid ref proves no other event claimed it.
                let won =
                    unsafe { (*rt.as_ptr()).event_happened(self, record.event_index, status) };
                debug_assert!(won);
                if won {
                    // Safety: winning the round transfers ownership of the
                    // routine (leaked at suspension) back to the run queue.
                    let routine = unsafe { Box::from_raw(rt.as_ptr()) };
                    self.run_queue.push_back(Scheduled::Owned(routine));
                }
            }
            None => {
                // Inert drop: another event of the round already won.
            }
        }
    }

    fn dispatch_io(&mut self, event: IoEvent) {
        let Some(waiters) = self.poller.waiters(event.fd) else {
            return;
        };
        let read_slot = if event.readable {
            waiters.read_slot.take()
        } else {
            None
        };
        let write_slot = if event.writable {
            waiters.write_slot.take()
        } else {
            None
        };
        if let Some(slot) = read_slot {
            self.fire_slot(slot, event.status);
        }
        if let Some(slot) = write_slot {
            self.fire_slot(slot, event.status);
        }
    }

    /// Tears down `fd`: removes it from the poller and wakes any waiter with
    /// a bad-descriptor status.
    pub(crate) fn unregister_fd(&mut self, fd: RawFd) {
        if let Some(waiters) = self.poller.deregister(fd) {
            if let Some(slot) = waiters.read_slot {
                self.fire_slot(slot, -libc::EBADF);
            }
            if let Some(slot) = waiters.write_slot {
                self.fire_slot(slot, -libc::EBADF);
            }
        }
    }

    /// Synthesizes read and write readiness with the panic status, waking
    /// every routine blocked on `fd` on this worker.
    fn fd_panic(&mut self, fd: RawFd) {
        if let Some(waiters) = self.poller.waiters(fd) {
            let read_slot = waiters.read_slot.take();
            let write_slot = waiters.write_slot.take();
            if read_slot.is_some() || write_slot.is_some() {
                tracing::debug!(worker = self.id, fd, "fd panic");
            }
            if let Some(slot) = read_slot {
                self.fire_slot(slot, PANIC_STATUS);
            }
            if let Some(slot) = write_slot {
                self.fire_slot(slot, PANIC_STATUS);
            }
        }
    }

    fn fire_expired_timers(&mut self) {
        loop {
            let now = Instant::now();
            let Some((&deadline, _)) = self.timers.first_key_value() else {
                return;
            };
            if deadline > now {
                return;
            }
            let set = self
                .timers
                .remove(&deadline)
                .expect("first timer entry vanished");
            tracing::trace!(worker = self.id, ?deadline, slots = set.slots.len(), "timer fired");
            for slot in set.slots {
                let Some(record) = self.suspended.try_remove(slot) else {
                    continue;
                };
                if let Some(rt) = record.routine.get() {
                    // Safety: as in `fire_slot`; timers transfer ownership
                    // back to the run queue the same way.
                    let won =
                        unsafe { (*rt.as_ptr()).event_happened(self, record.event_index, 0) };
                    if won {
                        // Safety: see above.
                        let routine = unsafe { Box::from_raw(rt.as_ptr()) };
                        self.run_queue.push_back(Scheduled::Owned(routine));
                    }
                }
            }
        }
    }

    /// Drops leading timer sets whose every entry was cancelled.
    fn sweep_cancelled_timers(&mut self) {
        while let Some((&deadline, set)) = self.timers.first_key_value() {
            if set.nb_active != 0 {
                return;
            }
            let set = self
                .timers
                .remove(&deadline)
                .expect("first timer entry vanished");
            for slot in set.slots {
                let _ = self.suspended.try_remove(slot);
            }
        }
    }

    // --- command intake ---

    fn handle_commands(&mut self) {
        while let Some(command) = self.shared.commands.pop() {
            self.nb_processed += 1;
            match command {
                Command::AddRoutine { id, func } => {
                    tracing::trace!(worker = self.id, routine = id, "adding routine");
                    self.run_queue
                        .push_back(Scheduled::Owned(Routine::new(id, func)));
                }
                Command::ScheduleWaitingRoutine { sema, slot } => {
                    self.schedule_waiting_routine(sema, slot);
                }
                Command::Finish => {
                    tracing::debug!(worker = self.id, "finish requested");
                    if self.status == WorkerStatus::Running {
                        self.status = WorkerStatus::Finishing;
                    }
                }
                Command::FdPanic(fd) => self.fd_panic(fd),
            }
        }
    }

    fn schedule_waiting_routine(&mut self, sema: Weak<SemaphoreInner>, slot: usize) {
        let Some(record) = self.suspended.get(slot) else {
            // The slot is gone entirely; pass the wakeup on.
            if let Some(sema) = sema.upgrade() {
                sema.pop_a_waiter();
            }
            return;
        };
        if record.routine.get().is_some() {
            let record = self.suspended.remove(slot);
            self.nb_suspended -= 1;
            let routine_ref = record.routine.clone();
            // Safety: the routine is suspended; flagging it as a candidate
            // does not move or resume it.
            unsafe {
                (*routine_ref.get().expect("just checked").as_ptr()).set_sema_candidate();
            }
            self.run_queue.push_back(Scheduled::Candidate {
                routine: record.routine,
                event_index: record.event_index,
                sema,
            });
        } else {
            // Invalidated by a timeout or a racing event: drop the stale
            // slot, erase its abandoned counter reservation, and hand the
            // wakeup to the next waiter in line.
            self.suspended.remove(slot);
            if let Some(sema) = sema.upgrade() {
                sema.undo_reservation();
                sema.pop_a_waiter();
            }
        }
    }

    // --- pass structure ---

    /// Timeout for the next poll: zero when work or commands are pending,
    /// the earliest timer otherwise, unbounded when fully idle.
    fn next_timeout(&self) -> Option<Duration> {
        if !self.run_queue.is_empty() || self.pending_commands() > 0 {
            return Some(Duration::ZERO);
        }
        self.timers
            .first_key_value()
            .map(|(deadline, _)| deadline.saturating_duration_since(Instant::now()))
    }

    /// End-of-pass bookkeeping; returns `true` when the worker is done.
    fn end_of_pass(&mut self) -> bool {
        self.sweep_cancelled_timers();

        let pending = self.pending_commands();
        let empty =
            self.run_queue.is_empty() && self.timers.is_empty() && self.nb_suspended == 0;
        if empty && pending == 0 {
            match self.status {
                WorkerStatus::Finishing => {
                    tracing::debug!(worker = self.id, "worker drained, finishing");
                    self.status = WorkerStatus::Finished;
                    return true;
                }
                WorkerStatus::Running => {
                    self.engine.push(EngineCommand::NotifyIdle {
                        worker: self.id,
                        processed: self.nb_processed,
                    });
                }
                WorkerStatus::Finished => unreachable!("finished worker kept looping"),
            }
        }
        false
    }
}

/// Entry point of a worker thread. The worker is assembled here so that none
/// of its thread-bound state (routines, shared handles) ever has to be `Send`.
pub(crate) fn worker_main(
    id: usize,
    shared: Arc<WorkerShared>,
    engine: Arc<EngineShared>,
    poller: Poller,
) {
    let _span = tracing::debug_span!("worker", id).entered();
    let worker = Worker::new(id, shared, engine.clone(), poller);

    CURRENT.with(|current| {
        let prev = current.borrow_mut().replace(worker);
        debug_assert!(prev.is_none(), "worker installed twice on one thread");
    });

    loop {
        let timeout = Worker::with(|worker| worker.next_timeout());
        Worker::with(|worker| {
            let (events, _woken) = worker.poller.poll(timeout);
            for event in events {
                worker.dispatch_io(event);
            }
            worker.handle_commands();
            worker.fire_expired_timers();
        });
        execute_pass();
        if Worker::with(Worker::end_of_pass) {
            break;
        }
    }

    CURRENT.with(|current| {
        current.borrow_mut().take();
    });
    engine.push(EngineCommand::NotifyEndOfThread);
    tracing::debug!(id, "worker thread exiting");
}

/// Resumes every ready routine once, in FIFO order. Yielded routines land in
/// the next pass; suspending routines hand themselves to the event tables;
/// finished routines are destroyed.
fn execute_pass() {
    let mut queue = Worker::with(|worker| mem::take(&mut worker.run_queue));
    let mut next = VecDeque::new();

    while let Some(entry) = queue.pop_front() {
        match entry {
            Scheduled::Owned(routine) => run_one(routine, &mut next),
            Scheduled::Candidate {
                routine,
                event_index,
                sema,
            } => match routine.get() {
                Some(rt) => {
                    // Safety: the routine is suspended on this worker; the
                    // valid ref means its round is still unclaimed.
                    let claimed = Worker::with(|worker| unsafe {
                        (*rt.as_ptr()).event_happened(worker, event_index, 0)
                    });
                    debug_assert!(claimed);
                    if claimed {
                        // Safety: claim transfers ownership back to us.
                        let routine = unsafe { Box::from_raw(rt.as_ptr()) };
                        run_one(routine, &mut next);
                    }
                }
                None => {
                    // The wakeup raced another event of the round: erase the
                    // abandoned reservation and give the semaphore ticket to
                    // the next waiter.
                    if let Some(sema) = sema.upgrade() {
                        sema.undo_reservation();
                        sema.pop_a_waiter();
                    }
                }
            },
        }
    }

    Worker::with(|worker| {
        // Routines woken mid-pass (an fd close for instance) queued behind us.
        next.extend(worker.run_queue.drain(..));
        worker.run_queue = next;
    });
}

fn run_one(routine: Box<Routine>, next: &mut VecDeque<Scheduled>) {
    let rt = Box::into_raw(routine);
    RUNNING.set(rt);
    // Safety: `rt` came out of the exclusively-owned box above and the
    // running pointer is published for the coroutine body.
    unsafe { routine::resume(rt) };
    RUNNING.set(ptr::null_mut());

    // Safety: the routine yielded or returned; we own it again.
    let (status, previous) = unsafe { ((*rt).status, (*rt).previous_status) };
    tracing::trace!(?status, ?previous, "routine yielded control");
    match status {
        Status::Yielding => {
            // Safety: rebuilding the box we leaked above.
            let routine = unsafe { Box::from_raw(rt) };
            next.push_back(Scheduled::Owned(routine));
        }
        Status::WaitEvents => {
            // Ownership moved to the event round's shared handle; the
            // winning event rebuilds the box.
        }
        Status::Finished => {
            // Safety: as above; dropping frees the stack.
            let routine = unsafe { Box::from_raw(rt) };
            tracing::trace!(routine = routine.id(), "routine finished");
            drop(routine);
        }
        Status::New | Status::Running | Status::SemaCandidate => {
            unreachable!("routine came back in status {status:?}")
        }
    }
}
