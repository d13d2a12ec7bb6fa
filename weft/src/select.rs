// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `select_any`: suspend on a heterogeneous set of events until exactly one
//! fires.
//!
//! Each event is built by a factory (`event_read`, `event_timer`,
//! `event_chan_recv`, ...) wrapping a user callback; the callback of the
//! winning event runs with the completion value and its return value becomes
//! the select result.
//!
//! Internally every adapter splits into *subscribe* (attempt the operation
//! synchronously; on would-block, register one round entry) and *complete*
//! (run the callback once the event won). If any subscribe succeeds on the
//! spot the round is cancelled and no suspension happens; otherwise the
//! round commits and the routine parks until one subscription fires.

use crate::error::{self, Closed};
use crate::routine::{self, EventStatus, EventType, PANIC_STATUS, Routine};
use crate::sync::channel::Channel;
use crate::sync::mutex::{Mutex, MutexGuard};
use crate::sync::semaphore::{Semaphore, SemaphoreInner, WaitStatus};
use crate::worker;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The event round under construction, passed to [`SelectEvent::subscribe`].
pub struct Round<'a> {
    routine: &'a mut Routine,
}

impl Round<'_> {
    fn add_timer(&mut self, deadline: Instant) {
        self.routine.add_timer(deadline);
    }

    fn add_read(&mut self, fd: RawFd) {
        self.routine.add_read(fd);
    }

    fn add_write(&mut self, fd: RawFd) {
        self.routine.add_write(fd);
    }

    fn add_sema(&mut self, sema: &Arc<SemaphoreInner>) {
        self.routine.add_sema_wait(sema.clone());
    }
}

/// How the winning event completed; passed to [`SelectEvent::complete`].
#[derive(Copy, Clone, Debug)]
pub struct EventOutcome {
    /// The subscribe attempt succeeded synchronously; the round never
    /// committed.
    completed_sync: bool,
    winner: EventType,
    status: EventStatus,
}

impl EventOutcome {
    fn sync() -> Self {
        Self {
            completed_sync: true,
            winner: EventType::None,
            status: 0,
        }
    }

    fn panicked(&self) -> bool {
        !self.completed_sync && self.status == PANIC_STATUS
    }
}

/// One selectable event.
///
/// Contract: a `subscribe` returning `false` must have registered exactly
/// one round entry, so that the round's winner index maps back onto the
/// event list handed to [`select_any`].
pub trait SelectEvent<R> {
    fn subscribe(&mut self, round: &mut Round<'_>) -> bool;
    fn complete(&mut self, outcome: EventOutcome) -> R;
}

/// Waits on all `events` at once and runs the callback of the single one
/// that fires first. Events are attempted in order; the first that can
/// complete without suspending wins immediately.
///
/// # Panics
///
/// Panics when called outside a routine or with an empty event list.
pub fn select_any<R>(events: &mut [&mut dyn SelectEvent<R>]) -> R {
    assert!(!events.is_empty(), "select_any needs at least one event");

    let rt = worker::current_routine();
    // Safety: `rt` is the current routine; borrows of it stay confined to
    // the subscribe calls below and none is held across the suspension.
    unsafe {
        (*rt).start_round();
    }

    let mut ready = None;
    for (index, event) in events.iter_mut().enumerate() {
        // Safety: exclusive borrow for the duration of one subscribe call.
        let mut round = Round {
            routine: unsafe { &mut *rt },
        };
        if event.subscribe(&mut round) {
            ready = Some(index);
            break;
        }
    }

    match ready {
        Some(index) => {
            // Safety: as above.
            unsafe {
                (*rt).cancel_round();
            }
            events[index].complete(EventOutcome::sync())
        }
        None => {
            // Safety: as above.
            unsafe {
                routine::commit_and_suspend(rt);
                let outcome = EventOutcome {
                    completed_sync: false,
                    winner: (*rt).winner_type(),
                    status: (*rt).winner_status(),
                };
                debug_assert_ne!(outcome.winner, EventType::None);
                events[(*rt).winner_index()].complete(outcome)
            }
        }
    }
}

// === timers ===

pub struct EventTimer<F> {
    deadline: Instant,
    callback: Option<F>,
}

/// A timer event: fires `timeout` from now.
pub fn event_timer<R, F>(timeout: Duration, callback: F) -> EventTimer<F>
where
    F: FnOnce() -> R,
{
    EventTimer {
        deadline: Instant::now() + timeout,
        callback: Some(callback),
    }
}

impl<R, F> SelectEvent<R> for EventTimer<F>
where
    F: FnOnce() -> R,
{
    fn subscribe(&mut self, round: &mut Round<'_>) -> bool {
        round.add_timer(self.deadline);
        false
    }

    fn complete(&mut self, _outcome: EventOutcome) -> R {
        (self.callback.take().expect("event completed twice"))()
    }
}

// === FD syscalls ===

fn is_would_block(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK
    )
}

fn syscall_result(rc: libc::ssize_t) -> io::Result<usize> {
    if rc >= 0 {
        Ok(rc as usize)
    } else {
        Err(io::Error::last_os_error())
    }
}

/// A `read` event on `fd`.
pub struct EventRead<'a, F> {
    fd: RawFd,
    buf: &'a mut [u8],
    sync_result: Option<io::Result<usize>>,
    callback: Option<F>,
}

pub fn event_read<'a, R, F>(fd: RawFd, buf: &'a mut [u8], callback: F) -> EventRead<'a, F>
where
    F: FnOnce(io::Result<usize>) -> R,
{
    EventRead {
        fd,
        buf,
        sync_result: None,
        callback: Some(callback),
    }
}

impl<F> EventRead<'_, F> {
    fn call(&mut self) -> io::Result<usize> {
        // Safety: the exclusive buffer borrow held by this adapter is live.
        syscall_result(unsafe { libc::read(self.fd, self.buf.as_mut_ptr().cast(), self.buf.len()) })
    }
}

impl<R, F> SelectEvent<R> for EventRead<'_, F>
where
    F: FnOnce(io::Result<usize>) -> R,
{
    fn subscribe(&mut self, round: &mut Round<'_>) -> bool {
        match self.call() {
            Err(err) if is_would_block(&err) => {
                round.add_read(self.fd);
                false
            }
            // Success and hard failures both complete the select on the spot.
            result => {
                self.sync_result = Some(result);
                true
            }
        }
    }

    fn complete(&mut self, outcome: EventOutcome) -> R {
        let result = if outcome.completed_sync {
            self.sync_result.take().expect("sync result recorded")
        } else if outcome.panicked() {
            Err(error::fd_panic_error())
        } else {
            // Readiness arrived; run the call for real.
            self.call()
        };
        (self.callback.take().expect("event completed twice"))(result)
    }
}

/// A `write` event on `fd`.
pub struct EventWrite<'a, F> {
    fd: RawFd,
    buf: &'a [u8],
    sync_result: Option<io::Result<usize>>,
    callback: Option<F>,
}

pub fn event_write<'a, R, F>(fd: RawFd, buf: &'a [u8], callback: F) -> EventWrite<'a, F>
where
    F: FnOnce(io::Result<usize>) -> R,
{
    EventWrite {
        fd,
        buf,
        sync_result: None,
        callback: Some(callback),
    }
}

impl<F> EventWrite<'_, F> {
    fn call(&mut self) -> io::Result<usize> {
        // Safety: the buffer borrow held by this adapter is live.
        syscall_result(unsafe { libc::write(self.fd, self.buf.as_ptr().cast(), self.buf.len()) })
    }
}

impl<R, F> SelectEvent<R> for EventWrite<'_, F>
where
    F: FnOnce(io::Result<usize>) -> R,
{
    fn subscribe(&mut self, round: &mut Round<'_>) -> bool {
        match self.call() {
            Err(err) if is_would_block(&err) => {
                round.add_write(self.fd);
                false
            }
            result => {
                self.sync_result = Some(result);
                true
            }
        }
    }

    fn complete(&mut self, outcome: EventOutcome) -> R {
        let result = if outcome.completed_sync {
            self.sync_result.take().expect("sync result recorded")
        } else if outcome.panicked() {
            Err(error::fd_panic_error())
        } else {
            self.call()
        };
        (self.callback.take().expect("event completed twice"))(result)
    }
}

/// A `recv` event on a socket.
pub struct EventRecv<'a, F> {
    fd: RawFd,
    buf: &'a mut [u8],
    flags: libc::c_int,
    sync_result: Option<io::Result<usize>>,
    callback: Option<F>,
}

pub fn event_recv<'a, R, F>(
    fd: RawFd,
    buf: &'a mut [u8],
    flags: libc::c_int,
    callback: F,
) -> EventRecv<'a, F>
where
    F: FnOnce(io::Result<usize>) -> R,
{
    EventRecv {
        fd,
        buf,
        flags,
        sync_result: None,
        callback: Some(callback),
    }
}

impl<F> EventRecv<'_, F> {
    fn call(&mut self) -> io::Result<usize> {
        // Safety: the exclusive buffer borrow held by this adapter is live.
        syscall_result(unsafe {
            libc::recv(
                self.fd,
                self.buf.as_mut_ptr().cast(),
                self.buf.len(),
                self.flags,
            )
        })
    }
}

impl<R, F> SelectEvent<R> for EventRecv<'_, F>
where
    F: FnOnce(io::Result<usize>) -> R,
{
    fn subscribe(&mut self, round: &mut Round<'_>) -> bool {
        match self.call() {
            Err(err) if is_would_block(&err) => {
                round.add_read(self.fd);
                false
            }
            result => {
                self.sync_result = Some(result);
                true
            }
        }
    }

    fn complete(&mut self, outcome: EventOutcome) -> R {
        let result = if outcome.completed_sync {
            self.sync_result.take().expect("sync result recorded")
        } else if outcome.panicked() {
            Err(error::fd_panic_error())
        } else {
            self.call()
        };
        (self.callback.take().expect("event completed twice"))(result)
    }
}

/// A `send` event on a socket.
pub struct EventSend<'a, F> {
    fd: RawFd,
    buf: &'a [u8],
    flags: libc::c_int,
    sync_result: Option<io::Result<usize>>,
    callback: Option<F>,
}

pub fn event_send<'a, R, F>(
    fd: RawFd,
    buf: &'a [u8],
    flags: libc::c_int,
    callback: F,
) -> EventSend<'a, F>
where
    F: FnOnce(io::Result<usize>) -> R,
{
    EventSend {
        fd,
        buf,
        flags,
        sync_result: None,
        callback: Some(callback),
    }
}

impl<F> EventSend<'_, F> {
    fn call(&mut self) -> io::Result<usize> {
        // Safety: the buffer borrow held by this adapter is live.
        syscall_result(unsafe {
            libc::send(self.fd, self.buf.as_ptr().cast(), self.buf.len(), self.flags)
        })
    }
}

impl<R, F> SelectEvent<R> for EventSend<'_, F>
where
    F: FnOnce(io::Result<usize>) -> R,
{
    fn subscribe(&mut self, round: &mut Round<'_>) -> bool {
        match self.call() {
            Err(err) if is_would_block(&err) => {
                round.add_write(self.fd);
                false
            }
            result => {
                self.sync_result = Some(result);
                true
            }
        }
    }

    fn complete(&mut self, outcome: EventOutcome) -> R {
        let result = if outcome.completed_sync {
            self.sync_result.take().expect("sync result recorded")
        } else if outcome.panicked() {
            Err(error::fd_panic_error())
        } else {
            self.call()
        };
        (self.callback.take().expect("event completed twice"))(result)
    }
}

// === accept / connect ===

pub struct EventAccept<F> {
    fd: RawFd,
    sync_result: Option<io::Result<RawFd>>,
    callback: Option<F>,
}

/// An `accept` event on a listening socket; the callback receives the
/// accepted (non-blocking) FD.
pub fn event_accept<R, F>(fd: RawFd, callback: F) -> EventAccept<F>
where
    F: FnOnce(io::Result<RawFd>) -> R,
{
    EventAccept {
        fd,
        sync_result: None,
        callback: Some(callback),
    }
}

impl<F> EventAccept<F> {
    fn call(&self) -> io::Result<RawFd> {
        // Safety: null address output is allowed by accept4.
        let rc = unsafe {
            libc::accept4(
                self.fd,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_NONBLOCK,
            )
        };
        if rc >= 0 {
            Ok(rc)
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl<R, F> SelectEvent<R> for EventAccept<F>
where
    F: FnOnce(io::Result<RawFd>) -> R,
{
    fn subscribe(&mut self, round: &mut Round<'_>) -> bool {
        match self.call() {
            Err(err) if is_would_block(&err) => {
                round.add_read(self.fd);
                false
            }
            result => {
                self.sync_result = Some(result);
                true
            }
        }
    }

    fn complete(&mut self, outcome: EventOutcome) -> R {
        let result = if outcome.completed_sync {
            self.sync_result.take().expect("sync result recorded")
        } else if outcome.panicked() {
            Err(error::fd_panic_error())
        } else {
            self.call()
        };
        (self.callback.take().expect("event completed twice"))(result)
    }
}

pub struct EventConnect<F> {
    fd: RawFd,
    addr: SocketAddr,
    sync_result: Option<io::Result<()>>,
    callback: Option<F>,
}

/// A `connect` event. On `EINPROGRESS` the routine parks on write
/// readiness and the result is finalized from `SO_ERROR`.
pub fn event_connect<R, F>(fd: RawFd, addr: SocketAddr, callback: F) -> EventConnect<F>
where
    F: FnOnce(io::Result<()>) -> R,
{
    EventConnect {
        fd,
        addr,
        sync_result: None,
        callback: Some(callback),
    }
}

impl<R, F> SelectEvent<R> for EventConnect<F>
where
    F: FnOnce(io::Result<()>) -> R,
{
    fn subscribe(&mut self, round: &mut Round<'_>) -> bool {
        match crate::syscall::connect_start(self.fd, &self.addr) {
            Ok(true) => {
                self.sync_result = Some(Ok(()));
                true
            }
            Ok(false) => {
                round.add_write(self.fd);
                false
            }
            Err(err) => {
                self.sync_result = Some(Err(err));
                true
            }
        }
    }

    fn complete(&mut self, outcome: EventOutcome) -> R {
        let result = if outcome.completed_sync {
            self.sync_result.take().expect("sync result recorded")
        } else if outcome.panicked() {
            Err(error::fd_panic_error())
        } else {
            crate::syscall::take_socket_error(self.fd)
        };
        (self.callback.take().expect("event completed twice"))(result)
    }
}

// === mutex / semaphore ===

pub struct EventLock<F> {
    mutex: Mutex,
    callback: Option<F>,
}

/// A mutex acquisition event; the callback receives the guard.
pub fn event_lock<R, F>(mutex: &Mutex, callback: F) -> EventLock<F>
where
    F: FnOnce(Result<MutexGuard, Closed>) -> R,
{
    EventLock {
        mutex: mutex.clone(),
        callback: Some(callback),
    }
}

impl<R, F> SelectEvent<R> for EventLock<F>
where
    F: FnOnce(Result<MutexGuard, Closed>) -> R,
{
    fn subscribe(&mut self, round: &mut Round<'_>) -> bool {
        let sema = self.mutex.semaphore().inner();
        if sema.is_disabled() || sema.acquire_or_debt() {
            return true;
        }
        round.add_sema(sema);
        false
    }

    fn complete(&mut self, _outcome: EventOutcome) -> R {
        let result = if self.mutex.semaphore().inner().is_disabled() {
            Err(Closed(()))
        } else {
            Ok(self.mutex.guard())
        };
        (self.callback.take().expect("event completed twice"))(result)
    }
}

pub struct EventSema<F> {
    sema: Semaphore,
    callback: Option<F>,
}

/// A semaphore acquisition event.
pub fn event_sema<R, F>(sema: &Semaphore, callback: F) -> EventSema<F>
where
    F: FnOnce(WaitStatus) -> R,
{
    EventSema {
        sema: sema.clone(),
        callback: Some(callback),
    }
}

impl<R, F> SelectEvent<R> for EventSema<F>
where
    F: FnOnce(WaitStatus) -> R,
{
    fn subscribe(&mut self, round: &mut Round<'_>) -> bool {
        let inner = self.sema.inner();
        if inner.is_disabled() || inner.acquire_or_debt() {
            return true;
        }
        round.add_sema(inner);
        false
    }

    fn complete(&mut self, _outcome: EventOutcome) -> R {
        let status = if self.sema.inner().is_disabled() {
            WaitStatus::Disabled
        } else {
            WaitStatus::Success
        };
        (self.callback.take().expect("event completed twice"))(status)
    }
}

// === channels ===

pub struct EventChanRecv<T: Send, F> {
    chan: Channel<T>,
    callback: Option<F>,
}

/// A channel receive event; the callback gets `Some(value)` or `None` once
/// the channel is closed and drained.
pub fn event_chan_recv<T, R, F>(chan: &Channel<T>, callback: F) -> EventChanRecv<T, F>
where
    T: Send,
    F: FnOnce(Option<T>) -> R,
{
    EventChanRecv {
        chan: chan.clone(),
        callback: Some(callback),
    }
}

impl<T, R, F> SelectEvent<R> for EventChanRecv<T, F>
where
    T: Send,
    F: FnOnce(Option<T>) -> R,
{
    fn subscribe(&mut self, round: &mut Round<'_>) -> bool {
        let readers = self.chan.readers_inner();
        if readers.is_disabled() {
            return true;
        }
        self.chan.grant_send_slot();
        if readers.acquire_or_debt() {
            return true;
        }
        round.add_sema(readers);
        false
    }

    fn complete(&mut self, _outcome: EventOutcome) -> R {
        let value = if self.chan.readers_inner().is_disabled() {
            self.chan.drain_one()
        } else {
            Some(self.chan.finish_recv())
        };
        (self.callback.take().expect("event completed twice"))(value)
    }
}

pub struct EventChanSend<T: Send, F> {
    chan: Channel<T>,
    value: Option<T>,
    callback: Option<F>,
}

/// A channel send event; the callback gets `true` when the value was
/// delivered, `false` when the channel closed first (the value is dropped,
/// as the channel has no owner left to give it back to).
pub fn event_chan_send<T, R, F>(chan: &Channel<T>, value: T, callback: F) -> EventChanSend<T, F>
where
    T: Send,
    F: FnOnce(bool) -> R,
{
    EventChanSend {
        chan: chan.clone(),
        value: Some(value),
        callback: Some(callback),
    }
}

impl<T, R, F> SelectEvent<R> for EventChanSend<T, F>
where
    T: Send,
    F: FnOnce(bool) -> R,
{
    fn subscribe(&mut self, round: &mut Round<'_>) -> bool {
        let writers = self.chan.writers_inner();
        if writers.is_disabled() || writers.acquire_or_debt() {
            return true;
        }
        round.add_sema(writers);
        false
    }

    fn complete(&mut self, _outcome: EventOutcome) -> R {
        let sent = if self.chan.writers_inner().is_disabled() {
            false
        } else {
            let value = self.value.take().expect("event completed twice");
            self.chan.finish_send(value).is_ok()
        };
        (self.callback.take().expect("event completed twice"))(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, PartialEq, Eq)]
    enum Branch {
        Io(usize),
        TimedOut,
    }

    #[test]
    fn timer_beats_an_empty_pipe() {
        static RESULT: StdMutex<Option<Branch>> = StdMutex::new(None);
        crate::run(1, || {
            let (r, w) = syscall::pipe().unwrap();
            let mut buf = [0_u8; 8];
            let branch = select_any(&mut [
                &mut event_read(r, &mut buf, |res| Branch::Io(res.unwrap())),
                &mut event_timer(Duration::from_millis(5), || Branch::TimedOut),
            ]);
            *RESULT.lock().unwrap() = Some(branch);
            syscall::close(r).unwrap();
            syscall::close(w).unwrap();
        });
        assert_eq!(*RESULT.lock().unwrap(), Some(Branch::TimedOut));
    }

    #[test]
    fn buffered_data_completes_synchronously() {
        static RESULT: StdMutex<Option<Branch>> = StdMutex::new(None);
        crate::run(1, || {
            let (r, w) = syscall::pipe().unwrap();
            assert_eq!(syscall::write(w, b"hi").unwrap(), 2);
            let mut buf = [0_u8; 8];
            let branch = select_any(&mut [
                &mut event_read(r, &mut buf, |res| Branch::Io(res.unwrap())),
                &mut event_timer(Duration::from_secs(5), || Branch::TimedOut),
            ]);
            *RESULT.lock().unwrap() = Some(branch);
            syscall::close(r).unwrap();
            syscall::close(w).unwrap();
        });
        assert_eq!(*RESULT.lock().unwrap(), Some(Branch::Io(2)));
    }

    #[test]
    fn reader_wakes_when_data_arrives_before_the_timer() {
        static RESULT: StdMutex<Option<Branch>> = StdMutex::new(None);
        crate::run(1, || {
            let (r, w) = syscall::pipe().unwrap();
            crate::start(move || {
                let mut buf = [0_u8; 8];
                let branch = select_any(&mut [
                    &mut event_read(r, &mut buf, |res| Branch::Io(res.unwrap())),
                    &mut event_timer(Duration::from_secs(5), || Branch::TimedOut),
                ]);
                *RESULT.lock().unwrap() = Some(branch);
                syscall::close(r).unwrap();
            });
            crate::start(move || {
                crate::sleep(Duration::from_millis(2));
                assert_eq!(syscall::write(w, b"abc").unwrap(), 3);
                syscall::close(w).unwrap();
            });
        });
        assert_eq!(*RESULT.lock().unwrap(), Some(Branch::Io(3)));
    }

    #[test]
    fn channel_recv_races_a_timer() {
        static GOT: AtomicUsize = AtomicUsize::new(0);
        crate::run(1, || {
            let chan = Channel::with_capacity(1);
            let tx = chan.clone();
            crate::start(move || {
                tx.send(41_usize).unwrap();
            });
            crate::start(move || {
                let got = select_any(&mut [
                    &mut event_chan_recv(&chan, |value| value.unwrap_or(0)),
                    &mut event_timer(Duration::from_secs(5), || 0),
                ]);
                GOT.store(got + 1, Ordering::Relaxed);
            });
        });
        assert_eq!(GOT.load(Ordering::Relaxed), 42);
    }

    #[test]
    fn chan_send_event_delivers_once_a_slot_frees() {
        static DELIVERED: AtomicBool = AtomicBool::new(false);
        static RECEIVED: AtomicUsize = AtomicUsize::new(0);
        crate::run(1, || {
            let chan = Channel::with_capacity(1);
            chan.send(1_usize).unwrap();
            let tx = chan.clone();
            crate::start(move || {
                let sent = select_any(&mut [&mut event_chan_send(&tx, 2_usize, |sent| sent)]);
                DELIVERED.store(sent, Ordering::Relaxed);
            });
            crate::start(move || {
                RECEIVED.fetch_add(chan.recv().unwrap(), Ordering::Relaxed);
                RECEIVED.fetch_add(chan.recv().unwrap(), Ordering::Relaxed);
            });
        });
        assert!(DELIVERED.load(Ordering::Relaxed));
        assert_eq!(RECEIVED.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn lock_event_when_the_mutex_frees_up() {
        static ACQUIRED: AtomicBool = AtomicBool::new(false);
        crate::run(1, || {
            let mutex = Mutex::new();
            let guard = mutex.try_lock().expect("uncontended");
            let contender = mutex.clone();
            crate::start(move || {
                let ok = select_any(&mut [&mut event_lock(&contender, |res| res.is_ok())]);
                ACQUIRED.store(ok, Ordering::Relaxed);
            });
            crate::start(move || {
                crate::yield_now();
                drop(guard);
            });
        });
        assert!(ACQUIRED.load(Ordering::Relaxed));
    }

    // The listener and its own dialing socket race inside one select. On a
    // single worker the accept branch must win: it is subscribed first, so
    // once the loopback handshake makes both FDs ready, its readiness is
    // dispatched first.
    #[test]
    fn select_on_accept_and_connect() {
        static WIRED: AtomicBool = AtomicBool::new(false);

        enum Won {
            Accepted(RawFd),
            Connected,
        }

        crate::run(1, || {
            let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
            let listener = crate::net::listen_tcp(addr, 8).unwrap();
            let local = crate::net::local_addr(listener).unwrap();
            let client = syscall::socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();

            let won = select_any(&mut [
                &mut event_accept(listener, |res| Won::Accepted(res.unwrap())),
                &mut event_connect(client, local, |res| {
                    res.unwrap();
                    Won::Connected
                }),
            ]);

            let Won::Accepted(accepted) = won else {
                panic!("the accept branch subscribes first and must win the round");
            };

            // The client's connect subscription lost the round, but its
            // connection is established; prove the pair is wired up.
            assert_eq!(syscall::write(client, b"x").unwrap(), 1);
            let mut buf = [0_u8; 1];
            assert_eq!(syscall::read(accepted, &mut buf).unwrap(), 1);
            WIRED.store(buf == *b"x", Ordering::Relaxed);

            syscall::close(accepted).unwrap();
            syscall::close(client).unwrap();
            syscall::close(listener).unwrap();
        });

        assert!(WIRED.load(Ordering::Relaxed));
    }
}
