// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-worker I/O readiness poller.
//!
//! Thin wrapper over [`mio::Poll`]: every FD is registered once for
//! edge-triggered read *and* write interest, and each direction carries at
//! most one waiting routine (a suspended-slot index). The poller is woken
//! from other threads through a [`mio::Waker`] registered under a reserved
//! token.

use crate::routine::EventStatus;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Token reserved for the cross-thread waker; FDs use their own value as token.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// Direction of an I/O wait.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Direction {
    Read,
    Write,
}

/// Per-FD waiter state. At most one suspended routine per direction; a
/// second subscription overwrites the slot record in place.
#[derive(Debug, Default)]
pub(crate) struct FdWaiters {
    pub(crate) read_slot: Option<usize>,
    pub(crate) write_slot: Option<usize>,
    /// `false` when registration failed with `EPERM` (regular files); such
    /// FDs never block and run their syscalls synchronously.
    pub(crate) pollable: bool,
}

/// One readiness report delivered to the worker.
#[derive(Debug)]
pub(crate) struct IoEvent {
    pub(crate) fd: RawFd,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub(crate) status: EventStatus,
}

pub(crate) struct Poller {
    poll: Poll,
    events: Events,
    fds: HashMap<RawFd, FdWaiters>,
}

// === impl Poller ===

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            fds: HashMap::new(),
        })
    }

    pub(crate) fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// Looks up the waiter record for `fd`, installing the FD into the OS
    /// poller on first contact.
    pub(crate) fn ensure_registered(&mut self, fd: RawFd) -> &mut FdWaiters {
        if !self.fds.contains_key(&fd) {
            let interest = Interest::READABLE | Interest::WRITABLE;
            let pollable = match self
                .poll
                .registry()
                .register(&mut SourceFd(&fd), Token(fd as usize), interest)
            {
                Ok(()) => true,
                Err(err) if err.raw_os_error() == Some(libc::EPERM) => {
                    // Regular files cannot be epoll'ed; they never block either.
                    tracing::debug!(fd, "fd is not pollable, treating it as always ready");
                    false
                }
                Err(err) => panic!("failed to register fd {fd} with the poller: {err}"),
            };
            self.fds.insert(
                fd,
                FdWaiters {
                    read_slot: None,
                    write_slot: None,
                    pollable,
                },
            );
        }
        self.fds.get_mut(&fd).expect("fd entry just inserted")
    }

    pub(crate) fn waiters(&mut self, fd: RawFd) -> Option<&mut FdWaiters> {
        self.fds.get_mut(&fd)
    }

    /// Removes the FD from the poller, handing back any waiter slots so the
    /// caller can wake them with a closed status.
    pub(crate) fn deregister(&mut self, fd: RawFd) -> Option<FdWaiters> {
        let waiters = self.fds.remove(&fd)?;
        if waiters.pollable {
            if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                tracing::warn!(fd, %err, "failed to deregister fd");
            }
        }
        Some(waiters)
    }

    /// Waits for readiness, the waker, or the timeout.
    ///
    /// Returns the readiness reports and whether the waker fired.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> (Vec<IoEvent>, bool) {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => panic!("fatal poller failure: {err}"),
            }
        }

        let mut woken = false;
        let mut out = Vec::new();
        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                woken = true;
                continue;
            }
            let fd = event.token().0 as RawFd;
            let interrupted = event.is_error() || event.is_read_closed() || event.is_write_closed();
            out.push(IoEvent {
                fd,
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable() || event.is_write_closed(),
                status: if interrupted { -libc::EINTR } else { 0 },
            });
        }
        (out, woken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        // Safety: fds is a valid two-element array.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        // Safety: closing a descriptor owned by the test.
        unsafe { libc::close(fd) };
    }

    #[test]
    fn waker_interrupts_a_blocked_poll() {
        let mut poller = Poller::new().unwrap();
        let waker = mio::Waker::new(poller.registry(), WAKE_TOKEN).unwrap();
        waker.wake().unwrap();
        let (events, woken) = poller.poll(Some(Duration::from_secs(5)));
        assert!(woken);
        assert!(events.is_empty());
    }

    #[test]
    fn pipe_write_end_reports_readiness() {
        let mut poller = Poller::new().unwrap();
        let (r, w) = pipe();
        poller.ensure_registered(r);

        // Nothing buffered: only the timeout can end this poll.
        let (events, woken) = poller.poll(Some(Duration::from_millis(10)));
        assert!(events.is_empty());
        assert!(!woken);

        // Safety: writing a byte into the test-owned pipe.
        let rc = unsafe { libc::write(w, [1u8].as_ptr().cast(), 1) };
        assert_eq!(rc, 1);

        let (events, _) = poller.poll(Some(Duration::from_secs(5)));
        assert!(events.iter().any(|ev| ev.fd == r && ev.readable));

        close(r);
        close(w);
    }

    #[test]
    fn regular_files_are_unpollable() {
        let mut poller = Poller::new().unwrap();
        let file = std::env::temp_dir().join("weft-poller-test");
        std::fs::write(&file, b"x").unwrap();
        let cpath = std::ffi::CString::new(file.to_str().unwrap()).unwrap();
        // Safety: valid NUL-terminated path pointer.
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY) };
        assert!(fd >= 0);
        assert!(!poller.ensure_registered(fd).pollable);
        close(fd);
        let _ = std::fs::remove_file(file);
    }
}
