// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::io;

/// A channel, semaphore or mutex was disabled while (or before) the
/// operation blocked on it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Closed(pub(crate) ());

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("closed")
    }
}

impl std::error::Error for Closed {}

/// The file descriptor a routine was blocked on was torn down by
/// [`fd_panic`](crate::fd_panic).
///
/// Surfaced through [`io::Error`] with [`io::ErrorKind::Interrupted`]; use
/// [`is_fd_panic`] to distinguish it from an ordinary interruption.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FdPanicked(pub(crate) ());

impl fmt::Display for FdPanicked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("file descriptor torn down by fd_panic")
    }
}

impl std::error::Error for FdPanicked {}

/// Builds the [`io::Error`] returned by syscall wrappers whose FD was hit by
/// an fd panic.
pub(crate) fn fd_panic_error() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, FdPanicked(()))
}

/// Returns `true` if `err` reports an FD torn down by [`fd_panic`](crate::fd_panic).
pub fn is_fd_panic(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<FdPanicked>())
}

/// Error returned by [`Channel::send`](crate::sync::Channel::send) on a
/// closed channel. The rejected value is handed back.
#[derive(Debug, Eq, PartialEq)]
pub struct SendError<T>(pub T);

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("sending on a closed channel")
    }
}

impl<T: fmt::Debug> std::error::Error for SendError<T> {}

/// Error returned by [`Channel::try_recv`](crate::sync::Channel::try_recv).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TryRecvError {
    /// No value is currently buffered.
    Empty,
    /// The channel is closed and drained.
    Closed,
}

impl fmt::Display for TryRecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryRecvError::Empty => f.pad("channel is empty"),
            TryRecvError::Closed => f.pad("channel is closed"),
        }
    }
}

impl std::error::Error for TryRecvError {}

impl From<Closed> for TryRecvError {
    fn from(_: Closed) -> Self {
        TryRecvError::Closed
    }
}

/// Builds the `ETIMEDOUT` error used by every timeout-taking syscall wrapper.
pub(crate) fn timed_out() -> io::Error {
    io::Error::from_raw_os_error(libc::ETIMEDOUT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fd_panic_roundtrip() {
        let err = fd_panic_error();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert!(is_fd_panic(&err));
        assert!(!is_fd_panic(&io::Error::from_raw_os_error(libc::EINTR)));
    }

    #[test]
    fn timeout_is_os_level() {
        assert_eq!(timed_out().raw_os_error(), Some(libc::ETIMEDOUT));
    }
}
