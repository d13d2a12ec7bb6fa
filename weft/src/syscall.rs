// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Non-blocking syscall wrappers.
//!
//! Every wrapper mirrors its POSIX counterpart but suspends the calling
//! routine instead of blocking the thread: the syscall is attempted first
//! and, on `EAGAIN`/`EWOULDBLOCK`, the routine parks on the FD's readiness
//! through its worker's poller and retries once woken. FDs created through
//! this module are put in non-blocking mode.
//!
//! The `*_timeout` forms bundle a timer with the readiness wait; the timer
//! winning surfaces as an `ETIMEDOUT` error. An FD torn down by
//! [`fd_panic`](crate::fd_panic) surfaces as an [`FdPanicked`] error,
//! detectable with [`is_fd_panic`].
//!
//! [`FdPanicked`]: crate::FdPanicked
//! [`is_fd_panic`]: crate::is_fd_panic

use crate::error;
use crate::routine::{self, EventType, PANIC_STATUS};
use crate::worker::{self, Direction, Worker};
use std::ffi::CString;
use std::io;
use std::mem::size_of;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::{Duration, Instant};

/// Why a readiness wait ended.
pub(crate) enum Readiness {
    Ready,
    Timeout,
    Panic,
}

/// Suspends the current routine until `fd` is ready in `direction`, the
/// timeout elapses, or the FD panics.
///
/// Unpollable FDs (regular files) report ready immediately; their syscalls
/// never block anyway.
pub(crate) fn wait_readiness(
    fd: RawFd,
    direction: Direction,
    timeout: Option<Duration>,
) -> Readiness {
    if !Worker::with(|worker| worker.fd_pollable(fd)) {
        return Readiness::Ready;
    }

    let rt = worker::current_routine();
    // Safety: `rt` is the current routine; no borrow is held across the
    // suspension inside `commit_and_suspend`.
    unsafe {
        (*rt).start_round();
        match direction {
            Direction::Read => (*rt).add_read(fd),
            Direction::Write => (*rt).add_write(fd),
        }
        if let Some(timeout) = timeout {
            (*rt).add_timer(Instant::now() + timeout);
        }
        routine::commit_and_suspend(rt);
        match (*rt).winner_type() {
            EventType::Timer => Readiness::Timeout,
            _ if (*rt).winner_status() == PANIC_STATUS => Readiness::Panic,
            _ => Readiness::Ready,
        }
    }
}

/// Runs `op` until it stops reporting would-block, parking the routine on
/// `fd` readiness in between.
fn retry_would_block(
    fd: RawFd,
    direction: Direction,
    timeout: Option<Duration>,
    mut op: impl FnMut() -> libc::ssize_t,
) -> io::Result<libc::ssize_t> {
    loop {
        let rc = op();
        if rc >= 0 {
            return Ok(rc);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                match wait_readiness(fd, direction, timeout) {
                    Readiness::Ready => {}
                    Readiness::Timeout => return Err(error::timed_out()),
                    Readiness::Panic => return Err(error::fd_panic_error()),
                }
            }
            _ => return Err(err),
        }
    }
}

pub(crate) fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

fn cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
}

/// Converts a [`SocketAddr`] into the storage/len pair the C API expects.
pub(crate) fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // Safety: sockaddr_storage is plain old data; zeroed is a valid value.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::sa_family_t::try_from(libc::AF_INET).expect("AF_INET fits"),
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // Safety: sockaddr_in fits inside sockaddr_storage.
            unsafe {
                (&raw mut storage).cast::<libc::sockaddr_in>().write(sin);
            }
            size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::sa_family_t::try_from(libc::AF_INET6).expect("AF_INET6 fits"),
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            // Safety: sockaddr_in6 fits inside sockaddr_storage.
            unsafe {
                (&raw mut storage).cast::<libc::sockaddr_in6>().write(sin6);
            }
            size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, libc::socklen_t::try_from(len).expect("sockaddr length fits"))
}

/// Opens `path`, returning a non-blocking FD.
pub fn open(path: impl AsRef<Path>, flags: libc::c_int) -> io::Result<RawFd> {
    let path = cstring(path.as_ref())?;
    // Safety: valid NUL-terminated path pointer.
    cvt(unsafe { libc::open(path.as_ptr(), flags | libc::O_NONBLOCK) })
}

/// Creates (or truncates) `path` for writing.
pub fn creat(path: impl AsRef<Path>, mode: libc::mode_t) -> io::Result<RawFd> {
    let path = cstring(path.as_ref())?;
    let flags = libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC | libc::O_NONBLOCK;
    // Safety: valid NUL-terminated path pointer.
    cvt(unsafe { libc::open(path.as_ptr(), flags, libc::c_uint::from(mode)) })
}

/// A non-blocking pipe: `(read_end, write_end)`.
pub fn pipe() -> io::Result<(RawFd, RawFd)> {
    pipe2(0)
}

/// Like [`pipe`], with extra `O_*` flags.
pub fn pipe2(flags: libc::c_int) -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    // Safety: fds is a valid two-element array.
    cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), flags | libc::O_NONBLOCK) })?;
    Ok((fds[0], fds[1]))
}

/// A non-blocking socket.
pub fn socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> io::Result<RawFd> {
    // Safety: plain integer arguments.
    cvt(unsafe { libc::socket(domain, ty | libc::SOCK_NONBLOCK, protocol) })
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    read_impl(fd, buf, None)
}

pub fn read_timeout(fd: RawFd, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
    read_impl(fd, buf, Some(timeout))
}

fn read_impl(fd: RawFd, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize> {
    retry_would_block(fd, Direction::Read, timeout, || {
        // Safety: buf is a live, exclusively borrowed buffer.
        unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) }
    })
    .map(|n| n as usize)
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    write_impl(fd, buf, None)
}

pub fn write_timeout(fd: RawFd, buf: &[u8], timeout: Duration) -> io::Result<usize> {
    write_impl(fd, buf, Some(timeout))
}

fn write_impl(fd: RawFd, buf: &[u8], timeout: Option<Duration>) -> io::Result<usize> {
    retry_would_block(fd, Direction::Write, timeout, || {
        // Safety: buf is a live borrowed buffer.
        unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) }
    })
    .map(|n| n as usize)
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> io::Result<usize> {
    recv_impl(fd, buf, flags, None)
}

pub fn recv_timeout(
    fd: RawFd,
    buf: &mut [u8],
    flags: libc::c_int,
    timeout: Duration,
) -> io::Result<usize> {
    recv_impl(fd, buf, flags, Some(timeout))
}

fn recv_impl(
    fd: RawFd,
    buf: &mut [u8],
    flags: libc::c_int,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    retry_would_block(fd, Direction::Read, timeout, || {
        // Safety: buf is a live, exclusively borrowed buffer.
        unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), flags) }
    })
    .map(|n| n as usize)
}

pub fn send(fd: RawFd, buf: &[u8], flags: libc::c_int) -> io::Result<usize> {
    send_impl(fd, buf, flags, None)
}

pub fn send_timeout(
    fd: RawFd,
    buf: &[u8],
    flags: libc::c_int,
    timeout: Duration,
) -> io::Result<usize> {
    send_impl(fd, buf, flags, Some(timeout))
}

fn send_impl(
    fd: RawFd,
    buf: &[u8],
    flags: libc::c_int,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    retry_would_block(fd, Direction::Write, timeout, || {
        // Safety: buf is a live borrowed buffer.
        unsafe { libc::send(fd, buf.as_ptr().cast(), buf.len(), flags) }
    })
    .map(|n| n as usize)
}

/// Accepts one connection; the accepted socket comes back non-blocking.
pub fn accept(fd: RawFd) -> io::Result<RawFd> {
    accept_impl(fd, None)
}

pub fn accept_timeout(fd: RawFd, timeout: Duration) -> io::Result<RawFd> {
    accept_impl(fd, Some(timeout))
}

fn accept_impl(fd: RawFd, timeout: Option<Duration>) -> io::Result<RawFd> {
    retry_would_block(fd, Direction::Read, timeout, || {
        // Safety: null address output is allowed by accept4.
        libc::ssize_t::try_from(unsafe {
            libc::accept4(fd, std::ptr::null_mut(), std::ptr::null_mut(), libc::SOCK_NONBLOCK)
        })
        .unwrap_or(-1)
    })
    .map(|fd| fd as RawFd)
}

/// Connects `fd` to `addr`, suspending through the in-progress window and
/// finalizing with `SO_ERROR` as the kernel requires for non-blocking
/// connects.
pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    connect_impl(fd, addr, None)
}

pub fn connect_timeout(fd: RawFd, addr: &SocketAddr, timeout: Duration) -> io::Result<()> {
    connect_impl(fd, addr, Some(timeout))
}

fn connect_impl(fd: RawFd, addr: &SocketAddr, timeout: Option<Duration>) -> io::Result<()> {
    if connect_start(fd, addr)? {
        return Ok(());
    }
    match wait_readiness(fd, Direction::Write, timeout) {
        Readiness::Ready => take_socket_error(fd),
        Readiness::Timeout => Err(error::timed_out()),
        Readiness::Panic => Err(error::fd_panic_error()),
    }
}

/// Issues the non-blocking connect. `Ok(true)` means connected on the spot,
/// `Ok(false)` means in progress (park on write readiness and finalize with
/// [`take_socket_error`]).
pub(crate) fn connect_start(fd: RawFd, addr: &SocketAddr) -> io::Result<bool> {
    let (storage, len) = sockaddr_from(addr);
    // Safety: storage/len describe a valid sockaddr.
    let rc = unsafe { libc::connect(fd, (&raw const storage).cast::<libc::sockaddr>(), len) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// Reads and clears `SO_ERROR` after a non-blocking connect completes.
pub(crate) fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = libc::socklen_t::try_from(size_of::<libc::c_int>()).expect("int length fits");
    // Safety: err/len are valid out-pointers of the advertised size.
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&raw mut err).cast(),
            &raw mut len,
        )
    })?;
    if err == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(err))
    }
}

/// Closes `fd`, dropping it from the worker's poller first; any routine
/// still suspended on it wakes with a bad-descriptor status.
pub fn close(fd: RawFd) -> io::Result<()> {
    if worker::is_routine_context() {
        Worker::with(|worker| worker.unregister_fd(fd));
    }
    // Safety: plain close of a caller-owned descriptor.
    cvt(unsafe { libc::close(fd) })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_fd_panic;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn pipe_roundtrip_between_routines() {
        static GOT: StdMutex<Vec<u8>> = StdMutex::new(Vec::new());
        GOT.lock().unwrap().clear();

        crate::run(2, || {
            let (r, w) = pipe().unwrap();
            crate::start(move || {
                let mut buf = [0_u8; 16];
                let n = read(r, &mut buf).unwrap();
                GOT.lock().unwrap().extend_from_slice(&buf[..n]);
                close(r).unwrap();
            });
            crate::start(move || {
                crate::sleep(Duration::from_millis(2));
                assert_eq!(write(w, b"ping").unwrap(), 4);
                close(w).unwrap();
            });
        });

        assert_eq!(&*GOT.lock().unwrap(), b"ping");
    }

    #[test]
    fn read_timeout_on_an_empty_pipe() {
        static TIMED_OUT: AtomicBool = AtomicBool::new(false);
        crate::run(1, || {
            let (r, w) = pipe().unwrap();
            let mut buf = [0_u8; 8];
            let err = read_timeout(r, &mut buf, Duration::from_millis(5)).unwrap_err();
            TIMED_OUT.store(err.raw_os_error() == Some(libc::ETIMEDOUT), Ordering::Relaxed);
            close(r).unwrap();
            close(w).unwrap();
        });
        assert!(TIMED_OUT.load(Ordering::Relaxed));
    }

    #[test]
    fn fd_panic_unblocks_a_reader() {
        static PANICKED: AtomicBool = AtomicBool::new(false);
        crate::run(1, || {
            let (r, w) = pipe().unwrap();
            crate::start(move || {
                let mut buf = [0_u8; 1];
                let err = read(r, &mut buf).unwrap_err();
                PANICKED.store(is_fd_panic(&err), Ordering::Relaxed);
                close(r).unwrap();
                close(w).unwrap();
            });
            crate::start(move || {
                crate::yield_now();
                crate::fd_panic(r);
            });
        });
        assert!(PANICKED.load(Ordering::Relaxed));
    }

    #[test]
    fn write_fills_then_drains_a_pipe() {
        static TOTAL: StdMutex<usize> = StdMutex::new(0);
        *TOTAL.lock().unwrap() = 0;

        crate::run(2, || {
            let (r, w) = pipe().unwrap();
            // A pipe holds 64KiB by default; push enough to hit EAGAIN.
            crate::start(move || {
                let chunk = [0x5a_u8; 32 * 1024];
                let mut sent = 0;
                while sent < 256 * 1024 {
                    sent += write(w, &chunk).unwrap();
                }
                close(w).unwrap();
            });
            crate::start(move || {
                let mut buf = [0_u8; 32 * 1024];
                loop {
                    match read(r, &mut buf) {
                        Ok(0) => break,
                        Ok(n) => *TOTAL.lock().unwrap() += n,
                        Err(err) => panic!("read failed: {err}"),
                    }
                }
                close(r).unwrap();
            });
        });

        assert_eq!(*TOTAL.lock().unwrap(), 256 * 1024);
    }
}
