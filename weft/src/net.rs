// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Socket setup helpers.

use crate::syscall::{self, cvt};
use std::io;
use std::mem::size_of;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;

/// Creates a non-blocking TCP listening socket bound to `addr` with
/// `SO_REUSEADDR` set. Bind to port 0 to let the kernel pick one (read it
/// back with [`local_addr`]).
pub fn listen_tcp(addr: SocketAddr, backlog: libc::c_int) -> io::Result<RawFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = syscall::socket(domain, libc::SOCK_STREAM, 0)?;

    let reuse: libc::c_int = 1;
    // Safety: valid out-of-band option pointer of the advertised length.
    cvt(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&raw const reuse).cast(),
            libc::socklen_t::try_from(size_of::<libc::c_int>()).expect("int length fits"),
        )
    })
    .and_then(|_| {
        let (storage, len) = syscall::sockaddr_from(&addr);
        // Safety: storage/len describe a valid sockaddr.
        cvt(unsafe { libc::bind(fd, (&raw const storage).cast::<libc::sockaddr>(), len) })
    })
    .and_then(|_| {
        // Safety: fd is a socket we just created.
        cvt(unsafe { libc::listen(fd, backlog) })
    })
    .inspect_err(|_| {
        let _ = syscall::close(fd);
    })?;

    Ok(fd)
}

/// The address a socket is bound to (`getsockname`).
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    // Safety: sockaddr_storage is plain old data; zeroed is a valid value.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = libc::socklen_t::try_from(size_of::<libc::sockaddr_storage>())
        .expect("sockaddr length fits");
    // Safety: storage/len are valid out-pointers of the advertised size.
    cvt(unsafe { libc::getsockname(fd, (&raw mut storage).cast::<libc::sockaddr>(), &raw mut len) })?;

    match libc::c_int::from(storage.ss_family) {
        libc::AF_INET => {
            // Safety: the kernel filled an AF_INET address.
            let sin = unsafe { (&raw const storage).cast::<libc::sockaddr_in>().read() };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            // Safety: the kernel filled an AF_INET6 address.
            let sin6 = unsafe { (&raw const storage).cast::<libc::sockaddr_in6>().read() };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected address family {family}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn echo_over_a_listening_socket() {
        static ECHOED: AtomicBool = AtomicBool::new(false);

        crate::run(2, || {
            let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
            let listener = listen_tcp(addr, 16).unwrap();
            let local = local_addr(listener).unwrap();
            assert_ne!(local.port(), 0);

            crate::start(move || {
                let conn = syscall::accept(listener).unwrap();
                let mut buf = [0_u8; 32];
                let n = syscall::read(conn, &mut buf).unwrap();
                syscall::write(conn, &buf[..n]).unwrap();
                syscall::close(conn).unwrap();
                syscall::close(listener).unwrap();
            });

            crate::start(move || {
                let client = syscall::socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
                syscall::connect(client, &local).unwrap();
                syscall::write(client, b"echo me").unwrap();
                let mut buf = [0_u8; 32];
                let n = syscall::read(client, &mut buf).unwrap();
                ECHOED.store(&buf[..n] == b"echo me", Ordering::Relaxed);
                syscall::close(client).unwrap();
            });
        });

        assert!(ECHOED.load(Ordering::Relaxed));
    }
}
