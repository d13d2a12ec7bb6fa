// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `weft` is a user-space M:N coroutine runtime: many lightweight
//! cooperative *routines* are multiplexed over a fixed pool of worker
//! threads, with non-blocking I/O integrated through a per-worker event
//! loop, bounded CSP [channels](sync::Channel), counting
//! [semaphores](sync::Semaphore), and a [`select_any`](select::select_any)
//! combinator that suspends a routine on a heterogeneous set of events
//! until exactly one fires.
//!
//! Routines are stackful (built on [corosensei]) and switch only at
//! explicit suspension points: [`yield_now`], [`sleep`], the wrappers in
//! [`syscall`], channel and semaphore operations, and `select_any`. There
//! is no preemption and no work stealing; a routine is pinned to the worker
//! that received it.
//!
//! ```no_run
//! weft::run(2, || {
//!     let chan = weft::sync::Channel::with_capacity(4);
//!     let tx = chan.clone();
//!     weft::start(move || {
//!         tx.send("hello").unwrap();
//!     });
//!     weft::start(move || {
//!         println!("{}", chan.recv().unwrap());
//!     });
//! });
//! ```
//!
//! [corosensei]: https://github.com/Amanieu/corosensei

cfg_if::cfg_if! {
    if #[cfg(not(unix))] {
        compile_error!("weft drives FDs through epoll-style readiness and only supports Unix");
    }
}

mod engine;
mod error;
mod io;
mod routine;
mod worker;

pub mod net;
pub mod select;
pub mod sync;
pub mod syscall;

pub use engine::run;
pub use error::{Closed, FdPanicked, SendError, TryRecvError, is_fd_panic};

use crate::engine::EngineCommand;
use crate::routine::Status;
use crate::worker::Worker;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Schedules `f` as a new routine on some worker (round-robin).
///
/// # Panics
///
/// Panics when called from outside a routine.
pub fn start<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    let _ = worker::current_routine();
    Worker::with(|worker| {
        worker.engine().push(EngineCommand::AddRoutine {
            target: None,
            func: Box::new(f),
        });
    });
}

/// Schedules `f` as a new routine pinned to `worker_id`.
///
/// # Panics
///
/// Panics when called from outside a routine, or when `worker_id` does not
/// name a worker.
pub fn start_on<F>(worker_id: usize, f: F)
where
    F: FnOnce() + Send + 'static,
{
    let _ = worker::current_routine();
    Worker::with(|worker| {
        assert!(
            worker_id < worker.engine().num_workers(),
            "no such worker: {worker_id}"
        );
        worker.engine().push(EngineCommand::AddRoutine {
            target: Some(worker_id),
            func: Box::new(f),
        });
    });
}

/// Gives control back to the scheduler; the routine is re-enqueued at the
/// tail of its worker's run queue.
pub fn yield_now() {
    let rt = worker::current_routine();
    // Safety: `rt` is the current routine; no borrow is held across the
    // suspension.
    unsafe {
        (*rt).previous_status = (*rt).status;
        (*rt).status = Status::Yielding;
        routine::suspend(rt);
        (*rt).previous_status = Status::Yielding;
        (*rt).status = Status::Running;
    }
}

/// Suspends the current routine for `duration`. `sleep(Duration::ZERO)` is
/// equivalent to [`yield_now`].
pub fn sleep(duration: Duration) {
    let rt = worker::current_routine();
    // Safety: as in `yield_now`.
    unsafe {
        (*rt).start_round();
        (*rt).add_timer(Instant::now() + duration);
        routine::commit_and_suspend(rt);
    }
}

/// The id of the worker running the current routine.
///
/// # Panics
///
/// Panics when called from outside a routine.
pub fn worker_id() -> usize {
    let _ = worker::current_routine();
    Worker::with(|worker| worker.id())
}

/// Wakes every routine blocked on `fd`, on any worker, with the
/// distinguished panic status ([`is_fd_panic`] on the resulting error).
/// This is the teardown primitive for unblocking I/O-bound routines.
pub fn fd_panic(fd: RawFd) {
    Worker::with(|worker| {
        worker.engine().push(EngineCommand::FdPanic(fd));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn trace_init() {
        use tracing_subscriber::EnvFilter;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    #[test]
    fn yields_interleave_two_routines() {
        static ORDER: StdMutex<Vec<(u8, u32)>> = StdMutex::new(Vec::new());
        ORDER.lock().unwrap().clear();
        trace_init();

        run(1, || {
            start(|| {
                for i in 0..3 {
                    ORDER.lock().unwrap().push((b'a', i));
                    yield_now();
                }
            });
            start(|| {
                for i in 0..3 {
                    ORDER.lock().unwrap().push((b'b', i));
                    yield_now();
                }
            });
        });

        let order = ORDER.lock().unwrap();
        assert_eq!(
            &*order,
            &[
                (b'a', 0),
                (b'b', 0),
                (b'a', 1),
                (b'b', 1),
                (b'a', 2),
                (b'b', 2),
            ]
        );
    }

    #[test]
    fn sleep_zero_behaves_like_yield() {
        static ORDER: StdMutex<Vec<u8>> = StdMutex::new(Vec::new());
        ORDER.lock().unwrap().clear();

        run(1, || {
            start(|| {
                ORDER.lock().unwrap().push(b'a');
                sleep(Duration::ZERO);
                ORDER.lock().unwrap().push(b'c');
            });
            start(|| {
                ORDER.lock().unwrap().push(b'b');
            });
        });

        assert_eq!(&*ORDER.lock().unwrap(), b"abc");
    }

    #[test]
    fn sleep_suspends_for_roughly_the_requested_time() {
        static ELAPSED: StdMutex<Option<Duration>> = StdMutex::new(None);
        run(1, || {
            let before = Instant::now();
            sleep(Duration::from_millis(20));
            *ELAPSED.lock().unwrap() = Some(before.elapsed());
        });
        let elapsed = ELAPSED.lock().unwrap().expect("routine ran");
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn sleeping_routines_wake_in_deadline_order() {
        static ORDER: StdMutex<Vec<u8>> = StdMutex::new(Vec::new());
        ORDER.lock().unwrap().clear();

        run(1, || {
            start(|| {
                sleep(Duration::from_millis(30));
                ORDER.lock().unwrap().push(b'c');
            });
            start(|| {
                sleep(Duration::from_millis(10));
                ORDER.lock().unwrap().push(b'a');
            });
            start(|| {
                sleep(Duration::from_millis(20));
                ORDER.lock().unwrap().push(b'b');
            });
        });

        assert_eq!(&*ORDER.lock().unwrap(), b"abc");
    }
}
