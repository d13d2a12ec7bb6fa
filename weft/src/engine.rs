// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The engine: owner of the worker pool and of the shutdown protocol.
//!
//! [`run`] spawns N workers, injects the initial routine on worker 0 and
//! then drives the engine command loop on the calling thread. Workers report
//! in through the engine queue (spawn requests, idle notifications, thread
//! exits); once every worker is idle with nothing suspended, the engine
//! issues `Finish` and waits for the pool to drain.

use crate::io::{Poller, WAKE_TOKEN};
use crate::routine::RoutineId;
use crate::worker::{Command, WorkerShared, worker_main};
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

pub(crate) enum EngineCommand {
    AddRoutine {
        /// `None` selects a worker round-robin.
        target: Option<usize>,
        func: Box<dyn FnOnce() + Send + 'static>,
    },
    NotifyIdle {
        worker: usize,
        /// Worker-side command count at notification time; stale
        /// notifications are detected by comparing it with the enqueued
        /// count.
        processed: usize,
    },
    NotifyEndOfThread,
    FdPanic(RawFd),
}

pub(crate) struct EngineShared {
    workers: Vec<Arc<WorkerShared>>,
    queue: Mutex<VecDeque<EngineCommand>>,
    waiter: Condvar,
    next_routine_id: AtomicU64,
}

static_assertions::assert_impl_all!(EngineShared: Send, Sync);

// === impl EngineShared ===

impl EngineShared {
    pub(crate) fn push(&self, command: EngineCommand) {
        self.queue
            .lock()
            .expect("engine queue poisoned")
            .push_back(command);
        self.waiter.notify_one();
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.workers.len()
    }

    fn next_routine_id(&self) -> RoutineId {
        self.next_routine_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Starts the runtime with `num_workers` worker threads, runs `init` as the
/// first routine, and returns once every routine has finished and all
/// workers have shut down.
///
/// # Panics
///
/// Panics if `num_workers` is zero or if the OS poller cannot be created.
pub fn run<F>(num_workers: usize, init: F)
where
    F: FnOnce() + Send + 'static,
{
    assert!(num_workers > 0, "need at least one worker");

    let mut pollers = Vec::with_capacity(num_workers);
    let mut shareds = Vec::with_capacity(num_workers);
    for id in 0..num_workers {
        let poller = Poller::new().expect("failed to initialize the OS poller");
        let waker =
            mio::Waker::new(poller.registry(), WAKE_TOKEN).expect("failed to create poller waker");
        shareds.push(Arc::new(WorkerShared::new(id, waker)));
        pollers.push(poller);
    }

    let engine = Arc::new(EngineShared {
        workers: shareds.clone(),
        queue: Mutex::new(VecDeque::new()),
        waiter: Condvar::new(),
        next_routine_id: AtomicU64::new(0),
    });

    let handles: Vec<_> = pollers
        .into_iter()
        .enumerate()
        .map(|(id, poller)| {
            let shared = shareds[id].clone();
            let engine = engine.clone();
            thread::Builder::new()
                .name(format!("weft-worker-{id}"))
                .spawn(move || worker_main(id, shared, engine, poller))
                .expect("failed to spawn worker thread")
        })
        .collect();

    engine.push(EngineCommand::AddRoutine {
        target: Some(0),
        func: Box::new(init),
    });

    control_loop(&engine, num_workers);

    for handle in handles {
        if handle.join().is_err() {
            panic!("worker thread panicked");
        }
    }
}

fn control_loop(engine: &Arc<EngineShared>, num_workers: usize) {
    let mut active = num_workers;
    let mut idle = vec![false; num_workers];
    let mut finish_sent = false;
    let mut next_round_robin = 0_usize;

    let mut queue = engine.queue.lock().expect("engine queue poisoned");
    loop {
        while let Some(command) = queue.pop_front() {
            match command {
                EngineCommand::AddRoutine { target, func } => {
                    let id = engine.next_routine_id();
                    let target = target.unwrap_or_else(|| {
                        let picked = next_round_robin;
                        next_round_robin = (next_round_robin + 1) % num_workers;
                        picked
                    });
                    assert!(target < num_workers, "no such worker: {target}");
                    tracing::trace!(routine = id, target, "dispatching routine");
                    idle[target] = false;
                    engine.workers[target].send(Command::AddRoutine { id, func });
                }
                EngineCommand::NotifyIdle { worker, processed } => {
                    // Only an up-to-date notification counts: anything sent
                    // to the worker since re-busies it.
                    idle[worker] = processed == engine.workers[worker].enqueued();
                    if !finish_sent && queue.is_empty() && idle.iter().all(|&flag| flag) {
                        tracing::debug!("all workers idle, requesting shutdown");
                        finish_sent = true;
                        for shared in &engine.workers {
                            shared.send(Command::Finish);
                        }
                    }
                }
                EngineCommand::NotifyEndOfThread => {
                    active -= 1;
                    tracing::debug!(active, "worker reported end of thread");
                }
                EngineCommand::FdPanic(fd) => {
                    // The FD may have waiters on any worker.
                    for shared in &engine.workers {
                        shared.send(Command::FdPanic(fd));
                    }
                }
            }
        }
        if active == 0 {
            return;
        }
        queue = engine.waiter.wait(queue).expect("engine queue poisoned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn run_returns_after_init_finishes() {
        static RAN: AtomicUsize = AtomicUsize::new(0);
        run(1, || {
            RAN.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(RAN.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn spawned_routines_all_run() {
        static COUNT: AtomicUsize = AtomicUsize::new(0);
        run(3, || {
            for _ in 0..10 {
                crate::start(|| {
                    COUNT.fetch_add(1, Ordering::Relaxed);
                });
            }
        });
        assert_eq!(COUNT.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn start_on_pins_to_the_requested_worker() {
        static MATCHED: AtomicUsize = AtomicUsize::new(0);
        run(2, || {
            for target in 0..2 {
                crate::start_on(target, move || {
                    if crate::worker_id() == target {
                        MATCHED.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });
        assert_eq!(MATCHED.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn a_panicking_routine_only_kills_itself() {
        static AFTER: AtomicUsize = AtomicUsize::new(0);
        run(1, || {
            crate::start(|| panic!("inner routine panic"));
            crate::start(|| {
                AFTER.fetch_add(1, Ordering::Relaxed);
            });
        });
        assert_eq!(AFTER.load(Ordering::Relaxed), 1);
    }
}
