// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bounded CSP channel.
//!
//! A channel is a pair of semaphores gating a bounded MPMC value ring:
//! `writers` starts at the capacity and is waited on before a push,
//! `readers` starts at zero and is posted after one. Capacity zero is a
//! rendezvous channel: `writers` starts at zero too, and each receiver
//! grants exactly one send slot on entry, so sends and receives pair
//! strictly (the size-1 ring is the handoff scratch slot).

use super::semaphore::{Semaphore, SemaphoreInner, WaitStatus};
use crate::error::{Closed, SendError, TryRecvError};
use crossbeam_queue::ArrayQueue;
use std::sync::Arc;

struct ChannelInner<T> {
    ring: ArrayQueue<T>,
    readers: Semaphore,
    writers: Semaphore,
    capacity: usize,
}

/// A bounded FIFO channel of moved values. Cloning yields another handle to
/// the same channel; handles are safe to pass between workers.
pub struct Channel<T> {
    inner: Arc<ChannelInner<T>>,
}

static_assertions::assert_impl_all!(Channel<u64>: Send, Sync);

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

// === impl Channel ===

impl<T: Send> Channel<T> {
    /// A channel buffering up to `capacity` values; `0` builds a rendezvous
    /// channel.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                ring: ArrayQueue::new(capacity.max(1)),
                readers: Semaphore::new(0),
                writers: Semaphore::new(capacity),
                capacity,
            }),
        }
    }

    /// A capacity-0 channel: every send pairs with exactly one receive.
    pub fn rendezvous() -> Self {
        Self::with_capacity(0)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.inner.readers.inner().is_disabled()
    }

    /// Sends a value, suspending the calling routine while the buffer is
    /// full (or, on a rendezvous channel, until a receiver arrives). Returns
    /// the value if the channel is closed.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        match self.inner.writers.wait() {
            WaitStatus::Success => self.finish_send(value),
            _ => Err(SendError(value)),
        }
    }

    /// Receives the oldest value, suspending the calling routine while the
    /// channel is empty. A closed channel keeps delivering buffered values
    /// before reporting [`Closed`].
    pub fn recv(&self) -> Result<T, Closed> {
        if self.inner.capacity == 0 {
            // Grant one send slot; the paired sender will push into the
            // scratch slot and post `readers`.
            self.inner.writers.post();
        }
        match self.inner.readers.wait() {
            WaitStatus::Success => Ok(self.finish_recv()),
            _ => self.inner.ring.pop().ok_or(Closed(())),
        }
    }

    /// Receives without suspending.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        if self.inner.readers.try_acquire() {
            Ok(self.finish_recv())
        } else if self.is_closed() {
            self.inner.ring.pop().ok_or(TryRecvError::Closed)
        } else {
            Err(TryRecvError::Empty)
        }
    }

    /// Closes the channel: every blocked or future `send` fails and every
    /// `recv` fails once the buffer is drained.
    pub fn close(&self) {
        self.inner.writers.disable();
        self.inner.readers.disable();
    }

    /// Pushes a value already covered by a writer ticket and signals the
    /// readers.
    ///
    /// A ticket normally guarantees a ring slot; only the rendezvous
    /// over-grant window (several receivers granting concurrently against
    /// the size-1 scratch slot) can reject the push transiently, in which
    /// case the send retries cooperatively until a slot frees or the channel
    /// closes.
    pub(crate) fn finish_send(&self, value: T) -> Result<(), SendError<T>> {
        let mut value = value;
        loop {
            match self.inner.ring.push(value) {
                Ok(()) => {
                    self.inner.readers.post();
                    return Ok(());
                }
                Err(rejected) => {
                    value = rejected;
                    if self.is_closed() {
                        return Err(SendError(value));
                    }
                    crate::yield_now();
                }
            }
        }
    }

    /// Pops the value paired with an already-acquired reader ticket.
    ///
    /// The push behind our ticket happens before the post that granted it,
    /// but a peer on another worker may still be between the two; spin the
    /// tiny window out.
    pub(crate) fn finish_recv(&self) -> T {
        let value = loop {
            if let Some(value) = self.inner.ring.pop() {
                break value;
            }
            core::hint::spin_loop();
        };
        if self.inner.capacity > 0 {
            self.inner.writers.post();
        }
        value
    }

    /// Takes a buffered value without a ticket; used on closed channels.
    pub(crate) fn drain_one(&self) -> Option<T> {
        self.inner.ring.pop()
    }

    /// Rendezvous receivers grant their sender slot on entry.
    pub(crate) fn grant_send_slot(&self) {
        if self.inner.capacity == 0 {
            self.inner.writers.post();
        }
    }

    pub(crate) fn readers_inner(&self) -> &Arc<SemaphoreInner> {
        self.inner.readers.inner()
    }

    pub(crate) fn writers_inner(&self) -> &Arc<SemaphoreInner> {
        self.inner.writers.inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn buffered_sends_complete_without_a_reader() {
        crate::run(1, || {
            let chan = Channel::with_capacity(3);
            for i in 0..3 {
                chan.send(i).unwrap();
            }
            assert_eq!(chan.try_recv(), Ok(0));
            assert_eq!(chan.try_recv(), Ok(1));
            assert_eq!(chan.try_recv(), Ok(2));
            assert_eq!(chan.try_recv(), Err(TryRecvError::Empty));
        });
    }

    #[test]
    fn single_producer_single_consumer_fifo() {
        static RECEIVED: StdMutex<Vec<u32>> = StdMutex::new(Vec::new());
        RECEIVED.lock().unwrap().clear();

        crate::run(2, || {
            let chan = Channel::with_capacity(4);
            let tx = chan.clone();
            crate::start(move || {
                for i in 0..100 {
                    tx.send(i).unwrap();
                }
                tx.close();
            });
            crate::start(move || {
                while let Ok(value) = chan.recv() {
                    RECEIVED.lock().unwrap().push(value);
                }
            });
        });

        let received = RECEIVED.lock().unwrap();
        assert_eq!(&*received, &(0..100).collect::<Vec<_>>());
    }

    #[test]
    fn rendezvous_pairs_sends_with_receives() {
        static SUM: AtomicUsize = AtomicUsize::new(0);
        crate::run(2, || {
            let chan = Channel::rendezvous();
            let tx = chan.clone();
            crate::start(move || {
                for i in 1..=5_usize {
                    tx.send(i).unwrap();
                }
            });
            crate::start(move || {
                for _ in 0..5 {
                    SUM.fetch_add(chan.recv().unwrap(), Ordering::Relaxed);
                }
            });
        });
        assert_eq!(SUM.load(Ordering::Relaxed), 15);
    }

    #[test]
    fn close_unblocks_receiver_and_rejects_sender() {
        static OUTCOMES: StdMutex<Vec<&'static str>> = StdMutex::new(Vec::new());
        OUTCOMES.lock().unwrap().clear();

        crate::run(1, || {
            let chan = Channel::<u32>::with_capacity(1);
            let rx = chan.clone();
            crate::start(move || {
                // Blocks on the empty channel until the close lands.
                let outcome = match rx.recv() {
                    Err(Closed(())) => "recv closed",
                    Ok(_) => "recv value",
                };
                OUTCOMES.lock().unwrap().push(outcome);
            });
            let closer = chan.clone();
            crate::start(move || {
                crate::yield_now();
                closer.close();
                // A send after the close must bounce the value back.
                match closer.send(7) {
                    Err(SendError(7)) => OUTCOMES.lock().unwrap().push("send closed"),
                    _ => OUTCOMES.lock().unwrap().push("send accepted"),
                }
            });
        });

        let outcomes = OUTCOMES.lock().unwrap();
        assert!(outcomes.contains(&"recv closed"));
        assert!(outcomes.contains(&"send closed"));
    }

    #[test]
    fn close_drains_buffered_values_first() {
        crate::run(1, || {
            let chan = Channel::with_capacity(2);
            chan.send(1).unwrap();
            chan.send(2).unwrap();
            chan.close();
            assert_eq!(chan.recv(), Ok(1));
            assert_eq!(chan.recv(), Ok(2));
            assert_eq!(chan.recv(), Err(Closed(())));
        });
    }

    // The three-routine relay from the scheduler's reference scenario:
    // a producer, a router and an echo stage over four capacity-5 channels.
    #[test]
    fn pipe_ping_pong_relay() {
        static A_ACKS: StdMutex<Vec<u32>> = StdMutex::new(Vec::new());
        static C_SEEN: StdMutex<Vec<u32>> = StdMutex::new(Vec::new());
        A_ACKS.lock().unwrap().clear();
        C_SEEN.lock().unwrap().clear();

        const N: u32 = 10;

        crate::run(1, || {
            let a2b = Channel::with_capacity(5);
            let b2a = Channel::with_capacity(5);
            let b2c = Channel::with_capacity(5);
            let c2b = Channel::with_capacity(5);

            // A: produce 0..N, read acks.
            {
                let (out, acks) = (a2b.clone(), b2a.clone());
                crate::start(move || {
                    for i in 0..N {
                        out.send(i).unwrap();
                        let ack = acks.recv().unwrap();
                        A_ACKS.lock().unwrap().push(ack);
                    }
                });
            }
            // B: forward both ways.
            {
                let (source_in, source_out) = (a2b.clone(), b2a.clone());
                let (dest_out, dest_in) = (b2c.clone(), c2b.clone());
                crate::start(move || {
                    for _ in 0..N {
                        let value = source_in.recv().unwrap();
                        dest_out.send(value).unwrap();
                        let echoed = dest_in.recv().unwrap();
                        source_out.send(echoed).unwrap();
                    }
                });
            }
            // C: echo.
            {
                let (input, output) = (b2c.clone(), c2b.clone());
                crate::start(move || {
                    for _ in 0..N {
                        let value = input.recv().unwrap();
                        C_SEEN.lock().unwrap().push(value);
                        output.send(value).unwrap();
                    }
                });
            }
        });

        let expected: Vec<u32> = (0..N).collect();
        assert_eq!(&*A_ACKS.lock().unwrap(), &expected);
        assert_eq!(&*C_SEEN.lock().unwrap(), &expected);
    }
}
