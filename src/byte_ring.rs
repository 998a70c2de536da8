//! An async byte FIFO for exactly one producer and one consumer, used to
//! decouple a socket's raw read loop from a frame parser that needs to wait
//! for "at least N bytes" rather than "one `read()` worth of bytes".
//!
//! Modeled on the guarded-state-plus-`Notify` idiom used elsewhere in this
//! crate's client pipeline for tracking in-flight responses: a `Mutex`
//! protects the buffer, a `Notify` wakes whoever is waiting on it.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

const DEFAULT_MIN_CAPACITY: usize = 256;

struct State {
    buffer: VecDeque<u8>,
    min_capacity: usize,
}

/// Single-producer/single-consumer async byte ring. Cloning an `Arc` around
/// this type is how the producer and consumer halves share it.
pub struct ByteRing {
    state: Mutex<State>,
    notify: Notify,
}

impl ByteRing {
    pub fn new() -> Self {
        Self::with_min_capacity(DEFAULT_MIN_CAPACITY)
    }

    pub fn with_min_capacity(min_capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                buffer: VecDeque::with_capacity(min_capacity),
                min_capacity,
            }),
            notify: Notify::new(),
        }
    }

    /// Appends `bytes` to the tail of the FIFO and wakes any waiter.
    /// `VecDeque` grows its own backing storage on demand, which already
    /// gives the doubling growth this contract calls for.
    pub fn enqueue(&self, bytes: &[u8]) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.buffer.extend(bytes.iter().copied());
        }
        self.notify.notify_waiters();
    }

    /// Returns up to `n` bytes without removing them.
    pub fn peek(&self, n: usize) -> Vec<u8> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.buffer.iter().take(n).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until at least `count` bytes are available, then removes and
    /// returns exactly `count` of them. Cancelling `ct` aborts the wait
    /// without consuming anything.
    pub async fn dequeue_async(&self, count: usize, ct: &CancellationToken) -> Result<Vec<u8>> {
        loop {
            // Register for the next notification before checking the
            // condition, not after: otherwise an enqueue() that lands in the
            // gap between dropping the lock and calling notified() would be
            // missed, since notify_waiters only wakes waiters registered
            // before it runs.
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.buffer.len() >= count {
                    let out: Vec<u8> = state.buffer.drain(..count).collect();
                    Self::maybe_shrink(&mut state);
                    return Ok(out);
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = ct.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    fn maybe_shrink(state: &mut State) {
        let remaining = state.buffer.len();
        if remaining <= state.buffer.capacity() / 2 && state.buffer.capacity() > state.min_capacity {
            let target = remaining.max(state.min_capacity);
            let mut shrunk = VecDeque::with_capacity(target);
            shrunk.extend(state.buffer.drain(..));
            state.buffer = shrunk;
        }
    }
}

impl Default for ByteRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn dequeue_returns_immediately_when_enough_bytes_present() {
        let ring = ByteRing::new();
        ring.enqueue(&[1, 2, 3, 4]);
        let ct = CancellationToken::new();
        let out = ring.dequeue_async(3, &ct).await.unwrap();
        assert_eq!(out, vec![1, 2, 3]);
        assert_eq!(ring.len(), 1);
    }

    #[tokio::test]
    async fn dequeue_waits_for_enqueue() {
        let ring = Arc::new(ByteRing::new());
        let ct = CancellationToken::new();
        let reader = {
            let ring = Arc::clone(&ring);
            let ct = ct.clone();
            tokio::spawn(async move { ring.dequeue_async(3, &ct).await })
        };
        tokio::task::yield_now().await;
        ring.enqueue(&[9, 8, 7]);
        let out = reader.await.unwrap().unwrap();
        assert_eq!(out, vec![9, 8, 7]);
    }

    #[tokio::test]
    async fn cancellation_aborts_the_wait_without_consuming() {
        let ring = Arc::new(ByteRing::new());
        let ct = CancellationToken::new();
        let reader = {
            let ring = Arc::clone(&ring);
            let ct = ct.clone();
            tokio::spawn(async move { ring.dequeue_async(10, &ct).await })
        };
        tokio::task::yield_now().await;
        ct.cancel();
        let result = reader.await.unwrap();
        assert!(result.is_err());
        ring.enqueue(&[1, 2, 3]);
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn peek_does_not_remove() {
        let ring = ByteRing::new();
        ring.enqueue(&[1, 2, 3]);
        assert_eq!(ring.peek(2), vec![1, 2]);
        assert_eq!(ring.len(), 3);
    }
}
