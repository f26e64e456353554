//! Flow-controlled buffer (component C2, spec.md §4.2).
//!
//! `TWindowBuffer` couples a bounded byte FIFO to the `windowSizeLocal`
//! counter advertised to the peer. The teacher's code models this kind of
//! shared, multi-waiter state as a mutex plus a wakeup signal (see
//! `runner.rs`'s `output_waker`/`input_waker`); here the wakeup is a
//! [`tokio::sync::Notify`] and the precondition checks happen inside the
//! lock, per the design notes' condition-variable fallback for composed
//! atomic waits.
//!
//! Invariant held at every quiescent point:
//! `window_size_local + bytes_in_buffer + pending_credit == capacity`.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::error::Result;

/// Clamps a configured queue size into the valid range (spec.md §5):
/// 0 or values above 2^29-1 are clamped into range.
pub fn clamp_queue_size(requested: u32) -> u32 {
    const MAX: u32 = (1 << 29) - 1;
    requested.clamp(1, MAX)
}

struct Inner {
    data: VecDeque<u8>,
    window_size_local: u32,
    pending_credit: u32,
    eof: bool,
}

impl Inner {
    fn invariant_holds(&self, capacity: u32) -> bool {
        self.window_size_local as u64
            + self.data.len() as u64
            + self.pending_credit as u64
            == capacity as u64
    }
}

/// A bounded FIFO of bytes coupling application I/O to a channel's local
/// receive window. Cloning shares the underlying buffer (it's an `Arc`
/// handle), matching how both the dispatcher and the supervisor need to
/// touch the same buffer concurrently.
#[derive(Clone)]
pub struct TWindowBuffer {
    capacity: u32,
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl TWindowBuffer {
    pub fn new(capacity: u32) -> Self {
        let capacity = clamp_queue_size(capacity);
        TWindowBuffer {
            capacity,
            inner: Arc::new(Mutex::new(Inner {
                data: VecDeque::with_capacity(capacity as usize),
                window_size_local: capacity,
                pending_credit: 0,
                eof: false,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Writes as much of `payload` as fits within the remaining advertised
    /// window, returning the number of bytes written. Retries only when the
    /// buffer has zero remaining window; a payload that doesn't fully fit
    /// when *some* window remains is a short write, which the caller (the
    /// channel state machine) must treat as a window-underrun protocol
    /// error rather than this buffer silently looping.
    pub async fn enqueue_short(&self, payload: &[u8]) -> Result<usize> {
        if payload.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.window_size_local > 0 {
                    let n = (inner.window_size_local as usize).min(payload.len());
                    inner.data.extend(&payload[..n]);
                    inner.window_size_local -= n as u32;
                    debug_assert!(inner.invariant_holds(self.capacity));
                    drop(inner);
                    self.notify.notify_waiters();
                    return Ok(n);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Dequeues up to `max_bytes`, retrying until at least one byte is
    /// available or EOF has been signalled and the buffer is empty (in
    /// which case it returns an empty chunk).
    pub async fn dequeue_short(&self, max_bytes: usize) -> Vec<u8> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if !inner.data.is_empty() {
                    let n = inner.data.len().min(max_bytes.max(1));
                    let chunk: Vec<u8> = inner.data.drain(..n).collect();
                    inner.pending_credit += n as u32;
                    debug_assert!(inner.invariant_holds(self.capacity));
                    drop(inner);
                    self.notify.notify_waiters();
                    return chunk;
                }
                if inner.eof {
                    return Vec::new();
                }
            }
            self.notify.notified().await;
        }
    }

    /// Sets the EOF flag. Idempotent.
    pub async fn send_eof(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.eof {
            inner.eof = true;
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    pub async fn ask_eof(&self) -> bool {
        self.inner.lock().await.eof
    }

    /// Waits until at least half the capacity's worth of credit has
    /// accumulated (i.e. the application has drained that much from the
    /// buffer since the last adjustment), then returns the increment to
    /// advertise via `ChannelWindowAdjust` and folds it back into
    /// `window_size_local`. This is the sole source of window-adjust
    /// messages (spec.md §4.2).
    pub async fn recommended_window_adjust(&self) -> u32 {
        loop {
            {
                let mut inner = self.inner.lock().await;
                let threshold = self.capacity / 2;
                if inner.pending_credit >= threshold.max(1) {
                    let increment = inner.pending_credit;
                    inner.window_size_local += increment;
                    inner.pending_credit = 0;
                    debug_assert!(inner.invariant_holds(self.capacity));
                    return increment;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Current remaining advertised window, used by the channel table to
    /// validate inbound `ChannelData` doesn't overrun it (spec.md §4.3).
    pub async fn window_size_local(&self) -> u32 {
        self.inner.lock().await.window_size_local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_then_dequeue_respects_window() {
        let buf = TWindowBuffer::new(10);
        assert_eq!(buf.window_size_local().await, 10);
        let n = buf.enqueue_short(b"hello").await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(buf.window_size_local().await, 5);
        let chunk = buf.dequeue_short(100).await;
        assert_eq!(chunk, b"hello");
    }

    #[tokio::test]
    async fn short_write_when_window_partially_consumed() {
        let buf = TWindowBuffer::new(4);
        let n = buf.enqueue_short(b"hello").await.unwrap();
        assert_eq!(n, 4, "only 4 bytes of window available, short write expected");
    }

    #[tokio::test]
    async fn eof_drains_then_returns_empty() {
        let buf = TWindowBuffer::new(10);
        buf.enqueue_short(b"x").await.unwrap();
        buf.send_eof().await;
        assert_eq!(buf.dequeue_short(100).await, b"x");
        assert_eq!(buf.dequeue_short(100).await, Vec::<u8>::new());
        assert!(buf.ask_eof().await);
    }

    #[tokio::test]
    async fn window_adjust_feedback_s6() {
        // S6: capacity 1024, 600 bytes enqueued then read -> one adjust of 600.
        let buf = TWindowBuffer::new(1024);
        buf.enqueue_short(&vec![0u8; 600]).await.unwrap();
        let chunk = buf.dequeue_short(600).await;
        assert_eq!(chunk.len(), 600);
        let increment = buf.recommended_window_adjust().await;
        assert_eq!(increment, 600);
    }

    #[tokio::test]
    async fn invariant_holds_across_interleaving() {
        let cap = 64u32;
        let buf = TWindowBuffer::new(cap);
        for _ in 0..5 {
            buf.enqueue_short(&vec![1u8; 10]).await.unwrap();
            let _ = buf.dequeue_short(7).await;
        }
        let inner = buf.inner.lock().await;
        assert!(inner.invariant_holds(cap));
    }
}
