//! Channel table & state machine (component C3, spec.md §4.3).
//!
//! Channels move `Opening -> Running -> Closing -> (removed)`. All state
//! shared between the dispatcher (C4) and the supervisors (C5) — the table
//! itself, each channel's remote window, its closed flag — is guarded so a
//! multi-field update (e.g. "allocate id, insert Opening, prepare the
//! ChannelOpen to send") commits as one step: handlers must never send a
//! message while holding the transaction open (spec.md §4.4), so callers
//! build the outbound action as a value first, then perform I/O after the
//! lock is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::AbortHandle;

use crate::direct_tcpip::{DirectTcpIpBuffers, ForwardedTcpIpBuffers};
use crate::error::{Error, Result};
use crate::msg::ChannelOpenFailure;
use crate::session::SessionBuffers;

pub type ChannelId = u32;

/// Caps the remote window to the protocol's 32-bit limit; an increment
/// that would overflow this is a fatal protocol error (spec.md §3, §8
/// property 7).
const MAX_WINDOW: u32 = u32::MAX;

/// The peer's advertised receive window for this channel: how many bytes
/// *we* may still send before waiting for a `ChannelWindowAdjust`.
#[derive(Clone)]
pub struct RemoteWindow {
    remaining: Arc<Mutex<u32>>,
    notify: Arc<Notify>,
}

impl RemoteWindow {
    pub fn new(initial: u32) -> Self {
        RemoteWindow {
            remaining: Arc::new(Mutex::new(initial)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Applies an inbound `ChannelWindowAdjust`. Fatal on overflow past
    /// 2^32-1 (spec.md §3, §8 property 7).
    pub async fn increase(&self, by: u32) -> Result<()> {
        let mut remaining = self.remaining.lock().await;
        *remaining = remaining
            .checked_add(by)
            .filter(|v| *v <= MAX_WINDOW)
            .ok_or_else(|| Error::protocol("remote window overflow on ChannelWindowAdjust"))?;
        drop(remaining);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Waits for at least one byte of window, then reserves up to
    /// `min(want, available, max_packet)` bytes and returns that count.
    pub async fn reserve(&self, want: usize, max_packet: u32) -> usize {
        loop {
            {
                let mut remaining = self.remaining.lock().await;
                if *remaining > 0 && want > 0 {
                    let take = want.min(*remaining as usize).min(max_packet as usize).max(1);
                    *remaining -= take as u32;
                    return take;
                } else if want == 0 {
                    return 0;
                }
            }
            self.notify.notified().await;
        }
    }
}

/// A channel's application-specific buffers and handler, keyed by the
/// channel type that opened it (spec.md §3 "Application state").
pub enum Application {
    Session(SessionBuffers),
    DirectTcpIp(DirectTcpIpBuffers),
    ForwardedTcpIp(ForwardedTcpIpBuffers),
}

/// An established channel. Both ids are immutable for its lifetime; the
/// remote packet size is immutable and equals what the peer advertised in
/// its open confirmation (spec.md §3 invariants).
pub struct Channel {
    pub local_id: ChannelId,
    pub remote_id: ChannelId,
    pub remote_window: RemoteWindow,
    pub remote_max_packet: u32,
    pub closed: Arc<AtomicBool>,
    pub supervisor: AbortHandle,
    pub app: Application,
}

/// What a locally-initiated channel carries while waiting for the peer's
/// `ChannelOpenConfirmation`/`ChannelOpenFailure`.
pub enum PendingApp {
    DirectTcpIp(DirectTcpIpBuffers),
    ForwardedTcpIp(ForwardedTcpIpBuffers),
    Session(SessionBuffers),
}

/// Continuation for a locally-initiated open: invoked atomically with
/// either a confirmation or a failure (spec.md §3 "Opening").
pub struct Opening {
    pub app: PendingApp,
    pub reply: oneshot::Sender<std::result::Result<(), ChannelOpenFailure>>,
}

pub enum ChannelState {
    Opening(Opening),
    Running(Channel),
    /// Absorbing: per spec.md §9's first open question, inbound non-close
    /// messages and a second `ChannelClose` are silently ignored here.
    Closing,
}

/// Registry of active channels keyed by local id (spec.md §4.3).
pub struct ChannelTable {
    channels: HashMap<ChannelId, ChannelState>,
    max_count: u16,
}

impl ChannelTable {
    pub fn new(max_count: u16) -> Self {
        ChannelTable {
            channels: HashMap::new(),
            max_count,
        }
    }

    /// The least non-negative integer below `channelMaxCount` not present
    /// in the table, or `None` if the table is full (spec.md §8 property
    /// 4).
    pub fn select_free_local_id(&self) -> Option<ChannelId> {
        (0..self.max_count as u32).find(|id| !self.channels.contains_key(id))
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn get(&self, id: ChannelId) -> Option<&ChannelState> {
        self.channels.get(&id)
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut ChannelState> {
        self.channels.get_mut(&id)
    }

    pub fn insert(&mut self, id: ChannelId, state: ChannelState) {
        self.channels.insert(id, state);
    }

    pub fn remove(&mut self, id: ChannelId) -> Option<ChannelState> {
        self.channels.remove(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.channels.keys().copied()
    }

    /// Inserts a new `Opening` entry after allocating a fresh id, failing
    /// if the table is at `channelMaxCount`.
    pub fn begin_open(&mut self, opening: Opening) -> Result<ChannelId> {
        let id = self
            .select_free_local_id()
            .ok_or_else(|| Error::open_failure("no free channel id, channelMaxCount reached"))?;
        self.channels.insert(id, ChannelState::Opening(opening));
        trace!("allocated local channel id {id}");
        Ok(id)
    }

    /// Cancels every running channel's supervisor; called on connection
    /// teardown so cancellation propagates structurally (spec.md §5
    /// "Cancellation").
    pub fn abort_all(&mut self) {
        for (id, state) in self.channels.drain() {
            if let ChannelState::Running(chan) = state {
                debug!("aborting supervisor for channel {id}");
                chan.supervisor.abort();
            }
        }
    }
}

/// Marks a channel as having sent its own `ChannelClose`, returning
/// whether this is the first time (i.e. whether we should actually send
/// the message) — the two-sided close is idempotent (spec.md §4.3, §8
/// property 6).
pub fn mark_closed_first_time(closed: &AtomicBool) -> bool {
    !closed.swap(true, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_allocation_picks_lowest_free() {
        let mut t = ChannelTable::new(4);
        t.insert(0, ChannelState::Closing);
        t.insert(2, ChannelState::Closing);
        assert_eq!(t.select_free_local_id(), Some(1));
    }

    #[test]
    fn id_allocation_none_when_full() {
        let mut t = ChannelTable::new(2);
        t.insert(0, ChannelState::Closing);
        t.insert(1, ChannelState::Closing);
        assert_eq!(t.select_free_local_id(), None);
    }

    #[tokio::test]
    async fn remote_window_overflow_is_protocol_error() {
        let w = RemoteWindow::new(u32::MAX - 1);
        assert!(w.increase(10).await.is_err());
    }

    #[tokio::test]
    async fn remote_window_reserve_respects_max_packet() {
        let w = RemoteWindow::new(1000);
        let got = w.reserve(900, 100).await;
        assert_eq!(got, 100);
    }

    #[test]
    fn close_idempotence() {
        let flag = AtomicBool::new(false);
        assert!(mark_closed_first_time(&flag));
        assert!(!mark_closed_first_time(&flag));
    }
}
