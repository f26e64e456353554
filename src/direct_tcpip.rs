//! `direct-tcpip`/`forwarded-tcpip` application and its supervisor
//! (component C5, spec.md §3, §4.6).
//!
//! Both channel types are a plain duplex byte pipe between the channel and
//! whatever endpoint the host application dials or accepted (dialing the
//! socket itself is out of scope, spec.md §1) — unlike a session channel
//! there is no stderr stream and no exit-status/exit-signal sequence, so
//! the supervisor here is a strict subset of [`crate::session`]'s.

use std::sync::Arc;

use log::{debug, trace};
use tokio::sync::Mutex;

use crate::channel::{mark_closed_first_time, ChannelId, ChannelTable};
use crate::config::DuplexHandler;
use crate::msg::{ChannelClose, ChannelData, ChannelEof, Message};
use crate::window::TWindowBuffer;

/// The two buffers backing a duplex channel: `incoming` carries bytes off
/// the wire (`ChannelData`) toward the dialed/forwarded endpoint, `outgoing`
/// carries bytes from that endpoint back out as `ChannelData`.
#[derive(Clone)]
pub struct DuplexBuffers {
    pub incoming: TWindowBuffer,
    pub outgoing: TWindowBuffer,
}

impl DuplexBuffers {
    pub fn new(queue_size: u32) -> Self {
        DuplexBuffers {
            incoming: TWindowBuffer::new(queue_size),
            outgoing: TWindowBuffer::new(queue_size),
        }
    }
}

/// Buffers for a locally-initiated `direct-tcpip` channel.
pub type DirectTcpIpBuffers = DuplexBuffers;

/// Buffers for a remote-initiated `forwarded-tcpip` channel, handed back
/// through the switchboard (spec.md §3 "Address", §4.7).
pub type ForwardedTcpIpBuffers = DuplexBuffers;

/// What a [`DuplexHandler`] is given to read/write against.
pub struct DuplexIo {
    pub incoming: TWindowBuffer,
    pub outgoing: TWindowBuffer,
}

/// Runs a duplex channel's worker and drains its outbound buffer. Mirrors
/// [`crate::session::run_session_supervisor`]'s priority order minus the
/// stderr and exit-status arms: outbound data, then worker exit, then
/// window-adjust for the inbound side.
pub async fn run_duplex_supervisor(
    handler: Box<dyn DuplexHandler>,
    local_id: ChannelId,
    remote_id: ChannelId,
    channels: Arc<Mutex<ChannelTable>>,
    outbox: tokio::sync::mpsc::UnboundedSender<Message>,
) {
    let buffers = {
        let table = channels.lock().await;
        match table.get(local_id) {
            Some(crate::channel::ChannelState::Running(chan)) => match &chan.app {
                crate::channel::Application::DirectTcpIp(b) => b.clone(),
                crate::channel::Application::ForwardedTcpIp(b) => b.clone(),
                _ => return,
            },
            _ => return,
        }
    };

    let remote_window = {
        let table = channels.lock().await;
        match table.get(local_id) {
            Some(crate::channel::ChannelState::Running(chan)) => chan.remote_window.clone(),
            _ => return,
        }
    };
    let remote_max_packet = {
        let table = channels.lock().await;
        match table.get(local_id) {
            Some(crate::channel::ChannelState::Running(chan)) => chan.remote_max_packet,
            _ => return,
        }
    };

    let io = DuplexIo {
        incoming: buffers.incoming.clone(),
        outgoing: buffers.outgoing.clone(),
    };
    let mut worker = Box::pin(handler.run(io));
    let outgoing = buffers.outgoing.clone();
    let incoming = buffers.incoming.clone();

    loop {
        tokio::select! {
            biased;

            chunk = outgoing.dequeue_short(remote_max_packet as usize) => {
                send_data(&remote_window, remote_max_packet, remote_id, chunk, &outbox).await;
            }

            _ = &mut worker => {
                break;
            }

            increment = incoming.recommended_window_adjust() => {
                let _ = outbox.send(Message::ChannelWindowAdjust(crate::msg::ChannelWindowAdjust {
                    recipient_channel: remote_id,
                    bytes_to_add: increment,
                }));
            }
        }
    }

    buffers.outgoing.send_eof().await;
    drain_remaining(&buffers.outgoing, &remote_window, remote_max_packet, remote_id, &outbox).await;

    let _ = outbox.send(Message::ChannelEof(ChannelEof {
        recipient_channel: remote_id,
    }));

    let should_send_close = {
        let table = channels.lock().await;
        match table.get(local_id) {
            Some(crate::channel::ChannelState::Running(chan)) => {
                mark_closed_first_time(&chan.closed)
            }
            _ => false,
        }
    };
    if should_send_close {
        let _ = outbox.send(Message::ChannelClose(ChannelClose {
            recipient_channel: remote_id,
        }));
    }
    debug!("duplex channel {local_id} supervisor finished");
}

async fn send_data(
    remote_window: &crate::channel::RemoteWindow,
    remote_max_packet: u32,
    remote_id: ChannelId,
    mut chunk: Vec<u8>,
    outbox: &tokio::sync::mpsc::UnboundedSender<Message>,
) {
    while !chunk.is_empty() {
        let take = remote_window.reserve(chunk.len(), remote_max_packet).await;
        let rest = chunk.split_off(take);
        let sent = std::mem::replace(&mut chunk, rest);
        trace!("channel {remote_id} sending {} bytes", sent.len());
        let _ = outbox.send(Message::ChannelData(ChannelData {
            recipient_channel: remote_id,
            data: sent.into(),
        }));
    }
}

async fn drain_remaining(
    buf: &TWindowBuffer,
    remote_window: &crate::channel::RemoteWindow,
    remote_max_packet: u32,
    remote_id: ChannelId,
    outbox: &tokio::sync::mpsc::UnboundedSender<Message>,
) {
    loop {
        let chunk = buf.dequeue_short(remote_max_packet as usize).await;
        if chunk.is_empty() {
            break;
        }
        send_data(remote_window, remote_max_packet, remote_id, chunk, outbox).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplex_buffers_are_independent() {
        let b = DuplexBuffers::new(1024);
        b.incoming.enqueue_short(b"hello").await.unwrap();
        assert_eq!(b.incoming.dequeue_short(10).await, b"hello");
        b.outgoing.send_eof().await;
        assert_eq!(b.outgoing.dequeue_short(10).await.len(), 0);
    }
}
