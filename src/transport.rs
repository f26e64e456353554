//! The upstream transport boundary (spec.md §6 "Upstream transport").
//!
//! Key exchange, ciphers, MAC and packet framing are explicitly out of
//! scope (spec.md §1); this crate only consumes a [`MessageStream`] that
//! already speaks fully-parsed connection-protocol messages.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::msg::Message;

/// A connection to an already-established, encrypted, authenticated SSH
/// transport, exposing the connection-protocol messages it carries.
#[async_trait]
pub trait MessageStream: Send {
    /// Emits one message. May block (suspend) on the underlying transport.
    async fn send(&mut self, msg: Message) -> Result<()>;

    /// Receives one message, or `None` at end of stream.
    async fn receive(&mut self) -> Result<Option<Message>>;
}

/// The receiving half of a split [`MessageStream`] (spec.md §5 "one
/// reader task").
#[async_trait]
pub trait MessageSource: Send {
    async fn receive(&mut self) -> Result<Option<Message>>;
}

/// The sending half of a split [`MessageStream`] (spec.md §5 "one writer
/// task").
#[async_trait]
pub trait MessageSink: Send {
    async fn send(&mut self, msg: Message) -> Result<()>;
}

/// Splits a single [`MessageStream`] into independent reader/writer
/// halves backed by a shared lock, mirroring `tokio::io::split`'s
/// approach for transports that don't natively expose separate halves:
/// each half only holds the lock across its own operation, so a reader
/// blocked waiting for bytes never stalls the writer (and vice versa) as
/// long as the underlying transport itself allows concurrent read/write.
pub fn split<S>(stream: S) -> (ReadHalf<S>, WriteHalf<S>)
where
    S: MessageStream + 'static,
{
    let shared = Arc::new(Mutex::new(stream));
    (
        ReadHalf {
            inner: shared.clone(),
        },
        WriteHalf { inner: shared },
    )
}

pub struct ReadHalf<S> {
    inner: Arc<Mutex<S>>,
}

#[async_trait]
impl<S: MessageStream> MessageSource for ReadHalf<S> {
    async fn receive(&mut self) -> Result<Option<Message>> {
        self.inner.lock().await.receive().await
    }
}

pub struct WriteHalf<S> {
    inner: Arc<Mutex<S>>,
}

#[async_trait]
impl<S: MessageStream> MessageSink for WriteHalf<S> {
    async fn send(&mut self, msg: Message) -> Result<()> {
        self.inner.lock().await.send(msg).await
    }
}
