//! Crate-wide error types.
//!
//! Small `Snafu`-derived enums per concern, a shared [`Result`] alias, and
//! a [`Trap`] extension trait for lifting infrastructure errors (I/O,
//! base64, cipher) at the boundary rather than `.unwrap()`-ing them away.

use snafu::prelude::*;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors that can occur anywhere in the connection protocol core.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// Malformed message, disallowed state transition, oversized packet,
    /// window overflow/underflow. Fatal to the whole connection.
    #[snafu(display("protocol error: {msg}"))]
    Protocol { msg: String },

    /// The peer requested something we refuse; reported back as a
    /// `ChannelOpenFailure`, never fatal to the connection.
    #[snafu(display("channel open refused: {msg}"))]
    OpenFailure { msg: String },

    /// Caught from a session/direct-tcpip worker; turned into
    /// `exit-signal("ILL", ...)` rather than poisoning the connection.
    #[snafu(display("handler exception: {msg}"))]
    HandlerException { msg: String },

    /// A bug in this crate, not a protocol violation by the peer.
    #[snafu(display("internal bug: {msg}"))]
    Bug { msg: String },

    /// Parsing a key file or known_hosts database failed. Never propagates
    /// into the live connection path.
    #[snafu(display("parse error: {msg}"))]
    Parse { msg: String },

    /// Transport-level end of stream or I/O failure underneath the
    /// `MessageStream`.
    #[snafu(display("transport error: {source}"))]
    Transport { source: std::io::Error },
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol { msg: msg.into() }
    }

    pub fn open_failure(msg: impl Into<String>) -> Self {
        Error::OpenFailure { msg: msg.into() }
    }

    pub fn bug(msg: impl Into<String>) -> Self {
        Error::Bug { msg: msg.into() }
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Error::Parse { msg: msg.into() }
    }
}

/// Converts a foreign error into our [`Error`], tagging on a short
/// description of the boundary that was crossed.
pub trait Trap<T> {
    fn trap(self, what: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> Trap<T> for core::result::Result<T, E> {
    fn trap(self, what: &str) -> Result<T> {
        self.map_err(|e| Error::parse(format!("{what}: {e}")))
    }
}
