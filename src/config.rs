//! Per-connection configuration (spec.md §6 "Configuration").
//!
//! Socket setup, CLI option parsing and executable wrappers are out of
//! scope (spec.md §1); what the core needs from its host application is
//! limited to these knobs and the two request callbacks.

use std::sync::Arc;

use async_trait::async_trait;

use crate::msg::ChannelRequestBody;
use crate::window::clamp_queue_size;

/// An opaque identity handed to the core once user authentication has
/// succeeded upstream. Authentication methods themselves are out of scope
/// (spec.md §1); the core only needs something to tag switchboard
/// registrations and pass to the request callbacks (spec.md §9: the
/// switchboard caller must be identified by the real authenticated
/// identity, not a placeholder).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(pub String);

impl Identity {
    pub fn unauthenticated() -> Self {
        Identity(String::new())
    }
}

/// Why a session handler's worker stopped, reported to the peer as either
/// `exit-status` or `exit-signal("ILL", ...)` (spec.md §6, §7).
pub enum ExitOutcome {
    Status(u32),
    Exception(String),
}

/// What triggered starting the session's worker.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    Shell,
    Exec(String),
    Subsystem(String),
}

impl SessionCommand {
    pub fn from_request(body: &ChannelRequestBody) -> Option<Self> {
        match body {
            ChannelRequestBody::Shell => Some(SessionCommand::Shell),
            ChannelRequestBody::Exec { command } => Some(SessionCommand::Exec(command.clone())),
            ChannelRequestBody::Subsystem { name } => Some(SessionCommand::Subsystem(name.clone())),
            _ => None,
        }
    }
}

/// Application logic for a `session` channel: shell/exec/subsystem with
/// stdin/stdout/stderr (spec.md §3 "SessionState", §4.5).
///
/// Modeled as a boxed trait object rather than a generic parameter on
/// `Connection`, per the design notes' guidance on existentially-typed
/// handler signatures (spec.md §9).
#[async_trait]
pub trait SessionHandler: Send {
    async fn run(
        self: Box<Self>,
        command: SessionCommand,
        io: crate::session::SessionIo,
    ) -> ExitOutcome;
}

/// Application logic for a `direct-tcpip`/`forwarded-tcpip` channel: pumps
/// bytes between the channel's buffers and whatever endpoint the host
/// application dials (socket setup itself is out of scope, spec.md §1).
#[async_trait]
pub trait DuplexHandler: Send {
    async fn run(self: Box<Self>, io: crate::direct_tcpip::DuplexIo);
}

pub type SessionRequestCallback =
    Arc<dyn Fn(&Identity) -> Option<Box<dyn SessionHandler>> + Send + Sync>;

pub type DirectTcpIpRequestCallback = Arc<
    dyn Fn(&Identity, &str, u16) -> Option<Box<dyn DuplexHandler>> + Send + Sync,
>;

/// Client-side callback for a remote-initiated `forwarded-tcpip` open —
/// the server relaying a connection accepted on a port this client
/// registered via `tcpip-forward` (spec.md §4.6).
pub type ForwardedTcpIpRequestCallback =
    Arc<dyn Fn(&str, u16) -> Option<Box<dyn DuplexHandler>> + Send + Sync>;

/// Per-connection configuration (spec.md §6).
#[derive(Clone)]
pub struct Config {
    pub channel_max_count: u16,
    pub channel_max_queue_size: u32,
    pub channel_max_packet_size: u32,
    pub on_session_request: Option<SessionRequestCallback>,
    pub on_direct_tcpip_request: Option<DirectTcpIpRequestCallback>,
    pub on_forwarded_tcpip_request: Option<ForwardedTcpIpRequestCallback>,
    pub switchboard: Option<crate::switchboard::Switchboard>,
}

impl Config {
    /// Normalizes `channel_max_packet_size` to the rules in spec.md §6:
    /// capped at 35000 and at `channel_max_queue_size`, and clamps the
    /// queue size into its valid range.
    pub fn normalize(mut self) -> Self {
        self.channel_max_queue_size = clamp_queue_size(self.channel_max_queue_size);
        self.channel_max_packet_size = self
            .channel_max_packet_size
            .min(35_000)
            .min(self.channel_max_queue_size);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            channel_max_count: 256,
            channel_max_queue_size: 32_768,
            channel_max_packet_size: 32_768,
            on_session_request: None,
            on_direct_tcpip_request: None,
            on_forwarded_tcpip_request: None,
            switchboard: None,
        }
        .normalize()
    }
}
