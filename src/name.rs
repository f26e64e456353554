//! SSH name tags: short ASCII identifiers used for algorithms, channel
//! types, request types and service names.

use std::fmt;

/// A short ASCII identifier, as used for SSH algorithm/service/type tags.
///
/// Stored as an owned `String` rather than borrowed against the wire
/// buffer: this crate operates on owned messages decoded off a
/// `MessageStream`, not zero-copy buffers shared with the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(String);

impl Name {
    pub fn new(s: impl Into<String>) -> Self {
        Name(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Name {
    fn from(s: &str) -> Self {
        Name(s.to_owned())
    }
}

impl From<String> for Name {
    fn from(s: String) -> Self {
        Name(s)
    }
}

impl PartialEq<str> for Name {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Name {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Channel request type names understood well enough to route or reject,
/// per spec.md's open/non-goal split: `WindowChange` and `Signal` are
/// parsed so they can be rejected cleanly, not silently dropped.
pub mod req {
    pub const EXIT_STATUS: &str = "exit-status";
    pub const EXIT_SIGNAL: &str = "exit-signal";
    pub const PTY_REQ: &str = "pty-req";
    pub const SHELL: &str = "shell";
    pub const EXEC: &str = "exec";
    pub const SUBSYSTEM: &str = "subsystem";
    pub const ENV: &str = "env";
    pub const WINDOW_CHANGE: &str = "window-change";
    pub const SIGNAL: &str = "signal";
}

pub mod chantype {
    pub const SESSION: &str = "session";
    pub const DIRECT_TCPIP: &str = "direct-tcpip";
    pub const FORWARDED_TCPIP: &str = "forwarded-tcpip";
}

pub mod globalreq {
    pub const TCPIP_FORWARD: &str = "tcpip-forward";
    pub const CANCEL_TCPIP_FORWARD: &str = "cancel-tcpip-forward";
}

/// A bound or target TCP/IP address (spec.md §3 "Address"), used both by
/// the switchboard's forwarding registry and by `known_hosts` lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Address {
            host: host.into(),
            port,
        }
    }

    /// The canonical name used by `known_hosts` entries (spec.md §4.8):
    /// `host` if the port is the default 22, else `[host]:port`.
    pub fn canonical_name(&self) -> String {
        if self.port == 22 {
            self.host.clone()
        } else {
            format!("[{}]:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
