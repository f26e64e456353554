//! Connection-protocol core for SSH (version 2): the channel multiplexer
//! that runs on top of an already-established, encrypted, authenticated
//! transport.
//!
//! Key exchange, ciphers, MAC, packet framing and user-authentication
//! methods live below this crate's boundary — see [`transport::MessageStream`]
//! for exactly where that boundary sits. What lives here:
//!
//! - channel lifecycle and flow control ([`channel`], [`window`]),
//! - the session and direct/forwarded-tcpip applications that run on top
//!   of a channel ([`session`], [`direct_tcpip`]),
//! - the connection dispatcher wiring a transport to the channel table
//!   ([`connection`]),
//! - server-side TCP/IP forwarding registration ([`switchboard`]),
//! - offline OpenSSH private-key and `known_hosts` file parsing
//!   ([`keyfile`], [`known_hosts`]).

pub mod channel;
pub mod config;
pub mod connection;
pub mod direct_tcpip;
pub mod error;
pub mod keyfile;
pub mod known_hosts;
pub mod msg;
pub mod name;
pub mod pubkey;
pub mod session;
pub mod switchboard;
pub mod transport;
pub mod wire;
pub mod window;

pub use config::{Config, DuplexHandler, ExitOutcome, Identity, SessionCommand, SessionHandler};
pub use connection::{Connection, ConnectionHandle, Role};
pub use error::{Error, Result};
pub use known_hosts::{KnownHosts, Verification};
pub use name::Address;
pub use pubkey::{KeyPair, PublicKey};
pub use transport::MessageStream;
