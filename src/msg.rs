//! Connection-protocol message codec (component C1, spec.md §4.1).
//!
//! Each [`Message`] variant corresponds to one wire message number in the
//! range 80-100. Decoding fails with [`Error::Protocol`] on truncation,
//! an unexpected tag, or invalid UTF-8 in a textual field. Unknown channel
//! types and unknown channel request types decode into an `Other` payload
//! so the caller can reject them cleanly instead of the codec silently
//! dropping them.

use bytes::{Bytes, BytesMut};
use log::trace;

use crate::error::{Error, Result};
use crate::name::Name;
use crate::wire::*;

pub mod num {
    pub const DISCONNECT: u8 = 1;
    pub const GLOBAL_REQUEST: u8 = 80;
    pub const REQUEST_SUCCESS: u8 = 81;
    pub const REQUEST_FAILURE: u8 = 82;
    pub const CHANNEL_OPEN: u8 = 90;
    pub const CHANNEL_OPEN_CONFIRMATION: u8 = 91;
    pub const CHANNEL_OPEN_FAILURE: u8 = 92;
    pub const CHANNEL_WINDOW_ADJUST: u8 = 93;
    pub const CHANNEL_DATA: u8 = 94;
    pub const CHANNEL_EXTENDED_DATA: u8 = 95;
    pub const CHANNEL_EOF: u8 = 96;
    pub const CHANNEL_CLOSE: u8 = 97;
    pub const CHANNEL_REQUEST: u8 = 98;
    pub const CHANNEL_SUCCESS: u8 = 99;
    pub const CHANNEL_FAILURE: u8 = 100;
}

/// Standard SSH_EXTENDED_DATA_STDERR code (RFC 4254 §5.2).
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Channel open failure reason codes (RFC 4254 §5.1).
pub mod open_failure {
    pub const ADMINISTRATIVELY_PROHIBITED: u32 = 1;
    pub const CONNECT_FAILED: u32 = 2;
    pub const UNKNOWN_CHANNEL_TYPE: u32 = 3;
    pub const RESOURCE_SHORTAGE: u32 = 4;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Disconnect(Disconnect),
    GlobalRequest(GlobalRequest),
    RequestSuccess(RequestSuccess),
    RequestFailure,
    ChannelOpen(ChannelOpen),
    ChannelOpenConfirmation(ChannelOpenConfirmation),
    ChannelOpenFailure(ChannelOpenFailure),
    ChannelWindowAdjust(ChannelWindowAdjust),
    ChannelData(ChannelData),
    ChannelExtendedData(ChannelExtendedData),
    ChannelEof(ChannelEof),
    ChannelClose(ChannelClose),
    ChannelRequest(ChannelRequest),
    ChannelSuccess(ChannelSuccess),
    ChannelFailure(ChannelFailure),
}

impl Message {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        match self {
            Message::Disconnect(m) => {
                put_u8(&mut buf, num::DISCONNECT);
                put_u32(&mut buf, m.reason);
                put_str(&mut buf, &m.description);
                put_str(&mut buf, &m.language);
            }
            Message::GlobalRequest(m) => {
                put_u8(&mut buf, num::GLOBAL_REQUEST);
                put_name(&mut buf, &m.name);
                put_bool(&mut buf, m.want_reply);
                buf.extend_from_slice(&m.body);
            }
            Message::RequestSuccess(m) => {
                put_u8(&mut buf, num::REQUEST_SUCCESS);
                buf.extend_from_slice(&m.data);
            }
            Message::RequestFailure => put_u8(&mut buf, num::REQUEST_FAILURE),
            Message::ChannelOpen(m) => {
                put_u8(&mut buf, num::CHANNEL_OPEN);
                put_name(&mut buf, m.channel_type.name());
                put_u32(&mut buf, m.sender_channel);
                put_u32(&mut buf, m.initial_window);
                put_u32(&mut buf, m.max_packet);
                m.channel_type.encode_body(&mut buf);
            }
            Message::ChannelOpenConfirmation(m) => {
                put_u8(&mut buf, num::CHANNEL_OPEN_CONFIRMATION);
                put_u32(&mut buf, m.recipient_channel);
                put_u32(&mut buf, m.sender_channel);
                put_u32(&mut buf, m.initial_window);
                put_u32(&mut buf, m.max_packet);
            }
            Message::ChannelOpenFailure(m) => {
                put_u8(&mut buf, num::CHANNEL_OPEN_FAILURE);
                put_u32(&mut buf, m.recipient_channel);
                put_u32(&mut buf, m.reason_code);
                put_str(&mut buf, &m.description);
                put_str(&mut buf, &m.language);
            }
            Message::ChannelWindowAdjust(m) => {
                put_u8(&mut buf, num::CHANNEL_WINDOW_ADJUST);
                put_u32(&mut buf, m.recipient_channel);
                put_u32(&mut buf, m.bytes_to_add);
            }
            Message::ChannelData(m) => {
                put_u8(&mut buf, num::CHANNEL_DATA);
                put_u32(&mut buf, m.recipient_channel);
                put_bytes(&mut buf, &m.data);
            }
            Message::ChannelExtendedData(m) => {
                put_u8(&mut buf, num::CHANNEL_EXTENDED_DATA);
                put_u32(&mut buf, m.recipient_channel);
                put_u32(&mut buf, m.data_type_code);
                put_bytes(&mut buf, &m.data);
            }
            Message::ChannelEof(m) => {
                put_u8(&mut buf, num::CHANNEL_EOF);
                put_u32(&mut buf, m.recipient_channel);
            }
            Message::ChannelClose(m) => {
                put_u8(&mut buf, num::CHANNEL_CLOSE);
                put_u32(&mut buf, m.recipient_channel);
            }
            Message::ChannelRequest(m) => {
                put_u8(&mut buf, num::CHANNEL_REQUEST);
                put_u32(&mut buf, m.recipient_channel);
                put_name(&mut buf, m.body.name());
                put_bool(&mut buf, m.want_reply);
                m.body.encode_body(&mut buf);
            }
            Message::ChannelSuccess(m) => {
                put_u8(&mut buf, num::CHANNEL_SUCCESS);
                put_u32(&mut buf, m.recipient_channel);
            }
            Message::ChannelFailure(m) => {
                put_u8(&mut buf, num::CHANNEL_FAILURE);
                put_u32(&mut buf, m.recipient_channel);
            }
        }
        buf
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let tag = get_u8(&mut buf)?;
        trace!("decoding message tag {tag}");
        let msg = match tag {
            num::DISCONNECT => Message::Disconnect(Disconnect {
                reason: get_u32(&mut buf)?,
                description: get_string(&mut buf)?,
                language: get_string(&mut buf)?,
            }),
            num::GLOBAL_REQUEST => {
                let name = get_name(&mut buf)?;
                let want_reply = get_bool(&mut buf)?;
                let body = get_rest(&mut buf);
                Message::GlobalRequest(GlobalRequest {
                    name,
                    want_reply,
                    body,
                })
            }
            num::REQUEST_SUCCESS => Message::RequestSuccess(RequestSuccess {
                data: get_rest(&mut buf),
            }),
            num::REQUEST_FAILURE => Message::RequestFailure,
            num::CHANNEL_OPEN => {
                let type_name = get_name(&mut buf)?;
                let sender_channel = get_u32(&mut buf)?;
                let initial_window = get_u32(&mut buf)?;
                let max_packet = get_u32(&mut buf)?;
                let channel_type = ChannelOpenType::decode_body(type_name, &mut buf)?;
                Message::ChannelOpen(ChannelOpen {
                    sender_channel,
                    initial_window,
                    max_packet,
                    channel_type,
                })
            }
            num::CHANNEL_OPEN_CONFIRMATION => {
                Message::ChannelOpenConfirmation(ChannelOpenConfirmation {
                    recipient_channel: get_u32(&mut buf)?,
                    sender_channel: get_u32(&mut buf)?,
                    initial_window: get_u32(&mut buf)?,
                    max_packet: get_u32(&mut buf)?,
                })
            }
            num::CHANNEL_OPEN_FAILURE => Message::ChannelOpenFailure(ChannelOpenFailure {
                recipient_channel: get_u32(&mut buf)?,
                reason_code: get_u32(&mut buf)?,
                description: get_string(&mut buf)?,
                language: get_string(&mut buf)?,
            }),
            num::CHANNEL_WINDOW_ADJUST => Message::ChannelWindowAdjust(ChannelWindowAdjust {
                recipient_channel: get_u32(&mut buf)?,
                bytes_to_add: get_u32(&mut buf)?,
            }),
            num::CHANNEL_DATA => Message::ChannelData(ChannelData {
                recipient_channel: get_u32(&mut buf)?,
                data: get_bytes(&mut buf)?,
            }),
            num::CHANNEL_EXTENDED_DATA => Message::ChannelExtendedData(ChannelExtendedData {
                recipient_channel: get_u32(&mut buf)?,
                data_type_code: get_u32(&mut buf)?,
                data: get_bytes(&mut buf)?,
            }),
            num::CHANNEL_EOF => Message::ChannelEof(ChannelEof {
                recipient_channel: get_u32(&mut buf)?,
            }),
            num::CHANNEL_CLOSE => Message::ChannelClose(ChannelClose {
                recipient_channel: get_u32(&mut buf)?,
            }),
            num::CHANNEL_REQUEST => {
                let recipient_channel = get_u32(&mut buf)?;
                let type_name = get_name(&mut buf)?;
                let want_reply = get_bool(&mut buf)?;
                let body = ChannelRequestBody::decode_body(type_name, &mut buf)?;
                Message::ChannelRequest(ChannelRequest {
                    recipient_channel,
                    want_reply,
                    body,
                })
            }
            num::CHANNEL_SUCCESS => Message::ChannelSuccess(ChannelSuccess {
                recipient_channel: get_u32(&mut buf)?,
            }),
            num::CHANNEL_FAILURE => Message::ChannelFailure(ChannelFailure {
                recipient_channel: get_u32(&mut buf)?,
            }),
            other => return Err(Error::protocol(format!("unexpected message number {other}"))),
        };
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Disconnect {
    pub reason: u32,
    pub description: String,
    pub language: String,
}

pub mod disconnect_reason {
    pub const PROTOCOL_ERROR: u32 = 2;
    pub const BY_APPLICATION: u32 = 11;
}

impl Disconnect {
    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Disconnect {
            reason: disconnect_reason::PROTOCOL_ERROR,
            description: msg.into(),
            language: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalRequest {
    pub name: Name,
    pub want_reply: bool,
    /// Raw request-specific body; interpreted by the caller based on `name`
    /// (e.g. [`TcpipForward::decode`]).
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestSuccess {
    /// Opaque reply body. Only `tcpip-forward` uses this, to carry the
    /// allocated port when the client requested port 0.
    pub data: Bytes,
}

impl RequestSuccess {
    pub fn empty() -> Self {
        RequestSuccess { data: Bytes::new() }
    }

    pub fn bound_port(port: u32) -> Self {
        let mut buf = BytesMut::new();
        put_u32(&mut buf, port);
        RequestSuccess {
            data: buf.freeze(),
        }
    }
}

/// `tcpip-forward`/`cancel-tcpip-forward` global request body.
#[derive(Debug, Clone, PartialEq)]
pub struct TcpipForward {
    pub bind_address: String,
    pub bind_port: u32,
}

impl TcpipForward {
    pub fn decode(mut body: Bytes) -> Result<Self> {
        Ok(TcpipForward {
            bind_address: get_string(&mut body)?,
            bind_port: get_u32(&mut body)?,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.bind_address);
        put_u32(&mut buf, self.bind_port);
        buf.freeze()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOpen {
    pub sender_channel: u32,
    pub initial_window: u32,
    pub max_packet: u32,
    pub channel_type: ChannelOpenType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelOpenType {
    Session,
    DirectTcpIp {
        host_to_connect: String,
        port_to_connect: u32,
        originator_address: String,
        originator_port: u32,
    },
    ForwardedTcpIp {
        address_connected: String,
        port_connected: u32,
        originator_address: String,
        originator_port: u32,
    },
    Other {
        name: Name,
        body: Bytes,
    },
}

impl ChannelOpenType {
    pub fn name(&self) -> &str {
        match self {
            ChannelOpenType::Session => crate::name::chantype::SESSION,
            ChannelOpenType::DirectTcpIp { .. } => crate::name::chantype::DIRECT_TCPIP,
            ChannelOpenType::ForwardedTcpIp { .. } => crate::name::chantype::FORWARDED_TCPIP,
            ChannelOpenType::Other { name, .. } => name.as_str(),
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            ChannelOpenType::Session => {}
            ChannelOpenType::DirectTcpIp {
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
            } => {
                put_str(buf, host_to_connect);
                put_u32(buf, *port_to_connect);
                put_str(buf, originator_address);
                put_u32(buf, *originator_port);
            }
            ChannelOpenType::ForwardedTcpIp {
                address_connected,
                port_connected,
                originator_address,
                originator_port,
            } => {
                put_str(buf, address_connected);
                put_u32(buf, *port_connected);
                put_str(buf, originator_address);
                put_u32(buf, *originator_port);
            }
            ChannelOpenType::Other { body, .. } => buf.extend_from_slice(body),
        }
    }

    fn decode_body(name: Name, buf: &mut Bytes) -> Result<Self> {
        Ok(match name.as_str() {
            crate::name::chantype::SESSION => ChannelOpenType::Session,
            crate::name::chantype::DIRECT_TCPIP => ChannelOpenType::DirectTcpIp {
                host_to_connect: get_string(buf)?,
                port_to_connect: get_u32(buf)?,
                originator_address: get_string(buf)?,
                originator_port: get_u32(buf)?,
            },
            crate::name::chantype::FORWARDED_TCPIP => ChannelOpenType::ForwardedTcpIp {
                address_connected: get_string(buf)?,
                port_connected: get_u32(buf)?,
                originator_address: get_string(buf)?,
                originator_port: get_u32(buf)?,
            },
            _ => ChannelOpenType::Other {
                name,
                body: get_rest(buf),
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOpenConfirmation {
    pub recipient_channel: u32,
    pub sender_channel: u32,
    pub initial_window: u32,
    pub max_packet: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOpenFailure {
    pub recipient_channel: u32,
    pub reason_code: u32,
    pub description: String,
    pub language: String,
}

impl ChannelOpenFailure {
    pub fn new(recipient_channel: u32, reason_code: u32, description: impl Into<String>) -> Self {
        ChannelOpenFailure {
            recipient_channel,
            reason_code,
            description: description.into(),
            language: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelWindowAdjust {
    pub recipient_channel: u32,
    pub bytes_to_add: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelData {
    pub recipient_channel: u32,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelExtendedData {
    pub recipient_channel: u32,
    pub data_type_code: u32,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEof {
    pub recipient_channel: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelClose {
    pub recipient_channel: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRequest {
    pub recipient_channel: u32,
    pub want_reply: bool,
    pub body: ChannelRequestBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelRequestBody {
    ExitStatus {
        code: u32,
    },
    ExitSignal {
        signal_name: String,
        core_dumped: bool,
        message: String,
        language: String,
    },
    PtyReq {
        term: String,
        width_chars: u32,
        height_rows: u32,
        width_px: u32,
        height_px: u32,
        modes: Bytes,
    },
    Shell,
    Exec {
        command: String,
    },
    Subsystem {
        name: String,
    },
    Env {
        name: String,
        value: String,
    },
    /// Parsed so it can be rejected cleanly; window-change handling itself
    /// is a Non-goal (spec.md §1).
    WindowChange {
        width_chars: u32,
        height_rows: u32,
        width_px: u32,
        height_px: u32,
    },
    /// Parsed so it can be rejected cleanly; signal delivery is a Non-goal.
    Signal {
        name: String,
    },
    Other {
        name: Name,
        body: Bytes,
    },
}

impl ChannelRequestBody {
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestBody::ExitStatus { .. } => crate::name::req::EXIT_STATUS,
            ChannelRequestBody::ExitSignal { .. } => crate::name::req::EXIT_SIGNAL,
            ChannelRequestBody::PtyReq { .. } => crate::name::req::PTY_REQ,
            ChannelRequestBody::Shell => crate::name::req::SHELL,
            ChannelRequestBody::Exec { .. } => crate::name::req::EXEC,
            ChannelRequestBody::Subsystem { .. } => crate::name::req::SUBSYSTEM,
            ChannelRequestBody::Env { .. } => crate::name::req::ENV,
            ChannelRequestBody::WindowChange { .. } => crate::name::req::WINDOW_CHANGE,
            ChannelRequestBody::Signal { .. } => crate::name::req::SIGNAL,
            ChannelRequestBody::Other { name, .. } => name.as_str(),
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            ChannelRequestBody::ExitStatus { code } => put_u32(buf, *code),
            ChannelRequestBody::ExitSignal {
                signal_name,
                core_dumped,
                message,
                language,
            } => {
                put_str(buf, signal_name);
                put_bool(buf, *core_dumped);
                put_str(buf, message);
                put_str(buf, language);
            }
            ChannelRequestBody::PtyReq {
                term,
                width_chars,
                height_rows,
                width_px,
                height_px,
                modes,
            } => {
                put_str(buf, term);
                put_u32(buf, *width_chars);
                put_u32(buf, *height_rows);
                put_u32(buf, *width_px);
                put_u32(buf, *height_px);
                put_bytes(buf, modes);
            }
            ChannelRequestBody::Shell => {}
            ChannelRequestBody::Exec { command } => put_str(buf, command),
            ChannelRequestBody::Subsystem { name } => put_str(buf, name),
            ChannelRequestBody::Env { name, value } => {
                put_str(buf, name);
                put_str(buf, value);
            }
            ChannelRequestBody::WindowChange {
                width_chars,
                height_rows,
                width_px,
                height_px,
            } => {
                put_u32(buf, *width_chars);
                put_u32(buf, *height_rows);
                put_u32(buf, *width_px);
                put_u32(buf, *height_px);
            }
            ChannelRequestBody::Signal { name } => put_str(buf, name),
            ChannelRequestBody::Other { body, .. } => buf.extend_from_slice(body),
        }
    }

    fn decode_body(name: Name, buf: &mut Bytes) -> Result<Self> {
        use crate::name::req::*;
        Ok(match name.as_str() {
            EXIT_STATUS => ChannelRequestBody::ExitStatus {
                code: get_u32(buf)?,
            },
            EXIT_SIGNAL => ChannelRequestBody::ExitSignal {
                signal_name: get_string(buf)?,
                core_dumped: get_bool(buf)?,
                message: get_string(buf)?,
                language: get_string(buf)?,
            },
            PTY_REQ => ChannelRequestBody::PtyReq {
                term: get_string(buf)?,
                width_chars: get_u32(buf)?,
                height_rows: get_u32(buf)?,
                width_px: get_u32(buf)?,
                height_px: get_u32(buf)?,
                modes: get_bytes(buf)?,
            },
            SHELL => ChannelRequestBody::Shell,
            EXEC => ChannelRequestBody::Exec {
                command: get_string(buf)?,
            },
            SUBSYSTEM => ChannelRequestBody::Subsystem {
                name: get_string(buf)?,
            },
            ENV => ChannelRequestBody::Env {
                name: get_string(buf)?,
                value: get_string(buf)?,
            },
            WINDOW_CHANGE => ChannelRequestBody::WindowChange {
                width_chars: get_u32(buf)?,
                height_rows: get_u32(buf)?,
                width_px: get_u32(buf)?,
                height_px: get_u32(buf)?,
            },
            SIGNAL => ChannelRequestBody::Signal {
                name: get_string(buf)?,
            },
            _ => ChannelRequestBody::Other {
                name,
                body: get_rest(buf),
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSuccess {
    pub recipient_channel: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFailure {
    pub recipient_channel: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(m: Message) {
        let encoded = m.encode().freeze();
        let decoded = Message::decode(encoded).unwrap();
        assert_eq!(decoded, m);
    }

    #[test]
    fn roundtrip_channel_data() {
        roundtrip(Message::ChannelData(ChannelData {
            recipient_channel: 3,
            data: Bytes::from_static(b"hi"),
        }));
    }

    #[test]
    fn roundtrip_channel_open_session() {
        roundtrip(Message::ChannelOpen(ChannelOpen {
            sender_channel: 0,
            initial_window: 32768,
            max_packet: 32768,
            channel_type: ChannelOpenType::Session,
        }));
    }

    #[test]
    fn roundtrip_channel_open_direct_tcpip() {
        roundtrip(Message::ChannelOpen(ChannelOpen {
            sender_channel: 1,
            initial_window: 1024,
            max_packet: 1024,
            channel_type: ChannelOpenType::DirectTcpIp {
                host_to_connect: "example.com".into(),
                port_to_connect: 80,
                originator_address: "127.0.0.1".into(),
                originator_port: 4000,
            },
        }));
    }

    #[test]
    fn roundtrip_channel_request_exec() {
        roundtrip(Message::ChannelRequest(ChannelRequest {
            recipient_channel: 2,
            want_reply: true,
            body: ChannelRequestBody::Exec {
                command: "echo hi".into(),
            },
        }));
    }

    #[test]
    fn unknown_channel_type_decodes_as_other() {
        let mut body = BytesMut::new();
        put_str(&mut body, "stuff");
        let m = Message::ChannelOpen(ChannelOpen {
            sender_channel: 9,
            initial_window: 1,
            max_packet: 1,
            channel_type: ChannelOpenType::Other {
                name: Name::from("x11"),
                body: body.freeze(),
            },
        });
        roundtrip(m);
    }

    #[test]
    fn unknown_request_type_decodes_as_other() {
        let mut body = BytesMut::new();
        put_bool(&mut body, false);
        let m = Message::ChannelRequest(ChannelRequest {
            recipient_channel: 4,
            want_reply: false,
            body: ChannelRequestBody::Other {
                name: Name::from("auth-agent-req@openssh.com"),
                body: body.freeze(),
            },
        });
        roundtrip(m);
    }

    #[test]
    fn truncated_message_is_protocol_error() {
        let mut buf = BytesMut::new();
        put_u8(&mut buf, num::CHANNEL_DATA);
        put_u32(&mut buf, 1);
        // missing length-prefixed data
        assert!(Message::decode(buf.freeze()).is_err());
    }

    #[test]
    fn window_adjust_overflow_is_caller_concern_not_codec() {
        // The codec itself has no opinion on overflow; §4.3/§8 property 7
        // is enforced by the channel table (see channel.rs).
        roundtrip(Message::ChannelWindowAdjust(ChannelWindowAdjust {
            recipient_channel: 0,
            bytes_to_add: u32::MAX,
        }));
    }
}
