//! Low-level wire primitives for the connection-protocol binary payloads.
//!
//! Built over owned [`bytes::Bytes`]/[`bytes::BytesMut`] rather than
//! borrowed `&'a [u8]`: this crate decodes whole messages handed up from an
//! already-framed `MessageStream`, so there's no need for zero-copy,
//! lifetime-parameterized buffers.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::name::Name;

pub fn put_u8(buf: &mut BytesMut, v: u8) {
    buf.put_u8(v);
}

pub fn get_u8(buf: &mut Bytes) -> Result<u8> {
    if buf.is_empty() {
        return Err(Error::protocol("truncated message reading u8"));
    }
    Ok(buf.get_u8())
}

pub fn put_u32(buf: &mut BytesMut, v: u32) {
    buf.put_u32(v);
}

pub fn get_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(Error::protocol("truncated message reading u32"));
    }
    Ok(buf.get_u32())
}

pub fn put_bool(buf: &mut BytesMut, v: bool) {
    buf.put_u8(v as u8);
}

pub fn get_bool(buf: &mut Bytes) -> Result<bool> {
    Ok(get_u8(buf)? != 0)
}

/// Writes a 32-bit length-prefixed byte string.
pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Reads a 32-bit length-prefixed byte string.
pub fn get_bytes(buf: &mut Bytes) -> Result<Bytes> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(Error::protocol("truncated message reading byte string"));
    }
    Ok(buf.copy_to_bytes(len))
}

/// Reads a length-prefixed byte string and validates it as UTF-8 text.
pub fn get_string(buf: &mut Bytes) -> Result<String> {
    let raw = get_bytes(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| Error::protocol("non-UTF-8 text field"))
}

pub fn put_str(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

/// Reads a length-prefixed SSH name tag. Names are required to be ASCII by
/// RFC 4251 §6; we enforce that rather than accepting arbitrary UTF-8.
pub fn get_name(buf: &mut Bytes) -> Result<Name> {
    let raw = get_bytes(buf)?;
    if !raw.is_ascii() {
        return Err(Error::protocol("non-ASCII name tag"));
    }
    // SAFETY-free: already validated ASCII, which is always valid UTF-8.
    Ok(Name::new(String::from_utf8(raw.to_vec()).unwrap()))
}

pub fn put_name(buf: &mut BytesMut, name: &Name) {
    put_str(buf, name.as_str());
}

/// Reads out the remainder of the buffer verbatim, for `Other(..)` bodies
/// we decode but don't otherwise interpret.
pub fn get_rest(buf: &mut Bytes) -> Bytes {
    buf.copy_to_bytes(buf.remaining())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_primitives() {
        let mut buf = BytesMut::new();
        put_u32(&mut buf, 0xdead_beef);
        put_bool(&mut buf, true);
        put_str(&mut buf, "hello");
        put_name(&mut buf, &Name::from("ssh-ed25519"));

        let mut r = buf.freeze();
        assert_eq!(get_u32(&mut r).unwrap(), 0xdead_beef);
        assert!(get_bool(&mut r).unwrap());
        assert_eq!(get_string(&mut r).unwrap(), "hello");
        assert_eq!(get_name(&mut r).unwrap(), Name::from("ssh-ed25519"));
    }

    #[test]
    fn truncated_is_protocol_error() {
        let mut r = Bytes::from_static(&[0, 0, 0]);
        assert!(get_u32(&mut r).is_err());
    }
}
