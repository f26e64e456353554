//! Public key and key pair data model (spec.md §3 "PublicKey", "KeyPair").

use bytes::{Bytes, BytesMut};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::name::Name;
use crate::wire::{get_bytes, get_name, get_rest, put_bytes, put_name};

pub const SSH_NAME_ED25519: &str = "ssh-ed25519";
pub const SSH_NAME_RSA: &str = "ssh-rsa";

/// A host or identity public key. Tagged union over the algorithms this
/// crate understands, with an `Other` escape hatch for anything else so
/// unknown algorithms can still be carried (e.g. through `known_hosts`)
/// without failing to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    Ed25519 { key: [u8; 32] },
    Rsa { modulus: Bytes, exponent: Bytes },
    Other { name: Name, blob: Bytes },
}

impl PublicKey {
    pub fn algorithm_name(&self) -> &str {
        match self {
            PublicKey::Ed25519 { .. } => SSH_NAME_ED25519,
            PublicKey::Rsa { .. } => SSH_NAME_RSA,
            PublicKey::Other { name, .. } => name.as_str(),
        }
    }

    /// Encodes the canonical SSH wire form: `name` followed by
    /// algorithm-specific length-prefixed fields.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            PublicKey::Ed25519 { key } => {
                put_bytes(buf, SSH_NAME_ED25519.as_bytes());
                put_bytes(buf, key);
            }
            PublicKey::Rsa { modulus, exponent } => {
                put_bytes(buf, SSH_NAME_RSA.as_bytes());
                put_bytes(buf, exponent);
                put_bytes(buf, modulus);
            }
            PublicKey::Other { name, blob } => {
                put_name(buf, name);
                buf.extend_from_slice(blob);
            }
        }
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let name = get_name(buf)?;
        match name.as_str() {
            SSH_NAME_ED25519 => {
                let raw = get_bytes(buf)?;
                if raw.len() != 32 {
                    return Err(Error::protocol("ed25519 public key must be 32 bytes"));
                }
                let mut key = [0u8; 32];
                key.copy_from_slice(&raw);
                Ok(PublicKey::Ed25519 { key })
            }
            SSH_NAME_RSA => {
                let exponent = get_bytes(buf)?;
                let modulus = get_bytes(buf)?;
                Ok(PublicKey::Rsa { modulus, exponent })
            }
            _ => Ok(PublicKey::Other {
                name,
                blob: get_rest(buf),
            }),
        }
    }
}

/// A local identity's key pair. Secret material lives in scrub-on-drop
/// storage ([`Zeroizing`]).
pub enum KeyPair {
    Ed25519 {
        public: [u8; 32],
        secret: Zeroizing<[u8; 32]>,
    },
}

impl KeyPair {
    pub fn public_key(&self) -> PublicKey {
        match self {
            KeyPair::Ed25519 { public, .. } => PublicKey::Ed25519 { key: *public },
        }
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyPair::Ed25519 { public, .. } => f
                .debug_struct("KeyPair::Ed25519")
                .field("public", public)
                .field("secret", &"<redacted>")
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ed25519_roundtrip() {
        let key = PublicKey::Ed25519 { key: [7u8; 32] };
        let mut buf = BytesMut::new();
        key.encode(&mut buf);
        let mut r = buf.freeze();
        assert_eq!(PublicKey::decode(&mut r).unwrap(), key);
    }

    #[test]
    fn unknown_algorithm_roundtrips_as_other() {
        let key = PublicKey::Other {
            name: Name::from("ssh-ed448"),
            blob: Bytes::from_static(&[1, 2, 3]),
        };
        let mut buf = BytesMut::new();
        key.encode(&mut buf);
        let mut r = buf.freeze();
        assert_eq!(PublicKey::decode(&mut r).unwrap(), key);
    }
}
