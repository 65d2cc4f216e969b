//! Content-addressed node identifiers (spec §3).
//!
//! A node is named by 32 bytes of hash-friendly opaque data. The *internal*
//! form is that raw byte array, used as a hash map key; the *external* form
//! is a lowercase hex string suitable for logging, config files and the
//! wire (where identifiers travel as length-prefixed byte strings, see
//! `codec::frame`).

use std::fmt;

pub const LEN: usize = 32;

/// A content-addressed node identifier.
///
/// `Identifier::INVALID` is the reserved all-zero value: no proxy may ever
/// be registered under it, and it is rejected wherever an identifier is
/// accepted from the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier([u8; LEN]);

impl Identifier {
    pub const INVALID: Identifier = Identifier([0u8; LEN]);

    pub fn from_bytes(bytes: [u8; LEN]) -> Self {
        Self(bytes)
    }

    /// Derives an identifier from arbitrary seed material (e.g. a node's
    /// static public key) using a simple length-extension-resistant fold;
    /// real key material should come from the synchronizer's public key,
    /// not this helper — it exists for bootstrap/test seeding.
    pub fn derive(seed: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(seed);
        let digest = hasher.finalize();
        let mut bytes = [0u8; LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// The internal, hash-friendly form: raw bytes, used as the manager's
    /// primary map key.
    pub fn internal(&self) -> &[u8; LEN] {
        &self.0
    }

    /// The external, printable form: lowercase hex.
    pub fn external(&self) -> String {
        hex_encode(&self.0)
    }

    pub fn parse_external(s: &str) -> Option<Self> {
        if s.len() != LEN * 2 {
            return None;
        }
        let mut bytes = [0u8; LEN];
        for (i, chunk) in bytes.iter_mut().enumerate() {
            *chunk = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; LEN] = bytes.try_into().ok()?;
        Some(Self(array))
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", &self.external()[..8])
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.external())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_round_trips() {
        let id = Identifier::derive(b"node-a");
        let external = id.external();
        assert_eq!(Identifier::parse_external(&external), Some(id));
    }

    #[test]
    fn invalid_is_reserved() {
        assert!(!Identifier::INVALID.is_valid());
        assert!(Identifier::derive(b"anything").is_valid());
    }

    #[test]
    fn distinct_seeds_produce_distinct_identifiers() {
        assert_ne!(Identifier::derive(b"a"), Identifier::derive(b"b"));
    }
}
