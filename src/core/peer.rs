//! Peer and remote identifiers.
//!
//! PeerId: an opaque 64-bit id of a writer. Zero is reserved for the
//! local database ("me") and is written as `*` in ASCII.
//! RemoteId: a slot number identifying a tracked remote database.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::CoreError;

/// Identifier of a peer (writer) that authors versions.
///
/// The local database is `PeerId::ME` (id 0) until it learns its real id;
/// serialisation substitutes the real id on the way out and `*` stands in
/// for it in relative ASCII form. `PeerId::LEGACY` is the reserved id
/// assigned to versions migrated from a pre-vector store.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(u64);

impl PeerId {
    /// The local database.
    pub const ME: PeerId = PeerId(0);

    /// Source of versions migrated from a rev-tree store.
    pub const LEGACY: PeerId = PeerId(0x777_7777);

    pub const fn new(id: u64) -> Self {
        PeerId(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }

    pub fn is_me(self) -> bool {
        self.0 == 0
    }

    pub fn is_legacy(self) -> bool {
        self == PeerId::LEGACY
    }

    /// Parses the ASCII form: `*` for me, otherwise lowercase hex.
    /// An explicit id of zero is invalid; it must be written as `*`.
    pub fn parse_ascii(s: &str) -> Result<Self, CoreError> {
        if s == "*" {
            return Ok(PeerId::ME);
        }
        let id = parse_hex(s)
            .ok_or_else(|| CoreError::bad_rev_id(s, "peer id is not lowercase hex"))?;
        if id == 0 {
            return Err(CoreError::bad_rev_id(s, "peer id 0 must be written as `*`"));
        }
        Ok(PeerId(id))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_me() {
            write!(f, "*")
        } else {
            write!(f, "{:x}", self.0)
        }
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

/// Parses a non-empty lowercase hex string into a u64.
pub(crate) fn parse_hex(s: &str) -> Option<u64> {
    if s.is_empty() || s.len() > 16 {
        return None;
    }
    let mut value: u64 = 0;
    for b in s.bytes() {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            _ => return None,
        };
        value = (value << 4) | u64::from(digit);
    }
    Some(value)
}

/// Identifier of a tracked remote database. Slot 0 is the local
/// current-state slot in the vector scheme.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(u32);

impl RemoteId {
    pub const LOCAL: RemoteId = RemoteId(0);

    /// The remote the upgrader treats as the replication base.
    pub const DEFAULT: RemoteId = RemoteId(1);

    pub const fn new(id: u32) -> Self {
        RemoteId(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn is_local(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_star_and_hex() {
        assert_eq!(PeerId::parse_ascii("*").unwrap(), PeerId::ME);
        assert_eq!(PeerId::parse_ascii("cafebabe").unwrap(), PeerId::new(0xcafebabe));
        assert_eq!(PeerId::parse_ascii("7777777").unwrap(), PeerId::LEGACY);
    }

    #[test]
    fn rejects_zero_uppercase_and_garbage() {
        assert!(PeerId::parse_ascii("0").is_err());
        assert!(PeerId::parse_ascii("CAFE").is_err());
        assert!(PeerId::parse_ascii("").is_err());
        assert!(PeerId::parse_ascii("12g4").is_err());
    }

    #[test]
    fn displays_relative_form() {
        assert_eq!(PeerId::ME.to_string(), "*");
        assert_eq!(PeerId::new(0x100).to_string(), "100");
    }
}
