//! A single version identifier: one `(generation, author)` pair.
//!
//! The ASCII form is `<hex generation>@<peer>`, where the peer is `*`
//! for the local database. A merge version (generation 0) carries a
//! base64 digest instead of a peer and is written `^<digest>`.
//! The binary form is two varints: generation, then peer id.

use std::fmt;

use super::error::CoreError;
use super::peer::PeerId;
use super::varint::{read_uvarint, write_uvarint};

/// The possible orderings of two versions or vectors.
/// Older and Newer act as one-bit flags; both together mean a conflict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionOrder {
    Same,
    Older,
    Newer,
    Conflicting,
}

impl VersionOrder {
    fn bits(self) -> u8 {
        match self {
            VersionOrder::Same => 0,
            VersionOrder::Older => 1,
            VersionOrder::Newer => 2,
            VersionOrder::Conflicting => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            0 => VersionOrder::Same,
            1 => VersionOrder::Older,
            2 => VersionOrder::Newer,
            _ => VersionOrder::Conflicting,
        }
    }

    /// Combines two orderings bitwise: `Older | Newer == Conflicting`.
    pub fn union(self, other: VersionOrder) -> VersionOrder {
        VersionOrder::from_bits(self.bits() | other.bits())
    }

    /// The ordering seen from the other operand's side.
    pub fn inverse(self) -> VersionOrder {
        match self {
            VersionOrder::Older => VersionOrder::Newer,
            VersionOrder::Newer => VersionOrder::Older,
            other => other,
        }
    }

    /// Compares two generation counts.
    pub fn of_generations(a: u64, b: u64) -> VersionOrder {
        match a.cmp(&b) {
            std::cmp::Ordering::Greater => VersionOrder::Newer,
            std::cmp::Ordering::Less => VersionOrder::Older,
            std::cmp::Ordering::Equal => VersionOrder::Same,
        }
    }
}

/// The author field of a version: a peer, or (for a merge version only)
/// the base64 digest of the merged vector and body.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Author {
    Peer(PeerId),
    MergeDigest(String),
}

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Author::Peer(p) => write!(f, "{p}"),
            Author::MergeDigest(d) => write!(f, "^{d}"),
        }
    }
}

impl fmt::Debug for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// One version: the number of times `author` has changed the document.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Version {
    generation: u64,
    author: Author,
}

impl Version {
    /// A regular version. The generation must be at least 1.
    pub fn new(generation: u64, peer: PeerId) -> Result<Self, CoreError> {
        if generation == 0 {
            return Err(CoreError::bad_rev_id(
                format!("0@{peer}"),
                "generation must be at least 1",
            ));
        }
        Ok(Version {
            generation,
            author: Author::Peer(peer),
        })
    }

    /// A merge version: generation 0 with a digest in the author field.
    /// Only ever valid at the head of a merged vector.
    pub(crate) fn merge(digest: String) -> Self {
        Version {
            generation: 0,
            author: Author::MergeDigest(digest),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn author(&self) -> &Author {
        &self.author
    }

    /// The authoring peer, unless this is a merge version.
    pub fn peer(&self) -> Option<PeerId> {
        match self.author {
            Author::Peer(p) => Some(p),
            Author::MergeDigest(_) => None,
        }
    }

    pub fn is_merge(&self) -> bool {
        matches!(self.author, Author::MergeDigest(_))
    }

    /// Parses the ASCII form. When `my_peer` is a real id, an absolute
    /// author equal to it collapses to the local `*` form.
    pub fn parse_ascii(s: &str, my_peer: PeerId) -> Result<Self, CoreError> {
        if let Some(digest) = s.strip_prefix('^') {
            if digest.is_empty() || !digest.bytes().all(is_base64_byte) {
                return Err(CoreError::bad_rev_id(s, "malformed merge digest"));
            }
            return Ok(Version::merge(digest.to_string()));
        }
        let (gen_str, peer_str) = s
            .split_once('@')
            .ok_or_else(|| CoreError::bad_rev_id(s, "missing `@` separator"))?;
        let generation = super::peer::parse_hex(gen_str)
            .filter(|&g| g != 0)
            .ok_or_else(|| CoreError::bad_rev_id(s, "bad generation"))?;
        let mut peer = PeerId::parse_ascii(peer_str)
            .map_err(|_| CoreError::bad_rev_id(s, "bad peer id"))?;
        if !my_peer.is_me() && peer == my_peer {
            peer = PeerId::ME;
        }
        Version::new(generation, peer)
    }

    /// Writes the ASCII form. A local author is written as `my_id`, or as
    /// `*` when `my_id` is the placeholder.
    pub fn write_ascii(&self, out: &mut String, my_id: PeerId) {
        use std::fmt::Write;
        match &self.author {
            Author::MergeDigest(d) => {
                let _ = write!(out, "^{d}");
            }
            Author::Peer(peer) => {
                let author = if peer.is_me() { my_id } else { *peer };
                let _ = write!(out, "{:x}@{author}", self.generation);
            }
        }
    }

    pub fn as_ascii(&self, my_id: PeerId) -> String {
        let mut out = String::new();
        self.write_ascii(&mut out, my_id);
        out
    }

    /// Reads one binary version from the front of `data`.
    pub fn read_binary(data: &mut &[u8]) -> Result<Self, CoreError> {
        let generation = read_uvarint(data)
            .ok_or_else(|| CoreError::bad_vector("truncated binary version"))?;
        let peer = read_uvarint(data)
            .ok_or_else(|| CoreError::bad_vector("truncated binary version"))?;
        if generation == 0 {
            return Err(CoreError::bad_vector("generation 0 in binary version"));
        }
        Version::new(generation, PeerId::new(peer))
    }

    /// Writes the binary form, substituting `my_id` for a local author.
    /// Merge versions have no binary form.
    pub fn write_binary(&self, out: &mut Vec<u8>, my_id: PeerId) -> Result<(), CoreError> {
        let peer = match &self.author {
            Author::Peer(p) if p.is_me() => my_id,
            Author::Peer(p) => *p,
            Author::MergeDigest(_) => {
                return Err(CoreError::bad_vector("merge version has no binary form"))
            }
        };
        write_uvarint(out, self.generation);
        write_uvarint(out, peer.id());
        Ok(())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_ascii(PeerId::ME))
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self)
    }
}

fn is_base64_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=')
}
