//! Revision identifiers.
//!
//! Two kinds coexist:
//!
//! **Tree form**, used by the revision-tree scheme: a generation count
//! plus an MD5 or SHA-1 digest. ASCII looks like `123-cafebabe` (decimal
//! generation, lowercase hex digest); binary is the generation as a
//! varint followed by the raw digest.
//!
//! **Version form**, used by the version-vector scheme: a binary version
//! vector (often a single version). ASCII looks like `7b@cafebabe` -- the
//! generation is hex, not decimal -- with `*` for the local peer. The
//! binary form starts with a zero byte to distinguish it from tree form.

use std::cmp::Ordering;
use std::fmt;

use md5::Md5;
use sha1::{Digest, Sha1};

use super::error::CoreError;
use super::peer::PeerId;
use super::varint::{read_uvarint, write_uvarint};
use super::vector::VersionVector;
use super::version::Version;

/// Upper bound on digest length; anything longer is not a digest we wrote.
const MAX_DIGEST_LEN: usize = 40;

#[derive(Clone, PartialEq, Eq, Hash)]
pub enum RevId {
    /// `generation-digest` tree-style id.
    Tree { generation: u32, digest: Vec<u8> },
    /// Binary version-vector payload, marker byte included. May hold a
    /// single version or a whole vector.
    Version(Vec<u8>),
}

impl RevId {
    pub fn tree(generation: u32, digest: impl Into<Vec<u8>>) -> Result<Self, CoreError> {
        let digest = digest.into();
        if generation == 0 {
            return Err(CoreError::bad_rev_id(
                format!("{generation}-?"),
                "generation must be at least 1",
            ));
        }
        if digest.is_empty() || digest.len() > MAX_DIGEST_LEN {
            return Err(CoreError::bad_rev_id(
                format!("{generation}-?"),
                "digest length out of range",
            ));
        }
        Ok(RevId::Tree { generation, digest })
    }

    pub fn from_version(version: &Version, my_id: PeerId) -> Result<Self, CoreError> {
        let mut buf = vec![0u8];
        version.write_binary(&mut buf, my_id)?;
        Ok(RevId::Version(buf))
    }

    pub fn from_vector(vector: &VersionVector, my_id: PeerId) -> Result<Self, CoreError> {
        Ok(RevId::Version(vector.as_binary(my_id)?))
    }

    pub fn is_version(&self) -> bool {
        matches!(self, RevId::Version(_))
    }

    /// The generation count: the tree generation, or the current
    /// version's generation in version form.
    pub fn generation(&self) -> u64 {
        match self {
            RevId::Tree { generation, .. } => u64::from(*generation),
            RevId::Version(data) => VersionVector::read_current_from_binary(data)
                .map(|v| v.generation())
                .unwrap_or(0),
        }
    }

    pub fn digest(&self) -> Option<&[u8]> {
        match self {
            RevId::Tree { digest, .. } => Some(digest),
            RevId::Version(_) => None,
        }
    }

    /// The current (first) version of a version-form id.
    pub fn as_version(&self) -> Result<Version, CoreError> {
        match self {
            RevId::Version(data) => VersionVector::read_current_from_binary(data),
            RevId::Tree { .. } => Err(CoreError::invalid("not a version-form revision id")),
        }
    }

    /// The whole vector of a version-form id.
    pub fn as_vector(&self) -> Result<VersionVector, CoreError> {
        match self {
            RevId::Version(data) => VersionVector::parse_binary(data),
            RevId::Tree { .. } => Err(CoreError::invalid("not a version-form revision id")),
        }
    }

    /// Parses an ASCII revision id of either kind. A `-` means tree form;
    /// anything else must be a single version. Whole vectors (commas) are
    /// not accepted here; parse those with [`VersionVector`].
    pub fn parse(ascii: &str, my_peer: PeerId) -> Result<Self, CoreError> {
        if ascii.contains('-') {
            let (gen_str, digest_str) = ascii
                .split_once('-')
                .expect("contains('-') implies split succeeds");
            let generation: u32 = parse_decimal(gen_str)
                .ok_or_else(|| CoreError::bad_rev_id(ascii, "bad generation"))?;
            if generation == 0 {
                return Err(CoreError::bad_rev_id(ascii, "generation must be at least 1"));
            }
            let digest = parse_hex_digest(digest_str)
                .ok_or_else(|| CoreError::bad_rev_id(ascii, "digest is not lowercase hex"))?;
            RevId::tree(generation, digest)
        } else {
            let version = Version::parse_ascii(ascii, my_peer)
                .map_err(|_| CoreError::bad_rev_id(ascii, "not a revision id"))?;
            RevId::from_version(&version, PeerId::ME)
        }
    }

    /// The expanded ASCII form. A version-form id shows only its current
    /// version, even when it stores a whole vector.
    pub fn expanded(&self, my_id: PeerId) -> String {
        match self {
            RevId::Tree { generation, digest } => {
                let mut out = format!("{generation}-");
                for b in digest {
                    out.push_str(&format!("{b:02x}"));
                }
                out
            }
            RevId::Version(data) => VersionVector::read_current_from_binary(data)
                .map(|v| v.as_ascii(my_id))
                .unwrap_or_default(),
        }
    }

    /// The compact binary form.
    pub fn as_bytes(&self) -> Vec<u8> {
        match self {
            RevId::Tree { generation, digest } => {
                let mut buf = Vec::with_capacity(5 + digest.len());
                write_uvarint(&mut buf, u64::from(*generation));
                buf.extend_from_slice(digest);
                buf
            }
            RevId::Version(data) => data.clone(),
        }
    }

    /// Parses the compact binary form; a leading zero byte means version
    /// form, a nonzero varint generation means tree form.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CoreError> {
        match data.first() {
            None => Err(CoreError::corrupt("empty revision id")),
            Some(0) => {
                VersionVector::read_current_from_binary(data)?;
                Ok(RevId::Version(data.to_vec()))
            }
            Some(_) => {
                let mut rest = data;
                let generation = read_uvarint(&mut rest)
                    .filter(|&g| g != 0 && g <= u64::from(u32::MAX))
                    .ok_or_else(|| CoreError::corrupt("bad tree revision generation"))?;
                RevId::tree(generation as u32, rest)
                    .map_err(|_| CoreError::corrupt("bad tree revision digest"))
            }
        }
    }
}

impl PartialOrd for RevId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RevId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (
                RevId::Tree { generation: g1, digest: d1 },
                RevId::Tree { generation: g2, digest: d2 },
            ) => g1.cmp(g2).then_with(|| d1.cmp(d2)),
            (RevId::Version(a), RevId::Version(b)) => {
                let va = VersionVector::read_current_from_binary(a).ok();
                let vb = VersionVector::read_current_from_binary(b).ok();
                match (va, vb) {
                    (Some(va), Some(vb)) => va
                        .generation()
                        .cmp(&vb.generation())
                        .then_with(|| va.author().cmp(vb.author())),
                    _ => a.cmp(b),
                }
            }
            (RevId::Tree { .. }, RevId::Version(_)) => Ordering::Less,
            (RevId::Version(_), RevId::Tree { .. }) => Ordering::Greater,
        }
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expanded(PeerId::ME))
    }
}

impl fmt::Debug for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevId({})", self)
    }
}

fn parse_decimal(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn parse_hex_digest(s: &str) -> Option<Vec<u8>> {
    if s.is_empty() || s.len() % 2 != 0 || s.len() > 2 * MAX_DIGEST_LEN {
        return None;
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(s.len() / 2);
    for pair in bytes.chunks(2) {
        let hi = hex_nibble(pair[0])?;
        let lo = hex_nibble(pair[1])?;
        out.push((hi << 4) | lo);
    }
    Some(out)
}

fn hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}

/// Computes a new tree-form revision id for a revision being written.
///
/// The digest covers a single length byte of the parent id (clipped to
/// 255), the parent id's ASCII bytes, a deletion byte, and the body.
/// SHA-1 by default; legacy mode uses MD5 and skips the length byte when
/// the parent is empty, reproducing the historical algorithm exactly.
pub fn generate_rev_id(
    body: &[u8],
    parent: Option<&RevId>,
    deleted: bool,
    legacy: bool,
) -> Result<RevId, CoreError> {
    let parent_ascii = parent.map(|p| p.expanded(PeerId::ME)).unwrap_or_default();
    let parent_bytes = &parent_ascii.as_bytes()[..parent_ascii.len().min(255)];
    let rev_len = parent_bytes.len() as u8;
    let del_byte = u8::from(deleted);

    let digest: Vec<u8> = if legacy {
        let mut hasher = Md5::new();
        if rev_len > 0 {
            hasher.update([rev_len]);
        }
        hasher.update(parent_bytes);
        hasher.update([del_byte]);
        hasher.update(body);
        hasher.finalize().to_vec()
    } else {
        let mut hasher = Sha1::new();
        hasher.update([rev_len]);
        hasher.update(parent_bytes);
        hasher.update([del_byte]);
        hasher.update(body);
        hasher.finalize().to_vec()
    };

    let generation = match parent {
        Some(p) => p.generation() as u32 + 1,
        None => 1,
    };
    RevId::tree(generation, digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> RevId {
        RevId::parse(s, PeerId::ME).unwrap()
    }

    #[test]
    fn parses_tree_ids() {
        let r = parse("1-aa");
        assert_eq!(r.generation(), 1);
        assert_eq!(r.digest(), Some(&[0xaa][..]));
        assert_eq!(r.as_bytes(), [0x01, 0xaa]);
        assert_eq!(r.expanded(PeerId::ME), "1-aa");

        let r = parse("97-beef");
        assert_eq!(r.generation(), 97);
        assert_eq!(r.as_bytes(), [0x61, 0xbe, 0xef]);

        let r = parse("123456-1234567890abcdef");
        assert_eq!(r.generation(), 123456);
        assert_eq!(
            r.as_bytes(),
            [0xc0, 0xc4, 0x07, 0x12, 0x34, 0x56, 0x78, 0x90, 0xab, 0xcd, 0xef]
        );
        assert_eq!(r.expanded(PeerId::ME), "123456-1234567890abcdef");
    }

    #[test]
    fn rejects_malformed_tree_ids() {
        for bad in [
            "1", "1-", "1-a", "1-AA", "1-aF", "1--aa", "0-11", "-1-11", "-11", "a-11", "1-aa ",
            "z-aa", "d-aa", "7-ax", " 1-aa",
        ] {
            assert!(RevId::parse(bad, PeerId::ME).is_err(), "{bad}");
        }
    }

    #[test]
    fn parses_version_ids() {
        let r = parse("11@100");
        assert!(r.is_version());
        assert_eq!(r.generation(), 0x11);
        assert_eq!(
            r.as_version().unwrap(),
            Version::new(0x11, PeerId::new(0x100)).unwrap()
        );
        assert_eq!(r.expanded(PeerId::ME), "11@100");

        let me = parse("7b@*");
        assert_eq!(me.as_version().unwrap().peer(), Some(PeerId::ME));
    }

    #[test]
    fn revid_can_hold_a_whole_vector() {
        let vv = VersionVector::parse_ascii("11@100,2@101,1@666", PeerId::ME).unwrap();
        let rev = RevId::from_vector(&vv, PeerId::ME).unwrap();
        assert!(rev.is_version());
        assert_eq!(
            rev.as_version().unwrap(),
            Version::new(0x11, PeerId::new(0x100)).unwrap()
        );
        // Only the current version shows in the expanded form.
        assert_eq!(rev.expanded(PeerId::ME), "11@100");
        assert_eq!(rev.as_vector().unwrap().count(), 3);
    }

    #[test]
    fn binary_round_trip() {
        for id in ["1-aa", "97-beef", "3@*", "12@ffff"] {
            let rev = parse(id);
            assert_eq!(RevId::from_bytes(&rev.as_bytes()).unwrap(), rev);
        }
        assert!(RevId::from_bytes(&[]).is_err());
        assert!(RevId::from_bytes(&[0x05]).is_err()); // generation, no digest
    }

    #[test]
    fn ordering_prefers_generation_then_digest() {
        assert!(parse("2-aa") > parse("1-ff"));
        assert!(parse("2-cccc") > parse("2-bbbb"));
        assert!(parse("10-00") > parse("9-ff"));
    }

    #[test]
    fn generates_sha1_ids() {
        let r1 = generate_rev_id(b"{}", None, false, false).unwrap();
        assert_eq!(r1.generation(), 1);
        assert_eq!(r1.digest().unwrap().len(), 20);

        let r2 = generate_rev_id(b"{}", Some(&r1), false, false).unwrap();
        assert_eq!(r2.generation(), 2);
        assert_ne!(r1, r2);

        // Deterministic for identical input.
        assert_eq!(generate_rev_id(b"{}", None, false, false).unwrap(), r1);
        // Deletion changes the digest.
        assert_ne!(generate_rev_id(b"{}", None, true, false).unwrap(), r1);
    }

    #[test]
    fn legacy_mode_uses_md5() {
        let r = generate_rev_id(b"{}", None, false, true).unwrap();
        assert_eq!(r.digest().unwrap().len(), 16);
        let child = generate_rev_id(b"{}", Some(&r), false, true).unwrap();
        assert_eq!(child.generation(), 2);
        assert_eq!(child.digest().unwrap().len(), 16);
    }
}
