//! Version vectors: an array of versions in reverse chronological order.
//!
//! The first entry is the most recently mutated peer; no two entries may
//! share an author; a merge version (generation 0) may only appear first.
//! The ASCII form is comma-separated versions. The binary form is a zero
//! marker byte followed by consecutive binary versions (the marker
//! distinguishes a vector from a tree-style revision id, whose first byte
//! is a nonzero varint generation).

use base64::Engine;
use sha1::{Digest, Sha1};

use super::error::CoreError;
use super::peer::PeerId;
use super::version::{Author, Version, VersionOrder};

/// Leading byte of every binary vector.
const BINARY_MARKER: u8 = 0;

#[derive(Clone, Default, PartialEq, Eq)]
pub struct VersionVector {
    versions: Vec<Version>,
}

impl VersionVector {
    pub fn new() -> Self {
        VersionVector::default()
    }

    pub fn count(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    /// The current (most recent) version.
    pub fn current(&self) -> Option<&Version> {
        self.versions.first()
    }

    fn position_of(&self, author: &Author) -> Option<usize> {
        self.versions.iter().position(|v| v.author() == author)
    }

    fn position_of_peer(&self, peer: PeerId) -> Option<usize> {
        self.versions.iter().position(|v| v.peer() == Some(peer))
    }

    /// The generation recorded for `author`, or 0 if absent.
    pub fn generation_of(&self, author: &Author) -> u64 {
        self.position_of(author)
            .map(|i| self.versions[i].generation())
            .unwrap_or(0)
    }

    /// The generation recorded for `peer`, or 0 if absent.
    pub fn generation_of_peer(&self, peer: PeerId) -> u64 {
        self.position_of_peer(peer)
            .map(|i| self.versions[i].generation())
            .unwrap_or(0)
    }

    //---- Comparison

    /// Compares this vector to another, peer by peer over the union of
    /// both vectors' authors, combining per-peer orderings bitwise and
    /// short-circuiting once a conflict is established.
    pub fn compare_to(&self, other: &VersionVector) -> VersionOrder {
        let mut order = VersionOrder::Same;
        for v in &self.versions {
            let theirs = other.generation_of(v.author());
            order = order.union(VersionOrder::of_generations(v.generation(), theirs));
            if order == VersionOrder::Conflicting {
                return order;
            }
        }
        for v in &other.versions {
            if self.position_of(v.author()).is_none() {
                order = order.union(VersionOrder::Older);
                if order == VersionOrder::Conflicting {
                    return order;
                }
            }
        }
        order
    }

    /// Compares this vector against a single version, i.e. against a
    /// vector whose current version is `v`. Never returns Conflicting.
    ///
    /// The rule is deliberately asymmetric: the single version matches
    /// only when it names this vector's current author at the current
    /// generation. An absent author means this vector is older; a lower
    /// generation likewise; an equal generation anywhere but the head
    /// still means this vector has moved on and is newer.
    pub fn compare_to_version(&self, v: &Version) -> VersionOrder {
        match self.position_of(v.author()) {
            None => VersionOrder::Older,
            Some(i) => {
                let mine = &self.versions[i];
                if mine.generation() < v.generation() {
                    VersionOrder::Older
                } else if mine.generation() == v.generation() && i == 0 {
                    VersionOrder::Same
                } else {
                    VersionOrder::Newer
                }
            }
        }
    }

    //---- Mutation

    /// Increments the generation of `peer` (starting from 1 if absent)
    /// and moves its entry to the front.
    pub fn increment_generation(&mut self, peer: PeerId) -> Result<(), CoreError> {
        let next = match self.position_of_peer(peer) {
            Some(i) => {
                if self.versions[i].is_merge() {
                    return Err(CoreError::bad_vector("cannot increment a merge version"));
                }
                let next_generation = self.versions[i].generation() + 1;
                self.versions.remove(i);
                next_generation
            }
            None => 1,
        };
        self.versions.insert(0, Version::new(next, peer)?);
        Ok(())
    }

    /// Adds a version at the front, removing any earlier version by the
    /// same author. Fails if an equal-or-newer version by that author is
    /// already present.
    pub fn add(&mut self, version: Version) -> bool {
        if let Some(i) = self.position_of(version.author()) {
            if self.versions[i].generation() >= version.generation() {
                return false;
            }
            self.versions.remove(i);
        }
        self.versions.insert(0, version);
        true
    }

    /// Appends a version at the oldest position.
    pub fn push_back(&mut self, version: Version) -> Result<(), CoreError> {
        if self.position_of(version.author()).is_some() {
            return Err(CoreError::bad_vector("duplicate author in vector"));
        }
        if version.is_merge() && !self.versions.is_empty() {
            return Err(CoreError::bad_vector("merge version must be first"));
        }
        self.versions.push(version);
        Ok(())
    }

    /// Truncates to the `max_count` newest entries.
    pub fn limit_count(&mut self, max_count: usize) {
        self.versions.truncate(max_count);
    }

    /// True if no author is the local placeholder.
    pub fn is_expanded(&self) -> bool {
        self.position_of_peer(PeerId::ME).is_none()
    }

    /// Replaces the local placeholder author with `my_id`.
    pub fn expand_my_peer_id(&mut self, my_id: PeerId) -> Result<(), CoreError> {
        if my_id.is_me() {
            return Ok(());
        }
        if let Some(i) = self.position_of_peer(PeerId::ME) {
            if self.position_of_peer(my_id).is_some() {
                return Err(CoreError::bad_vector("expansion would duplicate author"));
            }
            let generation = self.versions[i].generation();
            self.versions[i] = Version::new(generation, my_id)?;
        }
        Ok(())
    }

    /// Replaces `my_id` with the local placeholder author.
    pub fn compact_my_peer_id(&mut self, my_id: PeerId) -> Result<(), CoreError> {
        if my_id.is_me() {
            return Ok(());
        }
        if let Some(i) = self.position_of_peer(my_id) {
            let generation = self.versions[i].generation();
            self.versions[i] = Version::new(generation, PeerId::ME)?;
        }
        Ok(())
    }

    //---- Merging

    /// A vector that dominates both inputs: every author present, at the
    /// larger of the two generations. The relative order walks the two
    /// inputs in parallel and is not canonical; comparison is per-author
    /// so the ordering does not affect correctness. Merge heads are
    /// identity stubs, not authors, and are not carried over.
    pub fn merged_with(&self, other: &VersionVector) -> VersionVector {
        let mut result = VersionVector::new();
        let mut push = |v: &Version| {
            if result.position_of(v.author()).is_none() {
                result.versions.push(v.clone());
            }
        };
        let longest = self.versions.len().max(other.versions.len());
        for i in 0..longest {
            if let Some(mine) = self.versions.get(i) {
                if !mine.is_merge() && mine.generation() >= other.generation_of(mine.author()) {
                    push(mine);
                }
            }
            if let Some(theirs) = other.versions.get(i) {
                if !theirs.is_merge() && theirs.generation() > self.generation_of(theirs.author()) {
                    push(theirs);
                }
            }
        }
        result
    }

    /// The canonical ASCII form used as digest input: authors expanded
    /// (`*` becomes `my_id`) and entries sorted ascending by author.
    pub fn canonical_ascii(&self, my_id: PeerId) -> Result<String, CoreError> {
        let mut copy = self.clone();
        copy.expand_my_peer_id(my_id)?;
        copy.versions.sort_by(|a, b| a.author().cmp(b.author()));
        Ok(copy.as_ascii(PeerId::ME))
    }

    /// Prepends a merge version identifying a conflict resolution:
    /// generation 0 with the base64 SHA-1 of the canonical ASCII form,
    /// a NUL byte, and the merged revision body.
    pub fn insert_merge_rev_id(&mut self, my_id: PeerId, body: &[u8]) -> Result<(), CoreError> {
        let canonical = self.canonical_ascii(my_id)?;
        let mut hasher = Sha1::new();
        hasher.update(canonical.as_bytes());
        hasher.update([0u8]);
        hasher.update(body);
        let digest = base64::engine::general_purpose::STANDARD.encode(hasher.finalize());
        self.versions.insert(0, Version::merge(digest));
        Ok(())
    }

    //---- Deltas

    /// A vector expressing the changes from `base` to this one, or None
    /// if `base` is not older-or-equal.
    pub fn delta_from(&self, base: &VersionVector) -> Option<VersionVector> {
        match base.compare_to(self) {
            VersionOrder::Same | VersionOrder::Older => {}
            _ => return None,
        }
        let versions = self
            .versions
            .iter()
            .filter(|v| v.generation() > base.generation_of(v.author()))
            .cloned()
            .collect();
        Some(VersionVector { versions })
    }

    /// Applies a delta produced by [`delta_from`](Self::delta_from) on a
    /// newer vector: `a.by_applying_delta(&b.delta_from(&a)?) == b`.
    pub fn by_applying_delta(&self, delta: &VersionVector) -> Result<VersionVector, CoreError> {
        let mut result = VersionVector::new();
        for v in &delta.versions {
            if v.is_merge() {
                return Err(CoreError::bad_vector("merge version in delta"));
            }
            if v.generation() <= self.generation_of(v.author()) {
                return Err(CoreError::bad_vector("delta does not advance its authors"));
            }
            result.push_back(v.clone())?;
        }
        for v in &self.versions {
            if result.position_of(v.author()).is_none() {
                result.versions.push(v.clone());
            }
        }
        Ok(result)
    }

    //---- ASCII codec

    /// Parses the comma-separated ASCII form. When `my_peer` is a real
    /// id, absolute occurrences of it collapse to the local placeholder.
    pub fn parse_ascii(s: &str, my_peer: PeerId) -> Result<Self, CoreError> {
        if s.contains('\0') {
            return Err(CoreError::bad_vector("embedded NUL in vector string"));
        }
        let mut vector = VersionVector::new();
        if s.is_empty() {
            return Ok(vector);
        }
        for (i, part) in s.split(',').enumerate() {
            let version = Version::parse_ascii(part, my_peer)?;
            if version.is_merge() && i != 0 {
                return Err(CoreError::bad_vector("merge version must be first"));
            }
            vector.push_back(version)?;
        }
        Ok(vector)
    }

    /// Writes the ASCII form. Local authors are written as `my_id`
    /// (or `*` when `my_id` is the placeholder).
    pub fn as_ascii(&self, my_id: PeerId) -> String {
        let mut out = String::new();
        for (i, v) in self.versions.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            v.write_ascii(&mut out, my_id);
        }
        out
    }

    //---- Binary codec

    /// Parses the binary form: a zero marker byte then binary versions.
    pub fn parse_binary(data: &[u8]) -> Result<Self, CoreError> {
        let mut rest = data;
        if rest.first() != Some(&BINARY_MARKER) {
            return Err(CoreError::bad_vector("missing binary vector marker"));
        }
        rest = &rest[1..];
        let mut vector = VersionVector::new();
        while !rest.is_empty() {
            let version = Version::read_binary(&mut rest)?;
            vector.push_back(version)?;
        }
        Ok(vector)
    }

    /// Reads only the current (first) version from binary form.
    pub fn read_current_from_binary(data: &[u8]) -> Result<Version, CoreError> {
        let mut rest = data;
        if rest.first() != Some(&BINARY_MARKER) {
            return Err(CoreError::bad_vector("missing binary vector marker"));
        }
        rest = &rest[1..];
        Version::read_binary(&mut rest)
    }

    /// Writes the binary form, substituting `my_id` for local authors.
    /// Merge heads have no binary form and are rejected.
    pub fn as_binary(&self, my_id: PeerId) -> Result<Vec<u8>, CoreError> {
        let mut out = vec![BINARY_MARKER];
        for v in &self.versions {
            v.write_binary(&mut out, my_id)?;
        }
        Ok(out)
    }

    //---- History arrays

    /// Builds a vector from a replicator history array, newest first.
    /// The first entry may be a whole vector; the rest are single older
    /// versions appended in order.
    pub fn read_history(history: &[&str], my_peer: PeerId) -> Result<Self, CoreError> {
        let Some((newest, older)) = history.split_first() else {
            return Err(CoreError::bad_vector("empty history"));
        };
        let mut vector = VersionVector::parse_ascii(newest, my_peer)?;
        for entry in older {
            let version = Version::parse_ascii(entry, my_peer)?;
            vector.push_back(version)?;
        }
        Ok(vector)
    }
}

impl Version {
    /// How a vector whose current version is `self` relates to `vv`.
    /// The mirror image of [`VersionVector::compare_to_version`]; never
    /// returns Conflicting.
    pub fn compare_to_vector(&self, vv: &VersionVector) -> VersionOrder {
        vv.compare_to_version(self).inverse()
    }
}

impl std::fmt::Display for VersionVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_ascii(PeerId::ME))
    }
}

impl std::fmt::Debug for VersionVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VersionVector({})", self)
    }
}
