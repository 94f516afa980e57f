//! Binary codec for a whole revision tree.
//!
//! Layout (version 1): a format byte, a revision count, then per
//! revision in canonical order: revision id (length-prefixed binary
//! form), flags byte, parent position (+1, 0 meaning none), sequence,
//! body (length+1-prefixed, 0 meaning no body). A trailer holds the
//! remote-revision map as (remote id, revision position) pairs. All
//! integers are varints.

use bytes::Bytes;

use super::error::CoreError;
use super::peer::RemoteId;
use super::revid::RevId;
use super::tree::{Rev, RevFlags, RevTree};
use super::varint::{read_uvarint, write_uvarint};

const FORMAT_VERSION: u8 = 1;

/// Flags that survive encoding; New and Purge are runtime-only.
fn persistent_flags(rev: &Rev) -> u8 {
    rev.flags().intersect(RevFlags::PERSISTENT).bits()
}

/// Encodes the tree in canonical order. Sorts first, so the decoded
/// tree's order is already canonical.
pub fn encode_tree(tree: &mut RevTree) -> Bytes {
    tree.sort();
    let positions: std::collections::BTreeMap<usize, usize> = tree
        .in_order()
        .iter()
        .enumerate()
        .map(|(pos, &index)| (index, pos))
        .collect();

    let mut buf = Vec::new();
    buf.push(FORMAT_VERSION);
    write_uvarint(&mut buf, tree.len() as u64);
    for &index in tree.in_order() {
        let rev = tree.rev(index);
        let rev_id = rev.rev_id().as_bytes();
        write_uvarint(&mut buf, rev_id.len() as u64);
        buf.extend_from_slice(&rev_id);
        buf.push(persistent_flags(rev));
        let parent_pos = rev.parent().map(|p| positions[&p] as u64 + 1).unwrap_or(0);
        write_uvarint(&mut buf, parent_pos);
        write_uvarint(&mut buf, rev.sequence());
        match rev.body() {
            Some(body) => {
                write_uvarint(&mut buf, body.len() as u64 + 1);
                buf.extend_from_slice(body);
            }
            None => write_uvarint(&mut buf, 0),
        }
    }

    write_uvarint(&mut buf, tree.remote_revs().len() as u64);
    for (&remote, &index) in tree.remote_revs() {
        write_uvarint(&mut buf, u64::from(remote.get()));
        write_uvarint(&mut buf, positions[&index] as u64);
    }
    Bytes::from(buf)
}

/// Decodes a tree produced by [`encode_tree`].
pub fn decode_tree(data: &[u8], prune_depth: u32) -> Result<RevTree, CoreError> {
    let mut rest = data;
    match rest.first() {
        Some(&FORMAT_VERSION) => rest = &rest[1..],
        Some(v) => {
            return Err(CoreError::corrupt(format!("unknown tree format {v}")));
        }
        None => return Err(CoreError::corrupt("empty tree data")),
    }

    let count = read_varint(&mut rest)? as usize;
    if count > data.len() {
        return Err(CoreError::corrupt("revision count exceeds input"));
    }

    let mut revs = Vec::with_capacity(count);
    for _ in 0..count {
        let rev_id_bytes = read_chunk(&mut rest)?;
        let rev_id = RevId::from_bytes(rev_id_bytes)?;
        let (flags_byte, tail) = rest
            .split_first()
            .ok_or_else(|| CoreError::corrupt("truncated revision flags"))?;
        rest = tail;
        let flags = RevFlags::from_bits(*flags_byte).intersect(RevFlags::PERSISTENT);
        let parent_pos = read_varint(&mut rest)?;
        let parent = match parent_pos {
            0 => None,
            p if (p as usize) <= count => Some(p as usize - 1),
            _ => return Err(CoreError::corrupt("parent index out of range")),
        };
        let sequence = read_varint(&mut rest)?;
        let body_len = read_varint(&mut rest)?;
        let body = if body_len == 0 {
            None
        } else {
            let body_bytes = take(&mut rest, body_len as usize - 1)?;
            Some(Bytes::copy_from_slice(body_bytes))
        };
        revs.push(RevTree::make_rev(rev_id, body, parent, sequence, flags));
    }

    let remote_count = read_varint(&mut rest)? as usize;
    let mut remote_revs = std::collections::BTreeMap::new();
    for _ in 0..remote_count {
        let remote = read_varint(&mut rest)?;
        let position = read_varint(&mut rest)? as usize;
        if position >= count {
            return Err(CoreError::corrupt("remote revision index out of range"));
        }
        let remote = u32::try_from(remote)
            .map_err(|_| CoreError::corrupt("remote id out of range"))?;
        if remote == 0 {
            return Err(CoreError::corrupt("remote id 0 is reserved"));
        }
        remote_revs.insert(RemoteId::new(remote), position);
    }
    if !rest.is_empty() {
        return Err(CoreError::corrupt("trailing bytes after tree"));
    }

    Ok(RevTree::from_parts(revs, remote_revs, prune_depth))
}

fn read_varint(rest: &mut &[u8]) -> Result<u64, CoreError> {
    read_uvarint(rest).ok_or_else(|| CoreError::corrupt("truncated varint"))
}

fn read_chunk<'a>(rest: &mut &'a [u8]) -> Result<&'a [u8], CoreError> {
    let len = read_varint(rest)? as usize;
    take(rest, len)
}

fn take<'a>(rest: &mut &'a [u8], len: usize) -> Result<&'a [u8], CoreError> {
    if rest.len() < len {
        return Err(CoreError::corrupt("truncated chunk"));
    }
    let (chunk, tail) = rest.split_at(len);
    *rest = tail;
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::peer::PeerId;

    fn id(s: &str) -> RevId {
        RevId::parse(s, PeerId::ME).unwrap()
    }

    fn sample_tree() -> RevTree {
        let mut tree = RevTree::new(20);
        tree.insert_with_parent_id(
            id("1-aa11"),
            Some(Bytes::from_static(b"{\"v\":1}")),
            RevFlags::empty(),
            None,
            false,
            false,
        )
        .unwrap();
        tree.insert_with_parent_id(
            id("2-bb22"),
            Some(Bytes::from_static(b"{\"v\":2}")),
            RevFlags::KEEP_BODY,
            Some(&id("1-aa11")),
            false,
            false,
        )
        .unwrap();
        tree.insert_with_parent_id(
            id("2-cc33"),
            Some(Bytes::from_static(b"{\"v\":3}")),
            RevFlags::empty(),
            Some(&id("1-aa11")),
            true,
            true,
        )
        .unwrap();
        let remote_rev = tree.get(&id("2-bb22")).unwrap();
        tree.set_latest_revision_on_remote(RemoteId::new(1), Some(remote_rev));
        tree.saved(4);
        tree
    }

    #[test]
    fn round_trips_structure() {
        let mut tree = sample_tree();
        let encoded = encode_tree(&mut tree);
        let mut decoded = decode_tree(&encoded, 20).unwrap();

        assert_eq!(decoded.len(), 3);
        assert!(!decoded.changed());
        let current = decoded.current().unwrap();
        let tree_current = tree.current().unwrap();
        assert_eq!(
            decoded.rev(current).rev_id(),
            tree.rev(tree_current).rev_id()
        );

        let two = decoded.get(&id("2-bb22")).unwrap();
        assert!(decoded.rev(two).keep_body());
        assert_eq!(decoded.rev(two).sequence(), 4);
        assert_eq!(
            decoded.rev(two).body().map(|b| b.as_ref()),
            Some(&b"{\"v\":2}"[..])
        );
        let parent = decoded.rev(two).parent().unwrap();
        assert_eq!(decoded.rev(parent).rev_id(), &id("1-aa11"));

        assert_eq!(
            decoded.latest_revision_on_remote(RemoteId::new(1)),
            Some(two)
        );
        assert!(decoded.has_conflict());
    }

    #[test]
    fn re_encoding_is_stable() {
        let mut tree = sample_tree();
        let first = encode_tree(&mut tree);
        let mut decoded = decode_tree(&first, 20).unwrap();
        let second = encode_tree(&mut decoded);
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_corrupt_input() {
        let mut tree = sample_tree();
        let encoded = encode_tree(&mut tree);

        assert!(decode_tree(&[], 20).is_err());
        assert!(decode_tree(&[9, 1], 20).is_err());
        assert!(decode_tree(&encoded[..encoded.len() - 1], 20).is_err());

        let mut trailing = encoded.to_vec();
        trailing.push(0);
        assert!(decode_tree(&trailing, 20).is_err());
    }
}
