//! The revision tree: every stored revision of one document, linked by
//! parent pointers into a tree rooted at the first write.
//!
//! Revisions live in an append-only arena; parents are identified by
//! arena index, which stays stable across sorting. `compact` (run by
//! prune and purge) rewrites indices and is the only operation that
//! invalidates them.

use std::collections::BTreeMap;

use bytes::Bytes;
use thiserror::Error;

use super::peer::RemoteId;
use super::revid::RevId;

/// Index of a revision in its tree's arena.
pub type RevIndex = usize;

/// Default prune bound for a document's tree.
pub const DEFAULT_MAX_REV_TREE_DEPTH: u32 = 20;

/// Per-revision flags. Leaf/New/Purge are maintained by the tree itself;
/// the persistent flags (Deleted, Closed, HasAttachments, KeepBody,
/// IsConflict) survive encoding.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct RevFlags(u8);

impl RevFlags {
    pub const DELETED: RevFlags = RevFlags(0x01);
    pub const LEAF: RevFlags = RevFlags(0x02);
    pub const NEW: RevFlags = RevFlags(0x04);
    pub const HAS_ATTACHMENTS: RevFlags = RevFlags(0x08);
    pub const KEEP_BODY: RevFlags = RevFlags(0x10);
    pub const IS_CONFLICT: RevFlags = RevFlags(0x20);
    pub const CLOSED: RevFlags = RevFlags(0x40);
    pub const PURGE: RevFlags = RevFlags(0x80);

    pub(crate) const PERSISTENT: RevFlags = RevFlags(0x01 | 0x02 | 0x08 | 0x10 | 0x20 | 0x40);

    pub fn empty() -> RevFlags {
        RevFlags(0)
    }

    pub fn contains(self, other: RevFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: RevFlags) -> RevFlags {
        RevFlags(self.0 | other.0)
    }

    pub fn intersect(self, other: RevFlags) -> RevFlags {
        RevFlags(self.0 & other.0)
    }

    pub fn without(self, other: RevFlags) -> RevFlags {
        RevFlags(self.0 & !other.0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> RevFlags {
        RevFlags(bits)
    }
}

impl std::fmt::Debug for RevFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (RevFlags::DELETED, "Deleted"),
            (RevFlags::LEAF, "Leaf"),
            (RevFlags::NEW, "New"),
            (RevFlags::HAS_ATTACHMENTS, "HasAttachments"),
            (RevFlags::KEEP_BODY, "KeepBody"),
            (RevFlags::IS_CONFLICT, "IsConflict"),
            (RevFlags::CLOSED, "Closed"),
            (RevFlags::PURGE, "Purge"),
        ];
        let mut first = true;
        write!(f, "RevFlags(")?;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        write!(f, ")")
    }
}

/// One revision in a tree. Owned by exactly one `RevTree`.
#[derive(Clone, Debug)]
pub struct Rev {
    rev_id: RevId,
    body: Option<Bytes>,
    parent: Option<RevIndex>,
    sequence: u64,
    flags: RevFlags,
}

impl Rev {
    pub fn rev_id(&self) -> &RevId {
        &self.rev_id
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn parent(&self) -> Option<RevIndex> {
        self.parent
    }

    /// External store sequence; 0 until first saved.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn flags(&self) -> RevFlags {
        self.flags
    }

    pub fn is_leaf(&self) -> bool {
        self.flags.contains(RevFlags::LEAF)
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.contains(RevFlags::DELETED)
    }

    pub fn is_closed(&self) -> bool {
        self.flags.contains(RevFlags::CLOSED)
    }

    pub fn is_conflict(&self) -> bool {
        self.flags.contains(RevFlags::IS_CONFLICT)
    }

    pub fn is_new(&self) -> bool {
        self.flags.contains(RevFlags::NEW)
    }

    pub fn keep_body(&self) -> bool {
        self.flags.contains(RevFlags::KEEP_BODY)
    }

    pub fn has_attachments(&self) -> bool {
        self.flags.contains(RevFlags::HAS_ATTACHMENTS)
    }

    fn marked_for_purge(&self) -> bool {
        self.flags.contains(RevFlags::PURGE)
    }

    fn add_flag(&mut self, flag: RevFlags) {
        self.flags = self.flags.union(flag);
    }

    fn clear_flag(&mut self, flag: RevFlags) {
        self.flags = self.flags.without(flag);
    }
}

/// Failure modes of tree mutation, mapped to HTTP-style statuses at the
/// crate boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("revision generation does not follow its parent")]
    BadGeneration,
    #[error("revision history is malformed")]
    BadHistory,
    #[error("parent revision not found")]
    ParentNotFound,
    #[error("revision would create a conflict")]
    WouldConflict,
    #[error("revision tree was loaded without its revisions")]
    RevsUnavailable,
}

/// Outcome of an insertion that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inserted {
    /// A new live revision (201 at the boundary).
    Created(RevIndex),
    /// A new deletion revision (200 at the boundary).
    Tombstone(RevIndex),
    /// The revision was already present; nothing changed (200).
    Exists(RevIndex),
}

impl Inserted {
    pub fn index(&self) -> RevIndex {
        match *self {
            Inserted::Created(i) | Inserted::Tombstone(i) | Inserted::Exists(i) => i,
        }
    }

    pub fn is_new(&self) -> bool {
        !matches!(self, Inserted::Exists(_))
    }
}

#[derive(Clone, Debug, Default)]
pub struct RevTree {
    revs: Vec<Rev>,
    /// Arena indices in canonical (sorted) order once `sorted` is true.
    order: Vec<RevIndex>,
    remote_revs: BTreeMap<RemoteId, RevIndex>,
    sorted: bool,
    changed: bool,
    /// Metadata-only mode: the record was loaded without its revisions.
    unknown: bool,
    prune_depth: u32,
}

impl RevTree {
    pub fn new(prune_depth: u32) -> Self {
        RevTree {
            sorted: true,
            prune_depth: prune_depth.max(1),
            ..RevTree::default()
        }
    }

    /// A placeholder for a record loaded without its revision data.
    pub fn unknown(prune_depth: u32) -> Self {
        RevTree {
            unknown: true,
            ..RevTree::new(prune_depth)
        }
    }

    pub(crate) fn from_parts(
        revs: Vec<Rev>,
        remote_revs: BTreeMap<RemoteId, RevIndex>,
        prune_depth: u32,
    ) -> Self {
        let order = (0..revs.len()).collect();
        RevTree {
            revs,
            order,
            remote_revs,
            sorted: true,
            changed: false,
            unknown: false,
            prune_depth: prune_depth.max(1),
        }
    }

    pub(crate) fn make_rev(
        rev_id: RevId,
        body: Option<Bytes>,
        parent: Option<RevIndex>,
        sequence: u64,
        flags: RevFlags,
    ) -> Rev {
        Rev {
            rev_id,
            body: body.map(aligned_body),
            parent,
            sequence,
            flags,
        }
    }

    pub fn len(&self) -> usize {
        self.revs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revs.is_empty()
    }

    pub fn is_unknown(&self) -> bool {
        self.unknown
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub(crate) fn set_changed(&mut self, changed: bool) {
        self.changed = changed;
    }

    pub fn prune_depth(&self) -> u32 {
        self.prune_depth
    }

    pub fn set_prune_depth(&mut self, depth: u32) {
        self.prune_depth = depth.max(1);
    }

    pub fn rev(&self, index: RevIndex) -> &Rev {
        &self.revs[index]
    }

    //---- Lookup

    pub fn get(&self, rev_id: &RevId) -> Option<RevIndex> {
        self.revs.iter().position(|r| &r.rev_id == rev_id)
    }

    pub fn get_by_sequence(&self, sequence: u64) -> Option<RevIndex> {
        self.revs.iter().position(|r| r.sequence == sequence)
    }

    /// The canonical current revision: index 0 after sorting.
    pub fn current(&mut self) -> Option<RevIndex> {
        self.sort();
        self.order.first().copied()
    }

    /// Arena indices in canonical order. Only meaningful after `sort`.
    pub fn in_order(&self) -> &[RevIndex] {
        &self.order
    }

    /// The revision after `index` in canonical order.
    pub fn next_in_order(&self, index: RevIndex) -> Option<RevIndex> {
        let pos = self.order.iter().position(|&i| i == index)?;
        self.order.get(pos + 1).copied()
    }

    //---- Conflicts

    /// A revision is active if it is a leaf and either not a deletion or
    /// the latest revision some remote has acknowledged. Tombstones cap
    /// conflicting branches, so they only count when a remote insists
    /// they are current.
    pub fn is_active(&self, index: RevIndex) -> bool {
        let rev = &self.revs[index];
        rev.is_leaf() && (!rev.is_deleted() || self.is_latest_remote_revision(index))
    }

    /// More than one active revision means a conflict.
    pub fn has_conflict(&self) -> bool {
        if self.revs.len() < 2 {
            return false;
        }
        if self.sorted {
            self.order.len() > 1 && self.is_active(self.order[1])
        } else {
            let mut active = 0;
            for index in 0..self.revs.len() {
                if self.is_active(index) {
                    active += 1;
                    if active > 1 {
                        return true;
                    }
                }
            }
            false
        }
    }

    //---- Ancestry

    /// The revision and its ancestors, newest first.
    pub fn history(&self, index: RevIndex) -> Vec<RevIndex> {
        let mut chain = Vec::new();
        let mut cursor = Some(index);
        while let Some(i) = cursor {
            chain.push(i);
            cursor = self.revs[i].parent;
        }
        chain
    }

    pub fn is_ancestor_of(&self, ancestor: RevIndex, descendant: RevIndex) -> bool {
        let mut cursor = Some(descendant);
        while let Some(i) = cursor {
            if i == ancestor {
                return true;
            }
            cursor = self.revs[i].parent;
        }
        false
    }

    /// The deepest revision that is an ancestor of both, if any.
    pub fn common_ancestor(&self, a: RevIndex, b: RevIndex) -> Option<RevIndex> {
        let mut cursor = Some(b);
        while let Some(i) = cursor {
            if self.is_ancestor_of(i, a) {
                return Some(i);
            }
            cursor = self.revs[i].parent;
        }
        None
    }

    //---- Insertion

    /// Lowest-level insert. Does no validity checking; always inserts.
    fn insert_unchecked(
        &mut self,
        rev_id: RevId,
        body: Option<Bytes>,
        parent: Option<RevIndex>,
        flags: RevFlags,
        mark_conflict: bool,
    ) -> RevIndex {
        let mut flags = flags.intersect(
            RevFlags::DELETED
                .union(RevFlags::CLOSED)
                .union(RevFlags::HAS_ATTACHMENTS)
                .union(RevFlags::KEEP_BODY),
        );
        if flags.contains(RevFlags::CLOSED) {
            flags = flags.union(RevFlags::DELETED);
        }
        let flags = flags.union(RevFlags::LEAF).union(RevFlags::NEW);

        let index = self.revs.len();
        self.revs
            .push(RevTree::make_rev(rev_id, body, parent, 0, flags));

        if let Some(parent_index) = parent {
            let parent_conflicted =
                !self.revs[parent_index].is_leaf() || self.revs[parent_index].is_conflict();
            if mark_conflict && parent_conflicted {
                self.revs[index].add_flag(RevFlags::IS_CONFLICT);
            }
            self.revs[parent_index].clear_flag(RevFlags::LEAF);
            if flags.contains(RevFlags::KEEP_BODY) {
                self.keep_body(index);
            } else if flags.contains(RevFlags::CLOSED) {
                // No bodies survive on a closed conflict branch.
                self.remove_bodies_on_branch(parent_index);
            }
        } else if mark_conflict && index > 0 {
            // A second root.
            self.revs[index].add_flag(RevFlags::IS_CONFLICT);
        }

        self.changed = true;
        if index > 0 {
            self.sorted = false;
        }
        self.order.push(index);
        index
    }

    /// Inserts a revision as a child of `parent`. The generation must be
    /// exactly one past the parent's (1 for a root).
    pub fn insert(
        &mut self,
        rev_id: RevId,
        body: Option<Bytes>,
        flags: RevFlags,
        parent: Option<RevIndex>,
        allow_conflict: bool,
        mark_conflict: bool,
    ) -> Result<Inserted, TreeError> {
        if self.unknown {
            return Err(TreeError::RevsUnavailable);
        }
        let new_generation = rev_id.generation();
        if new_generation == 0 {
            return Err(TreeError::BadGeneration);
        }
        if let Some(existing) = self.get(&rev_id) {
            return Ok(Inserted::Exists(existing));
        }

        let parent_generation = match parent {
            Some(p) => {
                if !allow_conflict && !self.revs[p].is_leaf() {
                    return Err(TreeError::WouldConflict);
                }
                self.revs[p].rev_id.generation()
            }
            None => {
                if !allow_conflict && !self.revs.is_empty() {
                    return Err(TreeError::WouldConflict);
                }
                0
            }
        };
        if new_generation != parent_generation + 1 {
            return Err(TreeError::BadGeneration);
        }

        let deleted = flags.contains(RevFlags::DELETED);
        let index = self.insert_unchecked(rev_id, body, parent, flags, mark_conflict);
        Ok(if deleted {
            Inserted::Tombstone(index)
        } else {
            Inserted::Created(index)
        })
    }

    /// Like [`insert`](Self::insert), resolving the parent by id first.
    pub fn insert_with_parent_id(
        &mut self,
        rev_id: RevId,
        body: Option<Bytes>,
        flags: RevFlags,
        parent_id: Option<&RevId>,
        allow_conflict: bool,
        mark_conflict: bool,
    ) -> Result<Inserted, TreeError> {
        let parent = match parent_id {
            Some(id) => Some(self.get(id).ok_or(TreeError::ParentNotFound)?),
            None => None,
        };
        self.insert(rev_id, body, flags, parent, allow_conflict, mark_conflict)
    }

    /// Walks `history` (newest first) to the first revision already in
    /// the tree, then inserts the missing prefix: bodyless intermediates
    /// plus the newest entry with `body` and `flags`. Returns the index
    /// of the common ancestor within `history`.
    ///
    /// Generations must decrease by exactly 1, except that gaps at or
    /// below the prune depth are tolerated so very long histories can be
    /// sent in short form.
    pub fn insert_history(
        &mut self,
        history: &[RevId],
        body: Option<Bytes>,
        flags: RevFlags,
        allow_conflict: bool,
        mark_conflict: bool,
    ) -> Result<usize, TreeError> {
        if self.unknown {
            return Err(TreeError::RevsUnavailable);
        }
        if history.is_empty() {
            return Err(TreeError::BadHistory);
        }

        let mut last_generation = 0u64;
        let mut parent: Option<RevIndex> = None;
        let mut common_ancestor = history.len();
        for (i, rev_id) in history.iter().enumerate() {
            let generation = rev_id.generation();
            if generation == 0 {
                return Err(TreeError::BadHistory);
            }
            if last_generation > 0 && generation != last_generation - 1 {
                let prunable = generation < last_generation
                    && i as u64 + 1 >= u64::from(self.prune_depth);
                if !prunable {
                    return Err(TreeError::BadHistory);
                }
            }
            last_generation = generation;

            if let Some(existing) = self.get(rev_id) {
                parent = Some(existing);
                common_ancestor = i;
                break;
            }
        }

        if !allow_conflict {
            let conflicts = match parent {
                Some(p) => !self.revs[p].is_leaf(),
                None => !self.revs.is_empty(),
            };
            if conflicts {
                return Err(TreeError::WouldConflict);
            }
        }

        if common_ancestor > 0 {
            for i in (1..common_ancestor).rev() {
                parent = Some(self.insert_unchecked(
                    history[i].clone(),
                    None,
                    parent,
                    RevFlags::empty(),
                    mark_conflict,
                ));
            }
            self.insert_unchecked(history[0].clone(), body, parent, flags, mark_conflict);
        }
        Ok(common_ancestor)
    }

    //---- Bodies

    /// Marks `index` as the revision whose body must survive pruning.
    /// Clears the flag on every ancestor within the same conflict scope.
    pub fn keep_body(&mut self, index: RevIndex) {
        self.revs[index].add_flag(RevFlags::KEEP_BODY);
        let in_conflict = self.revs[index].is_conflict();
        let mut cursor = self.revs[index].parent;
        while let Some(i) = cursor {
            if in_conflict && !self.revs[i].is_conflict() {
                break;
            }
            self.revs[i].clear_flag(RevFlags::KEEP_BODY);
            cursor = self.revs[i].parent;
        }
        self.changed = true;
    }

    pub fn remove_body(&mut self, index: RevIndex) {
        if self.revs[index].body.is_some() {
            self.revs[index].body = None;
            self.revs[index].clear_flag(RevFlags::KEEP_BODY);
            self.changed = true;
        }
    }

    fn remove_bodies_on_branch(&mut self, index: RevIndex) {
        let mut cursor = Some(index);
        while let Some(i) = cursor {
            self.remove_body(i);
            cursor = self.revs[i].parent;
        }
    }

    /// Drops bodies of already-saved revisions that are no longer leaves.
    pub fn remove_non_leaf_bodies(&mut self) {
        for i in 0..self.revs.len() {
            let rev = &self.revs[i];
            let retained = RevFlags::LEAF.union(RevFlags::NEW).union(RevFlags::KEEP_BODY);
            if rev.body.is_some() && rev.flags.intersect(retained) == RevFlags::empty() {
                self.revs[i].body = None;
                self.changed = true;
            }
        }
    }

    //---- Pruning and purging

    /// Removes revisions whose distance from every leaf exceeds
    /// `max_depth`, keeping remote-tracked revisions and KeepBody
    /// holders. Returns the number pruned.
    pub fn prune(&mut self, max_depth: u32) -> usize {
        assert!(max_depth > 0, "prune depth must be positive");
        self.prune_depth = max_depth;
        if self.revs.len() <= max_depth as usize {
            return 0;
        }

        // Walk from each leaf toward the root, marking revs out of range.
        let mut pruned = 0usize;
        for leaf in 0..self.revs.len() {
            if !self.revs[leaf].is_leaf() {
                continue;
            }
            let mut depth = 0u32;
            let mut cursor = Some(leaf);
            while let Some(i) = cursor {
                depth += 1;
                if depth > max_depth && !self.revs[i].keep_body() && !self.revs[i].marked_for_purge()
                {
                    self.revs[i].add_flag(RevFlags::PURGE);
                    pruned += 1;
                }
                cursor = self.revs[i].parent;
            }
        }
        if pruned == 0 {
            return 0;
        }

        // Current remote revisions stay.
        let remote_indices: Vec<RevIndex> = self.remote_revs.values().copied().collect();
        for index in remote_indices {
            if self.revs[index].marked_for_purge() {
                self.revs[index].clear_flag(RevFlags::PURGE);
                pruned -= 1;
            }
        }
        if pruned == 0 {
            return 0;
        }

        // Re-point parent links across the revisions being removed.
        for i in 0..self.revs.len() {
            if self.revs[i].marked_for_purge() {
                continue;
            }
            let mut parent = self.revs[i].parent;
            while let Some(p) = parent {
                if !self.revs[p].marked_for_purge() {
                    break;
                }
                parent = self.revs[p].parent;
            }
            self.revs[i].parent = parent;
        }
        self.compact();
        pruned
    }

    /// Removes the named leaf, then ancestors that become leaves after
    /// the unlink, cascading toward the root. Returns the count removed.
    pub fn purge(&mut self, rev_id: &RevId) -> usize {
        let Some(mut index) = self.get(rev_id) else {
            return 0;
        };
        if !self.revs[index].is_leaf() {
            return 0;
        }
        let mut purged = 0usize;
        loop {
            purged += 1;
            self.revs[index].add_flag(RevFlags::PURGE);
            let parent = self.revs[index].parent.take();
            let Some(parent) = parent else {
                break;
            };
            if !self.confirm_leaf(parent) {
                break;
            }
            index = parent;
        }
        self.compact();
        self.check_for_resolved_conflict();
        purged
    }

    /// Removes every revision. Returns the count removed.
    pub fn purge_all(&mut self) -> usize {
        let purged = self.revs.len();
        self.revs.clear();
        self.order.clear();
        self.remote_revs.clear();
        self.changed = true;
        self.sorted = true;
        purged
    }

    /// Re-checks whether `index` has children; marks it a leaf if not.
    fn confirm_leaf(&mut self, index: RevIndex) -> bool {
        for rev in &self.revs {
            if rev.parent == Some(index) && !rev.marked_for_purge() {
                return false;
            }
        }
        self.revs[index].add_flag(RevFlags::LEAF);
        true
    }

    /// Slides surviving revisions down over the purged ones, rewriting
    /// parent indices, the order list, and the remote map.
    fn compact(&mut self) {
        let mut remap: Vec<Option<RevIndex>> = Vec::with_capacity(self.revs.len());
        let mut next = 0usize;
        for rev in &self.revs {
            if rev.marked_for_purge() {
                remap.push(None);
            } else {
                remap.push(Some(next));
                next += 1;
            }
        }

        let mut survivors = Vec::with_capacity(next);
        for (i, rev) in std::mem::take(&mut self.revs).into_iter().enumerate() {
            if remap[i].is_some() {
                let mut rev = rev;
                rev.parent = rev.parent.and_then(|p| remap[p]);
                survivors.push(rev);
            }
        }
        self.revs = survivors;

        self.order = self
            .order
            .iter()
            .filter_map(|&i| remap[i])
            .collect();

        let old_remotes = std::mem::take(&mut self.remote_revs);
        for (remote, index) in old_remotes {
            if let Some(new_index) = remap[index] {
                self.remote_revs.insert(remote, new_index);
            }
        }
        self.changed = true;
    }

    //---- Remote tracking

    pub fn is_latest_remote_revision(&self, index: RevIndex) -> bool {
        self.remote_revs.values().any(|&i| i == index)
    }

    pub fn latest_revision_on_remote(&self, remote: RemoteId) -> Option<RevIndex> {
        assert!(!remote.is_local(), "remote id 0 is reserved");
        self.remote_revs.get(&remote).copied()
    }

    pub fn set_latest_revision_on_remote(&mut self, remote: RemoteId, index: Option<RevIndex>) {
        assert!(!remote.is_local(), "remote id 0 is reserved");
        match index {
            Some(i) => {
                self.remote_revs.insert(remote, i);
            }
            None => {
                self.remote_revs.remove(&remote);
            }
        }
        self.changed = true;
    }

    pub fn remote_revs(&self) -> &BTreeMap<RemoteId, RevIndex> {
        &self.remote_revs
    }

    //---- Sorting

    /// Sorts into canonical order: leaves first, then non-conflicts,
    /// live before deleted, deleted before closed, and higher revision
    /// id first within a class. Index 0 is the current revision.
    pub fn sort(&mut self) {
        if self.sorted {
            return;
        }
        let revs = &self.revs;
        self.order.sort_by(|&a, &b| {
            let ra = &revs[a];
            let rb = &revs[b];
            (!ra.is_leaf(), ra.is_conflict(), ra.is_deleted(), ra.is_closed())
                .cmp(&(!rb.is_leaf(), rb.is_conflict(), rb.is_deleted(), rb.is_closed()))
                .then_with(|| rb.rev_id.cmp(&ra.rev_id))
        });
        self.sorted = true;
        self.check_for_resolved_conflict();
    }

    /// If the winning revision still carries a conflict marker, the
    /// conflict has been resolved; clear the marker down its branch.
    fn check_for_resolved_conflict(&mut self) {
        if self.sorted && !self.order.is_empty() && self.revs[self.order[0]].is_conflict() {
            self.mark_branch_as_not_conflict(self.order[0], true);
        }
    }

    /// Clears IsConflict walking from `index` toward the root. On the
    /// winning branch this also enforces the single-KeepBody rule; on a
    /// losing branch it stops at the end of the conflicting run.
    pub fn mark_branch_as_not_conflict(&mut self, index: RevIndex, winning_branch: bool) {
        let mut keep_bodies = winning_branch;
        let mut cursor = Some(index);
        while let Some(i) = cursor {
            if self.revs[i].is_conflict() {
                self.revs[i].clear_flag(RevFlags::IS_CONFLICT);
                self.changed = true;
                if !winning_branch {
                    return;
                }
            }
            if self.revs[i].keep_body() {
                if keep_bodies {
                    keep_bodies = false;
                } else {
                    self.revs[i].clear_flag(RevFlags::KEEP_BODY);
                    self.changed = true;
                }
            }
            cursor = self.revs[i].parent;
        }
    }

    //---- Saving

    /// True if any revision has not yet been assigned a store sequence.
    pub fn has_new_revisions(&self) -> bool {
        self.revs.iter().any(|r| r.is_new() || r.sequence == 0)
    }

    /// Marks all revisions saved under `sequence`.
    pub fn saved(&mut self, sequence: u64) {
        for rev in &mut self.revs {
            rev.clear_flag(RevFlags::NEW);
            if rev.sequence == 0 {
                rev.sequence = sequence;
            }
        }
    }
}

/// Bodies are handed out as stored; alignment-sensitive decoders need
/// them on an even address, so odd-offset buffers are copied once here.
fn aligned_body(body: Bytes) -> Bytes {
    if body.as_ptr() as usize & 1 == 0 {
        body
    } else {
        Bytes::from(body.to_vec())
    }
}
