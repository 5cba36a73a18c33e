//! Filepath: src/leaf.rs
//!
//! Leaf node operations.
//!
//! Leaves store the actual key/payload records. All mutations are multi-word
//! CAS transitions over the status word, one record metadata word, and (for
//! updates) the payload word itself; readers never block.
//!
//! # Insert Protocol
//!
//! Insert is two-phase:
//!
//! 1. **Reservation** (2-word CAS): bump the status word's record count and
//!    block size, and flip the next vacant metadata slot to Inserting(epoch).
//! 2. **Finalization** (2-word CAS): publish the metadata as
//!    Visible(offset, key_length, total_length), with the status word CASed
//!    against itself as a guard entry. The guard forces a conflict with any
//!    concurrent freeze: a freeze that commits first invalidates all
//!    in-flight finalizations, and a finalization that commits first forces
//!    the freezer to retry.
//!
//! Between the phases the record bytes are copied and persisted; a crash
//! there leaves an Inserting record whose epoch lets recovery discard it.

use std::cell::RefCell;

use crate::arena::NodeArena;
use crate::internode::InternalNode;
use crate::meta::{RecordMetadata, pad_key_length};
use crate::node::{BaseNode, NODE_HEADER_SIZE, PAYLOAD_SIZE, RECORD_METADATA_SIZE, cmp_keys};
use crate::pmwcas::{DescriptorPool, persist};
use crate::return_code::ReturnCode;
use crate::stack::Stack;
use crate::status::StatusWord;

thread_local! {
    /// Reusable sort scratch for consolidation and split preparation.
    static SORT_SCRATCH: RefCell<Vec<RecordMetadata>> = const { RefCell::new(Vec::new()) };
}

/// Outcome of the insert uniqueness pre-check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Uniqueness {
    /// No record with this key; proceed.
    Unique,

    /// A visible record with this key exists.
    Duplicate,

    /// An in-flight insert might carry this key; reserve, then re-check.
    ReCheck,
}

/// A leaf node of `N` bytes.
#[repr(C)]
pub struct LeafNode<const N: usize> {
    base: BaseNode,
}

impl<const N: usize> LeafNode<N> {
    /// Allocate a fresh, empty leaf.
    pub(crate) fn alloc(arena: &NodeArena) -> *mut Self {
        let ptr = arena.alloc(N);
        // SAFETY: Fresh zeroed buffer of N bytes, not yet shared.
        unsafe { BaseNode::initialize(ptr, true, N as u32) };
        ptr.cast()
    }

    /// Reborrow a leaf from a payload-encoded address.
    ///
    /// # Safety
    /// `addr` must encode a live leaf of size `N`, kept alive by the caller's
    /// epoch guard.
    #[inline]
    pub(crate) unsafe fn from_addr<'a>(addr: u64) -> &'a Self {
        // SAFETY: Caller contract.
        unsafe { &*(addr as usize as *const Self) }
    }

    /// The shared node prefix.
    #[inline]
    #[must_use]
    pub fn base(&self) -> &BaseNode {
        &self.base
    }

    /// Free bytes between the metadata array and the data region for the
    /// given status snapshot.
    #[inline]
    #[must_use]
    pub(crate) fn free_space(status: StatusWord) -> usize {
        let used = NODE_HEADER_SIZE
            + status.record_count() as usize * RECORD_METADATA_SIZE
            + status.block_size() as usize;
        N.saturating_sub(used)
    }

    // ========================================================================
    //  Uniqueness Checks
    // ========================================================================

    fn check_unique(&self, key: &[u8]) -> Uniqueness {
        match self.base.search_record_meta(key, 0, u32::MAX, true) {
            None => Uniqueness::Unique,

            Some((_, meta)) if !meta.is_visible() => Uniqueness::ReCheck,

            Some(_) => Uniqueness::Duplicate,
        }
    }

    /// Re-check the unsorted suffix `[sorted_count, own_slot)` after a
    /// reservation. Only earlier slots are consulted, so racing inserts of
    /// the same key resolve in slot order.
    fn recheck_unique(&self, key: &[u8], own_slot: u32) -> Uniqueness {
        loop {
            match self
                .base
                .search_record_meta(key, self.base.sorted_count(), own_slot, true)
            {
                None => return Uniqueness::Unique,

                Some((_, meta)) if meta.is_inserting() => {
                    // An earlier reservation is still copying its record;
                    // wait for it to finalize. A freeze abandons in-flight
                    // reservations, so stop waiting once the node is frozen
                    // (the caller's own finalization will fail the same way).
                    if self.base.status().is_frozen() {
                        return Uniqueness::Unique;
                    }
                    std::hint::spin_loop();
                }

                Some(_) => return Uniqueness::Duplicate,
            }
        }
    }

    // ========================================================================
    //  Insert
    // ========================================================================

    /// Insert a new record.
    pub(crate) fn insert(
        &self,
        epoch: u32,
        key: &[u8],
        payload: u64,
        pool: &DescriptorPool,
    ) -> ReturnCode {
        let padded_key_size = pad_key_length(key.len());
        let total_size = padded_key_size + PAYLOAD_SIZE;

        loop {
            let expected_status = self.base.status();
            if expected_status.is_frozen() {
                return ReturnCode::NodeFrozen;
            }

            let uniqueness = self.check_unique(key);
            if uniqueness == Uniqueness::Duplicate {
                return ReturnCode::KeyExists;
            }

            // The node may have filled up since the caller's space check;
            // report a lost race so the façade re-evaluates.
            if Self::free_space(expected_status) < total_size + RECORD_METADATA_SIZE {
                return ReturnCode::PmwCasFailure;
            }

            // Reservation: bump record count and block size, claim the next
            // vacant metadata slot.
            let slot = expected_status.record_count();
            let desired_status = expected_status.with_reserved(total_size as u32);

            let meta_cell = self.base.metadata_cell(slot);
            let expected_meta = meta_cell.load();
            if !expected_meta.is_vacant() {
                // Another thread claimed this slot between our status read
                // and now; start over.
                continue;
            }
            let reserved_meta = RecordMetadata::inserting(epoch);

            let mut pd = pool.allocate();
            pd.add_entry(
                self.base.status_cell().as_ptr(),
                expected_status.word(),
                desired_status.word(),
            );
            pd.add_entry(meta_cell.as_ptr(), expected_meta.word(), reserved_meta.word());
            if !pd.commit() {
                return ReturnCode::PmwCasFailure;
            }

            // Space reserved; copy the record bytes. Not atomic, but safe:
            // the record is not visible yet.
            let offset = N - desired_status.block_size() as usize;
            self.base.write_record(offset, key, payload);
            // SAFETY: In bounds, the reservation accounted these bytes.
            persist(
                unsafe { std::ptr::from_ref(self).cast::<u8>().add(offset) },
                total_size,
            );

            let mut final_offset = offset as u32;
            if uniqueness == Uniqueness::ReCheck
                && self.recheck_unique(key, slot) == Uniqueness::Duplicate
            {
                // Lost to an earlier in-flight insert of the same key:
                // discard the bytes and finalize a tombstone.
                self.base.zero_record(offset, total_size);
                final_offset = 0;
            }

            // Finalization must leave the slot either Visible or abandoned
            // in a frozen node; a live node can never keep an Inserting slot
            // forever. So retry the commit until it lands or a freeze
            // invalidates the reservation.
            let final_meta =
                RecordMetadata::finalized(final_offset, key.len() as u32, total_size as u32);
            loop {
                // Re-read the status word immediately before each attempt.
                let current_status = self.base.status();
                if current_status.is_frozen() {
                    return ReturnCode::NodeFrozen;
                }

                let mut pd = pool.allocate();
                pd.add_entry(
                    self.base.status_cell().as_ptr(),
                    current_status.word(),
                    current_status.word(),
                );
                pd.add_entry(meta_cell.as_ptr(), reserved_meta.word(), final_meta.word());
                if pd.commit() {
                    break;
                }
            }

            return if final_offset == 0 {
                ReturnCode::KeyExists
            } else {
                ReturnCode::Ok
            };
        }
    }

    // ========================================================================
    //  Read
    // ========================================================================

    /// Read the payload for `key`.
    ///
    /// In-flight inserts are treated as not-yet-present; because
    /// finalization is a single-word metadata transition, a reader sees
    /// either the old or the new state, never a partial record.
    #[must_use]
    pub(crate) fn read(&self, key: &[u8]) -> Option<u64> {
        let (_, meta) = self.base.search_record_meta(key, 0, u32::MAX, false)?;
        Some(self.base.read_payload(meta))
    }

    // ========================================================================
    //  Update
    // ========================================================================

    /// Swap the payload of an existing record.
    ///
    /// A three-entry CAS: the payload word itself, the metadata word CASed
    /// against itself (detects a concurrent delete), and the status word
    /// CASed against itself (detects a concurrent freeze).
    pub(crate) fn update(&self, key: &[u8], payload: u64, pool: &DescriptorPool) -> ReturnCode {
        loop {
            let status = self.base.status();
            if status.is_frozen() {
                return ReturnCode::NodeFrozen;
            }

            let Some((slot, meta)) = self.base.search_record_meta(key, 0, u32::MAX, true) else {
                return ReturnCode::NotFound;
            };
            if meta.is_inserting() {
                // The record is mid-insert; wait for it to settle.
                std::hint::spin_loop();
                continue;
            }
            if !meta.is_visible() {
                return ReturnCode::NotFound;
            }

            let payload_cell = self.base.payload_cell(meta);
            let old_payload = self.base.read_payload(meta);
            if old_payload == payload {
                return ReturnCode::Ok;
            }

            let mut pd = pool.allocate();
            pd.add_entry(payload_cell.as_ptr(), old_payload, payload);
            pd.add_entry(
                self.base.metadata_cell(slot).as_ptr(),
                meta.word(),
                meta.word(),
            );
            pd.add_entry(
                self.base.status_cell().as_ptr(),
                status.word(),
                status.word(),
            );
            return if pd.commit() {
                ReturnCode::Ok
            } else {
                ReturnCode::PmwCasFailure
            };
        }
    }

    // ========================================================================
    //  Upsert
    // ========================================================================

    /// Insert the record, or update it in place if it already exists.
    pub(crate) fn upsert(
        &self,
        epoch: u32,
        key: &[u8],
        payload: u64,
        pool: &DescriptorPool,
    ) -> ReturnCode {
        loop {
            let status = self.base.status();
            if status.is_frozen() {
                return ReturnCode::NodeFrozen;
            }

            match self.base.search_record_meta(key, 0, u32::MAX, true) {
                None => {
                    match self.insert(epoch, key, payload, pool) {
                        // A racing insert of the same key may have slipped
                        // in; fall through to update.
                        ReturnCode::PmwCasFailure | ReturnCode::KeyExists => {}

                        rc => return rc,
                    }
                    match self.update(key, payload, pool) {
                        // Still absent: the insert lost for lack of space or
                        // an unrelated race. Surface the race to the façade.
                        ReturnCode::NotFound => return ReturnCode::PmwCasFailure,

                        rc => return rc,
                    }
                }

                Some((_, meta)) if meta.is_inserting() => {
                    std::hint::spin_loop();
                }

                Some(_) => return self.update(key, payload, pool),
            }
        }
    }

    // ========================================================================
    //  Delete
    // ========================================================================

    /// Logically delete a record: clear the visible flag and offset while
    /// accounting the bytes in the status word's delete size. Physical space
    /// is reclaimed only on consolidation.
    pub(crate) fn delete(&self, key: &[u8], pool: &DescriptorPool) -> ReturnCode {
        loop {
            let status = self.base.status();
            if status.is_frozen() {
                return ReturnCode::NodeFrozen;
            }

            let Some((slot, meta)) = self.base.search_record_meta(key, 0, u32::MAX, true) else {
                return ReturnCode::NotFound;
            };
            if meta.is_inserting() {
                // In-flight insert of this key; wait for it to settle.
                std::hint::spin_loop();
                continue;
            }
            if !meta.is_visible() {
                return ReturnCode::NotFound;
            }

            let new_status = status.with_deleted(meta.total_length());
            let new_meta = meta.deleted();

            let mut pd = pool.allocate();
            pd.add_entry(
                self.base.status_cell().as_ptr(),
                status.word(),
                new_status.word(),
            );
            pd.add_entry(
                self.base.metadata_cell(slot).as_ptr(),
                meta.word(),
                new_meta.word(),
            );
            return if pd.commit() {
                ReturnCode::Ok
            } else {
                ReturnCode::PmwCasFailure
            };
        }
    }

    // ========================================================================
    //  Consolidation
    // ========================================================================

    /// Collect visible records into `scratch`; returns their total bytes.
    fn collect_visible(&self, scratch: &mut Vec<RecordMetadata>) -> usize {
        let mut total = 0usize;
        for slot in 0..self.base.status().record_count() {
            let meta = self.base.metadata(slot);
            if meta.is_visible() {
                total += meta.total_length() as usize;
                scratch.push(meta);
            }
        }
        total
    }

    fn sort_by_key(&self, scratch: &mut [RecordMetadata]) {
        scratch.sort_by(|a, b| cmp_keys(self.base.record_key(*a), self.base.record_key(*b)));
    }

    /// Rebuild this leaf into a compact, fully sorted sibling, discarding
    /// deleted records. Freezes the node first; the caller installs the new
    /// leaf through the parent's child-pointer update (or the root pointer).
    pub(crate) fn consolidate(&self, arena: &NodeArena, pool: &DescriptorPool) -> *mut Self {
        // A node already frozen by a racing SMO is safe to copy from: frozen
        // nodes are immutable and installation linearizes on the parent.
        let _ = self.base.freeze(pool);

        SORT_SCRATCH.with_borrow_mut(|scratch| {
            scratch.clear();
            self.collect_visible(scratch);
            self.sort_by_key(scratch);

            let new_leaf = Self::alloc(arena);
            // SAFETY: Fresh unpublished leaf; scratch holds visible records
            // of the now-immutable source.
            unsafe { Self::fill_from(new_leaf, self, scratch) };
            persist(new_leaf.cast::<u8>(), N);
            new_leaf
        })
    }

    /// Populate a fresh leaf with the given records, densely packed from the
    /// top of the node down, in scratch order.
    ///
    /// # Safety
    /// `dst` must be a fresh, unpublished leaf; `metas` must be visible
    /// records of `src`, which must be immutable (frozen) for the duration.
    unsafe fn fill_from(dst: *mut Self, src: &Self, metas: &[RecordMetadata]) {
        let dst_bytes = dst.cast::<u8>();
        let src_bytes = std::ptr::from_ref(src).cast::<u8>();
        // SAFETY: dst is exclusively ours; shared reborrow for cell access.
        let dst_ref = unsafe { &*dst };

        let mut offset = N;
        for (slot, meta) in metas.iter().enumerate() {
            let total = meta.total_length() as usize;
            offset -= total;

            // SAFETY: Both ranges are in bounds; src records are immutable.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src_bytes.add(meta.offset() as usize),
                    dst_bytes.add(offset),
                    total,
                );
            }

            dst_ref
                .base
                .metadata_cell(slot as u32)
                .init(RecordMetadata::finalized(
                    offset as u32,
                    meta.key_length(),
                    total as u32,
                ));
        }

        let count = metas.len() as u32;
        dst_ref
            .base
            .status_cell()
            .init(StatusWord::consolidated(count, (N - offset) as u32));
        // SAFETY: dst is unpublished; nothing reads this field concurrently.
        unsafe { (&raw mut (*dst).base.header.sorted_count).write(count) };
    }

    // ========================================================================
    //  Split Preparation
    // ========================================================================

    /// Split this leaf into two fresh siblings and propagate the separator
    /// bottom-up through the traversal stack.
    ///
    /// Returns the address of the new top-level node to install; the node it
    /// replaces is the last entry pushed to `replaced`. Every allocation is
    /// recorded in `created` so a lost install race can free it.
    pub(crate) fn prepare_for_split(
        &self,
        stack: &mut Stack,
        split_threshold: usize,
        arena: &NodeArena,
        pool: &DescriptorPool,
        created: &mut Vec<u64>,
        replaced: &mut Vec<u64>,
    ) -> Option<u64> {
        if self.base.status().record_count() < 2 {
            return None;
        }

        // Freeze, cooperatively: if another SMO froze the node first, keep
        // going — the parent-side install decides the single winner and the
        // loser frees its nodes.
        let _ = self.base.freeze(pool);

        SORT_SCRATCH.with_borrow_mut(|scratch| {
            scratch.clear();
            let total_size = self.collect_visible(scratch);
            self.sort_by_key(scratch);
            if scratch.len() < 2 {
                return None;
            }

            // Mid-point by byte size, not record count: accumulate record
            // bytes until half the data region is consumed.
            let mut remaining = (total_size / 2) as i64;
            let mut nleft = 0usize;
            for meta in scratch.iter() {
                nleft += 1;
                remaining -= i64::from(meta.total_length());
                if remaining <= 0 {
                    break;
                }
            }
            let nleft = nleft.clamp(1, scratch.len() - 1);

            let left = Self::alloc(arena);
            let right = Self::alloc(arena);
            let left_addr = left as usize as u64;
            let right_addr = right as usize as u64;
            created.push(left_addr);
            created.push(right_addr);

            // SAFETY: Fresh unpublished leaves; self is frozen.
            unsafe {
                Self::fill_from(left, self, &scratch[..nleft]);
                Self::fill_from(right, self, &scratch[nleft..]);
            }
            persist(left.cast::<u8>(), N);
            persist(right.cast::<u8>(), N);

            let separator = self.base.record_key(scratch[nleft - 1]);

            #[cfg(feature = "tracing")]
            tracing::debug!(records = scratch.len(), nleft, "leaf split prepared");

            replaced.push(self.base.addr());

            match stack.pop() {
                Some(frame) => {
                    // SAFETY: The frame's node is pinned by the caller's
                    // epoch guard.
                    let parent = unsafe { InternalNode::from_addr(frame.node) };
                    parent.prepare_for_split(
                        stack,
                        split_threshold,
                        separator,
                        self.base.addr(),
                        left_addr,
                        right_addr,
                        arena,
                        pool,
                        created,
                        replaced,
                    )
                }

                None => {
                    // This leaf was the root: grow the tree by one level.
                    let root = InternalNode::new_root(separator, left_addr, right_addr, arena);
                    created.push(root);
                    Some(root)
                }
            }
        })
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        arena: NodeArena,
        pool: DescriptorPool,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                arena: NodeArena::new(),
                pool: DescriptorPool::new(),
            }
        }

        fn leaf<const N: usize>(&self) -> &LeafNode<N> {
            let ptr = LeafNode::<N>::alloc(&self.arena);
            // SAFETY: Stays alive as long as the arena (the whole test).
            unsafe { &*ptr }
        }
    }

    #[test]
    fn test_insert_then_read() {
        let fx = Fixture::new();
        let leaf = fx.leaf::<1024>();

        assert!(leaf.insert(1, b"key1", 100, &fx.pool).is_ok());
        assert_eq!(leaf.read(b"key1"), Some(100));
        assert_eq!(leaf.read(b"key2"), None);
    }

    #[test]
    fn test_insert_duplicate_is_key_exists() {
        let fx = Fixture::new();
        let leaf = fx.leaf::<1024>();

        assert!(leaf.insert(1, b"key1", 100, &fx.pool).is_ok());
        assert!(leaf.insert(1, b"key1", 200, &fx.pool).is_key_exists());
        assert_eq!(leaf.read(b"key1"), Some(100));
    }

    #[test]
    fn test_insert_reserves_space() {
        let fx = Fixture::new();
        let leaf = fx.leaf::<1024>();

        let before = LeafNode::<1024>::free_space(leaf.base().status());
        assert!(leaf.insert(1, b"abc", 7, &fx.pool).is_ok());
        let after = LeafNode::<1024>::free_space(leaf.base().status());

        // Padded key (8) + payload (8) + metadata slot (8).
        assert_eq!(before - after, 24);
    }

    #[test]
    fn test_insert_full_node_reports_lost_race() {
        let fx = Fixture::new();
        let leaf = fx.leaf::<128>();

        let mut inserted = 0u64;
        for i in 0..32u64 {
            let key = format!("k{i:02}");
            if leaf.insert(1, key.as_bytes(), i, &fx.pool).is_ok() {
                inserted += 1;
            } else {
                break;
            }
        }
        assert!(inserted > 0);

        // The node is full now; further inserts must not wedge or corrupt.
        assert!(leaf.insert(1, b"zz", 1, &fx.pool).is_pmwcas_failure());
        for i in 0..inserted {
            let key = format!("k{i:02}");
            assert_eq!(leaf.read(key.as_bytes()), Some(i));
        }
    }

    #[test]
    fn test_update_changes_payload() {
        let fx = Fixture::new();
        let leaf = fx.leaf::<1024>();

        assert!(leaf.update(b"k", 2, &fx.pool).is_not_found());
        assert!(leaf.insert(1, b"k", 1, &fx.pool).is_ok());
        assert!(leaf.update(b"k", 2, &fx.pool).is_ok());
        assert_eq!(leaf.read(b"k"), Some(2));
    }

    #[test]
    fn test_update_same_payload_is_idempotent() {
        let fx = Fixture::new();
        let leaf = fx.leaf::<1024>();

        assert!(leaf.insert(1, b"k", 1, &fx.pool).is_ok());
        assert!(leaf.update(b"k", 1, &fx.pool).is_ok());
        assert_eq!(leaf.read(b"k"), Some(1));
    }

    #[test]
    fn test_delete_then_read_not_found() {
        let fx = Fixture::new();
        let leaf = fx.leaf::<1024>();

        assert!(leaf.insert(1, b"k", 1, &fx.pool).is_ok());
        assert!(leaf.delete(b"k", &fx.pool).is_ok());
        assert_eq!(leaf.read(b"k"), None);
        assert!(leaf.delete(b"k", &fx.pool).is_not_found());

        // Delete accounting covers the whole record.
        assert_eq!(leaf.base().status().delete_size(), 16);
    }

    #[test]
    fn test_upsert_inserts_then_updates() {
        let fx = Fixture::new();
        let leaf = fx.leaf::<1024>();

        assert!(leaf.upsert(1, b"k", 1, &fx.pool).is_ok());
        assert_eq!(leaf.read(b"k"), Some(1));
        assert!(leaf.upsert(1, b"k", 2, &fx.pool).is_ok());
        assert_eq!(leaf.read(b"k"), Some(2));
    }

    #[test]
    fn test_frozen_node_rejects_mutations() {
        let fx = Fixture::new();
        let leaf = fx.leaf::<1024>();

        assert!(leaf.insert(1, b"k", 1, &fx.pool).is_ok());
        assert!(leaf.base().freeze(&fx.pool));
        assert!(!leaf.base().freeze(&fx.pool));

        assert!(leaf.insert(1, b"j", 2, &fx.pool).is_node_frozen());
        assert!(leaf.update(b"k", 2, &fx.pool).is_node_frozen());
        assert!(leaf.delete(b"k", &fx.pool).is_node_frozen());

        // Reads are unaffected.
        assert_eq!(leaf.read(b"k"), Some(1));
    }

    #[test]
    fn test_consolidate_compacts_and_sorts() {
        let fx = Fixture::new();
        let leaf = fx.leaf::<1024>();

        for key in [&b"delta"[..], b"alpha", b"echo", b"bravo", b"charlie"] {
            assert!(leaf.insert(1, key, key[0].into(), &fx.pool).is_ok());
        }
        assert!(leaf.delete(b"echo", &fx.pool).is_ok());

        let new_leaf = leaf.consolidate(&fx.arena, &fx.pool);
        // SAFETY: Alive in the arena.
        let new_leaf = unsafe { &*new_leaf };

        let status = new_leaf.base().status();
        assert_eq!(status.record_count(), 4);
        assert_eq!(new_leaf.base().sorted_count(), 4);
        assert_eq!(status.delete_size(), 0);
        assert!(!status.is_frozen());

        // Records are in key order.
        let keys: Vec<_> = (0..4)
            .map(|i| new_leaf.base().record_key(new_leaf.base().metadata(i)).to_vec())
            .collect();
        assert_eq!(
            keys,
            vec![
                b"alpha".to_vec(),
                b"bravo".to_vec(),
                b"charlie".to_vec(),
                b"delta".to_vec()
            ]
        );

        assert_eq!(new_leaf.read(b"alpha"), Some(u64::from(b'a')));
        assert_eq!(new_leaf.read(b"echo"), None);
    }

    #[test]
    fn test_search_spans_sorted_and_unsorted_regions() {
        let fx = Fixture::new();
        let leaf = fx.leaf::<1024>();

        for key in [&b"b"[..], b"d", b"f"] {
            assert!(leaf.insert(1, key, key[0].into(), &fx.pool).is_ok());
        }
        // SAFETY: Alive in the arena.
        let sorted = unsafe { &*leaf.consolidate(&fx.arena, &fx.pool) };

        // Post-consolidation inserts land in the unsorted suffix.
        assert!(sorted.insert(1, b"a", u64::from(b'a'), &fx.pool).is_ok());
        assert!(sorted.insert(1, b"e", u64::from(b'e'), &fx.pool).is_ok());
        assert_eq!(sorted.base().sorted_count(), 3);
        assert_eq!(sorted.base().status().record_count(), 5);

        for key in [&b"a"[..], b"b", b"d", b"e", b"f"] {
            assert_eq!(sorted.read(key), Some(u64::from(key[0])), "key {key:?}");
        }
        assert_eq!(sorted.read(b"c"), None);
    }

    #[test]
    fn test_search_skips_deleted_in_sorted_region() {
        let fx = Fixture::new();
        let leaf = fx.leaf::<1024>();

        for i in 0..8u64 {
            let key = format!("k{i}");
            assert!(leaf.insert(1, key.as_bytes(), i, &fx.pool).is_ok());
        }
        // SAFETY: Alive in the arena.
        let sorted = unsafe { &*leaf.consolidate(&fx.arena, &fx.pool) };

        let gone = [1u64, 3, 4, 6];
        for i in gone {
            let key = format!("k{i}");
            assert!(sorted.delete(key.as_bytes(), &fx.pool).is_ok());
        }
        for i in 0..8u64 {
            let key = format!("k{i}");
            let expected = if gone.contains(&i) { None } else { Some(i) };
            assert_eq!(sorted.read(key.as_bytes()), expected, "key {key}");
        }
    }

    #[test]
    fn test_prepare_for_split_partitions_by_bytes() {
        let fx = Fixture::new();
        let leaf = fx.leaf::<1024>();

        for i in 0..20u64 {
            let key = format!("key{i:02}");
            assert!(leaf.insert(1, key.as_bytes(), i, &fx.pool).is_ok());
        }

        let mut stack = Stack::new();
        let mut created = Vec::new();
        let mut replaced = Vec::new();
        let new_top = leaf
            .prepare_for_split(
                &mut stack,
                4096,
                &fx.arena,
                &fx.pool,
                &mut created,
                &mut replaced,
            )
            .expect("split must succeed");

        assert!(leaf.base().status().is_frozen());
        assert_eq!(replaced, vec![leaf.base().addr()]);
        // Two leaves plus the new root.
        assert_eq!(created.len(), 3);
        assert_eq!(*created.last().unwrap(), new_top);

        // SAFETY: Created nodes live in the arena.
        let root = unsafe { InternalNode::from_addr(new_top) };
        assert_eq!(root.base().sorted_count(), 2);

        let (left_meta, left_addr) = root.get_child(b"key00");
        let (right_meta, right_addr) = root.get_child(b"zzz");
        assert_ne!(left_addr, right_addr);
        assert_eq!(left_meta.key_length(), 0);
        assert!(right_meta.key_length() > 0);

        // SAFETY: Created nodes live in the arena.
        let left = unsafe { LeafNode::<1024>::from_addr(left_addr) };
        let right = unsafe { LeafNode::<1024>::from_addr(right_addr) };

        // Every record is in exactly one half, and the halves respect the
        // separator.
        let separator = root.base().record_key(right_meta).to_vec();
        for i in 0..20u64 {
            let key = format!("key{i:02}");
            let in_left = left.read(key.as_bytes());
            let in_right = right.read(key.as_bytes());
            assert!(in_left.is_some() ^ in_right.is_some(), "key {key}");
            if in_left.is_some() {
                assert!(
                    cmp_keys(key.as_bytes(), &separator) != std::cmp::Ordering::Greater,
                    "left half leaked past the separator: {key}"
                );
            }
        }
    }
}
