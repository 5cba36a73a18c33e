//! Filepath: src/internode.rs
//!
//! Internal (routing) nodes.
//!
//! An internal node with K separator keys holds K+1 child pointers encoded
//! as K+1 records in sorted order. Record 0 has an empty key (the
//! minus-infinity left child); the payload of the record carrying separator
//! `k_i` is the child covering `(k_i, k_{i+1}]`, and the rightmost record
//! covers `(k_K, +inf)`, so the separators fully partition the key space.
//! Separators are inclusive on the left: a split's separator is the last
//! key of the left sibling, so a key equal to a separator lives in the
//! child to the separator's left.
//!
//! Internal nodes never grow in place: every change (inserting a separator,
//! swapping in a split's halves) builds a fresh exactly-sized node and
//! installs it through the parent. Only child-pointer payloads are ever
//! CASed inside a published internal node, guarded by its status word.
//! `status.record_count == 0` stays a sentinel; the live record count is
//! `sorted_count`.

use std::cmp::Ordering as CmpOrdering;

use crate::arena::NodeArena;
use crate::meta::{RecordMetadata, pad_key_length};
use crate::node::{BaseNode, NODE_HEADER_SIZE, PAYLOAD_SIZE, RECORD_METADATA_SIZE, cmp_keys};
use crate::pmwcas::{DescriptorPool, persist};
use crate::return_code::ReturnCode;
use crate::stack::Stack;

/// A separator record to insert while copying: `(key, left_child, right_child)`.
///
/// The new key's record carries `right_child`; the record immediately before
/// it has its payload rewritten to `left_child`.
type SeparatorInsert<'a> = (&'a [u8], u64, u64);

/// An internal routing node. Allocated to exactly the size its records need.
#[repr(C)]
pub struct InternalNode {
    base: BaseNode,
}

impl InternalNode {
    /// Reborrow an internal node from a payload-encoded address.
    ///
    /// # Safety
    /// `addr` must encode a live internal node kept alive by the caller's
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

    // ========================================================================
    //  Constructors
    // ========================================================================

    /// Build a two-record internal node: a fresh root over a split's halves.
    pub(crate) fn new_root(key: &[u8], left_child: u64, right_child: u64, arena: &NodeArena) -> u64 {
        debug_assert!(!key.is_empty());

        let size = NODE_HEADER_SIZE
            + 2 * RECORD_METADATA_SIZE
            + PAYLOAD_SIZE
            + pad_key_length(key.len())
            + PAYLOAD_SIZE;

        let mut builder = Builder::new(arena, size);
        builder.push(b"", left_child);
        builder.push(key, right_child);
        builder.finish()
    }

    /// Clone `src` with a new separator inserted in sorted position.
    pub(crate) fn new_insert_copy(
        src: &Self,
        key: &[u8],
        left_child: u64,
        right_child: u64,
        arena: &NodeArena,
    ) -> u64 {
        Self::new_from_range(
            src,
            0,
            src.base.sorted_count(),
            Some((key, left_child, right_child)),
            arena,
        )
    }

    /// Copy records `[begin, begin + count)` of `src` into a fresh node,
    /// optionally inserting a new separator in sorted position.
    ///
    /// When the range does not start at record 0, the first copied record's
    /// key is stripped to length zero: it becomes the new node's
    /// minus-infinity slot (its old key moves up to the parent as the
    /// separator between the two halves of a split).
    pub(crate) fn new_from_range(
        src: &Self,
        begin: u32,
        count: u32,
        insert: Option<SeparatorInsert<'_>>,
        arena: &NodeArena,
    ) -> u64 {
        debug_assert!(count >= 1);
        debug_assert!(begin + count <= src.base.sorted_count());

        let mut size = NODE_HEADER_SIZE;
        for idx in begin..begin + count {
            let key_length = if idx == begin && begin > 0 {
                0
            } else {
                src.base.metadata(idx).key_length() as usize
            };
            size += RECORD_METADATA_SIZE + pad_key_length(key_length) + PAYLOAD_SIZE;
        }
        if let Some((key, _, _)) = insert {
            debug_assert!(!key.is_empty());
            size += RECORD_METADATA_SIZE + pad_key_length(key.len()) + PAYLOAD_SIZE;
        }

        let mut builder = Builder::new(arena, size);
        let mut pending = insert;

        for idx in begin..begin + count {
            let meta = src.base.metadata(idx);
            let key = if idx == begin && begin > 0 {
                &[][..]
            } else {
                src.base.record_key(meta)
            };

            if let Some((new_key, left_child, right_child)) = pending {
                if !key.is_empty() && cmp_keys(key, new_key) == CmpOrdering::Greater {
                    // First existing separator greater than the new one:
                    // the new separator goes right before it, and the
                    // previous record's child is replaced by the split's
                    // left half.
                    builder.patch_last_payload(left_child);
                    builder.push(new_key, right_child);
                    pending = None;
                }
            }

            builder.push(key, src.base.read_payload(meta));
        }

        if let Some((new_key, left_child, right_child)) = pending {
            // The new separator is greater than every existing one.
            builder.patch_last_payload(left_child);
            builder.push(new_key, right_child);
        }

        builder.finish()
    }

    // ========================================================================
    //  Child Lookup
    // ========================================================================

    /// Find the child covering `key`: the record with the largest separator
    /// strictly less than the key. A key equal to a separator belongs to
    /// the left child, because the separator was the last key of the left
    /// sibling when the split happened. Record 0's empty key bounds every
    /// search from below. Returns the slot's metadata snapshot and child
    /// address.
    #[must_use]
    pub(crate) fn get_child(&self, key: &[u8]) -> (RecordMetadata, u64) {
        let count = self.base.sorted_count();
        debug_assert!(count >= 1);

        // Lower bound over the separators; record 0 is minus-infinity, so
        // the search starts at slot 1 and the answer is one to the left.
        let mut lo = 1;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let meta = self.base.metadata(mid);
            if cmp_keys(self.base.record_key(meta), key) == CmpOrdering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        let meta = self.base.metadata(lo - 1);
        (meta, self.base.read_payload(meta))
    }

    // ========================================================================
    //  Child Pointer Update
    // ========================================================================

    /// Swap a child pointer: a two-entry CAS with the status word CASed
    /// against itself so a concurrent freeze aborts the install.
    pub(crate) fn update(
        &self,
        meta: RecordMetadata,
        old_child: u64,
        new_child: u64,
        pool: &DescriptorPool,
    ) -> ReturnCode {
        let status = self.base.status();
        if status.is_frozen() {
            return ReturnCode::NodeFrozen;
        }

        let mut pd = pool.allocate();
        pd.add_entry(
            self.base.status_cell().as_ptr(),
            status.word(),
            status.word(),
        );
        pd.add_entry(self.base.payload_cell(meta).as_ptr(), old_child, new_child);
        if pd.commit() {
            ReturnCode::Ok
        } else {
            ReturnCode::PmwCasFailure
        }
    }

    // ========================================================================
    //  Split Preparation
    // ========================================================================

    /// Absorb a child split's separator, splitting this node too if the
    /// result would exceed `split_threshold`.
    ///
    /// The node is frozen before its records are read: being replaced is a
    /// structure modification, and freezing first means no in-place child
    /// swap can land between the copy and the install. `old_child` is the
    /// node the separator came from; if the slot covering the separator no
    /// longer points to it, a racing modification already replaced that
    /// child and this whole split is stale.
    ///
    /// Returns the address of the new top-level node; the node it replaces
    /// is the last entry pushed to `replaced`. Returns `None` when stale.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn prepare_for_split(
        &self,
        stack: &mut Stack,
        split_threshold: usize,
        key: &[u8],
        old_child: u64,
        left_child: u64,
        right_child: u64,
        arena: &NodeArena,
        pool: &DescriptorPool,
        created: &mut Vec<u64>,
        replaced: &mut Vec<u64>,
    ) -> Option<u64> {
        // Freeze first, cooperatively: an already-frozen node is immutable
        // and safe to copy from, and the parent-side install picks the
        // single winner among racing preparers.
        let _ = self.base.freeze(pool);

        let (_, current_child) = self.get_child(key);
        if current_child != old_child {
            return None;
        }

        let grown_size = self.base.size() as usize
            + pad_key_length(key.len())
            + PAYLOAD_SIZE
            + RECORD_METADATA_SIZE;

        if grown_size <= split_threshold {
            // The separator fits: clone with it inserted.
            let node = Self::new_insert_copy(self, key, left_child, right_child, arena);
            created.push(node);
            replaced.push(self.base.addr());
            return Some(node);
        }

        // Adding the separator would overflow: split this node as well and
        // keep moving up the tree.
        let count = self.base.sorted_count();
        debug_assert!(count >= 2);
        let n_left = count / 2;

        // The separator at n_left moves up to the parent; the incoming
        // separator lands in whichever half covers it.
        let up_meta = self.base.metadata(n_left);
        let up_key = self.base.record_key(up_meta);

        let incoming = Some((key, left_child, right_child));
        let (left_insert, right_insert) = if cmp_keys(key, up_key) == CmpOrdering::Less {
            (incoming, None)
        } else {
            (None, incoming)
        };

        let new_left = Self::new_from_range(self, 0, n_left, left_insert, arena);
        let new_right = Self::new_from_range(self, n_left, count - n_left, right_insert, arena);
        created.push(new_left);
        created.push(new_right);

        #[cfg(feature = "tracing")]
        tracing::debug!(count, n_left, "internal split prepared");

        replaced.push(self.base.addr());

        match stack.pop() {
            Some(frame) => {
                // SAFETY: The frame's node is pinned by the caller's epoch
                // guard.
                let parent = unsafe { Self::from_addr(frame.node) };
                parent.prepare_for_split(
                    stack,
                    split_threshold,
                    up_key,
                    self.base.addr(),
                    new_left,
                    new_right,
                    arena,
                    pool,
                    created,
                    replaced,
                )
            }

            None => {
                let root = Self::new_root(up_key, new_left, new_right, arena);
                created.push(root);
                Some(root)
            }
        }
    }
}

// ============================================================================
//  Builder
// ============================================================================

/// Sequential record writer for a fresh internal node.
///
/// Records are appended in sorted order; data grows down from the top of the
/// allocation while metadata slots grow up. The node is private to the
/// builder until [`finish`](Builder::finish).
struct Builder {
    ptr: *mut u8,
    size: usize,
    offset: usize,
    slot: u32,
}

impl Builder {
    fn new(arena: &NodeArena, size: usize) -> Self {
        let ptr = arena.alloc(size);
        // SAFETY: Fresh zeroed buffer of `size` bytes.
        unsafe { BaseNode::initialize(ptr, false, size as u32) };
        Self {
            ptr,
            size,
            offset: size,
            slot: 0,
        }
    }

    fn node(&self) -> &BaseNode {
        // SAFETY: Header initialized in `new`; buffer private to the builder.
        unsafe { BaseNode::from_raw(self.ptr) }
    }

    /// Append one record. An empty key makes a minus-infinity slot.
    fn push(&mut self, key: &[u8], payload: u64) {
        let padded = pad_key_length(key.len());
        let total = padded + PAYLOAD_SIZE;
        debug_assert!(
            self.offset >= NODE_HEADER_SIZE + (self.slot as usize + 1) * RECORD_METADATA_SIZE + total
        );
        self.offset -= total;

        // SAFETY: In bounds per the assertion; buffer is unpublished.
        unsafe {
            std::ptr::copy_nonoverlapping(key.as_ptr(), self.ptr.add(self.offset), key.len());
            self.ptr
                .add(self.offset + padded)
                .cast::<u64>()
                .write(payload);
        }

        self.node().metadata_cell(self.slot).init(RecordMetadata::finalized(
            self.offset as u32,
            key.len() as u32,
            total as u32,
        ));
        self.slot += 1;
    }

    /// Rewrite the payload of the most recently appended record.
    fn patch_last_payload(&mut self, payload: u64) {
        debug_assert!(self.slot > 0);
        let meta = self.node().metadata(self.slot - 1);
        let at = meta.offset() as usize + meta.padded_key_length() as usize;
        // SAFETY: The record was written by `push`; buffer is unpublished.
        unsafe { self.ptr.add(at).cast::<u64>().write(payload) };
    }

    /// Seal the node: set the sorted count, persist, return the address.
    fn finish(self) -> u64 {
        debug_assert_eq!(
            self.offset,
            NODE_HEADER_SIZE + self.slot as usize * RECORD_METADATA_SIZE,
            "internal node size must match its records exactly"
        );
        // SAFETY: Buffer still private to the builder.
        unsafe {
            (&raw mut (*self.ptr.cast::<InternalNode>()).base.header.sorted_count)
                .write(self.slot);
        }
        persist(self.ptr, self.size);
        self.ptr as usize as u64
    }
}

// ============================================================================
//  Tests
// ============================================================================
