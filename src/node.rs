//! Filepath: src/node.rs
//!
//! Common node layout: header, record metadata array, record access, search.
//!
//! A node is a fixed-size byte buffer laid out as:
//!
//! ```text
//! +--------------------------------------------------------------+
//! | header (status word, size, sorted_count, kind)               |
//! +--------------------------------------------------------------+
//! | record_metadata[0 .. record_count)   (grows up)              |
//! |                                                              |
//! |                        free space                            |
//! |                                                              |
//! | data region: key bytes + padded payload   (grows down)       |
//! +--------------------------------------------------------------+
//! ```
//!
//! Metadata slots `[0, sorted_count)` are key-ordered (filled by construction
//! or consolidation); slots `[sorted_count, record_count)` are an append-only
//! unsorted suffix of post-consolidation inserts. Every mutable word is an
//! atomic cell mutated only through multi-word CAS commits, which is what
//! lets readers walk nodes without latches.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::AtomicU64;

use crate::meta::{AtomicMetadata, RecordMetadata};
use crate::ordering::{READ_ORD, RELAXED};
use crate::pmwcas::DescriptorPool;
use crate::status::{AtomicStatus, StatusWord};

/// Alignment of every node buffer; keeps all words 8-byte aligned.
pub const NODE_ALIGNMENT: usize = 8;

/// Size of one record metadata slot.
pub const RECORD_METADATA_SIZE: usize = 8;

/// Payloads are fixed-width 64-bit words.
pub const PAYLOAD_SIZE: usize = 8;

/// Compare two keys: byte-wise over the common prefix, length as tiebreak.
/// Keys match only when both bytes and lengths are equal, so the order is
/// total over arbitrary byte strings.
#[inline]
#[must_use]
pub(crate) fn cmp_keys(a: &[u8], b: &[u8]) -> CmpOrdering {
    a.cmp(b)
}

// ============================================================================
//  NodeHeader / BaseNode
// ============================================================================

/// Fixed node header shared by leaves and internal nodes.
#[repr(C)]
pub struct NodeHeader {
    /// The node's status word; every mutation guards against it.
    pub(crate) status: AtomicStatus,

    /// Allocation size of the node in bytes.
    pub(crate) size: u32,

    /// Length of the key-ordered metadata prefix. Written once during node
    /// construction, immutable after the node is published.
    pub(crate) sorted_count: u32,
}

/// Common prefix of every node buffer.
///
/// The metadata array and data region live in the trailing bytes of the
/// allocation and are reached through pointer arithmetic on `self`.
#[repr(C)]
pub struct BaseNode {
    pub(crate) header: NodeHeader,

    /// 1 for leaves, 0 for internal nodes. Immutable after construction.
    pub(crate) kind: u32,

    pub(crate) _reserved: u32,
}

/// Byte offset of the first metadata slot.
pub const NODE_HEADER_SIZE: usize = std::mem::size_of::<BaseNode>();

const _: () = assert!(NODE_HEADER_SIZE == 24);
const _: () = assert!(NODE_HEADER_SIZE % 8 == 0);

impl BaseNode {
    /// Reborrow a node from its address.
    ///
    /// # Safety
    /// `ptr` must point to a live node buffer with an initialized header, and
    /// the reference must not outlive the epoch protection keeping the node
    /// alive.
    #[inline]
    pub(crate) unsafe fn from_raw<'a>(ptr: *const u8) -> &'a Self {
        // SAFETY: Caller guarantees a live, aligned node buffer.
        unsafe { &*ptr.cast::<Self>() }
    }

    /// Reborrow a node from a payload-encoded address.
    ///
    /// # Safety
    /// As [`from_raw`](Self::from_raw).
    #[inline]
    pub(crate) unsafe fn from_addr<'a>(addr: u64) -> &'a Self {
        // SAFETY: Caller guarantees `addr` encodes a live node.
        unsafe { Self::from_raw(addr as usize as *const u8) }
    }

    /// Write the immutable header fields of a freshly allocated node.
    ///
    /// # Safety
    /// `ptr` must point to a zeroed buffer of at least `size` bytes that no
    /// other thread can observe yet.
    pub(crate) unsafe fn initialize(ptr: *mut u8, is_leaf: bool, size: u32) {
        // SAFETY: Exclusive access to the fresh buffer.
        let node = unsafe { &mut *ptr.cast::<Self>() };
        node.header.size = size;
        node.kind = u32::from(is_leaf);
    }

    /// The node's address as stored in parent payloads.
    ///
    /// Uses an exposing cast: traversals reconstruct pointers from these
    /// words.
    #[inline]
    #[must_use]
    pub(crate) fn addr(&self) -> u64 {
        std::ptr::from_ref(self) as usize as u64
    }

    #[inline]
    fn bytes(&self) -> *const u8 {
        std::ptr::from_ref(self).cast()
    }

    /// Check whether this node is a leaf.
    #[inline]
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.kind != 0
    }

    /// Allocation size of the node in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> u32 {
        self.header.size
    }

    /// Length of the key-ordered metadata prefix.
    #[inline]
    #[must_use]
    pub fn sorted_count(&self) -> u32 {
        self.header.sorted_count
    }

    /// Snapshot the status word.
    #[inline]
    #[must_use]
    pub fn status(&self) -> StatusWord {
        self.header.status.load()
    }

    /// The status cell, for descriptor entries.
    #[inline]
    pub(crate) fn status_cell(&self) -> &AtomicStatus {
        &self.header.status
    }

    /// The metadata cell for slot `slot`.
    #[inline]
    pub(crate) fn metadata_cell(&self, slot: u32) -> &AtomicMetadata {
        debug_assert!(
            NODE_HEADER_SIZE + (slot as usize + 1) * RECORD_METADATA_SIZE
                <= self.size() as usize,
            "metadata slot {slot} out of bounds"
        );
        // SAFETY: In bounds per the assertion; the slot is 8-byte aligned
        // because the header size is a multiple of 8.
        unsafe {
            &*self
                .bytes()
                .add(NODE_HEADER_SIZE + slot as usize * RECORD_METADATA_SIZE)
                .cast::<AtomicMetadata>()
        }
    }

    /// Snapshot the metadata word for slot `slot`.
    #[inline]
    #[must_use]
    pub(crate) fn metadata(&self, slot: u32) -> RecordMetadata {
        self.metadata_cell(slot).load()
    }

    /// The key bytes of a visible record.
    #[inline]
    pub(crate) fn record_key(&self, meta: RecordMetadata) -> &[u8] {
        debug_assert!(meta.offset() as usize + meta.key_length() as usize <= self.size() as usize);
        // SAFETY: Visible metadata always carries an in-bounds offset; the
        // bytes were published before the metadata became visible.
        unsafe {
            std::slice::from_raw_parts(
                self.bytes().add(meta.offset() as usize),
                meta.key_length() as usize,
            )
        }
    }

    /// The payload cell of a record, for atomic reads and descriptor entries.
    #[inline]
    pub(crate) fn payload_cell(&self, meta: RecordMetadata) -> &AtomicU64 {
        let at = meta.offset() as usize + meta.padded_key_length() as usize;
        debug_assert!(at + PAYLOAD_SIZE <= self.size() as usize);
        // SAFETY: Offsets and padded key lengths are multiples of 8, so the
        // payload word is aligned and in bounds.
        unsafe { &*self.bytes().add(at).cast::<AtomicU64>() }
    }

    /// Read a record's payload word.
    #[inline]
    #[must_use]
    pub(crate) fn read_payload(&self, meta: RecordMetadata) -> u64 {
        self.payload_cell(meta).load(READ_ORD)
    }

    /// An aligned word cell inside the data region, for publishing record
    /// bytes into a live node.
    #[inline]
    fn data_word_cell(&self, byte_offset: usize) -> &AtomicU64 {
        debug_assert!(byte_offset % 8 == 0);
        debug_assert!(byte_offset + 8 <= self.size() as usize);
        // SAFETY: Aligned and in bounds per the assertions.
        unsafe { &*self.bytes().add(byte_offset).cast::<AtomicU64>() }
    }

    /// Write a record's key and payload into the data region of a live node.
    ///
    /// The slot's metadata is still in the Inserting state, so no reader can
    /// reach these bytes; stores are word-wise atomics because the region is
    /// shared with concurrent writers of neighbouring records.
    pub(crate) fn write_record(&self, offset: usize, key: &[u8], payload: u64) {
        let padded = crate::meta::pad_key_length(key.len());

        let mut at = 0;
        while at < padded {
            let mut word = [0u8; 8];
            let take = key.len().saturating_sub(at).min(8);
            word[..take].copy_from_slice(&key[at..at + take]);
            self.data_word_cell(offset + at)
                .store(u64::from_ne_bytes(word), RELAXED);
            at += 8;
        }

        self.data_word_cell(offset + padded).store(payload, RELAXED);
    }

    /// Zero a record's bytes (an insert that lost its duplicate re-check).
    pub(crate) fn zero_record(&self, offset: usize, total_length: usize) {
        let mut at = 0;
        while at < total_length {
            self.data_word_cell(offset + at).store(0, RELAXED);
            at += 8;
        }
    }

    // ========================================================================
    //  Freeze
    // ========================================================================

    /// Set the frozen flag, retrying commit races.
    ///
    /// Returns false if the node was already frozen by another thread. A
    /// frozen node never becomes unfrozen again.
    pub(crate) fn freeze(&self, pool: &DescriptorPool) -> bool {
        loop {
            let status = self.status();
            if status.is_frozen() {
                return false;
            }

            let mut pd = pool.allocate();
            pd.add_entry(
                self.status_cell().as_ptr(),
                status.word(),
                status.with_frozen().word(),
            );
            if pd.commit() {
                return true;
            }
        }
    }

    // ========================================================================
    //  Search
    // ========================================================================

    /// Find the record matching `key` in slots `[start, min(end, record_count))`.
    ///
    /// Binary search over the sorted prefix, skipping deleted records by
    /// walking the midpoint left and then right to a visible neighbour;
    /// linear scan over the unsorted suffix.
    ///
    /// With `check_concurrency`, an Inserting slot in the unsorted region is
    /// returned as-is so the caller can re-check once it settles; otherwise
    /// in-flight inserts are skipped, which is what makes readers treat them
    /// as not-yet-present.
    pub(crate) fn search_record_meta(
        &self,
        key: &[u8],
        start: u32,
        end: u32,
        check_concurrency: bool,
    ) -> Option<(u32, RecordMetadata)> {
        let sorted_count = self.sorted_count();

        if start < sorted_count {
            let mut first = i64::from(start);
            let mut last = i64::from(end.min(sorted_count)) - 1;

            while first <= last {
                let pivot = (first + last) / 2;

                // Skip a deleted midpoint: walk left, then right, for a
                // visible neighbour inside the window.
                let mut middle = pivot;
                while !self.metadata(middle as u32).is_visible() && first < middle {
                    middle -= 1;
                }
                if !self.metadata(middle as u32).is_visible() {
                    middle = pivot;
                    while !self.metadata(middle as u32).is_visible() && middle < last {
                        middle += 1;
                    }
                }

                let meta = self.metadata(middle as u32);
                if !meta.is_visible() {
                    // Everything left in the window is deleted.
                    break;
                }

                match cmp_keys(key, self.record_key(meta)) {
                    CmpOrdering::Equal => return Some((middle as u32, meta)),

                    CmpOrdering::Less => last = middle - 1,

                    CmpOrdering::Greater => first = middle + 1,
                }
            }
        }

        if end > sorted_count {
            let linear_end = self.status().record_count().min(end);
            for slot in sorted_count..linear_end {
                let meta = self.metadata(slot);

                if meta.is_inserting() {
                    if check_concurrency {
                        return Some((slot, meta));
                    }
                    continue;
                }

                if meta.is_visible()
                    && meta.key_length() as usize == key.len()
                    && self.record_key(meta) == key
                {
                    return Some((slot, meta));
                }
            }
        }

        None
    }

    // ========================================================================
    //  Diagnostics
    // ========================================================================

    /// Append a header and metadata dump to `out`.
    pub(crate) fn dump_into(&self, out: &mut String, indent: usize) {
        use std::fmt::Write;

        let status = self.status();
        let pad = " ".repeat(indent);
        let _ = writeln!(
            out,
            "{pad}[{} size={} sorted_count={} frozen={} record_count={} block_size={} delete_size={}]",
            if self.is_leaf() { "leaf" } else { "internal" },
            self.size(),
            self.sorted_count(),
            status.is_frozen(),
            status.record_count(),
            status.block_size(),
            status.delete_size(),
        );

        let count = if self.is_leaf() {
            status.record_count()
        } else {
            self.sorted_count()
        };
        for slot in 0..count {
            let meta = self.metadata(slot);
            if meta.is_vacant() || meta.is_inserting() || !meta.is_visible() {
                let _ = writeln!(out, "{pad} ({slot:3}) {meta:?}");
                continue;
            }
            let key = String::from_utf8_lossy(self.record_key(meta)).into_owned();
            let _ = writeln!(
                out,
                "{pad} ({slot:3}) key={key:?} offset={} key_length={} total_length={} payload={:#x}",
                meta.offset(),
                meta.key_length(),
                meta.total_length(),
                self.read_payload(meta),
            );
        }
    }
}

// ============================================================================
//  Tests
// ============================================================================
