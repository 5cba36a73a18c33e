//! Filepath: src/tree.rs
//!
//! The `BzTree` façade: public API, retry loops, root installation.
//!
//! Every user operation (1) opens an epoch guard, (2) descends from the root
//! pushing breadcrumb frames, (3) invokes the leaf operation, and (4) on a
//! frozen node or a lost multi-word CAS race, discards the breadcrumbs and
//! retries from the root. Structure modifications build replacement nodes
//! side by side and install them with a single multi-word CAS, so partial
//! modifications are never visible.

use std::fmt as StdFmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use crate::arena::NodeArena;
use crate::internode::InternalNode;
use crate::leaf::LeafNode;
use crate::meta::pad_key_length;
use crate::node::{BaseNode, NODE_HEADER_SIZE, PAYLOAD_SIZE, RECORD_METADATA_SIZE};
use crate::ordering::READ_ORD;
use crate::pmwcas::DescriptorPool;
use crate::return_code::ReturnCode;

mod smo;
mod traverse;

use traverse::with_stack;

/// Maximum key length in bytes: the padded key plus the payload must fit the
/// metadata word's 16-bit total-length field.
pub const MAX_KEY_SIZE: usize = u16::MAX as usize - PAYLOAD_SIZE - 7;

// ============================================================================
//  Errors
// ============================================================================

/// Errors surfaced by [`BzTree::insert`] and [`BzTree::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// A visible record with this key already exists.
    KeyExists,

    /// The key is empty, longer than [`MAX_KEY_SIZE`], or too large for a
    /// record to fit in half a node.
    InvalidKey,
}

impl StdFmt::Display for InsertError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::KeyExists => write!(f, "key already exists"),

            Self::InvalidKey => write!(f, "key is empty or too large for the node size"),
        }
    }
}

impl std::error::Error for InsertError {}

/// Error surfaced by [`BzTree::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateError {
    /// No visible record with this key.
    NotFound,
}

impl StdFmt::Display for UpdateError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
        }
    }
}

impl std::error::Error for UpdateError {}

/// Error surfaced by [`BzTree::delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteError {
    /// No visible record with this key.
    NotFound,
}

impl StdFmt::Display for DeleteError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
        }
    }
}

impl std::error::Error for DeleteError {}

// ============================================================================
//  ParameterSet
// ============================================================================

/// Tree tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterSet {
    /// Target maximum byte size of an internal node; absorbing a separator
    /// that would grow past this forces the internal node to split too.
    pub split_threshold: usize,

    /// Deleted-byte level at which a leaf is compacted after a delete.
    pub merge_threshold: usize,
}

impl ParameterSet {
    /// Defaults proportional to the node size.
    #[must_use]
    pub const fn for_node_size(node_size: usize) -> Self {
        Self {
            split_threshold: node_size,
            merge_threshold: node_size / 4,
        }
    }
}

impl Default for ParameterSet {
    fn default() -> Self {
        Self::for_node_size(4096)
    }
}

// ============================================================================
//  BzTree
// ============================================================================

/// A latch-free B+-tree index mapping variable-length binary keys to 64-bit
/// payloads.
///
/// All structural state is reachable from a single swappable root pointer;
/// every mutation is a bounded sequence of multi-word CAS commits, so
/// readers never block and writers never hold latches.
///
/// # Type Parameters
///
/// * `NODE_SIZE` - Leaf node size in bytes (compile-time constant, default
///   4 KiB). Internal nodes are allocated to exactly the size their
///   separators need.
///
/// # Example
///
/// ```
/// use bztree::BzTree;
///
/// let tree: BzTree = BzTree::new();
/// tree.insert(b"key1", 100).unwrap();
/// assert_eq!(tree.read(b"key1"), Some(100));
/// ```
pub struct BzTree<const NODE_SIZE: usize = 4096> {
    /// Address of the root node; swapped by multi-word CAS on root splits.
    root: AtomicU64,

    params: ParameterSet,

    /// Shared engine state: descriptors, epochs, reclamation. Declared
    /// before the arena so pending reclamations run while node buffers are
    /// still allocated.
    pool: Arc<DescriptorPool>,

    arena: NodeArena,
}

// SAFETY: All shared state is atomic words mutated through the multi-word
// CAS protocol; node buffers are owned by the arena and reclaimed only
// through epoch guards.
unsafe impl<const NODE_SIZE: usize> Send for BzTree<NODE_SIZE> {}
unsafe impl<const NODE_SIZE: usize> Sync for BzTree<NODE_SIZE> {}

impl<const NODE_SIZE: usize> BzTree<NODE_SIZE> {
    /// Largest record (padded key + payload) allowed: half a node's usable
    /// space, so a split always relieves pressure.
    const MAX_RECORD_SIZE: usize =
        (NODE_SIZE - NODE_HEADER_SIZE) / 2 - RECORD_METADATA_SIZE;

    /// Create an empty tree with its own engine instance and default
    /// parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::with_params(
            ParameterSet::for_node_size(NODE_SIZE),
            Arc::new(DescriptorPool::new()),
        )
    }

    /// Create an empty tree with explicit parameters and a (possibly
    /// shared) engine instance.
    #[must_use]
    pub fn with_params(params: ParameterSet, pool: Arc<DescriptorPool>) -> Self {
        const {
            assert!(NODE_SIZE % 8 == 0, "node size must be 8-byte aligned");
            assert!(NODE_SIZE >= 256, "node size too small for records");
            assert!(NODE_SIZE <= 1 << 22, "node size exceeds the block-size field");
        }

        let arena = NodeArena::new();
        let root = LeafNode::<NODE_SIZE>::alloc(&arena);

        Self {
            root: AtomicU64::new(root as usize as u64),
            params,
            pool,
            arena,
        }
    }

    /// The engine instance backing this tree.
    #[must_use]
    pub fn pool(&self) -> &Arc<DescriptorPool> {
        &self.pool
    }

    fn key_fits(key: &[u8]) -> bool {
        !key.is_empty()
            && key.len() <= MAX_KEY_SIZE
            && pad_key_length(key.len()) + PAYLOAD_SIZE <= Self::MAX_RECORD_SIZE
    }

    /// Bytes a new record for `key` needs: padded key, payload, metadata slot.
    fn record_footprint(key: &[u8]) -> usize {
        pad_key_length(key.len()) + PAYLOAD_SIZE + RECORD_METADATA_SIZE
    }

    // ========================================================================
    //  Public API
    // ========================================================================

    /// Insert a new key.
    ///
    /// # Errors
    /// [`InsertError::KeyExists`] if a visible record with this key exists;
    /// [`InsertError::InvalidKey`] if the key is empty or too large.
    pub fn insert(&self, key: &[u8], payload: u64) -> Result<(), InsertError> {
        if !Self::key_fits(key) {
            return Err(InsertError::InvalidKey);
        }

        let needed = Self::record_footprint(key);
        let guard = self.pool.guard();

        with_stack(|stack| {
            loop {
                stack.clear();
                let leaf_addr = self.traverse_to_leaf(key, stack);
                // SAFETY: Pinned by `guard`.
                let leaf = unsafe { LeafNode::<NODE_SIZE>::from_addr(leaf_addr) };
                let status = leaf.base().status();

                if status.is_frozen() {
                    self.help_frozen_leaf(leaf_addr, stack, &guard);
                    continue;
                }

                if LeafNode::<NODE_SIZE>::free_space(status) < needed {
                    // Compaction is enough when deleted bytes cover the need;
                    // otherwise grow the tree.
                    if status.delete_size() as usize >= needed
                        && self.try_consolidate_leaf(leaf_addr, stack, &guard)
                    {
                        continue;
                    }
                    let _ = self.try_split_leaf(leaf_addr, stack, &guard);
                    continue;
                }

                match leaf.insert(self.pool.current_epoch(), key, payload, &self.pool) {
                    ReturnCode::Ok => return Ok(()),

                    ReturnCode::KeyExists => return Err(InsertError::KeyExists),

                    // NodeFrozen or a lost CAS race: retry from the root.
                    _ => {}
                }
            }
        })
    }

    /// Read the payload for `key`.
    ///
    /// Reads bypass the retry loop entirely: a stale leaf still yields a
    /// consistent answer because unlinked nodes stay alive under the guard.
    #[must_use]
    pub fn read(&self, key: &[u8]) -> Option<u64> {
        let _guard = self.pool.guard();
        let leaf_addr = self.find_leaf(key);
        // SAFETY: Pinned by `_guard`.
        let leaf = unsafe { LeafNode::<NODE_SIZE>::from_addr(leaf_addr) };
        leaf.read(key)
    }

    /// Replace the payload of an existing key.
    ///
    /// # Errors
    /// [`UpdateError::NotFound`] if no visible record carries the key.
    pub fn update(&self, key: &[u8], payload: u64) -> Result<(), UpdateError> {
        let guard = self.pool.guard();

        with_stack(|stack| {
            loop {
                stack.clear();
                let leaf_addr = self.traverse_to_leaf(key, stack);
                // SAFETY: Pinned by `guard`.
                let leaf = unsafe { LeafNode::<NODE_SIZE>::from_addr(leaf_addr) };

                match leaf.update(key, payload, &self.pool) {
                    ReturnCode::Ok => return Ok(()),

                    ReturnCode::NotFound => return Err(UpdateError::NotFound),

                    ReturnCode::NodeFrozen => {
                        self.help_frozen_leaf(leaf_addr, stack, &guard);
                    }

                    // Lost CAS race: retry from the root.
                    _ => {}
                }
            }
        })
    }

    /// Insert the key, or replace its payload if it already exists.
    ///
    /// # Errors
    /// [`InsertError::InvalidKey`] if the key is empty or too large.
    pub fn upsert(&self, key: &[u8], payload: u64) -> Result<(), InsertError> {
        if !Self::key_fits(key) {
            return Err(InsertError::InvalidKey);
        }

        let needed = Self::record_footprint(key);
        let guard = self.pool.guard();

        with_stack(|stack| {
            loop {
                stack.clear();
                let leaf_addr = self.traverse_to_leaf(key, stack);
                // SAFETY: Pinned by `guard`.
                let leaf = unsafe { LeafNode::<NODE_SIZE>::from_addr(leaf_addr) };
                let status = leaf.base().status();

                if status.is_frozen() {
                    self.help_frozen_leaf(leaf_addr, stack, &guard);
                    continue;
                }

                if LeafNode::<NODE_SIZE>::free_space(status) < needed {
                    if status.delete_size() as usize >= needed
                        && self.try_consolidate_leaf(leaf_addr, stack, &guard)
                    {
                        continue;
                    }
                    let _ = self.try_split_leaf(leaf_addr, stack, &guard);
                    continue;
                }

                match leaf.upsert(self.pool.current_epoch(), key, payload, &self.pool) {
                    ReturnCode::Ok => return Ok(()),

                    // NodeFrozen or a lost CAS race: retry from the root.
                    _ => {}
                }
            }
        })
    }

    /// Logically delete a key. Space is reclaimed when the leaf is next
    /// consolidated.
    ///
    /// # Errors
    /// [`DeleteError::NotFound`] if no visible record carries the key.
    pub fn delete(&self, key: &[u8]) -> Result<(), DeleteError> {
        let guard = self.pool.guard();

        with_stack(|stack| {
            loop {
                stack.clear();
                let leaf_addr = self.traverse_to_leaf(key, stack);
                // SAFETY: Pinned by `guard`.
                let leaf = unsafe { LeafNode::<NODE_SIZE>::from_addr(leaf_addr) };

                match leaf.delete(key, &self.pool) {
                    ReturnCode::Ok => {
                        // Merging nodes is out of scope; compaction reclaims
                        // the deleted bytes once they pile up.
                        let delete_size = leaf.base().status().delete_size() as usize;
                        if delete_size >= self.params.merge_threshold {
                            let _ = self.try_consolidate_leaf(leaf_addr, stack, &guard);
                        }
                        return Ok(());
                    }

                    ReturnCode::NotFound => return Err(DeleteError::NotFound),

                    ReturnCode::NodeFrozen => {
                        self.help_frozen_leaf(leaf_addr, stack, &guard);
                    }

                    // Lost CAS race: retry from the root.
                    _ => {}
                }
            }
        })
    }

    /// Consolidate the leaf covering `key` into a compact, fully sorted
    /// node. Returns whether this call installed the new node.
    pub fn consolidate(&self, key: &[u8]) -> bool {
        let guard = self.pool.guard();

        with_stack(|stack| {
            let leaf_addr = self.traverse_to_leaf(key, stack);
            self.try_consolidate_leaf(leaf_addr, stack, &guard)
        })
    }

    // ========================================================================
    //  Diagnostics
    // ========================================================================

    /// Render the node hierarchy: headers, status words, and per-record
    /// metadata, root first.
    #[must_use]
    pub fn dump(&self) -> String {
        use std::fmt::Write;

        let _guard = self.pool.guard();
        let mut out = String::new();
        let root = self.root.load(READ_ORD);
        let _ = writeln!(out, "BzTree (node_size = {NODE_SIZE}, root = {root:#x})");
        self.dump_node(root, 0, &mut out);
        out
    }

    fn dump_node(&self, addr: u64, depth: usize, out: &mut String) {
        // SAFETY: Pinned by the guard held in `dump`.
        let base = unsafe { BaseNode::from_addr(addr) };
        base.dump_into(out, depth * 2);

        if !base.is_leaf() {
            // SAFETY: Not a leaf, so an internal node.
            let internal = unsafe { InternalNode::from_addr(addr) };
            for slot in 0..internal.base().sorted_count() {
                let child = base.read_payload(base.metadata(slot));
                self.dump_node(child, depth + 1, out);
            }
        }
    }
}

impl<const NODE_SIZE: usize> Default for BzTree<NODE_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const NODE_SIZE: usize> StdFmt::Debug for BzTree<NODE_SIZE> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("BzTree")
            .field("node_size", &NODE_SIZE)
            .field("params", &self.params)
            .field("nodes", &self.arena.node_count())
            .finish()
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_on_empty_tree() {
        let tree: BzTree = BzTree::new();
        assert_eq!(tree.read(b"a"), None);
    }

    #[test]
    fn test_insert_read_duplicate() {
        let tree: BzTree = BzTree::new();

        tree.insert(b"key1", 100).unwrap();
        assert_eq!(tree.read(b"key1"), Some(100));
        assert_eq!(tree.insert(b"key1", 200), Err(InsertError::KeyExists));
        assert_eq!(tree.read(b"key1"), Some(100));
    }

    #[test]
    fn test_insert_update_delete_round_trip() {
        let tree: BzTree = BzTree::new();

        tree.insert(b"k", 1).unwrap();
        tree.update(b"k", 2).unwrap();
        assert_eq!(tree.read(b"k"), Some(2));
        tree.delete(b"k").unwrap();
        assert_eq!(tree.read(b"k"), None);
        assert_eq!(tree.delete(b"k"), Err(DeleteError::NotFound));
    }

    #[test]
    fn test_update_missing_key() {
        let tree: BzTree = BzTree::new();
        assert_eq!(tree.update(b"ghost", 1), Err(UpdateError::NotFound));
    }

    #[test]
    fn test_upsert_inserts_and_updates() {
        let tree: BzTree = BzTree::new();

        tree.upsert(b"k", 1).unwrap();
        assert_eq!(tree.read(b"k"), Some(1));
        tree.upsert(b"k", 2).unwrap();
        assert_eq!(tree.read(b"k"), Some(2));

        // Upsert after delete re-inserts.
        tree.delete(b"k").unwrap();
        tree.upsert(b"k", 3).unwrap();
        assert_eq!(tree.read(b"k"), Some(3));
    }

    #[test]
    fn test_invalid_keys_are_rejected() {
        let tree: BzTree<1024> = BzTree::new();

        assert_eq!(tree.insert(b"", 1), Err(InsertError::InvalidKey));
        assert_eq!(tree.upsert(b"", 1), Err(InsertError::InvalidKey));

        let huge = vec![b'x'; 1024];
        assert_eq!(tree.insert(&huge, 1), Err(InsertError::InvalidKey));
        assert_eq!(tree.read(&huge), None);
    }

    #[test]
    fn test_splits_preserve_all_records() {
        // Small nodes force several levels of splits.
        let tree: BzTree<1024> =
            BzTree::with_params(ParameterSet::for_node_size(512), Arc::new(DescriptorPool::new()));

        for i in 0..2000u64 {
            let key = format!("{i:04}");
            tree.insert(key.as_bytes(), i).unwrap();
        }
        for i in 0..2000u64 {
            let key = format!("{i:04}");
            assert_eq!(tree.read(key.as_bytes()), Some(i), "key {key}");
        }

        // The root must have split away from the initial leaf.
        // SAFETY: No concurrent access in this test.
        let root = unsafe { BaseNode::from_addr(tree.root.load(READ_ORD)) };
        assert!(!root.is_leaf());
    }

    #[test]
    fn test_consolidate_leaf_compacts() {
        let tree: BzTree<1024> = BzTree::new();

        for i in 0..16u64 {
            let key = format!("key{i:02}");
            tree.insert(key.as_bytes(), i).unwrap();
        }
        for i in 0..8u64 {
            let key = format!("key{i:02}");
            tree.delete(key.as_bytes()).unwrap();
        }

        assert!(tree.consolidate(b"key00"));

        let guard = tree.pool.guard();
        let leaf_addr = tree.find_leaf(b"key08");
        // SAFETY: Pinned by `guard`.
        let leaf = unsafe { LeafNode::<1024>::from_addr(leaf_addr) };
        let status = leaf.base().status();
        drop(guard);

        // Consolidation postconditions: compact, fully sorted, no deletes.
        assert_eq!(status.record_count(), 8);
        assert_eq!(leaf.base().sorted_count(), 8);
        assert_eq!(status.delete_size(), 0);

        for i in 8..16u64 {
            let key = format!("key{i:02}");
            assert_eq!(tree.read(key.as_bytes()), Some(i));
        }
        for i in 0..8u64 {
            let key = format!("key{i:02}");
            assert_eq!(tree.read(key.as_bytes()), None);
        }
    }

    #[test]
    fn test_delete_heavy_leaf_is_compacted_automatically() {
        let tree: BzTree<1024> = BzTree::new();

        for i in 0..24u64 {
            let key = format!("key{i:02}");
            tree.insert(key.as_bytes(), i).unwrap();
        }
        // Deleting most records crosses the merge threshold (node_size / 4)
        // and triggers compaction from the delete path.
        for i in 0..20u64 {
            let key = format!("key{i:02}");
            tree.delete(key.as_bytes()).unwrap();
        }

        let guard = tree.pool.guard();
        let leaf_addr = tree.find_leaf(b"key20");
        // SAFETY: Pinned by `guard`.
        let leaf = unsafe { LeafNode::<1024>::from_addr(leaf_addr) };
        let status = leaf.base().status();
        drop(guard);

        // Compaction ran once the deleted bytes crossed merge_threshold
        // (1024 / 4): the 24 original slots were squeezed out, and only the
        // deletes issued after the compaction still count.
        assert!(status.record_count() < 24, "compaction must have run");
        assert!((status.delete_size() as usize) < 256);
        for i in 20..24u64 {
            let key = format!("key{i:02}");
            assert_eq!(tree.read(key.as_bytes()), Some(i));
        }
    }

    #[test]
    fn test_dump_renders_hierarchy() {
        let tree: BzTree = BzTree::new();
        tree.insert(b"key1", 100).unwrap();

        let dump = tree.dump();
        assert!(dump.contains("BzTree"));
        assert!(dump.contains("leaf"));
        assert!(dump.contains("\"key1\""));
    }

    #[test]
    fn test_shared_pool_across_trees() {
        let pool = Arc::new(DescriptorPool::new());
        let a: BzTree<1024> = BzTree::with_params(ParameterSet::for_node_size(1024), Arc::clone(&pool));
        let b: BzTree<1024> = BzTree::with_params(ParameterSet::for_node_size(1024), Arc::clone(&pool));

        a.insert(b"k", 1).unwrap();
        b.insert(b"k", 2).unwrap();
        assert_eq!(a.read(b"k"), Some(1));
        assert_eq!(b.read(b"k"), Some(2));
    }
}
