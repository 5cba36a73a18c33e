//! Node allocation and reclamation.
//!
//! Nodes are fixed-size byte buffers created fresh for each structure
//! modification, populated, persisted, then atomically installed; the arena
//! is the single owner of every buffer.
//!
//! ## Lifecycle
//!
//! - [`NodeArena::alloc`] returns a zeroed, tracked buffer. The caller
//!   initializes the header before publishing the node.
//! - [`NodeArena::dealloc`] frees a node that lost an install race and was
//!   never published.
//! - [`NodeArena::retire`] hands an unlinked node to the epoch collector for
//!   deferred reclamation once no guard can still reach it. Retirement is
//!   exactly-once: racing structure modifications may both try to retire the
//!   same replaced node, and only the first call schedules it.
//! - Dropping the arena frees whatever is still tracked (the live tree plus
//!   any nodes orphaned by racing installs).
//!
//! The node's allocation size lives in its own header, so the reclaim
//! callback can reconstruct the layout without side tables.

use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};

use parking_lot::Mutex;
use seize::{Collector, Guard};

use crate::node::{BaseNode, NODE_ALIGNMENT};
use crate::pmwcas::EpochGuard;

/// Tracks every live node buffer so nothing outlives the arena.
pub struct NodeArena {
    ptrs: Mutex<Vec<*mut u8>>,
}

// SAFETY: The raw pointers are owned by this arena and only dereferenced
// through the tree's synchronization protocol (status-word guards, epoch
// guards). The Mutex provides interior mutability for concurrent tracking.
unsafe impl Send for NodeArena {}
unsafe impl Sync for NodeArena {}

impl NodeArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ptrs: Mutex::new(Vec::new()),
        }
    }

    /// Number of tracked node buffers.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.ptrs.lock().len()
    }

    /// Allocate a zeroed, tracked node buffer of `size` bytes.
    ///
    /// # Panics
    /// Aborts via `handle_alloc_error` if the allocator fails.
    #[must_use]
    pub fn alloc(&self, size: usize) -> *mut u8 {
        debug_assert!(size % 8 == 0, "node sizes are multiples of 8");

        let layout = node_layout(size);
        // SAFETY: `layout` has non-zero size (nodes always carry a header).
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            handle_alloc_error(layout);
        }

        self.ptrs.lock().push(ptr);
        ptr
    }

    /// Free a node that was never published.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`alloc`](Self::alloc) on this arena,
    /// must carry an initialized header, and must be unreachable from the
    /// tree (it was never installed, or its install lost the race).
    pub unsafe fn dealloc(&self, ptr: *mut u8) {
        if self.untrack(ptr) {
            // SAFETY: ptr came from `alloc` and its header records the size.
            unsafe { free_node(ptr) };
        }
    }

    /// Retire an unlinked node for deferred reclamation.
    ///
    /// Exactly-once: if another thread already retired this node, the call is
    /// a no-op.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`alloc`](Self::alloc) on this arena
    /// and must be unreachable by any traversal that starts after this call;
    /// in-flight traversals are protected by their epoch guards.
    pub unsafe fn retire(&self, ptr: *mut u8, guard: &EpochGuard<'_>) {
        if self.untrack(ptr) {
            // SAFETY: Caller guarantees the unlink discipline; the collector
            // frees the node once no guard from its pool is active.
            unsafe { guard.defer_retire(ptr, reclaim_node) };
        }
    }

    /// Remove `ptr` from tracking; returns false if it was not tracked
    /// (already retired or deallocated by a racing thread).
    fn untrack(&self, ptr: *mut u8) -> bool {
        let mut ptrs = self.ptrs.lock();
        ptrs.iter().position(|&p| p == ptr).is_some_and(|pos| {
            ptrs.swap_remove(pos);
            true
        })
    }
}

impl Default for NodeArena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NodeArena {
    fn drop(&mut self) {
        // Exclusive access: free everything still tracked. Retired nodes were
        // untracked at retirement and are freed by the collector instead.
        for ptr in self.ptrs.get_mut().drain(..) {
            // SAFETY: Each ptr came from `alloc` and has not been freed
            // (it would have been untracked otherwise).
            unsafe { free_node(ptr) };
        }
    }
}

impl std::fmt::Debug for NodeArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeArena")
            .field("node_count", &self.node_count())
            .finish()
    }
}

fn node_layout(size: usize) -> Layout {
    Layout::from_size_align(size, NODE_ALIGNMENT).expect("node layout")
}

/// Free a node buffer, reading the allocation size from its header.
///
/// # Safety
/// `ptr` must point to a node allocated with [`node_layout`] whose header
/// `size` field matches the allocation.
unsafe fn free_node(ptr: *mut u8) {
    // SAFETY: Caller guarantees an initialized header.
    let size = unsafe { BaseNode::from_raw(ptr) }.size() as usize;
    // SAFETY: Matches the layout used in `alloc`.
    unsafe { dealloc(ptr, node_layout(size)) };
}

/// Seize reclaim callback for retired nodes.
///
/// # Safety
/// Called by the collector once no guard can reach the node.
unsafe fn reclaim_node(ptr: *mut u8, _collector: &Collector) {
    // SAFETY: The node was valid when retired and nothing freed it since.
    unsafe { free_node(ptr) };
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NODE_HEADER_SIZE;
    use crate::pmwcas::DescriptorPool;

    fn alloc_initialized(arena: &NodeArena, size: usize) -> *mut u8 {
        let ptr = arena.alloc(size);
        // SAFETY: Fresh zeroed buffer of `size` bytes.
        unsafe { BaseNode::initialize(ptr, true, size as u32) };
        ptr
    }

    #[test]
    fn test_alloc_tracks_and_zeroes() {
        let arena = NodeArena::new();
        let ptr = alloc_initialized(&arena, 256);
        assert_eq!(arena.node_count(), 1);

        // Metadata region is zeroed (vacant).
        for i in 0..(256 - NODE_HEADER_SIZE) / 8 {
            // SAFETY: within the allocation, 8-aligned.
            let word = unsafe { *(ptr.add(NODE_HEADER_SIZE + i * 8) as *const u64) };
            assert_eq!(word, 0);
        }
    }

    #[test]
    fn test_dealloc_untracks() {
        let arena = NodeArena::new();
        let ptr = alloc_initialized(&arena, 128);
        assert_eq!(arena.node_count(), 1);

        // SAFETY: never published.
        unsafe { arena.dealloc(ptr) };
        assert_eq!(arena.node_count(), 0);

        // A second dealloc of the same pointer is a no-op, not a double free.
        unsafe { arena.dealloc(ptr) };
        assert_eq!(arena.node_count(), 0);
    }

    #[test]
    fn test_retire_is_exactly_once() {
        let arena = NodeArena::new();
        let pool = DescriptorPool::new();
        let ptr = alloc_initialized(&arena, 128);

        let guard = pool.guard();
        // SAFETY: node is unreachable (never published).
        unsafe { arena.retire(ptr, &guard) };
        assert_eq!(arena.node_count(), 0);

        // Racing second retirement must not schedule a second free.
        unsafe { arena.retire(ptr, &guard) };
        drop(guard);
    }

    #[test]
    fn test_drop_frees_remaining() {
        let arena = NodeArena::new();
        for _ in 0..16 {
            let _ = alloc_initialized(&arena, 512);
        }
        assert_eq!(arena.node_count(), 16);
        drop(arena);
        // Leaks would be caught by sanitizers; nothing to assert here.
    }
}
