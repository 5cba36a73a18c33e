//! Structure modification installs.
//!
//! Splits and consolidations build fresh nodes side by side, then a single
//! multi-word CAS makes them reachable: a child-pointer swap in the parent
//! (guarded by the parent's status word) or, when the replaced node was the
//! root, a swap of the root pointer itself. Racing preparers may build
//! replacements for the same frozen node; the install picks exactly one
//! winner and the losers deallocate their unpublished nodes.

use crate::internode::InternalNode;
use crate::leaf::LeafNode;
use crate::pmwcas::EpochGuard;
use crate::stack::Stack;

use super::BzTree;

impl<const NODE_SIZE: usize> BzTree<NODE_SIZE> {
    /// Split the leaf at `leaf_addr`, propagating bottom-up through `stack`,
    /// and install the replacement subtree. Returns whether the install
    /// was committed by this thread.
    pub(crate) fn try_split_leaf(
        &self,
        leaf_addr: u64,
        stack: &mut Stack,
        guard: &EpochGuard<'_>,
    ) -> bool {
        // SAFETY: Pinned by `guard`.
        let leaf = unsafe { LeafNode::<NODE_SIZE>::from_addr(leaf_addr) };

        let mut created = Vec::new();
        let mut replaced = Vec::new();
        let prepared = leaf.prepare_for_split(
            stack,
            self.params.split_threshold,
            &self.arena,
            &self.pool,
            &mut created,
            &mut replaced,
        );

        let Some(new_top) = prepared else {
            // Stale or unsplittable; discard whatever was built.
            self.discard(&created);
            return false;
        };
        let Some(&old_top) = replaced.last() else {
            self.discard(&created);
            return false;
        };

        if self.install(stack, old_top, new_top) {
            #[cfg(feature = "tracing")]
            tracing::debug!(levels = replaced.len(), "split installed");

            for &addr in &replaced {
                // SAFETY: Unreachable by new traversals after the install;
                // in-flight readers hold guards.
                unsafe { self.arena.retire(addr as *mut u8, guard) };
            }
            self.pool.advance_epoch();
            true
        } else {
            self.discard(&created);
            false
        }
    }

    /// Consolidate the leaf at `leaf_addr` into a compact sibling and swap
    /// it into the parent. Returns whether the install was committed.
    pub(crate) fn try_consolidate_leaf(
        &self,
        leaf_addr: u64,
        stack: &Stack,
        guard: &EpochGuard<'_>,
    ) -> bool {
        // SAFETY: Pinned by `guard`.
        let leaf = unsafe { LeafNode::<NODE_SIZE>::from_addr(leaf_addr) };

        let new_leaf = leaf.consolidate(&self.arena, &self.pool);
        let new_addr = new_leaf as usize as u64;

        if self.install(stack, leaf_addr, new_addr) {
            #[cfg(feature = "tracing")]
            tracing::debug!("consolidation installed");

            // SAFETY: Unreachable by new traversals after the install.
            unsafe { self.arena.retire(leaf_addr as *mut u8, guard) };
            self.pool.advance_epoch();
            true
        } else {
            // SAFETY: The new leaf was never published.
            unsafe { self.arena.dealloc(new_addr as *mut u8) };
            false
        }
    }

    /// Make `new` reachable in place of `old`: through the installer frame
    /// left on `stack`, or the root pointer when the stack is exhausted.
    fn install(&self, stack: &Stack, old: u64, new: u64) -> bool {
        match stack.top() {
            Some(frame) => {
                // SAFETY: Pinned by the operation's epoch guard.
                let parent = unsafe { InternalNode::from_addr(frame.node) };
                parent.update(frame.meta, old, new, &self.pool).is_ok()
            }

            None => {
                let mut pd = self.pool.allocate();
                pd.add_entry(self.root.as_ptr(), old, new);
                pd.commit()
            }
        }
    }

    /// Free nodes that lost their install race before ever being published.
    fn discard(&self, created: &[u64]) {
        for &addr in created {
            // SAFETY: Created by this thread, never published.
            unsafe { self.arena.dealloc(addr as *mut u8) };
        }
    }

    /// Complete the pending structure modification on a frozen leaf so the
    /// caller can make progress: first a consolidation swap, and if the
    /// parent refuses (it is being replaced itself), a full split that
    /// rebuilds the frozen ancestors.
    pub(crate) fn help_frozen_leaf(
        &self,
        leaf_addr: u64,
        stack: &mut Stack,
        guard: &EpochGuard<'_>,
    ) {
        if !self.try_consolidate_leaf(leaf_addr, stack, guard) {
            let _ = self.try_split_leaf(leaf_addr, stack, guard);
        }
    }
}
