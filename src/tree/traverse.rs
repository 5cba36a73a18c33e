//! Root-to-leaf traversal.
//!
//! Descent is latch-free: each step is one atomic child-pointer load, and
//! the caller's epoch guard keeps every node it might still dereference
//! alive even if a concurrent structure modification unlinks it. A stale
//! leaf still yields a consistent read.

use std::cell::RefCell;

use crate::internode::InternalNode;
use crate::node::BaseNode;
use crate::ordering::READ_ORD;
use crate::stack::{Frame, Stack};

use super::BzTree;

thread_local! {
    /// Per-thread traversal stack, reused across calls.
    static TRAVERSAL_STACK: RefCell<Stack> = RefCell::new(Stack::new());
}

/// Run `f` with the calling thread's traversal stack, cleared.
pub(crate) fn with_stack<R>(f: impl FnOnce(&mut Stack) -> R) -> R {
    TRAVERSAL_STACK.with_borrow_mut(|stack| {
        stack.clear();
        f(stack)
    })
}

impl<const NODE_SIZE: usize> BzTree<NODE_SIZE> {
    /// Descend from the root to the leaf covering `key`, pushing one frame
    /// per internal node crossed.
    pub(crate) fn traverse_to_leaf(&self, key: &[u8], stack: &mut Stack) -> u64 {
        let mut addr = self.root.load(READ_ORD);
        loop {
            // SAFETY: Pinned by the caller's epoch guard.
            let base = unsafe { BaseNode::from_addr(addr) };
            if base.is_leaf() {
                return addr;
            }

            // SAFETY: Not a leaf, so an internal node.
            let internal = unsafe { InternalNode::from_addr(addr) };
            let (meta, child) = internal.get_child(key);
            stack.push(Frame { node: addr, meta });
            addr = child;
        }
    }

    /// Descend without breadcrumbs; for reads, which never modify structure.
    pub(crate) fn find_leaf(&self, key: &[u8]) -> u64 {
        let mut addr = self.root.load(READ_ORD);
        loop {
            // SAFETY: Pinned by the caller's epoch guard.
            let base = unsafe { BaseNode::from_addr(addr) };
            if base.is_leaf() {
                return addr;
            }

            // SAFETY: Not a leaf, so an internal node.
            let internal = unsafe { InternalNode::from_addr(addr) };
            addr = internal.get_child(key).1;
        }
    }
}
