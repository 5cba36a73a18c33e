//! Standard memory orderings for latch-free node access.
//!
//! These constants ensure consistent ordering usage across the codebase
//! and make the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for reading status words, record metadata, and child pointers
/// during latch-free traversal. Pairs with the commit path's Release stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for installing desired values during a multi-word CAS commit.
/// Pairs with readers' Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for stores into freshly allocated, not-yet-published nodes.
/// Publication itself provides the Release edge.
pub const RELAXED: Ordering = Ordering::Relaxed;
