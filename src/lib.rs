//! # BzTree
//!
//! A latch-free, persistence-aware B+-tree index mapping variable-length
//! binary keys to fixed-width 64-bit payloads.
//!
//! Every structural change goes through a persistent multi-word
//! compare-and-swap (PMwCAS) primitive that updates up to four 8-byte words
//! atomically with crash-consistent durability. Nodes are self-describing
//! fixed-size pages whose mutable state lives entirely in 64-bit words (a
//! status word, one metadata word per record, the payload words), which is
//! what lets readers traverse without latches.
//!
//! ## Design
//!
//! - Leaf mutations are one or two small CAS transitions; inserts are
//!   two-phase (reserve, then publish) with a status-word guard entry that
//!   linearizes them against node freezes.
//! - Structure modifications (splits, consolidation) freeze the nodes they
//!   replace, build immutable siblings side by side, and install them with
//!   a single CAS in the parent, propagating bottom-up through a traversal
//!   stack.
//! - Unlinked nodes are reclaimed through epoch guards, so a reader holding
//!   a stale pointer still sees a consistent (if old) node.
//!
//! ## Example
//!
//! ```
//! use bztree::BzTree;
//!
//! let tree: BzTree = BzTree::new();
//! tree.insert(b"hello", 42).unwrap();
//! tree.upsert(b"hello", 43).unwrap();
//! assert_eq!(tree.read(b"hello"), Some(43));
//! tree.delete(b"hello").unwrap();
//! assert_eq!(tree.read(b"hello"), None);
//! ```

pub mod arena;
pub mod internode;
pub mod leaf;
pub mod meta;
pub mod node;
pub mod ordering;
pub mod pmwcas;
pub mod return_code;
pub mod status;
pub mod tree;

mod stack;

pub use pmwcas::{Descriptor, DescriptorPool, EpochGuard, MAX_ENTRIES, persist};
pub use return_code::ReturnCode;
pub use tree::{BzTree, DeleteError, InsertError, MAX_KEY_SIZE, ParameterSet, UpdateError};
