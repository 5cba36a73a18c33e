//! Filepath: src/pmwcas.rs
//!
//! Persistent multi-word CAS collaborator.
//!
//! The tree core consumes a narrow engine interface: allocate a
//! [`Descriptor`], add up to [`MAX_ENTRIES`] `(target, expected, desired)`
//! word entries, and [`commit`](Descriptor::commit) them atomically; plus an
//! [`EpochGuard`] pinning reclamation for the duration of an operation, a
//! global epoch for tagging in-flight inserts, and a [`persist`] primitive
//! flushing a byte range.
//!
//! This module ships a **volatile stand-in engine**: commits are serialized
//! on a pool-level lock while every individual word remains a plain atomic,
//! so readers stay latch-free and observe the same single-word transitions a
//! descriptor-based engine would produce. A persistent-memory engine (with
//! descriptor tagging, recovery, and real cache-line flushes) can replace
//! this module behind the same interface.

use std::sync::atomic::{AtomicU32, AtomicU64, fence};

use parking_lot::Mutex;
use seize::Collector;

use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};

/// Maximum number of word entries per descriptor.
pub const MAX_ENTRIES: usize = 4;

/// Scoped epoch protection for latch-free readers.
///
/// While a guard is live, nodes retired through it (or through any guard of
/// the same pool) are kept alive, so traversals may keep dereferencing
/// pointers they loaded before a concurrent structure modification.
pub type EpochGuard<'a> = seize::LocalGuard<'a>;

/// Flush a byte range to durable media.
///
/// The volatile stand-in only issues a store fence; a persistent-memory
/// engine maps this to CLWB/SFENCE over the affected cache lines.
#[inline]
pub fn persist(addr: *const u8, len: usize) {
    let _ = (addr, len);
    fence(WRITE_ORD);
}

// ============================================================================
//  Descriptor
// ============================================================================

/// One `(target, expected, desired)` word entry.
#[derive(Clone, Copy)]
struct Entry {
    target: *mut u64,
    expected: u64,
    desired: u64,
}

const EMPTY_ENTRY: Entry = Entry {
    target: std::ptr::null_mut(),
    expected: 0,
    desired: 0,
};

/// A multi-word CAS descriptor.
///
/// Collects up to [`MAX_ENTRIES`] word entries targeting arbitrary aligned
/// 8-byte locations, then commits them atomically. The descriptor is consumed
/// by [`commit`](Descriptor::commit); dropping it without committing is a
/// no-op (nothing has been installed).
pub struct Descriptor<'a> {
    pool: &'a DescriptorPool,
    entries: [Entry; MAX_ENTRIES],
    count: usize,
}

impl Descriptor<'_> {
    /// Add a word entry to the descriptor.
    ///
    /// `target` must be 8-byte aligned and must stay valid until the commit.
    ///
    /// # Panics
    /// Panics if the descriptor already holds [`MAX_ENTRIES`] entries or the
    /// target is misaligned; both are programming errors in the caller.
    #[inline]
    pub fn add_entry(&mut self, target: *mut u64, expected: u64, desired: u64) {
        assert!(self.count < MAX_ENTRIES, "descriptor entry overflow");
        assert!(target.addr() % 8 == 0, "descriptor target must be 8-byte aligned");

        self.entries[self.count] = Entry {
            target,
            expected,
            desired,
        };
        self.count += 1;
    }

    /// Atomically install every desired value, provided every target still
    /// holds its expected value.
    ///
    /// Returns `false` without modifying anything if any target changed; the
    /// caller retries with fresh snapshots.
    #[must_use]
    pub fn commit(self) -> bool {
        // Commits serialize on the pool lock; individual words stay plain
        // atomics so concurrent readers never block.
        let _serial = self.pool.commit_lock.lock();

        for entry in &self.entries[..self.count] {
            // SAFETY: The caller guarantees `target` points to a live, 8-byte
            // aligned word for the duration of the commit (checked in
            // `add_entry` for alignment).
            let cell: &AtomicU64 = unsafe { AtomicU64::from_ptr(entry.target) };
            if cell.load(READ_ORD) != entry.expected {
                return false;
            }
        }

        for entry in &self.entries[..self.count] {
            // SAFETY: As above.
            let cell: &AtomicU64 = unsafe { AtomicU64::from_ptr(entry.target) };
            cell.store(entry.desired, WRITE_ORD);
            persist(entry.target.cast::<u8>(), 8);
        }

        true
    }

    /// Number of entries added so far.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    /// Check whether the descriptor holds no entries.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }
}

// ============================================================================
//  DescriptorPool
// ============================================================================

/// Shared engine state: descriptor allocation, the global epoch, and the
/// reclamation collector.
///
/// One pool is shared by every thread operating on a tree (or on several
/// trees, mirroring a process-wide engine instance).
pub struct DescriptorPool {
    /// Serializes descriptor commits in the volatile stand-in engine.
    commit_lock: Mutex<()>,

    /// Global epoch, recorded by in-flight inserts so a recovery pass can
    /// detect reservations abandoned by a crash.
    epoch: AtomicU32,

    /// Epoch-based reclamation for retired nodes.
    collector: Collector,
}

impl DescriptorPool {
    /// Create a new engine instance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            commit_lock: Mutex::new(()),
            epoch: AtomicU32::new(1),
            collector: Collector::new(),
        }
    }

    /// Allocate an empty descriptor.
    #[inline]
    #[must_use]
    pub fn allocate(&self) -> Descriptor<'_> {
        Descriptor {
            pool: self,
            entries: [EMPTY_ENTRY; MAX_ENTRIES],
            count: 0,
        }
    }

    /// The current global epoch.
    #[inline]
    #[must_use]
    pub fn current_epoch(&self) -> u32 {
        self.epoch.load(RELAXED)
    }

    /// Advance the global epoch. Called after structure modifications so
    /// abandoned reservations age out of the current epoch.
    #[inline]
    pub fn advance_epoch(&self) {
        self.epoch.fetch_add(1, RELAXED);
    }

    /// Enter a protected epoch scope.
    #[inline]
    #[must_use]
    pub fn guard(&self) -> EpochGuard<'_> {
        self.collector.enter()
    }
}

impl Default for DescriptorPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("epoch", &self.current_epoch())
            .finish()
    }
}

// ============================================================================
//  Tests
// ============================================================================
