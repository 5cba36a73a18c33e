//! Outcome taxonomy for node-level operations.
//!
//! Node operations never panic and never allocate an error: every outcome is
//! a [`ReturnCode`] variant. The tree façade recovers `NodeFrozen` and
//! `PmwCasFailure` locally with retry loops; `Ok`, `KeyExists` and `NotFound`
//! are surfaced to the caller.

use std::fmt;

/// Outcome of a node-level operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnCode {
    /// The operation succeeded.
    Ok,

    /// Insert found a visible duplicate.
    KeyExists,

    /// The target record is absent.
    NotFound,

    /// The target node is undergoing a structure modification; the caller
    /// must retry from the root.
    NodeFrozen,

    /// The multi-word CAS commit lost a race; the caller retries locally.
    PmwCasFailure,
}

impl ReturnCode {
    /// Check if the operation succeeded.
    #[inline]
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Check if a visible duplicate was found.
    #[inline]
    #[must_use]
    pub const fn is_key_exists(self) -> bool {
        matches!(self, Self::KeyExists)
    }

    /// Check if the target record was absent.
    #[inline]
    #[must_use]
    pub const fn is_not_found(self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Check if the target node was frozen.
    #[inline]
    #[must_use]
    pub const fn is_node_frozen(self) -> bool {
        matches!(self, Self::NodeFrozen)
    }

    /// Check if the multi-word CAS lost a race.
    #[inline]
    #[must_use]
    pub const fn is_pmwcas_failure(self) -> bool {
        matches!(self, Self::PmwCasFailure)
    }

    /// Check if the caller should retry from the root.
    #[inline]
    #[must_use]
    pub const fn needs_retry(self) -> bool {
        matches!(self, Self::NodeFrozen | Self::PmwCasFailure)
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),

            Self::KeyExists => write!(f, "key exists"),

            Self::NotFound => write!(f, "not found"),

            Self::NodeFrozen => write!(f, "node frozen"),

            Self::PmwCasFailure => write!(f, "multi-word CAS failure"),
        }
    }
}
