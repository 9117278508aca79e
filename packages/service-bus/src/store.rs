//! Shared storage primitives.

use serde::{Deserialize, Serialize};

/// Revision for optimistic concurrency control.
///
/// Each save provides the revision it loaded. If the stored revision no
/// longer matches, the save fails with
/// [`StoreError::Conflict`](crate::StoreError::Conflict) and the caller
/// reloads and retries.
///
/// [`Revision::NONE`] marks a row that has never been saved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Revision(pub u64);

impl Revision {
    /// Sentinel value for a row that has never been saved.
    pub const NONE: Revision = Revision(0);

    /// Revision written by the next successful save.
    pub fn next(self) -> Self {
        Revision(self.0.saturating_add(1))
    }

    /// Check if this is the NONE sentinel.
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    /// Get the inner value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}
