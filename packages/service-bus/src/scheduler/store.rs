use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::Revision;

/// A stored registry blob.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRegistry {
    pub id: Uuid,
    pub data: Vec<u8>,
    pub revision: Revision,
}

/// One row per registry id.
#[async_trait]
pub trait SchedulerStore: Send + Sync {
    async fn load(&self, id: Uuid) -> Result<Option<StoredRegistry>, StoreError>;

    /// Write `data` if the stored revision still equals `expected`.
    ///
    /// Use [`Revision::NONE`] for a registry that has never been saved.
    /// Returns the new revision, or [`StoreError::Conflict`] when stale.
    async fn save(&self, id: Uuid, data: Vec<u8>, expected: Revision) -> Result<Revision, StoreError>;
}
