use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;

/// A serialized saga row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSaga {
    pub id: String,
    pub identifier_class: String,
    pub saga_class: String,
    pub payload: Vec<u8>,
    pub state_id: String,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Persistence for sagas, keyed by `(id, identifier_class)`.
///
/// Implementations must be safe to share between handlers running
/// concurrently.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Insert a new saga. Fails with [`StoreError::Duplicate`] if the key exists.
    async fn save(&self, saga: StoredSaga) -> Result<(), StoreError>;

    /// Replace an existing saga. Fails with [`StoreError::NotFound`] if absent.
    async fn update(&self, saga: StoredSaga) -> Result<(), StoreError>;

    async fn obtain(&self, id: &str, identifier_class: &str) -> Result<Option<StoredSaga>, StoreError>;

    async fn remove(&self, id: &str, identifier_class: &str) -> Result<(), StoreError>;
}

/// Converts saga snapshots to stored payload bytes and back.
pub trait SagaSerializer: Send + Sync {
    fn serialize(&self, snapshot: &serde_json::Value) -> Result<Vec<u8>, serde_json::Error>;

    fn deserialize(&self, payload: &[u8]) -> Result<serde_json::Value, serde_json::Error>;
}

/// Stores snapshots as JSON text.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSagaSerializer;

impl SagaSerializer for JsonSagaSerializer {
    fn serialize(&self, snapshot: &serde_json::Value) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(snapshot)
    }

    fn deserialize(&self, payload: &[u8]) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}
