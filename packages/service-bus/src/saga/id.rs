use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::saga::SagaState;

/// Identity of one saga instance.
///
/// The id string is opaque. The saga class must match the saga type the id is
/// used with; [`Saga::new`](super::Saga::new) rejects a mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SagaId {
    id: String,
    saga_class: String,
}

impl SagaId {
    /// Create an id for an explicit saga class.
    pub fn new(id: impl Into<String>, saga_class: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            saga_class: saga_class.into(),
        }
    }

    /// Create an id for saga type `S`.
    pub fn of<S: SagaState>(id: impl Into<String>) -> Self {
        Self::new(id, S::metadata().saga_class)
    }

    /// Create a random id for saga type `S`.
    pub fn generate<S: SagaState>() -> Self {
        Self::of::<S>(Uuid::new_v4().to_string())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn saga_class(&self) -> &str {
        &self.saga_class
    }
}

impl fmt::Display for SagaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}
