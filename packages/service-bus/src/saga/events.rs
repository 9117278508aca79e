//! Lifecycle events raised by every saga.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::metadata::SagaStatus;
use crate::core::Message;

/// Raised once, when a saga is constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaCreated {
    pub id: String,
    pub saga_class: String,
    pub created_at: DateTime<Utc>,
    pub expire_date: DateTime<Utc>,
}

impl Message for SagaCreated {
    fn message_name() -> &'static str {
        "service_bus.saga.created"
    }
}

/// Raised when a saga leaves `in_progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStatusChanged {
    pub id: String,
    pub saga_class: String,
    pub previous_status: SagaStatus,
    pub new_status: SagaStatus,
    pub with_reason: Option<String>,
    pub datetime: DateTime<Utc>,
}

impl Message for SagaStatusChanged {
    fn message_name() -> &'static str {
        "service_bus.saga.status_changed"
    }
}

/// Raised right after [`SagaStatusChanged`] when a saga is closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaClosed {
    pub id: String,
    pub saga_class: String,
    pub closed_at: DateTime<Utc>,
    pub with_reason: Option<String>,
}

impl Message for SagaClosed {
    fn message_name() -> &'static str {
        "service_bus.saga.closed"
    }
}
