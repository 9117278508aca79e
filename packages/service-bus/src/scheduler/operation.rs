use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::EncodedMessage;

/// A command waiting for its execution date.
///
/// Values are never mutated in place: [`mark_sent`](Self::mark_sent) returns
/// a new operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledOperation {
    id: String,
    command: EncodedMessage,
    execution_date: DateTime<Utc>,
    is_sent: bool,
}

impl ScheduledOperation {
    pub fn new(id: impl Into<String>, command: EncodedMessage, execution_date: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            command,
            execution_date,
            is_sent: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn command(&self) -> &EncodedMessage {
        &self.command
    }

    pub fn execution_date(&self) -> DateTime<Utc> {
        self.execution_date
    }

    /// Whether an emit command has already been armed for this operation.
    pub fn is_sent(&self) -> bool {
        self.is_sent
    }

    /// Copy of this operation flagged as sent.
    pub fn mark_sent(&self) -> Self {
        Self {
            is_sent: true,
            ..self.clone()
        }
    }
}

/// The operation to arm next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextScheduledOperation {
    pub id: String,
    pub time: DateTime<Utc>,
}
