use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::operation::NextScheduledOperation;
use crate::core::Message;

/// Emit the operation `id` now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitSchedulerOperation {
    pub id: String,
}

impl Message for EmitSchedulerOperation {
    fn message_name() -> &'static str {
        "service_bus.scheduler.emit_operation"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationScheduled {
    pub id: String,
    pub command_namespace: String,
    pub execution_date: DateTime<Utc>,
    pub next_operation: Option<NextScheduledOperation>,
}

impl Message for OperationScheduled {
    fn message_name() -> &'static str {
        "service_bus.scheduler.operation_scheduled"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerOperationEmitted {
    pub id: String,
    pub next_operation: Option<NextScheduledOperation>,
}

impl Message for SchedulerOperationEmitted {
    fn message_name() -> &'static str {
        "service_bus.scheduler.operation_emitted"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerOperationCanceled {
    pub id: String,
    pub reason: Option<String>,
    pub next_operation: Option<NextScheduledOperation>,
}

impl Message for SchedulerOperationCanceled {
    fn message_name() -> &'static str {
        "service_bus.scheduler.operation_canceled"
    }
}
