use std::collections::HashMap;
use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::operation::{NextScheduledOperation, ScheduledOperation};
use crate::error::SchedulerError;

/// All operations of one logical scheduler.
///
/// `operations` and `timetable` always hold the same key set. The timetable
/// value is the execution date in milliseconds since the epoch.
///
/// The registry is a plain value: the provider loads it, mutates it and saves
/// it back as one blob.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerRegistry {
    id: Uuid,
    operations: HashMap<String, ScheduledOperation>,
    timetable: HashMap<String, i64>,
}

impl SchedulerRegistry {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            operations: HashMap::new(),
            timetable: HashMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Add an operation. Fails if the id is taken; the registry is unchanged.
    pub fn add(&mut self, operation: ScheduledOperation) -> Result<(), SchedulerError> {
        if self.operations.contains_key(operation.id()) {
            return Err(SchedulerError::DuplicateOperation(operation.id().to_string()));
        }

        let id = operation.id().to_string();
        self.timetable
            .insert(id.clone(), operation.execution_date().timestamp_millis());
        self.operations.insert(id, operation);
        Ok(())
    }

    /// Remove an operation, returning it if it existed.
    pub fn remove(&mut self, id: &str) -> Option<ScheduledOperation> {
        self.timetable.remove(id);
        self.operations.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&ScheduledOperation> {
        self.operations.get(id)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Arm the earliest operation.
    ///
    /// Takes the operation with the smallest execution time (ties broken by
    /// id). If it has not been sent yet it is marked sent and returned;
    /// otherwise nothing is returned, since an emit is already pending for it.
    ///
    /// Call this exactly once after every mutation.
    pub fn fetch_next_operation(&mut self) -> Option<NextScheduledOperation> {
        let id = self
            .timetable
            .iter()
            .min_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
            .map(|(id, _)| id.clone())?;

        let operation = self.operations.get(&id)?;
        if operation.is_sent() {
            return None;
        }

        let sent = operation.mark_sent();
        let next = NextScheduledOperation {
            id: id.clone(),
            time: sent.execution_date(),
        };
        self.operations.insert(id, sent);
        Some(next)
    }

    /// Serialize to MessagePack and compress with zlib.
    pub fn encode(&self) -> Result<Vec<u8>, SchedulerError> {
        let blob = RegistryBlobRef {
            operations: &self.operations,
            timetable: &self.timetable,
        };
        let packed = rmp_serde::to_vec_named(&blob).map_err(|e| SchedulerError::Codec(e.to_string()))?;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&packed)
            .map_err(|e| SchedulerError::Codec(e.to_string()))?;
        encoder.finish().map_err(|e| SchedulerError::Codec(e.to_string()))
    }

    /// Inverse of [`encode`](Self::encode).
    pub fn decode(id: Uuid, data: &[u8]) -> Result<Self, SchedulerError> {
        let mut packed = Vec::new();
        ZlibDecoder::new(data)
            .read_to_end(&mut packed)
            .map_err(|e| SchedulerError::Codec(e.to_string()))?;

        let blob: RegistryBlob =
            rmp_serde::from_slice(&packed).map_err(|e| SchedulerError::Codec(e.to_string()))?;

        if blob.operations.len() != blob.timetable.len()
            || blob.operations.keys().any(|k| !blob.timetable.contains_key(k))
        {
            return Err(SchedulerError::Codec(format!(
                "registry {id} has diverging operations and timetable"
            )));
        }

        Ok(Self {
            id,
            operations: blob.operations,
            timetable: blob.timetable,
        })
    }
}

#[derive(Serialize)]
struct RegistryBlobRef<'a> {
    operations: &'a HashMap<String, ScheduledOperation>,
    timetable: &'a HashMap<String, i64>,
}

#[derive(Deserialize)]
struct RegistryBlob {
    operations: HashMap<String, ScheduledOperation>,
    timetable: HashMap<String, i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EncodedMessage;
    use chrono::{Duration, TimeZone, Utc};

    fn operation(id: &str, hours: i64) -> ScheduledOperation {
        let base = Utc.with_ymd_and_hms(2030, 1, 1, 9, 0, 0).unwrap();
        ScheduledOperation::new(
            id,
            EncodedMessage {
                namespace: "billing.send_reminder".into(),
                message: serde_json::json!({ "invoice_id": id }),
            },
            base + Duration::hours(hours),
        )
    }

    #[test]
    fn test_added_operation_is_fetched_once() {
        let mut registry = SchedulerRegistry::new(Uuid::new_v4());
        registry.add(operation("a", 1)).unwrap();

        let next = registry.fetch_next_operation().unwrap();
        assert_eq!(next.id, "a");
        assert!(registry.get("a").unwrap().is_sent());

        assert_eq!(registry.fetch_next_operation(), None);
    }

    #[test]
    fn test_earliest_operation_wins() {
        let mut registry = SchedulerRegistry::new(Uuid::new_v4());
        registry.add(operation("late", 5)).unwrap();
        registry.add(operation("early", 1)).unwrap();

        let next = registry.fetch_next_operation().unwrap();
        assert_eq!(next.id, "early");
        assert_eq!(next.time, operation("early", 1).execution_date());
        assert!(!registry.get("late").unwrap().is_sent());
    }

    #[test]
    fn test_duplicate_id_keeps_first() {
        let mut registry = SchedulerRegistry::new(Uuid::new_v4());
        registry.add(operation("a", 1)).unwrap();

        let err = registry.add(operation("a", 7)).unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateOperation(id) if id == "a"));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("a").unwrap().execution_date(),
            operation("a", 1).execution_date()
        );
    }

    #[test]
    fn test_cancel_head_arms_following_operation() {
        let mut registry = SchedulerRegistry::new(Uuid::new_v4());
        registry.add(operation("a", 1)).unwrap();
        assert_eq!(registry.fetch_next_operation().unwrap().id, "a");
        registry.add(operation("b", 5)).unwrap();
        assert_eq!(registry.fetch_next_operation(), None);

        assert!(registry.remove("a").is_some());
        assert_eq!(registry.fetch_next_operation().unwrap().id, "b");
        assert!(registry.remove("missing").is_none());
    }

    #[test]
    fn test_blob_restores_registry() {
        let mut registry = SchedulerRegistry::new(Uuid::new_v4());
        registry.add(operation("a", 1)).unwrap();
        registry.add(operation("b", 2)).unwrap();
        registry.fetch_next_operation();

        let blob = registry.encode().unwrap();
        let restored = SchedulerRegistry::decode(registry.id(), &blob).unwrap();
        assert_eq!(restored, registry);

        assert!(matches!(
            SchedulerRegistry::decode(registry.id(), b"not zlib"),
            Err(SchedulerError::Codec(_))
        ));
    }
}
