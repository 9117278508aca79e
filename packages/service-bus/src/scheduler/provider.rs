use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{OperationScheduled, SchedulerOperationCanceled, SchedulerOperationEmitted};
use super::operation::ScheduledOperation;
use super::registry::SchedulerRegistry;
use super::store::SchedulerStore;
use crate::config::SchedulerConfig;
use crate::context::MessageContext;
use crate::core::{EncodedMessage, Message};
use crate::error::{SchedulerError, StoreError};
use crate::package::DeliveryOptions;
use crate::store::Revision;

/// Outcome of one registry mutation attempt.
enum Mutation<T> {
    /// The registry changed and must be saved.
    Changed(T),
    /// Nothing to save.
    Unchanged(T),
}

/// Schedules, cancels and emits commands against one registry.
///
/// Each call loads the registry, applies one change and saves it with the
/// revision it loaded. A stale save reloads and retries the whole change up
/// to [`SchedulerConfig::conflict_retries`] times. Messages are delivered only
/// after the save succeeded.
pub struct SchedulerProvider {
    registry_id: Uuid,
    store: Arc<dyn SchedulerStore>,
    config: SchedulerConfig,
}

impl SchedulerProvider {
    pub fn new(registry_id: Uuid, store: Arc<dyn SchedulerStore>, config: SchedulerConfig) -> Self {
        Self {
            registry_id,
            store,
            config,
        }
    }

    pub fn registry_id(&self) -> Uuid {
        self.registry_id
    }

    /// Schedule `command` for `execution_date` under operation `id`.
    ///
    /// Publishes [`OperationScheduled`].
    pub async fn schedule<C: Message>(
        &self,
        id: impl Into<String>,
        command: &C,
        execution_date: DateTime<Utc>,
        ctx: &MessageContext,
    ) -> Result<(), SchedulerError> {
        let operation = ScheduledOperation::new(id, EncodedMessage::from_message(command)?, execution_date);

        let next = self
            .mutate(|registry| {
                registry.add(operation.clone())?;
                Ok(Mutation::Changed(registry.fetch_next_operation()))
            })
            .await?;

        info!(
            operation_id = operation.id(),
            command = %operation.command().namespace,
            execution_date = %execution_date,
            registry_id = %self.registry_id,
            "operation scheduled"
        );

        ctx.delivery(&OperationScheduled {
            id: operation.id().to_string(),
            command_namespace: operation.command().namespace.clone(),
            execution_date,
            next_operation: next,
        })
        .await?;
        Ok(())
    }

    /// Cancel operation `id`.
    ///
    /// Publishes [`SchedulerOperationCanceled`] even when the id is unknown;
    /// in that case the registry is left untouched and no next operation is
    /// carried.
    pub async fn cancel(
        &self,
        id: &str,
        reason: Option<String>,
        ctx: &MessageContext,
    ) -> Result<(), SchedulerError> {
        let next = self
            .mutate(|registry| match registry.remove(id) {
                Some(_) => Ok(Mutation::Changed(registry.fetch_next_operation())),
                None => Ok(Mutation::Unchanged(None)),
            })
            .await?;

        info!(operation_id = id, reason = ?reason, registry_id = %self.registry_id, "operation canceled");

        ctx.delivery(&SchedulerOperationCanceled {
            id: id.to_string(),
            reason,
            next_operation: next,
        })
        .await?;
        Ok(())
    }

    /// Emit operation `id`: remove it, deliver its command and publish
    /// [`SchedulerOperationEmitted`]. Unknown ids deliver nothing.
    pub async fn emit(&self, id: &str, ctx: &MessageContext) -> Result<(), SchedulerError> {
        let emitted = self
            .mutate(|registry| match registry.remove(id) {
                Some(operation) => Ok(Mutation::Changed(Some((operation, registry.fetch_next_operation())))),
                None => Ok(Mutation::Unchanged(None)),
            })
            .await?;

        let Some((operation, next)) = emitted else {
            warn!(operation_id = id, registry_id = %self.registry_id, "no scheduled operation to emit");
            return Ok(());
        };

        info!(
            operation_id = id,
            command = %operation.command().namespace,
            "emitting scheduled operation"
        );

        ctx.delivery_encoded(operation.command(), DeliveryOptions::new())
            .await?;
        ctx.delivery(&SchedulerOperationEmitted {
            id: id.to_string(),
            next_operation: next,
        })
        .await?;
        Ok(())
    }

    /// Current registry contents.
    pub async fn registry(&self) -> Result<SchedulerRegistry, SchedulerError> {
        let (registry, _) = self.load().await?;
        Ok(registry)
    }

    async fn load(&self) -> Result<(SchedulerRegistry, Revision), SchedulerError> {
        match self.store.load(self.registry_id).await? {
            Some(row) => Ok((SchedulerRegistry::decode(row.id, &row.data)?, row.revision)),
            None => Ok((SchedulerRegistry::new(self.registry_id), Revision::NONE)),
        }
    }

    async fn mutate<T, F>(&self, mut change: F) -> Result<T, SchedulerError>
    where
        T: Send,
        F: FnMut(&mut SchedulerRegistry) -> Result<Mutation<T>, SchedulerError> + Send,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let (mut registry, revision) = self.load().await?;

            let value = match change(&mut registry)? {
                Mutation::Unchanged(value) => return Ok(value),
                Mutation::Changed(value) => value,
            };

            let data = registry.encode()?;
            match self.store.save(self.registry_id, data, revision).await {
                Ok(saved) => {
                    debug!(registry_id = %self.registry_id, revision = %saved, "scheduler registry saved");
                    return Ok(value);
                }
                Err(StoreError::Conflict) if attempt <= self.config.conflict_retries => {
                    warn!(
                        registry_id = %self.registry_id,
                        attempt,
                        "scheduler registry changed concurrently, retrying"
                    );
                }
                Err(StoreError::Conflict) => return Err(SchedulerError::Conflict { attempts: attempt }),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TraceId;
    use crate::scheduler::{EmitSchedulerOperation, NextScheduledOperation};
    use crate::testing::{test_endpoints, InMemorySchedulerStore, InMemoryTransport};
    use chrono::Duration;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ExpireTrial {
        account_id: String,
    }

    impl Message for ExpireTrial {
        fn message_name() -> &'static str {
            "accounts.expire_trial"
        }
    }

    fn setup(
        retries: u32,
    ) -> (Arc<InMemoryTransport>, Arc<InMemorySchedulerStore>, SchedulerProvider, MessageContext) {
        let transport = Arc::new(InMemoryTransport::new());
        let store = Arc::new(InMemorySchedulerStore::new());
        let provider = SchedulerProvider::new(
            Uuid::new_v4(),
            store.clone(),
            SchedulerConfig {
                conflict_retries: retries,
            },
        );
        let ctx = MessageContext::outbound(TraceId::new(), test_endpoints(&transport));
        (transport, store, provider, ctx)
    }

    fn trial(id: &str) -> ExpireTrial {
        ExpireTrial {
            account_id: id.into(),
        }
    }

    #[tokio::test]
    async fn test_schedule_publishes_next_operation() {
        let (transport, _store, provider, ctx) = setup(3);
        let at = Utc::now() + Duration::hours(1);

        provider.schedule("trial-1", &trial("a-1"), at, &ctx).await.unwrap();

        let scheduled = transport.sent_messages::<OperationScheduled>();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].command_namespace, "accounts.expire_trial");
        assert_eq!(
            scheduled[0].next_operation,
            Some(NextScheduledOperation {
                id: "trial-1".into(),
                time: at,
            })
        );
    }

    #[tokio::test]
    async fn test_duplicate_schedule_fails_without_publishing() {
        let (transport, _store, provider, ctx) = setup(3);
        let at = Utc::now() + Duration::hours(1);

        provider.schedule("trial-1", &trial("a-1"), at, &ctx).await.unwrap();
        let result = provider
            .schedule("trial-1", &trial("a-2"), at + Duration::hours(1), &ctx)
            .await;

        assert!(matches!(result, Err(SchedulerError::DuplicateOperation(_))));
        assert_eq!(transport.sent().len(), 1);

        let registry = provider.registry().await.unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("trial-1").unwrap().execution_date(), at);
    }

    #[tokio::test]
    async fn test_cancel_unknown_operation() {
        let (transport, store, provider, ctx) = setup(3);

        provider
            .cancel("ghost", Some("never existed".into()), &ctx)
            .await
            .unwrap();

        let canceled = transport.sent_messages::<SchedulerOperationCanceled>();
        assert_eq!(canceled.len(), 1);
        assert_eq!(canceled[0].next_operation, None);
        assert_eq!(store.saves(), 0);
    }

    #[tokio::test]
    async fn test_cancel_head_arms_next() {
        let (transport, _store, provider, ctx) = setup(3);
        let now = Utc::now();

        provider
            .schedule("a", &trial("a-1"), now + Duration::hours(1), &ctx)
            .await
            .unwrap();
        provider
            .schedule("b", &trial("a-2"), now + Duration::hours(5), &ctx)
            .await
            .unwrap();
        provider.cancel("a", None, &ctx).await.unwrap();

        let scheduled = transport.sent_messages::<OperationScheduled>();
        assert_eq!(scheduled[0].next_operation.as_ref().unwrap().id, "a");
        assert_eq!(scheduled[1].next_operation, None);

        let canceled = transport.sent_messages::<SchedulerOperationCanceled>();
        assert_eq!(canceled[0].next_operation.as_ref().unwrap().id, "b");
    }

    #[tokio::test]
    async fn test_emit_delivers_command_then_event() {
        let (transport, _store, provider, ctx) = setup(3);
        provider
            .schedule("trial-1", &trial("a-1"), Utc::now() + Duration::minutes(5), &ctx)
            .await
            .unwrap();

        provider.emit("trial-1", &ctx).await.unwrap();

        let sent = transport.sent_namespaces();
        assert_eq!(
            sent,
            vec![
                "service_bus.scheduler.operation_scheduled",
                "accounts.expire_trial",
                "service_bus.scheduler.operation_emitted",
            ]
        );
        assert_eq!(transport.sent_messages::<ExpireTrial>(), vec![trial("a-1")]);
        assert!(provider.registry().await.unwrap().is_empty());

        // A second emit for the same id is a no-op.
        provider.emit("trial-1", &ctx).await.unwrap();
        assert_eq!(transport.sent().len(), 3);
        assert!(transport.sent_messages::<EmitSchedulerOperation>().is_empty());
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let (transport, store, provider, ctx) = setup(3);
        store.inject_conflicts(2);

        provider
            .schedule("trial-1", &trial("a-1"), Utc::now() + Duration::hours(1), &ctx)
            .await
            .unwrap();

        assert_eq!(store.saves(), 1);
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_persistent_conflict_gives_up_without_publishing() {
        let (transport, store, provider, ctx) = setup(2);
        store.inject_conflicts(10);

        let result = provider
            .schedule("trial-1", &trial("a-1"), Utc::now() + Duration::hours(1), &ctx)
            .await;

        assert!(matches!(result, Err(SchedulerError::Conflict { attempts: 3 })));
        assert!(transport.sent().is_empty());
        assert_eq!(store.saves(), 0);
    }
}
