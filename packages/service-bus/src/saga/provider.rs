use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use super::id::SagaId;
use super::saga::{Saga, SagaState, StartedBy};
use super::store::{JsonSagaSerializer, SagaSerializer, SagaStore, StoredSaga};
use crate::context::MessageContext;
use crate::core::Message;
use crate::error::{SagaError, StoreError};
use crate::package::DeliveryOptions;

/// Loads, stores and publishes sagas.
///
/// Every method that persists a saga delivers its pending messages afterwards:
/// fired commands first, then raised events, each in the order they were
/// recorded. A failed save delivers nothing.
#[derive(Clone)]
pub struct SagaProvider {
    store: Arc<dyn SagaStore>,
    serializer: Arc<dyn SagaSerializer>,
}

impl SagaProvider {
    pub fn new(store: Arc<dyn SagaStore>, serializer: Arc<dyn SagaSerializer>) -> Self {
        Self { store, serializer }
    }

    /// Provider storing JSON payloads.
    pub fn json(store: Arc<dyn SagaStore>) -> Self {
        Self::new(store, Arc::new(JsonSagaSerializer))
    }

    /// Create, store and publish a new saga started by `command`.
    pub async fn start<S, C>(
        &self,
        id: SagaId,
        command: &C,
        ctx: &MessageContext,
    ) -> Result<Saga<S>, SagaError>
    where
        S: StartedBy<C>,
        C: Message,
    {
        let state = S::initial_state(&id, command);
        let mut saga = Saga::new(id, state, None)?;
        S::start(&mut saga, command)?;

        let row = self.to_row(&saga)?;
        self.store.save(row).await.map_err(|e| match e {
            StoreError::Duplicate(_) => SagaError::AlreadyExists(saga.id().to_string()),
            other => SagaError::Store(other),
        })?;

        info!(
            saga_id = %saga.id(),
            saga_class = saga.id().saga_class(),
            trace_id = %ctx.trace_id(),
            "saga started"
        );

        self.publish(&mut saga, ctx).await?;
        Ok(saga)
    }

    /// Load a saga.
    ///
    /// A saga still in progress past its expire date is closed as expired,
    /// stored, published, and reported as [`SagaError::Expired`].
    pub async fn obtain<S: SagaState>(
        &self,
        id: &SagaId,
        ctx: &MessageContext,
    ) -> Result<Option<Saga<S>>, SagaError> {
        let metadata = S::metadata();
        let Some(row) = self.store.obtain(id.id(), metadata.identifier_class).await? else {
            return Ok(None);
        };
        if row.saga_class != metadata.saga_class {
            return Err(SagaError::IdentifierMismatch {
                declared: row.saga_class,
                actual: metadata.saga_class.to_string(),
            });
        }

        let snapshot = self.serializer.deserialize(&row.payload)?;
        let mut saga = Saga::<S>::restore(snapshot)?;

        if saga.is_overdue(Utc::now()) {
            saga.make_expired()?;
            self.store.update(self.to_row(&saga)?).await?;
            info!(saga_id = %saga.id(), saga_class = metadata.saga_class, "saga expired");
            self.publish(&mut saga, ctx).await?;
            return Err(SagaError::Expired(saga.id().to_string()));
        }

        Ok(Some(saga))
    }

    /// Store changes to an existing saga and publish its pending messages.
    pub async fn save<S: SagaState>(&self, saga: &mut Saga<S>, ctx: &MessageContext) -> Result<(), SagaError> {
        self.store.update(self.to_row(saga)?).await?;
        debug!(
            saga_id = %saga.id(),
            status = %saga.status(),
            events = saga.raised().len(),
            commands = saga.fired().len(),
            "saga saved"
        );
        self.publish(saga, ctx).await
    }

    /// Delete a saga.
    pub async fn remove<S: SagaState>(&self, id: &SagaId) -> Result<(), SagaError> {
        self.store.remove(id.id(), S::metadata().identifier_class).await?;
        Ok(())
    }

    async fn publish<S: SagaState>(&self, saga: &mut Saga<S>, ctx: &MessageContext) -> Result<(), SagaError> {
        for command in saga.release_commands() {
            ctx.delivery_any(command.as_ref(), DeliveryOptions::new()).await?;
        }
        for event in saga.release_events() {
            ctx.delivery_any(event.as_ref(), DeliveryOptions::new()).await?;
        }
        Ok(())
    }

    fn to_row<S: SagaState>(&self, saga: &Saga<S>) -> Result<StoredSaga, SagaError> {
        let metadata = S::metadata();
        let payload = self.serializer.serialize(&saga.snapshot()?)?;
        Ok(StoredSaga {
            id: saga.id().id().to_string(),
            identifier_class: metadata.identifier_class.to_string(),
            saga_class: metadata.saga_class.to_string(),
            payload,
            state_id: saga.status().as_str().to_string(),
            created_at: saga.created_at(),
            closed_at: saga.closed_at(),
        })
    }
}
