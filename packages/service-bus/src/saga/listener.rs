use async_trait::async_trait;
use tracing::{info, warn};

use super::id::SagaId;
use super::provider::SagaProvider;
use super::saga::{Saga, SagaState};
use crate::context::MessageContext;
use crate::core::Message;
use crate::error::SagaError;
use crate::handler::{HandlerDescriptor, ServiceHandler};

/// Function applying an inbound event to a loaded saga.
pub type SagaListenerFn<S, E> = fn(&mut Saga<S>, &E) -> Result<(), SagaError>;

/// Registration table of the events a saga type reacts to.
///
/// Each entry becomes a router listener that resolves the saga id from the
/// event, loads the saga, calls the listener function and saves the saga.
///
/// ```ignore
/// let handlers = SagaListeners::<Refund>::new(provider)
///     .on::<RefundApproved>(|saga, event| {
///         saga.raise(event.clone())?;
///         saga.make_completed(None)
///     })
///     .on_with_property::<StockChecked>("reference", |saga, event| saga.raise(event.clone()))
///     .into_handlers();
/// ```
pub struct SagaListeners<S: SagaState> {
    provider: SagaProvider,
    descriptors: Vec<HandlerDescriptor>,
    _state: std::marker::PhantomData<fn() -> S>,
}

impl<S: SagaState> SagaListeners<S> {
    pub fn new(provider: SagaProvider) -> Self {
        Self {
            provider,
            descriptors: Vec::new(),
            _state: std::marker::PhantomData,
        }
    }

    /// React to `E`, reading the saga id from the metadata identifier property.
    pub fn on<E: Message>(self, listener: SagaListenerFn<S, E>) -> Self {
        self.on_with_property(S::metadata().containing_identifier_property, listener)
    }

    /// React to `E`, reading the saga id from `property`.
    pub fn on_with_property<E: Message>(mut self, property: &'static str, listener: SagaListenerFn<S, E>) -> Self {
        let handler = SagaEventHandler::<S, E> {
            provider: self.provider.clone(),
            property,
            listener,
        };
        let id = format!("{}::{}", S::metadata().saga_class, <E as Message>::message_name());
        self.descriptors
            .push(HandlerDescriptor::listener::<E, _>(id, handler));
        self
    }

    pub fn into_handlers(self) -> Vec<HandlerDescriptor> {
        self.descriptors
    }
}

struct SagaEventHandler<S: SagaState, E: Message> {
    provider: SagaProvider,
    property: &'static str,
    listener: SagaListenerFn<S, E>,
}

#[async_trait]
impl<S: SagaState, E: Message> ServiceHandler<E> for SagaEventHandler<S, E> {
    async fn handle(&self, event: &E, ctx: &MessageContext) -> anyhow::Result<()> {
        let id = resolve_saga_id::<S, E>(event, self.property)?;

        let mut saga = match self.provider.obtain::<S>(&id, ctx).await {
            Ok(Some(saga)) => saga,
            Ok(None) => {
                warn!(
                    saga_id = %id,
                    saga_class = id.saga_class(),
                    event = <E as Message>::message_name(),
                    "saga not found, event ignored"
                );
                return Ok(());
            }
            Err(SagaError::Expired(_)) => {
                info!(
                    saga_id = %id,
                    event = <E as Message>::message_name(),
                    "saga expired before the event arrived"
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        (self.listener)(&mut saga, event)?;
        self.provider.save(&mut saga, ctx).await?;
        Ok(())
    }
}

/// Read the saga id carried by `event` in `property`.
///
/// A missing, null or empty property fails with [`SagaError::UnroutableEvent`].
pub fn resolve_saga_id<S: SagaState, E: Message>(event: &E, property: &str) -> Result<SagaId, SagaError> {
    let unroutable = || SagaError::UnroutableEvent {
        event: <E as Message>::message_name().to_string(),
        property: property.to_string(),
    };

    let fields = serde_json::to_value(event)?;
    let id = match fields.get(property) {
        Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => return Err(unroutable()),
    };

    Ok(SagaId::of::<S>(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::{Appliers, SagaMetadata, StartedBy};
    use crate::testing::{InMemorySagaStore, InMemoryTransport};
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Onboarding {
        documents: u32,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct BeginOnboarding {
        employee_id: String,
    }

    impl Message for BeginOnboarding {}

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct DocumentSigned {
        employee_id: Option<String>,
        reference: String,
    }

    impl Message for DocumentSigned {}

    impl SagaState for Onboarding {
        fn metadata() -> SagaMetadata {
            SagaMetadata {
                saga_class: "hr.onboarding",
                identifier_class: "hr.employee_id",
                containing_identifier_property: "employee_id",
                expire_date_modifier: "+1 week",
            }
        }

        fn appliers() -> Appliers<Self> {
            Appliers::<Self>::new().on::<DocumentSigned>(|state, _| state.documents += 1)
        }
    }

    impl StartedBy<BeginOnboarding> for Onboarding {
        fn initial_state(_id: &SagaId, _command: &BeginOnboarding) -> Self {
            Onboarding::default()
        }
    }

    fn signed(employee_id: Option<&str>, reference: &str) -> DocumentSigned {
        DocumentSigned {
            employee_id: employee_id.map(str::to_string),
            reference: reference.to_string(),
        }
    }

    #[test]
    fn test_resolve_saga_id_from_property() {
        let id = resolve_saga_id::<Onboarding, _>(&signed(Some("e-1"), "r-9"), "employee_id").unwrap();
        assert_eq!(id, SagaId::new("e-1", "hr.onboarding"));

        let by_override = resolve_saga_id::<Onboarding, _>(&signed(None, "r-9"), "reference").unwrap();
        assert_eq!(by_override.id(), "r-9");
    }

    #[test]
    fn test_unroutable_events_fail() {
        for (event, property) in [
            (signed(None, "r-9"), "employee_id"),
            (signed(Some(""), "r-9"), "employee_id"),
            (signed(Some("e-1"), "r-9"), "badge"),
        ] {
            let result = resolve_saga_id::<Onboarding, _>(&event, property);
            assert!(matches!(result, Err(SagaError::UnroutableEvent { .. })));
        }
    }

    #[tokio::test]
    async fn test_listener_applies_event_and_saves() {
        let transport = Arc::new(InMemoryTransport::new());
        let store = Arc::new(InMemorySagaStore::new());
        let provider = SagaProvider::json(store.clone());
        let ctx = MessageContext::outbound(
            crate::core::TraceId::new(),
            crate::testing::test_endpoints(&transport),
        );

        let id = SagaId::of::<Onboarding>("e-1");
        provider
            .start::<Onboarding, _>(
                id.clone(),
                &BeginOnboarding {
                    employee_id: "e-1".into(),
                },
                &ctx,
            )
            .await
            .unwrap();

        let handler = SagaEventHandler::<Onboarding, DocumentSigned> {
            provider: provider.clone(),
            property: "employee_id",
            listener: |saga, event| saga.raise(event.clone()),
        };
        handler.handle(&signed(Some("e-1"), "r-1"), &ctx).await.unwrap();
        handler.handle(&signed(Some("e-1"), "r-2"), &ctx).await.unwrap();

        let saga = provider.obtain::<Onboarding>(&id, &ctx).await.unwrap().unwrap();
        assert_eq!(saga.state().documents, 2);

        // Unknown saga is ignored, unroutable event is an error.
        assert!(handler.handle(&signed(Some("e-404"), "r-3"), &ctx).await.is_ok());
        assert!(handler.handle(&signed(None, "r-4"), &ctx).await.is_err());
    }

    #[test]
    fn test_into_handlers_registers_one_listener_per_event() {
        let provider = SagaProvider::json(Arc::new(InMemorySagaStore::new()));
        let handlers = SagaListeners::<Onboarding>::new(provider)
            .on::<DocumentSigned>(|saga, event| saga.raise(event.clone()))
            .into_handlers();

        assert_eq!(handlers.len(), 1);
        assert_eq!(handlers[0].kind(), crate::handler::HandlerKind::Listener);
        assert!(handlers[0].id().starts_with("hr.onboarding::"));
    }
}
