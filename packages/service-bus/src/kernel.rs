//! Bus assembly.
//!
//! [`ServiceBusBuilder`] collects everything the runtime needs (transport,
//! handlers, validators, services, outbound routes, codecs and configuration)
//! and [`build`](ServiceBusBuilder::build) wires it into a [`ServiceBus`].
//!
//! # Example
//!
//! ```ignore
//! let bus = ServiceBusBuilder::new(transport, DeliveryDestination::new("orders"))
//!     .with_config(ServiceBusConfig::from_env()?)
//!     .garde_validator::<PlaceOrder>()
//!     .handler(HandlerDescriptor::command::<PlaceOrder, _>("orders.place", PlaceOrderHandler))
//!     .handlers(scheduler.handlers())
//!     .build()?;
//!
//! bus.context().delivery(&PlaceOrder { order_id: "o-1".into() }).await?;
//! bus.listen(&[Queue::new("orders")]).await?;
//! ```

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::argument::{default_resolvers, ArgumentResolver, Dependencies};
use crate::codec::{JsonMessageDecoder, JsonMessageEncoder, MessageDecoder, MessageDecoders, MessageEncoder, MessageTypeRegistry};
use crate::config::ServiceBusConfig;
use crate::context::{ContextFactory, MessageContext};
use crate::core::{Message, TraceId};
use crate::endpoint::{Endpoint, EndpointRouter, TransportEndpoint};
use crate::entry_point::{EntryPoint, EntryPointProcessor};
use crate::error::{RouterError, TransportError};
use crate::executor::MessageExecutorFactory;
use crate::handler::HandlerDescriptor;
use crate::package::DeliveryDestination;
use crate::router::MessageRouter;
use crate::transport::{Queue, Transport};
use crate::validation::{GardeValidator, MessageValidator};

/// Collects the bus configuration.
pub struct ServiceBusBuilder {
    transport: Arc<dyn Transport>,
    default_destination: DeliveryDestination,
    config: ServiceBusConfig,
    encoder: Arc<dyn MessageEncoder>,
    decoders: Vec<Arc<dyn MessageDecoder>>,
    routes: Vec<(String, Arc<dyn Endpoint>)>,
    handlers: Vec<HandlerDescriptor>,
    validators: HashMap<TypeId, Arc<dyn MessageValidator>>,
    dependencies: Dependencies,
    resolvers: Vec<Arc<dyn ArgumentResolver>>,
    message_types: Vec<fn(&mut MessageTypeRegistry) -> Result<(), RouterError>>,
}

impl ServiceBusBuilder {
    /// Start a bus on `transport`, sending unrouted messages to `default_destination`.
    pub fn new(transport: Arc<dyn Transport>, default_destination: DeliveryDestination) -> Self {
        Self {
            transport,
            default_destination,
            config: ServiceBusConfig::default(),
            encoder: Arc::new(JsonMessageEncoder),
            decoders: Vec::new(),
            routes: Vec::new(),
            handlers: Vec::new(),
            validators: HashMap::new(),
            dependencies: Dependencies::new(),
            resolvers: Vec::new(),
            message_types: Vec::new(),
        }
    }

    /// Replace the runtime configuration.
    pub fn with_config(mut self, config: ServiceBusConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the outbound encoder.
    pub fn with_encoder(mut self, encoder: Arc<dyn MessageEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// Accept packages produced by another encoder.
    pub fn with_decoder(mut self, decoder: Arc<dyn MessageDecoder>) -> Self {
        self.decoders.push(decoder);
        self
    }

    /// Deliver messages named `namespace` to `endpoint` instead of the default.
    pub fn route(mut self, namespace: impl Into<String>, endpoint: Arc<dyn Endpoint>) -> Self {
        self.routes.push((namespace.into(), endpoint));
        self
    }

    /// Deliver messages of type `M` to `destination` on the bus transport.
    pub fn route_to<M: Message>(self, destination: DeliveryDestination) -> Self {
        let endpoint = Arc::new(TransportEndpoint::new(
            destination.to_string(),
            destination,
            self.transport.clone(),
            self.encoder.clone(),
        ));
        self.route(<M as Message>::message_name(), endpoint)
    }

    /// Register a handler.
    pub fn handler(mut self, descriptor: HandlerDescriptor) -> Self {
        self.handlers.push(descriptor);
        self
    }

    /// Register several handlers.
    pub fn handlers(mut self, descriptors: impl IntoIterator<Item = HandlerDescriptor>) -> Self {
        self.handlers.extend(descriptors);
        self
    }

    /// Validator for messages of type `M`.
    pub fn validator<M: Message>(mut self, validator: Arc<dyn MessageValidator>) -> Self {
        self.validators.insert(TypeId::of::<M>(), validator);
        self
    }

    /// Validate messages of type `M` with their `garde` rules.
    pub fn garde_validator<M>(self) -> Self
    where
        M: Message + garde::Validate,
        M::Context: Default,
    {
        self.validator::<M>(Arc::new(GardeValidator::<M>::new()))
    }

    /// Service available to handlers declaring it by `name`.
    pub fn dependency<T: Send + Sync + 'static>(mut self, name: impl Into<String>, service: Arc<T>) -> Self {
        self.dependencies.insert(name, service);
        self
    }

    /// Additional argument resolver, consulted after the built-in ones.
    pub fn resolver(mut self, resolver: Arc<dyn ArgumentResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    /// Accept messages of type `M` even if no handler consumes them.
    pub fn message_type<M: Message>(mut self) -> Self {
        self.message_types.push(MessageTypeRegistry::register::<M>);
        self
    }

    /// Wire everything together.
    pub fn build(self) -> Result<ServiceBus, RouterError> {
        let Self {
            transport,
            default_destination,
            config,
            encoder,
            decoders,
            routes,
            handlers,
            validators,
            dependencies,
            resolvers,
            message_types,
        } = self;

        let mut types = MessageTypeRegistry::new();
        for register in message_types {
            register(&mut types)?;
        }

        let mut all_resolvers = default_resolvers(Arc::new(dependencies));
        all_resolvers.extend(resolvers);

        let mut factory = MessageExecutorFactory::new(all_resolvers)
            .with_default_timeout(config.default_execution_timeout);
        for (type_id, validator) in validators {
            factory = factory.with_validator(type_id, validator);
        }

        let mut router = MessageRouter::new();
        for descriptor in &handlers {
            (descriptor.register_type)(&mut types)?;
            let executor = factory.create(descriptor)?;
            router.register(descriptor.kind, descriptor.message_type, descriptor.message_name, executor)?;
            debug!(
                handler = descriptor.id(),
                message = descriptor.message_name,
                executors = router.executors_for(descriptor.message_name).len(),
                "handler registered"
            );
        }

        let mut message_decoders =
            MessageDecoders::new(Arc::new(JsonMessageDecoder::new(Arc::new(types))));
        for decoder in decoders {
            message_decoders = message_decoders.with_decoder(decoder);
        }

        let default_endpoint = Arc::new(TransportEndpoint::new(
            default_destination.to_string(),
            default_destination,
            transport.clone(),
            encoder,
        ));
        let mut endpoints = EndpointRouter::new(default_endpoint);
        for (namespace, endpoint) in routes {
            endpoints.route(namespace, endpoint);
        }
        let endpoints = Arc::new(endpoints);

        let contexts = ContextFactory::new(endpoints.clone());
        let processor = EntryPointProcessor::new(
            Arc::new(message_decoders),
            Arc::new(router),
            contexts.clone(),
        );
        let entry_point = EntryPoint::new(transport, Arc::new(processor), config.entry_point.clone());

        info!(
            entry_point = %config.entry_point.name,
            handlers = handlers.len(),
            "service bus built"
        );

        Ok(ServiceBus {
            entry_point: Arc::new(entry_point),
            contexts,
            config,
        })
    }
}

/// A wired bus.
pub struct ServiceBus {
    entry_point: Arc<EntryPoint>,
    contexts: ContextFactory,
    config: ServiceBusConfig,
}

impl ServiceBus {
    /// The consumption loop.
    pub fn entry_point(&self) -> Arc<EntryPoint> {
        self.entry_point.clone()
    }

    /// Context for delivering messages from outside a handler, on a new trace.
    pub fn context(&self) -> MessageContext {
        self.contexts.outbound(TraceId::new())
    }

    /// Context for delivering messages on an existing trace.
    pub fn context_with_trace(&self, trace_id: TraceId) -> MessageContext {
        self.contexts.outbound(trace_id)
    }

    /// Consume `queues` until stopped.
    pub async fn listen(&self, queues: &[Queue]) -> Result<(), TransportError> {
        self.entry_point.listen(queues).await
    }

    /// Stop consuming and drain in-flight packages.
    pub async fn stop(&self) -> Result<(), TransportError> {
        self.entry_point.stop().await
    }

    /// Configuration in use.
    pub fn config(&self) -> &ServiceBusConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MessageContext;
    use crate::handler::ServiceHandler;
    use crate::testing::InMemoryTransport;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct CloseAccount {
        account_id: String,
    }

    impl Message for CloseAccount {}

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct AccountAudit {
        account_id: String,
    }

    impl Message for AccountAudit {}

    struct Close;

    #[async_trait]
    impl ServiceHandler<CloseAccount> for Close {
        async fn handle(&self, _message: &CloseAccount, _ctx: &MessageContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_command_handler_fails_build() {
        let transport = Arc::new(InMemoryTransport::new());
        let result = ServiceBusBuilder::new(transport, DeliveryDestination::new("accounts"))
            .handler(HandlerDescriptor::command::<CloseAccount, _>("accounts.close", Close))
            .handler(HandlerDescriptor::command::<CloseAccount, _>("accounts.close.v2", Close))
            .build();

        assert!(matches!(result, Err(RouterError::DuplicateCommandHandler { .. })));
    }

    #[test]
    fn test_shared_namespace_fails_build() {
        #[derive(Debug, Clone, Serialize, Deserialize)]
        struct AccountFrozen {
            account_id: String,
        }

        impl Message for AccountFrozen {
            fn message_name() -> &'static str {
                "accounts.status_changed"
            }
        }

        #[derive(Debug, Clone, Serialize, Deserialize)]
        struct AccountReopened {
            account_id: String,
        }

        impl Message for AccountReopened {
            fn message_name() -> &'static str {
                "accounts.status_changed"
            }
        }

        struct Reopened;

        #[async_trait]
        impl ServiceHandler<AccountReopened> for Reopened {
            async fn handle(&self, _message: &AccountReopened, _ctx: &MessageContext) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let transport = Arc::new(InMemoryTransport::new());
        let result = ServiceBusBuilder::new(transport, DeliveryDestination::new("accounts"))
            .message_type::<AccountFrozen>()
            .handler(HandlerDescriptor::listener::<AccountReopened, _>("accounts.reopened", Reopened))
            .build();

        assert!(matches!(
            result,
            Err(RouterError::NamespaceConflict { ref namespace, .. }) if namespace == "accounts.status_changed"
        ));
    }

    #[tokio::test]
    async fn test_routes_override_default_destination() {
        let transport = Arc::new(InMemoryTransport::new());
        let bus = ServiceBusBuilder::new(transport.clone(), DeliveryDestination::new("accounts"))
            .route_to::<AccountAudit>(DeliveryDestination::new("audit"))
            .build()
            .unwrap();

        let ctx = bus.context();
        ctx.delivery(&CloseAccount {
            account_id: "a-1".into(),
        })
        .await
        .unwrap();
        ctx.delivery(&AccountAudit {
            account_id: "a-1".into(),
        })
        .await
        .unwrap();

        let destinations: Vec<String> = transport
            .sent()
            .iter()
            .map(|p| p.destination.destination.clone())
            .collect();
        assert_eq!(destinations, vec!["accounts", "audit"]);
    }
}
