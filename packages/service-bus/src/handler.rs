//! Message handlers and their registration descriptors.
//!
//! # Overview
//!
//! Handlers are registered explicitly, once, at startup. Each registration is
//! a [`HandlerDescriptor`]: the message type, whether the handler is a command
//! handler or an event listener, the handler itself, the arguments it declares
//! and its [`HandlerOptions`].
//!
//! Most handlers implement the typed [`ServiceHandler`] trait. Handlers that
//! need injected services declare them and implement [`MessageHandler`]
//! directly.
//!
//! # Example
//!
//! ```ignore
//! struct PlaceOrderHandler;
//!
//! #[async_trait]
//! impl ServiceHandler<PlaceOrder> for PlaceOrderHandler {
//!     async fn handle(&self, command: &PlaceOrder, ctx: &MessageContext) -> anyhow::Result<()> {
//!         ctx.delivery(&OrderPlaced { order_id: command.order_id.clone() }).await?;
//!         Ok(())
//!     }
//! }
//!
//! let descriptor = HandlerDescriptor::command::<PlaceOrder, _>("orders.place", PlaceOrderHandler)
//!     .with_options(HandlerOptions::new().on_failure::<PlaceOrderFailed>());
//! ```

use std::any::TypeId;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::argument::{ArgumentDescriptor, Arguments};
use crate::codec::MessageTypeRegistry;
use crate::context::MessageContext;
use crate::core::{AnyMessage, Message, TraceId};
use crate::error::RouterError;
use crate::validation::ValidationViolations;

/// A handler receiving resolved arguments.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one message.
    async fn handle(&self, arguments: Arguments) -> Result<()>;
}

/// A handler for one message type.
#[async_trait]
pub trait ServiceHandler<M: Message>: Send + Sync + 'static {
    /// Handle one message.
    async fn handle(&self, message: &M, ctx: &MessageContext) -> Result<()>;
}

/// Adapts a [`ServiceHandler`] to the raw [`MessageHandler`] interface.
struct TypedHandler<M, H> {
    inner: H,
    _message: PhantomData<fn() -> M>,
}

#[async_trait]
impl<M, H> MessageHandler for TypedHandler<M, H>
where
    M: Message,
    H: ServiceHandler<M>,
{
    async fn handle(&self, arguments: Arguments) -> Result<()> {
        let message = arguments
            .message::<M>()
            .ok_or_else(|| anyhow!("message argument is not a `{}`", <M as Message>::message_name()))?;
        let ctx = arguments
            .context()
            .ok_or_else(|| anyhow!("context argument is missing"))?;

        self.inner.handle(message, ctx).await
    }
}

/// An event delivered in place of a failed handler's error.
pub trait ExecutionFailedEvent: Message {
    /// Build the event from the trace id and the failure reason.
    fn create(trace_id: TraceId, reason: String) -> Self;
}

/// An event delivered when a message fails validation.
pub trait ValidationFailedEvent: Message {
    /// Build the event from the trace id and the violations found.
    fn create(trace_id: TraceId, violations: ValidationViolations) -> Self;
}

/// Builds a failure event for a handler error.
pub type FailureEventFactory = Arc<dyn Fn(TraceId, String) -> Box<dyn AnyMessage> + Send + Sync>;

/// Builds a failure event for validation violations.
pub type ValidationFailedFactory =
    Arc<dyn Fn(TraceId, ValidationViolations) -> Box<dyn AnyMessage> + Send + Sync>;

/// Execution options of one handler.
#[derive(Clone, Default)]
pub struct HandlerOptions {
    /// Validate the message before the handler runs.
    pub validate: bool,
    /// Rule groups passed to the validator. Empty means all rules.
    pub validation_groups: Vec<String>,
    /// Event delivered instead of propagating a handler failure.
    pub failure_event: Option<FailureEventFactory>,
    /// Event delivered instead of running the handler on invalid input.
    pub validation_failed_event: Option<ValidationFailedFactory>,
    /// Upper bound on a single execution.
    pub execution_timeout: Option<Duration>,
}

impl HandlerOptions {
    /// No validation, no failure events, no timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate messages before execution.
    pub fn with_validation<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.validate = true;
        self.validation_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Deliver `E` when the handler fails.
    pub fn on_failure<E: ExecutionFailedEvent>(mut self) -> Self {
        self.failure_event = Some(Arc::new(|trace_id: TraceId, reason: String| {
            Box::new(E::create(trace_id, reason)) as Box<dyn AnyMessage>
        }));
        self
    }

    /// Deliver `E` and skip the handler when validation fails.
    ///
    /// Implies [`with_validation`](Self::with_validation) with all groups if
    /// validation was not enabled yet.
    pub fn on_validation_failure<E: ValidationFailedEvent>(mut self) -> Self {
        self.validate = true;
        self.validation_failed_event = Some(Arc::new(|trace_id: TraceId, violations: ValidationViolations| {
            Box::new(E::create(trace_id, violations)) as Box<dyn AnyMessage>
        }));
        self
    }

    /// Fail executions running longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for HandlerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerOptions")
            .field("validate", &self.validate)
            .field("validation_groups", &self.validation_groups)
            .field("failure_event", &self.failure_event.is_some())
            .field("validation_failed_event", &self.validation_failed_event.is_some())
            .field("execution_timeout", &self.execution_timeout)
            .finish()
    }
}

/// Whether a handler consumes commands or listens to events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// Exactly one handler per message type.
    Command,
    /// Any number of listeners per message type.
    Listener,
}

/// One entry of the registration table.
#[derive(Clone)]
pub struct HandlerDescriptor {
    pub(crate) id: String,
    pub(crate) kind: HandlerKind,
    pub(crate) message_type: TypeId,
    pub(crate) message_name: &'static str,
    pub(crate) register_type: fn(&mut MessageTypeRegistry) -> Result<(), RouterError>,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) arguments: Vec<ArgumentDescriptor>,
    pub(crate) options: HandlerOptions,
}

impl HandlerDescriptor {
    /// Register `handler` as the command handler for `M`.
    pub fn command<M, H>(id: impl Into<String>, handler: H) -> Self
    where
        M: Message,
        H: ServiceHandler<M>,
    {
        Self::typed::<M, H>(HandlerKind::Command, id, handler)
    }

    /// Register `handler` as an event listener for `M`.
    pub fn listener<M, H>(id: impl Into<String>, handler: H) -> Self
    where
        M: Message,
        H: ServiceHandler<M>,
    {
        Self::typed::<M, H>(HandlerKind::Listener, id, handler)
    }

    /// Register a raw handler with explicitly declared arguments.
    pub fn raw<M: Message>(
        kind: HandlerKind,
        id: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        arguments: Vec<ArgumentDescriptor>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            message_type: TypeId::of::<M>(),
            message_name: <M as Message>::message_name(),
            register_type: MessageTypeRegistry::register::<M>,
            handler,
            arguments,
            options: HandlerOptions::default(),
        }
    }

    fn typed<M, H>(kind: HandlerKind, id: impl Into<String>, handler: H) -> Self
    where
        M: Message,
        H: ServiceHandler<M>,
    {
        let handler = Arc::new(TypedHandler {
            inner: handler,
            _message: PhantomData,
        });
        Self::raw::<M>(
            kind,
            id,
            handler,
            vec![
                ArgumentDescriptor::message("message"),
                ArgumentDescriptor::context("context"),
            ],
        )
    }

    /// Replace the execution options.
    pub fn with_options(mut self, options: HandlerOptions) -> Self {
        self.options = options;
        self
    }

    /// Handler id, used in logs and errors.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Command handler or listener.
    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    /// Namespace of the handled message.
    pub fn message_name(&self) -> &'static str {
        self.message_name
    }

    /// Execution options.
    pub fn options(&self) -> &HandlerOptions {
        &self.options
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("message", &self.message_name)
            .field("arguments", &self.arguments)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ReserveStock {
        sku: String,
    }

    impl Message for ReserveStock {
        fn message_name() -> &'static str {
            "stock.reserve"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ReserveStockFailed {
        trace_id: TraceId,
        reason: String,
    }

    impl Message for ReserveStockFailed {}

    impl ExecutionFailedEvent for ReserveStockFailed {
        fn create(trace_id: TraceId, reason: String) -> Self {
            Self { trace_id, reason }
        }
    }

    struct Noop;

    #[async_trait]
    impl ServiceHandler<ReserveStock> for Noop {
        async fn handle(&self, _message: &ReserveStock, _ctx: &MessageContext) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_typed_descriptor_declares_message_and_context() {
        let descriptor = HandlerDescriptor::command::<ReserveStock, _>("stock.reserve", Noop);

        assert_eq!(descriptor.kind(), HandlerKind::Command);
        assert_eq!(descriptor.message_name(), "stock.reserve");
        assert_eq!(descriptor.message_type, TypeId::of::<ReserveStock>());
        assert_eq!(descriptor.arguments.len(), 2);
    }

    #[test]
    fn test_failure_event_factory_builds_event() {
        let options = HandlerOptions::new()
            .on_failure::<ReserveStockFailed>()
            .with_timeout(Duration::from_secs(5));
        let trace = TraceId::new();

        let factory = options.failure_event.as_ref().unwrap();
        let event = factory(trace, "out of stock".into());
        let event = event.as_any().downcast_ref::<ReserveStockFailed>().unwrap();

        assert_eq!(event.trace_id, trace);
        assert_eq!(event.reason, "out of stock");
        assert_eq!(options.execution_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_validation_failure_event_enables_validation() {
        #[derive(Debug, Clone, Serialize, Deserialize)]
        struct Invalid {
            trace_id: TraceId,
            count: usize,
        }
        impl Message for Invalid {}
        impl ValidationFailedEvent for Invalid {
            fn create(trace_id: TraceId, violations: ValidationViolations) -> Self {
                Self {
                    trace_id,
                    count: violations.len(),
                }
            }
        }

        let options = HandlerOptions::new().on_validation_failure::<Invalid>();
        assert!(options.validate);
        assert!(options.validation_groups.is_empty());
    }
}
