//! Per-message execution context.
//!
//! # Immutability
//!
//! [`MessageContext`] is cheap to clone and clones are semantically identical.
//! Decorators that need a different view (bound violations, a child
//! cancellation token) derive a new context instead of mutating a shared one.
//!
//! # Trace Propagation
//!
//! Every message delivered through a context carries the context's
//! [`TraceId`], so everything caused by one incoming package shares its trace.
//!
//! # Cancellation
//!
//! [`MessageContext::cancellation`] is cancelled when the handler's execution
//! timeout expires. Handlers observe it at their own suspension points:
//!
//! ```ignore
//! tokio::select! {
//!     _ = ctx.cancellation().cancelled() => return Ok(()),
//!     rows = repository.load(id) => { ... }
//! }
//! ```

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::{AnyMessage, EncodedMessage, Message, TraceId};
use crate::endpoint::EndpointRouter;
use crate::error::DeliveryError;
use crate::package::{DeliveryOptions, Headers, IncomingPackage};
use crate::validation::ValidationViolations;

/// Context handed to every handler invocation.
#[derive(Clone)]
pub struct MessageContext {
    package_id: Option<Arc<str>>,
    trace_id: TraceId,
    headers: Arc<Headers>,
    violations: Option<Arc<ValidationViolations>>,
    cancellation: CancellationToken,
    endpoints: Arc<EndpointRouter>,
}

impl MessageContext {
    /// Context for delivering messages outside of a handler.
    pub fn outbound(trace_id: TraceId, endpoints: Arc<EndpointRouter>) -> Self {
        Self {
            package_id: None,
            trace_id,
            headers: Arc::new(Headers::new()),
            violations: None,
            cancellation: CancellationToken::new(),
            endpoints,
        }
    }

    /// Id of the incoming package being handled, if any.
    pub fn package_id(&self) -> Option<&str> {
        self.package_id.as_deref()
    }

    /// Trace id propagated to every delivered message.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// Headers of the incoming package.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Violations bound by the validation step.
    pub fn violations(&self) -> Option<&ValidationViolations> {
        self.violations.as_deref()
    }

    /// Returns `false` if the validation step bound any violations.
    pub fn is_valid(&self) -> bool {
        self.violations.as_ref().map_or(true, |v| v.is_empty())
    }

    /// Cooperative cancellation signal for this execution.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Returns `true` once the execution has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Derive a context with violations bound.
    pub fn with_violations(&self, violations: ValidationViolations) -> Self {
        Self {
            violations: Some(Arc::new(violations)),
            ..self.clone()
        }
    }

    /// Derive a context with a different cancellation token.
    pub fn with_cancellation(&self, cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            ..self.clone()
        }
    }

    /// Deliver a message with default options.
    pub async fn delivery<M: Message>(&self, message: &M) -> Result<(), DeliveryError> {
        self.delivery_with_options(message, DeliveryOptions::new())
            .await
    }

    /// Deliver a message with explicit options.
    pub async fn delivery_with_options<M: Message>(
        &self,
        message: &M,
        options: DeliveryOptions,
    ) -> Result<(), DeliveryError> {
        self.delivery_any(message, options).await
    }

    /// Deliver a type-erased message.
    pub async fn delivery_any(
        &self,
        message: &dyn AnyMessage,
        options: DeliveryOptions,
    ) -> Result<(), DeliveryError> {
        let envelope = message.encode()?;
        self.delivery_encoded(&envelope, options).await
    }

    /// Deliver an already encoded message verbatim.
    pub async fn delivery_encoded(
        &self,
        envelope: &EncodedMessage,
        options: DeliveryOptions,
    ) -> Result<(), DeliveryError> {
        for endpoint in self.endpoints.endpoints(&envelope.namespace) {
            debug!(
                endpoint = endpoint.name(),
                message = %envelope.namespace,
                trace_id = %self.trace_id,
                "delivering message"
            );
            endpoint
                .deliver(envelope, options.clone(), self.trace_id)
                .await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageContext")
            .field("package_id", &self.package_id)
            .field("trace_id", &self.trace_id)
            .field("violations", &self.violations)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish()
    }
}

/// Builds a fresh [`MessageContext`] per (package, executor).
#[derive(Debug, Clone)]
pub struct ContextFactory {
    endpoints: Arc<EndpointRouter>,
}

impl ContextFactory {
    /// Create a factory delivering through `endpoints`.
    pub fn new(endpoints: Arc<EndpointRouter>) -> Self {
        Self { endpoints }
    }

    /// Context for handling `package`.
    pub fn create(&self, package: &dyn IncomingPackage) -> MessageContext {
        MessageContext {
            package_id: Some(Arc::from(package.id())),
            trace_id: package.trace_id(),
            headers: Arc::new(package.headers().clone()),
            violations: None,
            cancellation: CancellationToken::new(),
            endpoints: self.endpoints.clone(),
        }
    }

    /// Context for delivering outside of a handler.
    pub fn outbound(&self, trace_id: TraceId) -> MessageContext {
        MessageContext::outbound(trace_id, self.endpoints.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_endpoints, InMemoryTransport, InMemoryPackage};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OrderShipped {
        order_id: String,
    }

    impl Message for OrderShipped {
        fn message_name() -> &'static str {
            "shop.order_shipped"
        }
    }

    #[tokio::test]
    async fn test_delivery_propagates_trace_id() {
        let transport = Arc::new(InMemoryTransport::new());
        let factory = ContextFactory::new(test_endpoints(&transport));

        let package = InMemoryPackage::new("p-1", b"{}".to_vec());
        let ctx = factory.create(&package);
        assert_eq!(ctx.package_id(), Some("p-1"));

        ctx.delivery(&OrderShipped {
            order_id: "o-1".into(),
        })
        .await
        .unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].trace_id, package.trace_id());
    }

    #[test]
    fn test_derived_contexts_do_not_affect_original() {
        let transport = Arc::new(InMemoryTransport::new());
        let ctx = MessageContext::outbound(TraceId::new(), test_endpoints(&transport));

        let mut violations = ValidationViolations::new();
        violations.push("order_id", "must not be empty");
        let invalid = ctx.with_violations(violations);

        assert!(ctx.is_valid());
        assert!(!invalid.is_valid());
        assert_eq!(invalid.trace_id(), ctx.trace_id());

        let child = ctx.cancellation().child_token();
        let derived = ctx.with_cancellation(child);
        ctx.cancellation().cancel();
        assert!(derived.is_cancelled());
    }
}
