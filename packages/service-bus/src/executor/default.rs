use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::warn;

use super::MessageExecutor;
use crate::argument::{ArgumentDescriptor, ArgumentResolver, Arguments};
use crate::context::MessageContext;
use crate::error::{panic_message, ExecutionError};
use crate::handler::{FailureEventFactory, MessageHandler};
use crate::package::DeliveryOptions;

/// Resolves arguments and runs the handler.
///
/// A handler error or panic is delivered as the configured failure event when
/// there is one, and returned to the caller otherwise.
pub struct DefaultMessageExecutor {
    id: String,
    handler: Arc<dyn MessageHandler>,
    arguments: Vec<ArgumentDescriptor>,
    resolvers: Arc<Vec<Arc<dyn ArgumentResolver>>>,
    failure_event: Option<FailureEventFactory>,
}

impl DefaultMessageExecutor {
    pub fn new(
        id: String,
        handler: Arc<dyn MessageHandler>,
        arguments: Vec<ArgumentDescriptor>,
        resolvers: Arc<Vec<Arc<dyn ArgumentResolver>>>,
        failure_event: Option<FailureEventFactory>,
    ) -> Self {
        Self {
            id,
            handler,
            arguments,
            resolvers,
            failure_event,
        }
    }
}

#[async_trait]
impl MessageExecutor for DefaultMessageExecutor {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        message: Arc<dyn Any + Send + Sync>,
        ctx: MessageContext,
    ) -> Result<(), ExecutionError> {
        let arguments = Arguments::resolve(&self.id, &self.arguments, &self.resolvers, &message, &ctx)?;

        // Handlers are not UnwindSafe; the panic is reported, never resumed
        let outcome = AssertUnwindSafe(self.handler.handle(arguments))
            .catch_unwind()
            .await;

        let (reason, error) = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(source)) => (
                format!("{source:#}"),
                ExecutionError::Handler {
                    handler: self.id.clone(),
                    source,
                },
            ),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                (
                    message.clone(),
                    ExecutionError::Panicked {
                        handler: self.id.clone(),
                        message,
                    },
                )
            }
        };

        let Some(factory) = &self.failure_event else {
            return Err(error);
        };

        let event = factory(ctx.trace_id(), reason);
        warn!(
            handler = %self.id,
            error = %error,
            event = event.message_name(),
            "handler failed, delivering failure event"
        );
        ctx.delivery_any(&*event, DeliveryOptions::new())
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::argument::{default_resolvers, Dependencies};
    use crate::core::{Message, TraceId};
    use crate::handler::{ExecutionFailedEvent, HandlerDescriptor, HandlerOptions, ServiceHandler};
    use crate::testing::{test_endpoints, InMemoryTransport};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct SendInvoice {
        invoice_id: String,
    }

    impl Message for SendInvoice {
        fn message_name() -> &'static str {
            "billing.send_invoice"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct SendInvoiceFailed {
        trace_id: TraceId,
        reason: String,
    }

    impl Message for SendInvoiceFailed {
        fn message_name() -> &'static str {
            "billing.send_invoice_failed"
        }
    }

    impl ExecutionFailedEvent for SendInvoiceFailed {
        fn create(trace_id: TraceId, reason: String) -> Self {
            Self { trace_id, reason }
        }
    }

    struct Failing;

    #[async_trait]
    impl ServiceHandler<SendInvoice> for Failing {
        async fn handle(&self, message: &SendInvoice, _ctx: &MessageContext) -> anyhow::Result<()> {
            anyhow::bail!("smtp unavailable for {}", message.invoice_id)
        }
    }

    struct Panicking;

    #[async_trait]
    impl ServiceHandler<SendInvoice> for Panicking {
        async fn handle(&self, _message: &SendInvoice, _ctx: &MessageContext) -> anyhow::Result<()> {
            panic!("template missing")
        }
    }

    fn executor(descriptor: HandlerDescriptor) -> DefaultMessageExecutor {
        DefaultMessageExecutor::new(
            descriptor.id.clone(),
            descriptor.handler.clone(),
            descriptor.arguments.clone(),
            Arc::new(default_resolvers(Arc::new(Dependencies::new()))),
            descriptor.options.failure_event.clone(),
        )
    }

    fn invoice() -> Arc<dyn Any + Send + Sync> {
        Arc::new(SendInvoice {
            invoice_id: "inv-1".into(),
        })
    }

    #[tokio::test]
    async fn test_error_propagates_without_failure_event() {
        let transport = Arc::new(InMemoryTransport::new());
        let ctx = MessageContext::outbound(TraceId::new(), test_endpoints(&transport));
        let executor = executor(HandlerDescriptor::command::<SendInvoice, _>("billing.send", Failing));

        let result = executor.execute(invoice(), ctx).await;

        assert!(matches!(result, Err(ExecutionError::Handler { ref handler, .. }) if handler == "billing.send"));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_failure_event_replaces_error() {
        let transport = Arc::new(InMemoryTransport::new());
        let trace = TraceId::new();
        let ctx = MessageContext::outbound(trace, test_endpoints(&transport));
        let executor = executor(
            HandlerDescriptor::command::<SendInvoice, _>("billing.send", Failing)
                .with_options(HandlerOptions::new().on_failure::<SendInvoiceFailed>()),
        );

        executor.execute(invoice(), ctx).await.unwrap();

        let events = transport.sent_messages::<SendInvoiceFailed>();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trace_id, trace);
        assert!(events[0].reason.contains("smtp unavailable for inv-1"));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let transport = Arc::new(InMemoryTransport::new());
        let ctx = MessageContext::outbound(TraceId::new(), test_endpoints(&transport));
        let executor = executor(HandlerDescriptor::command::<SendInvoice, _>("billing.send", Panicking));

        let result = executor.execute(invoice(), ctx).await;

        assert!(matches!(
            result,
            Err(ExecutionError::Panicked { ref message, .. }) if message == "template missing"
        ));
    }

    #[tokio::test]
    async fn test_wrong_message_type_fails_in_handler() {
        let transport = Arc::new(InMemoryTransport::new());
        let ctx = MessageContext::outbound(TraceId::new(), test_endpoints(&transport));
        let executor = executor(HandlerDescriptor::command::<SendInvoice, _>("billing.send", Failing));

        let result = executor.execute(Arc::new(1_u8), ctx).await;
        assert!(matches!(result, Err(ExecutionError::Handler { .. })));
    }
}
