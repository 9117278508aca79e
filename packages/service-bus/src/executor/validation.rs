use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::MessageExecutor;
use crate::context::MessageContext;
use crate::error::ExecutionError;
use crate::handler::ValidationFailedFactory;
use crate::package::DeliveryOptions;
use crate::validation::MessageValidator;

/// Validates the message before handing it to the inner executor.
///
/// On violations either the validation-failed event is delivered and the
/// handler is skipped, or the violations are bound to the context and the
/// handler runs anyway.
pub struct ValidationExecutor {
    inner: Arc<dyn MessageExecutor>,
    validator: Arc<dyn MessageValidator>,
    groups: Vec<String>,
    failure_event: Option<ValidationFailedFactory>,
}

impl ValidationExecutor {
    pub fn new(
        inner: Arc<dyn MessageExecutor>,
        validator: Arc<dyn MessageValidator>,
        groups: Vec<String>,
        failure_event: Option<ValidationFailedFactory>,
    ) -> Self {
        Self {
            inner,
            validator,
            groups,
            failure_event,
        }
    }
}

#[async_trait]
impl MessageExecutor for ValidationExecutor {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn execute(
        &self,
        message: Arc<dyn Any + Send + Sync>,
        ctx: MessageContext,
    ) -> Result<(), ExecutionError> {
        let violations = self.validator.validate(message.as_ref(), &self.groups);
        if violations.is_empty() {
            return self.inner.execute(message, ctx).await;
        }

        debug!(
            handler = self.id(),
            violations = %violations,
            "message failed validation"
        );

        match &self.failure_event {
            Some(factory) => {
                let event = factory(ctx.trace_id(), violations);
                ctx.delivery_any(&*event, DeliveryOptions::new()).await?;
                Ok(())
            }
            None => {
                self.inner
                    .execute(message, ctx.with_violations(violations))
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Message, TraceId};
    use crate::handler::{HandlerOptions, ValidationFailedEvent};
    use crate::testing::{test_endpoints, InMemoryTransport};
    use crate::validation::{GardeValidator, ValidationViolations};
    use garde::Validate;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, Clone, Serialize, Deserialize, Validate)]
    struct RenameProduct {
        #[garde(length(min = 3))]
        title: String,
    }

    impl Message for RenameProduct {}

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct RenameProductRejected {
        trace_id: TraceId,
        violations: ValidationViolations,
    }

    impl Message for RenameProductRejected {}

    impl ValidationFailedEvent for RenameProductRejected {
        fn create(trace_id: TraceId, violations: ValidationViolations) -> Self {
            Self {
                trace_id,
                violations,
            }
        }
    }

    /// Records whether it ran and what the context said about validity.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl MessageExecutor for Recorder {
        fn id(&self) -> &str {
            "catalog.rename"
        }

        async fn execute(
            &self,
            _message: Arc<dyn Any + Send + Sync>,
            ctx: MessageContext,
        ) -> Result<(), ExecutionError> {
            self.seen.lock().unwrap().push(ctx.is_valid());
            Ok(())
        }
    }

    fn rename(title: &str) -> Arc<dyn Any + Send + Sync> {
        Arc::new(RenameProduct {
            title: title.to_string(),
        })
    }

    #[tokio::test]
    async fn test_violations_bound_to_context_without_failure_event() {
        let transport = Arc::new(InMemoryTransport::new());
        let recorder = Arc::new(Recorder::default());
        let executor = ValidationExecutor::new(
            recorder.clone(),
            Arc::new(GardeValidator::<RenameProduct>::new()),
            Vec::new(),
            None,
        );

        let ctx = MessageContext::outbound(TraceId::new(), test_endpoints(&transport));
        executor.execute(rename("ok title"), ctx.clone()).await.unwrap();
        executor.execute(rename("x"), ctx).await.unwrap();

        assert_eq!(*recorder.seen.lock().unwrap(), vec![true, false]);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_failure_event_skips_handler() {
        let transport = Arc::new(InMemoryTransport::new());
        let recorder = Arc::new(Recorder::default());
        let options = HandlerOptions::new().on_validation_failure::<RenameProductRejected>();
        let executor = ValidationExecutor::new(
            recorder.clone(),
            Arc::new(GardeValidator::<RenameProduct>::new()),
            Vec::new(),
            options.validation_failed_event,
        );

        let trace = TraceId::new();
        let ctx = MessageContext::outbound(trace, test_endpoints(&transport));
        executor.execute(rename("x"), ctx).await.unwrap();

        assert!(recorder.seen.lock().unwrap().is_empty());
        let rejected = transport.sent_messages::<RenameProductRejected>();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].trace_id, trace);
        assert_eq!(rejected[0].violations.for_property("title").count(), 1);
    }
}
