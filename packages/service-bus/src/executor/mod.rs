//! Handler execution pipeline.
//!
//! Every registered handler becomes one [`MessageExecutor`]. The executor is
//! built by [`MessageExecutorFactory`] from a [`HandlerDescriptor`] as a stack
//! of decorators:
//!
//! ```text
//! TimeLimitExecutor        (if a timeout is configured)
//!   └─ ValidationExecutor  (if validation is enabled)
//!        └─ DefaultMessageExecutor
//! ```
//!
//! The innermost executor resolves arguments, runs the handler with panics
//! contained and turns failures into the configured failure event.

mod default;
mod time_limit;
mod validation;

pub use default::DefaultMessageExecutor;
pub use time_limit::TimeLimitExecutor;
pub use validation::ValidationExecutor;

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::argument::ArgumentResolver;
use crate::context::MessageContext;
use crate::error::{ExecutionError, RouterError};
use crate::handler::HandlerDescriptor;
use crate::validation::MessageValidator;

/// Executes one handler for one decoded message.
#[async_trait]
pub trait MessageExecutor: Send + Sync + 'static {
    /// Handler id, used in logs and errors.
    fn id(&self) -> &str;

    /// Run the handler.
    async fn execute(
        &self,
        message: Arc<dyn Any + Send + Sync>,
        ctx: MessageContext,
    ) -> Result<(), ExecutionError>;
}

/// Builds executors from handler descriptors.
pub struct MessageExecutorFactory {
    resolvers: Arc<Vec<Arc<dyn ArgumentResolver>>>,
    validators: HashMap<TypeId, Arc<dyn MessageValidator>>,
    default_timeout: Option<Duration>,
}

impl MessageExecutorFactory {
    /// Create a factory using `resolvers` for every executor.
    pub fn new(resolvers: Vec<Arc<dyn ArgumentResolver>>) -> Self {
        Self {
            resolvers: Arc::new(resolvers),
            validators: HashMap::new(),
            default_timeout: None,
        }
    }

    /// Validator used for messages of type `type_id`.
    pub fn with_validator(mut self, type_id: TypeId, validator: Arc<dyn MessageValidator>) -> Self {
        self.validators.insert(type_id, validator);
        self
    }

    /// Timeout applied to handlers that do not configure their own.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Build the executor stack for one handler.
    pub fn create(&self, descriptor: &HandlerDescriptor) -> Result<Arc<dyn MessageExecutor>, RouterError> {
        let options = &descriptor.options;

        let mut executor: Arc<dyn MessageExecutor> = Arc::new(DefaultMessageExecutor::new(
            descriptor.id.clone(),
            descriptor.handler.clone(),
            descriptor.arguments.clone(),
            self.resolvers.clone(),
            options.failure_event.clone(),
        ));

        if options.validate {
            let validator = self
                .validators
                .get(&descriptor.message_type)
                .cloned()
                .ok_or_else(|| RouterError::MissingValidator {
                    handler: descriptor.id.clone(),
                    message: descriptor.message_name.to_string(),
                })?;

            executor = Arc::new(ValidationExecutor::new(
                executor,
                validator,
                options.validation_groups.clone(),
                options.validation_failed_event.clone(),
            ));
        }

        if let Some(timeout) = options.execution_timeout.or(self.default_timeout) {
            executor = Arc::new(TimeLimitExecutor::new(executor, timeout));
        }

        Ok(executor)
    }
}

impl std::fmt::Debug for MessageExecutorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageExecutorFactory")
            .field("resolvers", &self.resolvers.len())
            .field("validators", &self.validators.len())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::argument::{default_resolvers, Dependencies};
    use crate::core::{Message, TraceId};
    use crate::handler::{HandlerOptions, ServiceHandler};
    use crate::testing::{test_endpoints, InMemoryTransport};
    use crate::validation::GardeValidator;
    use garde::Validate;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize, Validate)]
    struct Charge {
        #[garde(range(min = 1))]
        amount: u64,
    }

    impl Message for Charge {}

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl ServiceHandler<Charge> for Counting {
        async fn handle(&self, _message: &Charge, _ctx: &MessageContext) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn factory() -> MessageExecutorFactory {
        MessageExecutorFactory::new(default_resolvers(Arc::new(Dependencies::new())))
    }

    #[test]
    fn test_validation_without_validator_is_rejected() {
        let descriptor = HandlerDescriptor::command::<Charge, _>("billing.charge", Counting(Default::default()))
            .with_options(HandlerOptions::new().with_validation(Vec::<String>::new()));

        let result = factory().create(&descriptor);
        assert!(matches!(result, Err(RouterError::MissingValidator { .. })));
    }

    #[tokio::test]
    async fn test_composed_stack_runs_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let descriptor = HandlerDescriptor::command::<Charge, _>("billing.charge", Counting(calls.clone()))
            .with_options(
                HandlerOptions::new()
                    .with_validation(Vec::<String>::new())
                    .with_timeout(Duration::from_secs(1)),
            );

        let executor = factory()
            .with_validator(TypeId::of::<Charge>(), Arc::new(GardeValidator::<Charge>::new()))
            .create(&descriptor)
            .unwrap();

        let transport = Arc::new(InMemoryTransport::new());
        let ctx = MessageContext::outbound(TraceId::new(), test_endpoints(&transport));
        executor
            .execute(Arc::new(Charge { amount: 10 }), ctx)
            .await
            .unwrap();

        assert_eq!(executor.id(), "billing.charge");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
