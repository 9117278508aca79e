use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::MessageExecutor;
use crate::context::MessageContext;
use crate::error::ExecutionError;

/// Fails executions that run longer than a fixed limit.
///
/// The inner execution runs on its own task with a child cancellation token.
/// On expiry the token is cancelled and the timeout is reported; the task is
/// left to observe cancellation on its own and is not awaited further.
pub struct TimeLimitExecutor {
    inner: Arc<dyn MessageExecutor>,
    timeout: Duration,
}

impl TimeLimitExecutor {
    pub fn new(inner: Arc<dyn MessageExecutor>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl MessageExecutor for TimeLimitExecutor {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn execute(
        &self,
        message: Arc<dyn Any + Send + Sync>,
        ctx: MessageContext,
    ) -> Result<(), ExecutionError> {
        let token = ctx.cancellation().child_token();
        let ctx = ctx.with_cancellation(token.clone());

        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.execute(message, ctx).await });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(ExecutionError::Panicked {
                handler: self.id().to_string(),
                message: join_error.to_string(),
            }),
            Err(_) => {
                token.cancel();
                warn!(
                    handler = self.id(),
                    timeout = ?self.timeout,
                    "execution timed out, cancellation requested"
                );
                Err(ExecutionError::Timeout {
                    handler: self.id().to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }
}
