use std::sync::Arc;

use tracing::{debug, error, info_span, Instrument};

use crate::codec::MessageDecoders;
use crate::context::ContextFactory;
use crate::error::TransportError;
use crate::package::IncomingPackage;
use crate::router::MessageRouter;

/// Decodes, routes and executes a single incoming package.
///
/// The package is always acknowledged once processing is over: decode
/// failures, missing handlers and failing handlers are logged, never
/// retried here. Handlers that need redelivery settle the package through
/// their transport adapter themselves.
pub struct EntryPointProcessor {
    decoders: Arc<MessageDecoders>,
    router: Arc<MessageRouter>,
    contexts: ContextFactory,
}

impl EntryPointProcessor {
    pub fn new(decoders: Arc<MessageDecoders>, router: Arc<MessageRouter>, contexts: ContextFactory) -> Self {
        Self {
            decoders,
            router,
            contexts,
        }
    }

    /// Process one package and acknowledge it.
    ///
    /// Only a failure to acknowledge is returned.
    pub async fn handle(&self, package: Arc<dyn IncomingPackage>) -> Result<(), TransportError> {
        let span = info_span!(
            "package",
            package_id = %package.id(),
            trace_id = %package.trace_id(),
        );

        async {
            self.process(package.as_ref()).await;
            package.ack().await
        }
        .instrument(span)
        .await
    }

    async fn process(&self, package: &dyn IncomingPackage) {
        let decoded = match self.decoders.decode(package.payload(), package.headers()) {
            Ok(decoded) => decoded,
            Err(err) => {
                error!(
                    error = %err,
                    payload = %String::from_utf8_lossy(package.payload()),
                    origin = %package.origin(),
                    "unable to decode incoming package, dropping it"
                );
                return;
            }
        };

        let executors = self.router.match_executors(decoded.type_id);
        if executors.is_empty() {
            debug!(message = %decoded.name, "no handlers registered for message");
            return;
        }

        for executor in executors {
            let ctx = self.contexts.create(package);

            debug!(message = %decoded.name, handler = executor.id(), "executing handler");
            if let Err(err) = executor.execute(decoded.payload.clone(), ctx).await {
                error!(
                    message = %decoded.name,
                    handler = executor.id(),
                    error = %err,
                    "handler failed"
                );
            }
        }
    }
}
