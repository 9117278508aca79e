//! Outbound endpoints.
//!
//! An [`Endpoint`] is where a delivered message goes. The
//! [`EndpointRouter`] maps message namespaces to endpoints; anything without an
//! explicit route goes to the default endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::codec::MessageEncoder;
use crate::core::{EncodedMessage, TraceId};
use crate::error::DeliveryError;
use crate::package::{
    DeliveryDestination, DeliveryOptions, OutboundPackage, ENCODER_HEADER, MESSAGE_TYPE_HEADER,
};
use crate::transport::Transport;

/// A destination for outbound messages.
#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    /// Endpoint name, used in logs.
    fn name(&self) -> &str;

    /// Deliver an encoded message.
    async fn deliver(
        &self,
        envelope: &EncodedMessage,
        options: DeliveryOptions,
        trace_id: TraceId,
    ) -> Result<(), DeliveryError>;
}

/// Endpoint that encodes messages and hands them to a [`Transport`].
pub struct TransportEndpoint {
    name: String,
    destination: DeliveryDestination,
    transport: Arc<dyn Transport>,
    encoder: Arc<dyn MessageEncoder>,
}

impl TransportEndpoint {
    /// Create an endpoint sending to `destination` through `transport`.
    pub fn new(
        name: impl Into<String>,
        destination: DeliveryDestination,
        transport: Arc<dyn Transport>,
        encoder: Arc<dyn MessageEncoder>,
    ) -> Self {
        Self {
            name: name.into(),
            destination,
            transport,
            encoder,
        }
    }

    /// Destination packages are addressed to.
    pub fn destination(&self) -> &DeliveryDestination {
        &self.destination
    }
}

#[async_trait]
impl Endpoint for TransportEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(
        &self,
        envelope: &EncodedMessage,
        options: DeliveryOptions,
        trace_id: TraceId,
    ) -> Result<(), DeliveryError> {
        let payload = self.encoder.encode_envelope(envelope)?;

        let options = options
            .with_header(ENCODER_HEADER, self.encoder.key())
            .with_header(MESSAGE_TYPE_HEADER, envelope.namespace.clone());
        let package = OutboundPackage::new(payload, self.destination.clone(), trace_id, options);

        debug!(
            endpoint = %self.name,
            destination = %self.destination,
            message = %envelope.namespace,
            trace_id = %trace_id,
            "sending package"
        );

        self.transport.send(package).await?;
        Ok(())
    }
}

/// Maps message namespaces to the endpoints they are delivered to.
#[derive(Clone)]
pub struct EndpointRouter {
    default: Arc<dyn Endpoint>,
    routes: HashMap<String, Vec<Arc<dyn Endpoint>>>,
}

impl EndpointRouter {
    /// Create a router that sends everything to `default`.
    pub fn new(default: Arc<dyn Endpoint>) -> Self {
        Self {
            default,
            routes: HashMap::new(),
        }
    }

    /// Route `namespace` to an additional endpoint.
    ///
    /// Once a namespace has an explicit route the default endpoint no longer
    /// receives it.
    pub fn route(&mut self, namespace: impl Into<String>, endpoint: Arc<dyn Endpoint>) {
        self.routes.entry(namespace.into()).or_default().push(endpoint);
    }

    /// Endpoints for a namespace.
    pub fn endpoints(&self, namespace: &str) -> Vec<Arc<dyn Endpoint>> {
        match self.routes.get(namespace) {
            Some(endpoints) if !endpoints.is_empty() => endpoints.clone(),
            _ => vec![self.default.clone()],
        }
    }

    /// The default endpoint.
    pub fn default_endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.default
    }
}

impl std::fmt::Debug for EndpointRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRouter")
            .field("default", &self.default.name())
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonMessageEncoder;
    use crate::testing::InMemoryTransport;

    fn endpoint(name: &str, transport: &Arc<InMemoryTransport>) -> Arc<dyn Endpoint> {
        Arc::new(TransportEndpoint::new(
            name,
            DeliveryDestination::new(name),
            transport.clone(),
            Arc::new(JsonMessageEncoder),
        ))
    }

    #[tokio::test]
    async fn test_transport_endpoint_sets_codec_headers() {
        let transport = Arc::new(InMemoryTransport::new());
        let endpoint = endpoint("orders", &transport);
        let trace = TraceId::new();

        let envelope = EncodedMessage {
            namespace: "shop.place_order".into(),
            message: serde_json::json!({"order_id": "o-1"}),
        };
        endpoint
            .deliver(&envelope, DeliveryOptions::new(), trace)
            .await
            .unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination.destination, "orders");
        assert_eq!(sent[0].trace_id, trace);
        assert_eq!(
            sent[0].headers[ENCODER_HEADER],
            crate::codec::DEFAULT_CODEC_KEY
        );
        assert_eq!(sent[0].headers[MESSAGE_TYPE_HEADER], "shop.place_order");
    }

    #[test]
    fn test_router_falls_back_to_default() {
        let transport = Arc::new(InMemoryTransport::new());
        let mut router = EndpointRouter::new(endpoint("default", &transport));
        router.route("shop.audit", endpoint("audit", &transport));
        router.route("shop.audit", endpoint("archive", &transport));

        let names = |ns: &str| {
            router
                .endpoints(ns)
                .iter()
                .map(|e| e.name().to_string())
                .collect::<Vec<_>>()
        };

        assert_eq!(names("shop.place_order"), vec!["default"]);
        assert_eq!(names("shop.audit"), vec!["audit", "archive"]);
    }
}
