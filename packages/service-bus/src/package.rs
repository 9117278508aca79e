//! Transport-level packages: what arrives from the broker and what is sent back.
//!
//! An [`IncomingPackage`] is created by a transport adapter for every received
//! frame and consumed exactly once by the entry point. Exactly one of
//! [`ack`](IncomingPackage::ack), [`nack`](IncomingPackage::nack) or
//! [`reject`](IncomingPackage::reject) must be called per package lifecycle.
//!
//! An [`OutboundPackage`] is created by an endpoint when a handler delivers a
//! message and is owned by the transport until it is sent.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::TraceId;
use crate::error::TransportError;

/// Header carrying the key of the encoder that produced the payload.
///
/// The entry point uses it to select the matching decoder.
pub const ENCODER_HEADER: &str = "X-SERVICE-BUS-ENCODER";

/// Header carrying the trace id of the causal chain.
pub const TRACE_ID_HEADER: &str = "X-SERVICE-BUS-TRACE-ID";

/// Header carrying the message namespace, for transports that want to route on it.
pub const MESSAGE_TYPE_HEADER: &str = "X-SERVICE-BUS-MESSAGE-TYPE";

/// Per-message expiration header, in milliseconds.
pub const EXPIRATION_HEADER: &str = "expiration";

/// Broker delay header, in milliseconds (delayed-message exchanges).
pub const DELAY_HEADER: &str = "x-delay";

/// Package headers. Ordered so logs and tests are deterministic.
pub type Headers = BTreeMap<String, String>;

/// Where a package came from or is going to.
///
/// Broker specifics (exchange/routing key, topic/partition) are flattened into
/// a `destination` plus an optional routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryDestination {
    /// Queue, topic or exchange name.
    pub destination: String,
    /// Optional routing key within the destination.
    pub routing_key: Option<String>,
}

impl DeliveryDestination {
    /// Create a destination without a routing key.
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            routing_key: None,
        }
    }

    /// Set the routing key.
    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }
}

impl fmt::Display for DeliveryDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.routing_key {
            Some(key) => write!(f, "{}:{}", self.destination, key),
            None => write!(f, "{}", self.destination),
        }
    }
}

/// A frame received from the transport.
///
/// Implemented by transport adapters. The entry point always calls
/// [`ack`](Self::ack) after processing; handlers that need redelivery
/// settle the package themselves through their adapter.
#[async_trait]
pub trait IncomingPackage: Send + Sync + 'static {
    /// Transport-assigned package id.
    fn id(&self) -> &str;

    /// Trace id of the causal chain this package belongs to.
    fn trace_id(&self) -> TraceId;

    /// Raw payload bytes.
    fn payload(&self) -> &[u8];

    /// Package headers.
    fn headers(&self) -> &Headers;

    /// Where the package was received from.
    fn origin(&self) -> &DeliveryDestination;

    /// Acknowledge successful processing.
    async fn ack(&self) -> Result<(), TransportError>;

    /// Negative acknowledgement, optionally requeueing the package.
    async fn nack(&self, requeue: bool, reason: Option<String>) -> Result<(), TransportError>;

    /// Reject the package, optionally requeueing it.
    async fn reject(&self, requeue: bool, reason: Option<String>) -> Result<(), TransportError>;
}

/// Options attached to a single outbound delivery.
///
/// # Example
///
/// ```ignore
/// let options = DeliveryOptions::new()
///     .with_header("tenant", "acme")
///     .with_delay(Duration::from_secs(30));
/// ctx.delivery_with_options(&command, options).await?;
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryOptions {
    /// Extra headers merged into the package headers.
    pub headers: Headers,
    /// Ask the broker to persist the package.
    pub persistent: bool,
    /// Broker priority, if supported.
    pub priority: Option<u8>,
    /// Per-package time to live.
    pub expiration: Option<Duration>,
    /// Transport-level deferral.
    pub delay: Option<Duration>,
}

impl DeliveryOptions {
    /// Default options: persistent, no priority, no expiration, no delay.
    pub fn new() -> Self {
        Self {
            persistent: true,
            ..Self::default()
        }
    }

    /// Add a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Mark the package as transient.
    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }

    /// Set the broker priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the package time to live.
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Defer delivery by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A package ready to be handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundPackage {
    /// Encoded payload.
    pub payload: Vec<u8>,
    /// Headers, including encoder and trace id headers.
    pub headers: Headers,
    /// Target destination.
    pub destination: DeliveryDestination,
    /// Trace id propagated from the originating package.
    pub trace_id: TraceId,
    /// Ask the broker to persist the package.
    pub persistent: bool,
    /// Broker priority, if supported.
    pub priority: Option<u8>,
    /// Per-package time to live.
    pub expiration: Option<Duration>,
    /// Transport-level deferral.
    pub delay: Option<Duration>,
}

impl OutboundPackage {
    /// Build a package from a payload and delivery options.
    pub fn new(
        payload: Vec<u8>,
        destination: DeliveryDestination,
        trace_id: TraceId,
        options: DeliveryOptions,
    ) -> Self {
        let mut headers = options.headers;
        headers.insert(TRACE_ID_HEADER.to_string(), trace_id.to_string());

        Self {
            payload,
            headers,
            destination,
            trace_id,
            persistent: options.persistent,
            priority: options.priority,
            expiration: options.expiration,
            delay: options.delay,
        }
    }
}
