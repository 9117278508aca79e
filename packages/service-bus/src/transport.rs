//! Transport interface.
//!
//! The bus owns no broker code. A transport adapter (AMQP, Redis streams,
//! NATS, ...) implements [`Transport`] and hands the entry point a stream of
//! [`IncomingPackage`]s. Queue declaration, bindings and connection management
//! live entirely in the adapter.
//!
//! # Implementer Notes
//!
//! - `consume` should return a stream that ends once `stop` has been called and
//!   the broker has stopped delivering.
//! - `send` must honour [`OutboundPackage::delay`] (e.g. delayed-message
//!   exchange) for the scheduler to work.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::TransportError;
use crate::package::{IncomingPackage, OutboundPackage};

/// Stream of packages yielded by a transport.
pub type PackageStream = BoxStream<'static, Arc<dyn IncomingPackage>>;

/// A queue the entry point consumes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Queue {
    /// Queue name as known by the broker.
    pub name: String,
}

impl Queue {
    /// Create a queue reference.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A message broker connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start consuming from the given queues.
    async fn consume(&self, queues: &[Queue]) -> Result<PackageStream, TransportError>;

    /// Stop delivering new packages. In-flight packages may still be settled.
    async fn stop(&self) -> Result<(), TransportError>;

    /// Send an outbound package.
    async fn send(&self, package: OutboundPackage) -> Result<(), TransportError>;
}
