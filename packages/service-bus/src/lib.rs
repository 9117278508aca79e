//! # Service Bus
//!
//! A message-driven CQRS runtime. Packages arrive from a [`Transport`], are
//! decoded into typed messages, routed to handlers and acknowledged. Two
//! message-driven abstractions are built on the same pipeline: [`saga`]s
//! (event-sourced, identity-addressed workflows) and a [`scheduler`] (delayed
//! re-injection of commands).
//!
//! ## Architecture
//!
//! ```text
//! Transport ──consume()──► EntryPoint (bounded in-flight set)
//!                              │
//!                              ▼ one task per package
//!                        EntryPointProcessor
//!                              │
//!                              ├─► MessageDecoders ──► typed message
//!                              ├─► MessageRouter   ──► executors for the type
//!                              │
//!                              ├─► TimeLimitExecutor
//!                              │     └─► ValidationExecutor
//!                              │           └─► DefaultMessageExecutor ──► handler
//!                              │                                          │
//!                              └─► ack()                                  │
//!                                                                         ▼
//!                     MessageContext::delivery() ──► Endpoint ──► Transport::send()
//! ```
//!
//! ## Guarantees
//!
//! - **Bounded concurrency**: at most `max_concurrent_tasks` packages are in
//!   flight. The loop stops reading the transport while the bound is reached;
//!   nothing is dropped.
//! - **Always acknowledged**: every package is acked once processing ends,
//!   whatever the handlers did. Malformed payloads are acked and dropped.
//!   Redelivery is a handler concern.
//! - **Isolated handlers**: a failing, panicking or timed out handler is
//!   logged and does not stop the other handlers of the same message.
//! - **No ordering across packages**: packages start in receipt order but may
//!   complete in any order.
//! - **Graceful stop**: [`ServiceBus::stop`] returns once every in-flight
//!   package has been processed.
//!
//! ## Example
//!
//! ```ignore
//! use service_bus::{
//!     DeliveryDestination, HandlerDescriptor, Message, MessageContext, Queue,
//!     ServiceBusBuilder, ServiceBusConfig, ServiceHandler,
//! };
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, garde::Validate)]
//! struct PlaceOrder {
//!     #[garde(length(min = 1))]
//!     order_id: String,
//! }
//!
//! impl Message for PlaceOrder {
//!     fn message_name() -> &'static str {
//!         "shop.place_order"
//!     }
//! }
//!
//! struct PlaceOrderHandler;
//!
//! #[async_trait::async_trait]
//! impl ServiceHandler<PlaceOrder> for PlaceOrderHandler {
//!     async fn handle(&self, order: &PlaceOrder, ctx: &MessageContext) -> anyhow::Result<()> {
//!         ctx.delivery(&OrderPlaced { order_id: order.order_id.clone() }).await?;
//!         Ok(())
//!     }
//! }
//!
//! let bus = ServiceBusBuilder::new(transport, DeliveryDestination::new("shop"))
//!     .with_config(ServiceBusConfig::from_env()?)
//!     .garde_validator::<PlaceOrder>()
//!     .handler(
//!         HandlerDescriptor::command::<PlaceOrder, _>("shop.place_order", PlaceOrderHandler)
//!             .with_options(HandlerOptions::new().with_validation(Vec::<String>::new())),
//!     )
//!     .build()?;
//!
//! bus.listen(&[Queue::new("shop")]).await?;
//! ```

mod argument;
mod codec;
mod config;
mod context;
mod core;
mod endpoint;
mod entry_point;
mod error;
mod executor;
mod handler;
mod kernel;
mod package;
mod router;
mod store;
mod transport;
mod validation;

pub mod saga;
pub mod scheduler;
pub mod telemetry;

// In-memory collaborators (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


pub use crate::argument::{
    default_resolvers, ArgumentDescriptor, ArgumentKind, ArgumentResolver, ArgumentValue, Arguments,
    ContainerArgumentResolver, ContextArgumentResolver, Dependencies, MessageArgumentResolver,
};
pub use crate::codec::{
    DecodedMessage, JsonMessageDecoder, JsonMessageEncoder, MessageDecoder, MessageDecoders, MessageEncoder,
    MessageTypeRegistry, DEFAULT_CODEC_KEY,
};
pub use crate::config::{EntryPointConfig, SchedulerConfig, ServiceBusConfig};
pub use crate::context::{ContextFactory, MessageContext};
pub use crate::core::{AnyMessage, EncodedMessage, Message, TraceId};
pub use crate::endpoint::{Endpoint, EndpointRouter, TransportEndpoint};
pub use crate::entry_point::{EntryPoint, EntryPointProcessor, InflightGuard, InflightTracker};
pub use crate::error::{
    ConfigError, DecodeError, DeliveryError, EncodeError, ExecutionError, RouterError, SagaError, SchedulerError,
    StoreError, TransportError,
};
pub use crate::executor::{
    DefaultMessageExecutor, MessageExecutor, MessageExecutorFactory, TimeLimitExecutor, ValidationExecutor,
};
pub use crate::handler::{
    ExecutionFailedEvent, FailureEventFactory, HandlerDescriptor, HandlerKind, HandlerOptions, MessageHandler,
    ServiceHandler, ValidationFailedEvent, ValidationFailedFactory,
};
pub use crate::kernel::{ServiceBus, ServiceBusBuilder};
pub use crate::package::{
    DeliveryDestination, DeliveryOptions, Headers, IncomingPackage, OutboundPackage, DELAY_HEADER, ENCODER_HEADER,
    EXPIRATION_HEADER, MESSAGE_TYPE_HEADER, TRACE_ID_HEADER,
};
pub use crate::router::MessageRouter;
pub use crate::store::Revision;
pub use crate::transport::{PackageStream, Queue, Transport};
pub use crate::validation::{GardeValidator, MessageValidator, ValidationViolations, Violation};
