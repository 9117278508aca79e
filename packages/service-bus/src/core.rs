//! Core message traits for the service bus.
//!
//! # Overview
//!
//! Everything that travels through the bus is a [`Message`]: commands (intent,
//! exactly one handler) and events (facts, any number of listeners) share the
//! same trait. The difference lives in how handlers are registered, not in the
//! message type itself.
//!
//! # Trace IDs
//!
//! Every incoming package carries a [`TraceId`]. All messages delivered while
//! handling that package reuse it, so a whole causal chain (command -> saga ->
//! scheduled command -> ...) can be followed in logs.

use std::any::{Any, TypeId};
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EncodeError;

/// A message that can travel through the bus.
///
/// Implement this for every command and event type. The only required
/// knowledge is how to (de)serialize it; `message_name` defaults to the fully
/// qualified Rust type name and is what ends up in the envelope's `namespace`.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct PlaceOrder {
///     order_id: String,
/// }
///
/// impl Message for PlaceOrder {
///     fn message_name() -> &'static str {
///         "shop.place_order"
///     }
/// }
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable namespace used in the wire envelope and for routing.
    ///
    /// Must not change once messages of this type exist on a queue.
    fn message_name() -> &'static str
    where
        Self: Sized,
    {
        std::any::type_name::<Self>()
    }
}

/// Object-safe view over a [`Message`].
///
/// Used wherever heterogeneous messages have to be stored together, e.g. the
/// pending events and commands of a saga, or failure events created by the
/// executor.
pub trait AnyMessage: Send + Sync + 'static {
    /// Namespace of the concrete message type.
    fn message_name(&self) -> &'static str;

    /// Runtime type id of the concrete message.
    fn message_type_id(&self) -> TypeId;

    /// Serialize the message fields to JSON.
    fn to_json(&self) -> Result<serde_json::Value, EncodeError>;

    /// Borrow the message as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Wrap into the wire envelope.
    fn encode(&self) -> Result<EncodedMessage, EncodeError> {
        Ok(EncodedMessage {
            namespace: self.message_name().to_string(),
            message: self.to_json()?,
        })
    }
}

impl<M: Message> AnyMessage for M {
    fn message_name(&self) -> &'static str {
        <M as Message>::message_name()
    }

    fn message_type_id(&self) -> TypeId {
        TypeId::of::<M>()
    }

    fn to_json(&self) -> Result<serde_json::Value, EncodeError> {
        serde_json::to_value(self).map_err(|source| EncodeError::Serialize {
            message: <M as Message>::message_name().to_string(),
            source,
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for dyn AnyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyMessage")
            .field("name", &self.message_name())
            .finish_non_exhaustive()
    }
}

/// The wire envelope: `{"namespace": "<type name>", "message": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedMessage {
    /// Fully qualified message name.
    pub namespace: String,
    /// Serialized message fields.
    pub message: serde_json::Value,
}

impl EncodedMessage {
    /// Encode a typed message.
    pub fn from_message<M: Message>(message: &M) -> Result<Self, EncodeError> {
        AnyMessage::encode(message)
    }
}

/// Trace id shared by every message of one causal chain.
///
/// Use [`TraceId::new`] for a fresh chain; the entry point copies the trace id
/// of the incoming package into every execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TraceId(Uuid);

impl TraceId {
    /// Create a new random trace id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a trace id from a header value.
    ///
    /// Returns `None` for anything that is not a UUID.
    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(Self)
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TraceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct OrderPlaced {
        order_id: String,
    }

    impl Message for OrderPlaced {
        fn message_name() -> &'static str {
            "shop.order_placed"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Unnamed {
        value: u32,
    }

    impl Message for Unnamed {}

    #[test]
    fn test_encode_wraps_namespace_and_fields() {
        let encoded = EncodedMessage::from_message(&OrderPlaced {
            order_id: "o-1".into(),
        })
        .unwrap();

        assert_eq!(encoded.namespace, "shop.order_placed");
        assert_eq!(encoded.message["order_id"], "o-1");
    }

    #[test]
    fn test_default_name_is_type_path() {
        assert!(<Unnamed as Message>::message_name().ends_with("Unnamed"));
        assert!(<Unnamed as Message>::message_name().contains("::"));
    }

    #[test]
    fn test_any_message_downcast() {
        let boxed: Box<dyn AnyMessage> = Box::new(OrderPlaced {
            order_id: "o-2".into(),
        });

        assert_eq!(boxed.message_type_id(), TypeId::of::<OrderPlaced>());
        let concrete = boxed.as_any().downcast_ref::<OrderPlaced>().unwrap();
        assert_eq!(concrete.order_id, "o-2");
    }

    #[test]
    fn test_trace_id_parse() {
        let trace = TraceId::new();
        assert_eq!(TraceId::parse(&trace.to_string()), Some(trace));
        assert_eq!(TraceId::parse("not-a-uuid"), None);
    }
}
