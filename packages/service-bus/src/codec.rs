//! Message encoding and decoding.
//!
//! # Overview
//!
//! - [`MessageEncoder`] turns a message into payload bytes.
//! - [`MessageDecoder`] turns payload bytes back into a typed message.
//! - [`MessageTypeRegistry`] knows how to deserialize each registered namespace.
//! - [`MessageDecoders`] picks a decoder using the [`ENCODER_HEADER`].
//!
//! Decoding is the first step of processing an incoming package. A decode
//! failure is final: the package is logged and acknowledged, never retried.
//!
//! # Example
//!
//! ```ignore
//! let mut types = MessageTypeRegistry::new();
//! types.register::<PlaceOrder>()?;
//!
//! let decoders = MessageDecoders::new(Arc::new(JsonMessageDecoder::new(Arc::new(types))));
//! let decoded = decoders.decode(package.payload(), package.headers())?;
//! ```

use std::any::{Any, TypeId};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{AnyMessage, EncodedMessage, Message};
use crate::error::{DecodeError, EncodeError, RouterError};
use crate::package::{Headers, ENCODER_HEADER};

/// Key of the JSON codec pair.
pub const DEFAULT_CODEC_KEY: &str = "service_bus.decoder.default_handler";

/// A decoded, type-erased message.
#[derive(Clone)]
pub struct DecodedMessage {
    /// Namespace found in the envelope.
    pub name: String,
    /// Runtime type of the payload.
    pub type_id: TypeId,
    /// The typed message.
    pub payload: Arc<dyn Any + Send + Sync>,
}

impl DecodedMessage {
    /// Wrap a typed message.
    pub fn new<M: Message>(message: M) -> Self {
        Self {
            name: <M as Message>::message_name().to_string(),
            type_id: TypeId::of::<M>(),
            payload: Arc::new(message),
        }
    }

    /// Downcast the payload to a concrete message type.
    pub fn downcast_ref<M: Any>(&self) -> Option<&M> {
        self.payload.downcast_ref()
    }
}

impl std::fmt::Debug for DecodedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedMessage")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Type-erased deserializer function.
type DeserializeFn =
    Box<dyn Fn(serde_json::Value) -> Result<Arc<dyn Any + Send + Sync>, serde_json::Error> + Send + Sync>;

struct RegisteredType {
    type_id: TypeId,
    deserialize: DeserializeFn,
}

/// Registry mapping envelope namespaces to typed deserializers.
///
/// Populated once at configuration time. Registering a handler for a message
/// type registers the type here automatically.
#[derive(Default)]
pub struct MessageTypeRegistry {
    types: HashMap<String, RegisteredType>,
}

impl MessageTypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message type under its [`Message::message_name`].
    ///
    /// Registering the same type twice is a no-op. Registering a different
    /// type under a taken namespace fails with
    /// [`RouterError::NamespaceConflict`].
    pub fn register<M: Message>(&mut self) -> Result<(), RouterError> {
        let namespace = <M as Message>::message_name();
        match self.types.entry(namespace.to_string()) {
            Entry::Occupied(entry) if entry.get().type_id != TypeId::of::<M>() => {
                Err(RouterError::NamespaceConflict {
                    namespace: entry.key().clone(),
                })
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(entry) => {
                entry.insert(RegisteredType {
                    type_id: TypeId::of::<M>(),
                    deserialize: Box::new(|value| {
                        let message: M = serde_json::from_value(value)?;
                        Ok(Arc::new(message) as Arc<dyn Any + Send + Sync>)
                    }),
                });
                Ok(())
            }
        }
    }

    /// Check whether a namespace is registered.
    pub fn contains(&self, namespace: &str) -> bool {
        self.types.contains_key(namespace)
    }

    /// Number of registered namespaces.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Deserialize an envelope into its registered type.
    pub fn materialize(&self, envelope: EncodedMessage) -> Result<DecodedMessage, DecodeError> {
        let registered = self
            .types
            .get(&envelope.namespace)
            .ok_or_else(|| DecodeError::UnknownMessageType(envelope.namespace.clone()))?;

        let payload = (registered.deserialize)(envelope.message)?;
        Ok(DecodedMessage {
            name: envelope.namespace,
            type_id: registered.type_id,
            payload,
        })
    }
}

impl std::fmt::Debug for MessageTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageTypeRegistry")
            .field("types", &self.types.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Turns a message into payload bytes.
pub trait MessageEncoder: Send + Sync + 'static {
    /// Key written into the [`ENCODER_HEADER`] of every package.
    fn key(&self) -> &'static str;

    /// Encode a message.
    fn encode(&self, message: &dyn AnyMessage) -> Result<Vec<u8>, EncodeError> {
        self.encode_envelope(&message.encode()?)
    }

    /// Encode an already wrapped envelope.
    fn encode_envelope(&self, envelope: &EncodedMessage) -> Result<Vec<u8>, EncodeError>;
}

/// Turns payload bytes back into a typed message.
pub trait MessageDecoder: Send + Sync + 'static {
    /// Key matched against the [`ENCODER_HEADER`].
    fn key(&self) -> &'static str;

    /// Decode a payload.
    fn decode(&self, payload: &[u8]) -> Result<DecodedMessage, DecodeError>;
}

/// JSON envelope encoder.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonMessageEncoder;

impl JsonMessageEncoder {
    /// Create a new encoder.
    pub fn new() -> Self {
        Self
    }
}

impl MessageEncoder for JsonMessageEncoder {
    fn key(&self) -> &'static str {
        DEFAULT_CODEC_KEY
    }

    fn encode_envelope(&self, envelope: &EncodedMessage) -> Result<Vec<u8>, EncodeError> {
        serde_json::to_vec(envelope).map_err(|source| EncodeError::Serialize {
            message: envelope.namespace.clone(),
            source,
        })
    }
}

/// JSON envelope decoder backed by a [`MessageTypeRegistry`].
#[derive(Debug)]
pub struct JsonMessageDecoder {
    types: Arc<MessageTypeRegistry>,
}

impl JsonMessageDecoder {
    /// Create a decoder for the given registry.
    pub fn new(types: Arc<MessageTypeRegistry>) -> Self {
        Self { types }
    }
}

impl MessageDecoder for JsonMessageDecoder {
    fn key(&self) -> &'static str {
        DEFAULT_CODEC_KEY
    }

    fn decode(&self, payload: &[u8]) -> Result<DecodedMessage, DecodeError> {
        let envelope: EncodedMessage = serde_json::from_slice(payload)?;
        self.types.materialize(envelope)
    }
}

/// Set of decoders, selected per package by header.
///
/// A package without the [`ENCODER_HEADER`] is decoded by the default
/// decoder. A package naming an unknown decoder fails with
/// [`DecodeError::UnknownDecoder`].
pub struct MessageDecoders {
    default: Arc<dyn MessageDecoder>,
    decoders: HashMap<&'static str, Arc<dyn MessageDecoder>>,
}

impl MessageDecoders {
    /// Create a set with a default decoder.
    pub fn new(default: Arc<dyn MessageDecoder>) -> Self {
        let mut decoders = HashMap::new();
        decoders.insert(default.key(), default.clone());
        Self { default, decoders }
    }

    /// Register an additional decoder.
    pub fn with_decoder(mut self, decoder: Arc<dyn MessageDecoder>) -> Self {
        self.decoders.insert(decoder.key(), decoder);
        self
    }

    /// Decode a payload using the decoder named in its headers.
    pub fn decode(&self, payload: &[u8], headers: &Headers) -> Result<DecodedMessage, DecodeError> {
        let decoder = match headers.get(ENCODER_HEADER) {
            None => &self.default,
            Some(key) => self
                .decoders
                .get(key.as_str())
                .ok_or_else(|| DecodeError::UnknownDecoder(key.clone()))?,
        };

        decoder.decode(payload)
    }
}

impl std::fmt::Debug for MessageDecoders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDecoders")
            .field("default", &self.default.key())
            .field("decoders", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}
