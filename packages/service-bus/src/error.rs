//! Structured error types for the service bus.
//!
//! Each concern owns a pattern-matchable error enum. Handler bodies use
//! `anyhow` internally; those errors are wrapped into [`ExecutionError`] by the
//! executor and never cross the transport boundary. Failures that must leave
//! the process are turned into configured failure events instead.
//!
//! # Example
//!
//! ```ignore
//! use service_bus::{ExecutionError, RouterError};
//!
//! match builder.command_handler(handler) {
//!     Err(RouterError::DuplicateCommandHandler { message }) => {
//!         eprintln!("two handlers registered for {message}");
//!     }
//!     Err(e) => return Err(e.into()),
//!     Ok(builder) => builder,
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

/// Errors raised while turning a transport payload into a typed message.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The decoder header names a decoder that was never registered.
    #[error("unknown decoder `{0}`")]
    UnknownDecoder(String),

    /// The envelope names a message type nobody registered.
    #[error("unknown message type `{0}`")]
    UnknownMessageType(String),

    /// The payload is not a valid envelope, or the fields do not match the type.
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Errors raised while turning a message into a transport payload.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The message could not be serialized.
    #[error("unable to encode `{message}`: {source}")]
    Serialize {
        /// Namespace of the message being encoded.
        message: String,
        /// Underlying serializer failure.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors reported by transport adapters.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport is not connected or has been stopped.
    #[error("transport is not available: {0}")]
    Unavailable(String),

    /// Sending an outbound package failed.
    #[error("unable to send package to `{destination}`: {reason}")]
    Send {
        /// Destination the package was addressed to.
        destination: String,
        /// Adapter-specific reason.
        reason: String,
    },

    /// Acknowledging, rejecting or requeueing a package failed.
    #[error("unable to settle package `{package_id}`: {reason}")]
    Settle {
        /// Id of the package that could not be settled.
        package_id: String,
        /// Adapter-specific reason.
        reason: String,
    },

    /// Anything else the adapter wants to surface.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors raised while building the routing table.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Commands are point-to-point: exactly one handler per command type.
    #[error("a command handler for `{message}` is already registered")]
    DuplicateCommandHandler {
        /// Namespace of the command.
        message: String,
    },

    /// A handler asks for validation but no validator is registered for its message.
    #[error("handler `{handler}` validates `{message}` but no validator is registered for it")]
    MissingValidator {
        /// Handler id.
        handler: String,
        /// Namespace of the message.
        message: String,
    },

    /// Two different message types claim the same namespace.
    #[error("namespace `{namespace}` is claimed by two different message types")]
    NamespaceConflict {
        /// The shared namespace.
        namespace: String,
    },
}

/// Errors raised while executing a single handler.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The handler body returned an error.
    #[error("handler `{handler}` failed: {source}")]
    Handler {
        /// Executor id of the failing handler.
        handler: String,
        /// The error returned by the handler.
        #[source]
        source: anyhow::Error,
    },

    /// The handler panicked. The panic was contained.
    #[error("handler `{handler}` panicked: {message}")]
    Panicked {
        /// Executor id of the failing handler.
        handler: String,
        /// Panic payload, when it was a string.
        message: String,
    },

    /// The handler did not finish within its execution timeout.
    #[error("handler `{handler}` exceeded its execution timeout of {timeout:?}")]
    Timeout {
        /// Executor id of the failing handler.
        handler: String,
        /// The configured limit.
        timeout: Duration,
    },

    /// No resolver could supply one of the handler's declared arguments.
    #[error("unable to resolve argument `{argument}` of handler `{handler}`")]
    UnresolvedArgument {
        /// Executor id of the handler.
        handler: String,
        /// Declared argument name.
        argument: String,
    },

    /// Delivering a failure event (or any outbound message) failed.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Errors raised while delivering an outbound message.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The message could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The transport refused the package.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors from persistent stores (sagas, scheduler registries).
///
/// The distinction matters for callers:
/// - [`StoreError::Conflict`] means another writer got there first; reload and retry.
/// - [`StoreError::Duplicate`] means the key already exists; pick another key.
/// - [`StoreError::Backend`] means storage itself failed.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored revision no longer matches the one the caller loaded.
    #[error("revision conflict: state was modified concurrently")]
    Conflict,

    /// A row with the same key already exists.
    #[error("duplicate key `{0}`")]
    Duplicate(String),

    /// The row to update does not exist.
    #[error("row `{0}` not found")]
    NotFound(String),

    /// Storage backend failed (timeout, connection, serialization).
    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Errors raised by sagas and the saga provider.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The saga id belongs to another saga type.
    #[error("saga id declares `{declared}` but the saga is `{actual}`")]
    IdentifierMismatch {
        /// Saga class carried by the id.
        declared: String,
        /// Saga class of the instance.
        actual: String,
    },

    /// The expire date is not in the future.
    #[error("saga `{id}` expire date {expire_date} must be later than {now}")]
    InvalidExpireDate {
        /// Saga id.
        id: String,
        /// Rejected expire date.
        expire_date: chrono::DateTime<chrono::Utc>,
        /// Construction time.
        now: chrono::DateTime<chrono::Utc>,
    },

    /// A stored status is not one of the known saga statuses.
    #[error("unknown saga status `{0}`")]
    UnknownStatus(String),

    /// The expire modifier does not match `+<n> <unit>`.
    #[error("invalid saga expire modifier `{0}`")]
    InvalidExpireModifier(String),

    /// The saga is no longer in progress.
    #[error("saga `{id}` is closed with status `{status}`")]
    Closed {
        /// Saga id.
        id: String,
        /// Terminal status.
        status: String,
    },

    /// A saga with this id is already stored.
    #[error("saga `{0}` already exists")]
    AlreadyExists(String),

    /// The saga passed its expire date and has been closed.
    #[error("saga `{0}` has expired")]
    Expired(String),

    /// An event routed to a saga does not carry the saga id.
    #[error("event `{event}` has no usable `{property}` property to identify its saga")]
    UnroutableEvent {
        /// Namespace of the event.
        event: String,
        /// Property expected to carry the id.
        property: String,
    },

    /// The saga payload could not be (de)serialized.
    #[error("saga payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Delivering pending messages failed.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Errors raised by the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// An operation with this id is already scheduled.
    #[error("operation `{0}` is already scheduled")]
    DuplicateOperation(String),

    /// Concurrent writers kept invalidating the registry.
    #[error("scheduler registry still conflicting after {attempts} attempts")]
    Conflict {
        /// Number of save attempts made.
        attempts: u32,
    },

    /// The registry blob could not be encoded or decoded.
    #[error("scheduler registry codec failed: {0}")]
    Codec(String),

    /// The scheduled command could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// Storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Delivering the command or a lifecycle event failed.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable is set but cannot be parsed.
    #[error("{name} must be {expected}, got `{value}`")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// Human readable description of the expected shape.
        expected: &'static str,
        /// The raw value found.
        value: String,
    },
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        assert!(StoreError::Conflict.to_string().contains("conflict"));

        let backend = StoreError::Backend(anyhow::anyhow!("connection failed"));
        assert!(backend.to_string().contains("connection failed"));
    }

    #[test]
    fn test_execution_error_timeout_display() {
        let err = ExecutionError::Timeout {
            handler: "orders.place".into(),
            timeout: Duration::from_millis(250),
        };
        let text = err.to_string();
        assert!(text.contains("orders.place"));
        assert!(text.contains("250ms"));
    }

    #[test]
    fn test_panic_message_variants() {
        let static_payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(static_payload.as_ref()), "boom");

        let owned_payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(owned_payload.as_ref()), "bang");

        let other: Box<dyn std::any::Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }
}
