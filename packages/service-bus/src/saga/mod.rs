//! Sagas: event-sourced, identity-addressed workflows.
//!
//! A saga type is a serializable state implementing [`SagaState`]. Instances
//! live in a [`SagaStore`] and are driven by inbound events registered with
//! [`SagaListeners`]. Every change goes through [`Saga::raise`] (events, applied
//! to the state through the [`Appliers`] table) or [`Saga::fire`] (commands).
//! Pending messages are delivered by the [`SagaProvider`] once the saga is
//! stored.
//!
//! Status flows one way: `in_progress` to `completed`, `failed` or `expired`.
//! A closed saga rejects further `raise` and `fire` calls.
//!
//! The core does not lock a saga across load, mutate and save. Route all
//! events for one saga id through a single consumer.

mod appliers;
mod events;
mod id;
mod listener;
mod metadata;
mod provider;
#[allow(clippy::module_inception)]
mod saga;
mod store;

pub use appliers::Appliers;
pub use events::{SagaClosed, SagaCreated, SagaStatusChanged};
pub use id::SagaId;
pub use listener::{resolve_saga_id, SagaListenerFn, SagaListeners};
pub use metadata::{parse_expire_modifier, SagaMetadata, SagaStatus};
pub use provider::SagaProvider;
pub use saga::{Saga, SagaState, StartedBy};
pub use store::{JsonSagaSerializer, SagaSerializer, SagaStore, StoredSaga};
