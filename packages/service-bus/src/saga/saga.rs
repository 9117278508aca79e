use std::any::{Any, TypeId};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::appliers::{appliers_for, Appliers};
use super::events::{SagaClosed, SagaCreated, SagaStatusChanged};
use super::id::SagaId;
use super::metadata::{SagaMetadata, SagaStatus};
use crate::core::{AnyMessage, Message};
use crate::error::SagaError;

/// The state carried by a saga type.
///
/// The state is changed only by applying raised events through the
/// [`Appliers`] table.
pub trait SagaState: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Static description of the saga type.
    fn metadata() -> SagaMetadata;

    /// Event application table. Built once per saga type.
    fn appliers() -> Appliers<Self>
    where
        Self: Sized,
    {
        Appliers::new()
    }
}

/// A saga type started by command `C`.
pub trait StartedBy<C: Message>: SagaState {
    /// State of a freshly constructed saga.
    fn initial_state(id: &SagaId, command: &C) -> Self;

    /// Runs right after construction, before the saga is first stored.
    fn start(saga: &mut Saga<Self>, command: &C) -> Result<(), SagaError>
    where
        Self: Sized,
    {
        let _ = (saga, command);
        Ok(())
    }
}

/// An event-sourced, long-running workflow instance.
///
/// Raised events and fired commands are kept pending until the saga is saved
/// by the [`SagaProvider`](super::SagaProvider), which delivers them.
pub struct Saga<S: SagaState> {
    id: SagaId,
    state: S,
    status: SagaStatus,
    created_at: DateTime<Utc>,
    expire_date: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    raised: Vec<Box<dyn AnyMessage>>,
    fired: Vec<Box<dyn AnyMessage>>,
}

impl<S: SagaState> Saga<S> {
    /// Construct a saga and raise [`SagaCreated`].
    ///
    /// `expire_date` defaults to now plus the metadata expire modifier and
    /// must be in the future.
    pub fn new(id: SagaId, state: S, expire_date: Option<DateTime<Utc>>) -> Result<Self, SagaError> {
        let metadata = S::metadata();
        if id.saga_class() != metadata.saga_class {
            return Err(SagaError::IdentifierMismatch {
                declared: id.saga_class().to_string(),
                actual: metadata.saga_class.to_string(),
            });
        }

        let now = Utc::now();
        let expire_date = match expire_date {
            Some(date) => date,
            None => now + metadata.expire_after()?,
        };
        if expire_date <= now {
            return Err(SagaError::InvalidExpireDate {
                id: id.to_string(),
                expire_date,
                now,
            });
        }

        let mut saga = Self {
            id,
            state,
            status: SagaStatus::InProgress,
            created_at: now,
            expire_date,
            closed_at: None,
            raised: Vec::new(),
            fired: Vec::new(),
        };

        saga.raise(SagaCreated {
            id: saga.id.id().to_string(),
            saga_class: saga.id.saga_class().to_string(),
            created_at: now,
            expire_date,
        })?;

        Ok(saga)
    }

    /// Record an event and apply it to the state.
    pub fn raise<E: Message>(&mut self, event: E) -> Result<(), SagaError> {
        self.assert_open()?;
        self.record(event);
        Ok(())
    }

    /// Record a command to be delivered on save.
    pub fn fire<C: Message>(&mut self, command: C) -> Result<(), SagaError> {
        self.assert_open()?;
        self.fired.push(Box::new(command));
        Ok(())
    }

    /// Close the saga as completed.
    pub fn make_completed(&mut self, reason: Option<String>) -> Result<(), SagaError> {
        self.close(SagaStatus::Completed, reason)
    }

    /// Close the saga as failed.
    pub fn make_failed(&mut self, reason: impl Into<String>) -> Result<(), SagaError> {
        self.close(SagaStatus::Failed, Some(reason.into()))
    }

    /// Close the saga as expired.
    pub fn make_expired(&mut self) -> Result<(), SagaError> {
        self.close(SagaStatus::Expired, Some("expired".to_string()))
    }

    fn close(&mut self, status: SagaStatus, reason: Option<String>) -> Result<(), SagaError> {
        self.assert_open()?;

        let now = Utc::now();
        self.record(SagaStatusChanged {
            id: self.id.id().to_string(),
            saga_class: self.id.saga_class().to_string(),
            previous_status: self.status,
            new_status: status,
            with_reason: reason.clone(),
            datetime: now,
        });

        self.status = status;
        self.closed_at = Some(now);

        self.record(SagaClosed {
            id: self.id.id().to_string(),
            saga_class: self.id.saga_class().to_string(),
            closed_at: now,
            with_reason: reason,
        });

        Ok(())
    }

    fn record<E: Message>(&mut self, event: E) {
        appliers_for::<S>().apply(&mut self.state, TypeId::of::<E>(), &event as &dyn Any);
        self.raised.push(Box::new(event));
    }

    fn assert_open(&self) -> Result<(), SagaError> {
        if self.status.is_closed() {
            return Err(SagaError::Closed {
                id: self.id.to_string(),
                status: self.status.to_string(),
            });
        }
        Ok(())
    }

    pub fn id(&self) -> &SagaId {
        &self.id
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expire_date(&self) -> DateTime<Utc> {
        self.expire_date
    }

    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.closed_at
    }

    /// Returns `true` once the saga has left `in_progress`.
    pub fn is_closed(&self) -> bool {
        self.status.is_closed()
    }

    /// Returns `true` if the saga is in progress and past its expire date.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.is_closed() && self.expire_date <= now
    }

    /// Pending events, in raise order.
    pub fn raised(&self) -> &[Box<dyn AnyMessage>] {
        &self.raised
    }

    /// Pending commands, in fire order.
    pub fn fired(&self) -> &[Box<dyn AnyMessage>] {
        &self.fired
    }

    /// Take the pending events.
    pub fn release_events(&mut self) -> Vec<Box<dyn AnyMessage>> {
        std::mem::take(&mut self.raised)
    }

    /// Take the pending commands.
    pub fn release_commands(&mut self) -> Vec<Box<dyn AnyMessage>> {
        std::mem::take(&mut self.fired)
    }

    pub(crate) fn snapshot(&self) -> Result<serde_json::Value, SagaError> {
        let snapshot = SnapshotRef {
            id: &self.id,
            state: &self.state,
            status: self.status,
            created_at: self.created_at,
            expire_date: self.expire_date,
            closed_at: self.closed_at,
        };
        Ok(serde_json::to_value(snapshot)?)
    }

    pub(crate) fn restore(value: serde_json::Value) -> Result<Self, SagaError> {
        let snapshot: Snapshot<S> = serde_json::from_value(value)?;

        let saga_class = S::metadata().saga_class;
        if snapshot.id.saga_class() != saga_class {
            return Err(SagaError::IdentifierMismatch {
                declared: snapshot.id.saga_class().to_string(),
                actual: saga_class.to_string(),
            });
        }

        Ok(Self {
            id: snapshot.id,
            state: snapshot.state,
            status: snapshot.status,
            created_at: snapshot.created_at,
            expire_date: snapshot.expire_date,
            closed_at: snapshot.closed_at,
            raised: Vec::new(),
            fired: Vec::new(),
        })
    }
}

impl<S: SagaState + fmt::Debug> fmt::Debug for Saga<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Saga")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("status", &self.status)
            .field("expire_date", &self.expire_date)
            .field("closed_at", &self.closed_at)
            .field("raised", &self.raised.len())
            .field("fired", &self.fired.len())
            .finish()
    }
}

#[derive(Serialize)]
struct SnapshotRef<'a, S> {
    id: &'a SagaId,
    state: &'a S,
    status: SagaStatus,
    created_at: DateTime<Utc>,
    expire_date: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(bound = "S: DeserializeOwned")]
struct Snapshot<S> {
    id: SagaId,
    state: S,
    status: SagaStatus,
    created_at: DateTime<Utc>,
    expire_date: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
}
