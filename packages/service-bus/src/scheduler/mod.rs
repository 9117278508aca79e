//! Delayed command delivery.
//!
//! A [`SchedulerRegistry`] holds every pending [`ScheduledOperation`] of one
//! logical scheduler and is stored as a single compressed blob. The
//! [`SchedulerProvider`] applies `schedule`, `cancel` and `emit` against it and
//! publishes a lifecycle event after each one. The handlers from
//! [`SchedulerListener::handlers`] turn those events into a delayed
//! [`EmitSchedulerOperation`] for the earliest pending operation, so the
//! transport's delayed delivery is the only timer.
//!
//! ```ignore
//! let scheduler = Arc::new(SchedulerProvider::new(registry_id, store, config.scheduler.clone()));
//! let bus = ServiceBusBuilder::new(transport, destination)
//!     .handlers(SchedulerListener::handlers(scheduler.clone()))
//!     .build()?;
//!
//! scheduler
//!     .schedule("trial-a-1", &ExpireTrial { account_id: "a-1".into() }, in_two_weeks, &bus.context())
//!     .await?;
//! ```

mod events;
mod listener;
mod operation;
mod provider;
mod registry;
mod store;

pub use events::{EmitSchedulerOperation, OperationScheduled, SchedulerOperationCanceled, SchedulerOperationEmitted};
pub use listener::{arm_delay, SchedulerListener};
pub use operation::{NextScheduledOperation, ScheduledOperation};
pub use provider::SchedulerProvider;
pub use registry::SchedulerRegistry;
pub use store::{SchedulerStore, StoredRegistry};
