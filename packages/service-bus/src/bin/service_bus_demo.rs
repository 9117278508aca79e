//! Service bus demo
//!
//! Runs a bus on the in-memory loopback transport, schedules a command a few
//! seconds ahead and stops once it has been handled.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use service_bus::scheduler::{SchedulerListener, SchedulerProvider};
use service_bus::testing::{InMemorySchedulerStore, InMemoryTransport};
use service_bus::{
    DeliveryDestination, HandlerDescriptor, Message, MessageContext, Queue, ServiceBusBuilder, ServiceBusConfig,
    ServiceHandler,
};
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SendReminder {
    recipient: String,
}

impl Message for SendReminder {
    fn message_name() -> &'static str {
        "demo.send_reminder"
    }
}

struct Reminders {
    done: Arc<Notify>,
}

#[async_trait]
impl ServiceHandler<SendReminder> for Reminders {
    async fn handle(&self, reminder: &SendReminder, ctx: &MessageContext) -> anyhow::Result<()> {
        tracing::info!(recipient = %reminder.recipient, trace_id = %ctx.trace_id(), "reminder sent");
        self.done.notify_one();
        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    service_bus::telemetry::init_tracing("info,service_bus=debug")
        .context("Failed to initialize tracing")?;

    let config = ServiceBusConfig::from_env().context("Invalid service bus configuration")?;
    let transport = Arc::new(InMemoryTransport::loopback());
    let scheduler = Arc::new(SchedulerProvider::new(
        Uuid::new_v4(),
        Arc::new(InMemorySchedulerStore::new()),
        config.scheduler.clone(),
    ));
    let done = Arc::new(Notify::new());

    let bus = ServiceBusBuilder::new(transport, DeliveryDestination::new("demo"))
        .with_config(config)
        .handlers(SchedulerListener::handlers(scheduler.clone()))
        .handler(HandlerDescriptor::command::<SendReminder, _>(
            "demo.reminders",
            Reminders { done: done.clone() },
        ))
        .build()
        .context("Failed to build service bus")?;

    let entry_point = bus.entry_point();
    let listener = tokio::spawn(async move { entry_point.listen(&[Queue::new("demo")]).await });

    let run_at = Utc::now() + chrono::Duration::seconds(2);
    scheduler
        .schedule(
            "reminder-1",
            &SendReminder {
                recipient: "ops@example.org".into(),
            },
            run_at,
            &bus.context(),
        )
        .await
        .context("Failed to schedule reminder")?;
    tracing::info!(%run_at, "reminder scheduled");

    tokio::time::timeout(Duration::from_secs(10), done.notified())
        .await
        .context("Reminder was not delivered in time")?;

    bus.stop().await?;
    listener.await??;

    Ok(())
}
