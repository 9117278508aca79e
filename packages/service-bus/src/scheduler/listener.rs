use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::events::{EmitSchedulerOperation, OperationScheduled, SchedulerOperationCanceled, SchedulerOperationEmitted};
use super::operation::NextScheduledOperation;
use super::provider::SchedulerProvider;
use crate::context::MessageContext;
use crate::error::DeliveryError;
use crate::handler::{HandlerDescriptor, ServiceHandler};
use crate::package::{DeliveryOptions, DELAY_HEADER, EXPIRATION_HEADER};

/// Handlers that drive a scheduler registry.
///
/// Lifecycle events carrying a next operation send a delayed
/// [`EmitSchedulerOperation`] back through the bus; the emit command handler
/// delivers the stored command. One armed emit at a time acts as a rolling
/// timer over the whole registry.
pub struct SchedulerListener;

impl SchedulerListener {
    pub fn handlers(provider: Arc<SchedulerProvider>) -> Vec<HandlerDescriptor> {
        vec![
            HandlerDescriptor::command::<EmitSchedulerOperation, _>(
                "service_bus.scheduler.emit",
                EmitHandler { provider },
            ),
            HandlerDescriptor::listener::<OperationScheduled, _>("service_bus.scheduler.rearm_scheduled", Rearm),
            HandlerDescriptor::listener::<SchedulerOperationEmitted, _>("service_bus.scheduler.rearm_emitted", Rearm),
            HandlerDescriptor::listener::<SchedulerOperationCanceled, _>(
                "service_bus.scheduler.rearm_canceled",
                Rearm,
            ),
        ]
    }
}

struct EmitHandler {
    provider: Arc<SchedulerProvider>,
}

#[async_trait]
impl ServiceHandler<EmitSchedulerOperation> for EmitHandler {
    async fn handle(&self, command: &EmitSchedulerOperation, ctx: &MessageContext) -> anyhow::Result<()> {
        self.provider.emit(&command.id, ctx).await?;
        Ok(())
    }
}

struct Rearm;

#[async_trait]
impl ServiceHandler<OperationScheduled> for Rearm {
    async fn handle(&self, event: &OperationScheduled, ctx: &MessageContext) -> anyhow::Result<()> {
        arm(event.next_operation.as_ref(), ctx).await?;
        Ok(())
    }
}

#[async_trait]
impl ServiceHandler<SchedulerOperationEmitted> for Rearm {
    async fn handle(&self, event: &SchedulerOperationEmitted, ctx: &MessageContext) -> anyhow::Result<()> {
        arm(event.next_operation.as_ref(), ctx).await?;
        Ok(())
    }
}

#[async_trait]
impl ServiceHandler<SchedulerOperationCanceled> for Rearm {
    async fn handle(&self, event: &SchedulerOperationCanceled, ctx: &MessageContext) -> anyhow::Result<()> {
        arm(event.next_operation.as_ref(), ctx).await?;
        Ok(())
    }
}

/// Delay between now and `next.time`, as an absolute distance.
pub fn arm_delay(next: &NextScheduledOperation, now: chrono::DateTime<Utc>) -> Duration {
    Duration::from_millis((next.time - now).num_milliseconds().unsigned_abs())
}

async fn arm(next: Option<&NextScheduledOperation>, ctx: &MessageContext) -> Result<(), DeliveryError> {
    let Some(next) = next else {
        return Ok(());
    };

    let delay = arm_delay(next, Utc::now());
    let delay_ms = delay.as_millis().to_string();
    debug!(operation_id = %next.id, delay_ms = %delay_ms, "arming scheduler operation");

    let options = DeliveryOptions::new()
        .with_header(EXPIRATION_HEADER, "0")
        .with_header(DELAY_HEADER, delay_ms)
        .with_delay(delay);

    ctx.delivery_with_options(&EmitSchedulerOperation { id: next.id.clone() }, options)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TraceId;
    use crate::testing::{test_endpoints, InMemoryTransport};
    use chrono::TimeZone;

    fn next_at(time: chrono::DateTime<Utc>) -> NextScheduledOperation {
        NextScheduledOperation {
            id: "op-1".into(),
            time,
        }
    }

    #[test]
    fn test_arm_delay_is_absolute_distance() {
        let now = Utc.with_ymd_and_hms(2030, 6, 1, 12, 0, 0).unwrap();

        assert_eq!(
            arm_delay(&next_at(now + chrono::Duration::seconds(90)), now),
            Duration::from_secs(90)
        );
        assert_eq!(
            arm_delay(&next_at(now - chrono::Duration::milliseconds(250)), now),
            Duration::from_millis(250)
        );
    }

    #[tokio::test]
    async fn test_rearm_sends_delayed_emit() {
        let transport = Arc::new(InMemoryTransport::new());
        let ctx = MessageContext::outbound(TraceId::new(), test_endpoints(&transport));

        let event = SchedulerOperationCanceled {
            id: "op-0".into(),
            reason: None,
            next_operation: Some(next_at(Utc::now() + chrono::Duration::hours(1))),
        };
        Rearm.handle(&event, &ctx).await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].headers.get(EXPIRATION_HEADER).map(String::as_str), Some("0"));

        let delay = sent[0].delay.unwrap();
        assert!(delay > Duration::from_secs(3590) && delay <= Duration::from_secs(3600));
        assert_eq!(
            sent[0].headers.get(DELAY_HEADER),
            Some(&delay.as_millis().to_string())
        );
        assert_eq!(
            transport.sent_messages::<EmitSchedulerOperation>(),
            vec![EmitSchedulerOperation { id: "op-1".into() }]
        );
    }

    #[tokio::test]
    async fn test_nothing_to_arm() {
        let transport = Arc::new(InMemoryTransport::new());
        let ctx = MessageContext::outbound(TraceId::new(), test_endpoints(&transport));

        Rearm
            .handle(
                &SchedulerOperationEmitted {
                    id: "op-0".into(),
                    next_operation: None,
                },
                &ctx,
            )
            .await
            .unwrap();

        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_handlers_cover_command_and_lifecycle_events() {
        let provider = Arc::new(SchedulerProvider::new(
            uuid::Uuid::new_v4(),
            Arc::new(crate::testing::InMemorySchedulerStore::new()),
            Default::default(),
        ));
        let handlers = SchedulerListener::handlers(provider);

        assert_eq!(handlers.len(), 4);
        assert_eq!(handlers[0].kind(), crate::handler::HandlerKind::Command);
        assert_eq!(handlers[0].message_name(), "service_bus.scheduler.emit_operation");
    }
}
