//! In-memory collaborators for tests.
//!
//! # Feature Flag
//!
//! Outside this crate's own tests the module needs the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! service-bus = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Loopback
//!
//! [`InMemoryTransport::loopback`] feeds every sent package back into its own
//! consume stream, honoring [`DeliveryOptions::delay`](crate::DeliveryOptions)
//! with `tokio::time::sleep`. Combined with a paused tokio clock this runs
//! scheduler round trips deterministically:
//!
//! ```ignore
//! let transport = Arc::new(InMemoryTransport::loopback());
//! let bus = ServiceBusBuilder::new(transport.clone(), DeliveryDestination::new("app"))
//!     .handlers(SchedulerListener::handlers(scheduler.clone()))
//!     .build()?;
//!
//! tokio::spawn(async move { bus.listen(&[Queue::new("app")]).await });
//! scheduler.schedule("op-1", &Remind {}, Utc::now() + Duration::hours(1), &ctx).await?;
//!
//! transport.wait_for_settlements(3).await;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec::{JsonMessageEncoder, MessageEncoder};
use crate::core::{EncodedMessage, Message, TraceId};
use crate::endpoint::{EndpointRouter, TransportEndpoint};
use crate::error::{StoreError, TransportError};
use crate::package::{DeliveryDestination, Headers, IncomingPackage, OutboundPackage, ENCODER_HEADER};
use crate::saga::{SagaStore, StoredSaga};
use crate::scheduler::{SchedulerStore, StoredRegistry};
use crate::store::Revision;
use crate::transport::{PackageStream, Queue, Transport};

/// How a package was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Ack(String),
    Nack {
        id: String,
        requeue: bool,
        reason: Option<String>,
    },
    Reject {
        id: String,
        requeue: bool,
        reason: Option<String>,
    },
}

#[derive(Default)]
struct SettlementLog {
    entries: Mutex<Vec<Settlement>>,
    notify: Notify,
}

impl SettlementLog {
    fn record(&self, settlement: Settlement) {
        self.entries.lock().unwrap().push(settlement);
        self.notify.notify_waiters();
    }

    fn snapshot(&self) -> Vec<Settlement> {
        self.entries.lock().unwrap().clone()
    }

    async fn wait_for(&self, count: usize) {
        loop {
            let notified = self.notify.notified();
            if self.entries.lock().unwrap().len() >= count {
                return;
            }
            notified.await;
        }
    }
}

/// An incoming package recording how it was settled.
pub struct InMemoryPackage {
    id: String,
    trace_id: TraceId,
    payload: Vec<u8>,
    headers: Headers,
    origin: DeliveryDestination,
    settlements: SettlementLog,
    shared: Option<Arc<SettlementLog>>,
}

impl InMemoryPackage {
    pub fn new(id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            trace_id: TraceId::new(),
            payload,
            headers: Headers::new(),
            origin: DeliveryDestination::new("in-memory"),
            settlements: SettlementLog::default(),
            shared: None,
        }
    }

    pub fn with_trace_id(mut self, trace_id: TraceId) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_origin(mut self, origin: DeliveryDestination) -> Self {
        self.origin = origin;
        self
    }

    fn reporting_to(mut self, log: Arc<SettlementLog>) -> Self {
        self.shared = Some(log);
        self
    }

    /// Settlements of this package, in call order.
    pub fn settlements(&self) -> Vec<Settlement> {
        self.settlements.snapshot()
    }

    fn settle(&self, settlement: Settlement) {
        if let Some(shared) = &self.shared {
            shared.record(settlement.clone());
        }
        self.settlements.record(settlement);
    }
}

#[async_trait]
impl IncomingPackage for InMemoryPackage {
    fn id(&self) -> &str {
        &self.id
    }

    fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn origin(&self) -> &DeliveryDestination {
        &self.origin
    }

    async fn ack(&self) -> Result<(), TransportError> {
        self.settle(Settlement::Ack(self.id.clone()));
        Ok(())
    }

    async fn nack(&self, requeue: bool, reason: Option<String>) -> Result<(), TransportError> {
        self.settle(Settlement::Nack {
            id: self.id.clone(),
            requeue,
            reason,
        });
        Ok(())
    }

    async fn reject(&self, requeue: bool, reason: Option<String>) -> Result<(), TransportError> {
        self.settle(Settlement::Reject {
            id: self.id.clone(),
            requeue,
            reason,
        });
        Ok(())
    }
}

/// A transport backed by an in-process channel.
pub struct InMemoryTransport {
    loopback: bool,
    sender: mpsc::UnboundedSender<Arc<dyn IncomingPackage>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Arc<dyn IncomingPackage>>>>,
    sent: Mutex<Vec<OutboundPackage>>,
    settlements: Arc<SettlementLog>,
    stopped: CancellationToken,
    next_id: AtomicUsize,
}

impl InMemoryTransport {
    /// Transport that records sent packages without consuming them.
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Transport that also feeds sent packages back into its consume stream.
    pub fn loopback() -> Self {
        Self::build(true)
    }

    fn build(loopback: bool) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            loopback,
            sender,
            receiver: Mutex::new(Some(receiver)),
            sent: Mutex::new(Vec::new()),
            settlements: Arc::new(SettlementLog::default()),
            stopped: CancellationToken::new(),
            next_id: AtomicUsize::new(1),
        }
    }

    /// Enqueue a raw payload for consumption. Returns the package id.
    pub fn publish(&self, payload: Vec<u8>, headers: Headers) -> String {
        self.enqueue(payload, headers, TraceId::new())
    }

    /// Enqueue a JSON encoded message for consumption. Returns the package id.
    pub fn publish_message<M: Message>(&self, message: &M) -> String {
        let encoder = JsonMessageEncoder;
        let payload = encoder.encode(message).unwrap();
        let mut headers = Headers::new();
        headers.insert(ENCODER_HEADER.to_string(), encoder.key().to_string());
        self.publish(payload, headers)
    }

    fn enqueue(&self, payload: Vec<u8>, headers: Headers, trace_id: TraceId) -> String {
        let id = format!("pkg-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let package = InMemoryPackage::new(id.clone(), payload)
            .with_trace_id(trace_id)
            .with_headers(headers)
            .reporting_to(self.settlements.clone());
        let _ = self.sender.send(Arc::new(package));
        id
    }

    /// Every package handed to [`Transport::send`], in send order.
    pub fn sent(&self) -> Vec<OutboundPackage> {
        self.sent.lock().unwrap().clone()
    }

    /// Namespaces of the sent envelopes, in send order.
    pub fn sent_namespaces(&self) -> Vec<String> {
        self.sent_envelopes().into_iter().map(|e| e.namespace).collect()
    }

    /// Sent messages of type `M`, in send order.
    pub fn sent_messages<M: Message>(&self) -> Vec<M> {
        self.sent_envelopes()
            .into_iter()
            .filter(|e| e.namespace == <M as Message>::message_name())
            .map(|e| serde_json::from_value(e.message).unwrap())
            .collect()
    }

    fn sent_envelopes(&self) -> Vec<EncodedMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|p| serde_json::from_slice(&p.payload).ok())
            .collect()
    }

    /// Settlements of consumed packages, in call order.
    pub fn settlements(&self) -> Vec<Settlement> {
        self.settlements.snapshot()
    }

    pub fn acks(&self) -> usize {
        self.settlements()
            .iter()
            .filter(|s| matches!(s, Settlement::Ack(_)))
            .count()
    }

    /// Wait until at least `count` consumed packages have been settled.
    pub async fn wait_for_settlements(&self, count: usize) {
        self.settlements.wait_for(count).await
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn consume(&self, _queues: &[Queue]) -> Result<PackageStream, TransportError> {
        let receiver = self
            .receiver
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| TransportError::Unavailable("already consuming".into()))?;
        let stopped = self.stopped.clone();

        let packages = stream::unfold((receiver, stopped), |(mut receiver, stopped)| async move {
            let next = tokio::select! {
                biased;
                _ = stopped.cancelled() => None,
                package = receiver.recv() => package,
            };
            next.map(|package| (package, (receiver, stopped)))
        });

        Ok(packages.boxed())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.stopped.cancel();
        Ok(())
    }

    async fn send(&self, package: OutboundPackage) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(package.clone());

        if !self.loopback {
            return Ok(());
        }

        match package.delay.filter(|d| !d.is_zero()) {
            None => {
                self.enqueue(package.payload, package.headers, package.trace_id);
            }
            Some(delay) => {
                let sender = self.sender.clone();
                let settlements = self.settlements.clone();
                let id = format!("pkg-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let delayed = InMemoryPackage::new(id, package.payload)
                        .with_trace_id(package.trace_id)
                        .with_headers(package.headers)
                        .reporting_to(settlements);
                    let _ = sender.send(Arc::new(delayed));
                });
            }
        }
        Ok(())
    }
}

/// Endpoint router sending everything through `transport` to destination `test`.
pub fn test_endpoints(transport: &Arc<InMemoryTransport>) -> Arc<EndpointRouter> {
    let endpoint = TransportEndpoint::new(
        "test",
        DeliveryDestination::new("test"),
        transport.clone(),
        Arc::new(JsonMessageEncoder),
    );
    Arc::new(EndpointRouter::new(Arc::new(endpoint)))
}

/// Saga rows in a map keyed by `(id, identifier_class)`.
#[derive(Default)]
pub struct InMemorySagaStore {
    rows: Mutex<HashMap<(String, String), StoredSaga>>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str, identifier_class: &str) -> Option<StoredSaga> {
        self.rows
            .lock()
            .unwrap()
            .get(&(id.to_string(), identifier_class.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn save(&self, saga: StoredSaga) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let key = (saga.id.clone(), saga.identifier_class.clone());
        if rows.contains_key(&key) {
            return Err(StoreError::Duplicate(saga.id));
        }
        rows.insert(key, saga);
        Ok(())
    }

    async fn update(&self, saga: StoredSaga) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let key = (saga.id.clone(), saga.identifier_class.clone());
        match rows.get_mut(&key) {
            Some(row) => {
                *row = saga;
                Ok(())
            }
            None => Err(StoreError::NotFound(saga.id)),
        }
    }

    async fn obtain(&self, id: &str, identifier_class: &str) -> Result<Option<StoredSaga>, StoreError> {
        Ok(self.get(id, identifier_class))
    }

    async fn remove(&self, id: &str, identifier_class: &str) -> Result<(), StoreError> {
        self.rows
            .lock()
            .unwrap()
            .remove(&(id.to_string(), identifier_class.to_string()));
        Ok(())
    }
}

/// Registry blobs with revision checks.
#[derive(Default)]
pub struct InMemorySchedulerStore {
    rows: Mutex<HashMap<Uuid, StoredRegistry>>,
    forced_conflicts: AtomicU32,
    saves: AtomicUsize,
}

impl InMemorySchedulerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` saves fail with [`StoreError::Conflict`].
    pub fn inject_conflicts(&self, count: u32) {
        self.forced_conflicts.store(count, Ordering::SeqCst);
    }

    /// Number of successful saves.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SchedulerStore for InMemorySchedulerStore {
    async fn load(&self, id: Uuid) -> Result<Option<StoredRegistry>, StoreError> {
        Ok(self.rows.lock().unwrap().get(&id).cloned())
    }

    async fn save(&self, id: Uuid, data: Vec<u8>, expected: Revision) -> Result<Revision, StoreError> {
        let forced = self
            .forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if forced.is_ok() {
            return Err(StoreError::Conflict);
        }

        let mut rows = self.rows.lock().unwrap();
        let current = rows.get(&id).map(|row| row.revision).unwrap_or(Revision::NONE);
        if current != expected {
            return Err(StoreError::Conflict);
        }

        let revision = current.next();
        rows.insert(
            id,
            StoredRegistry {
                id,
                data,
                revision,
            },
        );
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scheduler_store_rejects_stale_revision() {
        let store = InMemorySchedulerStore::new();
        let id = Uuid::new_v4();

        let first = store.save(id, vec![1], Revision::NONE).await.unwrap();
        assert_eq!(first, Revision(1));

        assert!(matches!(
            store.save(id, vec![2], Revision::NONE).await,
            Err(StoreError::Conflict)
        ));
        assert_eq!(store.save(id, vec![3], first).await.unwrap(), Revision(2));
        assert_eq!(store.load(id).await.unwrap().unwrap().data, vec![3]);
    }

    #[tokio::test]
    async fn test_consume_stream_ends_on_stop() {
        let transport = InMemoryTransport::new();
        transport.publish(b"{}".to_vec(), Headers::new());

        let mut packages = transport.consume(&[Queue::new("q")]).await.unwrap();
        assert!(packages.next().await.is_some());

        transport.stop().await.unwrap();
        assert!(packages.next().await.is_none());
        assert!(transport.consume(&[Queue::new("q")]).await.is_err());
    }
}
