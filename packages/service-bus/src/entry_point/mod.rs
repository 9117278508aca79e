//! The consumption loop.
//!
//! # Overview
//!
//! [`EntryPoint::listen`] pulls packages from the transport and hands each one
//! to the [`EntryPointProcessor`] on its own task. The loop never waits for
//! processing to finish; it only stalls while the number of in-flight packages
//! is at the configured bound, polling every `await_delay` until a slot frees
//! up. Nothing is dropped: the transport simply is not read while the loop is
//! stalled.
//!
//! # Ordering
//!
//! Packages are started in receipt order. Completion order is unconstrained.
//!
//! # Shutdown
//!
//! [`EntryPoint::stop`] stops the transport, then waits until every in-flight
//! package has been processed before returning. There is no hard deadline.
//!
//! ```ignore
//! let entry_point = bus.entry_point();
//! let listener = tokio::spawn({
//!     let entry_point = entry_point.clone();
//!     async move { entry_point.listen(&[Queue::new("orders")]).await }
//! });
//!
//! shutdown_signal().await;
//! entry_point.stop().await?;
//! listener.await??;
//! ```

mod processor;

pub use processor::EntryPointProcessor;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EntryPointConfig;
use crate::error::{panic_message, TransportError};
use crate::package::IncomingPackage;
use crate::transport::{Queue, Transport};

/// Tracks packages currently being processed.
///
/// Counted per package id, so a redelivered package that is still in flight
/// counts twice.
#[derive(Default)]
pub struct InflightTracker {
    entries: DashMap<String, usize>,
}

impl InflightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a package as in flight until the returned guard is dropped.
    pub fn track(self: &Arc<Self>, package_id: &str) -> InflightGuard {
        *self.entries.entry(package_id.to_string()).or_insert(0) += 1;
        InflightGuard {
            tracker: self.clone(),
            package_id: package_id.to_string(),
        }
    }

    /// Number of packages in flight.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|entry| *entry.value()).sum()
    }

    /// Returns `true` if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids of the packages in flight.
    pub fn package_ids(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    fn release(&self, package_id: &str) {
        self.entries.remove_if_mut(package_id, |_, count| {
            *count -= 1;
            *count == 0
        });
    }
}

/// Removes its package from the tracker on drop, including on panic.
pub struct InflightGuard {
    tracker: Arc<InflightTracker>,
    package_id: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.tracker.release(&self.package_id);
    }
}

/// Consumes packages from a transport under a concurrency bound.
pub struct EntryPoint {
    transport: Arc<dyn Transport>,
    processor: Arc<EntryPointProcessor>,
    config: EntryPointConfig,
    inflight: Arc<InflightTracker>,
    shutdown: CancellationToken,
}

impl EntryPoint {
    pub fn new(
        transport: Arc<dyn Transport>,
        processor: Arc<EntryPointProcessor>,
        config: EntryPointConfig,
    ) -> Self {
        Self {
            transport,
            processor,
            config,
            inflight: Arc::new(InflightTracker::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Consume `queues` until the transport stream ends or [`stop`](Self::stop)
    /// completes.
    pub async fn listen(&self, queues: &[Queue]) -> Result<(), TransportError> {
        let mut packages = self.transport.consume(queues).await?;

        info!(
            entry_point = %self.config.name,
            queues = ?queues.iter().map(|q| q.name.as_str()).collect::<Vec<_>>(),
            max_concurrent_tasks = self.config.max_concurrent_tasks,
            "entry point listening"
        );

        loop {
            while self.inflight.len() >= self.config.max_concurrent_tasks {
                if self.shutdown.is_cancelled() {
                    break;
                }
                tokio::time::sleep(self.config.await_delay).await;
            }

            let package = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = packages.next() => match next {
                    Some(package) => package,
                    None => break,
                },
            };

            self.spawn(package);
        }

        info!(entry_point = %self.config.name, "entry point no longer consuming");
        Ok(())
    }

    fn spawn(&self, package: Arc<dyn IncomingPackage>) {
        let guard = self.inflight.track(package.id());
        let processor = self.processor.clone();

        debug!(package_id = %package.id(), in_flight = self.inflight.len(), "package accepted");

        tokio::spawn(async move {
            let _guard = guard;
            let package_id = package.id().to_string();

            // The processor contains handler panics; this catches anything left
            match AssertUnwindSafe(processor.handle(package)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(package_id = %package_id, error = %err, "unable to acknowledge package");
                }
                Err(panic) => {
                    error!(
                        package_id = %package_id,
                        panic = %panic_message(panic.as_ref()),
                        "package processing panicked"
                    );
                }
            }
        });
    }

    /// Stop consuming and wait for every in-flight package to finish.
    pub async fn stop(&self) -> Result<(), TransportError> {
        info!(entry_point = %self.config.name, "stopping entry point");

        let stopped = self.transport.stop().await;
        if let Err(err) = &stopped {
            warn!(error = %err, "transport failed to stop cleanly, draining anyway");
        }

        while !self.inflight.is_empty() {
            info!(
                in_flight = self.inflight.len(),
                packages = ?self.inflight.package_ids(),
                "waiting for in-flight packages"
            );
            tokio::time::sleep(self.config.stop_poll_interval).await;
        }

        self.shutdown.cancel();
        info!(entry_point = %self.config.name, "entry point stopped");
        stopped
    }

    /// Number of packages currently being processed.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Configuration in use.
    pub fn config(&self) -> &EntryPointConfig {
        &self.config
    }
}
