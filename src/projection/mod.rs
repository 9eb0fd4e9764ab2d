//! Read-side: projections consuming the journal feed into derived views.

mod monitor;
pub use monitor::*;
mod view;
pub use view::*;

use crate::journal::{DynJournal, EventStream, TagFilter};
use crate::{Aggregate, CqrsError, EventEnvelope};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn, Instrument};

/// A read-side consumer of committed events.
///
/// Delivery is at-least-once: the runtime never deduplicates, so `handle`
/// must be idempotent — keyed by event id or a domain-unique composite key —
/// for repeated application to be a no-op.
#[async_trait::async_trait]
pub trait Projection<A>: Send + Sync + 'static
where
    A: Aggregate,
{
    /// Unique name; keys the cursor, the status and the join monitor.
    fn name(&self) -> &str;

    async fn handle(&self, event: &EventEnvelope<A>) -> Result<(), CqrsError>;
}

/// Bounded exponential backoff applied to a failing projection handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Observable state of one running projection.
#[derive(Debug, Default)]
pub struct ProjectionStatus {
    applied: AtomicU64,
    stalled: AtomicBool,
}

impl ProjectionStatus {
    /// Number of events applied so far: the projection's cursor.
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }

    fn advance(&self) {
        self.applied.fetch_add(1, Ordering::SeqCst);
    }

    fn mark_stalled(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }
}

/// Drives registered projections from the journal's feed, one task per
/// projection. A stalled projection stops consuming without blocking writes
/// or its siblings.
pub struct ProjectionEngine<A>
where
    A: Aggregate,
{
    journal: DynJournal<A>,
    monitor: Arc<ProjectionMonitor<A>>,
    runtime: tokio::runtime::Handle,
    statuses: Mutex<HashMap<String, Arc<ProjectionStatus>>>,
}

impl<A> ProjectionEngine<A>
where
    A: Aggregate,
{
    #[must_use]
    pub fn new(
        journal: DynJournal<A>,
        monitor: Arc<ProjectionMonitor<A>>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            journal,
            monitor,
            runtime,
            statuses: Mutex::new(HashMap::new()),
        }
    }

    pub fn monitor(&self) -> Arc<ProjectionMonitor<A>> {
        self.monitor.clone()
    }

    /// Subscribes the projection to the journal and spawns its pump task.
    pub async fn register<P>(
        &self,
        projection: P,
        filter: Option<TagFilter>,
        retry: RetryPolicy,
    ) -> Result<Arc<ProjectionStatus>, CqrsError>
    where
        P: Projection<A>,
    {
        let name = projection.name().to_string();
        let status = Arc::new(ProjectionStatus::default());
        {
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.contains_key(&name) {
                return Err(CqrsError::internal(format!(
                    "projection '{name}' is already registered"
                )));
            }
            statuses.insert(name.clone(), status.clone());
        }

        let stream = match self.journal.subscribe(filter).await {
            Ok(stream) => stream,
            Err(subscribe_error) => {
                self.statuses.lock().unwrap().remove(&name);
                return Err(subscribe_error);
            }
        };
        let span = tracing::info_span!("projection", name = %name);
        self.runtime.spawn(
            run_projection(projection, stream, status.clone(), self.monitor.clone(), retry)
                .instrument(span),
        );
        info!(projection = %name, "projection registered");
        Ok(status)
    }

    pub fn status(&self, name: &str) -> Option<Arc<ProjectionStatus>> {
        self.statuses.lock().unwrap().get(name).cloned()
    }
}

impl<A: Aggregate> std::fmt::Debug for ProjectionEngine<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.statuses.lock().unwrap().keys().cloned().collect();
        f.debug_struct("ProjectionEngine")
            .field("projections", &names)
            .finish()
    }
}

async fn run_projection<A, P>(
    projection: P,
    mut events: EventStream<A>,
    status: Arc<ProjectionStatus>,
    monitor: Arc<ProjectionMonitor<A>>,
    retry: RetryPolicy,
) where
    A: Aggregate,
    P: Projection<A>,
{
    while let Some(event) = events.next().await {
        let envelope = match event {
            Ok(envelope) => envelope,
            Err(feed_error) => {
                error!(error = %feed_error, "journal feed error");
                continue;
            }
        };

        let mut attempt = 0u32;
        loop {
            match projection.handle(&envelope).await {
                Ok(()) => {
                    status.advance();
                    monitor.notify_applied(projection.name(), &envelope);
                    break;
                }
                Err(handler_error) if attempt < retry.max_retries => {
                    warn!(
                        event_id = %envelope.event_id,
                        attempt,
                        error = %handler_error,
                        "projection handler failed, retrying"
                    );
                    tokio::time::sleep(retry.delay(attempt)).await;
                    attempt += 1;
                }
                Err(handler_error) => {
                    // Out of retries: the projection must not silently
                    // advance past the event, so it stops consuming.
                    error!(
                        event_id = %envelope.event_id,
                        error = %handler_error,
                        "projection stalled"
                    );
                    status.mark_stalled();
                    monitor.notify_stalled(projection.name());
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{EventJournal, InMemoryJournal};
    use crate::testing::{committed, Counter, CounterEvent, RecordingProjection};
    use crate::CqrsContext;

    async fn wait_for(status: &ProjectionStatus, applied: u64) {
        for _ in 0..200 {
            if status.applied() >= applied || status.is_stalled() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn engine(journal: Arc<InMemoryJournal<Counter>>) -> ProjectionEngine<Counter> {
        ProjectionEngine::new(
            journal,
            Arc::new(ProjectionMonitor::new()),
            tokio::runtime::Handle::current(),
        )
    }

    #[tokio::test]
    async fn test_projection_receives_events_in_order() {
        let journal = Arc::new(InMemoryJournal::new());
        let engine = engine(journal.clone());
        let projection = RecordingProjection::new("recorder");
        let seen = projection.seen();
        let status = engine
            .register(projection, None, RetryPolicy::default())
            .await
            .unwrap();

        let context = CqrsContext::new();
        journal
            .append(
                "c-1",
                vec![committed("c-1", 1, CounterEvent::Created { name: "a".into() }, &context)],
            )
            .await
            .unwrap();
        journal
            .append(
                "c-1",
                vec![committed("c-1", 2, CounterEvent::Incremented, &context)],
            )
            .await
            .unwrap();

        wait_for(&status, 2).await;
        let sequences: Vec<u64> = seen.lock().unwrap().iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let journal = Arc::new(InMemoryJournal::new());
        let engine = engine(journal.clone());
        let projection = RecordingProjection::new("flaky").failing_first(2);
        let seen = projection.seen();
        let status = engine
            .register(
                projection,
                None,
                RetryPolicy {
                    max_retries: 5,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                },
            )
            .await
            .unwrap();

        let context = CqrsContext::new();
        journal
            .append(
                "c-1",
                vec![committed("c-1", 1, CounterEvent::Created { name: "a".into() }, &context)],
            )
            .await
            .unwrap();

        wait_for(&status, 1).await;
        assert_eq!(status.applied(), 1);
        assert!(!status.is_stalled());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_stall_the_projection() {
        let journal = Arc::new(InMemoryJournal::new());
        let engine = engine(journal.clone());
        let projection = RecordingProjection::new("broken").failing_first(u32::MAX);
        let status = engine
            .register(
                projection,
                None,
                RetryPolicy {
                    max_retries: 2,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                },
            )
            .await
            .unwrap();

        let context = CqrsContext::new();
        journal
            .append(
                "c-1",
                vec![committed("c-1", 1, CounterEvent::Created { name: "a".into() }, &context)],
            )
            .await
            .unwrap();

        wait_for(&status, 1).await;
        assert!(status.is_stalled());
        assert_eq!(status.applied(), 0);
    }

    #[tokio::test]
    async fn test_stall_is_isolated_per_projection() {
        let journal = Arc::new(InMemoryJournal::new());
        let engine = engine(journal.clone());
        let broken = RecordingProjection::new("broken").failing_first(u32::MAX);
        let healthy = RecordingProjection::new("healthy");
        let broken_status = engine
            .register(
                broken,
                None,
                RetryPolicy {
                    max_retries: 1,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                },
            )
            .await
            .unwrap();
        let healthy_status = engine
            .register(healthy, None, RetryPolicy::default())
            .await
            .unwrap();

        let context = CqrsContext::new();
        journal
            .append(
                "c-1",
                vec![committed("c-1", 1, CounterEvent::Created { name: "a".into() }, &context)],
            )
            .await
            .unwrap();

        wait_for(&broken_status, 1).await;
        wait_for(&healthy_status, 1).await;
        assert!(broken_status.is_stalled());
        assert!(!healthy_status.is_stalled());
        assert_eq!(healthy_status.applied(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_refused() {
        let journal = Arc::new(InMemoryJournal::new());
        let engine = engine(journal);
        engine
            .register(RecordingProjection::new("twice"), None, RetryPolicy::default())
            .await
            .unwrap();
        let error = engine
            .register(RecordingProjection::new("twice"), None, RetryPolicy::default())
            .await
            .expect_err("second registration should be refused");
        assert!(error.is_fatal());
    }
}
