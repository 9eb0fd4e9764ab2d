use crate::journal::{DynJournal, TagFilter};
use crate::projection::{
    Projection, ProjectionEngine, ProjectionMonitor, ProjectionStatus, RetryPolicy,
};
use crate::{
    Aggregate, AggregateManager, Behavior, CommandEnvelope, CommandId, CqrsContext, CqrsError,
    EventEnvelope, EventId, JoinError,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Narrows which committed events a projection join waits on. It never
/// narrows what is committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EventsFilter {
    /// Wait for every event the command produced.
    #[default]
    All,
    /// Wait for the first `n` events only.
    Limit(usize),
}

impl EventsFilter {
    fn watched<A: Aggregate>(&self, events: &[EventEnvelope<A>]) -> HashSet<EventId> {
        let limit = match self {
            Self::All => events.len(),
            Self::Limit(n) => (*n).min(events.len()),
        };
        events.iter().take(limit).map(|e| e.event_id).collect()
    }
}

/// The runtime's front door: write side, state queries and projection joins
/// for one aggregate kind.
///
/// Owns the per-id single-writer manager and the projection engine, both
/// spawned on the runtime handle given at construction — the executor is
/// always an explicit parameter, never an ambient global.
pub struct CqrsEngine<A>
where
    A: Aggregate,
{
    manager: AggregateManager<A>,
    projections: ProjectionEngine<A>,
    monitor: Arc<ProjectionMonitor<A>>,
    context: CqrsContext,
}

impl<A> CqrsEngine<A>
where
    A: Aggregate,
{
    #[must_use]
    pub fn new(
        journal: DynJournal<A>,
        behavior: Behavior<A>,
        context: CqrsContext,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        let behavior = Arc::new(behavior);
        let monitor = Arc::new(ProjectionMonitor::new());
        Self {
            manager: AggregateManager::new(
                journal.clone(),
                behavior,
                context.clone(),
                runtime.clone(),
            ),
            projections: ProjectionEngine::new(journal, monitor.clone(), runtime),
            monitor,
            context,
        }
    }

    pub fn manager(&self) -> &AggregateManager<A> {
        &self.manager
    }

    /// Attaches a projection to the journal feed.
    pub async fn register_projection<P>(
        &self,
        projection: P,
        filter: Option<TagFilter>,
        retry: RetryPolicy,
    ) -> Result<Arc<ProjectionStatus>, CqrsError>
    where
        P: Projection<A>,
    {
        self.projections.register(projection, filter, retry).await
    }

    pub fn projection_status(&self, name: &str) -> Option<Arc<ProjectionStatus>> {
        self.projections.status(name)
    }

    /// Fire-and-forget submission.
    pub async fn submit(
        &self,
        aggregate_id: A::Id,
        command: A::Command,
    ) -> Result<CommandId, CqrsError> {
        self.manager.submit(aggregate_id, command).await
    }

    /// As [`submit`](Self::submit), keeping the envelope's client-generated
    /// command id.
    pub async fn submit_envelope(
        &self,
        envelope: CommandEnvelope<A>,
    ) -> Result<CommandId, CqrsError> {
        self.manager.submit_envelope(envelope).await
    }

    /// Submits a command and waits for the committed events.
    pub async fn ask(
        &self,
        aggregate_id: A::Id,
        command: A::Command,
        timeout: Duration,
    ) -> Result<Vec<EventEnvelope<A>>, CqrsError> {
        self.manager.ask(aggregate_id, command, timeout).await
    }

    /// As [`ask`](Self::ask), keeping the envelope's client-generated
    /// command id.
    pub async fn ask_envelope(
        &self,
        envelope: CommandEnvelope<A>,
        timeout: Duration,
    ) -> Result<Vec<EventEnvelope<A>>, CqrsError> {
        self.manager.ask_envelope(envelope, timeout).await
    }

    /// Submits a command and additionally waits until the named projection
    /// has applied the events it produced.
    ///
    /// The monitor is registered before submission, so an event applied while
    /// the write is still being acknowledged is never missed. A rejection
    /// fails the call outright; a timeout or a stalled projection fails it
    /// with the committed events attached, since the write itself succeeded.
    pub async fn ask_join(
        &self,
        aggregate_id: A::Id,
        command: A::Command,
        view: &str,
        filter: EventsFilter,
        timeout: Duration,
    ) -> Result<Vec<EventEnvelope<A>>, JoinError<A>> {
        self.ask_join_envelope(
            CommandEnvelope::new(aggregate_id, command, &self.context),
            view,
            filter,
            timeout,
        )
        .await
    }

    /// As [`ask_join`](Self::ask_join), keeping the envelope's
    /// client-generated command id.
    pub async fn ask_join_envelope(
        &self,
        envelope: CommandEnvelope<A>,
        view: &str,
        filter: EventsFilter,
        timeout: Duration,
    ) -> Result<Vec<EventEnvelope<A>>, JoinError<A>> {
        let command_id = envelope.command_id;
        self.monitor.register(view, command_id);

        let events = match self.manager.ask_envelope(envelope, timeout).await {
            Ok(events) => events,
            Err(error) => {
                self.monitor.deregister(view, command_id);
                return Err(JoinError::Command(error));
            }
        };

        let watched = filter.watched(&events);
        debug!(
            view = %view,
            command_id = %command_id,
            watched = watched.len(),
            committed = events.len(),
            "awaiting projection"
        );
        match self
            .monitor
            .await_applied(view, command_id, watched, timeout)
            .await
        {
            Ok(()) => Ok(events),
            Err(cause) => Err(JoinError::Projection { events, cause }),
        }
    }

    /// Current state of one aggregate; `NotFound` when absent.
    pub async fn state(&self, aggregate_id: &A::Id) -> Result<A, CqrsError> {
        self.manager.state(aggregate_id).await
    }

    pub async fn exists(&self, aggregate_id: &A::Id) -> Result<bool, CqrsError> {
        self.manager.exists(aggregate_id).await
    }

    /// Evicts the in-memory worker for one aggregate; the next contact
    /// rebuilds its state from the log.
    pub async fn passivate(&self, aggregate_id: &A::Id) {
        self.manager.passivate(aggregate_id).await
    }
}

impl<A: Aggregate> std::fmt::Debug for CqrsEngine<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CqrsEngine")
            .field("aggregate", &A::TYPE)
            .field("manager", &self.manager)
            .field("projections", &self.projections)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{committed, Counter, CounterEvent};

    #[test]
    fn test_events_filter_all_watches_everything() {
        let context = CqrsContext::new();
        let events: Vec<_> = (1..=3)
            .map(|i| committed("c-1", i, CounterEvent::Incremented, &context))
            .collect();
        assert_eq!(EventsFilter::All.watched::<Counter>(&events).len(), 3);
    }

    #[test]
    fn test_events_filter_limit_watches_prefix() {
        let context = CqrsContext::new();
        let events: Vec<_> = (1..=3)
            .map(|i| committed("c-1", i, CounterEvent::Incremented, &context))
            .collect();
        let watched = EventsFilter::Limit(2).watched::<Counter>(&events);
        assert_eq!(watched.len(), 2);
        assert!(watched.contains(&events[0].event_id));
        assert!(watched.contains(&events[1].event_id));
        assert!(!watched.contains(&events[2].event_id));

        assert_eq!(EventsFilter::Limit(9).watched::<Counter>(&events).len(), 3);
    }
}
