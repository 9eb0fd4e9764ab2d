use crate::{Aggregate, CommandId, CqrsError, EventEnvelope, EventId};
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Correlates write-side command ids with read-side arrival.
///
/// An entry is registered under `(view, command id)` **before** the command
/// is submitted, so applied-event notifications arriving while the command is
/// still in flight are buffered instead of missed. Once the caller knows
/// which event ids it watches, [`await_applied`](Self::await_applied)
/// completes when the named projection has acknowledged all of them.
pub struct ProjectionMonitor<A>
where
    A: Aggregate,
{
    inner: Mutex<MonitorInner>,
    _aggregate: PhantomData<fn() -> A>,
}

struct MonitorInner {
    entries: HashMap<(String, CommandId), JoinEntry>,
    /// Views whose projection has stalled; joins against them fail fast.
    stalled: HashSet<String>,
}

#[derive(Default)]
struct JoinEntry {
    seen: HashSet<EventId>,
    expected: Option<HashSet<EventId>>,
    waiter: Option<oneshot::Sender<Result<(), CqrsError>>>,
}

impl JoinEntry {
    fn is_satisfied(&self) -> bool {
        self.expected
            .as_ref()
            .is_some_and(|expected| expected.is_subset(&self.seen))
    }
}

impl<A> ProjectionMonitor<A>
where
    A: Aggregate,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MonitorInner {
                entries: HashMap::new(),
                stalled: HashSet::new(),
            }),
            _aggregate: PhantomData,
        }
    }

    /// Registers interest in the events one command will produce. Must happen
    /// before the command is submitted.
    pub fn register(&self, view: &str, command_id: CommandId) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .entries
            .insert((view.to_string(), command_id), JoinEntry::default());
    }

    /// Drops a registration that will not be awaited (the submission failed).
    pub fn deregister(&self, view: &str, command_id: CommandId) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.remove(&(view.to_string(), command_id));
    }

    /// Called by the projection runtime after each successful apply.
    pub fn notify_applied(&self, view: &str, envelope: &EventEnvelope<A>) {
        let mut inner = self.inner.lock().unwrap();
        let key = (view.to_string(), envelope.command_id);
        let Some(entry) = inner.entries.get_mut(&key) else {
            return;
        };
        entry.seen.insert(envelope.event_id);
        debug!(
            view = %view,
            command_id = %envelope.command_id,
            event_id = %envelope.event_id,
            "event acknowledged by projection"
        );
        if entry.is_satisfied() {
            if let Some(waiter) = entry.waiter.take() {
                let _ = waiter.send(Ok(()));
            }
            inner.entries.remove(&key);
        }
    }

    /// Called by the projection runtime when a projection stalls: every join
    /// against the view fails, and later joins fail fast.
    pub fn notify_stalled(&self, view: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.stalled.insert(view.to_string());
        for ((entry_view, _), entry) in inner.entries.iter_mut() {
            if entry_view == view {
                if let Some(waiter) = entry.waiter.take() {
                    let _ = waiter.send(Err(CqrsError::StalledProjection(view.to_string())));
                }
            }
        }
        inner
            .entries
            .retain(|(entry_view, _), _| entry_view != view);
    }

    /// Completes when every watched event id has been applied by the view,
    /// or fails on timeout or projection stall.
    pub async fn await_applied(
        &self,
        view: &str,
        command_id: CommandId,
        watched: HashSet<EventId>,
        timeout: Duration,
    ) -> Result<(), CqrsError> {
        let key = (view.to_string(), command_id);
        let waiter = {
            let mut inner = self.inner.lock().unwrap();
            if inner.stalled.contains(view) {
                inner.entries.remove(&key);
                return Err(CqrsError::StalledProjection(view.to_string()));
            }
            let Some(entry) = inner.entries.get_mut(&key) else {
                return Err(CqrsError::internal(format!(
                    "no join registered for command {command_id} on view '{view}'"
                )));
            };
            entry.expected = Some(watched);
            if entry.is_satisfied() {
                inner.entries.remove(&key);
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            entry.waiter = Some(tx);
            rx
        };

        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.deregister(view, command_id);
                Err(CqrsError::internal("join monitor dropped the waiter"))
            }
            Err(_) => {
                self.deregister(view, command_id);
                Err(CqrsError::Timeout(timeout))
            }
        }
    }
}

impl<A: Aggregate> Default for ProjectionMonitor<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Aggregate> std::fmt::Debug for ProjectionMonitor<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("ProjectionMonitor")
            .field("pending_joins", &inner.entries.len())
            .field("stalled_views", &inner.stalled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{committed, Counter, CounterEvent};
    use crate::CqrsContext;
    use std::sync::Arc;

    fn monitor() -> Arc<ProjectionMonitor<Counter>> {
        Arc::new(ProjectionMonitor::new())
    }

    #[tokio::test]
    async fn test_completes_once_all_watched_events_applied() {
        let monitor = monitor();
        let context = CqrsContext::new();
        let command_id = context.next_command_id();
        monitor.register("view", command_id);

        let mut first = committed("c-1", 1, CounterEvent::Created { name: "a".into() }, &context);
        first.command_id = command_id;
        let mut second = committed("c-1", 2, CounterEvent::Incremented, &context);
        second.command_id = command_id;

        let watched: HashSet<EventId> = [first.event_id, second.event_id].into();
        let waiting = {
            let monitor = monitor.clone();
            tokio::spawn(async move {
                monitor
                    .await_applied("view", command_id, watched, Duration::from_secs(5))
                    .await
            })
        };

        monitor.notify_applied("view", &first);
        monitor.notify_applied("view", &second);
        waiting.await.unwrap().expect("join should complete");
    }

    #[tokio::test]
    async fn test_notifications_before_await_are_buffered() {
        let monitor = monitor();
        let context = CqrsContext::new();
        let command_id = context.next_command_id();
        monitor.register("view", command_id);

        let mut event = committed("c-1", 1, CounterEvent::Created { name: "a".into() }, &context);
        event.command_id = command_id;
        // The projection ran before the caller knew what to watch.
        monitor.notify_applied("view", &event);

        monitor
            .await_applied(
                "view",
                command_id,
                HashSet::from([event.event_id]),
                Duration::from_millis(50),
            )
            .await
            .expect("buffered notification should satisfy the join");
    }

    #[tokio::test]
    async fn test_times_out_when_projection_never_confirms() {
        let monitor = monitor();
        let context = CqrsContext::new();
        let command_id = context.next_command_id();
        monitor.register("view", command_id);

        let event = committed("c-1", 1, CounterEvent::Created { name: "a".into() }, &context);
        let error = monitor
            .await_applied(
                "view",
                command_id,
                HashSet::from([event.event_id]),
                Duration::from_millis(20),
            )
            .await
            .expect_err("nothing ever applies");
        assert!(matches!(error, CqrsError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_stall_fails_pending_and_later_joins() {
        let monitor = monitor();
        let context = CqrsContext::new();
        let command_id = context.next_command_id();
        monitor.register("view", command_id);

        let event = committed("c-1", 1, CounterEvent::Created { name: "a".into() }, &context);
        let watched = HashSet::from([event.event_id]);
        let waiting = {
            let monitor = monitor.clone();
            let watched = watched.clone();
            tokio::spawn(async move {
                monitor
                    .await_applied("view", command_id, watched, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        monitor.notify_stalled("view");
        let error = waiting.await.unwrap().expect_err("stall should fail the join");
        assert!(matches!(error, CqrsError::StalledProjection(_)));

        // Later joins against the stalled view fail fast.
        let later = context.next_command_id();
        monitor.register("view", later);
        let error = monitor
            .await_applied("view", later, watched, Duration::from_secs(5))
            .await
            .expect_err("stalled view should fail fast");
        assert!(matches!(error, CqrsError::StalledProjection(_)));
    }

    #[tokio::test]
    async fn test_empty_watch_set_completes_immediately() {
        let monitor = monitor();
        let context = CqrsContext::new();
        let command_id = context.next_command_id();
        monitor.register("view", command_id);
        monitor
            .await_applied("view", command_id, HashSet::new(), Duration::from_millis(10))
            .await
            .expect("nothing to watch");
    }
}
