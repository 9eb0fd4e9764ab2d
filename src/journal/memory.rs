use crate::journal::{EventJournal, EventStream, TagFilter};
use crate::{Aggregate, CqrsError, EventEnvelope, EventId};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

/// In-process journal: per-id ordered event vectors plus a fan-out
/// multicaster that delivers newly appended events to every subscriber in
/// append order. The default backend, and the one the test-suite runs on.
///
/// Subscription replays the existing history before going live, under the
/// same lock that orders appends, so no event falls between replay and feed.
#[derive(Debug, Clone)]
pub struct InMemoryJournal<A>
where
    A: Aggregate,
{
    inner: Arc<Mutex<Inner<A>>>,
}

impl<A: Aggregate> Default for InMemoryJournal<A> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }
}

#[derive(Debug)]
struct Inner<A>
where
    A: Aggregate,
{
    streams: HashMap<String, Vec<EventEnvelope<A>>>,
    /// Every append in arrival order; the replay source for subscribers.
    feed: Vec<EventEnvelope<A>>,
    event_ids: HashSet<EventId>,
    subscribers: Vec<Subscriber<A>>,
}

#[derive(Debug)]
struct Subscriber<A>
where
    A: Aggregate,
{
    filter: Option<TagFilter>,
    tx: mpsc::UnboundedSender<Result<EventEnvelope<A>, CqrsError>>,
}

impl<A: Aggregate> Default for Inner<A> {
    fn default() -> Self {
        Self {
            streams: HashMap::new(),
            feed: Vec::new(),
            event_ids: HashSet::new(),
            subscribers: Vec::new(),
        }
    }
}

impl<A> InMemoryJournal<A>
where
    A: Aggregate,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one aggregate's log, for assertions in tests.
    pub fn events_for(&self, aggregate_id: &str) -> Vec<EventEnvelope<A>> {
        let inner = self.inner.lock().unwrap();
        inner.streams.get(aggregate_id).cloned().unwrap_or_default()
    }

    /// Total number of committed events across all aggregates.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().feed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn matches<A: Aggregate>(filter: &Option<TagFilter>, envelope: &EventEnvelope<A>) -> bool {
    filter.as_ref().is_none_or(|f| f.matches(&envelope.tags))
}

#[async_trait::async_trait]
impl<A> EventJournal<A> for InMemoryJournal<A>
where
    A: Aggregate,
{
    async fn append(
        &self,
        aggregate_id: &str,
        events: Vec<EventEnvelope<A>>,
    ) -> Result<(), CqrsError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();

        let mut next_sequence = inner
            .streams
            .get(aggregate_id)
            .map(|stream| stream.len() as u64)
            .unwrap_or(0)
            + 1;
        for envelope in &events {
            if envelope.aggregate_id != aggregate_id {
                return Err(CqrsError::internal(format!(
                    "event for '{}' appended to log of '{}'",
                    envelope.aggregate_id, aggregate_id
                )));
            }
            if envelope.sequence != next_sequence {
                return Err(CqrsError::internal(format!(
                    "non-monotonic append for '{}': expected sequence {}, got {}",
                    aggregate_id, next_sequence, envelope.sequence
                )));
            }
            if inner.event_ids.contains(&envelope.event_id) {
                return Err(CqrsError::internal(format!(
                    "duplicate event id {}",
                    envelope.event_id
                )));
            }
            next_sequence += 1;
        }

        for envelope in &events {
            inner.event_ids.insert(envelope.event_id);
        }
        inner
            .streams
            .entry(aggregate_id.to_string())
            .or_default()
            .extend(events.iter().cloned());
        inner.feed.extend(events.iter().cloned());

        // Fan out; a closed receiver just drops out of the list.
        inner.subscribers.retain(|subscriber| {
            events
                .iter()
                .filter(|envelope| matches(&subscriber.filter, envelope))
                .all(|envelope| subscriber.tx.send(Ok(envelope.clone())).is_ok())
        });

        debug!(
            aggregate_id = %aggregate_id,
            event_count = events.len(),
            "appended events to in-memory journal"
        );
        Ok(())
    }

    async fn load(&self, aggregate_id: &str) -> Result<EventStream<A>, CqrsError> {
        let events = self.events_for(aggregate_id);
        Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
    }

    async fn subscribe(&self, filter: Option<TagFilter>) -> Result<EventStream<A>, CqrsError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.inner.lock().unwrap();
            for envelope in inner.feed.iter().filter(|e| matches(&filter, e)) {
                // Receiver is in hand, the channel cannot be closed yet.
                let _ = tx.send(Ok(envelope.clone()));
            }
            inner.subscribers.push(Subscriber { filter, tx });
        }
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{committed, Counter, CounterEvent};
    use crate::CqrsContext;

    fn journal() -> InMemoryJournal<Counter> {
        InMemoryJournal::new()
    }

    #[tokio::test]
    async fn test_append_then_load_preserves_order() {
        let journal = journal();
        let context = CqrsContext::new();
        let events = vec![
            committed("c-1", 1, CounterEvent::Created { name: "a".into() }, &context),
            committed("c-1", 2, CounterEvent::Incremented, &context),
        ];

        journal.append("c-1", events.clone()).await.unwrap();

        let loaded: Vec<_> = journal
            .load("c-1")
            .await
            .unwrap()
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(loaded, events);
    }

    #[tokio::test]
    async fn test_append_rejects_sequence_gap() {
        let journal = journal();
        let context = CqrsContext::new();

        let error = journal
            .append(
                "c-1",
                vec![committed("c-1", 2, CounterEvent::Incremented, &context)],
            )
            .await
            .expect_err("gap should be rejected");
        assert!(error.is_fatal());
        assert!(journal.is_empty());
    }

    #[tokio::test]
    async fn test_append_rejects_duplicate_event_id() {
        let journal = journal();
        let context = CqrsContext::new();
        let first = committed("c-1", 1, CounterEvent::Created { name: "a".into() }, &context);
        journal.append("c-1", vec![first.clone()]).await.unwrap();

        let mut second = committed("c-1", 2, CounterEvent::Incremented, &context);
        second.event_id = first.event_id;
        let error = journal
            .append("c-1", vec![second])
            .await
            .expect_err("duplicate id should be rejected");
        assert!(error.is_fatal());
        assert_eq!(journal.events_for("c-1").len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_replays_then_follows() {
        let journal = journal();
        let context = CqrsContext::new();
        journal
            .append(
                "c-1",
                vec![committed("c-1", 1, CounterEvent::Created { name: "a".into() }, &context)],
            )
            .await
            .unwrap();

        let mut feed = journal.subscribe(None).await.unwrap();
        journal
            .append(
                "c-1",
                vec![committed("c-1", 2, CounterEvent::Incremented, &context)],
            )
            .await
            .unwrap();

        let replayed = feed.next().await.unwrap().unwrap();
        assert_eq!(replayed.sequence, 1);
        let live = feed.next().await.unwrap().unwrap();
        assert_eq!(live.sequence, 2);
    }

    #[tokio::test]
    async fn test_subscribe_filters_by_tag() {
        let journal = journal();
        let context = CqrsContext::new();
        let mut feed = journal
            .subscribe(Some(TagFilter::new(["elsewhere"])))
            .await
            .unwrap();

        journal
            .append(
                "c-1",
                vec![committed("c-1", 1, CounterEvent::Created { name: "a".into() }, &context)],
            )
            .await
            .unwrap();

        let mut tagged = committed("c-1", 2, CounterEvent::Incremented, &context);
        tagged.tags.insert("elsewhere".to_string());
        journal.append("c-1", vec![tagged]).await.unwrap();

        let only = feed.next().await.unwrap().unwrap();
        assert_eq!(only.sequence, 2);
    }
}
