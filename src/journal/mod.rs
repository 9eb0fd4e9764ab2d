//! Append-only per-aggregate event log, with a live subscription feed.

mod memory;
pub use memory::*;

use crate::{Aggregate, CqrsError, EventEnvelope};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::pin::Pin;
use std::sync::Arc;

/// Ordered stream of committed events.
pub type EventStream<A> = Pin<Box<dyn Stream<Item = Result<EventEnvelope<A>, CqrsError>> + Send>>;

pub type DynJournal<A> = Arc<dyn EventJournal<A>>;

/// The tags a subscription is interested in. An event matches when it
/// carries at least one of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFilter(BTreeSet<String>);

impl TagFilter {
    #[must_use]
    pub fn new<I, T>(tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self(tags.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, tags: &BTreeSet<String>) -> bool {
        self.0.iter().any(|tag| tags.contains(tag))
    }
}

/// The storage contract the runtime consumes.
///
/// Implementations must preserve per-id append order on replay and on the
/// live feed, and must not lose an event once `append` returned `Ok`.
/// Duplicate delivery to subscribers is permitted; projections are idempotent
/// by event id. No ordering is required across aggregate ids.
#[async_trait::async_trait]
pub trait EventJournal<A>: Debug + Send + Sync
where
    A: Aggregate,
{
    /// Atomically appends events to one aggregate's log. Sequences must
    /// continue the existing log with no gaps, and event ids must be new;
    /// anything else is a broken invariant, not a storage failure.
    async fn append(
        &self,
        aggregate_id: &str,
        events: Vec<EventEnvelope<A>>,
    ) -> Result<(), CqrsError>;

    /// Replays one aggregate's log in append order.
    async fn load(&self, aggregate_id: &str) -> Result<EventStream<A>, CqrsError>;

    /// Feed of committed events, optionally narrowed by tag. Delivery is
    /// at-least-once and may start with a replay of the existing history.
    async fn subscribe(&self, filter: Option<TagFilter>) -> Result<EventStream<A>, CqrsError>;
}
