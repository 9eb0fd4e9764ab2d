use crate::ids::{CommandId, EventId};
use crate::Aggregate;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Debug;

/// An immutable domain fact. Events round-trip losslessly through serde,
/// metadata included.
pub trait Event: Debug + Serialize + DeserializeOwned + Clone + PartialEq + Sync + Send {
    fn event_type(&self) -> String;
}

/// A committed event with the metadata attached at emission time.
///
/// Sequence numbers are per-aggregate, starting at 1 with no gaps; event ids
/// are unique across the whole system. `command_id` names the command that
/// produced the event, which is what projection joins correlate on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(bound(serialize = "A: Aggregate", deserialize = "A: Aggregate"))]
pub struct EventEnvelope<A>
where
    A: Aggregate,
{
    #[serde(rename = "_id")]
    pub event_id: EventId,
    /// Textual form of the id of the aggregate instance.
    pub aggregate_id: String,
    /// The command this event answers.
    pub command_id: CommandId,
    /// Position in the aggregate's log.
    pub sequence: u64,
    /// Event payload.
    pub payload: A::Event,
    /// Subscription tags, stamped from the behavior.
    pub tags: BTreeSet<String>,
    /// The time when the event was committed.
    pub at: DateTime<Utc>,
}
