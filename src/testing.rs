//! Shared fixtures for the unit tests: a small counter aggregate, helper
//! constructors for committed envelopes, and controllable journal/projection
//! doubles.

use crate::journal::{EventJournal, EventStream, TagFilter};
use crate::projection::Projection;
use crate::{Aggregate, Behavior, CommandEffect, CqrsContext, CqrsError, Event, EventEnvelope};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum CounterCommand {
    Create { name: String },
    Increment,
    Decrement,
    SlowIncrement { delay: Duration },
    /// Accepted without emitting anything; exercises the broken-handler path.
    Noop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CounterEvent {
    Created { name: String },
    Incremented,
    Decremented,
}

impl Event for CounterEvent {
    fn event_type(&self) -> String {
        match self {
            CounterEvent::Created { .. } => "Created".to_string(),
            CounterEvent::Incremented => "Incremented".to_string(),
            CounterEvent::Decremented => "Decremented".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Counter {
    pub name: String,
    pub value: i64,
}

impl Aggregate for Counter {
    const TYPE: &'static str = "counter";

    type Id = String;
    type Command = CounterCommand;
    type Event = CounterEvent;
}

/// The counter behavior: created with a name, incremented freely, never
/// decremented below zero.
pub fn counter_behavior() -> Behavior<Counter> {
    Behavior::<Counter>::builder()
        .when_constructing(|create| {
            create
                .command(
                    |cmd| matches!(cmd, CounterCommand::Create { .. }),
                    |cmd, _| match cmd {
                        CounterCommand::Create { name } => {
                            CommandEffect::One(CounterEvent::Created { name })
                        }
                        _ => unreachable!(),
                    },
                )
                .event(
                    |evt| matches!(evt, CounterEvent::Created { .. }),
                    |evt| match evt {
                        CounterEvent::Created { name } => Counter { name, value: 0 },
                        _ => unreachable!(),
                    },
                );
        })
        .when_updating(|update| {
            update
                .command(
                    |_, cmd| matches!(cmd, CounterCommand::Increment),
                    |_, _, _| CommandEffect::One(CounterEvent::Incremented),
                )
                .command(
                    |_, cmd| matches!(cmd, CounterCommand::SlowIncrement { .. }),
                    |_, cmd, _| match cmd {
                        CounterCommand::SlowIncrement { delay } => {
                            CommandEffect::Async(Box::pin(async move {
                                tokio::time::sleep(delay).await;
                                Ok(vec![CounterEvent::Incremented])
                            }))
                        }
                        _ => unreachable!(),
                    },
                )
                .command(
                    |state, cmd| matches!(cmd, CounterCommand::Decrement) && state.value == 0,
                    |_, _, _| CommandEffect::reject("Counter is already at zero"),
                )
                .command(
                    |_, cmd| matches!(cmd, CounterCommand::Decrement),
                    |_, _, _| CommandEffect::One(CounterEvent::Decremented),
                )
                .command(
                    |_, cmd| matches!(cmd, CounterCommand::Noop),
                    |_, _, _| CommandEffect::Many(Vec::new()),
                )
                .event(
                    |_, evt| matches!(evt, CounterEvent::Incremented),
                    |mut state, _| {
                        state.value += 1;
                        state
                    },
                )
                .event(
                    |_, evt| matches!(evt, CounterEvent::Decremented),
                    |mut state, _| {
                        state.value -= 1;
                        state
                    },
                );
        })
        .build()
}

/// Builds a committed envelope the way the instance would stamp it.
pub fn committed(
    aggregate_id: &str,
    sequence: u64,
    payload: CounterEvent,
    context: &CqrsContext,
) -> EventEnvelope<Counter> {
    EventEnvelope {
        event_id: context.next_event_id(),
        aggregate_id: aggregate_id.to_string(),
        command_id: context.next_command_id(),
        sequence,
        payload,
        tags: BTreeSet::from([Counter::TYPE.to_string()]),
        at: context.now(),
    }
}

/// Journal double whose appends can be switched to fail, for storage-failure
/// paths.
#[derive(Debug, Default)]
pub struct FlakyJournal {
    delegate: crate::journal::InMemoryJournal<Counter>,
    failing: AtomicBool,
}

impl FlakyJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_appends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl EventJournal<Counter> for FlakyJournal {
    async fn append(
        &self,
        aggregate_id: &str,
        events: Vec<EventEnvelope<Counter>>,
    ) -> Result<(), CqrsError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CqrsError::journal("storage unavailable"));
        }
        self.delegate.append(aggregate_id, events).await
    }

    async fn load(&self, aggregate_id: &str) -> Result<EventStream<Counter>, CqrsError> {
        self.delegate.load(aggregate_id).await
    }

    async fn subscribe(&self, filter: Option<TagFilter>) -> Result<EventStream<Counter>, CqrsError> {
        self.delegate.subscribe(filter).await
    }
}

/// Projection double that records what it applied and can fail its first
/// `n` handler calls.
pub struct RecordingProjection {
    name: String,
    seen: Arc<Mutex<Vec<EventEnvelope<Counter>>>>,
    failures_left: AtomicU32,
}

impl RecordingProjection {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            seen: Arc::new(Mutex::new(Vec::new())),
            failures_left: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn failing_first(self, failures: u32) -> Self {
        self.failures_left.store(failures, Ordering::SeqCst);
        self
    }

    pub fn seen(&self) -> Arc<Mutex<Vec<EventEnvelope<Counter>>>> {
        self.seen.clone()
    }
}

#[async_trait::async_trait]
impl Projection<Counter> for RecordingProjection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &EventEnvelope<Counter>) -> Result<(), CqrsError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok()
        {
            return Err(CqrsError::journal("view store unavailable"));
        }
        self.seen.lock().unwrap().push(event.clone());
        Ok(())
    }
}
