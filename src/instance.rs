use crate::{Aggregate, Behavior, CommandId, CqrsContext, CqrsError, EventEnvelope};
use std::sync::Arc;
use tracing::debug;

/// One rehydrated aggregate: its folded state and the last applied sequence.
///
/// Owned exclusively by the worker driving it; nothing else mutates it. The
/// state is `None` while the aggregate is absent and becomes `Some` with the
/// first applied creation event.
pub struct AggregateInstance<A>
where
    A: Aggregate,
{
    behavior: Arc<Behavior<A>>,
    aggregate_id: A::Id,
    state: Option<A>,
    sequence: u64,
}

impl<A> AggregateInstance<A>
where
    A: Aggregate,
{
    #[must_use]
    pub fn new(aggregate_id: A::Id, behavior: Arc<Behavior<A>>) -> Self {
        Self {
            behavior,
            aggregate_id,
            state: None,
            sequence: 0,
        }
    }

    pub fn aggregate_id(&self) -> &A::Id {
        &self.aggregate_id
    }

    pub fn state(&self) -> Option<&A> {
        self.state.as_ref()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Folds one committed event into the state.
    ///
    /// The sequence must follow the last applied one exactly; anything else
    /// is a broken invariant and kills the calling worker.
    pub fn apply(&mut self, envelope: &EventEnvelope<A>) -> Result<(), CqrsError> {
        if envelope.sequence != self.sequence + 1 {
            return Err(CqrsError::internal(format!(
                "non-monotonic sequence for aggregate '{}': expected {}, got {}",
                self.aggregate_id,
                self.sequence + 1,
                envelope.sequence
            )));
        }
        self.state = match self.state.take() {
            None => self.behavior.apply_creation(envelope.payload.clone()),
            Some(state) => Some(self.behavior.apply_update(state, envelope.payload.clone())),
        };
        self.sequence = envelope.sequence;
        Ok(())
    }

    /// Runs the behavior for one command, selecting construction vs update on
    /// the current state, and stamps metadata onto the produced events.
    ///
    /// No state changes here; events fold in only after the journal has
    /// acknowledged them.
    pub async fn handle(
        &self,
        command_id: CommandId,
        command: A::Command,
        context: &CqrsContext,
    ) -> Result<Vec<EventEnvelope<A>>, CqrsError> {
        let aggregate_id = self.aggregate_id.to_string();
        let effect = match &self.state {
            None => self
                .behavior
                .handle_construction(&aggregate_id, command, context),
            Some(state) => self
                .behavior
                .handle_update(&aggregate_id, state, command, context),
        };
        let events = effect.resolve().await?;
        if events.is_empty() {
            // Rejection is the only zero-event outcome; an accepted command
            // that emits nothing is a behavior authoring bug.
            return Err(CqrsError::internal(format!(
                "command {} for aggregate '{}' was accepted but produced no events",
                command_id, aggregate_id
            )));
        }
        debug!(
            aggregate_id = %aggregate_id,
            command_id = %command_id,
            event_count = events.len(),
            "command accepted"
        );

        Ok(events
            .into_iter()
            .enumerate()
            .map(|(i, payload)| EventEnvelope {
                event_id: context.next_event_id(),
                aggregate_id: aggregate_id.clone(),
                command_id,
                sequence: self.sequence + i as u64 + 1,
                payload,
                tags: self.behavior.tags().clone(),
                at: context.now(),
            })
            .collect())
    }
}
