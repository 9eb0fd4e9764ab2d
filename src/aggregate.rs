use crate::event::Event;
use crate::ids::{AggregateId, CommandId};
use crate::CqrsContext;
use std::fmt::Debug;

/// One aggregate kind: a consistency boundary whose state is the fold of its
/// event log.
///
/// The implementing type is the live state itself; it only exists once a
/// creation event has been applied. Commands and events are plain sum types,
/// and the creation/update distinction is a property of the behavior's
/// handler set, not of a type hierarchy.
pub trait Aggregate: Debug + Clone + Send + Sync + 'static {
    const TYPE: &'static str;

    type Id: AggregateId;
    type Command: Debug + Send + Sync + 'static;
    type Event: Event + 'static;
}

/// Routing envelope bundling the target id with the command, so the manager
/// never has to reflect into the payload to route it.
///
/// The command id is assigned here, before submission; event metadata such as
/// event ids and timestamps is attached only at emission time.
#[derive(Debug)]
pub struct CommandEnvelope<A: Aggregate> {
    pub aggregate_id: A::Id,
    pub command_id: CommandId,
    pub command: A::Command,
}

impl<A: Aggregate> CommandEnvelope<A> {
    #[must_use]
    pub fn new(aggregate_id: A::Id, command: A::Command, context: &CqrsContext) -> Self {
        Self {
            aggregate_id,
            command_id: context.next_command_id(),
            command,
        }
    }

    /// Keeps a client-generated command id instead of assigning one.
    #[must_use]
    pub fn with_command_id(aggregate_id: A::Id, command_id: CommandId, command: A::Command) -> Self {
        Self {
            aggregate_id,
            command_id,
            command,
        }
    }
}
