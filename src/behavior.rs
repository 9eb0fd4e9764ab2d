//! Behavior specification DSL.
//!
//! A [`Behavior`] is assembled in two named phases — **construction** (how
//! commands create the aggregate) and **update** (how it evolves) — each
//! declaring ordered clause lists for command handling and event folding.
//! Clauses are scanned in declaration order and the first match wins, so
//! dispatch is deterministic across runs. The builder carries phantom
//! type-state markers: `build()` only exists once both phases have been
//! declared, which makes routing a command through an unfinished behavior
//! unrepresentable.

use crate::{Aggregate, CqrsContext, CqrsError};
use futures::future::BoxFuture;
use std::collections::BTreeSet;
use std::fmt::{self, Debug};
use std::marker::PhantomData;

/// What a command clause decided.
///
/// Every accepting variant normalises to a future resolving to an event
/// sequence; `Reject` short-circuits with no events and no state change.
/// Constructors are explicit at the call site, there are no conversions.
pub enum CommandEffect<E> {
    One(E),
    Many(Vec<E>),
    Async(BoxFuture<'static, Result<Vec<E>, CqrsError>>),
    Reject(CqrsError),
}

impl<E: Send + 'static> CommandEffect<E> {
    /// Shorthand for `Reject` with a plain rejection reason.
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject(CqrsError::rejected(reason))
    }

    pub(crate) async fn resolve(self) -> Result<Vec<E>, CqrsError> {
        match self {
            Self::One(event) => Ok(vec![event]),
            Self::Many(events) => Ok(events),
            Self::Async(events) => events.await,
            Self::Reject(error) => Err(error),
        }
    }
}

impl<E: Debug> Debug for CommandEffect<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::One(event) => f.debug_tuple("One").field(event).finish(),
            Self::Many(events) => f.debug_tuple("Many").field(events).finish(),
            Self::Async(_) => f.write_str("Async(..)"),
            Self::Reject(error) => f.debug_tuple("Reject").field(error).finish(),
        }
    }
}

/// Type-state marker: the phase has not been declared yet.
pub struct Pending;
/// Type-state marker: the phase has been declared.
pub struct Defined;

struct CreationCommandClause<A: Aggregate> {
    applies: Box<dyn Fn(&A::Command) -> bool + Send + Sync>,
    handle: Box<dyn Fn(A::Command, &CqrsContext) -> CommandEffect<A::Event> + Send + Sync>,
}

struct CreationEventClause<A: Aggregate> {
    applies: Box<dyn Fn(&A::Event) -> bool + Send + Sync>,
    apply: Box<dyn Fn(A::Event) -> A + Send + Sync>,
}

struct UpdateCommandClause<A: Aggregate> {
    applies: Box<dyn Fn(&A, &A::Command) -> bool + Send + Sync>,
    handle: Box<dyn Fn(&A, A::Command, &CqrsContext) -> CommandEffect<A::Event> + Send + Sync>,
}

struct UpdateEventClause<A: Aggregate> {
    applies: Box<dyn Fn(&A, &A::Event) -> bool + Send + Sync>,
    apply: Box<dyn Fn(A, A::Event) -> A + Send + Sync>,
}

/// Collects the construction-phase clauses: which commands create the
/// aggregate and how the creation event becomes the first state.
pub struct ConstructionPhase<A: Aggregate> {
    commands: Vec<CreationCommandClause<A>>,
    events: Vec<CreationEventClause<A>>,
}

impl<A: Aggregate> ConstructionPhase<A> {
    fn new() -> Self {
        Self {
            commands: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Adds a command clause; `handle` runs when `applies` matches and no
    /// earlier clause did.
    pub fn command<P, H>(&mut self, applies: P, handle: H) -> &mut Self
    where
        P: Fn(&A::Command) -> bool + Send + Sync + 'static,
        H: Fn(A::Command, &CqrsContext) -> CommandEffect<A::Event> + Send + Sync + 'static,
    {
        self.commands.push(CreationCommandClause {
            applies: Box::new(applies),
            handle: Box::new(handle),
        });
        self
    }

    /// Adds an event clause mapping a creation event to the initial state.
    pub fn event<P, F>(&mut self, applies: P, apply: F) -> &mut Self
    where
        P: Fn(&A::Event) -> bool + Send + Sync + 'static,
        F: Fn(A::Event) -> A + Send + Sync + 'static,
    {
        self.events.push(CreationEventClause {
            applies: Box::new(applies),
            apply: Box::new(apply),
        });
        self
    }
}

/// Collects the update-phase clauses: how commands evolve a live aggregate
/// and how its events mutate state.
pub struct UpdatePhase<A: Aggregate> {
    commands: Vec<UpdateCommandClause<A>>,
    events: Vec<UpdateEventClause<A>>,
}

impl<A: Aggregate> UpdatePhase<A> {
    fn new() -> Self {
        Self {
            commands: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn command<P, H>(&mut self, applies: P, handle: H) -> &mut Self
    where
        P: Fn(&A, &A::Command) -> bool + Send + Sync + 'static,
        H: Fn(&A, A::Command, &CqrsContext) -> CommandEffect<A::Event> + Send + Sync + 'static,
    {
        self.commands.push(UpdateCommandClause {
            applies: Box::new(applies),
            handle: Box::new(handle),
        });
        self
    }

    pub fn event<P, F>(&mut self, applies: P, apply: F) -> &mut Self
    where
        P: Fn(&A, &A::Event) -> bool + Send + Sync + 'static,
        F: Fn(A, A::Event) -> A + Send + Sync + 'static,
    {
        self.events.push(UpdateEventClause {
            applies: Box::new(applies),
            apply: Box::new(apply),
        });
        self
    }
}

/// Builder for [`Behavior`], threaded through [`when_constructing`] and
/// [`when_updating`]. The phantom parameters track which phases have been
/// declared; `build` is only available on the fully declared builder.
///
/// [`when_constructing`]: BehaviorBuilder::when_constructing
/// [`when_updating`]: BehaviorBuilder::when_updating
pub struct BehaviorBuilder<A: Aggregate, Construction = Pending, Update = Pending> {
    construction: ConstructionPhase<A>,
    update: UpdatePhase<A>,
    tags: BTreeSet<String>,
    _phases: PhantomData<(Construction, Update)>,
}

impl<A: Aggregate, C, U> BehaviorBuilder<A, C, U> {
    fn transition<C2, U2>(self) -> BehaviorBuilder<A, C2, U2> {
        BehaviorBuilder {
            construction: self.construction,
            update: self.update,
            tags: self.tags,
            _phases: PhantomData,
        }
    }

    /// Adds a tag stamped into the metadata of every emitted event, in
    /// addition to the aggregate type tag.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

impl<A: Aggregate, U> BehaviorBuilder<A, Pending, U> {
    /// Declares the construction phase. Required before `build`.
    #[must_use]
    pub fn when_constructing(
        mut self,
        declare: impl FnOnce(&mut ConstructionPhase<A>),
    ) -> BehaviorBuilder<A, Defined, U> {
        declare(&mut self.construction);
        self.transition()
    }
}

impl<A: Aggregate, C> BehaviorBuilder<A, C, Pending> {
    /// Declares the update phase. Required before `build`.
    #[must_use]
    pub fn when_updating(
        mut self,
        declare: impl FnOnce(&mut UpdatePhase<A>),
    ) -> BehaviorBuilder<A, C, Defined> {
        declare(&mut self.update);
        self.transition()
    }
}

impl<A: Aggregate> BehaviorBuilder<A, Defined, Defined> {
    /// Finalises the behavior. Only callable once both phases are declared.
    #[must_use]
    pub fn build(self) -> Behavior<A> {
        Behavior {
            construction: self.construction,
            update: self.update,
            tags: self.tags,
        }
    }
}

/// The complete handler set for one aggregate kind.
pub struct Behavior<A: Aggregate> {
    construction: ConstructionPhase<A>,
    update: UpdatePhase<A>,
    tags: BTreeSet<String>,
}

impl<A: Aggregate> Behavior<A> {
    #[must_use]
    pub fn builder() -> BehaviorBuilder<A, Pending, Pending> {
        let mut tags = BTreeSet::new();
        tags.insert(A::TYPE.to_string());
        BehaviorBuilder {
            construction: ConstructionPhase::new(),
            update: UpdatePhase::new(),
            tags,
            _phases: PhantomData,
        }
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Runs the first matching construction command clause. No match rejects
    /// the command as invalid.
    pub(crate) fn handle_construction(
        &self,
        aggregate_id: &str,
        command: A::Command,
        context: &CqrsContext,
    ) -> CommandEffect<A::Event> {
        for clause in &self.construction.commands {
            if (clause.applies)(&command) {
                return (clause.handle)(command, context);
            }
        }
        CommandEffect::Reject(CqrsError::invalid_command(
            &command,
            Some(aggregate_id.to_string()),
        ))
    }

    /// Runs the first matching update command clause against the live state.
    pub(crate) fn handle_update(
        &self,
        aggregate_id: &str,
        state: &A,
        command: A::Command,
        context: &CqrsContext,
    ) -> CommandEffect<A::Event> {
        for clause in &self.update.commands {
            if (clause.applies)(state, &command) {
                return (clause.handle)(state, command, context);
            }
        }
        CommandEffect::Reject(CqrsError::invalid_command(
            &command,
            Some(aggregate_id.to_string()),
        ))
    }

    /// Maps a creation event to the initial state. Events are facts: an event
    /// no clause knows leaves the aggregate absent instead of failing replay.
    pub(crate) fn apply_creation(&self, event: A::Event) -> Option<A> {
        for clause in &self.construction.events {
            if (clause.applies)(&event) {
                return Some((clause.apply)(event));
            }
        }
        None
    }

    /// Folds one update event into the state. An event no clause knows leaves
    /// the state unchanged.
    pub(crate) fn apply_update(&self, state: A, event: A::Event) -> A {
        for clause in &self.update.events {
            if (clause.applies)(&state, &event) {
                return (clause.apply)(state, event);
            }
        }
        state
    }
}

impl<A: Aggregate> Debug for Behavior<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Behavior")
            .field("aggregate", &A::TYPE)
            .field("construction_commands", &self.construction.commands.len())
            .field("construction_events", &self.construction.events.len())
            .field("update_commands", &self.update.commands.len())
            .field("update_events", &self.update.events.len())
            .field("tags", &self.tags)
            .finish()
    }
}
