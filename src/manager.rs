//! Per-aggregate single-writer command execution.
//!
//! A registry maps each aggregate id to a worker task fed by a bounded
//! mailbox. Workers process messages strictly one at a time, pausing the
//! mailbox while a command's future is in flight, so commands for one id
//! complete in submission order while different ids proceed in parallel.
//! Workers are spawned lazily, rehydrate from the journal before serving,
//! and can be passivated at any time — state is a function of the log.

use crate::journal::DynJournal;
use crate::{
    Aggregate, AggregateInstance, Behavior, CommandEnvelope, CommandId, CqrsContext, CqrsError,
    EventEnvelope,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, Instrument};

const DEFAULT_MAILBOX_CAPACITY: usize = 128;

enum WorkerMessage<A>
where
    A: Aggregate,
{
    Execute {
        command_id: CommandId,
        command: A::Command,
        /// `None` for fire-and-forget submissions.
        reply: Option<oneshot::Sender<Result<Vec<EventEnvelope<A>>, CqrsError>>>,
    },
    State {
        reply: oneshot::Sender<Option<A>>,
    },
    Stop,
}

/// Routes commands to per-id workers and answers state queries.
pub struct AggregateManager<A>
where
    A: Aggregate,
{
    journal: DynJournal<A>,
    behavior: Arc<Behavior<A>>,
    context: CqrsContext,
    runtime: tokio::runtime::Handle,
    workers: Mutex<HashMap<A::Id, mpsc::Sender<WorkerMessage<A>>>>,
    mailbox_capacity: usize,
}

impl<A> AggregateManager<A>
where
    A: Aggregate,
{
    #[must_use]
    pub fn new(
        journal: DynJournal<A>,
        behavior: Arc<Behavior<A>>,
        context: CqrsContext,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            journal,
            behavior,
            context,
            runtime,
            workers: Mutex::new(HashMap::new()),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }

    #[must_use]
    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity.max(1);
        self
    }

    /// Fire-and-forget submission. The command is queued and attempted
    /// exactly once; rejections surface only in the log.
    pub async fn submit(
        &self,
        aggregate_id: A::Id,
        command: A::Command,
    ) -> Result<CommandId, CqrsError> {
        self.submit_envelope(CommandEnvelope::new(aggregate_id, command, &self.context))
            .await
    }

    /// As [`submit`](Self::submit), for an envelope carrying a
    /// client-generated command id.
    pub async fn submit_envelope(
        &self,
        envelope: CommandEnvelope<A>,
    ) -> Result<CommandId, CqrsError> {
        let command_id = envelope.command_id;
        self.send(
            &envelope.aggregate_id,
            WorkerMessage::Execute {
                command_id,
                command: envelope.command,
                reply: None,
            },
        )
        .await?;
        Ok(command_id)
    }

    /// Submits a command and waits for the committed events or the error.
    ///
    /// The timeout only unblocks the caller: once queued, the command is
    /// still attempted exactly once.
    pub async fn ask(
        &self,
        aggregate_id: A::Id,
        command: A::Command,
        timeout: Duration,
    ) -> Result<Vec<EventEnvelope<A>>, CqrsError> {
        self.ask_envelope(
            CommandEnvelope::new(aggregate_id, command, &self.context),
            timeout,
        )
        .await
    }

    /// As [`ask`](Self::ask), for an envelope whose command id the caller
    /// already knows — the projection-join path, which must register its
    /// monitor under that id before submitting.
    pub async fn ask_envelope(
        &self,
        envelope: CommandEnvelope<A>,
        timeout: Duration,
    ) -> Result<Vec<EventEnvelope<A>>, CqrsError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(
            &envelope.aggregate_id,
            WorkerMessage::Execute {
                command_id: envelope.command_id,
                command: envelope.command,
                reply: Some(reply_tx),
            },
        )
        .await?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CqrsError::internal("worker dropped the reply")),
            Err(_) => Err(CqrsError::Timeout(timeout)),
        }
    }

    /// Current state of the aggregate, rehydrating it if needed.
    pub async fn state(&self, aggregate_id: &A::Id) -> Result<A, CqrsError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(aggregate_id, WorkerMessage::State { reply: reply_tx })
            .await?;
        reply_rx
            .await
            .map_err(|_| CqrsError::internal("worker dropped the reply"))?
            .ok_or_else(|| CqrsError::NotFound(aggregate_id.to_string()))
    }

    pub async fn exists(&self, aggregate_id: &A::Id) -> Result<bool, CqrsError> {
        match self.state(aggregate_id).await {
            Ok(_) => Ok(true),
            Err(CqrsError::NotFound(_)) => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Drops the in-memory worker for one aggregate. Queued messages are
    /// still served first; the next contact replays the log from scratch.
    pub async fn passivate(&self, aggregate_id: &A::Id) {
        let worker = {
            let mut workers = self.workers.lock().unwrap();
            workers.remove(aggregate_id)
        };
        if let Some(worker) = worker {
            let _ = worker.send(WorkerMessage::Stop).await;
            debug!(aggregate_id = %aggregate_id, "worker passivated");
        }
    }

    /// Number of live workers, for eviction policies and tests.
    pub fn live_workers(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    async fn send(&self, aggregate_id: &A::Id, message: WorkerMessage<A>) -> Result<(), CqrsError> {
        let mut message = message;
        // A worker can die between lookup and send (passivation race or a
        // fatal invariant breach); one respawn retry covers it.
        for _ in 0..2 {
            let worker = self.worker(aggregate_id);
            match worker.send(message).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => message = returned,
            }
        }
        Err(CqrsError::internal(format!(
            "worker for aggregate '{}' is not accepting messages",
            aggregate_id
        )))
    }

    fn worker(&self, aggregate_id: &A::Id) -> mpsc::Sender<WorkerMessage<A>> {
        let mut workers = self.workers.lock().unwrap();
        if let Some(worker) = workers.get(aggregate_id) {
            if !worker.is_closed() {
                return worker.clone();
            }
            workers.remove(aggregate_id);
        }

        let (tx, rx) = mpsc::channel(self.mailbox_capacity);
        let span = tracing::info_span!(
            "aggregate_worker",
            aggregate = A::TYPE,
            aggregate_id = %aggregate_id,
        );
        self.runtime.spawn(
            run_worker(
                aggregate_id.clone(),
                self.behavior.clone(),
                self.journal.clone(),
                self.context.clone(),
                rx,
            )
            .instrument(span),
        );
        workers.insert(aggregate_id.clone(), tx.clone());
        debug!(aggregate_id = %aggregate_id, "worker spawned");
        tx
    }
}

impl<A: Aggregate> std::fmt::Debug for AggregateManager<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateManager")
            .field("aggregate", &A::TYPE)
            .field("live_workers", &self.live_workers())
            .finish()
    }
}

async fn run_worker<A>(
    aggregate_id: A::Id,
    behavior: Arc<Behavior<A>>,
    journal: DynJournal<A>,
    context: CqrsContext,
    mut mailbox: mpsc::Receiver<WorkerMessage<A>>,
) where
    A: Aggregate,
{
    let mut instance = AggregateInstance::new(aggregate_id.clone(), behavior);
    if let Err(rehydration_error) = rehydrate(&mut instance, &journal).await {
        error!(error = %rehydration_error, "rehydration failed, worker stopping");
        // Fail whatever is already queued instead of leaving callers hanging.
        mailbox.close();
        while let Ok(message) = mailbox.try_recv() {
            if let WorkerMessage::Execute {
                reply: Some(reply), ..
            } = message
            {
                let _ = reply.send(Err(rehydration_error.clone()));
            }
        }
        return;
    }
    info!(sequence = instance.sequence(), "worker ready");

    while let Some(message) = mailbox.recv().await {
        match message {
            WorkerMessage::Execute {
                command_id,
                command,
                reply,
            } => {
                let result = execute(&mut instance, &journal, &context, command_id, command).await;
                let fatal = matches!(&result, Err(error) if error.is_fatal());
                match (reply, result) {
                    (Some(reply), result) => {
                        let _ = reply.send(result);
                    }
                    (None, Err(error)) => {
                        // Rejections are ordinary outcomes; only real
                        // failures deserve an error trace.
                        if matches!(
                            error,
                            CqrsError::JournalFailure(_) | CqrsError::Internal(_)
                        ) {
                            error!(command_id = %command_id, error = %error, "submitted command failed");
                        } else {
                            debug!(command_id = %command_id, error = %error, "submitted command rejected");
                        }
                    }
                    (None, Ok(_)) => {}
                }
                if fatal {
                    error!("invariant breach, worker stopping");
                    return;
                }
            }
            WorkerMessage::State { reply } => {
                let _ = reply.send(instance.state().cloned());
            }
            WorkerMessage::Stop => return,
        }
    }
}

async fn rehydrate<A>(
    instance: &mut AggregateInstance<A>,
    journal: &DynJournal<A>,
) -> Result<(), CqrsError>
where
    A: Aggregate,
{
    let aggregate_id = instance.aggregate_id().to_string();
    let mut events = journal.load(&aggregate_id).await?;
    while let Some(event) = events.next().await {
        instance.apply(&event?)?;
    }
    Ok(())
}

async fn execute<A>(
    instance: &mut AggregateInstance<A>,
    journal: &DynJournal<A>,
    context: &CqrsContext,
    command_id: CommandId,
    command: A::Command,
) -> Result<Vec<EventEnvelope<A>>, CqrsError>
where
    A: Aggregate,
{
    // Rejections and invariant breaches surface here; state untouched.
    let events = instance.handle(command_id, command, context).await?;
    // Append failure: the command fails, state untouched.
    journal
        .append(&instance.aggregate_id().to_string(), events.clone())
        .await?;
    // Only acknowledged events fold into state.
    for envelope in &events {
        instance.apply(envelope)?;
    }
    Ok(events)
}
