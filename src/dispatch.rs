//! Commands flowing through the scheduler and the worker-side handler that
//! turns them into transitions, broadcasts and replies.

use crate::bridge::BroadcastBridge;
use crate::delivery::{DeliveryHerald, MessageId, Promise};
use crate::leader::EventSink;
use crate::object::{ObjectId, ObjectState};
use crate::planner::{CommandHandler, CommandKind, CommandScheduler, Schedulable};
use crate::sns::{SnsControl, SnsKind, SnsOp, SnsProgress, TrackingSnsControl};
use crate::timeouts::DEFAULT_COMMAND_REPLY;
use crate::util::HaError;
use crate::workflow::{Executor, ObjectWorkflow};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub type Reply<T> = Sender<Result<T, HaError>>;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("no reply from the scheduler within {0:?}")]
    ReplyTimeout(Duration),
    #[error("scheduler is shut down")]
    SchedulerClosed,
}

pub enum HaCommand {
    /// Move objects to new states and broadcast them.
    BroadcastStates {
        states: Vec<(ObjectId, ObjectState)>,
        reply: Option<Reply<Vec<MessageId>>>,
    },
    ProcessEvent {
        process: ObjectId,
        state: ObjectState,
    },
    /// A process asks to join; the first request of a process must not be
    /// answered before its stale state is flushed from the engine.
    Entrypoint {
        process: ObjectId,
        first_request: bool,
        reply: Reply<()>,
    },
    /// Current persisted states of the given objects.
    NvecGet {
        objects: Vec<ObjectId>,
        reply: Reply<Vec<(ObjectId, ObjectState)>>,
    },
    SnsOperation {
        pool: ObjectId,
        op: SnsOp,
    },
    SnsStatus {
        pool: ObjectId,
        kind: SnsKind,
        reply: Reply<Vec<SnsProgress>>,
    },
}

impl Schedulable for HaCommand {
    fn kind(&self) -> CommandKind {
        match self {
            HaCommand::BroadcastStates { .. } => CommandKind::Broadcast,
            HaCommand::ProcessEvent { .. } => CommandKind::ProcessEvent,
            HaCommand::Entrypoint { .. } => CommandKind::Entrypoint,
            HaCommand::NvecGet { .. } => CommandKind::DeliveryWait,
            HaCommand::SnsOperation { .. } => CommandKind::SnsOperation,
            HaCommand::SnsStatus { .. } => CommandKind::Other,
        }
    }
}

pub struct Dispatcher {
    workflow: Arc<ObjectWorkflow>,
    executor: Arc<dyn Executor>,
    bridge: Arc<dyn BroadcastBridge>,
    herald: Arc<DeliveryHerald>,
    sns: Arc<dyn SnsControl>,
    delivery_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        workflow: Arc<ObjectWorkflow>,
        executor: Arc<dyn Executor>,
        bridge: Arc<dyn BroadcastBridge>,
        herald: Arc<DeliveryHerald>,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            workflow,
            executor,
            bridge,
            herald,
            sns: Arc::new(TrackingSnsControl::default()),
            delivery_timeout,
        }
    }

    pub fn with_sns_control(mut self, sns: Arc<dyn SnsControl>) -> Self {
        self.sns = sns;
        self
    }

    fn apply_states(&self, states: &[(ObjectId, ObjectState)]) -> Result<Vec<MessageId>, HaError> {
        let batch = self.workflow.transit_all(states)?;
        if batch.is_empty() {
            debug!("event=dispatch_nothing_to_do requests={}", states.len());
            return Ok(Vec::new());
        }
        Ok(self.executor.execute(&batch)?)
    }

    /// Broadcasts the process as failed and waits until the engine has seen it.
    fn flush_process(&self, process: ObjectId) -> Result<(), HaError> {
        let ids = self.bridge.broadcast(&[(process, ObjectState::Failed)])?;
        let mut promise = Promise::new(ids);
        self.herald.wait_for_all(&mut promise, self.delivery_timeout)?;
        debug!("event=entrypoint_flush_confirmed process={}", process);
        Ok(())
    }

    fn read_states(&self, objects: &[ObjectId]) -> Result<Vec<(ObjectId, ObjectState)>, HaError> {
        let ctx = self.workflow.context();
        objects
            .iter()
            .map(|object| Ok((*object, self.workflow.current_state(*object, &ctx)?)))
            .collect()
    }
}

fn respond<T>(reply: &Reply<T>, what: &str, result: Result<T, HaError>) {
    if let Err(err) = &result {
        warn!("event=dispatch_failed command={} error={}", what, err);
    }
    if reply.send(result).is_err() {
        debug!("event=dispatch_reply_dropped command={}", what);
    }
}

impl CommandHandler<HaCommand> for Dispatcher {
    fn handle(&self, command: &HaCommand) -> Result<(), HaError> {
        match command {
            HaCommand::BroadcastStates { states, reply } => {
                let result = self.apply_states(states);
                match reply {
                    Some(reply) => respond(reply, "broadcast_states", result),
                    None => {
                        result?;
                    }
                }
                Ok(())
            }
            HaCommand::ProcessEvent { process, state } => {
                self.apply_states(&[(*process, *state)])?;
                Ok(())
            }
            HaCommand::Entrypoint {
                process,
                first_request,
                reply,
            } => {
                let result = if *first_request {
                    self.flush_process(*process)
                } else {
                    Ok(())
                };
                respond(reply, "entrypoint", result);
                Ok(())
            }
            HaCommand::NvecGet { objects, reply } => {
                respond(reply, "nvec_get", self.read_states(objects));
                Ok(())
            }
            HaCommand::SnsOperation { pool, op } => self.sns.apply(*pool, *op),
            HaCommand::SnsStatus { pool, kind, reply } => {
                respond(reply, "sns_status", self.sns.status(*pool, *kind));
                Ok(())
            }
        }
    }
}

/// Turns event-queue messages into scheduled commands. State changes
/// block until the engine has confirmed at least one of the broadcasts, so
/// the queue only drops a message once it took effect.
pub struct SchedulerSink {
    scheduler: Arc<CommandScheduler<HaCommand>>,
    herald: Arc<DeliveryHerald>,
    delivery_timeout: Duration,
    reply_timeout: Duration,
}

impl SchedulerSink {
    pub fn new(
        scheduler: Arc<CommandScheduler<HaCommand>>,
        herald: Arc<DeliveryHerald>,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            scheduler,
            herald,
            delivery_timeout,
            reply_timeout: DEFAULT_COMMAND_REPLY,
        }
    }

    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    fn submit(&self, command: HaCommand) -> Result<u64, SinkError> {
        if self.scheduler.is_shutdown() {
            return Err(SinkError::SchedulerClosed);
        }
        Ok(self.scheduler.submit(command).group)
    }
}

impl EventSink for SchedulerSink {
    fn process_state(&self, process: ObjectId, state: ObjectState) -> Result<(), HaError> {
        let group = self.submit(HaCommand::ProcessEvent { process, state })?;
        debug!(
            "event=eq_process_state process={} state={} group={}",
            process, state, group
        );
        Ok(())
    }

    fn set_states(&self, states: Vec<(ObjectId, ObjectState)>) -> Result<(), HaError> {
        let requested = states.len();
        let (tx, rx) = channel::bounded(1);
        let group = self.submit(HaCommand::BroadcastStates {
            states,
            reply: Some(tx),
        })?;
        let ids = match rx.recv_timeout(self.reply_timeout) {
            Ok(result) => result?,
            Err(RecvTimeoutError::Timeout) => {
                return Err(SinkError::ReplyTimeout(self.reply_timeout).into())
            }
            Err(RecvTimeoutError::Disconnected) => return Err(SinkError::SchedulerClosed.into()),
        };
        let broadcasts = ids.len();
        let confirmed = self
            .herald
            .wait_for_any(&mut Promise::new(ids), self.delivery_timeout)?;
        debug!(
            "event=eq_states_confirmed requested={} broadcasts={} confirmed={} group={}",
            requested,
            broadcasts,
            confirmed.len(),
            group
        );
        Ok(())
    }

    fn sns_operation(&self, pool: ObjectId, op: SnsOp) -> Result<(), HaError> {
        let group = self.submit(HaCommand::SnsOperation { pool, op })?;
        debug!(
            "event=eq_sns_operation pool={} op={} group={}",
            pool, op, group
        );
        Ok(())
    }
}
