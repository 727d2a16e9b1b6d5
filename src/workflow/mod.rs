//! State transition engine.
//!
//! [`ObjectWorkflow`] validates a requested `(object, target state)` change
//! against the transition table of the object's kind and produces the
//! [`Action`]s that realise it, cascading into contained objects where the
//! table says so. Nothing is written here; the actions are handed to an
//! [`Executor`].

mod action;
mod context;
mod executor;
mod topology;
mod transition;

pub use action::{Action, ActionBatch};
pub use context::{ContextValue, TransitionContext, PARENT_KEY, PARENT_ONE_SHOT, PARENT_PROCESS};
pub use executor::{Executor, ExecutorError, ExecutorLimits, Pager, StoreExecutor};
pub use topology::{KvTopology, Topology, CONF_ROOT};
pub use transition::Transition;

use crate::kv::{KvStore, ReadCache, StoreError};
use crate::object::{ObjectId, ObjectKind, ObjectState, PersistedRecord};
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use transition::{Strategy, TransitionTable};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{kind} {object}: transition {from} -> {to} is not allowed")]
    TransitionNotAllowed {
        object: ObjectId,
        kind: ObjectKind,
        from: ObjectState,
        to: ObjectState,
    },
    #[error("business logic error: {0}")]
    BusinessLogic(String),
    #[error("unsupported object {0}")]
    UnsupportedObject(ObjectId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ObjectWorkflow {
    store: Arc<dyn KvStore>,
    topology: Arc<dyn Topology>,
    tables: HashMap<ObjectKind, TransitionTable>,
}

impl ObjectWorkflow {
    pub fn new(store: Arc<dyn KvStore>, topology: Arc<dyn Topology>) -> Self {
        let tables = ObjectKind::ALL
            .into_iter()
            .map(|kind| (kind, Strategy::for_kind(kind).table()))
            .collect();
        Self {
            store,
            topology,
            tables,
        }
    }

    pub fn topology(&self) -> &dyn Topology {
        self.topology.as_ref()
    }

    /// Fresh root context with its own read cache.
    pub fn context(&self) -> TransitionContext {
        TransitionContext::new(Arc::new(ReadCache::new(self.store.clone())))
    }

    pub fn transit(&self, object: ObjectId, target: ObjectState) -> Result<ActionBatch, WorkflowError> {
        let actions = self.transit_in(object, target, &self.context())?;
        Ok(ActionBatch::from_actions(actions))
    }

    /// All pairs share one read cache; the first failure aborts the batch.
    pub fn transit_all(
        &self,
        requests: &[(ObjectId, ObjectState)],
    ) -> Result<ActionBatch, WorkflowError> {
        let ctx = self.context();
        let mut batch = ActionBatch::default();
        for (object, target) in requests {
            batch.extend(self.transit_in(*object, *target, &ctx)?);
        }
        Ok(batch)
    }

    /// Actions moving `object` to `target`, in emission order.
    pub fn transit_in(
        &self,
        object: ObjectId,
        target: ObjectState,
        ctx: &TransitionContext,
    ) -> Result<Vec<Action>, WorkflowError> {
        let kind = object
            .kind()
            .map_err(|_| WorkflowError::UnsupportedObject(object))?;
        let table = self
            .tables
            .get(&kind)
            .ok_or(WorkflowError::UnsupportedObject(object))?;
        let transition = self.load(object, kind, target, ctx)?;
        if transition.from == target {
            debug!("event=workflow_noop object={} state={}", object, target);
            return Ok(Vec::new());
        }
        let handler = table.get(&(transition.from, target)).ok_or(
            WorkflowError::TransitionNotAllowed {
                object,
                kind,
                from: transition.from,
                to: target,
            },
        )?;
        debug!(
            "event=workflow_transit kind={} object={} from={} to={}",
            kind, object, transition.from, target
        );
        handler(self, &transition, ctx)
    }

    /// Persisted state of `object`, read through `ctx`'s cache.
    pub fn current_state(
        &self,
        object: ObjectId,
        ctx: &TransitionContext,
    ) -> Result<ObjectState, WorkflowError> {
        let kind = object
            .kind()
            .map_err(|_| WorkflowError::UnsupportedObject(object))?;
        Ok(self.load(object, kind, ObjectState::Unknown, ctx)?.from)
    }

    fn load(
        &self,
        object: ObjectId,
        kind: ObjectKind,
        target: ObjectState,
        ctx: &TransitionContext,
    ) -> Result<Transition, WorkflowError> {
        let store_key = self
            .topology
            .record_key(object, ctx.cache())?
            .ok_or_else(|| WorkflowError::BusinessLogic(format!("{kind} {object} has no record")))?;
        let entry = ctx.cache().get(&store_key)?.ok_or_else(|| {
            WorkflowError::BusinessLogic(format!("{kind} {object}: record {store_key} vanished"))
        })?;
        let record = PersistedRecord::parse(&entry.value).map_err(|err| {
            WorkflowError::BusinessLogic(format!("{kind} {object}: record {store_key}: {err}"))
        })?;
        let from = record
            .state()
            .map_err(|err| WorkflowError::BusinessLogic(format!("{kind} {object}: {err}")))?;
        Ok(Transition {
            object,
            kind,
            store_key,
            record,
            from,
            to: target,
        })
    }
}
