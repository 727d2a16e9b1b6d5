use super::action::Action;
use super::context::{TransitionContext, PARENT_KEY, PARENT_ONE_SHOT, PARENT_PROCESS};
use super::{ObjectWorkflow, WorkflowError};
use crate::object::{ObjectId, ObjectKind, ObjectState, PersistedRecord};
use log::debug;
use std::collections::HashMap;

const ROLE_FIELD: &str = "role";
const CLIENT_ROLE: &str = "client";
const ONE_SHOT_FIELD: &str = "one_shot";

/// One requested state change of one object, with its current record.
#[derive(Debug, Clone)]
pub struct Transition {
    pub object: ObjectId,
    pub kind: ObjectKind,
    pub store_key: String,
    pub record: PersistedRecord,
    pub from: ObjectState,
    pub to: ObjectState,
}

impl Transition {
    /// `SetState` followed by `Broadcast` for this object.
    fn own_actions(&self) -> Vec<Action> {
        vec![
            Action::SetState {
                object: self.object,
                store_key: self.store_key.clone(),
                new_state: self.to,
                serialized_value: self.record.with_state(self.to).to_json(),
            },
            Action::Broadcast {
                object: self.object,
                new_state: self.to,
            },
        ]
    }
}

pub(crate) type Handler =
    fn(&ObjectWorkflow, &Transition, &TransitionContext) -> Result<Vec<Action>, WorkflowError>;

pub(crate) type TransitionTable = HashMap<(ObjectState, ObjectState), Handler>;

/// How a kind moves between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Strategy {
    Process,
    Service,
    Leaf,
}

impl Strategy {
    pub(crate) fn for_kind(kind: ObjectKind) -> Self {
        match kind {
            ObjectKind::Process => Strategy::Process,
            ObjectKind::Service => Strategy::Service,
            ObjectKind::Sdev
            | ObjectKind::Drive
            | ObjectKind::Node
            | ObjectKind::Enclosure
            | ObjectKind::Controller => Strategy::Leaf,
        }
    }

    pub(crate) fn table(self) -> TransitionTable {
        use ObjectState::*;
        match self {
            Strategy::Process => table_of(&[
                (Transient, Recovering, set_and_broadcast),
                (Transient, Failed, set_and_broadcast),
                (Failed, Recovering, set_and_broadcast),
                (Recovering, Online, process_cascade),
                (Recovering, Transient, process_cascade),
                (Online, Transient, process_cascade),
            ]),
            Strategy::Service => table_of(&[
                (Transient, Online, service_cascade),
                (Online, Transient, service_cascade),
                (Transient, Failed, service_cascade),
                (Failed, Online, service_cascade),
            ]),
            Strategy::Leaf => table_of(&[
                (Transient, Online, set_and_broadcast),
                (Online, Transient, leaf_stopped),
                (Transient, Failed, set_and_broadcast),
                (Failed, Online, set_and_broadcast),
                (Online, Failed, set_and_broadcast),
                (Failed, Repair, set_and_broadcast),
                (Repair, Repaired, set_and_broadcast),
                (Repaired, Rebalance, set_and_broadcast),
                (Rebalance, Online, set_and_broadcast),
            ]),
        }
    }
}

fn table_of(entries: &[(ObjectState, ObjectState, Handler)]) -> TransitionTable {
    entries
        .iter()
        .map(|(from, to, handler)| ((*from, *to), *handler))
        .collect()
}

fn set_and_broadcast(
    _workflow: &ObjectWorkflow,
    transition: &Transition,
    _ctx: &TransitionContext,
) -> Result<Vec<Action>, WorkflowError> {
    Ok(transition.own_actions())
}

/// Clients and the HA process itself carry no nested objects worth moving.
fn nested_objects_needed(workflow: &ObjectWorkflow, transition: &Transition) -> bool {
    transition.record.text(ROLE_FIELD) != Some(CLIENT_ROLE)
        && !workflow.topology().is_ha_process(transition.object)
}

fn cascade(
    workflow: &ObjectWorkflow,
    transition: &Transition,
    ctx: &TransitionContext,
) -> Result<Vec<Action>, WorkflowError> {
    let mut actions = transition.own_actions();
    let children =
        workflow
            .topology()
            .children(transition.object, &transition.store_key, ctx.cache())?;
    debug!(
        "event=workflow_cascade object={} to={} children={}",
        transition.object,
        transition.to,
        children.len()
    );
    for child in children {
        actions.extend(workflow.transit_in(child, transition.to, ctx)?);
    }
    Ok(actions)
}

fn process_cascade(
    workflow: &ObjectWorkflow,
    transition: &Transition,
    ctx: &TransitionContext,
) -> Result<Vec<Action>, WorkflowError> {
    if !nested_objects_needed(workflow, transition) {
        return Ok(transition.own_actions());
    }
    let nested = ctx
        .put(PARENT_PROCESS, transition.object)
        .put(PARENT_KEY, transition.store_key.as_str())
        .put(PARENT_ONE_SHOT, transition.record.flag(ONE_SHOT_FIELD));
    cascade(workflow, transition, &nested)
}

fn service_cascade(
    workflow: &ObjectWorkflow,
    transition: &Transition,
    ctx: &TransitionContext,
) -> Result<Vec<Action>, WorkflowError> {
    let nested = ctx.put(PARENT_KEY, transition.store_key.as_str());
    cascade(workflow, transition, &nested)
}

/// A one-shot initializer finishing must not take its drives offline.
fn leaf_stopped(
    _workflow: &ObjectWorkflow,
    transition: &Transition,
    ctx: &TransitionContext,
) -> Result<Vec<Action>, WorkflowError> {
    if transition.kind.is_storage_device() && ctx.flag(PARENT_ONE_SHOT)? {
        debug!(
            "event=workflow_one_shot_skip object={} process={:?}",
            transition.object,
            ctx.object(PARENT_PROCESS)?
        );
        return Ok(Vec::new());
    }
    Ok(transition.own_actions())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_a_table() {
        for kind in ObjectKind::ALL {
            assert!(!Strategy::for_kind(kind).table().is_empty());
        }
    }

    #[test]
    fn no_table_models_self_transitions() {
        for strategy in [Strategy::Process, Strategy::Service, Strategy::Leaf] {
            let table = strategy.table();
            assert!(table.keys().all(|(from, to)| from != to));
        }
    }
}
