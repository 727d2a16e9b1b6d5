use crate::object::{ObjectId, ObjectState};

/// Side effect of a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Persist `serialized_value` under `store_key`.
    SetState {
        object: ObjectId,
        store_key: String,
        new_state: ObjectState,
        serialized_value: String,
    },
    /// Tell the storage engine about the new state.
    Broadcast {
        object: ObjectId,
        new_state: ObjectState,
    },
}

impl Action {
    pub fn object(&self) -> ObjectId {
        match self {
            Action::SetState { object, .. } | Action::Broadcast { object, .. } => *object,
        }
    }

    pub fn new_state(&self) -> ObjectState {
        match self {
            Action::SetState { new_state, .. } | Action::Broadcast { new_state, .. } => *new_state,
        }
    }

    pub fn is_kv(&self) -> bool {
        matches!(self, Action::SetState { .. })
    }
}

/// Actions split into store writes and broadcasts, each in emission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionBatch {
    pub kv_ops: Vec<Action>,
    pub bcast_ops: Vec<Action>,
}

impl ActionBatch {
    pub fn from_actions(actions: impl IntoIterator<Item = Action>) -> Self {
        let mut batch = Self::default();
        batch.extend(actions);
        batch
    }

    pub fn extend(&mut self, actions: impl IntoIterator<Item = Action>) {
        for action in actions {
            if action.is_kv() {
                self.kv_ops.push(action);
            } else {
                self.bcast_ops.push(action);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kv_ops.is_empty() && self.bcast_ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.kv_ops.len() + self.bcast_ops.len()
    }

    /// `(object, state)` pairs of the broadcast ops.
    pub fn broadcasts(&self) -> Vec<(ObjectId, ObjectState)> {
        self.bcast_ops
            .iter()
            .map(|action| (action.object(), action.new_state()))
            .collect()
    }
}
