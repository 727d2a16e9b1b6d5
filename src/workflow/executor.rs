use super::action::{Action, ActionBatch};
use crate::bridge::{BridgeError, BroadcastBridge};
use crate::delivery::MessageId;
use crate::kv::{KvStore, StoreError, TxPut, DEFAULT_TX_LIMIT};
use crate::util::{retry_store_op, RetryPolicy};
use log::{debug, warn};
use std::slice::Chunks;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("store rejected page {page} ({ops} writes); HA state is inconsistent")]
    HaConsistency { page: usize, ops: usize },
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl ExecutorError {
    pub fn is_transient(&self) -> bool {
        match self {
            ExecutorError::Store(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// Applies the side effects of a transition batch.
pub trait Executor: Send + Sync {
    /// Returns the broadcast message ids, in broadcast order.
    fn execute(&self, batch: &ActionBatch) -> Result<Vec<MessageId>, ExecutorError>;
}

/// Splits a slice into pages of at most `page_size` items.
pub struct Pager<'a, T> {
    chunks: Chunks<'a, T>,
}

impl<'a, T> Pager<'a, T> {
    pub fn new(items: &'a [T], page_size: usize) -> Self {
        Self {
            chunks: items.chunks(page_size.max(1)),
        }
    }
}

impl<'a, T> Iterator for Pager<'a, T> {
    type Item = &'a [T];

    fn next(&mut self) -> Option<Self::Item> {
        self.chunks.next()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorLimits {
    pub kv_tx_limit: usize,
    pub broadcast_batch: usize,
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self {
            kv_tx_limit: DEFAULT_TX_LIMIT,
            broadcast_batch: 32,
        }
    }
}

/// Writes `SetState` actions as store transactions, then broadcasts.
pub struct StoreExecutor {
    store: Arc<dyn KvStore>,
    bridge: Arc<dyn BroadcastBridge>,
    limits: ExecutorLimits,
    retry: RetryPolicy,
}

impl StoreExecutor {
    pub fn new(
        store: Arc<dyn KvStore>,
        bridge: Arc<dyn BroadcastBridge>,
        limits: ExecutorLimits,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            bridge,
            limits,
            retry,
        }
    }

    fn tx_limit(&self) -> usize {
        self.limits
            .kv_tx_limit
            .min(self.store.max_transaction_ops())
            .max(1)
    }

    fn write_states(&self, kv_ops: &[Action]) -> Result<(), ExecutorError> {
        for (page, actions) in Pager::new(kv_ops, self.tx_limit()).enumerate() {
            let ops: Vec<TxPut> = actions
                .iter()
                .filter_map(|action| match action {
                    Action::SetState {
                        store_key,
                        serialized_value,
                        ..
                    } => Some(TxPut::new(store_key.as_str(), serialized_value.as_str())),
                    Action::Broadcast { .. } => None,
                })
                .collect();
            let applied = retry_store_op(&self.retry, "put_transaction", || {
                self.store.put_transaction(&ops)
            })?;
            if !applied {
                warn!("event=executor_tx_rejected page={} ops={}", page, ops.len());
                return Err(ExecutorError::HaConsistency {
                    page,
                    ops: ops.len(),
                });
            }
            debug!("event=executor_tx_applied page={} ops={}", page, ops.len());
        }
        Ok(())
    }

    fn broadcast_states(&self, bcast_ops: &[Action]) -> Result<Vec<MessageId>, ExecutorError> {
        let mut ids = Vec::with_capacity(bcast_ops.len());
        for (page, actions) in Pager::new(bcast_ops, self.limits.broadcast_batch).enumerate() {
            let states: Vec<_> = actions
                .iter()
                .map(|action| (action.object(), action.new_state()))
                .collect();
            let sent = self.bridge.broadcast(&states)?;
            debug!(
                "event=executor_broadcast page={} states={} ids={}",
                page,
                states.len(),
                sent.len()
            );
            ids.extend(sent);
        }
        Ok(ids)
    }
}

impl Executor for StoreExecutor {
    fn execute(&self, batch: &ActionBatch) -> Result<Vec<MessageId>, ExecutorError> {
        self.write_states(&batch.kv_ops)?;
        self.broadcast_states(&batch.bcast_ops)
    }
}
