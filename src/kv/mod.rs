//! Interface to the distributed key-value configuration store.
//!
//! The store is the single source of truth for object state. This crate
//! consumes it through [`KvStore`]; [`MemoryKv`] is an in-process
//! implementation with the same CAS/transaction semantics.

mod cache;
mod lock;
mod memory;

pub use cache::ReadCache;
pub use lock::{IdAllocator, KvMutex};
pub use memory::MemoryKv;

use thiserror::Error;

/// Default cap on the number of operations in one store transaction.
pub const DEFAULT_TX_LIMIT: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("transaction of {ops} operations exceeds limit {limit}")]
    TransactionTooLarge { ops: usize, limit: usize },
    #[error("value under {key} is malformed: {reason}")]
    Malformed { key: String, reason: String },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    pub fn malformed(key: &str, reason: impl ToString) -> Self {
        StoreError::Malformed {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
    pub modify_index: u64,
    pub session: Option<String>,
}

/// One write inside a transaction. `cas = Some(0)` creates only when the key
/// is absent; `cas = Some(i)` writes only when the key's modify index is `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxPut {
    pub key: String,
    pub value: String,
    pub cas: Option<u64>,
}

impl TxPut {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            cas: None,
        }
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = Some(cas);
        self
    }
}

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError>;

    /// Every entry whose key starts with `prefix`, ordered by key.
    fn get_prefix(&self, prefix: &str) -> Result<Vec<KvEntry>, StoreError>;

    /// Returns `false` when the CAS precondition does not hold.
    fn put(&self, key: &str, value: &str, cas: Option<u64>) -> Result<bool, StoreError>;

    /// Atomic: either every write is applied or none is.
    fn put_transaction(&self, ops: &[TxPut]) -> Result<bool, StoreError>;

    /// Removes exactly `key`; `false` when it did not exist.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Deletes every key under each prefix, atomically.
    fn delete_transaction(&self, prefixes: &[String]) -> Result<bool, StoreError>;

    /// Node name owning the given session, if the session exists.
    fn session_node(&self, session: &str) -> Result<Option<String>, StoreError>;

    fn max_transaction_ops(&self) -> usize {
        DEFAULT_TX_LIMIT
    }
}

impl<T: KvStore + ?Sized> KvStore for std::sync::Arc<T> {
    fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        (**self).get(key)
    }

    fn get_prefix(&self, prefix: &str) -> Result<Vec<KvEntry>, StoreError> {
        (**self).get_prefix(prefix)
    }

    fn put(&self, key: &str, value: &str, cas: Option<u64>) -> Result<bool, StoreError> {
        (**self).put(key, value, cas)
    }

    fn put_transaction(&self, ops: &[TxPut]) -> Result<bool, StoreError> {
        (**self).put_transaction(ops)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        (**self).delete(key)
    }

    fn delete_transaction(&self, prefixes: &[String]) -> Result<bool, StoreError> {
        (**self).delete_transaction(prefixes)
    }

    fn session_node(&self, session: &str) -> Result<Option<String>, StoreError> {
        (**self).session_node(session)
    }

    fn max_transaction_ops(&self) -> usize {
        (**self).max_transaction_ops()
    }
}
