use super::{KvEntry, KvStore, StoreError, TxPut, DEFAULT_TX_LIMIT};
use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

/// In-process store with Consul-like CAS and transaction semantics.
pub struct MemoryKv {
    inner: Mutex<MemoryState>,
    tx_limit: usize,
}

#[derive(Default)]
struct MemoryState {
    entries: BTreeMap<String, KvEntry>,
    sessions: HashMap<String, String>,
    last_index: u64,
    failures_pending: usize,
    transactions: usize,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::with_tx_limit(DEFAULT_TX_LIMIT)
    }

    pub fn with_tx_limit(tx_limit: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryState::default()),
            tx_limit: tx_limit.max(1),
        }
    }

    /// Makes the next `count` store calls fail with [`StoreError::Unavailable`].
    pub fn fail_next(&self, count: usize) {
        self.inner.lock().failures_pending = count;
    }

    /// Number of successfully applied `put_transaction` calls.
    pub fn transactions(&self) -> usize {
        self.inner.lock().transactions
    }

    pub fn create_session(&self, session: &str, node: &str) {
        self.inner
            .lock()
            .sessions
            .insert(session.to_string(), node.to_string());
    }

    pub fn destroy_session(&self, session: &str) {
        let mut state = self.inner.lock();
        state.sessions.remove(session);
        for entry in state.entries.values_mut() {
            if entry.session.as_deref() == Some(session) {
                entry.session = None;
            }
        }
    }

    /// Writes `key` bound to `session` (the way a leader key is acquired).
    pub fn acquire(&self, key: &str, value: &str, session: &str) -> bool {
        let mut state = self.inner.lock();
        if !state.sessions.contains_key(session) {
            return false;
        }
        if let Some(existing) = state.entries.get(key) {
            if existing.session.is_some() && existing.session.as_deref() != Some(session) {
                return false;
            }
        }
        state.write(key, value);
        if let Some(entry) = state.entries.get_mut(key) {
            entry.session = Some(session.to_string());
        }
        true
    }

    /// Unconditional write, for seeding fixtures.
    pub fn insert(&self, key: &str, value: impl Into<String>) {
        let value = value.into();
        self.inner.lock().write(key, &value);
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.inner.lock().entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().entries.keys().cloned().collect()
    }
}

impl MemoryState {
    fn take_failure(&mut self) -> Result<(), StoreError> {
        if self.failures_pending > 0 {
            self.failures_pending -= 1;
            debug!("event=memory_kv_injected_failure remaining={}", self.failures_pending);
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(())
    }

    fn cas_holds(&self, key: &str, cas: Option<u64>) -> bool {
        match (cas, self.entries.get(key)) {
            (None, _) => true,
            (Some(0), existing) => existing.is_none(),
            (Some(index), Some(existing)) => existing.modify_index == index,
            (Some(_), None) => false,
        }
    }

    fn write(&mut self, key: &str, value: &str) {
        self.last_index += 1;
        let index = self.last_index;
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| KvEntry {
            key: key.to_string(),
            value: String::new(),
            modify_index: index,
            session: None,
        });
        entry.value = value.to_string();
        entry.modify_index = index;
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        let mut state = self.inner.lock();
        state.take_failure()?;
        Ok(state.entries.get(key).cloned())
    }

    fn get_prefix(&self, prefix: &str) -> Result<Vec<KvEntry>, StoreError> {
        let mut state = self.inner.lock();
        state.take_failure()?;
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    fn put(&self, key: &str, value: &str, cas: Option<u64>) -> Result<bool, StoreError> {
        let mut state = self.inner.lock();
        state.take_failure()?;
        if !state.cas_holds(key, cas) {
            return Ok(false);
        }
        state.write(key, value);
        Ok(true)
    }

    fn put_transaction(&self, ops: &[TxPut]) -> Result<bool, StoreError> {
        if ops.len() > self.tx_limit {
            return Err(StoreError::TransactionTooLarge {
                ops: ops.len(),
                limit: self.tx_limit,
            });
        }
        let mut state = self.inner.lock();
        state.take_failure()?;
        if !ops.iter().all(|op| state.cas_holds(&op.key, op.cas)) {
            return Ok(false);
        }
        for op in ops {
            state.write(&op.key, &op.value);
        }
        state.transactions += 1;
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut state = self.inner.lock();
        state.take_failure()?;
        Ok(state.entries.remove(key).is_some())
    }

    fn delete_transaction(&self, prefixes: &[String]) -> Result<bool, StoreError> {
        let mut state = self.inner.lock();
        state.take_failure()?;
        state
            .entries
            .retain(|key, _| !prefixes.iter().any(|prefix| key.starts_with(prefix.as_str())));
        Ok(true)
    }

    fn session_node(&self, session: &str) -> Result<Option<String>, StoreError> {
        let mut state = self.inner.lock();
        state.take_failure()?;
        Ok(state.sessions.get(session).cloned())
    }

    fn max_transaction_ops(&self) -> usize {
        self.tx_limit
    }
}
