use super::{KvEntry, KvStore, StoreError};
use log::trace;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Request-scoped memo of store reads.
///
/// One cache lives for exactly one transition batch; every nested transition
/// of that batch reads through it so a record is fetched from the store at
/// most once. Caches are never shared between unrelated requests.
pub struct ReadCache {
    store: Arc<dyn KvStore>,
    keys: Mutex<HashMap<String, Option<KvEntry>>>,
    prefixes: Mutex<HashMap<String, Vec<KvEntry>>>,
}

impl ReadCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            keys: Mutex::new(HashMap::new()),
            prefixes: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        if let Some(hit) = self.keys.lock().get(key) {
            trace!("event=read_cache_hit key={}", key);
            return Ok(hit.clone());
        }
        let fetched = self.store.get(key)?;
        self.keys.lock().insert(key.to_string(), fetched.clone());
        Ok(fetched)
    }

    pub fn get_prefix(&self, prefix: &str) -> Result<Vec<KvEntry>, StoreError> {
        if let Some(hit) = self.prefixes.lock().get(prefix) {
            trace!("event=read_cache_hit prefix={}", prefix);
            return Ok(hit.clone());
        }
        let fetched = self.store.get_prefix(prefix)?;
        self.prefixes.lock().insert(prefix.to_string(), fetched.clone());
        Ok(fetched)
    }

    /// Number of distinct keys and prefixes fetched so far.
    pub fn len(&self) -> usize {
        self.keys.lock().len() + self.prefixes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
