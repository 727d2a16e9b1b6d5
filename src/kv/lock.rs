use super::{KvStore, StoreError, TxPut};
use crate::object::ObjectKind;
use crate::util::{retry_store_op, RetryPolicy};
use log::{debug, warn};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const LOCK_PREFIX: &str = "fidk_update_lock";
const COUNTER_PREFIX: &str = "last_dynamic_fid_key";

/// Spin lock built on a create-only key.
pub struct KvMutex {
    store: Arc<dyn KvStore>,
    key: String,
    spin_interval: Duration,
    deadline: Duration,
}

/// Held lock; deleting the key on drop releases it.
pub struct KvMutexGuard<'a> {
    mutex: &'a KvMutex,
}

impl KvMutex {
    pub fn new(store: Arc<dyn KvStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            spin_interval: Duration::from_millis(100),
            deadline: Duration::from_secs(60),
        }
    }

    pub fn for_kind(store: Arc<dyn KvStore>, kind: ObjectKind) -> Self {
        Self::new(store, format!("{LOCK_PREFIX}/{}", kind.name()))
    }

    pub fn with_spin_interval(mut self, interval: Duration) -> Self {
        self.spin_interval = interval;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn lock(&self) -> Result<KvMutexGuard<'_>, StoreError> {
        let started = Instant::now();
        let mut spins = 0u64;
        loop {
            if self.store.put(&self.key, "locked", Some(0))? {
                debug!("event=kv_mutex_acquired key={} spins={}", self.key, spins);
                return Ok(KvMutexGuard { mutex: self });
            }
            if started.elapsed() >= self.deadline {
                return Err(StoreError::Unavailable(format!(
                    "lock {} still held after {:?}",
                    self.key, self.deadline
                )));
            }
            spins += 1;
            thread::sleep(self.spin_interval);
        }
    }

    fn unlock(&self) -> Result<bool, StoreError> {
        self.store.delete_transaction(&[self.key.clone()])
    }
}

impl Drop for KvMutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.mutex.unlock() {
            warn!(
                "event=kv_mutex_release_failed key={} error={}",
                self.mutex.key, err
            );
        }
    }
}

/// Hands out fresh object keys per kind, serialized through [`KvMutex`].
pub struct IdAllocator {
    store: Arc<dyn KvStore>,
    retry: RetryPolicy,
    spin_interval: Duration,
}

impl IdAllocator {
    pub fn new(store: Arc<dyn KvStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            spin_interval: Duration::from_millis(100),
        }
    }

    pub fn with_spin_interval(mut self, interval: Duration) -> Self {
        self.spin_interval = interval;
        self
    }

    pub fn next_key(&self, kind: ObjectKind) -> Result<u64, StoreError> {
        let mutex =
            KvMutex::for_kind(self.store.clone(), kind).with_spin_interval(self.spin_interval);
        let _guard = mutex.lock()?;
        let counter_key = format!("{COUNTER_PREFIX}/{}", kind.name());
        let current = match retry_store_op(&self.retry, "id_counter_get", || {
            self.store.get(&counter_key)
        })? {
            Some(entry) => entry
                .value
                .trim()
                .parse::<u64>()
                .map_err(|err| StoreError::malformed(&counter_key, err))?,
            None => 0,
        };
        let next = current + 1;
        let written = retry_store_op(&self.retry, "id_counter_put", || {
            self.store
                .put_transaction(&[TxPut::new(counter_key.as_str(), next.to_string())])
        })?;
        if !written {
            return Err(StoreError::Unavailable(format!(
                "counter {counter_key} update rejected"
            )));
        }
        debug!("event=dynamic_id_allocated kind={} key={}", kind, next);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use std::collections::HashSet;

    #[test]
    fn guard_releases_the_lock_key() {
        let kv = Arc::new(MemoryKv::new());
        let mutex = KvMutex::new(kv.clone(), "fidk_update_lock/drive");
        {
            let _guard = mutex.lock().unwrap();
            assert!(kv.value("fidk_update_lock/drive").is_some());
        }
        assert!(kv.value("fidk_update_lock/drive").is_none());
    }

    #[test]
    fn contended_lock_times_out() {
        let kv = Arc::new(MemoryKv::new());
        kv.insert("held", "locked");
        let mutex = KvMutex::new(kv, "held")
            .with_spin_interval(Duration::from_millis(1))
            .with_deadline(Duration::from_millis(20));
        assert!(matches!(mutex.lock(), Err(StoreError::Unavailable(_))));
    }

    #[test]
    fn concurrent_allocations_are_unique() {
        let kv: Arc<MemoryKv> = Arc::new(MemoryKv::new());
        let allocator = Arc::new(
            IdAllocator::new(kv.clone(), RetryPolicy::none())
                .with_spin_interval(Duration::from_millis(1)),
        );
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let allocator = allocator.clone();
                thread::spawn(move || {
                    (0..5)
                        .map(|_| allocator.next_key(ObjectKind::Drive).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for key in handle.join().unwrap() {
                assert!(seen.insert(key));
            }
        }
        assert_eq!(seen.len(), 20);
        assert_eq!(kv.value("last_dynamic_fid_key/drive").as_deref(), Some("20"));
    }
}
