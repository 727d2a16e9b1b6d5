//! Rendezvous between broadcasters and the storage engine's delivery
//! confirmations.
//!
//! A caller that needs proof a broadcast reached the engine builds a
//! [`Promise`] from the message ids returned by the bridge and blocks in
//! [`DeliveryHerald::wait_for_all`] / [`DeliveryHerald::wait_for_any`]. The
//! bridge thread reports confirmations through
//! [`DeliveryHerald::notify_delivered`]. Confirmations that arrive before the
//! matching wait registers are parked in an "unsorted" map and picked up when
//! the wait starts.

use crate::timeouts::DEFAULT_UNSORTED_TTL;
use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Identifier of one broadcast message, as allocated by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub link: u64,
    pub tag: u64,
}

impl MessageId {
    pub const fn new(link: u64, tag: u64) -> Self {
        Self { link, tag }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.link, self.tag)
    }
}

/// Outstanding message ids of one logical broadcast. Equality and hashing
/// are over the id set, so two promises with the same ids are the same key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Promise {
    ids: BTreeSet<MessageId>,
}

impl Promise {
    pub fn new(ids: impl IntoIterator<Item = MessageId>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = &MessageId> {
        self.ids.iter()
    }

    fn remove_all(&mut self, confirmed: &[MessageId]) {
        for id in confirmed {
            self.ids.remove(id);
        }
    }
}

impl FromIterator<MessageId> for Promise {
    fn from_iter<I: IntoIterator<Item = MessageId>>(iter: I) -> Self {
        Self::new(iter)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeraldError {
    #[error("{} message(s) not delivered within {timeout:?} ({confirmed} confirmed earlier)", pending.len())]
    NotDelivered {
        pending: Vec<MessageId>,
        confirmed: usize,
        timeout: Duration,
    },
}

struct WaitSlot {
    condvar: Arc<Condvar>,
    waiters: usize,
    delivered: Vec<MessageId>,
}

#[derive(Default)]
struct HeraldState {
    waiting: HashMap<Promise, WaitSlot>,
    unsorted: HashMap<MessageId, Instant>,
}

impl HeraldState {
    /// Moves matching unsorted ids into the slot's bucket, then drops the
    /// unsorted ids older than `ttl`.
    fn groom(&mut self, promise: &Promise, ttl: Duration, now: Instant) -> Vec<MessageId> {
        let matched: Vec<MessageId> = promise
            .ids()
            .filter(|id| self.unsorted.contains_key(id))
            .copied()
            .collect();
        for id in &matched {
            self.unsorted.remove(id);
        }
        self.purge_expired(ttl, now);
        matched
    }

    /// Runs on every wait and on every parked confirmation, so ids nobody
    /// waits for are bounded by the TTL.
    fn purge_expired(&mut self, ttl: Duration, now: Instant) {
        let before = self.unsorted.len();
        self.unsorted
            .retain(|_, seen| now.saturating_duration_since(*seen) < ttl);
        let expired = before - self.unsorted.len();
        if expired > 0 {
            debug!("event=herald_unsorted_expired count={}", expired);
        }
    }
}

pub struct DeliveryHerald {
    state: Mutex<HeraldState>,
    unsorted_ttl: Duration,
}

impl Default for DeliveryHerald {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryHerald {
    pub fn new() -> Self {
        Self::with_unsorted_ttl(DEFAULT_UNSORTED_TTL)
    }

    pub fn with_unsorted_ttl(unsorted_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(HeraldState::default()),
            unsorted_ttl,
        }
    }

    /// Reports a confirmed delivery. Never blocks beyond the herald lock.
    pub fn notify_delivered(&self, id: MessageId) {
        let mut state = self.state.lock();
        let mut matched = 0usize;
        for (promise, slot) in state.waiting.iter_mut() {
            if promise.contains(&id) {
                slot.delivered.push(id);
                slot.condvar.notify_all();
                matched += 1;
            }
        }
        if matched == 0 {
            trace!("event=herald_delivery_unsorted id={}", id);
            let now = Instant::now();
            state.purge_expired(self.unsorted_ttl, now);
            state.unsorted.insert(id, now);
        } else {
            trace!("event=herald_delivery_matched id={} waiters={}", id, matched);
        }
    }

    /// Blocks until at least one id of `promise` is confirmed, removes the
    /// confirmed ids from it and returns them.
    pub fn wait_for_any(
        &self,
        promise: &mut Promise,
        timeout: Duration,
    ) -> Result<Vec<MessageId>, HeraldError> {
        if promise.is_empty() {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + timeout;
        let key = promise.clone();
        let mut state = self.state.lock();

        let groomed = state.groom(&key, self.unsorted_ttl, Instant::now());
        let condvar = {
            let slot = state.waiting.entry(key.clone()).or_insert_with(|| WaitSlot {
                condvar: Arc::new(Condvar::new()),
                waiters: 0,
                delivered: Vec::new(),
            });
            slot.waiters += 1;
            slot.delivered.extend(groomed);
            slot.condvar.clone()
        };

        loop {
            let ready = state
                .waiting
                .get(&key)
                .map(|slot| !slot.delivered.is_empty())
                .unwrap_or(false);
            if ready {
                break;
            }
            if condvar.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }

        let last_waiter = state
            .waiting
            .get(&key)
            .map(|slot| slot.waiters <= 1)
            .unwrap_or(true);
        let delivered = if last_waiter {
            state
                .waiting
                .remove(&key)
                .map(|slot| slot.delivered)
                .unwrap_or_default()
        } else {
            match state.waiting.get_mut(&key) {
                Some(slot) => {
                    slot.waiters -= 1;
                    slot.delivered.clone()
                }
                None => Vec::new(),
            }
        };
        drop(state);

        let mut confirmed: Vec<MessageId> = delivered
            .into_iter()
            .filter(|id| promise.contains(id))
            .collect();
        confirmed.sort_unstable();
        confirmed.dedup();
        if confirmed.is_empty() {
            return Err(HeraldError::NotDelivered {
                pending: promise.ids().copied().collect(),
                confirmed: 0,
                timeout,
            });
        }
        promise.remove_all(&confirmed);
        debug!(
            "event=herald_confirmed count={} remaining={}",
            confirmed.len(),
            promise.len()
        );
        Ok(confirmed)
    }

    /// Repeats [`wait_for_any`](Self::wait_for_any) until every id of
    /// `promise` is confirmed. Each round gets the full `timeout`.
    pub fn wait_for_all(&self, promise: &mut Promise, timeout: Duration) -> Result<(), HeraldError> {
        let mut confirmed = 0usize;
        while !promise.is_empty() {
            match self.wait_for_any(promise, timeout) {
                Ok(ids) => confirmed += ids.len(),
                Err(HeraldError::NotDelivered { pending, timeout, .. }) => {
                    return Err(HeraldError::NotDelivered {
                        pending,
                        confirmed,
                        timeout,
                    });
                }
            }
        }
        Ok(())
    }

    /// Number of parked confirmations nobody has waited for yet.
    pub fn unsorted_len(&self) -> usize {
        self.state.lock().unsorted.len()
    }

    pub fn waiting_len(&self) -> usize {
        self.state.lock().waiting.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn ids(raw: &[u64]) -> Vec<MessageId> {
        raw.iter().map(|tag| MessageId::new(1, *tag)).collect()
    }

    #[test]
    fn promises_compare_by_content() {
        let a = Promise::new(ids(&[3, 1, 2]));
        let b = Promise::new(ids(&[1, 2, 3]));
        assert_eq!(a, b);
        let mut map = HashMap::new();
        map.insert(a, 1);
        assert_eq!(map.get(&b), Some(&1));
    }

    #[test]
    fn empty_promise_returns_immediately() {
        let herald = DeliveryHerald::new();
        let mut promise = Promise::default();
        assert!(herald
            .wait_for_any(&mut promise, Duration::from_secs(10))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn partial_delivery_leaves_the_rest_pending() {
        let herald = DeliveryHerald::new();
        herald.notify_delivered(MessageId::new(1, 2));
        let mut promise = Promise::new(ids(&[1, 2, 3]));
        let confirmed = herald
            .wait_for_any(&mut promise, Duration::from_millis(50))
            .unwrap();
        assert_eq!(confirmed, ids(&[2]));
        assert_eq!(promise, Promise::new(ids(&[1, 3])));
        assert_eq!(herald.waiting_len(), 0);
    }

    #[test]
    fn stale_unsorted_entries_are_purged() {
        let herald = DeliveryHerald::with_unsorted_ttl(Duration::from_millis(10));
        herald.notify_delivered(MessageId::new(9, 9));
        thread::sleep(Duration::from_millis(30));
        herald.notify_delivered(MessageId::new(1, 1));
        let mut promise = Promise::new(ids(&[1]));
        herald
            .wait_for_any(&mut promise, Duration::from_millis(50))
            .unwrap();
        assert_eq!(herald.unsorted_len(), 0);
    }

    #[test]
    fn wait_for_all_reports_partial_progress() {
        let herald = DeliveryHerald::new();
        herald.notify_delivered(MessageId::new(1, 1));
        let mut promise = Promise::new(ids(&[1, 2]));
        let err = herald
            .wait_for_all(&mut promise, Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(
            err,
            HeraldError::NotDelivered {
                pending: ids(&[2]),
                confirmed: 1,
                timeout: Duration::from_millis(20),
            }
        );
    }
}
