//! Boundary to the storage engine's broadcast channel.

use crate::delivery::{DeliveryHerald, MessageId};
use crate::object::{ObjectId, ObjectState};
use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("broadcast bridge is closed")]
    Closed,
    #[error("broadcast rejected: {0}")]
    Rejected(String),
}

/// Sends HA state changes to the storage engine. Each returned id is later
/// confirmed through [`DeliveryHerald::notify_delivered`].
pub trait BroadcastBridge: Send + Sync {
    fn broadcast(&self, states: &[(ObjectId, ObjectState)]) -> Result<Vec<MessageId>, BridgeError>;
}

/// In-process bridge that "delivers" every broadcast back to a herald from a
/// background thread, optionally after a fixed delay.
pub struct LoopbackBridge {
    link: u64,
    next_tag: AtomicU64,
    tx: Mutex<Option<Sender<MessageId>>>,
    history: Mutex<Vec<(ObjectId, ObjectState)>>,
    hold: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackBridge {
    pub fn start(herald: Arc<DeliveryHerald>, delay: Duration) -> Self {
        let (tx, rx) = channel::unbounded();
        let hold = Arc::new(AtomicBool::new(false));
        let worker = {
            let hold = hold.clone();
            thread::Builder::new()
                .name("loopback-bridge".into())
                .spawn(move || deliver_loop(rx, herald, delay, hold))
                .ok()
        };
        if worker.is_none() {
            warn!("event=loopback_bridge_spawn_failed");
        }
        Self {
            link: 1,
            next_tag: AtomicU64::new(1),
            tx: Mutex::new(Some(tx)),
            history: Mutex::new(Vec::new()),
            hold,
            worker: Mutex::new(worker),
        }
    }

    /// While held, broadcasts are accepted but never confirmed.
    pub fn hold_deliveries(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    /// Every `(object, state)` pair broadcast so far, in order.
    pub fn history(&self) -> Vec<(ObjectId, ObjectState)> {
        self.history.lock().clone()
    }

    pub fn close(&self) {
        self.tx.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("event=loopback_bridge_join_failed");
            }
        }
    }
}

impl BroadcastBridge for LoopbackBridge {
    fn broadcast(&self, states: &[(ObjectId, ObjectState)]) -> Result<Vec<MessageId>, BridgeError> {
        let tx = self.tx.lock().clone().ok_or(BridgeError::Closed)?;
        let mut ids = Vec::with_capacity(states.len());
        for (object, state) in states {
            let id = MessageId::new(self.link, self.next_tag.fetch_add(1, Ordering::SeqCst));
            self.history.lock().push((*object, *state));
            debug!(
                "event=bridge_broadcast object={} state={} code={} id={}",
                object,
                state,
                state.code(),
                id
            );
            tx.send(id).map_err(|_| BridgeError::Closed)?;
            ids.push(id);
        }
        Ok(ids)
    }
}

impl Drop for LoopbackBridge {
    fn drop(&mut self) {
        self.close();
    }
}

fn deliver_loop(
    rx: Receiver<MessageId>,
    herald: Arc<DeliveryHerald>,
    delay: Duration,
    hold: Arc<AtomicBool>,
) {
    for id in rx.iter() {
        if hold.load(Ordering::SeqCst) {
            debug!("event=bridge_delivery_held id={}", id);
            continue;
        }
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        herald.notify_delivered(id);
    }
    info!("event=loopback_bridge_stopped");
}
