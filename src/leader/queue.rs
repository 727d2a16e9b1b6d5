use super::gate::{GateError, Synchronizer};
use crate::kv::{KvEntry, KvStore, ReadCache, StoreError, TxPut};
use crate::object::{ObjectId, ObjectState};
use crate::sns::SnsOp;
use crate::util::{retry_store_op, HaError, RetryPolicy};
use crate::workflow::{KvTopology, Topology};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

pub const EQ_PREFIX: &str = "eq/";
pub const EQ_EPOCH_KEY: &str = "eq-epoch";

/// `{node, device, state}`: a block device on a node changed state.
pub const DEVICE_STATE_SET: &str = "M0_HA_MSG_NVEC";
/// `{op_name, fid}`: repair or rebalance request on a pool.
pub const SNS_OP: &str = "SNS_OP";
/// `{conf_sdev}`: the engine saw I/O errors on a storage device.
pub const STOB_IOQ_ERROR: &str = "STOB_IOQ_ERROR";
/// `{fid, state, type}`: lifecycle event reported by a process.
pub const PROCESS_STATE_UPDATE: &str = "PROCESS-STATE-UPDATE";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unknown device {device} on node {node}")]
    UnknownDevice { node: String, device: String },
    #[error("unknown device state {0}")]
    UnknownDeviceState(String),
    #[error(transparent)]
    UnknownSnsOp(#[from] crate::sns::UnknownSnsOp),
}

/// Envelope stored under `eq/<offset>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EqMessage {
    pub message_type: String,
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
struct DeviceStateSet {
    node: String,
    device: String,
    state: String,
}

fn device_state(raw: &str) -> Result<ObjectState, QueueError> {
    Ok(match raw {
        "online" => ObjectState::Online,
        "failed" => ObjectState::Failed,
        "offline" => ObjectState::Transient,
        "repair" => ObjectState::Repair,
        "repaired" => ObjectState::Repaired,
        "rebalance" => ObjectState::Rebalance,
        other => return Err(QueueError::UnknownDeviceState(other.to_string())),
    })
}

#[derive(Debug, Deserialize)]
struct SnsRequest {
    op_name: String,
    fid: ObjectId,
}

#[derive(Debug, Deserialize)]
struct StobIoqError {
    conf_sdev: ObjectId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
enum ProcessEvent {
    #[serde(rename = "M0_CONF_HA_PROCESS_STARTING")]
    Starting,
    #[serde(rename = "M0_CONF_HA_PROCESS_STARTED")]
    Started,
    #[serde(rename = "M0_CONF_HA_PROCESS_STOPPING")]
    Stopping,
    #[serde(rename = "M0_CONF_HA_PROCESS_STOPPED")]
    Stopped,
    #[serde(rename = "M0_CONF_HA_PROCESS_DTM_RECOVERED")]
    DtmRecovered,
}

impl ProcessEvent {
    fn state(self) -> ObjectState {
        match self {
            ProcessEvent::Starting => ObjectState::Recovering,
            ProcessEvent::Started | ProcessEvent::DtmRecovered => ObjectState::Online,
            ProcessEvent::Stopping => ObjectState::Transient,
            ProcessEvent::Stopped => ObjectState::Failed,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProcessStateUpdate {
    fid: ObjectId,
    state: ProcessEvent,
    #[serde(rename = "type", default)]
    process_type: Option<String>,
}

/// Appends messages to the durable event queue.
pub struct EventQueue {
    store: Arc<dyn KvStore>,
    retry: RetryPolicy,
}

impl EventQueue {
    pub fn new(store: Arc<dyn KvStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Stores the message at the next epoch and returns that offset. Epoch
    /// bumps race through CAS; a lost race simply tries again.
    pub fn publish(&self, message_type: &str, payload: Value) -> Result<u64, HaError> {
        let body = serde_json::to_string(&EqMessage {
            message_type: message_type.to_string(),
            payload,
        })?;
        loop {
            let epoch = retry_store_op(&self.retry, "eq_epoch_get", || {
                self.store.get(EQ_EPOCH_KEY)
            })?;
            let (index, current) = match epoch {
                Some(entry) => (entry.modify_index, parse_counter(&entry)?),
                None => (0, 0),
            };
            let offset = current + 1;
            let ops = [
                TxPut::new(EQ_EPOCH_KEY, offset.to_string()).with_cas(index),
                TxPut::new(format!("{EQ_PREFIX}{offset}"), body.as_str()),
            ];
            let published = retry_store_op(&self.retry, "eq_publish", || {
                self.store.put_transaction(&ops)
            })?;
            if published {
                debug!(
                    "event=eq_published offset={} message_type={}",
                    offset, message_type
                );
                return Ok(offset);
            }
            debug!("event=eq_epoch_conflict offset={}", offset);
        }
    }
}

fn parse_counter(entry: &KvEntry) -> Result<u64, StoreError> {
    entry
        .value
        .trim()
        .parse()
        .map_err(|err| StoreError::malformed(&entry.key, err))
}

/// Receives the decoded queue messages the leader acts upon.
pub trait EventSink: Send + Sync {
    /// Hands a process lifecycle change over without waiting for it.
    fn process_state(&self, process: ObjectId, state: ObjectState) -> Result<(), HaError>;

    /// Applies the states and returns once the engine confirmed a broadcast.
    fn set_states(&self, states: Vec<(ObjectId, ObjectState)>) -> Result<(), HaError>;

    fn sns_operation(&self, pool: ObjectId, op: SnsOp) -> Result<(), HaError>;
}

/// Failures after which the message stays queued for another attempt.
fn must_retry(err: &HaError) -> bool {
    err.is_transient() || matches!(err, HaError::Herald(_) | HaError::Sink(_))
}

/// Leader-only loop draining the event queue in offset order.
pub struct EventQueueProcessor {
    store: Arc<dyn KvStore>,
    gate: Arc<Synchronizer>,
    sink: Arc<dyn EventSink>,
    topology: Arc<dyn Topology>,
    retry: RetryPolicy,
    poll: Duration,
}

impl EventQueueProcessor {
    pub fn new(
        store: Arc<dyn KvStore>,
        gate: Arc<Synchronizer>,
        sink: Arc<dyn EventSink>,
        retry: RetryPolicy,
        poll: Duration,
    ) -> Self {
        Self {
            store,
            gate,
            sink,
            topology: Arc::new(KvTopology::default()),
            retry,
            poll,
        }
    }

    pub fn with_topology(mut self, topology: Arc<dyn Topology>) -> Self {
        self.topology = topology;
        self
    }

    /// Lowest-offset message, as `(offset, entry)`. Keys without a numeric
    /// offset sort first so they get cleared out.
    fn next_message(&self) -> Result<Option<(Option<u64>, KvEntry)>, StoreError> {
        let entries = retry_store_op(&self.retry, "eq_list", || {
            self.store.get_prefix(EQ_PREFIX)
        })?;
        Ok(entries
            .into_iter()
            .map(|entry| {
                let offset = entry
                    .key
                    .strip_prefix(EQ_PREFIX)
                    .and_then(|raw| raw.parse::<u64>().ok());
                (offset, entry)
            })
            .min_by_key(|(offset, _)| *offset))
    }

    /// Handles and removes one message. `Ok(false)` when the queue is empty.
    /// A message whose handling may succeed later stays queued and the
    /// error is returned; any other failure drops the message.
    pub fn process_next(&self) -> Result<bool, HaError> {
        let Some((offset, entry)) = self.next_message()? else {
            return Ok(false);
        };
        match offset {
            Some(offset) => match self.handle(&entry) {
                Ok(()) => {}
                Err(err) if must_retry(&err) => {
                    debug!(
                        "event=eq_message_deferred offset={} error={}",
                        offset, err
                    );
                    return Err(err);
                }
                Err(err) => warn!(
                    "event=eq_message_skipped offset={} error={}",
                    offset, err
                ),
            },
            None => warn!("event=eq_key_unexpected key={}", entry.key),
        }
        retry_store_op(&self.retry, "eq_remove", || self.store.delete(&entry.key))?;
        debug!("event=eq_message_removed key={}", entry.key);
        Ok(true)
    }

    fn handle(&self, entry: &KvEntry) -> Result<(), HaError> {
        let message: EqMessage = serde_json::from_str(&entry.value)?;
        match message.message_type.as_str() {
            DEVICE_STATE_SET => {
                let event: DeviceStateSet = serde_json::from_value(message.payload)?;
                let state = device_state(&event.state)?;
                let cache = ReadCache::new(self.store.clone());
                let device = retry_store_op(&self.retry, "eq_device_lookup", || {
                    self.topology
                        .device_by_path(&event.node, &event.device, &cache)
                })?
                .ok_or_else(|| QueueError::UnknownDevice {
                    node: event.node.clone(),
                    device: event.device.clone(),
                })?;
                self.sink.set_states(vec![(device, state)])
            }
            SNS_OP => {
                let event: SnsRequest = serde_json::from_value(message.payload)?;
                let op: SnsOp = event.op_name.parse().map_err(QueueError::from)?;
                self.sink.sns_operation(event.fid, op)
            }
            STOB_IOQ_ERROR => {
                let event: StobIoqError = serde_json::from_value(message.payload)?;
                if event.conf_sdev.is_null() {
                    debug!("event=eq_stob_ioq_without_device");
                    return Ok(());
                }
                self.sink
                    .set_states(vec![(event.conf_sdev, ObjectState::Failed)])
            }
            PROCESS_STATE_UPDATE => {
                let event: ProcessStateUpdate = serde_json::from_value(message.payload)?;
                debug!(
                    "event=eq_process_event process={} event={:?} type={}",
                    event.fid,
                    event.state,
                    event.process_type.as_deref().unwrap_or("-")
                );
                self.sink.process_state(event.fid, event.state.state())
            }
            other => {
                warn!("event=eq_message_unsupported message_type={}", other);
                Ok(())
            }
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("eq-processor".into())
            .spawn(move || self.run())
    }

    pub fn run(&self) {
        info!("event=eq_processor_started");
        let exit = loop {
            if let Err(err) = self.gate.ensure_allowed() {
                break err;
            }
            let pause = match self.process_next() {
                Ok(true) => false,
                Ok(false) => true,
                Err(err) if must_retry(&err) => {
                    debug!("event=eq_processor_retry_later error={}", err);
                    true
                }
                Err(err) => {
                    error!("event=eq_processor_failed error={}", err);
                    return;
                }
            };
            if pause {
                if let Err(err) = self.gate.sleep(self.poll) {
                    break err;
                }
            }
        };
        match exit {
            GateError::Interrupted => info!("event=eq_processor_stopped"),
        }
    }
}
