//! Leader-only processing of the durable event queue.

mod gate;
mod monitor;
mod queue;

pub use gate::{GateError, Synchronizer};
pub use monitor::{LeaderMonitor, LEADER_KEY};
pub use queue::{
    EqMessage, EventQueue, EventQueueProcessor, EventSink, QueueError, DEVICE_STATE_SET,
    EQ_EPOCH_KEY, EQ_PREFIX, PROCESS_STATE_UPDATE, SNS_OP, STOB_IOQ_ERROR,
};
