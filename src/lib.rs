//! Core library entrypoint for the HA coordination core: object state
//! workflow, group-ordered command planner, delivery herald and the
//! leader-gated event queue processor.

pub mod bridge;
pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod kv;
pub mod leader;
pub mod object;
pub mod planner;
pub mod sns;
pub mod timeouts;
pub mod util;
pub mod workflow;

pub use bridge::{BridgeError, BroadcastBridge, LoopbackBridge};
pub use config::{ConfigError, HaConfig};
pub use delivery::{DeliveryHerald, HeraldError, MessageId, Promise};
pub use dispatch::{Dispatcher, HaCommand, Reply, SchedulerSink, SinkError};
pub use kv::{IdAllocator, KvEntry, KvMutex, KvStore, MemoryKv, ReadCache, StoreError, TxPut};
pub use leader::{
    EqMessage, EventQueue, EventQueueProcessor, EventSink, GateError, LeaderMonitor,
    QueueError, Synchronizer,
};
pub use object::{ObjectError, ObjectId, ObjectKind, ObjectState, PersistedRecord};
pub use planner::{
    Assignment, Command, CommandHandler, CommandKind, CommandScheduler, Schedulable, Submitted,
    WorkerPool, GROUP_MODULUS,
};
pub use sns::{SnsAction, SnsControl, SnsKind, SnsOp, SnsProgress, SnsStatus, TrackingSnsControl};
pub use util::{HaError, RetryPolicy};
pub use workflow::{
    Action, ActionBatch, Executor, ExecutorError, ExecutorLimits, KvTopology, ObjectWorkflow,
    Pager, StoreExecutor, Topology, TransitionContext, WorkflowError,
};
