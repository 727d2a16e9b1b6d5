use crate::bridge::BridgeError;
use crate::config::ConfigError;
use crate::delivery::HeraldError;
use crate::dispatch::SinkError;
use crate::kv::StoreError;
use crate::leader::{GateError, QueueError};
use crate::object::ObjectError;
use crate::workflow::{ExecutorError, WorkflowError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum HaError {
    #[error(transparent)]
    Object(#[from] ObjectError),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Herald(#[from] HeraldError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for HaError {
    fn from(err: serde_json::Error) -> Self {
        HaError::Serialization(SerializationError::from(err))
    }
}

impl HaError {
    /// True when the failure came from the external store and the same
    /// operation may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            HaError::Store(err) => err.is_transient(),
            HaError::Workflow(WorkflowError::Store(err)) => err.is_transient(),
            HaError::Executor(err) => err.is_transient(),
            _ => false,
        }
    }
}
