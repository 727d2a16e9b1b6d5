use crate::object::ObjectId;
use crate::timeouts::{
    DEFAULT_DELIVERY_TIMEOUT, DEFAULT_LEADER_POLL, DEFAULT_LEADER_SETTLE, DEFAULT_QUEUE_POLL,
    DEFAULT_STORE_RETRY_DELAY, DEFAULT_UNSORTED_TTL,
};
use crate::util::RetryPolicy;
use crate::workflow::ExecutorLimits;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HaConfig {
    pub node_name: String,
    /// Id of the process running this agent; never cascaded into.
    pub ha_process: Option<ObjectId>,
    pub worker_threads: usize,
    pub kv_tx_limit: usize,
    pub broadcast_batch: usize,
    pub delivery_timeout_ms: u64,
    pub unsorted_ttl_ms: u64,
    pub leader_settle_ms: u64,
    pub queue_poll_ms: u64,
    pub leader_poll_ms: u64,
    pub store_retry_attempts: usize,
    pub store_retry_delay_ms: u64,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            node_name: "localhost".into(),
            ha_process: None,
            worker_threads: 4,
            kv_tx_limit: 64,
            broadcast_batch: 32,
            delivery_timeout_ms: DEFAULT_DELIVERY_TIMEOUT.as_millis() as u64,
            unsorted_ttl_ms: DEFAULT_UNSORTED_TTL.as_millis() as u64,
            leader_settle_ms: DEFAULT_LEADER_SETTLE.as_millis() as u64,
            queue_poll_ms: DEFAULT_QUEUE_POLL.as_millis() as u64,
            leader_poll_ms: DEFAULT_LEADER_POLL.as_millis() as u64,
            store_retry_attempts: 5,
            store_retry_delay_ms: DEFAULT_STORE_RETRY_DELAY.as_millis() as u64,
        }
    }
}

impl HaConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: HaConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.trim().is_empty() {
            return Err(ConfigError::Invalid("node_name must not be empty".into()));
        }
        let positive = [
            ("worker_threads", self.worker_threads),
            ("kv_tx_limit", self.kv_tx_limit),
            ("broadcast_batch", self.broadcast_batch),
            ("store_retry_attempts", self.store_retry_attempts),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn unsorted_ttl(&self) -> Duration {
        Duration::from_millis(self.unsorted_ttl_ms)
    }

    pub fn leader_settle(&self) -> Duration {
        Duration::from_millis(self.leader_settle_ms)
    }

    pub fn queue_poll(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms)
    }

    pub fn leader_poll(&self) -> Duration {
        Duration::from_millis(self.leader_poll_ms)
    }

    pub fn store_retry(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.store_retry_attempts,
            Duration::from_millis(self.store_retry_delay_ms),
        )
        .with_max_delay(Duration::from_secs(5))
        .with_jitter(0.1)
    }

    pub fn executor_limits(&self) -> ExecutorLimits {
        ExecutorLimits {
            kv_tx_limit: self.kv_tx_limit,
            broadcast_batch: self.broadcast_batch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectKind;
    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let config = HaConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, HaConfig::default());
        assert_eq!(config.delivery_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "node_name: ssu-1\nha_process: \"0x7200000000000001:0x9\"\nworker_threads: 2\nkv_tx_limit: 16"
        )
        .unwrap();
        let config = HaConfig::load(file.path()).unwrap();
        assert_eq!(config.node_name, "ssu-1");
        assert_eq!(config.ha_process, Some(ObjectId::of(ObjectKind::Process, 9)));
        assert_eq!(config.executor_limits().kv_tx_limit, 16);
        assert_eq!(config.broadcast_batch, 32);
    }

    #[test]
    fn rejects_zero_limits() {
        let err = HaConfig::from_yaml_str("broadcast_batch: 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = HaConfig::load(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
