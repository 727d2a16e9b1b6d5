use super::gate::Synchronizer;
use crate::kv::{KvStore, StoreError};
use log::{debug, info};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Key whose session identifies the elected leader.
pub const LEADER_KEY: &str = "leader";

/// Polls the leader key and feeds the result into a [`Synchronizer`].
pub struct LeaderMonitor {
    store: Arc<dyn KvStore>,
    gate: Arc<Synchronizer>,
    local_node: String,
    poll: Duration,
}

impl LeaderMonitor {
    pub fn new(
        store: Arc<dyn KvStore>,
        gate: Arc<Synchronizer>,
        local_node: impl Into<String>,
        poll: Duration,
    ) -> Self {
        Self {
            store,
            gate,
            local_node: local_node.into(),
            poll,
        }
    }

    /// Node currently holding the leader key's session, if any.
    pub fn current_leader(&self) -> Result<Option<String>, StoreError> {
        let Some(entry) = self.store.get(LEADER_KEY)? else {
            return Ok(None);
        };
        match entry.session {
            Some(session) => self.store.session_node(&session),
            None => Ok(None),
        }
    }

    pub fn poll_once(&self) -> Result<bool, StoreError> {
        let leader = self.current_leader()?;
        let is_leader = leader.as_deref() == Some(self.local_node.as_str());
        self.gate.set_leader(is_leader);
        Ok(is_leader)
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("leader-monitor".into())
            .spawn(move || self.run())
    }

    fn run(self) {
        info!("event=leader_monitor_started node={}", self.local_node);
        loop {
            if let Err(err) = self.poll_once() {
                debug!("event=leader_poll_failed error={}", err);
            }
            if self.gate.sleep(self.poll).is_err() {
                break;
            }
        }
        info!("event=leader_monitor_stopped node={}", self.local_node);
    }
}
