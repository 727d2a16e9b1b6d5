use crate::timeouts::DEFAULT_LEADER_SETTLE;
use log::{debug, info};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    #[error("application is shutting down")]
    Interrupted,
}

struct GateState {
    stopping: bool,
    leader: bool,
    pause_needed: bool,
}

/// Lets the singleton queue processor run only while this node leads.
///
/// After leadership is (re)acquired the first [`ensure_allowed`] waits a
/// settle delay so a former leader can finish the message it was handling.
/// Losing leadership never interrupts work in flight; the processor simply
/// blocks on its next `ensure_allowed`.
///
/// [`ensure_allowed`]: Synchronizer::ensure_allowed
pub struct Synchronizer {
    state: Mutex<GateState>,
    changed: Condvar,
    settle: Duration,
}

impl Default for Synchronizer {
    fn default() -> Self {
        Self::new(DEFAULT_LEADER_SETTLE)
    }
}

impl Synchronizer {
    pub fn new(settle: Duration) -> Self {
        Self {
            state: Mutex::new(GateState {
                stopping: false,
                leader: false,
                pause_needed: true,
            }),
            changed: Condvar::new(),
            settle,
        }
    }

    pub fn ensure_allowed(&self) -> Result<(), GateError> {
        let mut state = self.state.lock();
        loop {
            if state.stopping {
                return Err(GateError::Interrupted);
            }
            if !state.leader {
                self.changed.wait(&mut state);
                continue;
            }
            if !state.pause_needed {
                return Ok(());
            }
            state.pause_needed = false;
            debug!(
                "event=leader_settle_wait settle_ms={}",
                self.settle.as_millis()
            );
            let deadline = Instant::now() + self.settle;
            while !state.stopping && state.leader && !state.pause_needed {
                if self.changed.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
        }
    }

    /// Records the latest leadership poll. Sleepers are only woken when the
    /// value actually changes.
    pub fn set_leader(&self, is_leader: bool) {
        let mut state = self.state.lock();
        let was = state.leader;
        if was == is_leader {
            return;
        }
        state.leader = is_leader;
        state.pause_needed = true;
        if is_leader {
            info!("event=leadership_acquired");
        } else {
            info!("event=leadership_lost");
        }
        drop(state);
        self.changed.notify_all();
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().leader
    }

    /// Blocks for up to `timeout`; wakes early on leadership changes and
    /// fails once the gate is stopped.
    pub fn sleep(&self, timeout: Duration) -> Result<(), GateError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        if !state.stopping {
            self.changed.wait_until(&mut state, deadline);
        }
        if state.stopping {
            return Err(GateError::Interrupted);
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.state.lock().stopping = true;
        self.changed.notify_all();
    }

    pub fn is_stopping(&self) -> bool {
        self.state.lock().stopping
    }
}
