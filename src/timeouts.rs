//! Centralized timeout and polling defaults.
//!
//! Config fields fall back to these values; background loops that run
//! without a config (tests, the simulator) use them directly.

use std::time::Duration;

/// How long a caller waits for the storage engine to confirm a broadcast.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a queue message waits for a worker to run its command.
pub const DEFAULT_COMMAND_REPLY: Duration = Duration::from_secs(60);
/// How long a confirmation nobody waited for is kept.
pub const DEFAULT_UNSORTED_TTL: Duration = Duration::from_secs(30);
/// Quiet period after leadership is acquired before the queue is drained.
pub const DEFAULT_LEADER_SETTLE: Duration = Duration::from_secs(2);
/// Pause between polls of an empty event queue.
pub const DEFAULT_QUEUE_POLL: Duration = Duration::from_millis(500);
/// Interval between reads of the leader key.
pub const DEFAULT_LEADER_POLL: Duration = Duration::from_secs(1);
/// Base delay of the store retry policy.
pub const DEFAULT_STORE_RETRY_DELAY: Duration = Duration::from_millis(250);
