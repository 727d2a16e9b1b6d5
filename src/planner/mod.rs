//! Group-ordered command scheduling.
//!
//! Producers submit commands from any thread; the scheduler assigns each one
//! a group id under its single lock. Workers only ever receive commands of
//! the currently active group, so commands of different groups never run
//! concurrently while commands inside a group run in parallel. A group
//! becomes inactive once its last command is released, which happens when
//! the [`Assignment`] returned by [`CommandScheduler::take`] is dropped.

mod command;
mod pool;

pub use command::{Command, CommandKind, Schedulable, Submitted, Work};
pub use pool::{CommandHandler, WorkerPool};

use command::SHUTDOWN_SEQ;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Group ids wrap to zero at this value.
pub const GROUP_MODULUS: u64 = 100_000;

struct PlannerState<P> {
    current_group: u64,
    next_group: u64,
    next_group_kinds: HashSet<CommandKind>,
    backlog: VecDeque<Command<P>>,
    active: HashSet<u64>,
    next_seq: u64,
    shutdown: bool,
}

impl<P> PlannerState<P> {
    fn forming_group_empty(&self) -> bool {
        self.next_group_kinds.is_empty()
    }

    /// Picks the group for a command of `kind`; first matching rule wins.
    fn assign_group(&mut self, kind: CommandKind) -> u64 {
        let start_new = match kind {
            CommandKind::Poison => false,
            _ if self.forming_group_empty() => false,
            CommandKind::DeliveryWait => false,
            CommandKind::Entrypoint => {
                if self.next_group != self.current_group {
                    return self.current_group;
                }
                self.next_group_kinds.contains(&CommandKind::Broadcast)
            }
            CommandKind::Broadcast => true,
            CommandKind::SnsOperation | CommandKind::ProcessEvent => {
                self.next_group_kinds.contains(&kind)
            }
            CommandKind::Other => false,
        };
        if start_new {
            self.next_group = (self.next_group + 1) % GROUP_MODULUS;
            self.next_group_kinds.clear();
            if self.next_group == self.current_group {
                warn!(
                    "event=planner_group_collision group={} backlog={}",
                    self.next_group,
                    self.backlog.len()
                );
            }
        }
        if kind != CommandKind::Poison {
            self.next_group_kinds.insert(kind);
        }
        self.next_group
    }

    fn enqueue(&mut self, kind: CommandKind, work: Work<P>) -> Submitted {
        let group = self.assign_group(kind);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.backlog.push_back(Command { seq, group, work });
        debug!(
            "event=planner_submit seq={} kind={} group={} current={}",
            seq, kind, group, self.current_group
        );
        Submitted { seq, group }
    }

    fn take_current(&mut self) -> Option<Command<P>> {
        let current = self.current_group;
        let position = self.backlog.iter().position(|cmd| cmd.group == current)?;
        let command = self.backlog.remove(position)?;
        self.active.insert(command.seq);
        Some(command)
    }

    fn group_drained(&self) -> bool {
        self.active.is_empty()
            && !self
                .backlog
                .iter()
                .any(|cmd| cmd.group == self.current_group)
    }

    fn advance(&mut self) {
        let finished = self.current_group;
        self.current_group = (finished + 1) % GROUP_MODULUS;
        if self.next_group == finished {
            self.next_group = self.current_group;
            self.next_group_kinds.clear();
        }
        debug!(
            "event=planner_group_advanced finished={} current={} next={}",
            finished, self.current_group, self.next_group
        );
    }
}

pub struct CommandScheduler<P> {
    state: Mutex<PlannerState<P>>,
    wakeup: Condvar,
}

impl<P> Default for CommandScheduler<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> CommandScheduler<P> {
    pub fn new() -> Self {
        Self::with_group_cursor(0, 0)
    }

    /// Scheduler whose active and forming groups start at the given ids.
    pub fn with_group_cursor(current_group: u64, next_group: u64) -> Self {
        Self {
            state: Mutex::new(PlannerState {
                current_group: current_group % GROUP_MODULUS,
                next_group: next_group % GROUP_MODULUS,
                next_group_kinds: HashSet::new(),
                backlog: VecDeque::new(),
                active: HashSet::new(),
                next_seq: 0,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        }
    }

    /// Enqueues a poison command in the forming group; the worker that takes
    /// it exits.
    pub fn submit_poison(&self) -> Submitted {
        let submitted = self.state.lock().enqueue(CommandKind::Poison, Work::Stop);
        self.wakeup.notify_all();
        submitted
    }

    /// Blocks until a command of the active group is available. After
    /// [`shutdown`](Self::shutdown) this returns a poison immediately.
    pub fn take(&self) -> Assignment<'_, P> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return self.shutdown_poison(state.current_group);
            }
            if let Some(command) = state.take_current() {
                return Assignment {
                    scheduler: self,
                    command,
                };
            }
            self.wakeup.wait(&mut state);
        }
    }

    /// Like [`take`](Self::take) but gives up after `timeout`.
    pub fn take_timeout(&self, timeout: Duration) -> Option<Assignment<'_, P>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return Some(self.shutdown_poison(state.current_group));
            }
            if let Some(command) = state.take_current() {
                return Some(Assignment {
                    scheduler: self,
                    command,
                });
            }
            if self.wakeup.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
    }

    /// Idempotent. Wakes every blocked `take`.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if !state.shutdown {
            state.shutdown = true;
            info!(
                "event=planner_shutdown backlog={} active={}",
                state.backlog.len(),
                state.active.len()
            );
        }
        drop(state);
        self.wakeup.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    pub fn current_group(&self) -> u64 {
        self.state.lock().current_group
    }

    pub fn backlog_len(&self) -> usize {
        self.state.lock().backlog.len()
    }

    pub fn active_len(&self) -> usize {
        self.state.lock().active.len()
    }

    fn shutdown_poison(&self, group: u64) -> Assignment<'_, P> {
        Assignment {
            scheduler: self,
            command: Command {
                seq: SHUTDOWN_SEQ,
                group,
                work: Work::Stop,
            },
        }
    }

    fn release(&self, seq: u64) {
        if seq == SHUTDOWN_SEQ {
            return;
        }
        let mut state = self.state.lock();
        if !state.active.remove(&seq) {
            warn!("event=planner_release_unknown seq={}", seq);
            return;
        }
        if state.group_drained() {
            state.advance();
        }
        drop(state);
        self.wakeup.notify_all();
    }
}

impl<P: Schedulable> CommandScheduler<P> {
    pub fn submit(&self, payload: P) -> Submitted {
        let kind = payload.kind();
        let submitted = self.state.lock().enqueue(kind, Work::Run(payload));
        self.wakeup.notify_all();
        submitted
    }
}

/// A taken command. Dropping it releases the command, so the group advances
/// even when the worker bails out early or panics.
pub struct Assignment<'a, P> {
    scheduler: &'a CommandScheduler<P>,
    command: Command<P>,
}

impl<P> Assignment<'_, P> {
    pub fn command(&self) -> &Command<P> {
        &self.command
    }

    pub fn payload(&self) -> Option<&P> {
        self.command.payload()
    }

    pub fn is_poison(&self) -> bool {
        self.command.is_poison()
    }

    pub fn seq(&self) -> u64 {
        self.command.seq
    }

    pub fn group(&self) -> u64 {
        self.command.group
    }
}

impl<P> Drop for Assignment<'_, P> {
    fn drop(&mut self) {
        self.scheduler.release(self.command.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Job(CommandKind);

    impl Schedulable for Job {
        fn kind(&self) -> CommandKind {
            self.0
        }
    }

    fn groups(scheduler: &CommandScheduler<Job>, kinds: &[CommandKind]) -> Vec<u64> {
        kinds
            .iter()
            .map(|kind| scheduler.submit(Job(*kind)).group)
            .collect()
    }

    #[test]
    fn delivery_waits_never_split_groups() {
        use CommandKind::*;
        let scheduler = CommandScheduler::new();
        assert_eq!(
            groups(&scheduler, &[Broadcast, DeliveryWait, DeliveryWait, Other]),
            vec![0, 0, 0, 0]
        );
    }

    #[test]
    fn mutating_kinds_do_not_share_a_group() {
        use CommandKind::*;
        let scheduler = CommandScheduler::new();
        assert_eq!(
            groups(&scheduler, &[SnsOperation, ProcessEvent, SnsOperation, ProcessEvent]),
            vec![0, 0, 1, 1]
        );
    }

    #[test]
    fn entrypoint_after_broadcast_starts_new_group() {
        use CommandKind::*;
        let scheduler = CommandScheduler::new();
        assert_eq!(groups(&scheduler, &[Broadcast, Entrypoint]), vec![0, 1]);
    }

    #[test]
    fn poison_joins_forming_group() {
        use CommandKind::*;
        let scheduler = CommandScheduler::new();
        groups(&scheduler, &[Broadcast, Broadcast]);
        assert_eq!(scheduler.submit_poison().group, 1);
    }

    #[test]
    fn later_group_waits_for_release() {
        use CommandKind::*;
        let scheduler = CommandScheduler::new();
        groups(&scheduler, &[Broadcast, Broadcast]);
        let first = scheduler.take();
        assert_eq!(first.group(), 0);
        assert!(scheduler.take_timeout(Duration::from_millis(20)).is_none());
        drop(first);
        let second = scheduler.take_timeout(Duration::from_millis(20)).unwrap();
        assert_eq!(second.group(), 1);
    }

    #[test]
    fn shutdown_poison_release_is_a_noop() {
        let scheduler: CommandScheduler<Job> = CommandScheduler::new();
        scheduler.shutdown();
        scheduler.shutdown();
        let poison = scheduler.take();
        assert!(poison.is_poison());
        drop(poison);
        assert_eq!(scheduler.current_group(), 0);
        assert_eq!(scheduler.active_len(), 0);
    }
}
