use std::fmt;

/// Sequence number reserved for the poison handed out after shutdown.
pub(super) const SHUTDOWN_SEQ: u64 = u64::MAX;

/// Scheduling class of a command; drives group assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Waits for delivery confirmations; never forces a new group.
    DeliveryWait,
    /// Reply to a process joining the cluster; executed as soon as possible.
    Entrypoint,
    /// Pushes new HA states to the storage engine.
    Broadcast,
    /// Repair/rebalance control; two of them never share a group.
    SnsOperation,
    /// Process health change; two of them never share a group.
    ProcessEvent,
    Other,
    Poison,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::DeliveryWait => "delivery_wait",
            CommandKind::Entrypoint => "entrypoint",
            CommandKind::Broadcast => "broadcast",
            CommandKind::SnsOperation => "sns_operation",
            CommandKind::ProcessEvent => "process_event",
            CommandKind::Other => "other",
            CommandKind::Poison => "poison",
        };
        f.write_str(name)
    }
}

/// Implemented by payloads handed to the scheduler.
pub trait Schedulable: Send {
    fn kind(&self) -> CommandKind;
}

#[derive(Debug)]
pub enum Work<P> {
    Run(P),
    Stop,
}

/// A payload plus the group the scheduler placed it in. Callers never pick
/// the group.
#[derive(Debug)]
pub struct Command<P> {
    pub seq: u64,
    pub group: u64,
    pub work: Work<P>,
}

impl<P: Schedulable> Command<P> {
    pub fn kind(&self) -> CommandKind {
        match &self.work {
            Work::Run(payload) => payload.kind(),
            Work::Stop => CommandKind::Poison,
        }
    }
}

impl<P> Command<P> {
    pub fn is_poison(&self) -> bool {
        matches!(self.work, Work::Stop)
    }

    pub fn payload(&self) -> Option<&P> {
        match &self.work {
            Work::Run(payload) => Some(payload),
            Work::Stop => None,
        }
    }
}

/// Receipt returned by `submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    pub seq: u64,
    pub group: u64,
}
