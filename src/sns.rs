//! Repair and rebalance operations on storage pools.

use crate::object::ObjectId;
use crate::util::HaError;
use log::info;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown SNS operation: {0}")]
pub struct UnknownSnsOp(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnsKind {
    Repair,
    Rebalance,
}

impl SnsKind {
    fn name(self) -> &'static str {
        match self {
            SnsKind::Repair => "repair",
            SnsKind::Rebalance => "rebalance",
        }
    }
}

impl fmt::Display for SnsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnsAction {
    Start,
    Stop,
    Pause,
    Resume,
}

impl SnsAction {
    const ALL: [SnsAction; 4] = [
        SnsAction::Start,
        SnsAction::Stop,
        SnsAction::Pause,
        SnsAction::Resume,
    ];

    fn name(self) -> &'static str {
        match self {
            SnsAction::Start => "start",
            SnsAction::Stop => "stop",
            SnsAction::Pause => "pause",
            SnsAction::Resume => "resume",
        }
    }
}

/// Operation requested on a pool, named on the wire as `repair-start`,
/// `rebalance-pause`, `disk-attach` and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnsOp {
    Run(SnsKind, SnsAction),
    DiskAttach,
    DiskDetach,
}

impl fmt::Display for SnsOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnsOp::Run(kind, action) => write!(f, "{}-{}", kind.name(), action.name()),
            SnsOp::DiskAttach => f.write_str("disk-attach"),
            SnsOp::DiskDetach => f.write_str("disk-detach"),
        }
    }
}

impl FromStr for SnsOp {
    type Err = UnknownSnsOp;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "disk-attach" => return Ok(SnsOp::DiskAttach),
            "disk-detach" => return Ok(SnsOp::DiskDetach),
            _ => {}
        }
        let unknown = || UnknownSnsOp(raw.to_string());
        let (kind, action) = raw.split_once('-').ok_or_else(unknown)?;
        let kind = match kind {
            "repair" => SnsKind::Repair,
            "rebalance" => SnsKind::Rebalance,
            _ => return Err(unknown()),
        };
        let action = SnsAction::ALL
            .into_iter()
            .find(|candidate| candidate.name() == action)
            .ok_or_else(unknown)?;
        Ok(SnsOp::Run(kind, action))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SnsStatus {
    Idle,
    Running,
    Paused,
    Stopped,
}

/// One entry of a repair or rebalance status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnsProgress {
    pub fid: ObjectId,
    pub status: SnsStatus,
}

/// Engine-side control of repair and rebalance.
pub trait SnsControl: Send + Sync {
    fn apply(&self, pool: ObjectId, op: SnsOp) -> Result<(), HaError>;
    fn status(&self, pool: ObjectId, kind: SnsKind) -> Result<Vec<SnsProgress>, HaError>;
}

/// Control without an engine behind it: logs each operation and reports
/// the status the requests so far imply.
#[derive(Debug, Default)]
pub struct TrackingSnsControl {
    status: Mutex<HashMap<(ObjectId, SnsKind), SnsStatus>>,
}

impl SnsControl for TrackingSnsControl {
    fn apply(&self, pool: ObjectId, op: SnsOp) -> Result<(), HaError> {
        info!("event=sns_operation pool={} op={}", pool, op);
        if let SnsOp::Run(kind, action) = op {
            let status = match action {
                SnsAction::Start | SnsAction::Resume => SnsStatus::Running,
                SnsAction::Pause => SnsStatus::Paused,
                SnsAction::Stop => SnsStatus::Stopped,
            };
            self.status.lock().insert((pool, kind), status);
        }
        Ok(())
    }

    fn status(&self, pool: ObjectId, kind: SnsKind) -> Result<Vec<SnsProgress>, HaError> {
        let status = self
            .status
            .lock()
            .get(&(pool, kind))
            .copied()
            .unwrap_or(SnsStatus::Idle);
        Ok(vec![SnsProgress { fid: pool, status }])
    }
}
