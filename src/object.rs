//! Cluster object identity and HA state.
//!
//! Every object that participates in HA (processes, services, drives,
//! enclosures, controllers, nodes) is addressed by an [`ObjectId`] whose
//! container half encodes the object kind. Persisted records are JSON
//! documents whose `state` field is rewritten by the workflow while every
//! other field is carried over untouched.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const PROCESS_TAG: u64 = 0x7200_0000_0000_0001;
const SERVICE_TAG: u64 = 0x7300_0000_0000_0001;
const SDEV_TAG: u64 = 0x6400_0000_0000_0001;
const DRIVE_TAG: u64 = 0x6b00_0000_0000_0001;
const NODE_TAG: u64 = 0x6e00_0000_0000_0001;
const ENCLOSURE_TAG: u64 = 0x6500_0000_0000_0001;
const CONTROLLER_TAG: u64 = 0x6300_0000_0000_0001;

const STATE_FIELD: &str = "state";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObjectError {
    #[error("malformed object id {0:?}")]
    MalformedId(String),
    #[error("unknown object kind tag {0:#x}")]
    UnknownKind(u64),
    #[error("unknown object state {0:?}")]
    UnknownState(String),
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record has no state field")]
    MissingState,
    #[error("record is not valid JSON: {0}")]
    Json(String),
}

/// Typed identifier of a cluster object: `(kind tag, key)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId {
    pub container: u64,
    pub key: u64,
}

impl ObjectId {
    pub const fn new(container: u64, key: u64) -> Self {
        Self { container, key }
    }

    pub const fn of(kind: ObjectKind, key: u64) -> Self {
        Self::new(kind.tag(), key)
    }

    /// `0:0`, sent when the reporter could not name the object.
    pub const fn is_null(&self) -> bool {
        self.container == 0 && self.key == 0
    }

    pub fn kind(&self) -> Result<ObjectKind, ObjectError> {
        ObjectKind::from_tag(self.container)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}:{:#x}", self.container, self.key)
    }
}

impl FromStr for ObjectId {
    type Err = ObjectError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let malformed = || ObjectError::MalformedId(raw.to_string());
        let (container, key) = raw.trim().split_once(':').ok_or_else(malformed)?;
        let parse = |part: &str| {
            let digits = part
                .strip_prefix("0x")
                .or_else(|| part.strip_prefix("0X"))
                .unwrap_or(part);
            u64::from_str_radix(digits, 16).map_err(|_| malformed())
        };
        Ok(Self::new(parse(container)?, parse(key)?))
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Closed set of object kinds that carry HA state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Process,
    Service,
    Sdev,
    Drive,
    Node,
    Enclosure,
    Controller,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 7] = [
        ObjectKind::Process,
        ObjectKind::Service,
        ObjectKind::Sdev,
        ObjectKind::Drive,
        ObjectKind::Node,
        ObjectKind::Enclosure,
        ObjectKind::Controller,
    ];

    pub const fn tag(self) -> u64 {
        match self {
            ObjectKind::Process => PROCESS_TAG,
            ObjectKind::Service => SERVICE_TAG,
            ObjectKind::Sdev => SDEV_TAG,
            ObjectKind::Drive => DRIVE_TAG,
            ObjectKind::Node => NODE_TAG,
            ObjectKind::Enclosure => ENCLOSURE_TAG,
            ObjectKind::Controller => CONTROLLER_TAG,
        }
    }

    pub fn from_tag(tag: u64) -> Result<Self, ObjectError> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.tag() == tag)
            .ok_or(ObjectError::UnknownKind(tag))
    }

    /// Path segment under which records of this kind are stored.
    pub fn segment(self) -> &'static str {
        match self {
            ObjectKind::Process => "processes",
            ObjectKind::Service => "services",
            ObjectKind::Sdev => "sdevs",
            ObjectKind::Drive => "drives",
            ObjectKind::Node => "nodes",
            ObjectKind::Enclosure => "encls",
            ObjectKind::Controller => "ctrls",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::Process => "process",
            ObjectKind::Service => "service",
            ObjectKind::Sdev => "sdev",
            ObjectKind::Drive => "drive",
            ObjectKind::Node => "node",
            ObjectKind::Enclosure => "enclosure",
            ObjectKind::Controller => "controller",
        }
    }

    pub fn is_storage_device(self) -> bool {
        matches!(self, ObjectKind::Sdev | ObjectKind::Drive)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// HA state of an object as understood by the storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectState {
    #[serde(rename = "M0_NC_UNKNOWN")]
    Unknown,
    #[serde(rename = "M0_NC_ONLINE")]
    Online,
    #[serde(rename = "M0_NC_FAILED")]
    Failed,
    #[serde(rename = "M0_NC_TRANSIENT")]
    Transient,
    #[serde(rename = "M0_NC_REPAIR")]
    Repair,
    #[serde(rename = "M0_NC_REPAIRED")]
    Repaired,
    #[serde(rename = "M0_NC_REBALANCE")]
    Rebalance,
    #[serde(rename = "M0_NC_DTM_RECOVERING")]
    Recovering,
}

impl ObjectState {
    pub const ALL: [ObjectState; 8] = [
        ObjectState::Unknown,
        ObjectState::Online,
        ObjectState::Failed,
        ObjectState::Transient,
        ObjectState::Repair,
        ObjectState::Repaired,
        ObjectState::Rebalance,
        ObjectState::Recovering,
    ];

    /// Numeric code carried in broadcasts.
    pub const fn code(self) -> u32 {
        match self {
            ObjectState::Unknown => 0,
            ObjectState::Online => 1,
            ObjectState::Failed => 2,
            ObjectState::Transient => 3,
            ObjectState::Repair => 4,
            ObjectState::Repaired => 5,
            ObjectState::Rebalance => 6,
            ObjectState::Recovering => 7,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.code() == code)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ObjectState::Unknown => "M0_NC_UNKNOWN",
            ObjectState::Online => "M0_NC_ONLINE",
            ObjectState::Failed => "M0_NC_FAILED",
            ObjectState::Transient => "M0_NC_TRANSIENT",
            ObjectState::Repair => "M0_NC_REPAIR",
            ObjectState::Repaired => "M0_NC_REPAIRED",
            ObjectState::Rebalance => "M0_NC_REBALANCE",
            ObjectState::Recovering => "M0_NC_DTM_RECOVERING",
        }
    }
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectState {
    type Err = ObjectError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == raw)
            .ok_or_else(|| ObjectError::UnknownState(raw.to_string()))
    }
}

/// JSON document persisted for one object.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedRecord {
    fields: Map<String, Value>,
}

impl PersistedRecord {
    pub fn new(state: ObjectState) -> Self {
        let mut fields = Map::new();
        fields.insert(STATE_FIELD.into(), Value::String(state.as_str().into()));
        Self { fields }
    }

    pub fn parse(raw: &str) -> Result<Self, ObjectError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|err| ObjectError::Json(err.to_string()))?;
        match value {
            Value::Object(fields) => {
                let record = Self { fields };
                record.state()?;
                Ok(record)
            }
            _ => Err(ObjectError::NotAnObject),
        }
    }

    pub fn state(&self) -> Result<ObjectState, ObjectError> {
        match self.fields.get(STATE_FIELD) {
            Some(Value::String(raw)) => raw.parse(),
            Some(other) => Err(ObjectError::UnknownState(other.to_string())),
            None => Err(ObjectError::MissingState),
        }
    }

    /// Copy of this record with `state` replaced; all other fields are kept.
    pub fn with_state(&self, state: ObjectState) -> Self {
        let mut fields = self.fields.clone();
        fields.insert(STATE_FIELD.into(), Value::String(state.as_str().into()));
        Self { fields }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn flag(&self, name: &str) -> bool {
        matches!(self.fields.get(name), Some(Value::Bool(true)))
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.fields.clone()).to_string()
    }
}
