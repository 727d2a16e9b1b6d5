use super::WorkflowError;
use crate::kv::ReadCache;
use crate::object::ObjectId;
use im::OrdMap;
use std::fmt;
use std::sync::Arc;

/// Id of the process whose cascade is being computed.
pub const PARENT_PROCESS: &str = "parent_process";
/// Store key of the closest enclosing object.
pub const PARENT_KEY: &str = "parent_key";
/// Whether the enclosing process is a one-shot initializer.
pub const PARENT_ONE_SHOT: &str = "parent_one_shot";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextValue {
    Text(String),
    Flag(bool),
    Object(ObjectId),
}

impl ContextValue {
    fn type_name(&self) -> &'static str {
        match self {
            ContextValue::Text(_) => "text",
            ContextValue::Flag(_) => "flag",
            ContextValue::Object(_) => "object",
        }
    }
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        ContextValue::Text(value.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(value: String) -> Self {
        ContextValue::Text(value)
    }
}

impl From<bool> for ContextValue {
    fn from(value: bool) -> Self {
        ContextValue::Flag(value)
    }
}

impl From<ObjectId> for ContextValue {
    fn from(value: ObjectId) -> Self {
        ContextValue::Object(value)
    }
}

/// Facts handed from a parent transition to the nested ones.
///
/// `put` returns a new context and leaves `self` untouched, so sibling
/// cascades never observe each other's additions. All contexts derived from
/// one root share the root's [`ReadCache`].
#[derive(Clone)]
pub struct TransitionContext {
    values: OrdMap<String, ContextValue>,
    cache: Arc<ReadCache>,
}

impl TransitionContext {
    pub fn new(cache: Arc<ReadCache>) -> Self {
        Self {
            values: OrdMap::new(),
            cache,
        }
    }

    pub fn cache(&self) -> &ReadCache {
        &self.cache
    }

    pub fn put(&self, key: &str, value: impl Into<ContextValue>) -> Self {
        Self {
            values: self.values.update(key.to_string(), value.into()),
            cache: self.cache.clone(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn text(&self, key: &str) -> Result<Option<&str>, WorkflowError> {
        match self.get(key) {
            None => Ok(None),
            Some(ContextValue::Text(value)) => Ok(Some(value)),
            Some(other) => Err(mismatch(key, "text", other)),
        }
    }

    /// Absent flags read as `false`.
    pub fn flag(&self, key: &str) -> Result<bool, WorkflowError> {
        match self.get(key) {
            None => Ok(false),
            Some(ContextValue::Flag(value)) => Ok(*value),
            Some(other) => Err(mismatch(key, "flag", other)),
        }
    }

    pub fn object(&self, key: &str) -> Result<Option<ObjectId>, WorkflowError> {
        match self.get(key) {
            None => Ok(None),
            Some(ContextValue::Object(value)) => Ok(Some(*value)),
            Some(other) => Err(mismatch(key, "object", other)),
        }
    }
}

impl fmt::Debug for TransitionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionContext")
            .field("values", &self.values)
            .finish_non_exhaustive()
    }
}

fn mismatch(key: &str, expected: &str, found: &ContextValue) -> WorkflowError {
    WorkflowError::BusinessLogic(format!(
        "context key {key} holds a {} value, {expected} expected",
        found.type_name()
    ))
}
