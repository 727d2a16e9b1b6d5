use crate::kv::{ReadCache, StoreError};
use crate::object::{ObjectId, ObjectKind, PersistedRecord};
use log::debug;

/// Root of every persisted object record.
pub const CONF_ROOT: &str = "m0conf/";

const PATH_FIELD: &str = "path";

/// Locates records and structural children of cluster objects.
pub trait Topology: Send + Sync {
    /// Store key of the object's record, if the object is known.
    fn record_key(&self, object: ObjectId, cache: &ReadCache) -> Result<Option<String>, StoreError>;

    /// Objects directly contained in `object`, whose record lives at `key`.
    fn children(
        &self,
        object: ObjectId,
        key: &str,
        cache: &ReadCache,
    ) -> Result<Vec<ObjectId>, StoreError>;

    /// True for the process running this HA agent.
    fn is_ha_process(&self, process: ObjectId) -> bool;

    /// Storage device hosted on `node` whose record carries `path`.
    fn device_by_path(
        &self,
        node: &str,
        path: &str,
        cache: &ReadCache,
    ) -> Result<Option<ObjectId>, StoreError>;
}

/// Topology read straight from the `m0conf/` key layout:
///
/// ```text
/// m0conf/nodes/<node>/processes/<process>
/// m0conf/nodes/<node>/processes/<process>/services/<service>
/// m0conf/nodes/<node>/processes/<process>/services/<service>/sdevs/<drive>
/// ```
///
/// Any other object may live anywhere under `m0conf/` as long as its id is
/// the last path segment. Device records name their block device in a
/// `path` field.
#[derive(Debug, Clone, Default)]
pub struct KvTopology {
    ha_process: Option<ObjectId>,
}

impl KvTopology {
    pub fn new(ha_process: Option<ObjectId>) -> Self {
        Self { ha_process }
    }
}

fn last_segment_id(key: &str) -> Option<ObjectId> {
    key.rsplit('/').next()?.parse().ok()
}

fn child_segment(kind: ObjectKind) -> Option<&'static str> {
    match kind {
        ObjectKind::Process => Some("services"),
        ObjectKind::Service => Some("sdevs"),
        _ => None,
    }
}

impl Topology for KvTopology {
    fn record_key(&self, object: ObjectId, cache: &ReadCache) -> Result<Option<String>, StoreError> {
        let entries = cache.get_prefix(CONF_ROOT)?;
        Ok(entries
            .into_iter()
            .find(|entry| last_segment_id(&entry.key) == Some(object))
            .map(|entry| entry.key))
    }

    fn children(
        &self,
        object: ObjectId,
        key: &str,
        cache: &ReadCache,
    ) -> Result<Vec<ObjectId>, StoreError> {
        let Some(segment) = object.kind().ok().and_then(child_segment) else {
            return Ok(Vec::new());
        };
        let prefix = format!("{key}/{segment}/");
        let entries = cache.get_prefix(&prefix)?;
        Ok(entries
            .iter()
            .filter_map(|entry| entry.key.strip_prefix(prefix.as_str()))
            .filter(|rest| !rest.contains('/'))
            .filter_map(|rest| rest.parse().ok())
            .collect())
    }

    fn is_ha_process(&self, process: ObjectId) -> bool {
        self.ha_process == Some(process)
    }

    fn device_by_path(
        &self,
        node: &str,
        path: &str,
        cache: &ReadCache,
    ) -> Result<Option<ObjectId>, StoreError> {
        let entries = cache.get_prefix(&format!("{CONF_ROOT}nodes/{node}/"))?;
        for entry in entries.iter().filter(|entry| entry.key.contains("/sdevs/")) {
            let Some(device) = last_segment_id(&entry.key) else {
                continue;
            };
            match PersistedRecord::parse(&entry.value) {
                Ok(record) if record.text(PATH_FIELD) == Some(path) => return Ok(Some(device)),
                Ok(_) => {}
                Err(err) => debug!(
                    "event=topology_record_unreadable key={} error={}",
                    entry.key, err
                ),
            }
        }
        Ok(None)
    }
}
