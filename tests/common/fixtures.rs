#![allow(dead_code)]

use hacore::{
    Action, ActionBatch, KvTopology, MemoryKv, ObjectId, ObjectKind, ObjectState, ObjectWorkflow,
    PersistedRecord,
};
use std::sync::Arc;

pub const NODE: &str = "ssu-1";

pub fn process(key: u64) -> ObjectId {
    ObjectId::of(ObjectKind::Process, key)
}

pub fn service(key: u64) -> ObjectId {
    ObjectId::of(ObjectKind::Service, key)
}

pub fn drive(key: u64) -> ObjectId {
    ObjectId::of(ObjectKind::Drive, key)
}

pub fn process_key(id: ObjectId) -> String {
    format!("m0conf/nodes/{NODE}/processes/{id}")
}

pub fn put_record(kv: &MemoryKv, key: &str, record: PersistedRecord) {
    kv.insert(key, record.to_json());
}

pub fn put_process(kv: &MemoryKv, id: ObjectId, state: ObjectState) -> String {
    let key = process_key(id);
    put_record(kv, &key, PersistedRecord::new(state).with_field("name", "m0d"));
    key
}

pub fn put_child(kv: &MemoryKv, parent_key: &str, segment: &str, id: ObjectId, state: ObjectState) -> String {
    let key = format!("{parent_key}/{segment}/{id}");
    put_record(kv, &key, PersistedRecord::new(state));
    key
}

/// Process 1 (recovering) with service 10 (no drives) and service 11
/// (drives 20, 21); services and drives transient.
pub struct CascadeFixture {
    pub kv: Arc<MemoryKv>,
    pub process: ObjectId,
    pub process_key: String,
    pub services: Vec<ObjectId>,
    pub drives: Vec<ObjectId>,
}

impl CascadeFixture {
    pub fn new() -> Self {
        Self::with_process_state(ObjectState::Recovering)
    }

    pub fn with_process_state(state: ObjectState) -> Self {
        let kv = Arc::new(MemoryKv::new());
        let process_id = process(1);
        let pkey = put_process(&kv, process_id, state);
        put_child(&kv, &pkey, "services", service(10), ObjectState::Transient);
        let busy = put_child(&kv, &pkey, "services", service(11), ObjectState::Transient);
        put_child(&kv, &busy, "sdevs", drive(20), ObjectState::Transient);
        put_child(&kv, &busy, "sdevs", drive(21), ObjectState::Transient);
        Self {
            kv,
            process: process_id,
            process_key: pkey,
            services: vec![service(10), service(11)],
            drives: vec![drive(20), drive(21)],
        }
    }

    /// Rewrites the process record with extra fields.
    pub fn set_process_field(&self, name: &str, value: serde_json::Value) {
        let raw = self.kv.value(&self.process_key).expect("process record");
        let record = PersistedRecord::parse(&raw).expect("valid record");
        put_record(&self.kv, &self.process_key, record.with_field(name, value));
    }

    pub fn workflow(&self) -> ObjectWorkflow {
        workflow(&self.kv, None)
    }
}

pub fn workflow(kv: &Arc<MemoryKv>, ha_process: Option<ObjectId>) -> ObjectWorkflow {
    ObjectWorkflow::new(kv.clone(), Arc::new(KvTopology::new(ha_process)))
}

/// Writes every `SetState` of `batch` straight into the store.
pub fn apply(kv: &MemoryKv, batch: &ActionBatch) {
    for action in &batch.kv_ops {
        if let Action::SetState {
            store_key,
            serialized_value,
            ..
        } = action
        {
            kv.insert(store_key, serialized_value.clone());
        }
    }
}

pub fn stored_state(kv: &MemoryKv, key: &str) -> ObjectState {
    let raw = kv.value(key).expect("record present");
    PersistedRecord::parse(&raw)
        .and_then(|record| record.state())
        .expect("valid record")
}

pub fn broadcast_objects(batch: &ActionBatch) -> Vec<ObjectId> {
    batch.broadcasts().into_iter().map(|(object, _)| object).collect()
}
