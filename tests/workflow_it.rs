#[path = "common/fixtures.rs"]
mod fixtures;

use fixtures::{
    apply, broadcast_objects, drive, put_child, put_process, put_record, stored_state,
    workflow, CascadeFixture,
};
use hacore::{
    Action, MemoryKv, ObjectId, ObjectKind, ObjectState, PersistedRecord, WorkflowError,
};
use serde_json::json;
use std::sync::Arc;

#[test]
fn recovering_process_cascades_into_services_and_drives() {
    let fixture = CascadeFixture::new();
    let batch = fixture
        .workflow()
        .transit(fixture.process, ObjectState::Online)
        .unwrap();

    assert_eq!(batch.kv_ops.len(), 5);
    assert_eq!(batch.bcast_ops.len(), 5);
    assert!(batch
        .kv_ops
        .iter()
        .chain(batch.bcast_ops.iter())
        .all(|action| action.new_state() == ObjectState::Online));
    let mut expected = vec![fixture.process];
    expected.push(fixture.services[0]);
    expected.push(fixture.services[1]);
    expected.extend(fixture.drives.iter().copied());
    assert_eq!(broadcast_objects(&batch), expected);
}

#[test]
fn cascade_preserves_record_fields() {
    let fixture = CascadeFixture::new();
    fixture.set_process_field("pid", json!(4242));
    let batch = fixture
        .workflow()
        .transit(fixture.process, ObjectState::Online)
        .unwrap();
    let Action::SetState {
        store_key,
        serialized_value,
        ..
    } = &batch.kv_ops[0]
    else {
        panic!("first action must persist the process");
    };
    assert_eq!(store_key, &fixture.process_key);
    let record = PersistedRecord::parse(serialized_value).unwrap();
    assert_eq!(record.state().unwrap(), ObjectState::Online);
    assert_eq!(record.field("pid"), Some(&json!(4242)));
    assert_eq!(record.text("name"), Some("m0d"));
}

#[test]
fn same_state_is_a_noop_for_every_kind() {
    for kind in ObjectKind::ALL {
        for state in ObjectState::ALL {
            let kv = Arc::new(MemoryKv::new());
            let id = ObjectId::of(kind, 7);
            put_record(
                &kv,
                &format!("m0conf/{}/{id}", kind.segment()),
                PersistedRecord::new(state),
            );
            let batch = workflow(&kv, None).transit(id, state).unwrap();
            assert!(batch.is_empty(), "{kind} {state}");
        }
    }
}

#[test]
fn unmodeled_pairs_are_rejected_for_every_kind() {
    let allowed = |kind: ObjectKind, from: ObjectState, to: ObjectState| {
        use ObjectState::*;
        match kind {
            ObjectKind::Process => matches!(
                (from, to),
                (Transient, Recovering)
                    | (Transient, Failed)
                    | (Failed, Recovering)
                    | (Recovering, Online)
                    | (Recovering, Transient)
                    | (Online, Transient)
            ),
            ObjectKind::Service => matches!(
                (from, to),
                (Transient, Online) | (Online, Transient) | (Transient, Failed) | (Failed, Online)
            ),
            _ => matches!(
                (from, to),
                (Transient, Online)
                    | (Online, Transient)
                    | (Transient, Failed)
                    | (Failed, Online)
                    | (Online, Failed)
                    | (Failed, Repair)
                    | (Repair, Repaired)
                    | (Repaired, Rebalance)
                    | (Rebalance, Online)
            ),
        }
    };
    for kind in ObjectKind::ALL {
        for from in ObjectState::ALL {
            for to in ObjectState::ALL {
                if from == to || allowed(kind, from, to) {
                    continue;
                }
                let kv = Arc::new(MemoryKv::new());
                let id = ObjectId::of(kind, 3);
                put_record(
                    &kv,
                    &format!("m0conf/{}/{id}", kind.segment()),
                    PersistedRecord::new(from),
                );
                let err = workflow(&kv, None).transit(id, to).unwrap_err();
                assert!(
                    matches!(err, WorkflowError::TransitionNotAllowed { .. }),
                    "{kind} {from} -> {to}: {err}"
                );
            }
        }
    }
}

#[test]
fn applying_actions_makes_the_transition_idempotent() {
    let fixture = CascadeFixture::new();
    let workflow = fixture.workflow();
    let batch = workflow.transit(fixture.process, ObjectState::Online).unwrap();
    apply(&fixture.kv, &batch);
    assert_eq!(
        stored_state(&fixture.kv, &fixture.process_key),
        ObjectState::Online
    );
    let again = workflow.transit(fixture.process, ObjectState::Online).unwrap();
    assert!(again.is_empty());
}

#[test]
fn missing_record_is_a_business_logic_error() {
    let kv = Arc::new(MemoryKv::new());
    let err = workflow(&kv, None)
        .transit(drive(99), ObjectState::Online)
        .unwrap_err();
    assert!(matches!(err, WorkflowError::BusinessLogic(_)));
}

#[test]
fn corrupt_record_is_a_business_logic_error() {
    let kv = Arc::new(MemoryKv::new());
    let id = drive(5);
    kv.insert(&format!("m0conf/drives/{id}"), "{\"name\": \"no state\"}");
    let err = workflow(&kv, None)
        .transit(id, ObjectState::Online)
        .unwrap_err();
    assert!(matches!(err, WorkflowError::BusinessLogic(_)));
}

#[test]
fn unknown_kind_is_unsupported() {
    let kv = Arc::new(MemoryKv::new());
    let id = ObjectId::new(0x7700_0000_0000_0001, 1);
    let err = workflow(&kv, None)
        .transit(id, ObjectState::Online)
        .unwrap_err();
    assert!(matches!(err, WorkflowError::UnsupportedObject(found) if found == id));
}

#[test]
fn one_shot_process_keeps_its_drives_online() {
    let kv = Arc::new(MemoryKv::new());
    let mkfs = fixtures::process(2);
    let pkey = put_process(&kv, mkfs, ObjectState::Online);
    put_record(
        &kv,
        &pkey,
        PersistedRecord::new(ObjectState::Online).with_field("one_shot", true),
    );
    let skey = put_child(&kv, &pkey, "services", fixtures::service(30), ObjectState::Online);
    put_child(&kv, &skey, "sdevs", drive(31), ObjectState::Online);

    let batch = workflow(&kv, None)
        .transit(mkfs, ObjectState::Transient)
        .unwrap();
    assert_eq!(
        broadcast_objects(&batch),
        vec![mkfs, fixtures::service(30)]
    );
}

#[test]
fn regular_process_takes_drives_transient() {
    let fixture = CascadeFixture::with_process_state(ObjectState::Online);
    for service in &fixture.services {
        let key = format!(
            "{}/services/{service}",
            fixture.process_key
        );
        put_record(&fixture.kv, &key, PersistedRecord::new(ObjectState::Online));
    }
    let busy = format!("{}/services/{}", fixture.process_key, fixture.services[1]);
    for drive in &fixture.drives {
        put_record(
            &fixture.kv,
            &format!("{busy}/sdevs/{drive}"),
            PersistedRecord::new(ObjectState::Online),
        );
    }
    let batch = fixture
        .workflow()
        .transit(fixture.process, ObjectState::Transient)
        .unwrap();
    assert_eq!(batch.bcast_ops.len(), 5);
}

#[test]
fn client_process_does_not_cascade() {
    let fixture = CascadeFixture::new();
    fixture.set_process_field("role", json!("client"));
    let batch = fixture
        .workflow()
        .transit(fixture.process, ObjectState::Online)
        .unwrap();
    assert_eq!(broadcast_objects(&batch), vec![fixture.process]);
    assert_eq!(batch.kv_ops.len(), 1);
}

#[test]
fn ha_process_does_not_cascade() {
    let fixture = CascadeFixture::new();
    let batch = workflow(&fixture.kv, Some(fixture.process))
        .transit(fixture.process, ObjectState::Online)
        .unwrap();
    assert_eq!(broadcast_objects(&batch), vec![fixture.process]);
}

#[test]
fn transit_all_aborts_on_first_error() {
    let fixture = CascadeFixture::new();
    let result = fixture.workflow().transit_all(&[
        (fixture.process, ObjectState::Online),
        (drive(404), ObjectState::Online),
    ]);
    assert!(matches!(result, Err(WorkflowError::BusinessLogic(_))));
}

#[test]
fn transit_all_concatenates_batches() {
    let fixture = CascadeFixture::new();
    let batch = fixture
        .workflow()
        .transit_all(&[
            (fixture.drives[0], ObjectState::Online),
            (fixture.services[0], ObjectState::Failed),
        ])
        .unwrap();
    assert_eq!(
        broadcast_objects(&batch),
        vec![fixture.drives[0], fixture.services[0]]
    );
}

#[test]
fn failing_child_aborts_the_cascade() {
    let fixture = CascadeFixture::new();
    let busy = format!("{}/services/{}", fixture.process_key, fixture.services[1]);
    put_record(
        &fixture.kv,
        &format!("{busy}/sdevs/{}", fixture.drives[1]),
        PersistedRecord::new(ObjectState::Repair),
    );
    let err = fixture
        .workflow()
        .transit(fixture.process, ObjectState::Online)
        .unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::TransitionNotAllowed { object, .. } if object == fixture.drives[1]
    ));
}
