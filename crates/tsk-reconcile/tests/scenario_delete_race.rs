use serde_json::json;
use tsk_reconcile::*;

fn seeded() -> ReconcileStore {
    let mut store = ReconcileStore::new();
    store
        .apply(StoreEvent::Resync(
            normalize_list(&json!({"tasks": [
                {"id": "srv-4", "title": "four"},
                {"id": "srv-5", "title": "five"},
            ]}))
            .collect::<Result<Vec<_>, _>>()
            .unwrap(),
        ))
        .unwrap();
    store
}

#[test]
fn scenario_stale_push_after_local_delete_is_noop() {
    let mut store = seeded();
    store
        .apply(StoreEvent::LocalDelete {
            identity: "srv-5".to_string(),
        })
        .unwrap();
    assert!(store.view().get("srv-5").is_none());
    let version = store.view().version();

    let stale = StoreEvent::from_push(
        PushKind::Updated,
        &json!({"id": "srv-5", "title": "five (edited)"}),
    )
    .unwrap();
    let applied = store.apply(stale).unwrap();

    assert!(!applied.emitted());
    assert!(store.view().get("srv-5").is_none());
    assert_eq!(store.view().version(), version);
}

#[test]
fn scenario_rejected_delete_reinserts_with_latest_remote_fields() {
    let mut store = seeded();
    store
        .apply(StoreEvent::LocalDelete {
            identity: "srv-5".to_string(),
        })
        .unwrap();
    store
        .apply(StoreEvent::PushUpdated(
            normalize_record(&json!({"id": "srv-5", "completed": true})).unwrap(),
        ))
        .unwrap();

    store
        .apply(StoreEvent::RestRejectDelete {
            identity: "srv-5".to_string(),
            reason: "forbidden".to_string(),
        })
        .unwrap();

    let view = store.view();
    let ids: Vec<&str> = view.iter().map(|r| r.identity.as_str()).collect();
    assert_eq!(ids, vec!["srv-4", "srv-5"]);
    assert!(view.get("srv-5").unwrap().completed());
}

#[test]
fn scenario_push_delete_for_unknown_identity_is_not_an_error() {
    let mut store = seeded();
    let ev = StoreEvent::from_push(PushKind::Deleted, &json!({"id": 77})).unwrap();
    let applied = store.apply(ev).unwrap();
    assert!(!applied.emitted());
    assert_eq!(store.view().len(), 2);
}
