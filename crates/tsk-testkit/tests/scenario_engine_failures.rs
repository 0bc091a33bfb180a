use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tsk_reconcile::ReconcileStore;
use tsk_runtime::{spawn_engine, EngineConfig, EngineError, MutationOutcome, NoticeKind};
use tsk_testkit::*;
use tsk_transport::{PaperOp, PaperServer, PushFrame, TransportError};

fn config() -> EngineConfig {
    EngineConfig {
        reconnect_delay: Some(Duration::from_millis(20)),
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn scenario_rejected_create_rolls_back_with_notice() {
    let server = Arc::new(PaperServer::new());
    server.fail_next(PaperOp::Create, TransportError::rejected(500, "db down"));
    let handle = spawn_engine(ReconcileStore::new(), server.clone(), server.clone(), config());
    let mut notices = handle.notices();

    let m = handle.create(titled("doomed")).await.unwrap();
    assert!(m.identity.starts_with("local-"));
    assert_eq!(m.settled().await, MutationOutcome::Rejected("db down".to_string()));

    assert!(handle.view().is_empty());
    let n = wait_for_notice(&mut notices, NoticeKind::RolledBack)
        .await
        .expect("rollback notice");
    assert!(n.message.contains("db down"));

    handle.shutdown().await;
}

#[tokio::test]
async fn scenario_rejected_update_reverts_and_rejected_delete_restores() {
    let server = Arc::new(PaperServer::new());
    server.external_create(fields(json!({"title": "Water plants", "completed": false})));
    let handle = spawn_engine(ReconcileStore::new(), server.clone(), server.clone(), config());
    let mut views = handle.subscribe();
    wait_for_view(&mut views, |v| v.len() == 1).await.expect("loaded");

    server.fail_next(PaperOp::Update, TransportError::rejected(409, "stale"));
    let m = handle
        .update("srv-1", fields(json!({"completed": true})))
        .await
        .unwrap();
    assert_eq!(m.settled().await, MutationOutcome::Rejected("stale".to_string()));
    assert!(!handle.view().get("srv-1").unwrap().completed());

    server.fail_next(PaperOp::Delete, TransportError::rejected(403, "forbidden"));
    let m = handle.delete("srv-1").await.unwrap();
    assert_eq!(m.settled().await, MutationOutcome::Rejected("forbidden".to_string()));
    assert_eq!(ids(&handle.view()), vec!["srv-1"]);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn scenario_unanswered_create_times_out_into_rollback() {
    let push = Arc::new(PaperServer::new());
    let cfg = EngineConfig {
        request_timeout: Duration::from_millis(100),
        initial_resync: false,
        ..config()
    };
    let handle = spawn_engine(ReconcileStore::new(), Arc::new(HangingTransport), push, cfg);

    let m = handle.create(titled("lost in transit")).await.unwrap();
    assert_eq!(handle.view().provisional_count(), 1);
    assert_eq!(
        m.settled().await,
        MutationOutcome::Rejected("request timed out".to_string())
    );
    assert!(handle.view().is_empty());

    handle.shutdown().await;
}

#[tokio::test]
async fn scenario_malformed_push_is_dropped_with_notice() {
    let server = Arc::new(PaperServer::new());
    server.external_create(titled("kept"));
    let handle = spawn_engine(ReconcileStore::new(), server.clone(), server.clone(), config());
    let mut notices = handle.notices();
    let mut views = handle.subscribe();
    wait_for_notice(&mut notices, NoticeKind::PushConnected)
        .await
        .expect("connected");
    let before = wait_for_view(&mut views, |v| v.len() == 1).await.unwrap();

    server.push_raw(PushFrame::new("task:updated", json!({"title": "no identity"})));
    wait_for_notice(&mut notices, NoticeKind::MalformedPayload)
        .await
        .expect("malformed notice");

    server.push_raw(PushFrame::new("task:updated", json!({"id": "srv-404", "title": "x"})));
    wait_for_notice(&mut notices, NoticeKind::UnknownEntity)
        .await
        .expect("unknown entity notice");

    assert_eq!(handle.view().version(), before.version());

    handle.shutdown().await;
}

#[tokio::test]
async fn scenario_push_reconnect_resyncs_missed_changes() {
    let server = Arc::new(PaperServer::new());
    let handle = spawn_engine(ReconcileStore::new(), server.clone(), server.clone(), config());
    let mut notices = handle.notices();
    let mut views = handle.subscribe();
    wait_for_notice(&mut notices, NoticeKind::PushConnected)
        .await
        .expect("connected");

    server.disconnect_push();
    // Nobody is subscribed to the new channel yet, so this push is lost.
    server.external_create(titled("made while offline"));

    wait_for_notice(&mut notices, NoticeKind::PushDisconnected)
        .await
        .expect("disconnect noticed");
    wait_for_notice(&mut notices, NoticeKind::PushConnected)
        .await
        .expect("reconnected");

    let view = wait_for_view(&mut views, |v| {
        v.iter().any(|r| r.title() == Some("made while offline"))
    })
    .await
    .expect("resync after reconnect");
    assert!(server
        .requests()
        .iter()
        .filter(|op| **op == PaperOp::Subscribe)
        .count()
        >= 2);
    assert_eq!(view.len(), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn scenario_local_intent_on_unknown_identity_is_refused() {
    let server = Arc::new(PaperServer::new());
    let handle = spawn_engine(ReconcileStore::new(), server.clone(), server.clone(), config());

    let err = handle
        .update("srv-missing", titled("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Rejected(_)));
    assert!(!server.requests().contains(&PaperOp::Update));

    handle.shutdown().await;
}

#[tokio::test]
async fn scenario_calls_after_shutdown_report_stopped() {
    let server = Arc::new(PaperServer::new());
    let handle = spawn_engine(ReconcileStore::new(), server.clone(), server.clone(), config());
    handle.shutdown().await;

    assert_eq!(
        handle.create(titled("late")).await.unwrap_err(),
        EngineError::Stopped
    );
    assert_eq!(handle.resync().await.unwrap_err(), EngineError::Stopped);
}
