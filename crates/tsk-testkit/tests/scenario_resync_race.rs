//! A full-list fetch that is overtaken by confirmations and pushes must not
//! roll the view back to what the server had when the fetch started.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tsk_reconcile::{CorrelationToken, Fields, ReconcileStore, StoreEvent};
use tsk_runtime::{spawn_engine, EngineConfig, MutationOutcome, NoticeKind};
use tsk_testkit::*;
use tsk_transport::{MutationTransport, PaperServer, TransportError};

/// Paper server whose list answer is captured when requested and delivered
/// only once `release` is notified.
struct SlowList {
    server: Arc<PaperServer>,
    release: Arc<Notify>,
}

#[async_trait]
impl MutationTransport for SlowList {
    fn name(&self) -> &'static str {
        "slow-list"
    }

    async fn submit_create(
        &self,
        token: &CorrelationToken,
        fields: &Fields,
    ) -> Result<Value, TransportError> {
        self.server.submit_create(token, fields).await
    }

    async fn submit_update(&self, identity: &str, fields: &Fields) -> Result<Value, TransportError> {
        self.server.submit_update(identity, fields).await
    }

    async fn submit_delete(&self, identity: &str) -> Result<(), TransportError> {
        self.server.submit_delete(identity).await
    }

    async fn fetch_all(&self) -> Result<Value, TransportError> {
        let snapshot = self.server.fetch_all().await;
        self.release.notified().await;
        snapshot
    }
}

fn config() -> EngineConfig {
    EngineConfig {
        reconnect_delay: Some(Duration::from_millis(20)),
        initial_resync: false,
        ..EngineConfig::default()
    }
}

fn slow(server: &Arc<PaperServer>) -> (Arc<SlowList>, Arc<Notify>) {
    let release = Arc::new(Notify::new());
    let api = Arc::new(SlowList {
        server: server.clone(),
        release: release.clone(),
    });
    (api, release)
}

#[tokio::test]
async fn scenario_create_confirmed_during_resync_survives() {
    let server = Arc::new(PaperServer::new());
    let (api, release) = slow(&server);
    let handle = spawn_engine(ReconcileStore::new(), api, server.clone(), config());

    // The list is captured empty, before the create reaches the server.
    let pending = tokio::spawn({
        let handle = handle.clone();
        async move { handle.resync().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let m = handle.create(titled("Buy milk")).await.unwrap();
    assert_eq!(
        m.settled().await,
        MutationOutcome::Confirmed {
            identity: "srv-1".into()
        }
    );

    release.notify_one();
    pending.await.unwrap().unwrap();

    let view = handle.view();
    assert_eq!(ids(&view), vec!["srv-1"]);
    assert_eq!(view.get("srv-1").unwrap().title(), Some("Buy milk"));

    // A list fetched from here on is current and authoritative again.
    release.notify_one();
    assert_eq!(handle.resync().await.unwrap(), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn scenario_push_during_resync_is_not_overwritten() {
    let server = Arc::new(PaperServer::new());
    server.external_create(titled("a"));
    let mut store = ReconcileStore::new();
    store
        .apply(StoreEvent::PushCreated(remote("srv-1", json!({"title": "a"}))))
        .unwrap();

    let (api, release) = slow(&server);
    let handle = spawn_engine(store, api, server.clone(), config());
    let mut views = handle.subscribe();
    let mut notices = handle.notices();
    wait_for_notice(&mut notices, NoticeKind::PushConnected)
        .await
        .expect("push connected");

    let pending = tokio::spawn({
        let handle = handle.clone();
        async move { handle.resync().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    server.external_update("srv-1", &fields(json!({"title": "b"})));
    wait_for_view(&mut views, |v| v.get("srv-1").and_then(|r| r.title()) == Some("b"))
        .await
        .expect("push applied");

    release.notify_one();
    pending.await.unwrap().unwrap();
    assert_eq!(handle.view().get("srv-1").unwrap().title(), Some("b"));

    handle.shutdown().await;
}
