//! The serialized event loop.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use tsk_reconcile::{
    normalize_list, normalize_record, Applied, CorrelationToken, Effect, Fields, ReconcileError,
    ReconcileStore, StoreEvent,
};
use tsk_transport::{MutationTransport, PushFrame, PushTransport, TransportError};
use uuid::Uuid;

use crate::handle::{MutationHandle, MutationKind, MutationOutcome, SyncHandle};
use crate::pump::{spawn_push_pump, PushStatus};
use crate::{EngineError, Notice, NoticeKind};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Inbound queue depth shared by all three channels.
    pub queue_capacity: usize,
    pub notice_capacity: usize,
    /// Bound on every mutation request; expiry rolls the change back.
    pub request_timeout: Duration,
    /// `None` disables push reconnect.
    pub reconnect_delay: Option<Duration>,
    pub resync_on_reconnect: bool,
    /// Load the full list once at startup.
    pub initial_resync: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            notice_capacity: 64,
            request_timeout: Duration::from_secs(10),
            reconnect_delay: Some(Duration::from_secs(2)),
            resync_on_reconnect: true,
            initial_resync: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound queue
// ---------------------------------------------------------------------------

pub(crate) enum LocalIntent {
    Create { fields: Fields },
    Update { identity: String, fields: Fields },
    Delete { identity: String },
}

type ResyncReply = oneshot::Sender<Result<usize, EngineError>>;

pub(crate) enum Inbound {
    Local(LocalIntent, oneshot::Sender<Result<MutationHandle, EngineError>>),
    Rest {
        event: StoreEvent,
        settle: oneshot::Sender<MutationOutcome>,
    },
    Push(PushFrame),
    PushStatus(PushStatus),
    Resync(Option<ResyncReply>),
    Fetched {
        result: Result<Value, TransportError>,
        reply: Option<ResyncReply>,
        /// Store generation when the fetch started.
        generation: u64,
    },
    Shutdown(oneshot::Sender<()>),
}

async fn deliver(weak: mpsc::WeakSender<Inbound>, msg: Inbound) {
    // Engine gone: the outcome is dropped and the settle channel closes.
    if let Some(tx) = weak.upgrade() {
        let _ = tx.send(msg).await;
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct Engine {
    store: ReconcileStore,
    mutations: Arc<dyn MutationTransport>,
    inbound: mpsc::WeakSender<Inbound>,
    views: Arc<watch::Sender<Arc<tsk_reconcile::View>>>,
    notices: broadcast::Sender<Notice>,
    config: EngineConfig,
    /// Dropped when the loop exits, which stops the push pump.
    _stop: watch::Sender<()>,
}

/// Start the engine on the current tokio runtime.
///
/// `store` may already hold state (e.g. restored from a snapshot); its view
/// is published as the initial value.
pub fn spawn_engine(
    store: ReconcileStore,
    mutations: Arc<dyn MutationTransport>,
    push: Arc<dyn PushTransport>,
    config: EngineConfig,
) -> SyncHandle {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let (views, _) = watch::channel(store.view());
    let views = Arc::new(views);
    let (notices, _) = broadcast::channel(config.notice_capacity.max(1));
    let (stop_tx, stop_rx) = watch::channel(());

    info!(
        mutations = mutations.name(),
        push = push.name(),
        "sync engine starting"
    );

    spawn_push_pump(
        push,
        tx.downgrade(),
        stop_rx,
        config.reconnect_delay,
    );

    let initial_resync = config.initial_resync;
    let engine = Engine {
        store,
        mutations,
        inbound: tx.downgrade(),
        views: Arc::clone(&views),
        notices: notices.clone(),
        config,
        _stop: stop_tx,
    };
    tokio::spawn(engine.run(rx));

    let handle = SyncHandle {
        tx,
        views,
        notices,
    };
    if initial_resync {
        // Queue is empty at this point, so this cannot fail for capacity.
        let _ = handle.tx.try_send(Inbound::Resync(None));
    }
    handle
}

impl Engine {
    async fn run(mut self, mut rx: mpsc::Receiver<Inbound>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                Inbound::Shutdown(ack) => {
                    info!("sync engine stopping");
                    let _ = ack.send(());
                    break;
                }
                Inbound::Local(intent, reply) => {
                    let _ = reply.send(self.on_local(intent));
                }
                Inbound::Rest { event, settle } => self.on_rest(event, settle),
                Inbound::Push(frame) => self.on_push(frame),
                Inbound::PushStatus(status) => self.on_push_status(status),
                Inbound::Resync(reply) => self.start_resync(reply),
                Inbound::Fetched {
                    result,
                    reply,
                    generation,
                } => self.on_fetched(result, reply, generation),
            }
        }
        debug!("sync engine loop exited");
    }

    fn notify(&self, kind: NoticeKind, message: impl Into<String>) {
        // No subscribers is fine.
        let _ = self.notices.send(Notice::now(kind, message));
    }

    /// Apply one event, publish the view if it changed, log the outcome.
    fn apply(&mut self, event: StoreEvent) -> Result<Applied, ReconcileError> {
        let name = event.name();
        let channel = event.channel();
        match self.store.apply(event) {
            Ok(applied) => {
                if let Some(view) = &applied.view {
                    self.views.send_replace(Arc::clone(view));
                }
                debug!(
                    event = name,
                    channel = channel.as_str(),
                    effect = ?applied.effect,
                    emitted = applied.emitted(),
                    "event applied"
                );
                if let Effect::Deferred { token } = &applied.effect {
                    info!(event = name, token = %token, "push deferred until create resolves");
                }
                Ok(applied)
            }
            Err(e) => {
                warn!(event = name, channel = channel.as_str(), kind = e.kind(), error = %e, "event not applied");
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Local intents
    // -----------------------------------------------------------------------

    fn on_local(&mut self, intent: LocalIntent) -> Result<MutationHandle, EngineError> {
        let token = CorrelationToken::new(Uuid::new_v4().to_string());
        let (settle_tx, settle_rx) = oneshot::channel();

        let (kind, identity, local_revision) = match intent {
            LocalIntent::Create { fields } => {
                self.apply(StoreEvent::LocalCreate {
                    token: token.clone(),
                    fields: fields.clone(),
                })?;
                let identity = self
                    .store
                    .provisional_for(&token)
                    .unwrap_or_default()
                    .to_string();
                self.spawn_create(token.clone(), fields, settle_tx);
                (MutationKind::Create, identity, 0)
            }
            LocalIntent::Update { identity, fields } => {
                let applied = self.apply(StoreEvent::LocalUpdate {
                    identity: identity.clone(),
                    fields: fields.clone(),
                })?;
                match applied.effect {
                    Effect::Merged { revision, .. } => {
                        self.spawn_update(identity.clone(), revision, fields, settle_tx);
                        (MutationKind::Update, identity, revision)
                    }
                    _ => {
                        // Nothing changed locally, so there is nothing to send.
                        let revision = self.revision_of(&identity);
                        let _ = settle_tx.send(MutationOutcome::Confirmed {
                            identity: identity.clone(),
                        });
                        (MutationKind::Update, identity, revision)
                    }
                }
            }
            LocalIntent::Delete { identity } => {
                let revision = self.revision_of(&identity);
                self.apply(StoreEvent::LocalDelete {
                    identity: identity.clone(),
                })?;
                self.spawn_delete(identity.clone(), settle_tx);
                (MutationKind::Delete, identity, revision)
            }
        };

        info!(kind = kind.as_str(), identity = %identity, token = %token, "local intent applied");
        Ok(MutationHandle {
            kind,
            token,
            identity,
            local_revision,
            settled: settle_rx,
        })
    }

    fn revision_of(&self, identity: &str) -> u64 {
        self.store.view().get(identity).map_or(0, |r| r.revision)
    }

    fn spawn_create(
        &self,
        token: CorrelationToken,
        fields: Fields,
        settle: oneshot::Sender<MutationOutcome>,
    ) {
        let transport = Arc::clone(&self.mutations);
        let inbound = self.inbound.clone();
        let timeout = self.config.request_timeout;
        tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, transport.submit_create(&token, &fields))
                .await
                .unwrap_or(Err(TransportError::Timeout));
            let event = match result {
                Ok(body) => match normalize_record(&body) {
                    Ok(record) => StoreEvent::RestConfirmCreate { token, record },
                    Err(e) => StoreEvent::RestRejectCreate {
                        token,
                        reason: e.to_string(),
                    },
                },
                Err(e) => StoreEvent::RestRejectCreate {
                    token,
                    reason: e.reason(),
                },
            };
            deliver(inbound, Inbound::Rest { event, settle }).await;
        });
    }

    fn spawn_update(
        &self,
        identity: String,
        revision: u64,
        fields: Fields,
        settle: oneshot::Sender<MutationOutcome>,
    ) {
        let transport = Arc::clone(&self.mutations);
        let inbound = self.inbound.clone();
        let timeout = self.config.request_timeout;
        tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, transport.submit_update(&identity, &fields))
                .await
                .unwrap_or(Err(TransportError::Timeout));
            let event = match result {
                // Servers that answer with the full record win over what we sent.
                Ok(body) => StoreEvent::RestConfirmUpdate {
                    fields: normalize_record(&body).map(|r| r.fields).unwrap_or(fields),
                    identity,
                },
                Err(e) => StoreEvent::RestRejectUpdate {
                    identity,
                    revision,
                    reason: e.reason(),
                },
            };
            deliver(inbound, Inbound::Rest { event, settle }).await;
        });
    }

    fn spawn_delete(&self, identity: String, settle: oneshot::Sender<MutationOutcome>) {
        let transport = Arc::clone(&self.mutations);
        let inbound = self.inbound.clone();
        let timeout = self.config.request_timeout;
        tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, transport.submit_delete(&identity))
                .await
                .unwrap_or(Err(TransportError::Timeout));
            let event = match result {
                Ok(()) => StoreEvent::RestConfirmDelete { identity },
                Err(e) => StoreEvent::RestRejectDelete {
                    identity,
                    reason: e.reason(),
                },
            };
            deliver(inbound, Inbound::Rest { event, settle }).await;
        });
    }

    // -----------------------------------------------------------------------
    // REST outcomes
    // -----------------------------------------------------------------------

    fn on_rest(&mut self, event: StoreEvent, settle: oneshot::Sender<MutationOutcome>) {
        let outcome = match &event {
            StoreEvent::RestRejectCreate { reason, .. }
            | StoreEvent::RestRejectUpdate { reason, .. }
            | StoreEvent::RestRejectDelete { reason, .. } => {
                MutationOutcome::Rejected(reason.clone())
            }
            StoreEvent::RestConfirmCreate { record, .. } => MutationOutcome::Confirmed {
                identity: record.identity.clone(),
            },
            StoreEvent::RestConfirmUpdate { identity, .. }
            | StoreEvent::RestConfirmDelete { identity } => MutationOutcome::Confirmed {
                identity: identity.clone(),
            },
            // Only REST outcomes are routed here.
            other => MutationOutcome::Rejected(format!("unexpected event {}", other.name())),
        };
        let name = event.name();

        match self.apply(event) {
            Ok(_) => {
                if let MutationOutcome::Rejected(reason) = &outcome {
                    warn!(event = name, reason = %reason, "local mutation rolled back");
                    self.notify(NoticeKind::RolledBack, format!("{name}: {reason}"));
                }
            }
            Err(e) => self.notify(NoticeKind::from(&e), e.to_string()),
        }
        let _ = settle.send(outcome);
    }

    // -----------------------------------------------------------------------
    // Push
    // -----------------------------------------------------------------------

    fn on_push(&mut self, frame: PushFrame) {
        let Some(kind) = frame.kind() else {
            debug!(event = %frame.event, "push event ignored");
            return;
        };
        let event = match StoreEvent::from_push(kind, &frame.payload) {
            Ok(ev) => ev,
            Err(e) => {
                warn!(event = %frame.event, error = %e, "push payload dropped");
                self.notify(NoticeKind::MalformedPayload, format!("{}: {e}", frame.event));
                return;
            }
        };
        if let Err(e) = self.apply(event) {
            self.notify(NoticeKind::from(&e), e.to_string());
        }
    }

    fn on_push_status(&mut self, status: PushStatus) {
        match status {
            PushStatus::Connected { reconnect } => {
                self.notify(NoticeKind::PushConnected, "push channel connected");
                if reconnect && self.config.resync_on_reconnect {
                    info!("push channel reconnected, resyncing");
                    self.start_resync(None);
                }
            }
            PushStatus::Disconnected(reason) => {
                self.notify(NoticeKind::PushDisconnected, reason);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Resync
    // -----------------------------------------------------------------------

    fn start_resync(&self, reply: Option<ResyncReply>) {
        let transport = Arc::clone(&self.mutations);
        let inbound = self.inbound.clone();
        let timeout = self.config.request_timeout;
        let generation = self.store.generation();
        tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, transport.fetch_all())
                .await
                .unwrap_or(Err(TransportError::Timeout));
            deliver(
                inbound,
                Inbound::Fetched {
                    result,
                    reply,
                    generation,
                },
            )
            .await;
        });
    }

    fn on_fetched(
        &mut self,
        result: Result<Value, TransportError>,
        reply: Option<ResyncReply>,
        generation: u64,
    ) {
        let outcome = result.and_then(|body| self.apply_list(&body, generation));
        if let Err(e) = &outcome {
            warn!(error = %e, "resync failed");
            self.notify(NoticeKind::ResyncFailed, e.to_string());
        }
        if let Some(reply) = reply {
            let _ = reply.send(outcome.map_err(EngineError::Transport));
        }
    }

    /// `generation`: store generation when the fetch was issued. Records
    /// confirmed or pushed since then outrank the list.
    fn apply_list(&mut self, body: &Value, generation: u64) -> Result<usize, TransportError> {
        // An unexpected shape must not read as "the server has no tasks".
        let is_list = body.is_array()
            || body
                .get(tsk_reconcile::normalizer::LIST_ENVELOPE)
                .is_some_and(Value::is_array);
        if !is_list {
            return Err(TransportError::Decode(
                "task list response is neither an array nor a tasks envelope".to_string(),
            ));
        }

        let mut records = Vec::new();
        for item in normalize_list(body) {
            match item {
                Ok(rec) => records.push(rec),
                Err(e) => {
                    warn!(error = %e, "list item dropped");
                    self.notify(NoticeKind::MalformedPayload, e.to_string());
                }
            }
        }
        // Resync never fails in the store.
        let _ = self.apply(StoreEvent::ResyncSince {
            generation,
            records,
        });
        debug!(
            records = self.store.view().len(),
            tombstones = self.store.tombstone_count(),
            "resync applied"
        );
        Ok(self.store.view().len())
    }
}
