use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tsk_reconcile::{CorrelationToken, Fields, View};

use crate::engine::{Inbound, LocalIntent};
use crate::{EngineError, Notice};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Create => "create",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        }
    }
}

/// Final REST outcome of a local intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    /// Accepted by the server. `identity` is the server identity (for
    /// creates, the one the provisional record was rebound to).
    Confirmed { identity: String },
    /// The local change was rolled back (or the rollback was superseded).
    Rejected(String),
}

/// Returned by the local-intent entry points once the optimistic change is
/// in the view.
#[derive(Debug)]
pub struct MutationHandle {
    pub kind: MutationKind,
    pub token: CorrelationToken,
    /// Provisional identity for creates, server identity otherwise.
    pub identity: String,
    /// Record revision right after the optimistic change.
    pub local_revision: u64,
    pub(crate) settled: oneshot::Receiver<MutationOutcome>,
}

impl MutationHandle {
    /// Wait for the REST outcome.
    pub async fn settled(self) -> MutationOutcome {
        self.settled
            .await
            .unwrap_or_else(|_| MutationOutcome::Rejected(EngineError::Stopped.to_string()))
    }
}

/// Cloneable entry point to a running engine.
#[derive(Clone)]
pub struct SyncHandle {
    pub(crate) tx: mpsc::Sender<Inbound>,
    pub(crate) views: Arc<watch::Sender<Arc<View>>>,
    pub(crate) notices: broadcast::Sender<Notice>,
}

impl SyncHandle {
    /// Current snapshot.
    pub fn view(&self) -> Arc<View> {
        Arc::clone(&self.views.borrow())
    }

    /// Receiver that changes once per emitted view. The current view counts
    /// as already seen.
    pub fn subscribe(&self) -> watch::Receiver<Arc<View>> {
        self.views.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub async fn create(&self, fields: Fields) -> Result<MutationHandle, EngineError> {
        self.local(LocalIntent::Create { fields }).await
    }

    pub async fn update(
        &self,
        identity: impl Into<String>,
        fields: Fields,
    ) -> Result<MutationHandle, EngineError> {
        self.local(LocalIntent::Update {
            identity: identity.into(),
            fields,
        })
        .await
    }

    pub async fn delete(&self, identity: impl Into<String>) -> Result<MutationHandle, EngineError> {
        self.local(LocalIntent::Delete {
            identity: identity.into(),
        })
        .await
    }

    /// Fetch the full list and apply it. Returns the resulting view size.
    pub async fn resync(&self) -> Result<usize, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Inbound::Resync(Some(reply))).await?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    /// Stop the loop and wait until it has exited.
    pub async fn shutdown(&self) {
        let (ack, rx) = oneshot::channel();
        if self.send(Inbound::Shutdown(ack)).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn local(&self, intent: LocalIntent) -> Result<MutationHandle, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Inbound::Local(intent, reply)).await?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    async fn send(&self, msg: Inbound) -> Result<(), EngineError> {
        self.tx.send(msg).await.map_err(|_| EngineError::Stopped)
    }
}
