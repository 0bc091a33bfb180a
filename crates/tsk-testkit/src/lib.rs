//! Shared fixtures for scenario tests.
//!
//! - record and field builders
//! - [`interleavings`]: every ordering of an event set that respects causal
//!   dependencies, for convergence checks
//! - engine helpers: wait for a view or notice with a deadline
//! - [`HangingTransport`]: a mutation transport that never answers

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tsk_reconcile::{
    fields_from_json, CorrelationToken, Fields, NormalizedRecord, ReconcileError, ReconcileStore,
    StoreEvent, View,
};
use tsk_runtime::{Notice, NoticeKind};
use tsk_transport::{MutationTransport, TransportError};

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn fields(v: Value) -> Fields {
    fields_from_json(v)
}

pub fn titled(title: &str) -> Fields {
    fields(serde_json::json!({ "title": title }))
}

pub fn remote(identity: &str, v: Value) -> NormalizedRecord {
    NormalizedRecord::new(identity, fields(v))
}

pub fn remote_with_token(identity: &str, token: &str, v: Value) -> NormalizedRecord {
    remote(identity, v).with_correlation(CorrelationToken::new(token))
}

pub fn ids(view: &View) -> Vec<String> {
    view.iter().map(|r| r.identity.clone()).collect()
}

// ---------------------------------------------------------------------------
// Interleavings
// ---------------------------------------------------------------------------

/// Every ordering of `events` in which, for each `(before, after)` pair of
/// indices, `before` comes first.
pub fn interleavings(events: &[StoreEvent], deps: &[(usize, usize)]) -> Vec<Vec<StoreEvent>> {
    fn walk(
        events: &[StoreEvent],
        deps: &[(usize, usize)],
        used: &mut Vec<bool>,
        current: &mut Vec<usize>,
        out: &mut Vec<Vec<StoreEvent>>,
    ) {
        if current.len() == events.len() {
            out.push(current.iter().map(|&i| events[i].clone()).collect());
            return;
        }
        for i in 0..events.len() {
            if used[i] {
                continue;
            }
            let ready = deps.iter().all(|&(b, a)| a != i || used[b]);
            if !ready {
                continue;
            }
            used[i] = true;
            current.push(i);
            walk(events, deps, used, current, out);
            current.pop();
            used[i] = false;
        }
    }

    let mut out = Vec::new();
    walk(
        events,
        deps,
        &mut vec![false; events.len()],
        &mut Vec::new(),
        &mut out,
    );
    out
}

/// Result of replaying one ordering.
pub struct Replay {
    pub store: ReconcileStore,
    pub emissions: usize,
    pub errors: Vec<ReconcileError>,
}

/// Apply `events` in order on a fresh store, collecting tolerated errors.
pub fn replay(events: Vec<StoreEvent>) -> Replay {
    replay_on(ReconcileStore::new(), events)
}

pub fn replay_on(mut store: ReconcileStore, events: Vec<StoreEvent>) -> Replay {
    let mut emissions = 0;
    let mut errors = Vec::new();
    for ev in events {
        match store.apply(ev) {
            Ok(a) if a.emitted() => emissions += 1,
            Ok(_) => {}
            Err(e) => errors.push(e),
        }
    }
    Replay {
        store,
        emissions,
        errors,
    }
}

// ---------------------------------------------------------------------------
// Engine helpers
// ---------------------------------------------------------------------------

pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// Wait until the published view satisfies `pred`. `None` on deadline.
pub async fn wait_for_view<F>(rx: &mut watch::Receiver<Arc<View>>, pred: F) -> Option<Arc<View>>
where
    F: Fn(&View) -> bool,
{
    let waiting = async {
        loop {
            {
                let current = rx.borrow_and_update();
                if pred(&current) {
                    return Some(Arc::clone(&current));
                }
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    };
    tokio::time::timeout(DEFAULT_WAIT, waiting).await.ok().flatten()
}

/// Wait for the next notice of `kind`, skipping others.
pub async fn wait_for_notice(rx: &mut broadcast::Receiver<Notice>, kind: NoticeKind) -> Option<Notice> {
    let waiting = async {
        loop {
            match rx.recv().await {
                Ok(n) if n.kind == kind => return Some(n),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(DEFAULT_WAIT, waiting).await.ok().flatten()
}

// ---------------------------------------------------------------------------
// Transports
// ---------------------------------------------------------------------------

/// Accepts requests and never answers. Exercises request timeouts.
#[derive(Debug, Default, Clone)]
pub struct HangingTransport;

#[async_trait]
impl MutationTransport for HangingTransport {
    fn name(&self) -> &'static str {
        "hanging"
    }

    async fn submit_create(
        &self,
        _token: &CorrelationToken,
        _fields: &Fields,
    ) -> Result<Value, TransportError> {
        std::future::pending().await
    }

    async fn submit_update(&self, _identity: &str, _fields: &Fields) -> Result<Value, TransportError> {
        std::future::pending().await
    }

    async fn submit_delete(&self, _identity: &str) -> Result<(), TransportError> {
        std::future::pending().await
    }

    async fn fetch_all(&self) -> Result<Value, TransportError> {
        std::future::pending().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleavings_respect_dependencies() {
        let events = vec![
            StoreEvent::PushDeleted {
                identity: "a".into(),
            },
            StoreEvent::PushDeleted {
                identity: "b".into(),
            },
            StoreEvent::PushDeleted {
                identity: "c".into(),
            },
        ];
        assert_eq!(interleavings(&events, &[]).len(), 6);
        assert_eq!(interleavings(&events, &[(0, 1)]).len(), 3);
        assert_eq!(interleavings(&events, &[(0, 1), (1, 2)]).len(), 1);
    }
}
