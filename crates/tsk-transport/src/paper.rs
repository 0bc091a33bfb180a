//! Deterministic in-memory task server.
//!
//! Implements both [`MutationTransport`] and [`PushTransport`] so the engine
//! can run end to end without a network:
//! - identities are assigned as `srv-1`, `srv-2`, ... in request order
//! - every accepted mutation is broadcast as a push frame *before* the REST
//!   response returns, which is the ordering that makes races interesting
//! - correlation tokens are echoed in push payloads unless disabled
//! - failures can be scripted per operation
//!
//! The push frames describe the mutation to every subscriber, including the
//! client that caused it, matching a server that broadcasts to all sockets.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tsk_reconcile::normalizer::CORRELATION_FIELD;
use tsk_reconcile::{merge_fields, CanonicalRecord, CorrelationToken, Fields};

use crate::{MutationTransport, PushFrame, PushStream, PushTransport, TransportError};

const PUSH_CAPACITY: usize = 1024;

/// Operation a scripted failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaperOp {
    Create,
    Update,
    Delete,
    FetchAll,
    Subscribe,
}

#[derive(Debug)]
struct Inner {
    next_id: u64,
    tasks: Vec<CanonicalRecord>,
    failures: VecDeque<(PaperOp, TransportError)>,
    echo_correlation: bool,
    latency: Duration,
    push_tx: broadcast::Sender<PushFrame>,
    requests: Vec<PaperOp>,
}

/// See the [module documentation][self]. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct PaperServer {
    inner: Arc<Mutex<Inner>>,
}

impl Default for PaperServer {
    fn default() -> Self {
        Self::new()
    }
}

fn push_payload(rec: &CanonicalRecord, token: Option<&CorrelationToken>) -> Value {
    let mut wire = rec.to_wire();
    if let (Some(t), Value::Object(obj)) = (token, &mut wire) {
        obj.insert(CORRELATION_FIELD.to_string(), json!(t.as_str()));
    }
    wire
}

impl PaperServer {
    pub fn new() -> Self {
        let (push_tx, _) = broadcast::channel(PUSH_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                tasks: Vec::new(),
                failures: VecDeque::new(),
                echo_correlation: true,
                latency: Duration::ZERO,
                push_tx,
                requests: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking test thread must not wedge every other clone.
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Omit correlation tokens from push payloads.
    pub fn set_echo_correlation(&self, echo: bool) {
        self.lock().echo_correlation = echo;
    }

    /// Delay every REST response (after its push frame went out).
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// The next request of kind `op` fails with `error`.
    pub fn fail_next(&self, op: PaperOp, error: TransportError) {
        self.lock().failures.push_back((op, error));
    }

    /// Current server-side collection.
    pub fn tasks(&self) -> Vec<CanonicalRecord> {
        self.lock().tasks.clone()
    }

    /// Requests seen so far, in order.
    pub fn requests(&self) -> Vec<PaperOp> {
        self.lock().requests.clone()
    }

    /// Drop every push connection. Subscribers see their stream end.
    pub fn disconnect_push(&self) {
        let (tx, _) = broadcast::channel(PUSH_CAPACITY);
        self.lock().push_tx = tx;
    }

    /// Mutation by another client: create.
    pub fn external_create(&self, fields: Fields) -> CanonicalRecord {
        let mut g = self.lock();
        let rec = g.insert(fields);
        g.push("task:created", push_payload(&rec, None));
        rec
    }

    /// Mutation by another client: update. `None` if the task is unknown.
    pub fn external_update(&self, identity: &str, fields: &Fields) -> Option<CanonicalRecord> {
        let mut g = self.lock();
        let rec = g.update(identity, fields)?;
        g.push("task:updated", push_payload(&rec, None));
        Some(rec)
    }

    /// Mutation by another client: delete. `false` if the task is unknown.
    pub fn external_delete(&self, identity: &str) -> bool {
        let mut g = self.lock();
        if !g.remove(identity) {
            return false;
        }
        g.push("task:deleted", json!({ "id": identity }));
        true
    }

    /// Emit an arbitrary frame, for malformed-input tests.
    pub fn push_raw(&self, frame: PushFrame) {
        let _ = self.lock().push_tx.send(frame);
    }

    /// Record the request and pop a scripted failure for it, if any.
    fn begin(&self, op: PaperOp) -> Result<Duration, TransportError> {
        let mut g = self.lock();
        g.requests.push(op);
        if let Some(i) = g.failures.iter().position(|(o, _)| *o == op) {
            if let Some((_, err)) = g.failures.remove(i) {
                return Err(err);
            }
        }
        Ok(g.latency)
    }
}

impl Inner {
    fn insert(&mut self, fields: Fields) -> CanonicalRecord {
        self.next_id += 1;
        let rec = CanonicalRecord::confirmed(format!("srv-{}", self.next_id), fields);
        self.tasks.push(rec.clone());
        rec
    }

    fn update(&mut self, identity: &str, fields: &Fields) -> Option<CanonicalRecord> {
        let rec = self.tasks.iter_mut().find(|r| r.identity == identity)?;
        rec.fields = merge_fields(&rec.fields, fields);
        rec.revision += 1;
        Some(rec.clone())
    }

    fn remove(&mut self, identity: &str) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|r| r.identity != identity);
        self.tasks.len() != before
    }

    fn push(&self, event: &str, payload: Value) {
        // No subscribers is fine.
        let _ = self.push_tx.send(PushFrame::new(event, payload));
    }
}

fn not_found(identity: &str) -> TransportError {
    TransportError::rejected(404, format!("Task {identity} not found"))
}

async fn respond<T>(latency: Duration, value: T) -> T {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
    value
}

#[async_trait]
impl MutationTransport for PaperServer {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn submit_create(
        &self,
        token: &CorrelationToken,
        fields: &Fields,
    ) -> Result<Value, TransportError> {
        let latency = self.begin(PaperOp::Create)?;
        let rec = {
            let mut g = self.lock();
            let rec = g.insert(fields.clone());
            let echo = g.echo_correlation.then_some(token);
            g.push("task:created", push_payload(&rec, echo));
            rec
        };
        Ok(respond(latency, json!({ "task": rec.to_wire() })).await)
    }

    async fn submit_update(&self, identity: &str, fields: &Fields) -> Result<Value, TransportError> {
        let latency = self.begin(PaperOp::Update)?;
        let rec = {
            let mut g = self.lock();
            let rec = g.update(identity, fields).ok_or_else(|| not_found(identity))?;
            g.push("task:updated", push_payload(&rec, None));
            rec
        };
        Ok(respond(latency, rec.to_wire()).await)
    }

    async fn submit_delete(&self, identity: &str) -> Result<(), TransportError> {
        let latency = self.begin(PaperOp::Delete)?;
        {
            let mut g = self.lock();
            if !g.remove(identity) {
                return Err(not_found(identity));
            }
            g.push("task:deleted", json!({ "id": identity }));
        }
        respond(latency, ()).await;
        Ok(())
    }

    async fn fetch_all(&self) -> Result<Value, TransportError> {
        let latency = self.begin(PaperOp::FetchAll)?;
        let list: Vec<Value> = self.lock().tasks.iter().map(|r| r.to_wire()).collect();
        Ok(respond(latency, json!({ "tasks": list })).await)
    }
}

#[async_trait]
impl PushTransport for PaperServer {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn subscribe(&self) -> Result<PushStream, TransportError> {
        self.begin(PaperOp::Subscribe)?;
        let rx = self.lock().push_tx.subscribe();
        // Lagged receivers skip frames, like a lossy real channel.
        let stream = BroadcastStream::new(rx).filter_map(|r| async move { r.ok() });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsk_reconcile::fields_from_json;

    #[tokio::test]
    async fn create_assigns_sequential_ids_and_pushes_first() {
        let server = PaperServer::new();
        let mut push = server.subscribe().await.unwrap();

        let resp = server
            .submit_create(&CorrelationToken::new("T1"), &fields_from_json(json!({"title": "a"})))
            .await
            .unwrap();
        assert_eq!(resp, json!({"task": {"id": "srv-1", "title": "a"}}));

        let frame = push.next().await.unwrap();
        assert_eq!(frame.event, "task:created");
        assert_eq!(frame.payload["correlationToken"], json!("T1"));
    }

    #[tokio::test]
    async fn scripted_failure_applies_once() {
        let server = PaperServer::new();
        server.fail_next(PaperOp::Create, TransportError::rejected(500, "boom"));
        let f = fields_from_json(json!({"title": "a"}));
        let t = CorrelationToken::new("T1");
        assert!(server.submit_create(&t, &f).await.is_err());
        assert!(server.submit_create(&t, &f).await.is_ok());
        assert_eq!(server.tasks().len(), 1);
        assert_eq!(server.tasks()[0].identity, "srv-1");
    }

    #[tokio::test]
    async fn update_and_delete_unknown_are_rejected() {
        let server = PaperServer::new();
        let err = server
            .submit_update("srv-404", &Fields::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rejected { status: Some(404), .. }));
        assert!(server.submit_delete("srv-404").await.is_err());
    }

    #[tokio::test]
    async fn disconnect_ends_stream() {
        let server = PaperServer::new();
        let mut push = server.subscribe().await.unwrap();
        server.disconnect_push();
        assert!(push.next().await.is_none());
    }
}
