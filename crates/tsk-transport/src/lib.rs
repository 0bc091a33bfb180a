//! tsk-transport
//!
//! Collaborator boundary of the sync engine: the mutation transport (REST)
//! and the push transport (server notifications), as traits plus concrete
//! implementations.
//!
//! - [`HttpMutationTransport`]: JSON over HTTP, bearer credential.
//! - [`WsPushTransport`]: WebSocket push, plain JSON or Socket.IO framing.
//! - [`PaperServer`]: deterministic in-memory server implementing both.
//!
//! Connection lifecycle lives here. The engine only sees normalized frames.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde_json::Value;
use tsk_reconcile::{CorrelationToken, Fields, PushKind};

mod error;
mod http;
mod paper;
mod ws;

pub use error::TransportError;
pub use http::HttpMutationTransport;
pub use paper::{PaperOp, PaperServer};
pub use ws::{connect_packet, decode_frame, Decoded, WireFormat, WsPushTransport};

/// Header carrying the correlation token of a create request.
pub const CORRELATION_HEADER: &str = "X-Correlation-Token";

/// One named push event with its raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PushFrame {
    pub event: String,
    pub payload: Value,
}

impl PushFrame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    /// `None` for event names the engine does not handle.
    pub fn kind(&self) -> Option<PushKind> {
        PushKind::parse(&self.event)
    }
}

/// Unbounded sequence of push frames. Ends when the connection drops.
pub type PushStream = Pin<Box<dyn Stream<Item = PushFrame> + Send>>;

/// Submit-and-await access to the authoritative server.
///
/// Responses are returned raw; the caller normalizes them.
#[async_trait]
pub trait MutationTransport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn submit_create(
        &self,
        token: &CorrelationToken,
        fields: &Fields,
    ) -> Result<Value, TransportError>;

    async fn submit_update(&self, identity: &str, fields: &Fields) -> Result<Value, TransportError>;

    async fn submit_delete(&self, identity: &str) -> Result<(), TransportError>;

    /// Full collection, for the initial load and resyncs.
    async fn fetch_all(&self) -> Result<Value, TransportError>;
}

/// Subscription to notifications about other clients' mutations.
#[async_trait]
pub trait PushTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open a connection. Each call is a fresh connection; the previous
    /// stream, if any, is unaffected.
    async fn subscribe(&self) -> Result<PushStream, TransportError>;
}
