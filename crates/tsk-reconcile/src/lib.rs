//! tsk-reconcile
//!
//! Client-side reconciliation engine for the shared task collection.
//!
//! Architectural decisions:
//! - One authoritative in-memory [`View`], replaced (never mutated) on every
//!   accepted change
//! - Three unordered input channels: local optimistic intents, REST
//!   outcomes, push notifications from other clients
//! - Heterogeneous wire payloads are normalized before they reach the store
//! - Provisional identities are bridged to server identities only through a
//!   correlation token
//! - Remote data supersedes local optimistic data field by field
//!
//! Deterministic, pure logic. No IO. No async. No transport calls.

mod error;
mod event;
mod identity;
pub mod normalizer;
mod store;
mod types;

pub use error::ReconcileError;
pub use event::{Applied, Channel, Effect, PushKind, StoreEvent};
pub use identity::{IdentityResolver, Resolution};
pub use normalizer::{
    normalize_identity, normalize_list, normalize_record, MalformedPayload, NormalizedRecord,
};
pub use store::ReconcileStore;
pub use types::*;
