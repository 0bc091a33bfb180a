//! tsk-runtime
//!
//! Runs a [`ReconcileStore`] against live transports.
//!
//! # Purpose
//! Local intents, REST outcomes and push frames arrive from independent
//! async sources. They are funnelled into one queue and applied to the store
//! strictly one at a time by a single task; no lock guards the store because
//! nothing else can reach it.
//!
//! # Invariants
//! - Every accepted event that changes the view publishes exactly one new
//!   snapshot on the watch channel; unchanged events publish nothing.
//! - Every local intent ends in a REST outcome event: success, rejection,
//!   or timeout (mapped to rejection). No provisional record is left behind
//!   by a request that never answers.
//! - Errors never stop the loop. They become [`Notice`]s.
//!
//! [`ReconcileStore`]: tsk_reconcile::ReconcileStore

mod engine;
mod error;
mod handle;
mod notice;
mod pump;

pub use engine::{spawn_engine, EngineConfig};
pub use error::EngineError;
pub use handle::{MutationHandle, MutationKind, MutationOutcome, SyncHandle};
pub use notice::{Notice, NoticeKind};
