//! Identity Resolver: decides which existing record an incoming one denotes.
//!
//! # Rules
//! 1. A tombstoned identity (deleted by push or by a confirmed local delete)
//!    never matches again; server identities are not reused.
//! 2. Exact string equality against a **confirmed** record's identity.
//!    Provisional identities never leave this process, so they are never
//!    matched against remote input.
//! 3. A correlation token registered by a local create bridges to that
//!    create's provisional record. This is the only provisional -> confirmed
//!    bridge; without a token the record is new.
//!
//! No other matching (titles, field similarity) is attempted.
//!
//! # Bounds
//! Tombstones are never evicted: one identity string per deletion observed
//! since the store was created. Evicting one would let a late push resurrect
//! the deleted record, so the set is bounded only by the number of deletions
//! in the session. Long-lived hosts read the size through
//! `ReconcileStore::tombstone_count` and start a fresh store (followed by a
//! resync) when it matters.
//!
//! # Thread-safety
//! Not `Sync`-guarded. The store owns the resolver and applies one event at
//! a time.

use std::collections::{BTreeMap, BTreeSet};

use crate::{CanonicalRecord, CorrelationToken};

/// Outcome of matching an incoming record against the current records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Same entity as the confirmed record at this index.
    Existing(usize),
    /// Bridged by correlation token to a create still awaiting confirmation.
    PendingCreate { provisional: String },
    /// The identity was deleted; the input is stale.
    Tombstoned,
    /// Not seen before.
    New,
}

/// Correlation-token registry plus deletion tombstones.
#[derive(Clone, Debug, Default)]
pub struct IdentityResolver {
    /// correlation token -> provisional identity
    pending: BTreeMap<CorrelationToken, String>,
    tombstones: BTreeSet<String>,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the token of a local create. Re-registering overwrites.
    pub fn register(&mut self, token: CorrelationToken, provisional: impl Into<String>) {
        self.pending.insert(token, provisional.into());
    }

    /// Provisional identity awaiting confirmation under `token`, if any.
    pub fn provisional_for(&self, token: &CorrelationToken) -> Option<&str> {
        self.pending.get(token).map(|s| s.as_str())
    }

    pub fn is_pending(&self, token: &CorrelationToken) -> bool {
        self.pending.contains_key(token)
    }

    /// Remove and return the bridge for `token` (confirmation or rollback).
    pub fn take(&mut self, token: &CorrelationToken) -> Option<String> {
        self.pending.remove(token)
    }

    /// `true` if some pending create owns this provisional identity.
    pub fn owns_provisional(&self, provisional: &str) -> bool {
        self.pending.values().any(|p| p == provisional)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn tombstone(&mut self, identity: impl Into<String>) {
        self.tombstones.insert(identity.into());
    }

    pub fn is_tombstoned(&self, identity: &str) -> bool {
        self.tombstones.contains(identity)
    }

    /// Never shrinks; see the module's bounds section.
    pub fn tombstone_len(&self) -> usize {
        self.tombstones.len()
    }

    /// Index of the confirmed record with exactly this identity.
    pub fn position(records: &[CanonicalRecord], identity: &str) -> Option<usize> {
        records
            .iter()
            .position(|r| !r.provisional && r.identity == identity)
    }

    /// Apply the matching rules, in order.
    pub fn resolve(
        &self,
        records: &[CanonicalRecord],
        identity: &str,
        token: Option<&CorrelationToken>,
    ) -> Resolution {
        if self.is_tombstoned(identity) {
            return Resolution::Tombstoned;
        }
        if let Some(idx) = Self::position(records, identity) {
            return Resolution::Existing(idx);
        }
        if let Some(provisional) = token.and_then(|t| self.provisional_for(t)) {
            return Resolution::PendingCreate {
                provisional: provisional.to_string(),
            };
        }
        Resolution::New
    }
}
