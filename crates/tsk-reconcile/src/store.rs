//! Reconciliation Store: the stateful core.
//!
//! # Design
//!
//! Holds the current [`View`] and applies one [`StoreEvent`] at a time via
//! [`ReconcileStore::apply`]. Per logical entity:
//!
//! ```text
//!                 LocalCreate                RestConfirmCreate
//!    absent ─────────────────► provisional ─────────────────────► confirmed
//!      ▲  ▲                         │                                │
//!      │  └──── RestRejectCreate ───┘                                │
//!      │                                                             │
//!      └──── PushDeleted | LocalDelete (+RestConfirmDelete) ─────────┘
//!
//!    absent ── PushCreated ──► confirmed
//! ```
//!
//! Merge policy: REST-confirmed and push-sourced fields supersede local
//! optimistic fields; between two remote sources the later-processed event
//! wins. The create response is the oldest server state of an entity, so it
//! never overrides push data already observed for the same server identity.
//!
//! Every accepted event is compared against the current view; an unchanged
//! result is accepted without emission and without a revision bump.
//!
//! # Generations
//!
//! Every remote event that confirms or refreshes a record bumps
//! [`ReconcileStore::generation`] and stamps the record with it. A full list
//! fetched while the store was at generation `G` ([`StoreEvent::ResyncSince`])
//! never drops or overwrites a record stamped after `G`: the list predates
//! what the store already knows about it. A list older than the last one
//! applied is ignored.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::event::{Applied, Effect, StoreEvent};
use crate::identity::{IdentityResolver, Resolution};
use crate::normalizer::NormalizedRecord;
use crate::types::same_content;
use crate::{
    fill_missing, merge_fields, CanonicalRecord, CorrelationToken, Fields, ReconcileError, View,
    PROVISIONAL_PREFIX,
};

/// Fields last known to be confirmed, while local updates are in flight.
#[derive(Debug, Clone)]
struct PendingUpdate {
    baseline: Fields,
    /// Revision produced by the newest local update.
    latest_local_revision: u64,
    outstanding: u32,
}

/// Record removed optimistically, kept until the server answers.
#[derive(Debug, Clone)]
struct PendingDelete {
    record: CanonicalRecord,
    position: usize,
}

/// See the [module documentation][self].
#[derive(Debug, Clone, Default)]
pub struct ReconcileStore {
    view: Arc<View>,
    resolver: IdentityResolver,
    pending_updates: BTreeMap<String, PendingUpdate>,
    pending_deletes: BTreeMap<String, PendingDelete>,
    /// Push creations bridged to a create still awaiting confirmation.
    deferred: BTreeMap<CorrelationToken, NormalizedRecord>,
    next_provisional: u64,
    generation: u64,
    /// identity -> generation of the last remote event that touched it
    remote_seen: BTreeMap<String, u64>,
    /// Fetch generation of the last list applied.
    resynced_at: u64,
}

fn set_fields(rec: &mut CanonicalRecord, fields: Fields) -> bool {
    if rec.fields == fields {
        return false;
    }
    rec.fields = fields;
    rec.revision += 1;
    true
}

fn merge_into(rec: &mut CanonicalRecord, overlay: &Fields) -> bool {
    let merged = merge_fields(&rec.fields, overlay);
    set_fields(rec, merged)
}

impl ReconcileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot. Cheap; the snapshot never changes once handed out.
    pub fn view(&self) -> Arc<View> {
        Arc::clone(&self.view)
    }

    pub fn pending_creates(&self) -> usize {
        self.resolver.pending_len()
    }

    pub fn pending_updates(&self) -> usize {
        self.pending_updates.len()
    }

    pub fn pending_deletes(&self) -> usize {
        self.pending_deletes.len()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub fn is_tombstoned(&self, identity: &str) -> bool {
        self.resolver.is_tombstoned(identity)
    }

    /// Number of remote confirmations/refreshes applied so far. Record it
    /// when a full-list fetch starts and hand it back with
    /// [`StoreEvent::ResyncSince`].
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deleted identities remembered to reject late deliveries.
    pub fn tombstone_count(&self) -> usize {
        self.resolver.tombstone_len()
    }

    /// Provisional identity of the create registered under `token`.
    pub fn provisional_for(&self, token: &CorrelationToken) -> Option<&str> {
        self.resolver.provisional_for(token)
    }

    /// Apply one event.
    ///
    /// # Errors
    /// See [`ReconcileError`]. Every error leaves the view untouched.
    pub fn apply(&mut self, event: StoreEvent) -> Result<Applied, ReconcileError> {
        match event {
            StoreEvent::LocalCreate { token, fields } => Ok(self.local_create(token, fields)),
            StoreEvent::RestConfirmCreate { token, record } => self.confirm_create(token, record),
            StoreEvent::RestRejectCreate { token, .. } => self.reject_create(token),
            StoreEvent::LocalUpdate { identity, fields } => self.local_update(identity, fields),
            StoreEvent::RestConfirmUpdate { identity, fields } => {
                self.confirm_update(identity, fields)
            }
            StoreEvent::RestRejectUpdate {
                identity, revision, ..
            } => self.reject_update(identity, revision),
            StoreEvent::LocalDelete { identity } => self.local_delete(identity),
            StoreEvent::RestConfirmDelete { identity } => Ok(self.confirm_delete(identity)),
            StoreEvent::RestRejectDelete { identity, .. } => self.reject_delete(identity),
            StoreEvent::PushCreated(record) => self.push_upsert(record, true),
            StoreEvent::PushUpdated(record) => self.push_upsert(record, false),
            StoreEvent::PushDeleted { identity } => Ok(self.push_deleted(identity)),
            StoreEvent::Resync(records) => {
                let now = self.generation;
                Ok(self.resync(records, now))
            }
            StoreEvent::ResyncSince {
                generation,
                records,
            } => Ok(self.resync(records, generation)),
        }
    }

    /// Structural invariants; `false` means a bug in this module.
    ///
    /// - identities are unique
    /// - every provisional record is owned by a pending create
    /// - no tombstoned identity is visible
    pub fn verify_integrity(&self) -> bool {
        let mut seen = BTreeSet::new();
        self.view.iter().all(|r| {
            seen.insert(r.identity.as_str())
                && (!r.provisional || self.resolver.owns_provisional(&r.identity))
                && !self.resolver.is_tombstoned(&r.identity)
        })
    }

    // -----------------------------------------------------------------------
    // Internal: snapshot handling
    // -----------------------------------------------------------------------

    fn working(&self) -> Vec<CanonicalRecord> {
        self.view.records().to_vec()
    }

    /// Publish `records` as the next view unless nothing observable changed.
    fn commit(&mut self, records: Vec<CanonicalRecord>, effect: Effect) -> Applied {
        if same_content(self.view.records(), &records) {
            return Applied {
                effect: Effect::Unchanged,
                view: None,
            };
        }
        self.view = Arc::new(self.view.next(records));
        Applied {
            effect,
            view: Some(Arc::clone(&self.view)),
        }
    }

    fn unchanged(effect: Effect) -> Applied {
        Applied { effect, view: None }
    }

    fn mint_provisional(&mut self) -> String {
        loop {
            self.next_provisional += 1;
            let id = format!("{PROVISIONAL_PREFIX}{:06}", self.next_provisional);
            if self.view.get(&id).is_none() {
                return id;
            }
        }
    }

    /// Stamp `identity` as remotely confirmed at a new generation.
    fn touch(&mut self, identity: &str) {
        self.generation += 1;
        self.remote_seen.insert(identity.to_string(), self.generation);
    }

    /// Remotely touched after `since`.
    fn seen_after(&self, identity: &str, since: u64) -> bool {
        self.remote_seen.get(identity).is_some_and(|g| *g > since)
    }

    /// Remote data seen for `identity` also becomes the rollback baseline.
    fn refresh_baseline(&mut self, identity: &str, remote: &Fields) {
        if let Some(p) = self.pending_updates.get_mut(identity) {
            p.baseline = merge_fields(&p.baseline, remote);
        }
    }

    // -----------------------------------------------------------------------
    // Create
    // -----------------------------------------------------------------------

    fn local_create(&mut self, token: CorrelationToken, fields: Fields) -> Applied {
        // Same intent delivered twice: the first record stands.
        if self.resolver.is_pending(&token) {
            return Self::unchanged(Effect::Unchanged);
        }
        let identity = self.mint_provisional();
        let mut records = self.working();
        records.push(CanonicalRecord {
            identity: identity.clone(),
            fields,
            provisional: true,
            revision: 0,
        });
        self.resolver.register(token, identity.clone());
        self.commit(records, Effect::Inserted { identity })
    }

    fn confirm_create(
        &mut self,
        token: CorrelationToken,
        confirmed: NormalizedRecord,
    ) -> Result<Applied, ReconcileError> {
        let Some(provisional) = self.resolver.take(&token) else {
            return Err(ReconcileError::UnknownEntity {
                event: "RestConfirmCreate",
                identity: token.to_string(),
            });
        };
        let mut records = self.working();
        let Some(pos) = records.iter().position(|r| r.identity == provisional) else {
            return Err(ReconcileError::UnknownEntity {
                event: "RestConfirmCreate",
                identity: provisional,
            });
        };
        let server_id = confirmed.identity;

        let effect = match self.resolver.resolve(&records, &server_id, None) {
            Resolution::Tombstoned => {
                // Deleted remotely before our confirmation landed.
                records.remove(pos);
                Effect::Removed {
                    identity: provisional,
                }
            }
            Resolution::Existing(existing) => {
                // A token-less push already inserted this entity. The merged
                // record takes the provisional slot so the order does not
                // depend on which of the two arrived first.
                let local = records[pos].clone();
                let mut target = records[existing].clone();
                let filled =
                    fill_missing(&fill_missing(&target.fields, &confirmed.fields), &local.fields);
                set_fields(&mut target, filled);
                records[pos] = target;
                records.remove(existing);
                if let Some(p) = self.pending_updates.get_mut(&server_id) {
                    p.baseline = fill_missing(&p.baseline, &confirmed.fields);
                }
                self.touch(&server_id);
                Effect::Folded {
                    provisional,
                    identity: server_id,
                }
            }
            Resolution::New | Resolution::PendingCreate { .. } => {
                let rec = &mut records[pos];
                rec.identity = server_id.clone();
                rec.provisional = false;
                rec.fields = merge_fields(&rec.fields, &confirmed.fields);
                rec.revision += 1;
                self.touch(&server_id);
                Effect::Rebound {
                    provisional,
                    identity: server_id,
                }
            }
        };

        if let Some(held) = self.deferred.remove(&token) {
            self.upsert_into(&mut records, held, true)?;
        }
        Ok(self.commit(records, effect))
    }

    fn reject_create(&mut self, token: CorrelationToken) -> Result<Applied, ReconcileError> {
        let Some(provisional) = self.resolver.take(&token) else {
            return Err(ReconcileError::UnknownEntity {
                event: "RestRejectCreate",
                identity: token.to_string(),
            });
        };
        let mut records = self.working();
        records.retain(|r| r.identity != provisional);
        // The server said no, but a push says the entity exists: trust the push.
        if let Some(held) = self.deferred.remove(&token) {
            self.upsert_into(&mut records, held, true)?;
        }
        Ok(self.commit(
            records,
            Effect::Removed {
                identity: provisional,
            },
        ))
    }

    // -----------------------------------------------------------------------
    // Update
    // -----------------------------------------------------------------------

    fn local_update(&mut self, identity: String, fields: Fields) -> Result<Applied, ReconcileError> {
        let mut records = self.working();
        let Some(idx) = IdentityResolver::position(&records, &identity) else {
            return Err(ReconcileError::UnknownEntity {
                event: "LocalUpdate",
                identity,
            });
        };
        let rec = &mut records[idx];
        let before = rec.fields.clone();
        if !merge_into(rec, &fields) {
            return Ok(Self::unchanged(Effect::Unchanged));
        }
        let revision = rec.revision;
        let pending = self
            .pending_updates
            .entry(identity.clone())
            .or_insert_with(|| PendingUpdate {
                baseline: before,
                latest_local_revision: revision,
                outstanding: 0,
            });
        pending.latest_local_revision = revision;
        pending.outstanding += 1;
        Ok(self.commit(records, Effect::Merged { identity, revision }))
    }

    /// Count one outstanding update as answered.
    fn settle_update(&mut self, identity: &str) {
        if let Some(p) = self.pending_updates.get_mut(identity) {
            p.outstanding = p.outstanding.saturating_sub(1);
            if p.outstanding == 0 {
                self.pending_updates.remove(identity);
            }
        }
    }

    fn confirm_update(&mut self, identity: String, fields: Fields) -> Result<Applied, ReconcileError> {
        self.refresh_baseline(&identity, &fields);
        self.settle_update(&identity);
        if self.resolver.is_tombstoned(&identity) {
            return Ok(Self::unchanged(Effect::Unchanged));
        }

        let mut records = self.working();
        let Some(idx) = IdentityResolver::position(&records, &identity) else {
            if let Some(stash) = self.pending_deletes.get_mut(&identity) {
                stash.record.fields = merge_fields(&stash.record.fields, &fields);
                return Ok(Self::unchanged(Effect::Unchanged));
            }
            return Err(ReconcileError::UnknownEntity {
                event: "RestConfirmUpdate",
                identity,
            });
        };
        merge_into(&mut records[idx], &fields);
        let revision = records[idx].revision;
        self.touch(&identity);
        Ok(self.commit(records, Effect::Merged { identity, revision }))
    }

    fn reject_update(&mut self, identity: String, revision: u64) -> Result<Applied, ReconcileError> {
        let Some(pending) = self.pending_updates.get(&identity).cloned() else {
            // Nothing outstanding to undo (already settled, never tracked, or deleted).
            if self.view.get(&identity).is_some()
                || self.pending_deletes.contains_key(&identity)
                || self.resolver.is_tombstoned(&identity)
            {
                return Ok(Self::unchanged(Effect::Unchanged));
            }
            return Err(ReconcileError::UnknownEntity {
                event: "RestRejectUpdate",
                identity,
            });
        };
        self.settle_update(&identity);

        if pending.latest_local_revision > revision {
            return Err(ReconcileError::RollbackConflict {
                identity,
                rejected_revision: revision,
                local_revision: pending.latest_local_revision,
            });
        }

        let mut records = self.working();
        let Some(idx) = IdentityResolver::position(&records, &identity) else {
            if let Some(stash) = self.pending_deletes.get_mut(&identity) {
                stash.record.fields = pending.baseline;
                return Ok(Self::unchanged(Effect::Unchanged));
            }
            return Err(ReconcileError::UnknownEntity {
                event: "RestRejectUpdate",
                identity,
            });
        };
        set_fields(&mut records[idx], pending.baseline);
        let revision = records[idx].revision;
        Ok(self.commit(records, Effect::Reverted { identity, revision }))
    }

    // -----------------------------------------------------------------------
    // Delete
    // -----------------------------------------------------------------------

    fn local_delete(&mut self, identity: String) -> Result<Applied, ReconcileError> {
        let mut records = self.working();
        let Some(idx) = IdentityResolver::position(&records, &identity) else {
            return Err(ReconcileError::UnknownEntity {
                event: "LocalDelete",
                identity,
            });
        };
        let record = records.remove(idx);
        self.pending_deletes.insert(
            identity.clone(),
            PendingDelete {
                record,
                position: idx,
            },
        );
        Ok(self.commit(records, Effect::Removed { identity }))
    }

    fn confirm_delete(&mut self, identity: String) -> Applied {
        self.pending_deletes.remove(&identity);
        self.forget(&identity);
        let mut records = self.working();
        records.retain(|r| r.provisional || r.identity != identity);
        self.commit(records, Effect::Removed { identity })
    }

    fn reject_delete(&mut self, identity: String) -> Result<Applied, ReconcileError> {
        let Some(stash) = self.pending_deletes.remove(&identity) else {
            return Err(ReconcileError::UnknownEntity {
                event: "RestRejectDelete",
                identity,
            });
        };
        if self.resolver.is_tombstoned(&identity) {
            return Ok(Self::unchanged(Effect::Unchanged));
        }
        let mut records = self.working();
        let mut record = stash.record;
        record.revision += 1;
        let at = stash.position.min(records.len());
        records.insert(at, record);
        self.touch(&identity);
        Ok(self.commit(records, Effect::Restored { identity }))
    }

    /// Tombstone `identity` and drop all bookkeeping that could revive it.
    fn forget(&mut self, identity: &str) {
        self.resolver.tombstone(identity);
        self.pending_updates.remove(identity);
        self.remote_seen.remove(identity);
        self.deferred.retain(|_, d| d.identity != identity);
    }

    // -----------------------------------------------------------------------
    // Push
    // -----------------------------------------------------------------------

    fn push_upsert(&mut self, incoming: NormalizedRecord, created: bool) -> Result<Applied, ReconcileError> {
        let mut records = self.working();
        let effect = self.upsert_into(&mut records, incoming, created)?;
        Ok(self.commit(records, effect))
    }

    /// Shared by push events and replay of deferred push creations.
    fn upsert_into(
        &mut self,
        records: &mut Vec<CanonicalRecord>,
        incoming: NormalizedRecord,
        created: bool,
    ) -> Result<Effect, ReconcileError> {
        let resolution =
            self.resolver
                .resolve(records, &incoming.identity, incoming.correlation.as_ref());
        match resolution {
            Resolution::Tombstoned => return Ok(Effect::Unchanged),
            Resolution::Existing(idx) => {
                self.refresh_baseline(&incoming.identity, &incoming.fields);
                self.touch(&incoming.identity);
                let rec = &mut records[idx];
                merge_into(rec, &incoming.fields);
                return Ok(Effect::Merged {
                    identity: incoming.identity,
                    revision: rec.revision,
                });
            }
            Resolution::PendingCreate { .. } => {
                if let Some(token) = incoming.correlation.clone() {
                    self.defer(token.clone(), incoming);
                    return Ok(Effect::Deferred { token });
                }
            }
            Resolution::New => {}
        }

        if let Some(stash) = self.pending_deletes.get_mut(&incoming.identity) {
            stash.record.fields = merge_fields(&stash.record.fields, &incoming.fields);
            return Ok(Effect::Unchanged);
        }

        if let Some((token, held)) = self
            .deferred
            .iter_mut()
            .find(|(_, d)| d.identity == incoming.identity)
        {
            held.fields = merge_fields(&held.fields, &incoming.fields);
            return Ok(Effect::Deferred {
                token: token.clone(),
            });
        }

        if !created {
            return Err(ReconcileError::UnknownEntity {
                event: "PushUpdated",
                identity: incoming.identity,
            });
        }

        let identity = incoming.identity.clone();
        self.touch(&identity);
        records.push(incoming.into_confirmed());
        Ok(Effect::Inserted { identity })
    }

    fn defer(&mut self, token: CorrelationToken, incoming: NormalizedRecord) {
        match self.deferred.get_mut(&token) {
            Some(held) if held.identity == incoming.identity => {
                held.fields = merge_fields(&held.fields, &incoming.fields);
            }
            _ => {
                self.deferred.insert(token, incoming);
            }
        }
    }

    /// A stashed local delete stays until its REST outcome; the tombstone
    /// keeps a later rejection from restoring it.
    fn push_deleted(&mut self, identity: String) -> Applied {
        self.forget(&identity);
        let mut records = self.working();
        records.retain(|r| r.provisional || r.identity != identity);
        self.commit(records, Effect::Removed { identity })
    }

    // -----------------------------------------------------------------------
    // Resync
    // -----------------------------------------------------------------------

    /// Replace confirmed records with `incoming`, a list fetched when the
    /// store was at generation `since`.
    fn resync(&mut self, incoming: Vec<NormalizedRecord>, since: u64) -> Applied {
        if since < self.resynced_at {
            return Self::unchanged(Effect::Unchanged);
        }
        self.resynced_at = since;
        let current = self.view();
        let mut next: Vec<CanonicalRecord> = Vec::with_capacity(incoming.len());
        let mut seen: BTreeSet<String> = BTreeSet::new();

        for rec in incoming {
            if !seen.insert(rec.identity.clone()) {
                continue;
            }
            let resolution =
                self.resolver
                    .resolve(current.records(), &rec.identity, rec.correlation.as_ref());
            match resolution {
                Resolution::Tombstoned => {}
                Resolution::Existing(idx) => {
                    let mut kept = current.records()[idx].clone();
                    // A row older than what we already know does not win.
                    if !self.seen_after(&rec.identity, since) {
                        self.refresh_baseline(&rec.identity, &rec.fields);
                        merge_into(&mut kept, &rec.fields);
                    }
                    next.push(kept);
                }
                Resolution::PendingCreate { .. } => {
                    if let Some(token) = rec.correlation.clone() {
                        self.defer(token, rec);
                    }
                }
                Resolution::New => {
                    if let Some(stash) = self.pending_deletes.get_mut(&rec.identity) {
                        stash.record.fields = merge_fields(&stash.record.fields, &rec.fields);
                        continue;
                    }
                    next.push(rec.into_confirmed());
                }
            }
        }

        // Confirmed after the fetch started, so the list cannot know them yet.
        let newer: Vec<CanonicalRecord> = current
            .iter()
            .filter(|r| {
                !r.provisional && !seen.contains(&r.identity) && self.seen_after(&r.identity, since)
            })
            .cloned()
            .collect();
        next.extend(newer);

        let kept: BTreeSet<&str> = next.iter().map(|r| r.identity.as_str()).collect();
        self.pending_updates.retain(|id, _| kept.contains(id.as_str()));
        self.remote_seen.retain(|id, _| kept.contains(id.as_str()));

        next.extend(current.iter().filter(|r| r.provisional).cloned());
        let count = next.len();
        self.commit(next, Effect::Resynced { records: count })
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
