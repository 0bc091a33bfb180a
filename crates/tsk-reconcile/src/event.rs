//! Store events and their results.

use std::sync::Arc;

use serde_json::Value;

use crate::normalizer::{normalize_identity, normalize_record, MalformedPayload, NormalizedRecord};
use crate::{CorrelationToken, Fields, View};

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// Which input source produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// User intent, applied optimistically before the server answers.
    Local,
    /// Synchronous REST outcome of a local intent.
    Rest,
    /// Notification describing another client's mutation.
    Push,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Local => "local",
            Channel::Rest => "rest",
            Channel::Push => "push",
        }
    }
}

// ---------------------------------------------------------------------------
// Push event names
// ---------------------------------------------------------------------------

/// Named push events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKind {
    Created,
    Updated,
    Deleted,
}

impl PushKind {
    /// Accepts both `created` and the namespaced `task:created` forms.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        let bare = name.strip_prefix("task:").unwrap_or(name);
        match bare.to_ascii_lowercase().as_str() {
            "created" => Some(PushKind::Created),
            "updated" => Some(PushKind::Updated),
            "deleted" => Some(PushKind::Deleted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PushKind::Created => "created",
            PushKind::Updated => "updated",
            PushKind::Deleted => "deleted",
        }
    }
}

// ---------------------------------------------------------------------------
// StoreEvent
// ---------------------------------------------------------------------------

/// Every input the store accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    LocalCreate {
        token: CorrelationToken,
        fields: Fields,
    },
    RestConfirmCreate {
        token: CorrelationToken,
        record: NormalizedRecord,
    },
    RestRejectCreate {
        token: CorrelationToken,
        reason: String,
    },
    LocalUpdate {
        identity: String,
        fields: Fields,
    },
    RestConfirmUpdate {
        identity: String,
        fields: Fields,
    },
    /// `revision` is the one the rejected local update produced.
    RestRejectUpdate {
        identity: String,
        revision: u64,
        reason: String,
    },
    LocalDelete {
        identity: String,
    },
    RestConfirmDelete {
        identity: String,
    },
    RestRejectDelete {
        identity: String,
        reason: String,
    },
    PushCreated(NormalizedRecord),
    PushUpdated(NormalizedRecord),
    PushDeleted {
        identity: String,
    },
    /// Authoritative full list, current as of now.
    Resync(Vec<NormalizedRecord>),
    /// Full list whose fetch started when the store was at `generation`
    /// (see [`ReconcileStore::generation`](crate::ReconcileStore::generation)).
    /// Records confirmed remotely after that point outrank the list.
    ResyncSince {
        generation: u64,
        records: Vec<NormalizedRecord>,
    },
}

impl StoreEvent {
    /// Normalize a raw push payload into the matching event.
    pub fn from_push(kind: PushKind, payload: &Value) -> Result<StoreEvent, MalformedPayload> {
        Ok(match kind {
            PushKind::Created => StoreEvent::PushCreated(normalize_record(payload)?),
            PushKind::Updated => StoreEvent::PushUpdated(normalize_record(payload)?),
            PushKind::Deleted => StoreEvent::PushDeleted {
                identity: normalize_identity(payload)?,
            },
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            StoreEvent::LocalCreate { .. } => "LocalCreate",
            StoreEvent::RestConfirmCreate { .. } => "RestConfirmCreate",
            StoreEvent::RestRejectCreate { .. } => "RestRejectCreate",
            StoreEvent::LocalUpdate { .. } => "LocalUpdate",
            StoreEvent::RestConfirmUpdate { .. } => "RestConfirmUpdate",
            StoreEvent::RestRejectUpdate { .. } => "RestRejectUpdate",
            StoreEvent::LocalDelete { .. } => "LocalDelete",
            StoreEvent::RestConfirmDelete { .. } => "RestConfirmDelete",
            StoreEvent::RestRejectDelete { .. } => "RestRejectDelete",
            StoreEvent::PushCreated(_) => "PushCreated",
            StoreEvent::PushUpdated(_) => "PushUpdated",
            StoreEvent::PushDeleted { .. } => "PushDeleted",
            StoreEvent::Resync(_) => "Resync",
            StoreEvent::ResyncSince { .. } => "ResyncSince",
        }
    }

    pub fn channel(&self) -> Channel {
        match self {
            StoreEvent::LocalCreate { .. }
            | StoreEvent::LocalUpdate { .. }
            | StoreEvent::LocalDelete { .. } => Channel::Local,
            StoreEvent::PushCreated(_)
            | StoreEvent::PushUpdated(_)
            | StoreEvent::PushDeleted { .. } => Channel::Push,
            _ => Channel::Rest,
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// What an accepted event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Inserted { identity: String },
    /// Provisional record took its server identity in place.
    Rebound { provisional: String, identity: String },
    /// Provisional record dissolved into an already-present confirmed record.
    Folded { provisional: String, identity: String },
    Merged { identity: String, revision: u64 },
    /// Pending local update undone.
    Reverted { identity: String, revision: u64 },
    Removed { identity: String },
    /// Optimistically deleted record put back.
    Restored { identity: String },
    /// Held until the create bridged by `token` resolves.
    Deferred { token: CorrelationToken },
    Resynced { records: usize },
    /// Accepted; nothing observable changed.
    Unchanged,
}

/// Result of an accepted event.
#[derive(Debug, Clone)]
pub struct Applied {
    pub effect: Effect,
    /// The replacement snapshot, present only when the event changed the view.
    pub view: Option<Arc<View>>,
}

impl Applied {
    pub fn emitted(&self) -> bool {
        self.view.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn push_kind_accepts_both_spellings() {
        assert_eq!(PushKind::parse("task:created"), Some(PushKind::Created));
        assert_eq!(PushKind::parse("updated"), Some(PushKind::Updated));
        assert_eq!(PushKind::parse(" task:DELETED "), Some(PushKind::Deleted));
        assert_eq!(PushKind::parse("task:archived"), None);
    }

    #[test]
    fn from_push_normalizes_payload() {
        let ev = StoreEvent::from_push(PushKind::Deleted, &json!({"id": "srv-5"})).unwrap();
        assert_eq!(
            ev,
            StoreEvent::PushDeleted {
                identity: "srv-5".to_string()
            }
        );
        assert_eq!(ev.channel(), Channel::Push);

        let err = StoreEvent::from_push(PushKind::Updated, &json!({"title": "x"})).unwrap_err();
        assert_eq!(err, MalformedPayload::MissingIdentity);
    }
}
