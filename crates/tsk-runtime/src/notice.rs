use serde::{Deserialize, Serialize};
use tsk_reconcile::ReconcileError;

/// Transient message for the presentation layer, which decides what (if
/// anything) the user sees.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub at_ms: i64,
    pub kind: NoticeKind,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// Unnormalizable input was dropped.
    MalformedPayload,
    /// An event referenced an identity the view does not hold.
    UnknownEntity,
    /// A rejection arrived after a newer local edit; the edit was kept.
    RollbackConflict,
    /// The server refused (or never answered) a local mutation; it was undone.
    RolledBack,
    PushConnected,
    PushDisconnected,
    ResyncFailed,
}

impl NoticeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeKind::MalformedPayload => "malformed_payload",
            NoticeKind::UnknownEntity => "unknown_entity",
            NoticeKind::RollbackConflict => "rollback_conflict",
            NoticeKind::RolledBack => "rolled_back",
            NoticeKind::PushConnected => "push_connected",
            NoticeKind::PushDisconnected => "push_disconnected",
            NoticeKind::ResyncFailed => "resync_failed",
        }
    }
}

impl From<&ReconcileError> for NoticeKind {
    fn from(e: &ReconcileError) -> Self {
        match e {
            ReconcileError::MalformedPayload(_) => NoticeKind::MalformedPayload,
            ReconcileError::UnknownEntity { .. } => NoticeKind::UnknownEntity,
            ReconcileError::RollbackConflict { .. } => NoticeKind::RollbackConflict,
        }
    }
}

impl Notice {
    pub fn now(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            at_ms: chrono::Utc::now().timestamp_millis(),
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_kind_in_snake_case() {
        let n = Notice {
            at_ms: 1,
            kind: NoticeKind::RolledBack,
            message: "x".into(),
        };
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v["kind"], "rolled_back");
        assert_eq!(NoticeKind::RolledBack.as_str(), "rolled_back");
    }
}
