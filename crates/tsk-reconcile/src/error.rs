use crate::normalizer::MalformedPayload;

/// Errors surfaced by [`ReconcileStore::apply`](crate::ReconcileStore::apply).
///
/// None of these is fatal. Store state is unaffected by the event that
/// produced the error, except for the bookkeeping noted on each variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Unnormalizable input; the event is dropped.
    MalformedPayload(MalformedPayload),
    /// An update, delete or confirmation names an identity (or token) the
    /// store does not hold. Legitimate under reordering; treated as a no-op.
    UnknownEntity { event: &'static str, identity: String },
    /// A rejection arrived for an update that a newer local update has
    /// already superseded. The rollback is discarded so newer input survives;
    /// the rejected update no longer counts as outstanding.
    RollbackConflict {
        identity: String,
        rejected_revision: u64,
        local_revision: u64,
    },
}

impl std::fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedPayload(inner) => write!(f, "{inner}"),
            Self::UnknownEntity { event, identity } => {
                write!(f, "{event}: unknown entity '{identity}' (ignored)")
            }
            Self::RollbackConflict {
                identity,
                rejected_revision,
                local_revision,
            } => write!(
                f,
                "rollback of '{identity}' at revision {rejected_revision} discarded: \
                 superseded by local revision {local_revision}"
            ),
        }
    }
}

impl std::error::Error for ReconcileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::MalformedPayload(inner) => Some(inner),
            _ => None,
        }
    }
}

impl From<MalformedPayload> for ReconcileError {
    fn from(e: MalformedPayload) -> Self {
        Self::MalformedPayload(e)
    }
}

impl ReconcileError {
    /// Stable short name used in logs and notices.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedPayload(_) => "malformed_payload",
            Self::UnknownEntity { .. } => "unknown_entity",
            Self::RollbackConflict { .. } => "rollback_conflict",
        }
    }
}
