use std::fmt;

use tsk_reconcile::ReconcileError;
use tsk_transport::TransportError;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The engine loop is gone; the request was not processed.
    Stopped,
    /// The store refused the local intent.
    Rejected(ReconcileError),
    /// A collaborator call the caller waits on failed (resync).
    Transport(TransportError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Stopped => write!(f, "sync engine stopped"),
            EngineError::Rejected(e) => write!(f, "intent rejected: {e}"),
            EngineError::Transport(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Stopped => None,
            EngineError::Rejected(e) => Some(e),
            EngineError::Transport(e) => Some(e),
        }
    }
}

impl From<ReconcileError> for EngineError {
    fn from(e: ReconcileError) -> Self {
        EngineError::Rejected(e)
    }
}
