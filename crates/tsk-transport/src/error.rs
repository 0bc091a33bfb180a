use std::fmt;

/// Failure at the collaborator boundary.
///
/// `Rejected` is the only variant that means the server looked at the
/// request and said no; every other variant means the outcome is unknown.
/// The runtime turns all of them into a `RestReject*` rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection, TLS or protocol failure.
    Transport(String),
    /// Non-success response.
    Rejected { status: Option<u16>, message: String },
    /// Response body could not be decoded.
    Decode(String),
    /// Bad URL, header or client configuration.
    Config(String),
    Timeout,
    /// The channel was closed by the peer or by shutdown.
    Closed,
}

impl TransportError {
    pub fn rejected(status: impl Into<Option<u16>>, message: impl Into<String>) -> Self {
        Self::Rejected {
            status: status.into(),
            message: message.into(),
        }
    }

    /// Short reason suitable for a rollback notice.
    pub fn reason(&self) -> String {
        match self {
            Self::Rejected { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(m) => write!(f, "transport error: {m}"),
            Self::Rejected {
                status: Some(s),
                message,
            } => write!(f, "rejected (status={s}): {message}"),
            Self::Rejected {
                status: None,
                message,
            } => write!(f, "rejected: {message}"),
            Self::Decode(m) => write!(f, "decode error: {m}"),
            Self::Config(m) => write!(f, "transport config error: {m}"),
            Self::Timeout => write!(f, "request timed out"),
            Self::Closed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else if e.is_builder() {
            Self::Config(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_prefers_server_message() {
        let e = TransportError::rejected(422, "title is required");
        assert_eq!(e.reason(), "title is required");
        assert_eq!(e.to_string(), "rejected (status=422): title is required");
        assert_eq!(TransportError::Timeout.reason(), "request timed out");
    }
}
