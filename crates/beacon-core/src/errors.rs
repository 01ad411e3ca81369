use std::time::Duration;

/// Typed error hierarchy for SDK operations.
/// Classifies errors as transient (retried internally) or logical (surfaced at once).
#[derive(Clone, Debug, thiserror::Error)]
pub enum SdkError {
    // Transient — retried up to the policy bound
    #[error("network failure: {0}")]
    NetworkFailure(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },

    // Terminal
    #[error("request rejected {status}: {body}")]
    BadRequest { status: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<SdkError> },

    // Logical
    #[error("superseded by a newer session")]
    Superseded,
    #[error("persisted state unreadable: {0}")]
    PersistenceCorrupt(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("tracking disabled")]
    TrackingDisabled,
    #[error("sdk shut down")]
    Shutdown,
}

impl SdkError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkFailure(_) | Self::Timeout(_) | Self::Server { .. }
        )
    }

    /// Errors caused by the caller's own sequencing rather than the network.
    pub fn is_logical(&self) -> bool {
        matches!(
            self,
            Self::Superseded | Self::InvalidState(_) | Self::TrackingDisabled | Self::Shutdown
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NetworkFailure(_) => "network_failure",
            Self::Timeout(_) => "timeout",
            Self::Server { .. } => "server_error",
            Self::BadRequest { .. } => "bad_request",
            Self::InvalidResponse(_) => "invalid_response",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Superseded => "superseded",
            Self::PersistenceCorrupt(_) => "persistence_corrupt",
            Self::InvalidState(_) => "invalid_state",
            Self::TrackingDisabled => "tracking_disabled",
            Self::Shutdown => "shutdown",
        }
    }

    /// Classify a non-success HTTP status code.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            408 | 429 | 500..=599 => Self::Server { status, body },
            _ => Self::BadRequest { status, body },
        }
    }
}
