use std::time::Duration;

/// Result alias used across the rave crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy shared by the VM orchestrator and the chat bridge.
///
/// Every public operation returns one of these kinds; only genuine bugs
/// propagate as panics. The bridge maps kinds to HTTP statuses, the CLI
/// maps them to exit codes and one-line messages.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Ill-formed input: command syntax, tenant name, port range, unknown layer.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown subject, missing/invalid token, or lockout.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Known subject lacking the required group or role.
    #[error("authorization error: {0}")]
    Authorization(String),

    /// No such tenant, layer, or agent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate tenant, already-running VM, duplicate override target.
    #[error("conflict: {0}")]
    Conflict(String),

    /// No free port, disk-image creation failure, missing prerequisite tool.
    #[error("resource error: {0}")]
    Resource(String),

    /// SSH timeout, process timeout, upstream 5xx. Retried before surfacing.
    #[error("transient error: {0}")]
    Transient(String),

    /// A circuit breaker refused the call.
    #[error("circuit breaker '{name}' is open; retry after {retry_after:?}")]
    CircuitOpen {
        name: String,
        retry_after: Duration,
    },

    /// Audit-log HMAC mismatch.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Bug class. Logged with full detail, never surfaced verbatim remotely.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    pub fn authorization(msg: impl Into<String>) -> Self {
        Self::Authorization(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the retry protocol should re-attempt this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Short stable tag for metrics labels and audit event details.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Authentication(_) => "authentication",
            Self::Authorization(_) => "authorization",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Resource(_) => "resource",
            Self::Transient(_) => "transient",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Integrity(_) => "integrity",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Validation(format!("invalid JSON: {e}"))
    }
}
