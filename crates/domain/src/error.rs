/// Shared error type used across all Confab crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Network-level failures: connection resets, timeouts, provider 5xx,
    /// database deadlocks. Retryable within a processor's own budget.
    #[error("transport: {0}")]
    Transport(String),

    #[error("database: {0}")]
    Database(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("asset: {0}")]
    Asset(String),

    #[error("config: {0}")]
    Config(String),

    /// The thread lease is held by another worker.
    #[error("lease denied: {0}")]
    LeaseDenied(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse failure categories driving retry and propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// May succeed on retry (network, 5xx, deadlock).
    Transient,
    /// Bad input; retrying cannot help.
    Permanent,
    /// The caller aborted the run.
    Cancelled,
    /// Infrastructure is broken (DB unreachable, missing migrations).
    Fatal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Fatal => "fatal",
        }
    }
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Transport(_) => ErrorCategory::Transient,
            Error::Cancelled => ErrorCategory::Cancelled,
            Error::Database(_) | Error::Config(_) => ErrorCategory::Fatal,
            Error::Io(_)
            | Error::Json(_)
            | Error::Provider { .. }
            | Error::Validation(_)
            | Error::NotFound(_)
            | Error::Asset(_)
            | Error::LeaseDenied(_)
            | Error::Other(_) => ErrorCategory::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_is_transient() {
        assert!(Error::Transport("connection reset".into()).is_transient());
        assert!(!Error::Validation("missing field".into()).is_transient());
    }

    #[test]
    fn categories_map_to_taxonomy() {
        assert_eq!(Error::Cancelled.category(), ErrorCategory::Cancelled);
        assert_eq!(
            Error::Database("unreachable".into()).category(),
            ErrorCategory::Fatal
        );
        assert_eq!(
            Error::NotFound("agent".into()).category(),
            ErrorCategory::Permanent
        );
    }
}
