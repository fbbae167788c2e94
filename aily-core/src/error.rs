//! Error types shared across the relay core.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the relay core.
///
/// Variants map one-to-one onto the error kinds the rest of the system
/// routes on: transport failures are retried internally, duplicates are
/// absorbed, protocol and storage errors surface to the caller.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A host or platform endpoint is not responding.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// The remote side asked us to back off.
    #[error("rate limited")]
    RateLimited {
        /// Server-provided retry delay, when present.
        retry_after: Option<Duration>,
    },

    /// A session or thread is missing at the endpoint.
    #[error("not found: {0}")]
    NotFound(String),

    /// The wire returned something we cannot interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Deduplication suppressed a write.
    #[error("duplicate")]
    Duplicate,

    /// Bad input from a caller or a platform user.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A deadline elapsed or the caller cancelled.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A platform rejected our credentials. Unrecoverable at startup.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether the operation may succeed if repeated after a delay.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unreachable(_) | Self::RateLimited { .. } | Self::Cancelled(_)
        ) || matches!(self, Self::Http(e) if e.is_connect() || e.is_timeout())
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }

    /// Short label used in log fields and user-facing failure notices.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unreachable(_) => "unreachable",
            Self::RateLimited { .. } => "rate_limited",
            Self::NotFound(_) => "not_found",
            Self::Protocol(_) => "protocol_error",
            Self::Duplicate => "duplicate",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Cancelled(_) => "cancelled",
            Self::AuthRejected(_) => "auth_rejected",
            Self::Storage(_) => "storage_error",
            Self::Http(_) => "http_error",
            Self::WebSocket(_) => "websocket_error",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

impl From<sqlx::Error> for BridgeError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::BridgeError;

    #[test]
    fn retryable_classification() {
        assert!(BridgeError::Unreachable("host a".into()).is_retryable());
        assert!(BridgeError::RateLimited {
            retry_after: Some(Duration::from_secs(2))
        }
        .is_retryable());
        assert!(!BridgeError::NotFound("session x".into()).is_retryable());
        assert!(!BridgeError::Duplicate.is_retryable());
    }

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(BridgeError::Duplicate.kind(), "duplicate");
        assert_eq!(BridgeError::Protocol("bad frame".into()).kind(), "protocol_error");
        assert_eq!(
            BridgeError::RateLimited { retry_after: None }.kind(),
            "rate_limited"
        );
    }
}
