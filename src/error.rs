//! Error types for the cluster-hub plugin.
//!
//! One unified error enum covers the whole plugin surface:
//! - Transport errors (HTTP failures, socket close, timeouts)
//! - Protocol errors (malformed or unexpected frames — logged and dropped)
//! - Logical errors (unknown task, not registered) surfaced as verb replies
//! - Gateway errors from the local agent RPC
//! - Cancellation, which is first-class rather than an error string

/// Unified error type for hub, gateway, queue, and verb operations.
///
/// Variants carry a human-readable message; errors are surfaced at the
/// boundary where they are actionable (verb reply, result frame) and
/// otherwise logged and swallowed (frame dispatch, store writes).
#[derive(Debug, Clone, thiserror::Error)]
pub enum HubError {
    /// Connection-level failure (connect refused, socket error, TLS, DNS).
    #[error("transport error: {0}")]
    Transport(String),

    /// A request or agent wait exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The hub returned a non-success HTTP status.
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body text.
        body: String,
    },

    /// The hub accepted the request but reported a failure in its envelope.
    #[error("hub error: {0}")]
    Hub(String),

    /// A payload could not be parsed or deserialized.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// A frame violated the wire protocol (unknown type, missing field).
    ///
    /// Protocol errors are logged at debug and the frame is dropped; this
    /// variant exists for the few places that need to report one upward.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A verb was called with missing or malformed parameters.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// The referenced task does not exist in any store or pool.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// The node has no identity; `register` has not been called.
    #[error("node is not registered")]
    NotRegistered,

    /// The hub socket is not connected.
    #[error("not connected to hub")]
    NotConnected,

    /// The local agent gateway RPC failed.
    #[error("gateway error: {0}")]
    Gateway(String),

    /// The operation was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Configuration file could not be read or written.
    #[error("config error: {0}")]
    Config(String),
}

/// Convenience result type for cluster-hub operations.
pub type HubResult<T> = Result<T, HubError>;

impl HubError {
    /// Create a `Transport` error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a `Timeout` error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    /// Create an `InvalidParams` error.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams(message.into())
    }

    /// Create a `Gateway` error.
    pub fn gateway(message: impl Into<String>) -> Self {
        Self::Gateway(message.into())
    }

    /// Create a `Protocol` error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Whether this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HubError::Cancelled)
    }

    /// Whether this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, HubError::Timeout(_))
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::InvalidJson(err.to_string())
    }
}

impl From<std::io::Error> for HubError {
    fn from(err: std::io::Error) -> Self {
        HubError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_message() {
        let err = HubError::transport("connection refused");
        assert_eq!(err.to_string(), "transport error: connection refused");
    }

    #[test]
    fn http_error_formats_status_and_body() {
        let err = HubError::Http {
            status: 401,
            body: "bad token".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 401: bad token");
    }

    #[test]
    fn cancelled_is_flagged() {
        assert!(HubError::Cancelled.is_cancelled());
        assert!(!HubError::NotConnected.is_cancelled());
    }

    #[test]
    fn serde_error_maps_to_invalid_json() {
        let parse_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: HubError = parse_err.into();
        assert!(matches!(err, HubError::InvalidJson(_)));
    }
}
