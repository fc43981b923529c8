//! # Error Types
//!
//! Semantic error types for the relay. The distinguished Cortex error codes
//! each map to their own variant because the session state machine routes
//! recovery on them: session reuse, headset re-discovery, or a hard reset.
//! Misclassifying one as another is a correctness bug, so the mapping lives
//! here in one place.

use thiserror::Error;

/// Convenient Result alias for relay operations.
pub type RelayResult<T> = std::result::Result<T, RelayError>;

/// All errors that can occur while acquiring and relaying samples.
#[derive(Error, Debug)]
pub enum RelayError {
    // ─── Connection ─────────────────────────────────────────────────
    /// Failed to establish the control WebSocket connection.
    #[error("failed to connect to Cortex at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// The control connection was lost after being established.
    #[error("connection to Cortex lost: {reason}")]
    ConnectionLost { reason: String },

    // ─── Distinguished session errors ───────────────────────────────
    /// The client credentials were rejected (`-32021`).
    #[error("invalid client credentials: {message}")]
    InvalidCredentials { message: String },

    /// The headset is not available for a session (`-32004`).
    #[error("headset not available: {message}")]
    HeadsetUnavailable { message: String },

    /// A session already exists for this headset (`-32005`).
    #[error("session already exists: {message}")]
    SessionAlreadyExists { message: String },

    /// The session referenced by a subscribe no longer exists (`-32007`).
    #[error("session does not exist: {message}")]
    SessionNotFound { message: String },

    // ─── API ────────────────────────────────────────────────────────
    /// Any other Cortex API error; retried via the generic re-query path.
    #[error("Cortex API error {code}: {message}")]
    Api { code: i32, message: String },

    // ─── Timeout ────────────────────────────────────────────────────
    /// An operation timed out waiting for a response.
    #[error("operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    // ─── Protocol ───────────────────────────────────────────────────
    /// Received an unexpected or malformed message from the service.
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    // ─── Config ─────────────────────────────────────────────────────
    /// Configuration file error (missing, malformed, or invalid values).
    #[error("configuration error: {reason}")]
    Config { reason: String },

    // ─── Transport ──────────────────────────────────────────────────
    /// Low-level WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// TLS error during connection setup.
    #[error("TLS error: {0}")]
    Tls(String),

    // ─── I/O ────────────────────────────────────────────────────────
    /// Filesystem or socket I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    /// Map a Cortex API error code + message to the most specific variant.
    ///
    /// Codes the session state machine distinguishes:
    /// - `-32004`: headset not available
    /// - `-32005`: session already exists
    /// - `-32007`: session does not exist
    /// - `-32021`: invalid client credentials
    ///
    /// Everything else becomes a generic [`RelayError::Api`].
    pub fn from_api_error(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            crate::protocol::ErrorCodes::HEADSET_UNAVAILABLE => {
                RelayError::HeadsetUnavailable { message }
            }
            crate::protocol::ErrorCodes::SESSION_ALREADY_EXISTS => {
                RelayError::SessionAlreadyExists { message }
            }
            crate::protocol::ErrorCodes::SESSION_NOT_FOUND => {
                RelayError::SessionNotFound { message }
            }
            crate::protocol::ErrorCodes::INVALID_CLIENT_CREDENTIALS => {
                RelayError::InvalidCredentials { message }
            }
            _ => RelayError::Api { code, message },
        }
    }

    /// Returns `true` if this error indicates the control connection is dead
    /// and the reconnect driver must rebuild it.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            RelayError::ConnectionFailed { .. }
                | RelayError::ConnectionLost { .. }
                | RelayError::WebSocket(_)
        )
    }
}

// ─── From impls for external error types ────────────────────────────────

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RelayError::WebSocket(err.to_string())
    }
}

impl From<native_tls::Error> for RelayError {
    fn from(err: native_tls::Error) -> Self {
        RelayError::Tls(err.to_string())
    }
}

#[cfg(feature = "config-toml")]
impl From<toml::de::Error> for RelayError {
    fn from(err: toml::de::Error) -> Self {
        RelayError::Config {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_api_error_distinguished_codes() {
        assert!(matches!(
            RelayError::from_api_error(-32004, "headset unavailable"),
            RelayError::HeadsetUnavailable { .. }
        ));
        assert!(matches!(
            RelayError::from_api_error(-32005, "session already exists"),
            RelayError::SessionAlreadyExists { .. }
        ));
        assert!(matches!(
            RelayError::from_api_error(-32007, "session does not exist"),
            RelayError::SessionNotFound { .. }
        ));
        assert!(matches!(
            RelayError::from_api_error(-32021, "invalid credentials"),
            RelayError::InvalidCredentials { .. }
        ));
    }

    #[test]
    fn test_from_api_error_generic_code() {
        let err = RelayError::from_api_error(-32999, "something else");
        assert!(matches!(err, RelayError::Api { code: -32999, .. }));
        assert!(err.to_string().contains("something else"));
    }

    #[test]
    fn test_is_connection_error() {
        assert!(RelayError::ConnectionLost { reason: "x".into() }.is_connection_error());
        assert!(RelayError::ConnectionFailed {
            url: "wss://localhost:6868".into(),
            reason: "refused".into(),
        }
        .is_connection_error());
        assert!(RelayError::WebSocket("closed".into()).is_connection_error());
        assert!(!RelayError::Timeout { seconds: 5 }.is_connection_error());
        assert!(!RelayError::SessionNotFound { message: "x".into() }.is_connection_error());
    }

    #[test]
    fn test_from_tungstenite_error() {
        let ws_error = tokio_tungstenite::tungstenite::Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "broken pipe",
        ));
        let err: RelayError = ws_error.into();
        assert!(matches!(err, RelayError::WebSocket(_)));
    }
}
