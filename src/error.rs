//! Error types for Foreman.
//!
//! This module defines `ForemanError`, the unified error type used throughout
//! the crate for consistent error handling and propagation.
//!
//! # Security
//!
//! Error messages may be built from server responses. Passwords must never
//! leak through them: use `sanitize_message()` when an error could echo
//! something the user typed.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for all Foreman operations.
///
/// A declined credential prompt is deliberately absent from the request
/// layer's error path: requests report it as "no result". The
/// `CredentialDenied` variant exists for callers that must turn that outcome
/// into a message.
#[derive(Error, Debug)]
pub enum ForemanError {
    /// Configuration error - missing or invalid environment variables.
    #[error("configuration error: {0}")]
    Config(String),

    /// The `WWW-Authenticate` challenge was absent or unparseable.
    #[error("cannot authenticate: malformed challenge header")]
    MalformedChallenge,

    /// The server only offered an authentication mode we do not implement.
    #[error("cannot authenticate: {mode} is not supported")]
    UnsupportedAuthMode {
        /// The offered mode, e.g. `auth-int`.
        mode: String,
    },

    /// The user declined or cancelled a required credential prompt.
    #[error("authentication was declined")]
    CredentialDenied,

    /// The server answered with a non-success status.
    #[error("server error ({status}): {message}")]
    ServerError {
        /// The HTTP status code returned.
        status: reqwest::StatusCode,
        /// Decoded error message, or the status reason text.
        message: String,
    },

    /// HTTP request failed during transmission.
    #[error("HTTP request failed: {0}")]
    Transport(#[source] reqwest::Error),

    /// HTTP client initialization failed.
    #[error("HTTP client error: {0}")]
    HttpClient(#[source] reqwest::Error),

    /// Request timed out.
    #[error("request timed out after {duration:?} - the server may be slow or unreachable")]
    Timeout {
        /// How long we waited before timing out.
        duration: Duration,
        /// The operation that timed out.
        operation: String,
    },

    /// The response had an unexpected shape.
    #[error("unexpected response: {0}")]
    Protocol(String),

    /// JSON serialization or deserialization failed.
    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Input validation failed.
    #[error("validation error: {0}")]
    Validation(String),

    /// Connection test failed.
    #[error("connection test failed: {message}")]
    ConnectionTest {
        /// Details about why the connection test failed.
        message: String,
    },
}

impl ForemanError {
    /// Creates a configuration error for a missing environment variable.
    pub fn missing_env(var_name: &str) -> Self {
        ForemanError::Config(format!(
            "missing required environment variable: {}",
            var_name
        ))
    }

    /// Creates a configuration error for an invalid value.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        ForemanError::Config(message.into())
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        ForemanError::Validation(message.into())
    }

    /// Creates a protocol error for a response that does not look like the API.
    pub fn protocol(message: impl Into<String>) -> Self {
        ForemanError::Protocol(message.into())
    }

    /// Creates an unsupported-auth-mode error.
    pub fn unsupported_auth(mode: impl Into<String>) -> Self {
        ForemanError::UnsupportedAuthMode { mode: mode.into() }
    }

    /// Creates a server error from a status and a decoded message.
    pub fn server(status: reqwest::StatusCode, message: impl Into<String>) -> Self {
        ForemanError::ServerError {
            status,
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(duration: Duration, operation: impl Into<String>) -> Self {
        ForemanError::Timeout {
            duration,
            operation: operation.into(),
        }
    }

    /// Creates a connection test error.
    pub fn connection_test(message: impl Into<String>) -> Self {
        ForemanError::ConnectionTest {
            message: message.into(),
        }
    }

    /// Returns true if this error came from the authentication machinery
    /// rather than from the server or the network.
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            ForemanError::MalformedChallenge
                | ForemanError::UnsupportedAuthMode { .. }
                | ForemanError::CredentialDenied
        )
    }

    /// Sanitizes an error message to remove any occurrence of a secret.
    ///
    /// # Arguments
    ///
    /// * `message` - The message to sanitize
    /// * `secret` - The secret (usually the password) to strip from the message
    ///
    /// # Returns
    ///
    /// The message with any occurrence of the secret replaced with `[REDACTED]`
    #[must_use]
    pub fn sanitize_message(message: &str, secret: &str) -> String {
        if secret.is_empty() {
            return message.to_string();
        }
        message.replace(secret, "[REDACTED]")
    }

    /// Creates a sanitized version of this error's display message.
    #[must_use]
    pub fn sanitized_display(&self, secret: &str) -> String {
        Self::sanitize_message(&self.to_string(), secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_env_error() {
        let err = ForemanError::missing_env("BUILDBOT_URL");
        assert!(err.to_string().contains("BUILDBOT_URL"));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_validation_error() {
        let err = ForemanError::validation("builder is required");
        assert_eq!(err.to_string(), "validation error: builder is required");
    }

    #[test]
    fn test_unsupported_auth_mode_message() {
        let err = ForemanError::unsupported_auth("auth-int");
        assert_eq!(
            err.to_string(),
            "cannot authenticate: auth-int is not supported"
        );
        assert!(err.is_auth_failure());
    }

    #[test]
    fn test_server_error_message() {
        let err = ForemanError::server(reqwest::StatusCode::BAD_REQUEST, "builderid: invalid");
        let msg = err.to_string();
        assert!(msg.contains("400"));
        assert!(msg.contains("builderid: invalid"));
        assert!(!err.is_auth_failure());
    }

    #[test]
    fn test_timeout_error() {
        let err = ForemanError::timeout(Duration::from_secs(3), "GET builders");
        let msg = err.to_string();
        assert!(msg.contains("timed out"));
        assert!(msg.contains("3s"));
    }

    #[test]
    fn test_sanitize_message_removes_secret() {
        let secret = "Circle Of Life";
        let message = format!("login failed for password {}", secret);
        let sanitized = ForemanError::sanitize_message(&message, secret);
        assert!(!sanitized.contains(secret));
        assert!(sanitized.contains("[REDACTED]"));
    }

    #[test]
    fn test_sanitize_message_empty_secret() {
        let message = "Some error message";
        let sanitized = ForemanError::sanitize_message(message, "");
        assert_eq!(sanitized, message);
    }

    #[test]
    fn test_connection_test_error() {
        let err = ForemanError::connection_test("Could not reach server");
        let msg = err.to_string();
        assert!(msg.contains("connection test failed"));
        assert!(msg.contains("Could not reach server"));
    }
}
