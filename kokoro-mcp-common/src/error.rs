//! Error types shared by the Kokoro MCP crates.
//!
//! The hierarchy follows the layers a streaming request passes through:
//!
//! - `SessionError`: caller-input errors (`InvalidState`, `NotFound`), the
//!   reserved `Segmentation` error and the fatal `Synthesis` error
//! - `EngineError`: failures reported by the external speech engine
//! - `StoreError`: audio payload storage and cleanup failures
//! - `ConfigError`: missing or invalid configuration
//! - `Error`: umbrella type with `From` conversions for all of the above

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the Kokoro MCP servers.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors (invalid env vars, unusable directories)
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Session lifecycle errors
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Speech engine errors
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Audio payload storage errors
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Input validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// File system I/O errors
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a new validation error.
    ///
    /// # Example
    ///
    /// ```
    /// use kokoro_mcp_common::error::Error;
    ///
    /// let err = Error::validation("text cannot be empty");
    /// assert!(err.to_string().contains("text cannot be empty"));
    /// ```
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// Whether the error was caused by the caller's input rather than by the
    /// engine or the host.
    pub fn is_caller_error(&self) -> bool {
        match self {
            Error::Validation(_) => true,
            Error::Session(e) => e.is_caller_error(),
            Error::Engine(EngineError::InvalidVoice(_)) => true,
            Error::Store(e) => e.is_caller_error(),
            _ => false,
        }
    }
}

/// Session lifecycle errors.
///
/// `InvalidState` and `NotFound` are returned synchronously from the call that
/// triggered them and never change the session. `Synthesis` is reported through
/// the session's event stream and always ends the session.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    /// The operation is not valid in the session's current state
    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        /// The rejected operation (e.g. "push text")
        operation: &'static str,
        /// Display name of the state the session was in
        state: String,
    },

    /// No session exists with the given id
    #[error("Session not found: {0}")]
    NotFound(String),

    /// The input buffer could not be segmented
    #[error("Segmentation error: {0}")]
    Segmentation(String),

    /// The engine failed (or timed out) while synthesizing a segment
    #[error("Synthesis failed for segment {segment:?}: {cause}")]
    Synthesis {
        /// Text of the segment that failed
        segment: String,
        /// Underlying engine failure
        cause: String,
    },
}

impl SessionError {
    /// Create a new invalid state error.
    pub fn invalid_state(operation: &'static str, state: impl ToString) -> Self {
        SessionError::InvalidState {
            operation,
            state: state.to_string(),
        }
    }

    /// Create a new not found error.
    pub fn not_found(id: impl Into<String>) -> Self {
        SessionError::NotFound(id.into())
    }

    /// Create a new synthesis error for the given segment.
    ///
    /// # Example
    ///
    /// ```
    /// use kokoro_mcp_common::error::SessionError;
    ///
    /// let err = SessionError::synthesis("hello ", "model exploded");
    /// assert!(err.to_string().contains("hello"));
    /// assert!(err.to_string().contains("model exploded"));
    /// ```
    pub fn synthesis(segment: impl Into<String>, cause: impl ToString) -> Self {
        SessionError::Synthesis {
            segment: segment.into(),
            cause: cause.to_string(),
        }
    }

    /// Whether this error stems from caller input.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            SessionError::InvalidState { .. } | SessionError::NotFound(_)
        )
    }
}

/// Errors reported by the external speech engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// HTTP API error with endpoint and status context
    #[error("API error for {endpoint} (HTTP {status_code}): {message}")]
    Api {
        /// The API endpoint that was called
        endpoint: String,
        /// HTTP status code returned by the API (0 when no response arrived)
        status_code: u16,
        /// Error message from the API or describing the failure
        message: String,
    },

    /// The requested voice id is not known to the engine
    #[error("Invalid voice_id: {0}")]
    InvalidVoice(String),

    /// The engine returned no audio for the input
    #[error("Engine returned no audio for the input")]
    EmptyAudio,

    /// The call did not finish within the configured timeout
    #[error("Synthesis timed out after {0:?}")]
    Timeout(Duration),
}

impl EngineError {
    /// Create a new API error with endpoint, status code, and message.
    ///
    /// # Example
    ///
    /// ```
    /// use kokoro_mcp_common::error::EngineError;
    ///
    /// let err = EngineError::api("http://127.0.0.1:8880/v1/audio/speech", 500, "boom");
    /// assert!(err.to_string().contains("/v1/audio/speech"));
    /// assert!(err.to_string().contains("500"));
    /// ```
    pub fn api(endpoint: impl Into<String>, status_code: u16, message: impl Into<String>) -> Self {
        EngineError::Api {
            endpoint: endpoint.into(),
            status_code,
            message: message.into(),
        }
    }
}

/// Audio payload storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The audio URI is malformed or does not name a file
    #[error("Invalid audio URI: {0}")]
    InvalidUri(String),

    /// The URI resolves to a path outside the audio directory
    #[error("Invalid audio URI (path mismatch): {0}")]
    OutsideDirectory(String),

    /// No payload is stored under the reference
    #[error("Unknown audio reference: {0}")]
    UnknownRef(String),

    /// File system failure while writing or deleting a payload
    #[error("Audio store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether this error stems from caller input.
    pub fn is_caller_error(&self) -> bool {
        !matches!(self, StoreError::Io(_))
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is not set
    #[error("Required environment variable {0} is not set")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl ConfigError {
    /// Create a new missing environment variable error.
    pub fn missing_env_var(name: impl Into<String>) -> Self {
        ConfigError::MissingEnvVar(name.into())
    }

    /// Create a new invalid value error.
    pub fn invalid_value(name: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue(name.into(), reason.into())
    }
}

/// Result type alias using the unified Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_names_operation_and_state() {
        let err = SessionError::invalid_state("push text", "draining");
        let msg = err.to_string();
        assert!(msg.contains("push text"));
        assert!(msg.contains("draining"));
    }

    #[test]
    fn test_not_found_includes_id() {
        let err = SessionError::not_found("abc-123");
        assert!(err.to_string().contains("abc-123"));
    }

    #[test]
    fn test_engine_api_error_includes_endpoint_and_status() {
        let err = EngineError::api("http://localhost:8880/v1/audio/voices", 503, "unavailable");
        let msg = err.to_string();
        assert!(msg.contains("localhost:8880"));
        assert!(msg.contains("503"));
        assert!(msg.contains("unavailable"));
    }

    #[test]
    fn test_timeout_error() {
        let err = EngineError::Timeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30s"));
    }

    #[test]
    fn test_sub_second_timeout_keeps_precision() {
        let err = EngineError::Timeout(Duration::from_millis(250));
        assert!(err.to_string().ends_with("after 250ms"));
    }

    #[test]
    fn test_error_from_session_error() {
        let err: Error = SessionError::not_found("x").into();
        assert!(matches!(err, Error::Session(_)));
        assert!(err.is_caller_error());
    }

    #[test]
    fn test_error_from_engine_error() {
        let err: Error = EngineError::EmptyAudio.into();
        assert!(matches!(err, Error::Engine(_)));
        assert!(!err.is_caller_error());
    }

    #[test]
    fn test_invalid_voice_is_caller_error() {
        let err: Error = EngineError::InvalidVoice("zz_nobody".into()).into();
        assert!(err.is_caller_error());
    }

    #[test]
    fn test_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_store_errors_classification() {
        assert!(StoreError::InvalidUri("nope".into()).is_caller_error());
        assert!(StoreError::OutsideDirectory("../x".into()).is_caller_error());
        let io = StoreError::Io(std::io::Error::other("disk"));
        assert!(!io.is_caller_error());
    }

    #[test]
    fn test_synthesis_error_is_not_caller_error() {
        let err = SessionError::synthesis("hi ", "bad");
        assert!(!err.is_caller_error());
    }
}
