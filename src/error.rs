//! Error handling for the mining engine
//!
//! Error types covering job assembly, target arithmetic, hash engines and the
//! surrounding configuration and I/O, with categories for structured logging.

use thiserror::Error;

/// Result type alias for mining engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the mining engine
#[derive(Error, Debug)]
pub enum Error {
    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hex decoding errors
    #[error("Hex decoding error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Malformed upstream job data
    #[error("Invalid job: {message}")]
    Job { message: String },

    /// Target and difficulty errors
    #[error("Invalid target: {message}")]
    Target { message: String },

    /// Hash engine errors
    #[error("Engine error: {engine_type}: {message}")]
    Engine { engine_type: String, message: String },

    /// Hash accelerator faults
    #[error("Accelerator fault: {message}")]
    Accelerator { message: String },

    /// Operation attempted in the wrong coordinator state
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Cancellation during shutdown
    #[error("Operation was cancelled: {operation}")]
    Cancelled { operation: String },
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a job error
    pub fn job(message: impl Into<String>) -> Self {
        Self::Job {
            message: message.into(),
        }
    }

    /// Create a target error
    pub fn target(message: impl Into<String>) -> Self {
        Self::Target {
            message: message.into(),
        }
    }

    /// Create an engine error
    pub fn engine(engine_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Engine {
            engine_type: engine_type.into(),
            message: message.into(),
        }
    }

    /// Create an accelerator error
    pub fn accelerator(message: impl Into<String>) -> Self {
        Self::Accelerator {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Whether the engine handles this error locally and keeps running
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Job { .. } | Error::Hex(_) | Error::Accelerator { .. } | Error::Target { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Io(_) => "io",
            Error::Hex(_) => "hex",
            Error::Config { .. } => "config",
            Error::Job { .. } => "job",
            Error::Target { .. } => "target",
            Error::Engine { .. } => "engine",
            Error::Accelerator { .. } => "accelerator",
            Error::InvalidState { .. } => "invalid_state",
            Error::Cancelled { .. } => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_error_categories() {
        assert_eq!(Error::job("bad").category(), "job");
        assert_eq!(Error::accelerator("off").category(), "accelerator");
        assert_eq!(Error::engine("software", "x").category(), "engine");
        assert_eq!(Error::config("x").category(), "config");
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::job("oversized coinbase").is_recoverable());
        assert!(Error::accelerator("disabled").is_recoverable());
        assert!(!Error::config("both engines disabled").is_recoverable());
        assert!(!Error::cancelled("search").is_recoverable());
    }

    #[test]
    fn test_hex_error_conversion() {
        let err: Error = hex::decode("zz").unwrap_err().into();
        assert_matches!(err, Error::Hex(_));
        assert!(err.to_string().starts_with("Hex decoding error"));
    }

    #[test]
    fn test_engine_error_display() {
        let err = Error::engine("accelerator", "busy timeout");
        assert_eq!(err.to_string(), "Engine error: accelerator: busy timeout");
    }
}
