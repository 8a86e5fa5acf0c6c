//! Common error types for meshbed.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`MeshbedError`].
pub type MeshbedResult<T> = Result<T, MeshbedError>;

/// Common errors across meshbed crates.
#[derive(Error, Diagnostic, Debug)]
pub enum MeshbedError {
    /// Invalid container ID format.
    #[error("Invalid container ID: {id}")]
    #[diagnostic(
        code(meshbed::container::invalid_id),
        help("Container IDs must be alphanumeric with hyphens and underscores, 1-64 characters")
    )]
    InvalidContainerId {
        /// The invalid container ID.
        id: String,
    },

    /// Invalid bandwidth quantity.
    #[error("Invalid bandwidth: {value}")]
    #[diagnostic(
        code(meshbed::bandwidth::invalid),
        help("Use formats like '100mbit', '1gbit', '512kbit' or a plain number of bits per second")
    )]
    InvalidBandwidth {
        /// The invalid value.
        value: String,
    },

    /// A shaping parameter is outside its allowed range.
    #[error("Invalid link shape: {message}")]
    #[diagnostic(code(meshbed::shape::invalid))]
    InvalidShape {
        /// What was wrong.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(meshbed::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(meshbed::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(meshbed::config))]
    Config {
        /// The error message.
        message: String,
    },
}

impl From<serde_json::Error> for MeshbedError {
    fn from(err: serde_json::Error) -> Self {
        MeshbedError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = MeshbedError::InvalidBandwidth {
            value: "fast".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid bandwidth: fast");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: MeshbedError = io_err.into();
        assert!(matches!(err, MeshbedError::Io(_)));
    }

    #[test]
    fn error_from_json() {
        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: MeshbedError = json_err.into();
        assert!(matches!(err, MeshbedError::Serialization(_)));
    }
}
