//! Error types for network attachment and shaping.

use std::time::Duration;

use meshbed_common::MeshbedError;
use miette::Diagnostic;
use thiserror::Error;

use crate::retry::RetryError;

/// Result type alias using [`NetworkError`].
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Errors raised while configuring a container's data network.
#[derive(Error, Diagnostic, Debug)]
pub enum NetworkError {
    /// The requested network is not managed by this sidecar.
    #[error("configured network is not `{expected}` (got `{network}`)")]
    #[diagnostic(code(meshbed::network::unsupported_network))]
    UnsupportedNetwork {
        /// Network named in the request.
        network: String,
        /// The network this sidecar manages.
        expected: String,
    },

    /// The request needs a feature the sidecar does not provide.
    #[error("{feature} not supported")]
    #[diagnostic(code(meshbed::network::not_supported))]
    NotSupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Unknown CNI config kind.
    #[error("unknown CNI config kind `{kind}`")]
    #[diagnostic(
        code(meshbed::cni::unsupported_kind),
        help("Supported kinds are `net` (subnet pool) and `ip` (fixed address)")
    )]
    UnsupportedConfigKind {
        /// The kind that was asked for.
        kind: String,
    },

    /// The CNI plugin never managed to attach the container.
    #[error("failed to add network through CNI plugin: {source}")]
    #[diagnostic(code(meshbed::cni::attach_failed))]
    AttachFailed {
        /// The retry failure, naming the attempt count and the last error.
        #[source]
        source: Box<RetryError<NetworkError>>,
    },

    /// The attach deadline elapsed before the plugin finished.
    #[error("timeout waiting on CNI attach after {deadline:?}")]
    #[diagnostic(code(meshbed::cni::timeout))]
    Timeout {
        /// The deadline that elapsed.
        deadline: Duration,
    },

    /// The caller cancelled the operation.
    #[error("{operation} cancelled")]
    #[diagnostic(code(meshbed::cancelled))]
    Cancelled {
        /// What was cancelled.
        operation: String,
    },

    /// The CNI plugin failed to detach the container.
    #[error("failed to remove network through CNI plugin: {source}")]
    #[diagnostic(code(meshbed::cni::detach_failed))]
    DetachFailed {
        /// The plugin failure.
        #[source]
        source: Box<NetworkError>,
    },

    /// A CNI plugin returned an error object or could not be run.
    #[error("CNI plugin `{plugin}` failed (code {code}): {message}")]
    #[diagnostic(code(meshbed::cni::plugin))]
    Plugin {
        /// Plugin type.
        plugin: String,
        /// CNI error code; 0 when the plugin produced no error object.
        code: u32,
        /// Error message.
        message: String,
    },

    /// The named interface does not exist in the namespace.
    #[error("failed to get link by name {name}: {reason}")]
    #[diagnostic(code(meshbed::link::resolution_failed))]
    LinkResolutionFailed {
        /// Interface name.
        name: String,
        /// Why resolution failed.
        reason: String,
    },

    /// A netlink request failed.
    #[error("netlink {operation} failed: {source}")]
    #[diagnostic(code(meshbed::netlink))]
    Netlink {
        /// The request that failed.
        operation: String,
        /// The underlying netlink error.
        #[source]
        source: rtnetlink::Error,
    },

    /// A traffic-control command failed.
    #[error("`{command}` failed: {stderr}")]
    #[diagnostic(code(meshbed::tc))]
    TrafficControl {
        /// The command line.
        command: String,
        /// Captured standard error.
        stderr: String,
    },

    /// Kernel backend failure that is not a netlink error.
    #[error("kernel backend: {message}")]
    #[diagnostic(code(meshbed::backend))]
    Backend {
        /// The error message.
        message: String,
    },

    /// The sidecar's kernel handle has already been released.
    #[error("network handle is closed")]
    #[diagnostic(code(meshbed::closed))]
    Closed,

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(meshbed::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(meshbed::serialization))]
    Serialization(String),

    /// Error from the shared meshbed types.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Common(#[from] MeshbedError),
}

impl From<serde_json::Error> for NetworkError {
    fn from(err: serde_json::Error) -> Self {
        NetworkError::Serialization(err.to_string())
    }
}

impl NetworkError {
    /// Create a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_network_display() {
        let err = NetworkError::UnsupportedNetwork {
            network: "unknown".to_string(),
            expected: "default".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "configured network is not `default` (got `unknown`)"
        );
    }

    #[test]
    fn attach_failed_names_attempts() {
        let err = NetworkError::AttachFailed {
            source: Box::new(RetryError::Exhausted {
                attempts: 3,
                source: NetworkError::backend("boom"),
            }),
        };
        let msg = err.to_string();
        assert!(msg.contains("after 3 attempts"), "{msg}");
        assert!(msg.contains("boom"), "{msg}");
    }

    #[test]
    fn common_is_transparent() {
        let err: NetworkError = MeshbedError::Config {
            message: "bad".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "Configuration error: bad");
    }
}
