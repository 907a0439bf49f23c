//! Error types for the credential-forwarding core.

use std::path::PathBuf;

use thiserror::Error;

use crate::backend::ContainerError;

/// Result type for core operations.
pub type PodResult<T> = Result<T, PodError>;

/// Errors raised by the proxies, the secrets pipeline and the session.
#[derive(Debug, Error)]
pub enum PodError {
    /// Bad or missing upstream socket, invalid allow-list rule.
    #[error("config error: {0}")]
    Config(String),

    /// The local proxy socket could not be created.
    #[error("failed to bind {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The upstream agent connection failed while relaying.
    #[error("relay error: {0}")]
    Relay(String),

    /// Secrets could not be delivered into the container.
    #[error("secrets delivery failed: {0}")]
    Delivery(String),

    /// The container backend failed.
    #[error(transparent)]
    Container(#[from] ContainerError),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PodError {
    /// Whether forwarding can continue in a degraded mode after this error.
    ///
    /// Config and bind failures only disable the affected proxy; everything
    /// else is either connection-scoped or fatal to the invocation.
    pub fn is_degradable(&self) -> bool {
        matches!(self, PodError::Config(_) | PodError::Bind { .. })
    }

    pub(crate) fn relay(context: &str, err: impl std::fmt::Display) -> Self {
        PodError::Relay(format!("{context}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degradable_errors() {
        assert!(PodError::Config("missing socket".to_string()).is_degradable());
        assert!(
            PodError::Bind {
                path: PathBuf::from("/tmp/x.sock"),
                source: std::io::Error::other("in use"),
            }
            .is_degradable()
        );
        assert!(!PodError::Delivery("copy failed".to_string()).is_degradable());
        assert!(!PodError::relay("upstream read", "reset").is_degradable());
    }

    #[test]
    fn test_relay_error_message() {
        let err = PodError::relay("upstream read", "connection reset");
        assert_eq!(err.to_string(), "relay error: upstream read: connection reset");
    }
}
