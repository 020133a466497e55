//! HaLink Error Types

use thiserror::Error;

/// Result type alias for HaLink operations
pub type Result<T> = std::result::Result<T, Error>;

/// HaLink error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Coordination store errors
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Request to coordination store timed out: {0}")]
    ConnectionTimeout(String),

    #[error("Coordination store unavailable: {0}")]
    Unavailable(String),

    #[error("Write rejected for key {key}: {reason}")]
    Rejected { key: String, reason: String },

    #[error("TLS material error: {0}")]
    Tls(String),

    // Encoding errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error means the session to the coordination store is gone
    pub fn is_link_failure(&self) -> bool {
        match self {
            Error::ConnectionTimeout(_) | Error::Unavailable(_) | Error::ConnectionFailed { .. } => {
                true
            }
            Error::Etcd(etcd_client::Error::GRpcStatus(status)) => matches!(
                status.code(),
                tonic::Code::Unavailable | tonic::Code::DeadlineExceeded | tonic::Code::Cancelled
            ),
            Error::Etcd(e) => matches!(
                e,
                etcd_client::Error::TransportError(_) | etcd_client::Error::IoError(_)
            ),
            _ => false,
        }
    }

    /// Check if retrying on the next tick may succeed
    pub fn is_retryable(&self) -> bool {
        self.is_link_failure() || matches!(self, Error::Rejected { .. } | Error::Etcd(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_failure_classification() {
        assert!(Error::ConnectionTimeout("put /k".into()).is_link_failure());
        assert!(Error::Unavailable("closed".into()).is_link_failure());
        assert!(!Error::Rejected {
            key: "/k".into(),
            reason: "quota".into()
        }
        .is_link_failure());
        assert!(!Error::Config("bad".into()).is_link_failure());
    }

    #[test]
    fn test_grpc_unavailable_is_link_failure() {
        // A request on a dead channel surfaces as a gRPC status
        let down = etcd_client::Error::GRpcStatus(tonic::Status::unavailable("connection refused"));
        assert!(Error::from(down).is_link_failure());

        let deadline = etcd_client::Error::GRpcStatus(tonic::Status::deadline_exceeded("slow"));
        assert!(Error::from(deadline).is_link_failure());

        let cancelled = etcd_client::Error::GRpcStatus(tonic::Status::cancelled("dropped"));
        assert!(Error::from(cancelled).is_link_failure());

        let denied = etcd_client::Error::GRpcStatus(tonic::Status::permission_denied("no role"));
        let err = Error::from(denied);
        assert!(!err.is_link_failure());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_rejected_write_is_retryable() {
        let err = Error::Rejected {
            key: "/k".into(),
            reason: "quota".into(),
        };
        assert!(err.is_retryable());
        assert!(!Error::Tls("missing ca".into()).is_retryable());
    }
}
