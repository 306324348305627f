//! RPC Error Types
//!
//! Error taxonomy shared by the messenger, reactors, acceptor and scheduler.
//! Configuration and registration errors are returned synchronously; per-call
//! failures travel through the call's own completion path.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;

/// Wire-visible classification of a failed inbound call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The service ran and reported a failure
    ApplicationError,
    /// No service registered under the requested name
    NoSuchService,
    /// Service exists but does not know the method
    NoSuchMethod,
    /// Request could not be understood
    InvalidRequest,
    /// Service refused the call because it is overloaded
    ServerTooBusy,
    /// Server is going away
    ShuttingDown,
    /// Anything else, including calls dropped without a response
    Unknown,
}

/// Main RPC runtime error type
#[derive(Error, Debug)]
pub enum RpcError {
    /// Malformed configuration or request
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        message: String,
        field: Option<String>,
    },

    /// Operation attempted in the wrong lifecycle phase
    #[error("Illegal state: {message}")]
    IllegalState { message: String },

    /// Registry conflict on insert
    #[error("Already present: {message}")]
    AlreadyPresent { message: String },

    /// Registry miss
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// No handler for a call, or runtime shutting down
    #[error("Service unavailable: {message}")]
    ServiceUnavailable { message: String },

    /// Connection refused, broken, or artificially severed
    #[error("Network error: {message} (remote: {remote_addr:?})")]
    Network {
        message: String,
        remote_addr: Option<SocketAddr>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Explicit cancellation
    #[error("Aborted: {message}")]
    Aborted { message: String },

    /// No response within the deadline
    #[error("Timed out: {operation} exceeded {timeout_ms}ms")]
    TimedOut { operation: String, timeout_ms: u64 },

    /// Failure reported by the remote side of a call
    #[error("Remote error ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },

    /// Malformed frame or preamble
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RpcError>;

impl RpcError {
    /// Create an invalid argument error
    pub fn invalid_argument(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create an illegal state error
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Create an already present error
    pub fn already_present(message: impl Into<String>) -> Self {
        Self::AlreadyPresent {
            message: message.into(),
        }
    }

    /// Create a service unavailable error
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>, remote_addr: Option<SocketAddr>) -> Self {
        Self::Network {
            message: message.into(),
            remote_addr,
            source: None,
        }
    }

    /// Create a network error with source
    pub fn network_with_source(
        message: impl Into<String>,
        remote_addr: Option<SocketAddr>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Network {
            message: message.into(),
            remote_addr,
            source: Some(Box::new(source)),
        }
    }

    /// Create an aborted error
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::Aborted {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timed_out(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::TimedOut {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a remote error
    pub fn remote(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Remote {
            code,
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Check if retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            RpcError::Network { .. } => true,
            RpcError::TimedOut { .. } => true,
            RpcError::ServiceUnavailable { .. } => true,
            RpcError::Io { .. } => true,
            RpcError::Remote { code, .. } => {
                matches!(code, ErrorCode::ServerTooBusy | ErrorCode::ShuttingDown)
            }
            RpcError::InvalidArgument { .. } => false,
            RpcError::IllegalState { .. } => false,
            RpcError::AlreadyPresent { .. } => false,
            RpcError::NotFound { .. } => false,
            RpcError::Aborted { .. } => false,
            RpcError::Protocol { .. } => false,
        }
    }

    /// Check if this is a deadline expiry
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::TimedOut { .. })
    }

    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            RpcError::InvalidArgument { .. } => "invalid_argument",
            RpcError::IllegalState { .. } => "illegal_state",
            RpcError::AlreadyPresent { .. } => "already_present",
            RpcError::NotFound { .. } => "not_found",
            RpcError::ServiceUnavailable { .. } => "service_unavailable",
            RpcError::Network { .. } => "network",
            RpcError::Aborted { .. } => "aborted",
            RpcError::TimedOut { .. } => "timed_out",
            RpcError::Remote { .. } => "remote",
            RpcError::Protocol { .. } => "protocol",
            RpcError::Io { .. } => "io",
        }
    }

    /// Code reported to the peer when this error fails an inbound call
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RpcError::Remote { code, .. } => *code,
            RpcError::ServiceUnavailable { .. } => ErrorCode::NoSuchService,
            RpcError::InvalidArgument { .. } | RpcError::Protocol { .. } => {
                ErrorCode::InvalidRequest
            }
            RpcError::Aborted { .. } => ErrorCode::ShuttingDown,
            _ => ErrorCode::ApplicationError,
        }
    }
}

// Box<dyn Error> is not Clone; sources are dropped on clone
impl Clone for RpcError {
    fn clone(&self) -> Self {
        match self {
            RpcError::InvalidArgument { message, field } => RpcError::InvalidArgument {
                message: message.clone(),
                field: field.clone(),
            },
            RpcError::IllegalState { message } => RpcError::IllegalState {
                message: message.clone(),
            },
            RpcError::AlreadyPresent { message } => RpcError::AlreadyPresent {
                message: message.clone(),
            },
            RpcError::NotFound { message } => RpcError::NotFound {
                message: message.clone(),
            },
            RpcError::ServiceUnavailable { message } => RpcError::ServiceUnavailable {
                message: message.clone(),
            },
            RpcError::Network {
                message,
                remote_addr,
                ..
            } => RpcError::Network {
                message: message.clone(),
                remote_addr: *remote_addr,
                source: None,
            },
            RpcError::Aborted { message } => RpcError::Aborted {
                message: message.clone(),
            },
            RpcError::TimedOut {
                operation,
                timeout_ms,
            } => RpcError::TimedOut {
                operation: operation.clone(),
                timeout_ms: *timeout_ms,
            },
            RpcError::Remote { code, message } => RpcError::Remote {
                code: *code,
                message: message.clone(),
            },
            RpcError::Protocol { message } => RpcError::Protocol {
                message: message.clone(),
            },
            RpcError::Io { message, source } => RpcError::Io {
                message: message.clone(),
                source: std::io::Error::new(source.kind(), message.as_str()),
            },
        }
    }
}

/// Convert standard I/O errors to runtime errors
impl From<std::io::Error> for RpcError {
    fn from(error: std::io::Error) -> Self {
        RpcError::Io {
            message: error.to_string(),
            source: error,
        }
    }
}

/// Convert bincode errors to protocol errors
impl From<bincode::Error> for RpcError {
    fn from(error: bincode::Error) -> Self {
        RpcError::protocol(format!("Frame header serialization failed: {}", error))
    }
}

/// Convert configuration loading errors
impl From<config_crate::ConfigError> for RpcError {
    fn from(error: config_crate::ConfigError) -> Self {
        RpcError::invalid_argument(format!("Configuration error: {}", error), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_error_construction() {
        let err = RpcError::network("Connection refused", None);
        assert_eq!(err.category(), "network");
        assert!(err.is_retryable());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_network_error_keeps_remote() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)), 9100);
        let err = RpcError::network("TEST: Connectivity is broken", Some(addr));

        match err.clone() {
            RpcError::Network { remote_addr, .. } => {
                assert_eq!(remote_addr, Some(addr));
            }
            _ => panic!("Expected Network error"),
        }
        assert!(err.to_string().contains("Connectivity is broken"));
    }

    #[test]
    fn test_error_categorization() {
        assert_eq!(RpcError::protocol("test").category(), "protocol");
        assert_eq!(RpcError::timed_out("call", 50).category(), "timed_out");
        assert_eq!(RpcError::aborted("test").category(), "aborted");
        assert!(RpcError::timed_out("call", 50).is_timeout());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(RpcError::timed_out("test", 1000).is_retryable());
        assert!(RpcError::remote(ErrorCode::ServerTooBusy, "busy").is_retryable());
        assert!(!RpcError::remote(ErrorCode::NoSuchService, "gone").is_retryable());
        assert!(!RpcError::illegal_state("test").is_retryable());
        assert!(!RpcError::already_present("test").is_retryable());
    }

    #[test]
    fn test_error_codes_for_inbound_failures() {
        assert_eq!(
            RpcError::service_unavailable("x").error_code(),
            ErrorCode::NoSuchService
        );
        assert_eq!(
            RpcError::protocol("bad").error_code(),
            ErrorCode::InvalidRequest
        );
        assert_eq!(
            RpcError::remote(ErrorCode::NoSuchMethod, "m").error_code(),
            ErrorCode::NoSuchMethod
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "test");
        let err = RpcError::from(io_err);

        match err.clone() {
            RpcError::Io { message, source } => {
                assert!(message.contains("test"));
                assert_eq!(source.kind(), std::io::ErrorKind::ConnectionRefused);
            }
            _ => panic!("Expected Io error"),
        }
    }
}
