//! Error types for tls-proxy-rs

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Proxy error types
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration error (fatal at start-up)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Hostname rejected by the host policy
    #[error("Host not allowed: {0}")]
    PolicyDenied(String),

    /// Certificate authority unreachable, rate-limited or timed out
    #[error("Certificate authority unavailable: {0}")]
    AcquisitionTransient(String),

    /// Certificate authority refused to issue
    #[error("Certificate authority rejected request: {0}")]
    AcquisitionFatal(String),

    /// Certificate cache read/write failure
    #[error("Certificate store error: {0}")]
    Store(String),

    /// Backend connect or protocol error
    #[error("Backend error: {0}")]
    Backend(String),

    /// Backend did not answer within the configured timeout
    #[error("Backend timed out after {0:?}")]
    BackendTimeout(std::time::Duration),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(String),
}

impl ProxyError {
    /// Whether a failed acquisition may be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, ProxyError::AcquisitionTransient(_) | ProxyError::Io(_))
    }
}

// Acquisition outcomes are shared between every handshake waiting on the
// same hostname, so the error has to be cloneable.
impl Clone for ProxyError {
    fn clone(&self) -> Self {
        match self {
            ProxyError::Config(s) => ProxyError::Config(s.clone()),
            ProxyError::PolicyDenied(s) => ProxyError::PolicyDenied(s.clone()),
            ProxyError::AcquisitionTransient(s) => ProxyError::AcquisitionTransient(s.clone()),
            ProxyError::AcquisitionFatal(s) => ProxyError::AcquisitionFatal(s.clone()),
            ProxyError::Store(s) => ProxyError::Store(s.clone()),
            ProxyError::Backend(s) => ProxyError::Backend(s.clone()),
            ProxyError::BackendTimeout(d) => ProxyError::BackendTimeout(*d),
            ProxyError::Io(e) => ProxyError::Io(std::io::Error::new(e.kind(), e.to_string())),
            ProxyError::Tls(s) => ProxyError::Tls(s.clone()),
            ProxyError::Http(s) => ProxyError::Http(s.clone()),
        }
    }
}

impl From<config::ConfigError> for ProxyError {
    fn from(e: config::ConfigError) -> Self {
        ProxyError::Config(e.to_string())
    }
}
