//! Error types for kube-latency

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in kube-latency
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP protocol error from hyper
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Request could not be built or dispatched
    #[error("HTTP client error: {0}")]
    HttpClient(String),

    /// Probe URL is not a usable plain-HTTP URL
    #[error("Invalid probe URL: {0}")]
    InvalidUrl(String),

    /// Probe exceeded its deadline
    #[error("Probe to {url} timed out after {timeout:?}")]
    ProbeTimeout { url: String, timeout: Duration },

    /// Peer registry listing failed
    #[error("Peer registry error: {0}")]
    Registry(String),

    /// The service whose pods are probed does not exist
    #[error("Service {namespace}/{name} not found")]
    ServiceNotFound { namespace: String, name: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registration or encoding error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_timeout_display() {
        let err = Error::ProbeTimeout {
            url: "http://10.0.0.2:8080/ping".to_string(),
            timeout: Duration::from_secs(30),
        };

        assert_eq!(
            err.to_string(),
            "Probe to http://10.0.0.2:8080/ping timed out after 30s"
        );
    }

    #[test]
    fn test_service_not_found_display() {
        let err = Error::ServiceNotFound {
            namespace: "default".into(),
            name: "kube-latency".into(),
        };

        assert_eq!(err.to_string(), "Service default/kube-latency not found");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: Error = io.into();

        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("refused"));
    }
}
