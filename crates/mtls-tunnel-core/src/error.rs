//! Domain error types for the mutual-TLS tunnel.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.
//!
//! Errors fall in two groups. Keystore, TLS setup and configuration errors
//! happen at startup or reload time and abort the affected operation.
//! [`ProxyError`] values are per-connection: the connection is closed and
//! the listener carries on.

use std::time::Duration;

use thiserror::Error;

use crate::auth::UnauthorizedPeer;

/// Errors related to configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Invalid address format.
    #[error("invalid address format: {0} (expected 'host:port')")]
    InvalidAddress(String),

    /// Neither a keystore nor a certificate/key pair was configured.
    #[error("tls: either keystore_path or cert_path + key_path must be set")]
    MissingIdentity,

    /// Both a keystore and a certificate/key pair were configured.
    #[error("tls: keystore_path and cert_path/key_path are mutually exclusive")]
    ConflictingIdentity,

    /// The configured minimum TLS version is not one of the supported literals.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// Client certificates are required but no CA bundle is configured.
    #[error("tls: ca_bundle_path is required when require_client_cert is true")]
    MissingTrustBundle,

    /// Server mode with an allow-list but optional client certificates.
    #[error("tls: allow requires require_client_cert in server mode")]
    AllowWithoutClientCert,

    /// An `allow` entry must set exactly one of `value` and `wildcard`.
    #[error("tls.allow[{index}]: set exactly one of 'value' or 'wildcard'")]
    InvalidPattern { index: usize },

    /// A timeout value that must be positive was zero.
    #[error("timeouts.{0} must be greater than zero")]
    ZeroTimeout(&'static str),
}

/// Errors raised while loading key material.
#[derive(Error, Debug)]
pub enum KeystoreError {
    /// The bytes are not a recognized keystore, or the keystore is incomplete.
    #[error("failed to parse keystore: {0}")]
    Parse(String),

    /// The password does not open the keystore.
    #[error("failed to decrypt keystore: {0}")]
    Decryption(String),

    /// The private key does not belong to the leaf certificate.
    #[error("private key does not match the leaf certificate public key")]
    KeyMismatch,

    /// A trust bundle was required but contained no certificates.
    #[error("no certificates found in trust bundle '{0}'")]
    EmptyTrustBundle(String),

    /// A keystore or bundle file could not be read.
    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while building or using TLS configurations.
#[derive(Error, Debug)]
pub enum TlsError {
    /// Minimum version literal outside {"1.0", "1.1", "1.2", "1.3"}.
    #[error("unsupported minimum TLS version '{0}' (expected 1.0, 1.1, 1.2 or 1.3)")]
    UnsupportedVersion(String),

    /// Invalid TLS configuration.
    #[error("TLS configuration error: {0}")]
    Config(String),

    /// Invalid server name for SNI / certificate verification.
    #[error("invalid server name '{0}'")]
    InvalidServerName(String),
}

/// Per-connection errors. Never propagated past the connection task.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// TCP/IO error outside of forwarding (accept, bind).
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// TLS handshake failed for a reason other than authorization.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Handshake or dial did not complete in time.
    #[error("{stage} timed out after {timeout:?}")]
    Timeout {
        stage: &'static str,
        timeout: Duration,
    },

    /// The peer passed chain verification but matched no allow pattern.
    #[error(transparent)]
    Unauthorized(#[from] UnauthorizedPeer),

    /// Dialing the target failed.
    #[error("failed to connect to target {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Copying bytes between the two legs failed.
    #[error("forwarding error: {0}")]
    ForwardingIo(std::io::Error),

    /// TLS setup error surfaced while serving a connection.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// Shutdown signal received.
    #[error("tunnel shutting down")]
    Shutdown,
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for keystore operations.
pub type KeystoreResult<T> = std::result::Result<T, KeystoreError>;

/// Result type alias for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_version_display() {
        let err = TlsError::UnsupportedVersion("1.4".to_string());
        assert!(err.to_string().contains("1.4"));
    }

    #[test]
    fn test_keystore_error_display_hides_nothing_sensitive() {
        let err = KeystoreError::Decryption("mac verification failed".to_string());
        assert_eq!(
            err.to_string(),
            "failed to decrypt keystore: mac verification failed"
        );
    }

    #[test]
    fn test_proxy_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "test");
        let proxy_err: ProxyError = io_err.into();
        assert!(matches!(proxy_err, ProxyError::Connection(_)));
    }

    #[test]
    fn test_timeout_display() {
        let err = ProxyError::Timeout {
            stage: "handshake",
            timeout: Duration::from_secs(10),
        };
        assert_eq!(err.to_string(), "handshake timed out after 10s");
    }

    #[test]
    fn test_config_error_from_tls() {
        let err: ConfigError = TlsError::UnsupportedVersion("2.0".to_string()).into();
        assert!(matches!(err, ConfigError::Tls(TlsError::UnsupportedVersion(_))));
    }
}
