//! Configuration types for the mutual-TLS tunnel.
//!
//! Configuration is loaded from YAML files and validated before use.
//!
//! ```yaml
//! mode: server
//! listen:
//!   address: "0.0.0.0:8443"
//! target:
//!   address: "127.0.0.1:8080"
//! tls:
//!   keystore_path: /etc/tunnel/server.p12
//!   keystore_password: "${TUNNEL_KEYSTORE_PASSWORD}"
//!   ca_bundle_path: /etc/tunnel/ca.pem
//!   min_version: "1.2"
//!   allow:
//!     - attribute: cn
//!       value: client.example.com
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::auth::{AllowedIdentityPattern, IdentityAttribute, IdentityVerifier};
use crate::error::{ConfigError, ConfigResult};
use crate::keystore::{IdentitySource, KeystoreSources, Password};
use crate::network::ProxySettings;
use crate::tls::{MinTlsVersion, TlsConnector, TlsPolicy};

/// Which side of the tunnel speaks TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    /// Accept TLS, dial the target in plain text.
    #[default]
    Server,
    /// Accept plain text, dial the target over TLS.
    Client,
}

impl TunnelMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Client => "client",
        }
    }
}

impl fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Root configuration for the tunnel.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunnelConfig {
    /// Operating mode.
    #[serde(default)]
    pub mode: TunnelMode,

    /// TCP listener configuration.
    #[serde(default)]
    pub listen: ListenConfig,

    /// Where accepted connections are forwarded.
    pub target: TargetConfig,

    /// Key material and TLS policy.
    pub tls: TlsConfig,

    /// Handshake, dial and forwarding timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Periodic certificate reload.
    #[serde(default)]
    pub reload: ReloadConfig,

    /// HTTP status and metrics endpoint.
    #[serde(default)]
    pub status: StatusConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// TCP listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    /// Address to bind to, e.g., "0.0.0.0:8443".
    #[serde(default = "default_listen_address")]
    pub address: String,

    /// Maximum number of concurrent connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Target the tunnel dials for each accepted connection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    /// Address to dial, e.g., "backend.internal:443".
    pub address: String,

    /// Name used for SNI and certificate checks in client mode.
    /// Defaults to the host part of `address`.
    #[serde(default)]
    pub server_name: Option<String>,
}

/// Key material and TLS policy.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TlsConfig {
    /// PKCS#12 or PEM bundle holding key and certificate chain.
    #[serde(default)]
    pub keystore_path: Option<PathBuf>,

    /// Keystore password.
    /// Supports environment variable expansion: "${TUNNEL_KEYSTORE_PASSWORD}"
    #[serde(default)]
    pub keystore_password: Option<String>,

    /// Certificate chain PEM, used together with `key_path`.
    #[serde(default)]
    pub cert_path: Option<PathBuf>,

    /// Private key PEM, used together with `cert_path`.
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    /// PEM bundle of certificates peers are verified against.
    /// If not set in client mode, the bundled Mozilla roots are used.
    #[serde(default)]
    pub ca_bundle_path: Option<PathBuf>,

    /// Lowest protocol version accepted: "1.0", "1.1", "1.2" or "1.3".
    #[serde(default)]
    pub min_version: MinTlsVersion,

    /// Server mode only: reject clients without a certificate.
    #[serde(default = "default_require_client_cert")]
    pub require_client_cert: bool,

    /// Identities allowed to use the tunnel. Empty allows every verified peer.
    #[serde(default)]
    pub allow: Vec<AllowConfig>,
}

/// One allow-list entry: an attribute plus either an exact value or a wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AllowConfig {
    pub attribute: IdentityAttribute,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wildcard: Option<String>,
}

/// Timeouts, in milliseconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    /// TLS handshake timeout.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_ms: u64,

    /// Target dial timeout.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_ms: u64,

    /// Close a connection after this long without traffic.
    /// Set to 0 to disable.
    #[serde(default)]
    pub idle_ms: u64,

    /// How long the second direction may run after the first one closed.
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,

    /// How long shutdown waits for in-flight connections.
    #[serde(default = "default_shutdown_drain_ms")]
    pub shutdown_drain_ms: u64,
}

/// Periodic certificate reload.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReloadConfig {
    /// Interval in seconds between reloads.
    /// Set to 0 to disable (reload only on SIGHUP).
    #[serde(default)]
    pub interval_secs: u64,
}

/// HTTP status and metrics endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatusConfig {
    /// Whether to serve `/_status` and `/_metrics`.
    #[serde(default)]
    pub enabled: bool,

    /// Address for the status HTTP server.
    #[serde(default = "default_status_address")]
    pub address: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format (for production).
    #[serde(default)]
    pub json: bool,
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable `VAR_NAME`.
/// If the variable is not set, replaces with an empty string.
fn expand_env_vars(s: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex");
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

// Default value functions

fn default_listen_address() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_max_connections() -> usize {
    1000
}

fn default_require_client_cert() -> bool {
    true
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_close_grace_ms() -> u64 {
    1_000
}

fn default_shutdown_drain_ms() -> u64 {
    30_000
}

fn default_status_address() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_ms: default_handshake_timeout_ms(),
            connect_ms: default_connect_timeout_ms(),
            idle_ms: 0,
            close_grace_ms: default_close_grace_ms(),
            shutdown_drain_ms: default_shutdown_drain_ms(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_status_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl TargetConfig {
    /// Name presented for SNI and checked against the target certificate.
    #[must_use]
    pub fn server_name(&self) -> &str {
        self.server_name
            .as_deref()
            .unwrap_or_else(|| host_part(&self.address))
    }
}

/// Host of a `host:port` address, without IPv6 brackets.
fn host_part(address: &str) -> &str {
    let host = address.rsplit_once(':').map_or(address, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}

fn validate_address(address: &str) -> ConfigResult<()> {
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(ConfigError::InvalidAddress(address.to_string())),
    }
}

impl TlsConfig {
    /// The keystore password with environment variables expanded.
    #[must_use]
    pub fn password(&self) -> Password {
        Password::new(expand_env_vars(
            self.keystore_password.as_deref().unwrap_or_default(),
        ))
    }

    fn identity_source(&self) -> ConfigResult<IdentitySource> {
        match (&self.keystore_path, &self.cert_path, &self.key_path) {
            (Some(path), None, None) => Ok(IdentitySource::Keystore {
                path: path.clone(),
                password: self.password(),
            }),
            (None, Some(cert_path), Some(key_path)) => Ok(IdentitySource::CertAndKey {
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
            }),
            (Some(_), _, _) => Err(ConfigError::ConflictingIdentity),
            _ => Err(ConfigError::MissingIdentity),
        }
    }

    fn patterns(&self) -> ConfigResult<Vec<AllowedIdentityPattern>> {
        self.allow
            .iter()
            .enumerate()
            .map(|(index, entry)| match (&entry.value, &entry.wildcard) {
                (Some(value), None) => Ok(AllowedIdentityPattern::exact(entry.attribute, value)),
                (None, Some(pattern)) => {
                    Ok(AllowedIdentityPattern::wildcard(entry.attribute, pattern))
                }
                _ => Err(ConfigError::InvalidPattern { index }),
            })
            .collect()
    }
}

// Configuration loading and validation

impl TunnelConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - an address is not `host:port`
    /// - the identity is missing or configured twice
    /// - client certificates are required in server mode without a CA bundle
    /// - server mode has allow entries but optional client certificates
    /// - an allow entry sets both or neither of `value` and `wildcard`
    /// - the handshake, connect or drain timeout is zero
    /// - the target server name is not a valid DNS name or IP address
    pub fn validate(&self) -> ConfigResult<()> {
        validate_address(&self.listen.address)?;
        validate_address(&self.target.address)?;
        if self.status.enabled {
            validate_address(&self.status.address)?;
        }

        self.tls.identity_source()?;
        if self.requires_trust_bundle() && self.tls.ca_bundle_path.is_none() {
            return Err(ConfigError::MissingTrustBundle);
        }
        if self.mode == TunnelMode::Server
            && !self.tls.require_client_cert
            && !self.tls.allow.is_empty()
        {
            return Err(ConfigError::AllowWithoutClientCert);
        }
        self.tls.patterns()?;

        if self.timeouts.handshake_ms == 0 {
            return Err(ConfigError::ZeroTimeout("handshake_ms"));
        }
        if self.timeouts.connect_ms == 0 {
            return Err(ConfigError::ZeroTimeout("connect_ms"));
        }
        if self.timeouts.shutdown_drain_ms == 0 {
            return Err(ConfigError::ZeroTimeout("shutdown_drain_ms"));
        }

        if self.mode == TunnelMode::Client {
            TlsConnector::server_name(self.target.server_name())?;
        }
        Ok(())
    }

    fn requires_trust_bundle(&self) -> bool {
        self.mode == TunnelMode::Server && self.tls.require_client_cert
    }

    /// Paths the certificate store reads on startup and on every reload.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity is missing or configured twice.
    pub fn keystore_sources(&self) -> ConfigResult<KeystoreSources> {
        Ok(KeystoreSources {
            identity: self.tls.identity_source()?,
            trust_bundle: self.tls.ca_bundle_path.clone(),
            require_trust: self.requires_trust_bundle(),
        })
    }

    /// Reload-independent TLS policy.
    ///
    /// # Errors
    ///
    /// Returns an error if an allow entry is malformed.
    pub fn tls_policy(&self) -> ConfigResult<TlsPolicy> {
        Ok(TlsPolicy {
            min_version: self.tls.min_version,
            require_client_auth: self.requires_trust_bundle(),
            verifier: IdentityVerifier::new(self.tls.patterns()?),
        })
    }

    /// Listener and connection settings.
    #[must_use]
    pub fn proxy_settings(&self) -> ProxySettings {
        let t = &self.timeouts;
        ProxySettings {
            mode: self.mode,
            listen_address: self.listen.address.clone(),
            target_address: self.target.address.clone(),
            target_server_name: self.target.server_name().to_string(),
            max_connections: self.listen.max_connections,
            handshake_timeout: Duration::from_millis(t.handshake_ms),
            connect_timeout: Duration::from_millis(t.connect_ms),
            idle_timeout: (t.idle_ms > 0).then(|| Duration::from_millis(t.idle_ms)),
            close_grace: Duration::from_millis(t.close_grace_ms),
            shutdown_drain: Duration::from_millis(t.shutdown_drain_ms),
        }
    }

    /// Timed reload interval, if enabled.
    #[must_use]
    pub fn reload_interval(&self) -> Option<Duration> {
        (self.reload.interval_secs > 0).then(|| Duration::from_secs(self.reload.interval_secs))
    }
}
