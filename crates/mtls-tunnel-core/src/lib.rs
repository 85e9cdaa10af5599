//! mTLS Tunnel Core Library
//!
//! This library provides the core of a mutual-TLS terminating tunnel. The
//! tunnel accepts connections on one side and forwards the payload to a
//! target on the other, authenticating and authorizing peers by their
//! certificates. Key material is reloaded from disk without dropping
//! connections.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`keystore`] - PKCS#12 / PEM identity and trust bundle loading
//! - [`store`] - Versioned certificate snapshot with atomic reload
//! - [`tls`] - rustls configuration building, verifiers and caching
//! - [`auth`] - Peer identity extraction and allow-list matching
//! - [`network`] - Listener, connection state machine and forwarding
//! - [`events`] - Structured lifecycle events and sinks
//! - [`metrics`] - Prometheus metrics fed from events
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mtls_tunnel_core::{CertificateStore, TlsConfigBuilder, TlsConfigCache, TunnelConfig, TunnelListener};
//!
//! let config = TunnelConfig::from_file("tunnel.yaml")?;
//! let events: SharedEventSink = Arc::new(TracingEventSink);
//! let store = Arc::new(CertificateStore::initialize(config.keystore_sources()?, events.clone()).await?);
//! let tls = Arc::new(TlsConfigCache::new(store, TlsConfigBuilder::new(config.tls_policy()?))?);
//! let listener = TunnelListener::bind(config.proxy_settings(), tls, events).await?;
//! listener.run().await?;
//! ```

#![forbid(unsafe_code)]

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod keystore;
pub mod metrics;
pub mod network;
pub mod store;
pub mod tls;

/// Test utilities for integration testing.
///
/// This module is only available when the `testing` feature is enabled.
#[cfg(feature = "testing")]
pub mod testing;

// Re-export commonly used types
pub use auth::{AllowedIdentityPattern, IdentityAttribute, IdentityVerifier, PeerIdentity};
pub use config::{TunnelConfig, TunnelMode};
pub use error::{ConfigError, KeystoreError, ProxyError, Result, TlsError};
pub use events::{EventSink, SharedEventSink, TracingEventSink, TunnelEvent};
pub use keystore::{Identity, KeystoreSources, Password, TrustBundle};
pub use network::{ProxySettings, TunnelListener};
pub use store::{CertificateStore, StoreSnapshot};
pub use tls::{MinTlsVersion, TlsConfigBuilder, TlsConfigCache, TlsPolicy};
