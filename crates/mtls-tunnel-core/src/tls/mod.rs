//! TLS configuration for both directions of the tunnel.
//!
//! The tunnel terminates TLS as a server in `server` mode and originates it
//! as a client in `client` mode. In both cases it presents its own identity
//! and verifies the peer against the trust bundle, then against the
//! allowed identity patterns.
//!
//! # Usage
//!
//! ```rust,ignore
//! use mtls_tunnel_core::tls::{TlsConfigBuilder, TlsPolicy, MinTlsVersion};
//!
//! let policy = TlsPolicy {
//!     min_version: MinTlsVersion::parse("1.2")?,
//!     require_client_auth: true,
//!     verifier: IdentityVerifier::new(patterns),
//! };
//! let config = TlsConfigBuilder::new(policy).build(&store.current())?;
//! let tls_stream = config.acceptor().accept(tcp_stream).await?;
//! ```

pub mod builder;
pub mod cache;
pub mod client;
pub mod server;
pub mod verifier;
pub mod version;

use std::sync::Arc;

use rustls::crypto::ring::default_provider;
use rustls::crypto::CryptoProvider;

pub use builder::{TlsConfigBuilder, TlsConfiguration, TlsPolicy};
pub use cache::TlsConfigCache;
pub use client::TlsConnector;
pub use server::TlsServerAcceptor;
pub use verifier::{unauthorized_peer, AuthorizingClientVerifier, AuthorizingServerVerifier};
pub use version::MinTlsVersion;

/// Install the ring crypto provider if not already installed.
pub fn ensure_crypto_provider() {
    // Ignore the error if another provider was installed first.
    let _ = CryptoProvider::install_default(default_provider());
}

/// The process-wide crypto provider.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    ensure_crypto_provider();
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(default_provider()))
}
