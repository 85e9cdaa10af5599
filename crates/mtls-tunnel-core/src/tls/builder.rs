//! Builds rustls configurations from a certificate store snapshot.

use std::sync::Arc;

use rustls::{ClientConfig, ServerConfig};
use tracing::debug;

use super::client::TlsConnector;
use super::crypto_provider;
use super::server::TlsServerAcceptor;
use super::verifier::{AuthorizingClientVerifier, AuthorizingServerVerifier};
use super::version::MinTlsVersion;
use crate::auth::IdentityVerifier;
use crate::error::{TlsError, TlsResult};
use crate::keystore::{Identity, TrustBundle};
use crate::store::StoreSnapshot;

/// Settings that do not change on reload.
#[derive(Debug, Clone, Default)]
pub struct TlsPolicy {
    pub min_version: MinTlsVersion,
    /// Inbound peers must present a certificate.
    pub require_client_auth: bool,
    pub verifier: IdentityVerifier,
}

impl TlsPolicy {
    /// Whether inbound peers must present a certificate. An allow-list can
    /// only be enforced against a certificate, so patterns imply it.
    #[must_use]
    pub fn client_auth_required(&self) -> bool {
        self.require_client_auth || !self.verifier.is_unrestricted()
    }
}

/// Ready-to-use server and client configurations for one store version.
#[derive(Debug, Clone)]
pub struct TlsConfiguration {
    /// Store version this was built from.
    pub version: u64,
    pub min_version: MinTlsVersion,
    pub require_client_auth: bool,
    pub server: Arc<ServerConfig>,
    pub client: Arc<ClientConfig>,
}

impl TlsConfiguration {
    /// Acceptor for inbound TLS.
    #[must_use]
    pub fn acceptor(&self) -> TlsServerAcceptor {
        TlsServerAcceptor::new(self.server.clone())
    }

    /// Connector for outbound TLS.
    #[must_use]
    pub fn connector(&self) -> TlsConnector {
        TlsConnector::new(self.client.clone())
    }
}

/// Turns snapshots into [`TlsConfiguration`]s. Building has no side effects.
#[derive(Debug, Clone, Default)]
pub struct TlsConfigBuilder {
    policy: TlsPolicy,
}

impl TlsConfigBuilder {
    pub fn new(policy: TlsPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> &TlsPolicy {
        &self.policy
    }

    /// Build both configurations for `snapshot`.
    ///
    /// # Errors
    ///
    /// Returns an error if client authentication is required but the trust
    /// bundle has no explicit certificates, or rustls rejects the material.
    pub fn build(&self, snapshot: &StoreSnapshot) -> TlsResult<TlsConfiguration> {
        let server = self.build_server_config(&snapshot.identity, &snapshot.trust)?;
        let client = self.build_client_config(&snapshot.identity, &snapshot.trust)?;

        debug!(
            version = snapshot.version,
            min_version = %self.policy.min_version,
            require_client_auth = self.policy.client_auth_required(),
            "built TLS configuration"
        );

        Ok(TlsConfiguration {
            version: snapshot.version,
            min_version: self.policy.min_version,
            require_client_auth: self.policy.client_auth_required(),
            server: Arc::new(server),
            client: Arc::new(client),
        })
    }

    /// Server side: present `identity`, verify and authorize clients.
    ///
    /// # Errors
    ///
    /// See [`TlsConfigBuilder::build`].
    pub fn build_server_config(
        &self,
        identity: &Identity,
        trust: &TrustBundle,
    ) -> TlsResult<ServerConfig> {
        let builder = ServerConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(self.policy.min_version.supported_versions())
            .map_err(|e| TlsError::Config(format!("unsupported protocol versions: {e}")))?;

        let builder = if trust.is_empty() {
            // Only the Mozilla roots: those never authenticate clients.
            if self.policy.client_auth_required() {
                return Err(TlsError::Config(
                    "client certificates are required but the trust bundle is empty".to_string(),
                ));
            }
            debug!("configuring TLS without client certificate verification");
            builder.with_no_client_auth()
        } else {
            let verifier = AuthorizingClientVerifier::new(
                trust.root_store()?,
                self.policy.client_auth_required(),
                self.policy.verifier.clone(),
            )?;
            builder.with_client_cert_verifier(Arc::new(verifier))
        };

        builder
            .with_single_cert(
                identity.certificate_chain().to_vec(),
                identity.private_key().clone_key(),
            )
            .map_err(|e| TlsError::Config(format!("failed to configure server cert: {e}")))
    }

    /// Client side: present `identity`, verify and authorize the target.
    ///
    /// # Errors
    ///
    /// See [`TlsConfigBuilder::build`].
    pub fn build_client_config(
        &self,
        identity: &Identity,
        trust: &TrustBundle,
    ) -> TlsResult<ClientConfig> {
        let verifier =
            AuthorizingServerVerifier::new(trust.root_store()?, self.policy.verifier.clone())?;

        ClientConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(self.policy.min_version.supported_versions())
            .map_err(|e| TlsError::Config(format!("unsupported protocol versions: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(
                identity.certificate_chain().to_vec(),
                identity.private_key().clone_key(),
            )
            .map_err(|e| TlsError::Config(format!("failed to configure client auth: {e}")))
    }
}
