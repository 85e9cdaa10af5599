//! Peer certificate verifiers that authorize after chain verification.
//!
//! Both verifiers delegate signature and chain checks to the webpki
//! verifiers from rustls and then consult the [`IdentityVerifier`]. An
//! unauthorized peer fails the handshake with a certificate error whose
//! payload is an [`UnauthorizedPeer`]; [`unauthorized_peer`] recovers it
//! from the I/O error tokio-rustls returns.

use std::fmt;
use std::io;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    CertificateError, DigitallySignedStruct, DistinguishedName, Error, OtherError, RootCertStore,
    SignatureScheme,
};
use tracing::debug;

use super::crypto_provider;
use crate::auth::{IdentityVerifier, UnauthorizedPeer};
use crate::error::{TlsError, TlsResult};

fn authorize(identity: &IdentityVerifier, end_entity: &CertificateDer<'_>) -> Result<(), Error> {
    match identity.authorize(std::slice::from_ref(end_entity)) {
        Ok(peer) => {
            debug!(peer = %peer, "peer identity allowed");
            Ok(())
        }
        Err(rejected) => {
            debug!(peer = %rejected.subject, "peer identity not allowed");
            Err(Error::InvalidCertificate(CertificateError::Other(
                OtherError(Arc::new(rejected)),
            )))
        }
    }
}

/// Extract the authorization failure from a handshake error, if that is
/// what failed the handshake.
pub fn unauthorized_peer(err: &io::Error) -> Option<UnauthorizedPeer> {
    let tls_err = err.get_ref()?.downcast_ref::<Error>()?;
    match tls_err {
        Error::InvalidCertificate(CertificateError::Other(other)) => {
            other.0.downcast_ref::<UnauthorizedPeer>().cloned()
        }
        _ => None,
    }
}

/// Verifies client certificates for the server side of the tunnel.
pub struct AuthorizingClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    identity: IdentityVerifier,
}

impl AuthorizingClientVerifier {
    /// Build a verifier over `roots`.
    ///
    /// With `mandatory` unset and no allow patterns, clients may connect
    /// without a certificate; a certificate that is presented is still
    /// verified and authorized. Allow patterns always make it mandatory.
    ///
    /// # Errors
    ///
    /// Fails if rustls rejects the root store.
    pub fn new(
        roots: RootCertStore,
        mandatory: bool,
        identity: IdentityVerifier,
    ) -> TlsResult<Self> {
        let builder = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), crypto_provider());
        let builder = if mandatory || !identity.is_unrestricted() {
            builder
        } else {
            builder.allow_unauthenticated()
        };
        let inner = builder
            .build()
            .map_err(|e| TlsError::Config(format!("failed to build client verifier: {e}")))?;
        Ok(Self { inner, identity })
    }
}

impl fmt::Debug for AuthorizingClientVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizingClientVerifier")
            .field("patterns", &self.identity.patterns().len())
            .field("mandatory", &self.inner.client_auth_mandatory())
            .finish()
    }
}

impl ClientCertVerifier for AuthorizingClientVerifier {
    fn offer_client_auth(&self) -> bool {
        self.inner.offer_client_auth()
    }

    fn client_auth_mandatory(&self) -> bool {
        self.inner.client_auth_mandatory()
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, Error> {
        let verified = self
            .inner
            .verify_client_cert(end_entity, intermediates, now)?;
        authorize(&self.identity, end_entity)?;
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Verifies the target's certificate for the client side of the tunnel.
pub struct AuthorizingServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
    identity: IdentityVerifier,
}

impl AuthorizingServerVerifier {
    /// Build a verifier over `roots`.
    ///
    /// # Errors
    ///
    /// Fails if rustls rejects the root store.
    pub fn new(roots: RootCertStore, identity: IdentityVerifier) -> TlsResult<Self> {
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), crypto_provider())
            .build()
            .map_err(|e| TlsError::Config(format!("failed to build server verifier: {e}")))?;
        Ok(Self { inner, identity })
    }
}

impl fmt::Debug for AuthorizingServerVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizingServerVerifier")
            .field("patterns", &self.identity.patterns().len())
            .finish()
    }
}

impl ServerCertVerifier for AuthorizingServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        let verified = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        )?;
        authorize(&self.identity, end_entity)?;
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_peer_roundtrips_through_io_error() {
        let rejected = UnauthorizedPeer {
            subject: "CN=other.example.com".to_string(),
            name: "other.example.com".to_string(),
        };
        let tls_err = Error::InvalidCertificate(CertificateError::Other(OtherError(Arc::new(
            rejected.clone(),
        ))));
        let io_err = io::Error::new(io::ErrorKind::InvalidData, tls_err);

        assert_eq!(unauthorized_peer(&io_err), Some(rejected));
    }

    #[test]
    fn test_other_errors_are_not_authorization_failures() {
        let io_err = io::Error::new(
            io::ErrorKind::InvalidData,
            Error::InvalidCertificate(CertificateError::UnknownIssuer),
        );
        assert_eq!(unauthorized_peer(&io_err), None);

        let plain = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(unauthorized_peer(&plain), None);
    }

    fn roots() -> RootCertStore {
        crate::tls::ensure_crypto_provider();
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::default();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca = params.self_signed(&key).unwrap();
        let mut roots = RootCertStore::empty();
        roots.add(ca.der().clone()).unwrap();
        roots
    }

    #[test]
    fn test_optional_client_auth_without_patterns() {
        let verifier =
            AuthorizingClientVerifier::new(roots(), false, IdentityVerifier::default()).unwrap();
        assert!(verifier.offer_client_auth());
        assert!(!verifier.client_auth_mandatory());
    }

    #[test]
    fn test_patterns_make_client_auth_mandatory() {
        let identity = IdentityVerifier::new(vec![crate::auth::AllowedIdentityPattern::exact(
            crate::auth::IdentityAttribute::CommonName,
            "client.example.com",
        )]);
        let verifier = AuthorizingClientVerifier::new(roots(), false, identity).unwrap();
        assert!(verifier.client_auth_mandatory());
    }
}
