//! Trust bundles: the roots peers are verified against.

use std::path::Path;

use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use tracing::{debug, warn};

use super::pem;
use crate::error::{KeystoreError, KeystoreResult, TlsError, TlsResult};

/// Certificates used to verify a peer's chain.
///
/// Immutable; a reload replaces the bundle wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustBundle {
    certificates: Vec<CertificateDer<'static>>,
    include_system_roots: bool,
}

impl TrustBundle {
    /// A bundle of explicit certificates.
    pub fn new(certificates: Vec<CertificateDer<'static>>) -> Self {
        Self {
            certificates,
            include_system_roots: false,
        }
    }

    /// The bundled Mozilla roots, for client mode without a CA file.
    pub fn system_roots() -> Self {
        Self {
            certificates: Vec::new(),
            include_system_roots: true,
        }
    }

    /// Explicit certificates in the bundle.
    #[must_use]
    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certificates
    }

    /// Whether the Mozilla root set is added to the explicit certificates.
    #[must_use]
    pub fn includes_system_roots(&self) -> bool {
        self.include_system_roots
    }

    /// True when the bundle holds no explicit certificates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    /// Build a rustls root store from the bundle.
    ///
    /// # Errors
    ///
    /// Fails when no usable trust anchor results.
    pub fn root_store(&self) -> TlsResult<RootCertStore> {
        let mut roots = RootCertStore::empty();

        let (added, ignored) = roots.add_parsable_certificates(self.certificates.iter().cloned());
        if ignored > 0 {
            warn!(ignored, "ignored unparsable trust anchors");
        }
        debug!(added, "added CA certificates to trust store");

        if self.include_system_roots {
            debug!("using bundled Mozilla root certificates");
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }

        if roots.is_empty() {
            return Err(TlsError::Config(
                "trust bundle contains no usable certificates".to_string(),
            ));
        }

        Ok(roots)
    }
}

/// Parse a PEM trust bundle.
///
/// `source` names the bundle in error messages.
///
/// # Errors
///
/// [`KeystoreError::EmptyTrustBundle`] if the document holds no certificate.
pub fn parse_trust_bundle(bytes: &[u8], source: &str) -> KeystoreResult<TrustBundle> {
    let certificates = pem::parse_certificates(bytes)?;
    if certificates.is_empty() {
        return Err(KeystoreError::EmptyTrustBundle(source.to_string()));
    }
    debug!(count = certificates.len(), source, "loaded trust bundle");
    Ok(TrustBundle::new(certificates))
}

/// Read and parse a PEM trust bundle from disk.
///
/// # Errors
///
/// I/O failures and the errors of [`parse_trust_bundle`].
pub fn load_trust_bundle(path: &Path) -> KeystoreResult<TrustBundle> {
    let bytes = std::fs::read(path).map_err(|source| KeystoreError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_trust_bundle(&bytes, &path.display().to_string())
}
