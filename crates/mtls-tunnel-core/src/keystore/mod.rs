//! Loading of the tunnel's own identity and of the trust bundle.
//!
//! An identity is a private key plus its certificate chain, ordered
//! leaf-first. It can come from:
//!
//! - a PKCS#12 (`.p12` / `.pfx`) container opened with a password,
//! - a PEM bundle holding certificates and one private key in any order,
//! - a separate certificate PEM and key PEM.
//!
//! Format detection is by content: anything containing a PEM boundary is
//! treated as PEM, everything else as DER PKCS#12.
//!
//! All parsing functions are pure. File-reading wrappers exist for startup;
//! [`KeystoreSources`] reads through `tokio::fs` for reloads.

mod chain;
mod pem;
mod pkcs12;
mod trust;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls::InconsistentKeys;
use tracing::{debug, warn};

use crate::error::{KeystoreError, KeystoreResult};
use crate::tls::crypto_provider;

pub use trust::{load_trust_bundle, parse_trust_bundle, TrustBundle};

/// Keystore password. Never printed.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Password(String);

impl Password {
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }

    pub(crate) fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

impl From<String> for Password {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The tunnel's own key and certificate chain.
///
/// The chain is non-empty and leaf-first; the key matches the leaf.
pub struct Identity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Identity {
    /// Validate and assemble an identity.
    ///
    /// # Errors
    ///
    /// [`KeystoreError::Parse`] for an empty chain or a key rustls cannot
    /// use, [`KeystoreError::KeyMismatch`] if the key does not belong to the
    /// first certificate.
    pub fn new(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> KeystoreResult<Self> {
        if chain.is_empty() {
            return Err(KeystoreError::Parse("certificate chain is empty".to_string()));
        }
        check_key_matches(&chain, &key)?;
        Ok(Self { chain, key })
    }

    /// Certificate chain, leaf first.
    #[must_use]
    pub fn certificate_chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// The leaf certificate.
    #[must_use]
    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    /// The private key.
    #[must_use]
    pub fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.key
    }

    /// Whether two identities carry the same key material.
    #[must_use]
    pub fn same_material(&self, other: &Self) -> bool {
        self.chain == other.chain && self.key.secret_der() == other.key.secret_der()
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("chain_len", &self.chain.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

fn check_key_matches(
    chain: &[CertificateDer<'static>],
    key: &PrivateKeyDer<'static>,
) -> KeystoreResult<()> {
    let signing_key = crypto_provider()
        .key_provider
        .load_private_key(key.clone_key())
        .map_err(|e| KeystoreError::Parse(format!("unusable private key: {e}")))?;

    key_match_outcome(CertifiedKey::new(chain.to_vec(), signing_key).keys_match())
}

fn key_match_outcome(checked: Result<(), rustls::Error>) -> KeystoreResult<()> {
    match checked {
        Ok(()) => Ok(()),
        Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => {
            warn!("cannot derive a public key for this key type, key/certificate match unchecked");
            Ok(())
        }
        Err(rustls::Error::InconsistentKeys(InconsistentKeys::KeyMismatch)) => {
            Err(KeystoreError::KeyMismatch)
        }
        Err(e) => Err(KeystoreError::Parse(format!("invalid leaf certificate: {e}"))),
    }
}

/// Parse a keystore (PKCS#12 or PEM bundle) into an [`Identity`].
///
/// The password is ignored for PEM bundles.
///
/// # Errors
///
/// See [`KeystoreError`].
pub fn load_identity(bytes: &[u8], password: &Password) -> KeystoreResult<Identity> {
    let (certs, key) = if pem::looks_like_pem(bytes) {
        pem::parse_bundle(bytes)?
    } else {
        pkcs12::parse(bytes, password)?
    };

    let chain = chain::order_leaf_first(certs)?;
    let identity = Identity::new(chain, key)?;
    debug!(chain_len = identity.chain.len(), "loaded identity");
    Ok(identity)
}

/// Read a keystore file and parse it with [`load_identity`].
///
/// # Errors
///
/// I/O failures plus the errors of [`load_identity`].
pub fn load_identity_file(path: &Path, password: &Password) -> KeystoreResult<Identity> {
    load_identity(&read(path)?, password)
}

/// Load an identity from a certificate PEM and a separate key PEM.
///
/// # Errors
///
/// I/O failures plus the errors of [`load_identity`].
pub fn load_cert_and_key(cert_path: &Path, key_path: &Path) -> KeystoreResult<Identity> {
    let mut bytes = read(cert_path)?;
    bytes.push(b'\n');
    bytes.extend(read(key_path)?);
    load_identity(&bytes, &Password::default())
}

fn read(path: &Path) -> KeystoreResult<Vec<u8>> {
    std::fs::read(path).map_err(|source| KeystoreError::Io {
        path: path.display().to_string(),
        source,
    })
}

async fn read_async(path: &Path) -> KeystoreResult<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|source| KeystoreError::Io {
            path: path.display().to_string(),
            source,
        })
}

/// Where the identity comes from.
#[derive(Debug, Clone)]
pub enum IdentitySource {
    /// A PKCS#12 or PEM bundle keystore.
    Keystore { path: PathBuf, password: Password },
    /// A certificate PEM plus a key PEM.
    CertAndKey { cert_path: PathBuf, key_path: PathBuf },
}

/// Everything the certificate store (re)reads from disk.
#[derive(Debug, Clone)]
pub struct KeystoreSources {
    pub identity: IdentitySource,
    /// PEM trust bundle. Without one, the Mozilla roots are used.
    pub trust_bundle: Option<PathBuf>,
    /// Inbound peers must present certificates, so the trust bundle must
    /// hold at least one explicit certificate.
    pub require_trust: bool,
}

impl KeystoreSources {
    /// Read and validate the identity and the trust bundle.
    ///
    /// # Errors
    ///
    /// Any [`KeystoreError`]; nothing is partially returned.
    pub async fn load(&self) -> KeystoreResult<(Arc<Identity>, Arc<TrustBundle>)> {
        let identity = match &self.identity {
            IdentitySource::Keystore { path, password } => {
                load_identity(&read_async(path).await?, password)?
            }
            IdentitySource::CertAndKey {
                cert_path,
                key_path,
            } => {
                let mut bytes = read_async(cert_path).await?;
                bytes.push(b'\n');
                bytes.extend(read_async(key_path).await?);
                load_identity(&bytes, &Password::default())?
            }
        };

        let trust = match &self.trust_bundle {
            Some(path) => parse_trust_bundle(&read_async(path).await?, &path.display().to_string())?,
            None if self.require_trust => {
                return Err(KeystoreError::EmptyTrustBundle("<none configured>".to_string()))
            }
            None => TrustBundle::system_roots(),
        };

        Ok((Arc::new(identity), Arc::new(trust)))
    }
}
