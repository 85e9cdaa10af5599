//! Throwaway PKI for tests.
//!
//! A [`TestPki`] is a self-signed root plus a temporary directory. Leaf
//! certificates issued from it carry both server and client EKUs, so one
//! identity can sit on either side of a handshake.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, CertifiedIssuer, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, SanType,
};
use rustls::pki_types::CertificateDer;
use tempfile::TempDir;

use crate::keystore::{load_identity, Identity, Password};

/// What to put in an issued leaf certificate.
#[derive(Debug, Clone, Default)]
pub struct LeafSpec {
    pub common_name: String,
    /// Only the last one is kept; rcgen stores one value per attribute.
    pub organizational_units: Vec<String>,
    /// Parsed as IP addresses when possible, DNS names otherwise.
    pub subject_alt_names: Vec<String>,
}

impl LeafSpec {
    /// Leaf with `common_name` as both CN and DNS SAN.
    pub fn new(common_name: impl Into<String>) -> Self {
        let common_name = common_name.into();
        Self {
            subject_alt_names: vec![common_name.clone()],
            common_name,
            organizational_units: Vec::new(),
        }
    }

    #[must_use]
    pub fn ou(mut self, ou: impl Into<String>) -> Self {
        self.organizational_units.push(ou.into());
        self
    }

    #[must_use]
    pub fn san(mut self, san: impl Into<String>) -> Self {
        self.subject_alt_names.push(san.into());
        self
    }

    /// Replace all SANs.
    #[must_use]
    pub fn sans(mut self, sans: &[&str]) -> Self {
        self.subject_alt_names = sans.iter().map(|s| (*s).to_string()).collect();
        self
    }
}

/// An issued leaf with its key, as PEM and DER.
pub struct TestIdentity {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: CertificateDer<'static>,
    pub key_der: Vec<u8>,
    root_der: CertificateDer<'static>,
}

impl TestIdentity {
    /// Certificate and key concatenated into one PEM bundle.
    #[must_use]
    pub fn pem_bundle(&self) -> String {
        format!("{}{}", self.cert_pem, self.key_pem)
    }

    /// Parse into a validated [`Identity`].
    ///
    /// # Panics
    ///
    /// Panics if the generated material does not load.
    #[must_use]
    pub fn identity(&self) -> Identity {
        load_identity(self.pem_bundle().as_bytes(), &Password::default())
            .expect("test identity should load")
    }

    /// PKCS#12 container holding the leaf, its key and the issuing root,
    /// in the PBES2 layout (AES-256 bags, HMAC-SHA256 MAC).
    ///
    /// # Panics
    ///
    /// Panics if the container cannot be built.
    #[must_use]
    pub fn pkcs12(&self, password: &str) -> Vec<u8> {
        let chain = [self.cert_der.as_ref(), self.root_der.as_ref()]
            .into_iter()
            .map(|der| p12_keystore::Certificate::from_der(der).expect("certificate should parse"));
        let mut keystore = p12_keystore::KeyStore::new();
        keystore.add_entry(
            "tunnel",
            p12_keystore::KeyStoreEntry::PrivateKeyChain(p12_keystore::PrivateKeyChain::new(
                &self.key_der,
                [7u8; 20],
                chain,
            )),
        );
        keystore
            .writer(password)
            .write()
            .expect("pkcs12 creation should succeed")
    }

    /// Same content as [`pkcs12`](Self::pkcs12) in the legacy layout
    /// (SHA-1 MAC, 3DES bags) that older Java and OpenSSL tools write.
    ///
    /// # Panics
    ///
    /// Panics if the container cannot be built.
    #[must_use]
    pub fn pkcs12_legacy(&self, password: &str) -> Vec<u8> {
        p12::PFX::new(
            &self.cert_der,
            &self.key_der,
            Some(self.root_der.as_ref()),
            password,
            "tunnel",
        )
        .expect("pkcs12 creation should succeed")
        .to_der()
    }
}

/// Root CA plus a scratch directory for key material.
pub struct TestPki {
    root: CertifiedIssuer<'static, KeyPair>,
    dir: TempDir,
}

impl TestPki {
    /// Create a root CA named `name`.
    ///
    /// # Panics
    ///
    /// Panics if key generation or the temporary directory fails.
    #[must_use]
    pub fn new(name: &str) -> Self {
        crate::tls::ensure_crypto_provider();

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, name);
        params
            .distinguished_name
            .push(DnType::OrganizationName, "mtls-tunnel tests");

        let key = KeyPair::generate().expect("key generation should succeed");
        let root = CertifiedIssuer::self_signed(params, key).expect("root CA should sign");

        Self {
            root,
            dir: tempfile::tempdir().expect("temp dir should be created"),
        }
    }

    /// The root certificate, DER.
    #[must_use]
    pub fn root_der(&self) -> CertificateDer<'static> {
        self.root.as_ref().der().clone()
    }

    /// The root certificate, PEM.
    #[must_use]
    pub fn root_pem(&self) -> String {
        self.root.as_ref().pem()
    }

    /// Issue a leaf certificate signed by the root.
    ///
    /// # Panics
    ///
    /// Panics if a SAN is not a valid DNS name or signing fails.
    #[must_use]
    pub fn issue(&self, spec: &LeafSpec) -> TestIdentity {
        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, spec.common_name.as_str());
        for ou in &spec.organizational_units {
            params
                .distinguished_name
                .push(DnType::OrganizationalUnitName, ou.as_str());
        }
        params.subject_alt_names = spec
            .subject_alt_names
            .iter()
            .map(|san| match san.parse::<IpAddr>() {
                Ok(ip) => SanType::IpAddress(ip),
                Err(_) => SanType::DnsName(san.clone().try_into().expect("valid DNS SAN")),
            })
            .collect();
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let key = KeyPair::generate().expect("key generation should succeed");
        let cert = params
            .signed_by(&key, &self.root)
            .expect("leaf should sign");

        TestIdentity {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            cert_der: cert.der().clone(),
            key_der: key.serialize_der(),
            root_der: self.root_der(),
        }
    }

    /// The scratch directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Write `contents` to `name` inside the scratch directory.
    ///
    /// # Panics
    ///
    /// Panics if the write fails.
    pub fn write(&self, name: &str, contents: impl AsRef<[u8]>) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).expect("test file should be written");
        path
    }

    /// Write the root certificate as a PEM trust bundle.
    pub fn write_root(&self, name: &str) -> PathBuf {
        self.write(name, self.root_pem())
    }
}
