//! PKCS#12 (PFX) keystores.
//!
//! Both the legacy layout (SHA-1 MAC, 3DES/RC2 bags) and the PBES2 layout
//! written by OpenSSL 3 (AES-256 bags, HMAC-SHA256 MAC) are accepted.

use p12_keystore::error::Error as Pkcs12Error;
use p12_keystore::{KeyStore, KeyStoreEntry};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::debug;

use super::Password;
use crate::error::{KeystoreError, KeystoreResult};

/// Open a DER-encoded PKCS#12 container.
///
/// The MAC is checked before anything is decrypted, so a wrong password is
/// reported as [`KeystoreError::Decryption`] rather than as garbage bags.
/// Unsupported algorithms are [`KeystoreError::Parse`]. Certificates come
/// back unordered; the caller sorts them leaf-first.
pub(crate) fn parse(
    bytes: &[u8],
    password: &Password,
) -> KeystoreResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let keystore = KeyStore::from_pkcs12(bytes, password.expose()).map_err(|e| match e {
        Pkcs12Error::MacError(_) => {
            KeystoreError::Decryption("MAC verification failed (wrong password?)".to_string())
        }
        other => KeystoreError::Parse(format!("unreadable PKCS#12 keystore: {other}")),
    })?;

    let mut keys = Vec::new();
    let mut certs: Vec<CertificateDer<'static>> = Vec::new();
    for (alias, entry) in keystore.entries() {
        match entry {
            KeyStoreEntry::PrivateKeyChain(chain) => {
                debug!(alias = %alias, chain_len = chain.chain().len(), "PKCS#12 key entry");
                keys.push(chain.key().to_vec());
                for cert in chain.chain() {
                    push_unique(&mut certs, cert.as_der());
                }
            }
            KeyStoreEntry::Certificate(cert) => push_unique(&mut certs, cert.as_der()),
            #[allow(unreachable_patterns)]
            _ => {}
        }
    }

    let key = match keys.len() {
        0 => return Err(KeystoreError::Parse("no private key in PKCS#12 keystore".to_string())),
        1 => keys.remove(0),
        n => {
            return Err(KeystoreError::Parse(format!(
                "expected one private key in PKCS#12 keystore, found {n}"
            )))
        }
    };

    if certs.is_empty() {
        return Err(KeystoreError::Parse(
            "no certificate in PKCS#12 keystore".to_string(),
        ));
    }

    debug!(certificates = certs.len(), "opened PKCS#12 keystore");

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key));
    Ok((certs, key))
}

fn push_unique(certs: &mut Vec<CertificateDer<'static>>, der: &[u8]) {
    if !certs.iter().any(|c| c.as_ref() == der) {
        certs.push(CertificateDer::from(der.to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p12_keystore::{Certificate, PrivateKeyChain};
    use rcgen::{CertificateParams, KeyPair};

    fn self_signed() -> (rcgen::Certificate, KeyPair) {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        (cert, key)
    }

    fn legacy_keystore(password: &str) -> Vec<u8> {
        let (cert, key) = self_signed();
        p12::PFX::new(cert.der(), &key.serialize_der(), None, password, "tunnel")
            .unwrap()
            .to_der()
    }

    fn pbes2_keystore(password: &str) -> Vec<u8> {
        let (cert, key) = self_signed();
        let mut keystore = KeyStore::new();
        keystore.add_entry(
            "tunnel",
            KeyStoreEntry::PrivateKeyChain(PrivateKeyChain::new(
                key.serialize_der(),
                [1u8; 20],
                [Certificate::from_der(cert.der()).unwrap()],
            )),
        );
        keystore.writer(password).write().unwrap()
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn test_parse_legacy_keystore() {
        let bytes = legacy_keystore("changeit");
        let (certs, key) = parse(&bytes, &Password::new("changeit")).unwrap();
        assert_eq!(certs.len(), 1);
        assert!(matches!(key, PrivateKeyDer::Pkcs8(_)));
    }

    #[test]
    fn test_parse_pbes2_sha256_keystore() {
        let bytes = pbes2_keystore("changeit");
        // PBES2 (1.2.840.113549.1.5.13) and SHA-256 (2.16.840.1.101.3.4.2.1)
        assert!(contains(&bytes, &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x05, 0x0d]));
        assert!(contains(&bytes, &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01]));

        let (certs, key) = parse(&bytes, &Password::new("changeit")).unwrap();
        assert_eq!(certs.len(), 1);
        assert!(matches!(key, PrivateKeyDer::Pkcs8(_)));
    }

    #[test]
    fn test_wrong_password() {
        for bytes in [legacy_keystore("changeit"), pbes2_keystore("changeit")] {
            let err = parse(&bytes, &Password::new("nope")).unwrap_err();
            assert!(matches!(err, KeystoreError::Decryption(_)), "{err:?}");
        }
    }

    #[test]
    fn test_not_a_keystore() {
        let err = parse(b"\x01\x02\x03", &Password::new("changeit")).unwrap_err();
        assert!(matches!(err, KeystoreError::Parse(_)));
    }
}
