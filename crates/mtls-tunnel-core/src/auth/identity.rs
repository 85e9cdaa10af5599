//! Identity attributes extracted from a peer's leaf certificate.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use rustls::pki_types::CertificateDer;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;

/// Identity attributes of a verified peer.
///
/// Built from the subject DN and the subjectAltName extension of the peer's
/// leaf certificate. Attributes that occur several times keep every value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Full subject DN, RFC 4514 style.
    pub subject: String,
    /// Subject CN values.
    pub common_names: Vec<String>,
    /// Subject OU values.
    pub organizational_units: Vec<String>,
    /// Subject O values.
    pub organizations: Vec<String>,
    /// DNS SANs.
    pub dns_names: Vec<String>,
    /// IP SANs.
    pub ip_addresses: Vec<IpAddr>,
    /// URI SANs.
    pub uris: Vec<String>,
}

impl PeerIdentity {
    /// Extract the identity from a DER-encoded certificate.
    ///
    /// # Errors
    ///
    /// Returns an error if the certificate cannot be parsed.
    pub fn from_certificate(cert: &CertificateDer<'_>) -> Result<Self, IdentityError> {
        let (_, cert) = parse_x509_certificate(cert.as_ref())
            .map_err(|e| IdentityError::CertificateParse(e.to_string()))?;

        let subject = cert.subject();
        let mut identity = Self {
            subject: subject.to_string(),
            common_names: collect_attrs(subject.iter_common_name()),
            organizational_units: collect_attrs(subject.iter_organizational_unit()),
            organizations: collect_attrs(subject.iter_organization()),
            ..Self::default()
        };

        let san = cert
            .subject_alternative_name()
            .map_err(|e| IdentityError::CertificateParse(e.to_string()))?;

        if let Some(san) = san {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => identity.dns_names.push((*dns).to_string()),
                    GeneralName::URI(uri) => identity.uris.push((*uri).to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            identity.ip_addresses.push(ip);
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(identity)
    }

    /// The first common name, if any.
    #[must_use]
    pub fn common_name(&self) -> Option<&str> {
        self.common_names.first().map(String::as_str)
    }

    /// Short human-readable name: the CN, else the first DNS SAN, else the DN.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.common_name()
            .or_else(|| self.dns_names.first().map(String::as_str))
            .unwrap_or(&self.subject)
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.subject)
    }
}

fn collect_attrs<'r, 'a: 'r>(
    attrs: impl Iterator<Item = &'r AttributeTypeAndValue<'a>>,
) -> Vec<String> {
    attrs
        .filter_map(|attr| attr.as_str().ok())
        .map(str::to_string)
        .collect()
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes)
            .ok()
            .map(|b| IpAddr::V4(Ipv4Addr::from(b))),
        16 => <[u8; 16]>::try_from(bytes)
            .ok()
            .map(|b| IpAddr::V6(Ipv6Addr::from(b))),
        _ => None,
    }
}

/// Errors from identity extraction.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IdentityError {
    /// Failed to parse the X.509 certificate.
    #[error("failed to parse certificate: {0}")]
    CertificateParse(String),
    /// No peer certificate available.
    #[error("no peer certificate available")]
    NoCertificate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};

    fn cert_with(cn: &str, ou: &[&str], sans: Vec<SanType>) -> CertificateDer<'static> {
        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, cn);
        for unit in ou {
            params
                .distinguished_name
                .push(DnType::OrganizationalUnitName, *unit);
        }
        params.subject_alt_names = sans;
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().der().clone()
    }

    #[test]
    fn test_extracts_subject_attributes() {
        let der = cert_with("client.example.com", &["payments"], vec![]);
        let id = PeerIdentity::from_certificate(&der).unwrap();
        assert_eq!(id.common_name(), Some("client.example.com"));
        assert_eq!(id.organizational_units, vec!["payments".to_string()]);
        assert!(id.subject.contains("CN=client.example.com"));
    }

    #[test]
    fn test_extracts_sans() {
        let der = cert_with(
            "svc",
            &[],
            vec![
                SanType::DnsName("svc.internal".try_into().unwrap()),
                SanType::IpAddress(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))),
                SanType::URI("spiffe://example.org/svc".try_into().unwrap()),
            ],
        );
        let id = PeerIdentity::from_certificate(&der).unwrap();
        assert_eq!(id.dns_names, vec!["svc.internal".to_string()]);
        assert_eq!(id.ip_addresses, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        assert_eq!(id.uris, vec!["spiffe://example.org/svc".to_string()]);
    }

    #[test]
    fn test_display_name_fallbacks() {
        let id = PeerIdentity {
            subject: "O=Org".to_string(),
            dns_names: vec!["host.example".to_string()],
            ..PeerIdentity::default()
        };
        assert_eq!(id.display_name(), "host.example");

        let id = PeerIdentity {
            subject: "O=Org".to_string(),
            ..PeerIdentity::default()
        };
        assert_eq!(id.display_name(), "O=Org");
    }

    #[test]
    fn test_garbage_certificate() {
        let der = CertificateDer::from(vec![0x30, 0x03, 0x01, 0x01, 0xff]);
        assert!(matches!(
            PeerIdentity::from_certificate(&der),
            Err(IdentityError::CertificateParse(_))
        ));
    }
}
