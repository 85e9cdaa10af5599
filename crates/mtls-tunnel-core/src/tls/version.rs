//! Minimum protocol version policy.

use std::fmt;
use std::str::FromStr;

use rustls::{ProtocolVersion, SupportedProtocolVersion};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TlsError;

static TLS12_AND_13: &[&SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Lowest protocol version the tunnel will negotiate.
///
/// rustls implements TLS 1.2 and 1.3 only, so the 1.0 and 1.1 floors
/// negotiate exactly like 1.2.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MinTlsVersion {
    Tls10,
    Tls11,
    #[default]
    Tls12,
    Tls13,
}

impl MinTlsVersion {
    /// Parse one of `"1.0"`, `"1.1"`, `"1.2"`, `"1.3"`.
    ///
    /// # Errors
    ///
    /// [`TlsError::UnsupportedVersion`] for anything else.
    pub fn parse(literal: &str) -> Result<Self, TlsError> {
        match literal {
            "1.0" => Ok(Self::Tls10),
            "1.1" => Ok(Self::Tls11),
            "1.2" => Ok(Self::Tls12),
            "1.3" => Ok(Self::Tls13),
            other => Err(TlsError::UnsupportedVersion(other.to_string())),
        }
    }

    /// The protocol constant this floor names.
    #[must_use]
    pub fn protocol_version(&self) -> ProtocolVersion {
        match self {
            Self::Tls10 => ProtocolVersion::TLSv1_0,
            Self::Tls11 => ProtocolVersion::TLSv1_1,
            Self::Tls12 => ProtocolVersion::TLSv1_2,
            Self::Tls13 => ProtocolVersion::TLSv1_3,
        }
    }

    /// The versions enabled on the wire for this floor.
    #[must_use]
    pub fn supported_versions(&self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            Self::Tls13 => TLS13_ONLY,
            Self::Tls10 | Self::Tls11 | Self::Tls12 => TLS12_AND_13,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tls10 => "1.0",
            Self::Tls11 => "1.1",
            Self::Tls12 => "1.2",
            Self::Tls13 => "1.3",
        }
    }
}

impl fmt::Display for MinTlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MinTlsVersion {
    type Err = TlsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

struct MinTlsVersionVisitor;

impl Visitor<'_> for MinTlsVersionVisitor {
    type Value = MinTlsVersion;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("one of \"1.0\", \"1.1\", \"1.2\", \"1.3\"")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        MinTlsVersion::parse(v).map_err(E::custom)
    }

    // Unquoted `1.2` in YAML arrives as a float. Only the exact values
    // qualify; `1.25` must not round to a supported floor.
    #[allow(clippy::float_cmp)]
    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        [
            (1.0, MinTlsVersion::Tls10),
            (1.1, MinTlsVersion::Tls11),
            (1.2, MinTlsVersion::Tls12),
            (1.3, MinTlsVersion::Tls13),
        ]
        .into_iter()
        .find_map(|(literal, version)| (v == literal).then_some(version))
        .ok_or_else(|| E::custom(TlsError::UnsupportedVersion(v.to_string())))
    }
}

impl<'de> Deserialize<'de> for MinTlsVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(MinTlsVersionVisitor)
    }
}

impl Serialize for MinTlsVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literals_map_to_protocol_constants() {
        let cases = [
            ("1.0", ProtocolVersion::TLSv1_0),
            ("1.1", ProtocolVersion::TLSv1_1),
            ("1.2", ProtocolVersion::TLSv1_2),
            ("1.3", ProtocolVersion::TLSv1_3),
        ];
        for (literal, expected) in cases {
            let version = MinTlsVersion::parse(literal).unwrap();
            assert_eq!(version.protocol_version(), expected);
            assert_eq!(version.as_str(), literal);
        }
    }

    #[test]
    fn test_unsupported_literals() {
        for literal in ["1.4", "", "TLSv1.2", "1", "ssl3"] {
            assert!(matches!(
                MinTlsVersion::parse(literal),
                Err(TlsError::UnsupportedVersion(_))
            ));
        }
    }

    #[test]
    fn test_default_is_tls12() {
        assert_eq!(MinTlsVersion::default(), MinTlsVersion::Tls12);
    }

    #[test]
    fn test_wire_versions() {
        assert_eq!(MinTlsVersion::Tls13.supported_versions().len(), 1);
        assert_eq!(MinTlsVersion::Tls10.supported_versions().len(), 2);
        assert_eq!(
            MinTlsVersion::Tls13.supported_versions()[0].version,
            ProtocolVersion::TLSv1_3
        );
    }

    #[test]
    fn test_deserialize() {
        let v: MinTlsVersion = serde_yaml::from_str("\"1.3\"").unwrap();
        assert_eq!(v, MinTlsVersion::Tls13);
        let v: MinTlsVersion = serde_yaml::from_str("1.2").unwrap();
        assert_eq!(v, MinTlsVersion::Tls12);
        let v: MinTlsVersion = serde_yaml::from_str("1.0").unwrap();
        assert_eq!(v, MinTlsVersion::Tls10);
        assert!(serde_yaml::from_str::<MinTlsVersion>("\"2.0\"").is_err());
    }

    #[test]
    fn test_deserialize_rejects_near_floats() {
        for literal in ["1.25", "1.04", "1.31", "2.0"] {
            let err = serde_yaml::from_str::<MinTlsVersion>(literal).unwrap_err();
            assert!(err.to_string().contains("unsupported"), "{literal}: {err}");
        }
    }
}
