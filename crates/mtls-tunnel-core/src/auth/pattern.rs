//! Allow-list patterns over certificate identity attributes.
//!
//! A pattern names one identity attribute and a matcher for its value.
//! A peer is matched by a pattern when at least one value of that attribute
//! in its leaf certificate satisfies the matcher.
//!
//! # Matching Rules
//!
//! - Matching is case-sensitive.
//! - [`Matcher::Exact`] compares the whole value.
//! - [`Matcher::Wildcard`] splits pattern and value into tokens at `.` and
//!   `/`. A pattern token that is exactly `*` matches one non-empty value
//!   token, every other token and every separator must be equal, and both
//!   sides must have the same number of tokens. A `*` that is only part of a
//!   token is compared literally.
//!
//! # Examples
//!
//! ```
//! use mtls_tunnel_core::auth::{AllowedIdentityPattern, IdentityAttribute, Matcher};
//!
//! let pattern = AllowedIdentityPattern::wildcard(IdentityAttribute::DnsName, "*.example.com");
//! assert!(pattern.matcher().matches("api.example.com"));
//! assert!(!pattern.matcher().matches("example.com"));
//! assert!(!pattern.matcher().matches("a.b.example.com"));
//!
//! let exact = Matcher::Exact("client.example.com".to_string());
//! assert!(exact.matches("client.example.com"));
//! assert!(!exact.matches("Client.example.com"));
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use super::identity::PeerIdentity;

/// Token separators recognized by wildcard patterns.
const SEPARATORS: [char; 2] = ['.', '/'];

/// Certificate attribute a pattern applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum IdentityAttribute {
    /// Subject common name (CN).
    #[serde(rename = "cn")]
    CommonName,
    /// Subject organizational unit (OU).
    #[serde(rename = "ou")]
    OrganizationalUnit,
    /// Subject organization (O).
    #[serde(rename = "o")]
    Organization,
    /// DNS name from the subjectAltName extension.
    #[serde(rename = "dns")]
    DnsName,
    /// IP address from the subjectAltName extension.
    #[serde(rename = "ip")]
    IpAddress,
    /// URI from the subjectAltName extension.
    #[serde(rename = "uri")]
    Uri,
}

impl IdentityAttribute {
    /// Short label used in logs and configuration.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::CommonName => "cn",
            Self::OrganizationalUnit => "ou",
            Self::Organization => "o",
            Self::DnsName => "dns",
            Self::IpAddress => "ip",
            Self::Uri => "uri",
        }
    }
}

impl fmt::Display for IdentityAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How a pattern value is compared against an attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Matcher {
    /// Case-sensitive whole-string equality.
    Exact(String),
    /// Token-wise comparison where a `*` token matches one token.
    Wildcard(String),
}

impl Matcher {
    /// Check whether `value` satisfies this matcher.
    #[must_use]
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Exact(expected) => expected == value,
            Self::Wildcard(pattern) => wildcard_matches(pattern, value),
        }
    }

    /// The raw pattern text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Exact(s) | Self::Wildcard(s) => s,
        }
    }
}

/// One entry of the allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AllowedIdentityPattern {
    attribute: IdentityAttribute,
    matcher: Matcher,
}

impl AllowedIdentityPattern {
    /// Create a pattern with an explicit matcher.
    pub fn new(attribute: IdentityAttribute, matcher: Matcher) -> Self {
        Self { attribute, matcher }
    }

    /// Create an exact-match pattern.
    pub fn exact(attribute: IdentityAttribute, value: impl Into<String>) -> Self {
        Self::new(attribute, Matcher::Exact(value.into()))
    }

    /// Create a wildcard pattern.
    pub fn wildcard(attribute: IdentityAttribute, pattern: impl Into<String>) -> Self {
        Self::new(attribute, Matcher::Wildcard(pattern.into()))
    }

    /// The attribute this pattern inspects.
    #[must_use]
    pub fn attribute(&self) -> IdentityAttribute {
        self.attribute
    }

    /// The matcher applied to attribute values.
    #[must_use]
    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    /// Check whether any value of the pattern's attribute matches.
    #[must_use]
    pub fn matches(&self, identity: &PeerIdentity) -> bool {
        match self.attribute {
            IdentityAttribute::CommonName => self.any_match(&identity.common_names),
            IdentityAttribute::OrganizationalUnit => {
                self.any_match(&identity.organizational_units)
            }
            IdentityAttribute::Organization => self.any_match(&identity.organizations),
            IdentityAttribute::DnsName => self.any_match(&identity.dns_names),
            IdentityAttribute::Uri => self.any_match(&identity.uris),
            IdentityAttribute::IpAddress => identity
                .ip_addresses
                .iter()
                .any(|ip| self.matcher.matches(&ip.to_string())),
        }
    }

    fn any_match(&self, values: &[String]) -> bool {
        values.iter().any(|v| self.matcher.matches(v))
    }
}

impl fmt::Display for AllowedIdentityPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.matcher {
            Matcher::Exact(v) => write!(f, "{}={}", self.attribute, v),
            Matcher::Wildcard(p) => write!(f, "{}~{}", self.attribute, p),
        }
    }
}

/// Split into alternating segment / separator tokens.
///
/// `"a.b/c"` becomes `["a", ".", "b", "/", "c"]`; segments may be empty.
fn tokenize(s: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = 0;
    for (i, c) in s.char_indices() {
        if SEPARATORS.contains(&c) {
            tokens.push(&s[start..i]);
            tokens.push(&s[i..i + c.len_utf8()]);
            start = i + c.len_utf8();
        }
    }
    tokens.push(&s[start..]);
    tokens
}

fn wildcard_matches(pattern: &str, value: &str) -> bool {
    let pattern_tokens = tokenize(pattern);
    let value_tokens = tokenize(value);

    if pattern_tokens.len() != value_tokens.len() {
        return false;
    }

    // Segments sit at even indices, separators at odd ones.
    pattern_tokens
        .iter()
        .zip(&value_tokens)
        .enumerate()
        .all(|(i, (p, v))| {
            if i % 2 == 0 && *p == "*" {
                !v.is_empty()
            } else {
                p == v
            }
        })
}
