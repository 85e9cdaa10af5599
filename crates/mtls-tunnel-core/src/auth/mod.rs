//! Peer identity extraction and authorization.
//!
//! After a peer's certificate chain has been verified against the trust
//! bundle, the tunnel decides whether that peer may use it. The decision is
//! made by [`IdentityVerifier`] from attributes of the peer's leaf
//! certificate:
//!
//! - subject CN, OU and O
//! - DNS, IP and URI subjectAltNames
//!
//! # Example Configuration
//!
//! ```yaml
//! tls:
//!   allow:
//!     - attribute: cn
//!       value: "client.example.com"
//!     - attribute: ou
//!       value: "payments"
//!     - attribute: dns
//!       wildcard: "*.internal.example.com"
//! ```
//!
//! An empty `allow` list authorizes every peer whose chain verifies.

pub mod identity;
pub mod pattern;
pub mod verifier;

pub use identity::{IdentityError, PeerIdentity};
pub use pattern::{AllowedIdentityPattern, IdentityAttribute, Matcher};
pub use verifier::{authorize, IdentityVerifier, UnauthorizedPeer};
