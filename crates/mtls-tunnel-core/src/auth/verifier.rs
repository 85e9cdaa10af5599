//! Authorization of chain-verified peers against the allow-list.
//!
//! The verifier is a pure decision over the peer's certificate chain. It is
//! invoked from inside the rustls peer verifiers (see `tls::verifier`) once
//! webpki chain verification has succeeded, and can be tested without any
//! socket I/O.

use std::sync::Arc;

use rustls::pki_types::CertificateDer;

use super::identity::{IdentityError, PeerIdentity};
use super::pattern::AllowedIdentityPattern;

/// Decides whether a verified peer may use the tunnel.
///
/// An empty pattern set authorizes every peer that passed chain
/// verification. Otherwise at least one pattern must match the peer's leaf
/// certificate.
///
/// Cloning is cheap; the pattern set is shared.
#[derive(Debug, Clone, Default)]
pub struct IdentityVerifier {
    patterns: Arc<[AllowedIdentityPattern]>,
}

impl IdentityVerifier {
    /// Create a verifier for the given allow-list.
    pub fn new(patterns: Vec<AllowedIdentityPattern>) -> Self {
        Self {
            patterns: patterns.into(),
        }
    }

    /// A verifier that authorizes any chain-verified peer.
    pub fn allow_any() -> Self {
        Self::default()
    }

    /// The configured patterns.
    #[must_use]
    pub fn patterns(&self) -> &[AllowedIdentityPattern] {
        &self.patterns
    }

    /// Whether every verified peer is authorized.
    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Authorize a peer by its certificate chain (leaf first).
    ///
    /// # Errors
    ///
    /// Returns [`UnauthorizedPeer`] when the chain is empty, the leaf cannot
    /// be parsed, or no pattern matches.
    pub fn authorize(
        &self,
        peer_chain: &[CertificateDer<'_>],
    ) -> Result<PeerIdentity, UnauthorizedPeer> {
        let leaf = peer_chain
            .first()
            .ok_or_else(|| UnauthorizedPeer::from_error(&IdentityError::NoCertificate))?;

        let identity =
            PeerIdentity::from_certificate(leaf).map_err(|e| UnauthorizedPeer::from_error(&e))?;

        if self.authorize_identity(&identity) {
            Ok(identity)
        } else {
            Err(UnauthorizedPeer::new(&identity))
        }
    }

    /// Authorize already-extracted identity attributes.
    #[must_use]
    pub fn authorize_identity(&self, identity: &PeerIdentity) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.matches(identity))
    }
}

/// Boolean form of [`IdentityVerifier::authorize`].
#[must_use]
pub fn authorize(peer_chain: &[CertificateDer<'_>], patterns: &[AllowedIdentityPattern]) -> bool {
    IdentityVerifier::new(patterns.to_vec())
        .authorize(peer_chain)
        .is_ok()
}

/// A peer that passed chain verification but is not on the allow-list.
///
/// Carried through rustls as the payload of a certificate error so the
/// proxy engine can tell authorization failures apart from other handshake
/// failures. The peer itself only sees a generic alert.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("peer '{subject}' is not authorized")]
pub struct UnauthorizedPeer {
    /// Subject DN of the rejected peer, or the extraction failure.
    pub subject: String,
    /// Short name (CN / first DNS SAN) for audit events.
    pub name: String,
}

impl UnauthorizedPeer {
    fn new(identity: &PeerIdentity) -> Self {
        Self {
            subject: identity.subject.clone(),
            name: identity.display_name().to_string(),
        }
    }

    fn from_error(err: &IdentityError) -> Self {
        Self {
            subject: err.to_string(),
            name: String::new(),
        }
    }
}
