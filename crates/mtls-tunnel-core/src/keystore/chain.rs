//! Leaf-first ordering of certificate chains.

use rustls::pki_types::CertificateDer;
use x509_parser::prelude::*;

use crate::error::{KeystoreError, KeystoreResult};

struct Names {
    subject: Vec<u8>,
    issuer: Vec<u8>,
}

impl Names {
    fn is_self_issued(&self) -> bool {
        self.subject == self.issuer
    }
}

fn names(cert: &CertificateDer<'_>) -> KeystoreResult<Names> {
    let (_, parsed) = parse_x509_certificate(cert.as_ref())
        .map_err(|e| KeystoreError::Parse(format!("invalid certificate in keystore: {e}")))?;
    Ok(Names {
        subject: parsed.subject().as_raw().to_vec(),
        issuer: parsed.issuer().as_raw().to_vec(),
    })
}

/// Reorder certificates so the leaf comes first, followed by its issuers.
///
/// The leaf is the first certificate that issued no other certificate in the
/// set. From there issuer names are followed to subject names until the
/// chain ends or reaches a self-issued root. Certificates not on that path
/// are appended in their original order.
pub(crate) fn order_leaf_first(
    certs: Vec<CertificateDer<'static>>,
) -> KeystoreResult<Vec<CertificateDer<'static>>> {
    if certs.len() < 2 {
        return Ok(certs);
    }

    let names = certs.iter().map(names).collect::<KeystoreResult<Vec<_>>>()?;

    let issued_another = |i: usize| {
        names
            .iter()
            .enumerate()
            .any(|(j, other)| j != i && !other.is_self_issued() && other.issuer == names[i].subject)
    };
    let leaf = (0..certs.len()).find(|&i| !issued_another(i)).unwrap_or(0);

    let mut order = vec![leaf];
    let mut current = leaf;
    while !names[current].is_self_issued() {
        let next = (0..certs.len())
            .find(|j| !order.contains(j) && names[*j].subject == names[current].issuer);
        match next {
            Some(j) => {
                order.push(j);
                current = j;
            }
            None => break,
        }
    }
    order.extend((0..certs.len()).filter(|i| !order.contains(i)).collect::<Vec<_>>());

    let mut slots: Vec<Option<CertificateDer<'static>>> = certs.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}
