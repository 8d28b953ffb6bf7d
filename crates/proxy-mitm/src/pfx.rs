//! PKCS#12 CA bundle parsing.
//!
//! A bundle may carry a whole chain next to the signing key. The store
//! needs exactly one (certificate, key) pair: the CA that will sign
//! interception leaves.

use picky::key::PrivateKey;
use picky::pkcs12::{
    Pfx, Pkcs12AttributeKind, Pkcs12CryptoContext, Pkcs12ParsingParams, SafeBag, SafeBagKind, SafeContentsKind,
};
use picky::x509::certificate::CertType;
use picky::x509::Cert;

use crate::Error;

/// Pulls the CA certificate (DER) and its private key (PKCS#8 DER) out of
/// a PKCS#12 bundle.
pub(crate) fn extract_ca(pfx_der: &[u8], passphrase: &str) -> Result<(Vec<u8>, Vec<u8>), Error> {
    let crypto_context = if passphrase.is_empty() {
        Pkcs12CryptoContext::new_without_password()
    } else {
        Pkcs12CryptoContext::new_with_password(passphrase)
    }
    .map_err(|e| Error::BadBundle(e.to_string()))?;

    let pfx = Pfx::from_der(pfx_der, &crypto_context, &Pkcs12ParsingParams::default())
        .map_err(|e| Error::BadBundle(e.to_string()))?;

    let mut certs: Vec<(&Cert, CertType, Option<&[u8]>)> = Vec::new();
    let mut keys: Vec<(&PrivateKey, Option<&[u8]>)> = Vec::new();

    for contents in pfx.safe_contents() {
        match contents.kind() {
            SafeContentsKind::SafeBags(bags) | SafeContentsKind::EncryptedSafeBags { safe_bags: bags, .. } => {
                collect_bags(bags, &mut certs, &mut keys);
            }
            SafeContentsKind::Unknown => {}
        }
    }

    let (cert, key) = select_signing_pair(&certs, &keys)?;

    let cert_der = cert.to_der().map_err(|e| Error::BadBundle(e.to_string()))?;
    let key_pkcs8 = key.to_pkcs8().map_err(|e| Error::BadBundle(e.to_string()))?;

    Ok((cert_der, key_pkcs8))
}

/// Walks one level of safe bags, recursing into nested ones.
fn collect_bags<'a>(
    bags: &'a [SafeBag],
    certs: &mut Vec<(&'a Cert, CertType, Option<&'a [u8]>)>,
    keys: &mut Vec<(&'a PrivateKey, Option<&'a [u8]>)>,
) {
    for bag in bags {
        match bag.kind() {
            SafeBagKind::Nested(inner) => collect_bags(inner, certs, keys),
            SafeBagKind::Certificate(cert) => certs.push((cert, cert.ty(), local_key_id(bag))),
            SafeBagKind::PrivateKey(key) | SafeBagKind::EncryptedPrivateKey { key, .. } => {
                keys.push((key, local_key_id(bag)));
            }
            _ => {}
        }
    }
}

/// The local-key-id attribute ties a certificate bag to its key bag.
fn local_key_id(bag: &SafeBag) -> Option<&[u8]> {
    bag.attributes().iter().find_map(|attr| match attr.kind() {
        Pkcs12AttributeKind::LocalKeyId(id) => Some(id.as_slice()),
        _ => None,
    })
}

/// Authority-likeness order used when the bundle carries no local key
/// ids. The store needs the certificate the private key belongs to — the
/// *issuing* CA — so an intermediate beats the root, and a leaf is the
/// last resort.
fn authority_rank(ty: CertType) -> u8 {
    match ty {
        CertType::Intermediate => 0,
        CertType::Root => 1,
        CertType::Unknown => 2,
        CertType::Leaf => 3,
    }
}

fn select_signing_pair<'a>(
    certs: &[(&'a Cert, CertType, Option<&'a [u8]>)],
    keys: &[(&'a PrivateKey, Option<&'a [u8]>)],
) -> Result<(&'a Cert, &'a PrivateKey), Error> {
    // A matching local key id is the association the bundle itself
    // encodes; trust it first. Several matches (unusual) resolve towards
    // the most authority-like certificate.
    let mut paired: Option<(&Cert, &PrivateKey, u8)> = None;

    for (key, key_id) in keys {
        let Some(key_id) = key_id else { continue };

        for (cert, ty, cert_id) in certs {
            if *cert_id != Some(*key_id) {
                continue;
            }

            let rank = authority_rank(*ty);
            if paired.is_none_or(|(_, _, best)| rank < best) {
                paired = Some((*cert, *key, rank));
            }
        }
    }

    if let Some((cert, key, _)) = paired {
        return Ok((cert, key));
    }

    // No ids to go by: fall back to the certificate most likely to be the
    // signing CA, and the first key.
    let cert = certs
        .iter()
        .min_by_key(|(_, ty, _)| authority_rank(*ty))
        .map(|(cert, _, _)| *cert)
        .ok_or(Error::IncompleteBundle)?;
    let key = keys.first().map(|(key, _)| *key).ok_or(Error::IncompleteBundle)?;

    Ok((cert, key))
}
