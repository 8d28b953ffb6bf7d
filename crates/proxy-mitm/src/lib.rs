//! Certificate store for TLS interception.
//!
//! The store consumes a user-supplied CA (a base64 PKCS#12 bundle) and
//! issues per-hostname-pattern leaf certificates on demand, caching them
//! under the pattern that matched. Patterns are exact hostnames or
//! `*.suffix` wildcards. A single internal lock serialises all access.

mod pfx;

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::RngCore as _;
use rcgen::{CertificateParams, DnType, KeyPair, SerialNumber};
use rustls_pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use tracing::debug;

const LEAF_VALIDITY_DAYS: i64 = 30;
const LEAF_RSA_BITS: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid base64 CA bundle: {0}")]
    BadBundleEncoding(#[from] base64::DecodeError),
    #[error("failed to parse CA bundle: {0}")]
    BadBundle(String),
    #[error("CA bundle holds no usable certificate/key pair")]
    IncompleteBundle,
    #[error("CA private key is unusable for signing: {0}")]
    BadCaKey(String),
    #[error("failed to issue leaf certificate: {0}")]
    Issuance(String),
}

/// An issued leaf: DER chain (leaf first, CA appended) plus the leaf's
/// PKCS#8 private key, ready to feed a TLS server configuration.
#[derive(Clone)]
pub struct LeafEntry {
    pub chain_der: Vec<Vec<u8>>,
    pub key_pkcs8_der: Vec<u8>,
}

/// Hostname pattern: exact, or `*.suffix` matching every strict subdomain.
fn pattern_matches(pattern: &str, host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();

    match pattern.strip_prefix("*.") {
        Some(suffix) => host
            .strip_suffix(suffix)
            .is_some_and(|prefix| prefix.ends_with('.') && prefix.len() > 1),
        None => pattern == host,
    }
}

pub struct CertificateStore {
    inner: Mutex<Inner>,
}

struct Inner {
    ca_cert_der: Vec<u8>,
    /// Issuer half reconstructed from the CA certificate, kept around so
    /// every leaf signature reuses it.
    ca_issuer: rcgen::Certificate,
    ca_key: KeyPair,
    patterns: Vec<String>,
    entries: HashMap<String, LeafEntry>,
}

impl CertificateStore {
    /// Parses a base64 PKCS#12 bundle (as carried in configuration files)
    /// and prepares the store. The bundle is read once; hostname patterns
    /// start empty.
    pub fn from_pkcs12(base64_p12: &str, passphrase: &str) -> Result<Self, Error> {
        use base64::Engine as _;

        let der = base64::engine::general_purpose::STANDARD.decode(base64_p12.trim())?;
        let (ca_cert_der, ca_key_pkcs8) = pfx::extract_ca(&der, passphrase)?;
        Self::from_ca_der(ca_cert_der, ca_key_pkcs8)
    }

    /// Builds the store from an already-extracted CA certificate (DER) and
    /// private key (PKCS#8 DER).
    pub fn from_ca_der(ca_cert_der: Vec<u8>, ca_key_pkcs8: Vec<u8>) -> Result<Self, Error> {
        let ca_key = load_signing_key(&ca_key_pkcs8)?;

        let ca_der_typed = CertificateDer::from(ca_cert_der.clone());
        let ca_params = CertificateParams::from_ca_cert_der(&ca_der_typed)
            .map_err(|e| Error::BadBundle(e.to_string()))?;
        let ca_issuer = ca_params
            .self_signed(&ca_key)
            .map_err(|e| Error::BadCaKey(e.to_string()))?;

        Ok(Self {
            inner: Mutex::new(Inner {
                ca_cert_der,
                ca_issuer,
                ca_key,
                patterns: Vec::new(),
                entries: HashMap::new(),
            }),
        })
    }

    /// Replaces the intercepted hostname patterns. Cached leaves whose
    /// pattern is gone are dropped.
    pub fn set_hostnames<I, P>(&self, patterns: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();

        let mut inner = self.inner.lock();
        inner.entries.retain(|pattern, _| patterns.iter().any(|p| p == pattern));
        inner.patterns = patterns;
    }

    /// Whether traffic for `host` should be intercepted.
    pub fn should_intercept(&self, host: &str) -> bool {
        let inner = self.inner.lock();
        inner.patterns.iter().any(|pattern| pattern_matches(pattern, host))
    }

    /// Returns the leaf for `host`, issuing and caching one the first time
    /// its pattern is hit. `None` when no pattern matches.
    pub fn certificate_for(&self, host: &str) -> Result<Option<LeafEntry>, Error> {
        let mut inner = self.inner.lock();

        let Some(pattern) = inner
            .patterns
            .iter()
            .find(|pattern| pattern_matches(pattern, host))
            .cloned()
        else {
            return Ok(None);
        };

        if let Some(entry) = inner.entries.get(&pattern) {
            return Ok(Some(entry.clone()));
        }

        debug!(%pattern, %host, "Issuing interception certificate");
        let entry = inner.issue(&pattern)?;
        inner.entries.insert(pattern, entry.clone());
        Ok(Some(entry))
    }

    /// Number of cached leaf certificates.
    pub fn cached_leaves(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

impl Inner {
    fn issue(&self, pattern: &str) -> Result<LeafEntry, Error> {
        let mut params =
            CertificateParams::new(vec![pattern.to_owned()]).map_err(|e| Error::Issuance(e.to_string()))?;

        params.distinguished_name.push(DnType::CommonName, pattern);

        let mut serial = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut serial);
        serial[0] &= 0x7F; // keep the INTEGER positive
        params.serial_number = Some(SerialNumber::from_slice(&serial));

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);

        let leaf_key_pkcs8 = generate_rsa_pkcs8()?;
        let leaf_key = KeyPair::from_pkcs8_der_and_sign_algo(
            &PrivatePkcs8KeyDer::from(leaf_key_pkcs8.as_slice()),
            &rcgen::PKCS_RSA_SHA256,
        )
        .map_err(|e| Error::Issuance(e.to_string()))?;

        let leaf = params
            .signed_by(&leaf_key, &self.ca_issuer, &self.ca_key)
            .map_err(|e| Error::Issuance(e.to_string()))?;

        Ok(LeafEntry {
            chain_der: vec![leaf.der().to_vec(), self.ca_cert_der.clone()],
            key_pkcs8_der: leaf_key_pkcs8,
        })
    }
}

/// Loads the CA signing key, preferring SHA-256 RSA (the signature type
/// interception certificates advertise), falling back to whatever the key
/// actually is (for EC test authorities).
fn load_signing_key(pkcs8_der: &[u8]) -> Result<KeyPair, Error> {
    let typed = PrivatePkcs8KeyDer::from(pkcs8_der);

    KeyPair::from_pkcs8_der_and_sign_algo(&typed, &rcgen::PKCS_RSA_SHA256)
        .or_else(|_| KeyPair::try_from(pkcs8_der))
        .map_err(|e| Error::BadCaKey(e.to_string()))
}

/// Fresh RSA-2048 leaf key as PKCS#8 DER.
fn generate_rsa_pkcs8() -> Result<Vec<u8>, Error> {
    let key = picky::key::PrivateKey::generate_rsa(LEAF_RSA_BITS).map_err(|e| Error::Issuance(e.to_string()))?;
    key.to_pkcs8().map_err(|e| Error::Issuance(e.to_string()))
}
