//! TLS plumbing: shared client connectors (built once per process, as
//! rustls recommends) and the server-side configuration used when a
//! connection is intercepted.

use std::io;
use std::sync::{Arc, LazyLock};

use anyhow::Context as _;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{self, pki_types};

// rustls doc says:
//
// > Making one of these can be expensive, and should be once per process rather than once per connection.
//
// We reuse the same TLS client config for every outbound TLS connection.
// (TlsConnector is just a wrapper around the config providing the `connect` method.)
static DANGEROUS_TLS_CONNECTOR: LazyLock<tokio_rustls::TlsConnector> = LazyLock::new(|| {
    let config = rustls::client::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification))
        .with_no_client_auth();

    tokio_rustls::TlsConnector::from(Arc::new(config))
});

static SAFE_TLS_CONNECTOR: LazyLock<tokio_rustls::TlsConnector> = LazyLock::new(|| {
    let mut root_store = rustls::RootCertStore::empty();

    let result = rustls_native_certs::load_native_certs();

    for error in result.errors {
        warn!(error = %error, "Error when loading native certificate");
    }

    let mut added_count = 0;

    for cert in result.certs {
        if root_store.add(cert).is_ok() {
            added_count += 1;
        }
    }

    if added_count == 0 {
        warn!("No valid certificates found in platform native certificate store");
    } else {
        debug!(count = added_count, "Loaded native certificates");
    }

    let config = rustls::client::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    tokio_rustls::TlsConnector::from(Arc::new(config))
});

pub fn install_default_crypto_provider() {
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        let installed_provider = rustls::crypto::CryptoProvider::get_default();
        debug!(?installed_provider, "default crypto provider is already installed");
    }
}

/// Opens a TLS session over `stream` for `dns_name`. With `skip_verify`
/// the peer certificate is accepted unconditionally.
pub async fn connect<IO>(dns_name: String, skip_verify: bool, stream: IO) -> io::Result<TlsStream<IO>>
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt as _;

    let dns_name = pki_types::ServerName::try_from(dns_name).map_err(io::Error::other)?;

    let connector = if skip_verify {
        &*DANGEROUS_TLS_CONNECTOR
    } else {
        &*SAFE_TLS_CONNECTOR
    };

    let mut tls_stream = connector.connect(dns_name, stream).await?;

    // > To keep it simple and correct, [TlsStream] will behave like `BufWriter`.
    // > For `TlsStream<TcpStream>`, this means that data written by `poll_write`
    // > is not guaranteed to be written to `TcpStream`.
    // > You must call `poll_flush` to ensure that it is written to `TcpStream`.
    //
    // source: https://docs.rs/tokio-rustls/latest/tokio_rustls/#why-do-i-need-to-call-poll_flush
    tls_stream.flush().await?;

    Ok(tls_stream)
}

/// Server configuration for an interception leaf issued by
/// [`proxy_mitm::CertificateStore`].
pub fn build_server_config(leaf: &proxy_mitm::LeafEntry) -> anyhow::Result<rustls::ServerConfig> {
    let certificates: Vec<pki_types::CertificateDer<'static>> = leaf
        .chain_der
        .iter()
        .map(|der| pki_types::CertificateDer::from(der.clone()))
        .collect();

    let private_key = pki_types::PrivateKeyDer::Pkcs8(pki_types::PrivatePkcs8KeyDer::from(leaf.key_pkcs8_der.clone()));

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)
        .context("failed to set server config cert")
}

pub mod danger {
    use tokio_rustls::rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use tokio_rustls::rustls::{pki_types, DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub struct NoCertificateVerification;

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _: &pki_types::CertificateDer<'_>,
            _: &[pki_types::CertificateDer<'_>],
            _: &pki_types::ServerName<'_>,
            _: &[u8],
            _: pki_types::UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _: &[u8],
            _: &pki_types::CertificateDer<'_>,
            _: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _: &[u8],
            _: &pki_types::CertificateDer<'_>,
            _: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA1,
                SignatureScheme::ECDSA_SHA1_Legacy,
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
                SignatureScheme::ED448,
            ]
        }
    }
}
