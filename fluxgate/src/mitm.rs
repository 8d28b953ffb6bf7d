//! TLS interception: terminate the client's TLS session with a leaf
//! issued for the requested hostname, open a verified TLS session to the
//! real server (routed through the usual policy machinery), and relay
//! the decrypted HTTP stream between the two.

use std::sync::Arc;

use anyhow::Context as _;
use proxy_http::HttpsTunnelRequest;
use proxy_types::DestAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;

use crate::router::{Policy, RequestTarget};
use crate::session::forward;
use crate::{outbound, tls, EngineState};

pub async fn intercept<S>(
    request: HttpsTunnelRequest<S>,
    host: String,
    dest: DestAddr,
    state: EngineState,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let store = state.cert_store.as_ref().context("interception without a CA store")?;

    let leaf = store
        .certificate_for(&host)
        .context("leaf issuance")?
        .context("hostname no longer matches an interception pattern")?;

    let server_config = tls::build_server_config(&leaf)?;

    info!(%host, "Intercepting TLS tunnel");

    // The client believes the tunnel is up, then immediately starts TLS
    // with us instead of the origin.
    let inbound = request.success().await.context("CONNECT reply")?;
    let acceptor = TlsAcceptor::from(Arc::new(server_config));
    let tls_inbound = acceptor.accept(inbound).await.context("client-side TLS handshake")?;

    // Reach the origin through whatever the rules say, then speak real
    // TLS to it so the re-encrypted stream is verified end to end.
    let fingerprint = RequestTarget {
        dest: dest.clone(),
        sni: Some(host.clone()),
    };

    match state.router.route(&fingerprint) {
        Policy::Reject => {
            debug!(%dest, "Rejected by policy");
            Ok(())
        }
        Policy::Direct => {
            let upstream = outbound::connect_direct(&dest).await.context("direct connect")?;
            let tls_upstream = tls::connect(host, false, upstream)
                .await
                .context("origin TLS handshake")?;
            forward(tls_inbound, tls_upstream, &dest).await
        }
        Policy::Proxy(proxy) => {
            let upstream = outbound::connect_via(&proxy, &dest).await.context("upstream connect")?;
            let tls_upstream = tls::connect(host, false, upstream)
                .await
                .context("origin TLS handshake")?;
            forward(tls_inbound, tls_upstream, &dest).await
        }
    }
}
