//! Per-connection pipeline: inbound handshake, routing, outbound
//! connect, then bidirectional forwarding.

use anyhow::Context as _;
use proxy_http::{ErrorCode, HttpAcceptorConfig, HttpProxyAcceptor};
use proxy_socks::{Socks5Acceptor, Socks5AcceptorConfig, Socks5FailureCode};
use proxy_types::DestAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::config::ProxyKind;
use crate::outbound;
use crate::router::{Policy, RequestTarget};
use crate::{mitm, EngineState};

/// Serves one SOCKS5 client connection.
pub async fn serve_socks5(stream: TcpStream, state: EngineState, users: &[(String, String)]) -> anyhow::Result<()> {
    let conf = Socks5AcceptorConfig {
        no_auth_required: users.is_empty(),
        users: (!users.is_empty()).then(|| users.to_vec()),
    };

    let acceptor = Socks5Acceptor::accept_with_config(stream, &conf)
        .await
        .context("SOCKS5 handshake")?;

    if !acceptor.is_connect_command() {
        acceptor.failed(Socks5FailureCode::CommandNotSupported).await?;
        anyhow::bail!("unsupported SOCKS5 command");
    }

    let dest = acceptor.dest_addr().clone();

    match state.router.route(&RequestTarget::new(dest.clone())) {
        Policy::Reject => {
            debug!(%dest, "Rejected by policy");
            acceptor
                .failed(Socks5FailureCode::ConnectionNotAllowedByRuleset)
                .await?;
            Ok(())
        }
        Policy::Direct => {
            let upstream = match outbound::connect_direct(&dest).await {
                Ok(upstream) => upstream,
                Err(e) => {
                    acceptor.failed(failure_code(&e)).await?;
                    return Err(e.context("direct connect"));
                }
            };

            let bound = upstream
                .local_addr()
                .map(DestAddr::Ip)
                .unwrap_or_else(|_| DestAddr::Ip("0.0.0.0:0".parse().expect("valid literal")));
            let inbound = acceptor.connected(bound).await?;

            forward(inbound, upstream, &dest).await
        }
        Policy::Proxy(proxy) => {
            debug!(%dest, proxy = %proxy.name, "Tunneling through upstream proxy");

            let upstream = match outbound::connect_via(&proxy, &dest).await {
                Ok(upstream) => upstream,
                Err(e) => {
                    acceptor.failed(failure_code(&e)).await?;
                    return Err(e.context("upstream connect"));
                }
            };

            // The true bound address lives on the far side of the tunnel.
            let inbound = acceptor.connected("0.0.0.0:0").await?;

            forward(inbound, upstream, &dest).await
        }
    }
}

/// Serves one HTTP proxy client connection (CONNECT or absolute-form).
pub async fn serve_http(stream: TcpStream, state: EngineState, users: &[(String, String)]) -> anyhow::Result<()> {
    let conf = HttpAcceptorConfig {
        users: (!users.is_empty()).then(|| users.to_vec()),
    };

    let acceptor = HttpProxyAcceptor::accept_with_config(stream, &conf)
        .await
        .context("HTTP handshake")?;

    match acceptor {
        HttpProxyAcceptor::TunnelRequest(request) => {
            let dest = request.dest_addr().clone();

            // TLS interception takes over the tunnel when the hostname is
            // on the list.
            if let (Some(store), DestAddr::Domain(host, _)) = (&state.cert_store, &dest) {
                if store.should_intercept(host) {
                    let host = host.clone();
                    return mitm::intercept(request, host, dest.clone(), state).await;
                }
            }

            match state.router.route(&RequestTarget::new(dest.clone())) {
                Policy::Reject => {
                    debug!(%dest, "Rejected by policy");
                    request.failure(ErrorCode::Forbidden).await?;
                    Ok(())
                }
                Policy::Direct => {
                    let upstream = match outbound::connect_direct(&dest).await {
                        Ok(upstream) => upstream,
                        Err(e) => {
                            request.failure(ErrorCode::BadGateway).await?;
                            return Err(e.context("direct connect"));
                        }
                    };
                    let inbound = request.success().await?;
                    forward(inbound, upstream, &dest).await
                }
                Policy::Proxy(proxy) => {
                    let upstream = match outbound::connect_via(&proxy, &dest).await {
                        Ok(upstream) => upstream,
                        Err(e) => {
                            request.failure(ErrorCode::BadGateway).await?;
                            return Err(e.context("upstream connect"));
                        }
                    };
                    let inbound = request.success().await?;
                    forward(inbound, upstream, &dest).await
                }
            }
        }

        HttpProxyAcceptor::RegularRequest(request) => {
            let dest = request.dest_addr().clone();

            match state.router.route(&RequestTarget::new(dest.clone())) {
                Policy::Reject => {
                    debug!(%dest, "Rejected by policy");
                    request.failure(ErrorCode::Forbidden).await?;
                    Ok(())
                }
                Policy::Direct => {
                    // Forward to the origin with the request line rewritten
                    // to origin-form.
                    let upstream = match outbound::connect_direct(&dest).await {
                        Ok(upstream) => upstream,
                        Err(e) => {
                            request.failure(ErrorCode::BadGateway).await?;
                            return Err(e.context("direct connect"));
                        }
                    };
                    let inbound = request.success_with_rewrite()?;
                    forward(inbound, upstream, &dest).await
                }
                Policy::Proxy(proxy) => {
                    // An HTTP upstream can relay the absolute-form request
                    // as-is, unless the profile insists on tunneling.
                    let absolute_form_passthrough =
                        matches!(&proxy.kind, ProxyKind::Http { prefer_http_tunneling, .. } if !prefer_http_tunneling);

                    if absolute_form_passthrough {
                        let upstream = match outbound::connect_http_forward(&proxy).await {
                            Ok(upstream) => upstream,
                            Err(e) => {
                                request.failure(ErrorCode::BadGateway).await?;
                                return Err(e.context("upstream connect"));
                            }
                        };
                        let inbound = request.success_without_rewrite();
                        forward(inbound, upstream, &dest).await
                    } else {
                        let upstream = match outbound::connect_via(&proxy, &dest).await {
                            Ok(upstream) => upstream,
                            Err(e) => {
                                request.failure(ErrorCode::BadGateway).await?;
                                return Err(e.context("upstream connect"));
                            }
                        };
                        let inbound = request.success_with_rewrite()?;
                        forward(inbound, upstream, &dest).await
                    }
                }
            }
        }
    }
}

/// Relays both directions until EOF, logging the byte counts.
pub(crate) async fn forward<A, B>(mut inbound: A, mut upstream: B, dest: &DestAddr) -> anyhow::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let result = transport::relay(&mut inbound, &mut upstream)
        .await
        .with_context(|| format!("relay with {dest}"))?;

    info!(
        %dest,
        sent = result.a_to_b,
        received = result.b_to_a,
        "Session ended"
    );

    Ok(())
}

/// Maps an outbound connect error to the closest SOCKS5 reply code.
fn failure_code(error: &anyhow::Error) -> Socks5FailureCode {
    match error.downcast_ref::<std::io::Error>() {
        Some(io_error) => Socks5FailureCode::from(io_error.kind()),
        None => Socks5FailureCode::GeneralSocksServerFailure,
    }
}
