//! Outbound connectors: open a TCP connection to the upstream named by
//! the policy, layer TLS when the profile says so, then install the
//! protocol client for the requested destination.

use anyhow::Context as _;
use proxy_types::DestAddr;
use tokio::net::TcpStream;
use transport::ErasedReadWrite;

use crate::config::{ProxyConfig, ProxyKind, TlsOptions, VmessTransport};
use crate::tls;

/// Opens a plain TCP connection straight to the destination.
pub async fn connect_direct(dest: &DestAddr) -> anyhow::Result<TcpStream> {
    let stream = match dest {
        DestAddr::Ip(addr) => TcpStream::connect(addr).await,
        DestAddr::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
    }
    .with_context(|| format!("couldn't connect to {dest}"))?;

    Ok(stream)
}

/// Opens a tunnel to `dest` through the configured upstream proxy and
/// returns a stream ready to carry application bytes.
pub async fn connect_via(proxy: &ProxyConfig, dest: &DestAddr) -> anyhow::Result<ErasedReadWrite> {
    let server = TcpStream::connect((proxy.server.as_str(), proxy.port))
        .await
        .with_context(|| format!("couldn't connect to upstream {}:{}", proxy.server, proxy.port))?;

    let stream: ErasedReadWrite = match &proxy.kind {
        ProxyKind::Http {
            username,
            password,
            over_tls,
            tls: tls_options,
            ..
        } => {
            let credentials = username.as_ref().zip(password.as_ref());

            if *over_tls {
                let server = layer_tls(server, &proxy.server, tls_options).await?;
                let stream = match credentials {
                    Some((username, password)) => {
                        proxy_http::ProxyStream::connect_with_password(server, dest, username, password).await
                    }
                    None => proxy_http::ProxyStream::connect(server, dest).await,
                }
                .context("HTTP CONNECT handshake")?;
                Box::new(stream)
            } else {
                let stream = match credentials {
                    Some((username, password)) => {
                        proxy_http::ProxyStream::connect_with_password(server, dest, username, password).await
                    }
                    None => proxy_http::ProxyStream::connect(server, dest).await,
                }
                .context("HTTP CONNECT handshake")?;
                Box::new(stream)
            }
        }

        ProxyKind::Socks5 {
            username,
            password,
            over_tls,
            tls: tls_options,
        } => {
            let credentials = username.as_ref().zip(password.as_ref());

            if *over_tls {
                let server = layer_tls(server, &proxy.server, tls_options).await?;
                let stream = match credentials {
                    Some((username, password)) => {
                        proxy_socks::Socks5Stream::connect_with_password(server, dest, username, password).await
                    }
                    None => proxy_socks::Socks5Stream::connect(server, dest).await,
                }
                .context("SOCKS5 handshake")?;
                Box::new(stream)
            } else {
                let stream = match credentials {
                    Some((username, password)) => {
                        proxy_socks::Socks5Stream::connect_with_password(server, dest, username, password).await
                    }
                    None => proxy_socks::Socks5Stream::connect(server, dest).await,
                }
                .context("SOCKS5 handshake")?;
                Box::new(stream)
            }
        }

        ProxyKind::Shadowsocks { algorithm, password } => {
            let stream = proxy_shadowsocks::ShadowsocksStream::client(server, *algorithm, password, dest)
                .context("Shadowsocks session setup")?;
            Box::new(stream)
        }

        ProxyKind::Vmess {
            user_id,
            security,
            transport,
            tls: tls_options,
        } => {
            if let VmessTransport::Ws { .. } = transport {
                anyhow::bail!("websocket transport is not supported for VMESS upstreams");
            }

            let options = proxy_vmess::Options::default();

            match tls_options {
                Some(tls_options) => {
                    let server = layer_tls(server, &proxy.server, tls_options).await?;
                    let stream = proxy_vmess::VmessStream::client(server, user_id, dest, *security, options)
                        .context("VMESS session setup")?;
                    Box::new(stream)
                }
                None => {
                    let stream = proxy_vmess::VmessStream::client(server, user_id, dest, *security, options)
                        .context("VMESS session setup")?;
                    Box::new(stream)
                }
            }
        }

        ProxyKind::Trojan { password, tls: tls_options } => {
            // Trojan is always carried over TLS.
            let server = layer_tls(server, &proxy.server, tls_options).await?;
            let stream =
                proxy_trojan::TrojanStream::client(server, password, dest).context("Trojan session setup")?;
            Box::new(stream)
        }
    };

    Ok(stream)
}

/// Opens a raw connection to an HTTP upstream proxy without issuing a
/// CONNECT: used to relay absolute-form requests as-is.
pub async fn connect_http_forward(proxy: &ProxyConfig) -> anyhow::Result<ErasedReadWrite> {
    let ProxyKind::Http {
        over_tls,
        tls: tls_options,
        ..
    } = &proxy.kind
    else {
        anyhow::bail!("absolute-form forwarding requires an HTTP upstream");
    };

    let server = TcpStream::connect((proxy.server.as_str(), proxy.port))
        .await
        .with_context(|| format!("couldn't connect to upstream {}:{}", proxy.server, proxy.port))?;

    if *over_tls {
        let server = layer_tls(server, &proxy.server, tls_options).await?;
        Ok(Box::new(server))
    } else {
        Ok(Box::new(server))
    }
}

async fn layer_tls(
    stream: TcpStream,
    server_host: &str,
    options: &TlsOptions,
) -> anyhow::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let sni = options.sni.clone().unwrap_or_else(|| server_host.to_owned());
    tls::connect(sni, options.skip_cert_verify, stream)
        .await
        .context("TLS handshake with upstream")
}
