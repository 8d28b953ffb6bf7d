//! TCP listeners and the first-byte dispatcher.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::net::{TcpListener, TcpStream};
use tracing::Instrument as _;

use crate::config::dto::ListenerProtocol;
use crate::config::ListenerConfig;
use crate::{session, EngineState};

/// Binds the configured address and serves connections until the task is
/// dropped.
pub async fn run(conf: ListenerConfig, state: EngineState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&conf.bind)
        .await
        .with_context(|| format!("couldn't bind listener to {}", conf.bind))?;

    info!(bind = %conf.bind, protocol = ?conf.protocol, "Listener started");

    let users = Arc::new(conf.users);

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                error!(%error, "Couldn't accept next TCP stream");
                continue;
            }
        };

        let state = state.clone();
        let users = Arc::clone(&users);
        let protocol = conf.protocol;

        let span = info_span!("session", client = %peer_addr);
        tokio::spawn(
            async move {
                if let Err(error) = handle_connection(stream, peer_addr, protocol, &users, state).await {
                    debug!(error = format!("{error:#}"), "Session failed");
                }
            }
            .instrument(span),
        );
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    protocol: ListenerProtocol,
    users: &[(String, String)],
    state: EngineState,
) -> anyhow::Result<()> {
    trace!(%peer_addr, "Connection accepted");

    match protocol {
        ListenerProtocol::Socks5 => session::serve_socks5(stream, state, users).await,
        ListenerProtocol::Http => session::serve_http(stream, state, users).await,
        ListenerProtocol::Mixed => {
            // SOCKS5 greetings start with the version byte 0x05; anything
            // else on a proxy port is an HTTP request line.
            let mut first = [0u8; 1];
            let peeked = stream.peek(&mut first).await.context("couldn't peek first byte")?;

            if peeked == 1 && first[0] == 0x05 {
                session::serve_socks5(stream, state, users).await
            } else {
                session::serve_http(stream, state, users).await
            }
        }
    }
}
