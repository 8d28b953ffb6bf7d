#![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

use std::net::SocketAddr;

use bytes::BytesMut;
use fluxgate::config::{dto::ListenerProtocol, ListenerConfig};
use fluxgate::{config, listener, EngineState};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};

fn find_unused_ports(count: usize) -> Vec<u16> {
    let sockets: Vec<std::net::TcpListener> = (0..count)
        .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    sockets.iter().map(|socket| socket.local_addr().unwrap().port()).collect()
}

async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

fn engine_with(conf_json: &str, protocol: ListenerProtocol, port: u16) -> tokio::task::JoinHandle<anyhow::Result<()>> {
    let conf = config::load_str(conf_json).unwrap();
    let state = EngineState::new(conf).unwrap();

    let listener_conf = ListenerConfig {
        bind: format!("127.0.0.1:{port}"),
        protocol,
        users: Vec::new(),
    };

    tokio::spawn(listener::run(listener_conf, state))
}

async fn wait_for_listener(port: u16) {
    for _ in 0..50 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("listener on port {port} never came up");
}

#[tokio::test]
async fn socks5_to_direct_round_trip() {
    let echo_addr = spawn_echo_server().await;
    let port = find_unused_ports(1)[0];

    let _engine = engine_with(r#"{ "final": "direct" }"#, ListenerProtocol::Socks5, port);
    wait_for_listener(port).await;

    let proxy = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut stream = proxy_socks::Socks5Stream::connect(proxy, echo_addr).await.unwrap();

    stream.write_all(&[1, 2, 3, 4, 5]).await.unwrap();
    let mut echoed = [0u8; 5];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, [1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn http_connect_to_direct_round_trip() {
    let echo_addr = spawn_echo_server().await;
    let port = find_unused_ports(1)[0];

    let _engine = engine_with(r#"{ "final": "direct" }"#, ListenerProtocol::Http, port);
    wait_for_listener(port).await;

    let proxy = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut stream = proxy_http::ProxyStream::connect(proxy, echo_addr).await.unwrap();

    stream.write_all(b"through the tunnel").await.unwrap();
    let mut echoed = [0u8; 18];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"through the tunnel");
}

#[tokio::test]
async fn mixed_listener_detects_both_protocols() {
    let echo_addr = spawn_echo_server().await;
    let port = find_unused_ports(1)[0];

    let _engine = engine_with(r#"{ "final": "direct" }"#, ListenerProtocol::Mixed, port);
    wait_for_listener(port).await;

    let proxy = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut socks = proxy_socks::Socks5Stream::connect(proxy, echo_addr).await.unwrap();
    socks.write_all(b"abc").await.unwrap();
    let mut echoed = [0u8; 3];
    socks.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"abc");

    let proxy = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut http = proxy_http::ProxyStream::connect(proxy, echo_addr).await.unwrap();
    http.write_all(b"xyz").await.unwrap();
    let mut echoed = [0u8; 3];
    http.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"xyz");
}

#[tokio::test]
async fn rejected_host_gets_a_socks_failure() {
    let port = find_unused_ports(1)[0];

    let conf = r#"{
        "rules": [ { "match": "domain", "value": "blocked.test", "policy": "reject" } ],
        "final": "direct"
    }"#;
    let _engine = engine_with(conf, ListenerProtocol::Socks5, port);
    wait_for_listener(port).await;

    let proxy = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let err = proxy_socks::Socks5Stream::connect(proxy, "blocked.test:80")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not allowed"), "unexpected error: {err}");
}

/// Minimal Shadowsocks upstream: decode the request, echo every payload
/// chunk back encrypted.
async fn spawn_shadowsocks_echo(password: &'static str) -> SocketAddr {
    use proxy_shadowsocks::{CipherKind, Decryptor, Encryptor};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };

            tokio::spawn(async move {
                let mut decryptor = Decryptor::new(CipherKind::Aes128Gcm, password);
                let mut encryptor = Encryptor::raw(CipherKind::Aes128Gcm, password);
                let mut staging = BytesMut::new();
                let mut saw_address = false;
                let mut buf = [0u8; 4096];

                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    staging.extend_from_slice(&buf[..n]);

                    while let Ok(Some(chunk)) = decryptor.decrypt(&mut staging) {
                        if !saw_address {
                            // First frame carries the destination address.
                            saw_address = true;
                            continue;
                        }

                        let mut reply = BytesMut::new();
                        encryptor.encrypt(&chunk, &mut reply);
                        if stream.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });

    addr
}

#[tokio::test]
async fn socks5_chained_through_shadowsocks_upstream() {
    let ss_addr = spawn_shadowsocks_echo("BeMWIH2K5YtZ").await;
    let port = find_unused_ports(1)[0];

    let conf = format!(
        r#"{{
            "proxies": {{
                "ss": {{ "kind": "shadowsocks", "server": "127.0.0.1", "port": {},
                         "algorithm": "aes-128-gcm", "password": "BeMWIH2K5YtZ" }}
            }},
            "rules": [ {{ "match": "domain-suffix", "value": "tunneled.test", "policy": "ss" }} ],
            "final": "reject"
        }}"#,
        ss_addr.port()
    );
    let _engine = engine_with(&conf, ListenerProtocol::Socks5, port);
    wait_for_listener(port).await;

    let proxy = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut stream = proxy_socks::Socks5Stream::connect(proxy, "echo.tunneled.test:7777")
        .await
        .unwrap();

    stream.write_all(b"encrypted end to end").await.unwrap();
    let mut echoed = [0u8; 20];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"encrypted end to end");
}
