#![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use transport::{forward, relay};

#[tokio::test]
async fn forward_copies_and_half_closes() {
    let (client, mut remote) = tokio::io::duplex(64);
    let (reader, writer) = tokio::io::split(client);

    let task = tokio::spawn(async move { forward(reader, writer).await });

    remote.write_all(b"sixteen byte msg").await.unwrap();
    remote.shutdown().await.unwrap();

    // Everything written comes back, then EOF (the writer was shut down).
    let mut echoed = Vec::new();
    remote.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"sixteen byte msg");

    let transferred = task.await.unwrap().unwrap();
    assert_eq!(transferred, 16);
}

#[tokio::test]
async fn relay_moves_bytes_both_ways() {
    let (inbound_local, mut inbound_peer) = tokio::io::duplex(64);
    let (outbound_local, mut outbound_peer) = tokio::io::duplex(64);

    let relay_task = tokio::spawn(async move {
        let mut a = inbound_local;
        let mut b = outbound_local;
        relay(&mut a, &mut b).await
    });

    inbound_peer.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    outbound_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    outbound_peer.write_all(b"pong!").await.unwrap();
    let mut buf = [0u8; 5];
    inbound_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong!");

    inbound_peer.shutdown().await.unwrap();
    outbound_peer.shutdown().await.unwrap();

    let result = relay_task.await.unwrap().unwrap();
    assert_eq!(result.a_to_b, 4);
    assert_eq!(result.b_to_a, 5);
}

#[tokio::test]
async fn relay_half_close_leaves_other_direction_open() {
    let (inbound_local, mut inbound_peer) = tokio::io::duplex(64);
    let (outbound_local, mut outbound_peer) = tokio::io::duplex(64);

    let relay_task = tokio::spawn(async move {
        let mut a = inbound_local;
        let mut b = outbound_local;
        relay(&mut a, &mut b).await
    });

    // Close the inbound sending side immediately; the outbound peer must
    // observe EOF while still being able to answer.
    inbound_peer.shutdown().await.unwrap();

    let mut sink = Vec::new();
    outbound_peer.read_to_end(&mut sink).await.unwrap();
    assert!(sink.is_empty());

    outbound_peer.write_all(b"late reply").await.unwrap();
    outbound_peer.shutdown().await.unwrap();

    let mut reply = Vec::new();
    inbound_peer.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"late reply");

    let result = relay_task.await.unwrap().unwrap();
    assert_eq!(result.a_to_b, 0);
    assert_eq!(result.b_to_a, 10);
}

#[tokio::test]
async fn large_transfer_with_backpressure() {
    // Small duplex buffers force the copy loop through its backpressure
    // path many times.
    let (inbound_local, mut inbound_peer) = tokio::io::duplex(128);
    let (outbound_local, mut outbound_peer) = tokio::io::duplex(128);

    let relay_task = tokio::spawn(async move {
        let mut a = inbound_local;
        let mut b = outbound_local;
        relay(&mut a, &mut b).await
    });

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let writer = tokio::spawn(async move {
        inbound_peer.write_all(&payload).await.unwrap();
        inbound_peer.shutdown().await.unwrap();
        inbound_peer
    });

    let mut received = Vec::new();
    outbound_peer.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, expected);

    outbound_peer.shutdown().await.unwrap();
    let _ = writer.await.unwrap();

    let result = relay_task.await.unwrap().unwrap();
    assert_eq!(result.a_to_b, 100_000);
}
