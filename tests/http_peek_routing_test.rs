// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! HTTP routing integration tests.
//!
//! The plaintext listener reads the request head of each connection: plain
//! HTTP GETs get a JSON status and are closed, WebSocket upgrades proceed.
//!
//! Each test binds to port 0 for isolation.

mod common;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;

use common::*;

async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path);
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    timeout(Duration::from_secs(2), stream.read_to_string(&mut response))
        .await
        .expect("server did not close the connection")
        .unwrap();
    response
}

fn body(response: &str) -> serde_json::Value {
    let (_, body) = response.split_once("\r\n\r\n").unwrap();
    serde_json::from_str(body).unwrap()
}

#[tokio::test]
async fn test_plain_get_returns_status_json() {
    let hub = create_test_hub(None);
    let addr = start_plain(&hub).await;

    let response = http_get(addr, "/").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("Content-Type: application/json"));

    let json = body(&response);
    assert_eq!(json["service"], "deck-relay");
    assert_eq!(json["clientCount"], 0);
    assert_eq!(json["mainAppCount"], 0);
}

#[tokio::test]
async fn test_status_counts_live_connections() {
    let hub = create_test_hub(None);
    let addr = start_plain(&hub).await;

    let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
    recv_json(&mut ws).await;
    send_text(&mut ws, CLAIM_FRAME).await;
    assert!(eventually(|| hub.has_primary()).await);

    let json = body(&http_get(addr, "/status").await);
    assert_eq!(json["clientCount"], 1);
    assert_eq!(json["mainAppCount"], 1);
}

#[tokio::test]
async fn test_http_get_does_not_register_a_connection() {
    let hub = create_test_hub(None);
    let addr = start_plain(&hub).await;

    http_get(addr, "/anything").await;
    assert_eq!(hub.counts().client_count, 0);
    assert_eq!(hub.metrics().connections_total.get(), 0);
}

#[tokio::test]
async fn test_websocket_works_after_http_get() {
    let hub = create_test_hub(None);
    let addr = start_plain(&hub).await;

    http_get(addr, "/").await;

    let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
    assert_eq!(recv_json(&mut ws).await["action"], "CONNECTED");
}

#[tokio::test]
async fn test_garbage_is_rejected_without_registering() {
    let hub = create_test_hub(None);
    let addr = start_plain(&hub).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"HELLO relay\r\n\r\n").await.unwrap();

    assert!(eventually(|| hub.metrics().connection_errors.get() == 1).await);
    assert_eq!(hub.counts().client_count, 0);
}

#[tokio::test]
async fn test_get_split_across_segments_returns_status() {
    let hub = create_test_hub(None);
    let addr = start_plain(&hub).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.set_nodelay(true).unwrap();
    stream.write_all(b"GET /status HT").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    stream
        .write_all(b"TP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    timeout(Duration::from_secs(2), stream.read_to_string(&mut response))
        .await
        .expect("server did not close the connection")
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(body(&response)["service"], "deck-relay");
}

#[tokio::test]
async fn test_upgrade_split_across_segments_is_accepted() {
    let hub = create_test_hub(None);
    let addr = start_plain(&hub).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.set_nodelay(true).unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nUpgrade: web")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    stream
        .write_all(
            b"socket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();

    let mut response = Vec::new();
    let mut chunk = [0u8; 512];
    while !response.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = timeout(Duration::from_secs(2), stream.read(&mut chunk))
            .await
            .expect("no handshake response")
            .unwrap();
        assert!(n > 0, "connection closed during handshake");
        response.extend_from_slice(&chunk[..n]);
    }

    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 101"));
    assert!(eventually(|| hub.counts().client_count == 1).await);
}
