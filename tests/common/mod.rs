// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Common test utilities for relay integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use deck_relay::broadcast::RetryPolicy;
use deck_relay::certificate::CertificateManager;
use deck_relay::hub::RelayHub;
use deck_relay::listener::{self, ListenerDeps};
use deck_relay::metrics::RelayMetrics;
use deck_relay::settings_store::MemorySettingsStore;

/// Classification frame sent by the companion application.
#[allow(dead_code)]
pub const CLAIM_FRAME: &str = r#"{"topic":"TWITCHAT_PRIMARY_INSTANCE"}"#;

/// Creates a hub backed by an in-memory settings store.
#[allow(dead_code)]
pub fn create_test_hub(shared_secret: Option<&str>) -> Arc<RelayHub> {
    Arc::new(RelayHub::new(
        Arc::new(MemorySettingsStore::new()),
        RetryPolicy {
            max_attempts: 10,
            interval: Duration::from_millis(100),
        },
        shared_secret.map(str::to_string),
        RelayMetrics::new(),
    ))
}

#[allow(dead_code)]
pub fn listener_deps(hub: &Arc<RelayHub>) -> ListenerDeps {
    ListenerDeps {
        hub: hub.clone(),
        max_message_size: 64 * 1024,
        handshake_timeout: Duration::from_secs(5),
    }
}

/// Starts the plaintext listener on an ephemeral port.
#[allow(dead_code)]
pub async fn start_plain(hub: &Arc<RelayHub>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(listener::serve_plain(listener, listener_deps(hub)));
    addr
}

/// Starts the TLS listener on an ephemeral port.
#[allow(dead_code)]
pub async fn start_secure(hub: &Arc<RelayHub>, certs: &Arc<CertificateManager>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(listener::serve_secure(listener, listener_deps(hub), certs.clone()));
    addr
}

/// Receives the next text frame as JSON, failing after two seconds.
#[allow(dead_code)]
pub async fn recv_json<S>(ws: &mut WebSocketStream<S>) -> Value
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .expect("transport error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Collects the `action` of every frame received within `window`.
#[allow(dead_code)]
pub async fn collect_actions<S>(ws: &mut WebSocketStream<S>, window: Duration) -> Vec<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut actions = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(Ok(msg))) = tokio::time::timeout_at(deadline, ws.next()).await {
        if let Message::Text(text) = msg {
            let value: Value = serde_json::from_str(&text).unwrap();
            actions.push(value["action"].as_str().unwrap_or_default().to_string());
        }
    }
    actions
}

#[allow(dead_code)]
pub async fn send_text<S>(ws: &mut WebSocketStream<S>, text: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ws.send(Message::Text(text.to_string())).await.unwrap();
}

/// Polls `check` until it holds or two seconds pass.
#[allow(dead_code)]
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
