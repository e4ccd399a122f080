// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Dual WebSocket Listener
//!
//! Two accept loops share one hub: a plaintext listener and a TLS listener
//! presenting the self-signed certificate. Both read the request head of
//! each connection first so that a plain browser GET gets a small HTTP
//! answer instead of a failed WebSocket handshake. On the TLS port that
//! answer is the page users open once to accept the certificate. Upgrades
//! get the head replayed in front of the rest of the stream.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

use crate::certificate::{CertificateManager, CertificateMaterial};
use crate::connection_registry::Transport;
use crate::handler::{self, ConnectionDeps};
use crate::hub::RelayHub;

/// Most bytes read to tell an HTTP GET from a WebSocket upgrade.
const HEAD_LIMIT: usize = 1024;

/// Served on the TLS port to plain browser requests.
pub const CONFIRMATION_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Deck Relay</title></head>
<body style="font-family: sans-serif; text-align: center; margin-top: 4em">
<h1>Certificate accepted</h1>
<p>The secure connection to the Stream Deck relay works.</p>
<p>You can close this tab and connect from Twitchat.</p>
</body>
</html>
"#;

/// Shared dependencies of both accept loops.
#[derive(Clone)]
pub struct ListenerDeps {
    pub hub: Arc<RelayHub>,
    pub max_message_size: usize,
    pub handshake_timeout: Duration,
}

/// What the first bytes of a connection look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    WebSocketUpgrade,
    HttpGet { path: String },
    /// Anything else; handed to the WebSocket handshake, which rejects it.
    Unknown,
}

/// Classifies the head of an HTTP request.
pub fn classify_request(head: &[u8]) -> RequestKind {
    let text = String::from_utf8_lossy(head);
    let lower = text.to_ascii_lowercase();

    if lower.contains("upgrade: websocket") && lower.contains("connection:") {
        return RequestKind::WebSocketUpgrade;
    }

    if lower.starts_with("get ") {
        let path = text
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or("/")
            .to_string();
        return RequestKind::HttpGet { path };
    }

    RequestKind::Unknown
}

fn head_complete(head: &[u8]) -> bool {
    head.windows(4).any(|w| w == b"\r\n\r\n")
}

/// Reads until the end of the request head, `HEAD_LIMIT` bytes, EOF, or
/// `wait` elapses, whichever comes first. Returns what was read.
pub async fn read_head<S>(stream: &mut S, wait: Duration) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + wait;
    let mut head = Vec::with_capacity(HEAD_LIMIT);
    let mut chunk = [0u8; HEAD_LIMIT];

    while head.len() < HEAD_LIMIT && !head_complete(&head) {
        let want = HEAD_LIMIT - head.len();
        match timeout_at(deadline, stream.read(&mut chunk[..want])).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => head.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(e),
        }
    }
    Ok(head)
}

/// A stream whose first bytes were already consumed; they are served again
/// before anything else is read from `inner`.
pub struct Prefixed<S> {
    head: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> Prefixed<S> {
    pub fn new(head: Vec<u8>, inner: S) -> Self {
        Prefixed { head, pos: 0, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prefixed<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.head.len() {
            let n = (this.head.len() - this.pos).min(buf.remaining());
            buf.put_slice(&this.head[this.pos..this.pos + n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prefixed<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// JSON body returned for plain HTTP requests on the plaintext port.
pub fn status_body(hub: &RelayHub) -> String {
    let counts = hub.counts();
    serde_json::json!({
        "service": "deck-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "clientCount": counts.client_count,
        "mainAppCount": counts.main_app_count,
    })
    .to_string()
}

async fn respond<S>(stream: &mut S, content_type: &str, body: &str)
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Accepts plaintext connections forever.
pub async fn serve_plain(listener: TcpListener, deps: ListenerDeps) {
    if let Ok(addr) = listener.local_addr() {
        info!("WebSocket server listening on ws://{}", addr);
    }

    loop {
        let stream = match listener.accept().await {
            Ok((stream, _addr)) => stream,
            Err(e) => {
                warn!("Plain accept failed: {}", e);
                continue;
            }
        };

        let deps = deps.clone();
        tokio::spawn(async move {
            handle_plain(stream, deps).await;
        });
    }
}

async fn handle_plain(mut stream: TcpStream, deps: ListenerDeps) {
    let head = match read_head(&mut stream, deps.handshake_timeout).await {
        Ok(head) if !head.is_empty() => head,
        Ok(_) => {
            debug!("Plain connection sent nothing before the handshake timeout");
            return;
        }
        Err(e) => {
            debug!("Failed to read plain request head: {}", e);
            return;
        }
    };

    if let RequestKind::HttpGet { path } = classify_request(&head) {
        respond(&mut stream, "application/json", &status_body(&deps.hub)).await;
        debug!("Handled plain HTTP GET {}", path);
        return;
    }

    upgrade(Prefixed::new(head, stream), Transport::Plain, deps).await;
}

/// Accepts TLS connections forever, using the manager's current certificate.
///
/// The acceptor is rebuilt whenever the manager hands out new material, so a
/// regenerated certificate applies to the next handshake.
pub async fn serve_secure(listener: TcpListener, deps: ListenerDeps, certs: Arc<CertificateManager>) {
    if let Ok(addr) = listener.local_addr() {
        info!("WebSocket server listening on wss://{}", addr);
    }

    let mut current: Option<(Arc<CertificateMaterial>, TlsAcceptor)> = None;

    loop {
        let stream = match listener.accept().await {
            Ok((stream, _addr)) => stream,
            Err(e) => {
                warn!("Secure accept failed: {}", e);
                continue;
            }
        };

        let material = match certs.material() {
            Ok(material) => material,
            Err(e) => {
                error!("No usable TLS certificate: {}", e);
                deps.hub.metrics().connection_errors.inc();
                continue;
            }
        };

        let stale = match &current {
            Some((cached, _)) => !Arc::ptr_eq(cached, &material),
            None => true,
        };
        if stale {
            match material.server_config() {
                Ok(config) => {
                    info!("TLS acceptor using certificate {}", material.fingerprint());
                    current = Some((material, TlsAcceptor::from(config)));
                }
                Err(e) => {
                    error!("Failed to build TLS configuration: {}", e);
                    deps.hub.metrics().connection_errors.inc();
                    continue;
                }
            }
        }

        let acceptor = match &current {
            Some((_, acceptor)) => acceptor.clone(),
            None => continue,
        };
        let deps = deps.clone();
        tokio::spawn(async move {
            handle_secure(stream, acceptor, deps).await;
        });
    }
}

async fn handle_secure(stream: TcpStream, acceptor: TlsAcceptor, deps: ListenerDeps) {
    let tls = match timeout(deps.handshake_timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            // Browsers abort the first handshake until the certificate is accepted.
            debug!("TLS handshake failed: {}", e);
            deps.hub.metrics().connection_errors.inc();
            return;
        }
        Err(_) => {
            warn!("TLS handshake timeout");
            deps.hub.metrics().connection_errors.inc();
            return;
        }
    };

    let mut tls = tls;
    let head = match read_head(&mut tls, deps.handshake_timeout).await {
        Ok(head) if !head.is_empty() => head,
        Ok(_) => {
            debug!("TLS connection sent nothing before the handshake timeout");
            return;
        }
        Err(e) => {
            debug!("Failed to read TLS request head: {}", e);
            return;
        }
    };

    if let RequestKind::HttpGet { path } = classify_request(&head) {
        respond(&mut tls, "text/html; charset=utf-8", CONFIRMATION_PAGE).await;
        debug!("Served certificate confirmation page for {}", path);
        return;
    }

    upgrade(Prefixed::new(head, tls), Transport::Secure, deps).await;
}

async fn upgrade<S>(stream: S, transport: Transport, deps: ListenerDeps)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match timeout(deps.handshake_timeout, accept_async(stream)).await {
        Ok(Ok(ws_stream)) => {
            handler::handle_connection(
                ws_stream,
                ConnectionDeps {
                    hub: deps.hub,
                    transport,
                    max_message_size: deps.max_message_size,
                },
            )
            .await;
        }
        Ok(Err(e)) => {
            warn!("WebSocket handshake failed on {}: {}", transport, e);
            deps.hub.metrics().connection_errors.inc();
        }
        Err(_) => {
            warn!("WebSocket handshake timeout on {}", transport);
            deps.hub.metrics().connection_errors.inc();
        }
    }
}
