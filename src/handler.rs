// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket Connection Handler
//!
//! Runs one upgraded connection from either listener until it closes.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::connection_registry::{ConnectionId, Transport};
use crate::hub::{FrameDisposition, RelayHub};

/// Shared dependencies for handling a WebSocket connection.
pub struct ConnectionDeps {
    pub hub: Arc<RelayHub>,
    pub transport: Transport,
    pub max_message_size: usize,
}

/// Handles a WebSocket connection until the peer closes it or the transport
/// fails. The connection is always unregistered on exit.
pub async fn handle_connection<S>(ws_stream: WebSocketStream<S>, deps: ConnectionDeps)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ConnectionDeps {
        hub,
        transport,
        max_message_size,
    } = deps;
    let session = &uuid::Uuid::new_v4().to_string()[..8];

    let (mut write, mut read) = ws_stream.split();
    let (id, mut outbound) = hub.open_connection(transport);
    info!("[{}] Opened {} over {}", session, id, transport);

    loop {
        let msg = tokio::select! {
            ws_msg = read.next() => match ws_msg {
                Some(msg) => msg,
                None => {
                    debug!("[{}] Disconnected", session);
                    break;
                }
            },
            Some(frame) = outbound.recv() => {
                if let Err(e) = write.send(Message::Text(frame.text)).await {
                    warn!("[{}] Write failed: {}", session, e);
                    break;
                }
                hub.metrics().frames_sent.inc();
                continue;
            }
        };

        match msg {
            Ok(Message::Text(text)) => process_frame(&hub, id, session, &text, max_message_size),
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => process_frame(&hub, id, session, &text, max_message_size),
                Err(_) => {
                    warn!("[{}] Ignoring non-UTF-8 binary frame", session);
                    hub.metrics().frames_malformed.inc();
                }
            },
            Ok(Message::Close(_)) => {
                debug!("[{}] Close frame received", session);
                break;
            }
            // tungstenite queues the pong reply itself
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
            Err(e) => {
                warn!("[{}] Transport error: {}", session, e);
                break;
            }
        }
    }

    hub.close_connection(id);
    info!("[{}] Closed {}", session, id);
}

fn process_frame(hub: &RelayHub, id: ConnectionId, session: &str, text: &str, max_message_size: usize) {
    if text.len() > max_message_size {
        warn!("[{}] Frame too large: {} bytes", session, text.len());
        hub.metrics().frames_rejected.inc();
        return;
    }

    let _timer = hub.metrics().frame_duration.start_timer();
    match hub.handle_frame(id, text) {
        Ok(FrameDisposition::Dispatched(topic)) => debug!("[{}] Dispatched {}", session, topic),
        Ok(FrameDisposition::Promoted { changed: true }) => {
            info!("[{}] Classified as primary instance", session)
        }
        Ok(FrameDisposition::Promoted { changed: false }) => {}
        Ok(FrameDisposition::Rejected) => warn!("[{}] Primary claim rejected", session),
        Err(e) => warn!("[{}] Dropping malformed frame: {}", session, e),
    }
}
