// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Deck Relay Server
//!
//! Local relay between Stream Deck widgets and the Twitchat desktop
//! application. Provides:
//! - Plaintext WebSocket endpoint (default 127.0.0.1:30385)
//! - TLS WebSocket endpoint with a self-signed certificate (default 127.0.0.1:30386)
//! - HTTP status and Prometheus metrics endpoint (default 127.0.0.1:30387)

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use deck_relay::certificate::CertificateManager;
use deck_relay::config::RelayConfig;
use deck_relay::http::{create_router, HttpState};
use deck_relay::hub::RelayHub;
use deck_relay::listener::{self, ListenerDeps};
use deck_relay::metrics::RelayMetrics;
use deck_relay::settings_store::{JsonFileSettingsStore, SettingsStore};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("deck_relay=info".parse().unwrap()),
        )
        .init();

    let config = RelayConfig::from_env();

    info!("Starting Deck Relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {}", config.data_dir.display());
    info!(
        "Broadcast retry: {} attempts every {}ms",
        config.broadcast_max_attempts, config.broadcast_retry_ms
    );
    if config.shared_secret.is_some() {
        info!("Primary claims require the shared secret");
    }

    let settings: Arc<dyn SettingsStore> =
        Arc::new(JsonFileSettingsStore::open(config.settings_path()));
    let metrics = RelayMetrics::new();
    let hub = Arc::new(RelayHub::from_config(&config, settings, metrics));
    let certs = Arc::new(CertificateManager::new(&config.data_dir));

    let deps = ListenerDeps {
        hub: hub.clone(),
        max_message_size: config.max_message_size,
        handshake_timeout: config.handshake_timeout(),
    };

    // Plaintext listener
    match TcpListener::bind(config.plain_addr).await {
        Ok(plain) => {
            tokio::spawn(listener::serve_plain(plain, deps.clone()));
        }
        Err(e) => error!("Failed to bind {}: {}", config.plain_addr, e),
    }

    // TLS listener; certificate loading may generate a key, keep it off the runtime
    let secure_addr = config.secure_addr;
    let secure_certs = certs.clone();
    let secure_deps = deps.clone();
    tokio::spawn(async move {
        let loader = secure_certs.clone();
        match tokio::task::spawn_blocking(move || loader.material()).await {
            Ok(Ok(material)) => info!("TLS certificate fingerprint: {}", material.fingerprint()),
            Ok(Err(e)) => {
                error!("Secure listener disabled, no certificate: {}", e);
                return;
            }
            Err(e) => {
                error!("Secure listener disabled, certificate task failed: {}", e);
                return;
            }
        }

        match TcpListener::bind(secure_addr).await {
            Ok(secure) => listener::serve_secure(secure, secure_deps, secure_certs).await,
            Err(e) => error!("Failed to bind {}: {}", secure_addr, e),
        }
    });

    // Status endpoint
    if let Some(status_addr) = config.status_addr {
        let router = create_router(HttpState {
            hub: hub.clone(),
            certs: certs.clone(),
        });
        match TcpListener::bind(status_addr).await {
            Ok(http_listener) => {
                info!("Status endpoint listening on http://{}", status_addr);
                tokio::spawn(async move {
                    if let Err(e) = axum::serve(http_listener, router).await {
                        error!("Status endpoint stopped: {}", e);
                    }
                });
            }
            Err(e) => error!("Failed to bind {}: {}", status_addr, e),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}
