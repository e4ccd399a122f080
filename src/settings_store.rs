// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host Settings Store
//!
//! The host application keeps a small shared settings record that other UI
//! surfaces (status pages, property inspectors) read. The relay pushes the
//! current connection counts into it whenever the connection registry
//! changes, so those surfaces never need to query the relay directly.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Connection counts as stored in the host's global settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCounts {
    /// Number of connected clients of any class.
    pub client_count: usize,
    /// Number of connections classified as the primary application.
    pub main_app_count: usize,
}

/// Receives connection counts from the registry.
pub trait SettingsStore: Send + Sync {
    /// Publishes new counts. Called on every registry mutation, possibly
    /// from a runtime worker, so it must not block on I/O.
    fn publish_connection_counts(&self, counts: ConnectionCounts);

    /// Returns the last published counts.
    fn connection_counts(&self) -> ConnectionCounts;
}

/// In-memory settings store.
#[derive(Default)]
pub struct MemorySettingsStore {
    counts: Mutex<ConnectionCounts>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn publish_connection_counts(&self, counts: ConnectionCounts) {
        *self.counts.lock().unwrap() = counts;
    }

    fn connection_counts(&self) -> ConnectionCounts {
        *self.counts.lock().unwrap()
    }
}

/// Settings store backed by a JSON object on disk.
///
/// Only `clientCount` and `mainAppCount` are written; any other keys already
/// present in the file are preserved. Inside a tokio runtime the file is
/// written by a background task on the blocking pool, which always writes
/// the latest counts and skips intermediate ones. Outside a runtime each
/// publish writes synchronously.
pub struct JsonFileSettingsStore {
    path: Arc<PathBuf>,
    counts: Mutex<ConnectionCounts>,
    writer: Option<watch::Sender<ConnectionCounts>>,
}

impl JsonFileSettingsStore {
    /// Opens the store and resets the persisted counts to zero, since no
    /// connection survives a restart. The reset is written before returning.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = Arc::new(path.into());
        let initial = ConnectionCounts::default();
        if let Err(e) = write_counts(&path, initial) {
            warn!("Failed to reset connection counts in {}: {}", path.display(), e);
        }

        let writer = Handle::try_current().ok().map(|runtime| {
            let (tx, rx) = watch::channel(initial);
            runtime.spawn(run_writer(path.clone(), rx));
            tx
        });

        JsonFileSettingsStore {
            path,
            counts: Mutex::new(initial),
            writer,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonFileSettingsStore {
    fn publish_connection_counts(&self, counts: ConnectionCounts) {
        *self.counts.lock().unwrap() = counts;
        match &self.writer {
            Some(writer) => {
                writer.send_replace(counts);
            }
            None => {
                if let Err(e) = write_counts(&self.path, counts) {
                    warn!(
                        "Failed to write connection counts to {}: {}",
                        self.path.display(),
                        e
                    );
                }
            }
        }
    }

    fn connection_counts(&self) -> ConnectionCounts {
        *self.counts.lock().unwrap()
    }
}

/// Writes every change seen on `rx` until the store is dropped.
async fn run_writer(path: Arc<PathBuf>, mut rx: watch::Receiver<ConnectionCounts>) {
    while rx.changed().await.is_ok() {
        let counts = *rx.borrow_and_update();
        let target = path.clone();
        match tokio::task::spawn_blocking(move || write_counts(&target, counts)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                "Failed to write connection counts to {}: {}",
                path.display(),
                e
            ),
            Err(e) => warn!("Settings writer task failed: {}", e),
        }
    }
    debug!("Settings writer for {} stopped", path.display());
}

fn write_counts(path: &Path, counts: ConnectionCounts) -> std::io::Result<()> {
    let mut object = match std::fs::read(path) {
        Ok(data) => match serde_json::from_slice::<Value>(&data) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        },
        Err(_) => Map::new(),
    };

    object.insert("clientCount".to_string(), counts.client_count.into());
    object.insert("mainAppCount".to_string(), counts.main_app_count.into());

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(&Value::Object(object))?;
    std::fs::write(path, data)
}
