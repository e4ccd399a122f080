// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod broadcast;
pub mod certificate;
pub mod config;
pub mod connection_registry;
pub mod handler;
pub mod http;
pub mod hub;
pub mod listener;
mod mailbox;
pub mod metrics;
pub mod protocol;
pub mod router;
pub mod settings_store;
