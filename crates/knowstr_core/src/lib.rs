/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod config;
pub mod crawler;
pub mod error;
pub mod failure;
pub mod memory_store;
pub mod queue;
pub mod redis_store;
pub mod relay;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod store;
pub mod worker;

/// Unix time in seconds, the unit of every timestamp kept in the store.
pub fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
