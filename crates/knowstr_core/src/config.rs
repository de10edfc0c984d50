/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::Duration;

/// Process-level configuration read from the environment. Shared tunables live in
/// the store instead, see [`crate::settings::Settings`].
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub queue_url: String,
    /// Seconds without a liveness refresh before a relay connection counts as stale.
    pub connection_ttl: i64,
    /// How long a stop request waits for a crawler to finish its cleanup writes.
    pub stop_grace: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let redis_url = std::env::var("KNOWSTR_REDIS_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());
        let queue_url = std::env::var("KNOWSTR_QUEUE_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| redis_url.clone());
        let connection_ttl = std::env::var("KNOWSTR_CONNECTION_TTL")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(60)
            .max(1);
        let stop_grace_ms = std::env::var("KNOWSTR_STOP_GRACE_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(5000)
            .min(60_000);

        Self {
            redis_url,
            queue_url,
            connection_ttl,
            stop_grace: Duration::from_millis(stop_grace_ms),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            queue_url: "redis://127.0.0.1:6379".to_string(),
            connection_ttl: 60,
            stop_grace: Duration::from_millis(5000),
        }
    }
}
