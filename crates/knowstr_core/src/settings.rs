/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::store::Store;

const RELAY_DEFAULT_PREFIX: &str = "relay_default_";

/// Tunables seeded into the shared `settings` hash when absent.
pub const DEFAULT_SETTINGS: &[(&str, &str)] = &[
    ("worker_main_loop_interval", "3000"),
    ("worker_max_relays", "10"),
    ("scheduler_main_loop_interval", "3000"),
    ("scheduler_fails_count_threshold", "5"),
    ("scheduler_max_worker_latency", "120"),
    ("redis_lock_timeout", "2"),
    ("relay_default_handshake_timeout", "5000"),
    ("relay_default_past_filters", r#"[{"limit":1000}]"#),
    ("relay_default_future_filters", r#"[{"limit":1000}]"#),
    ("relay_default_active", "0"),
    ("relay_default_should_load_past", "1"),
    ("relay_default_should_load_future", "1"),
    ("relay_default_should_load_past_again", "0"),
    ("relay_default_eose_delay", "0"),
    ("relay_default_event_delay", "0"),
    ("relay_default_max_server_latency", "0"),
    ("relay_default_ping_interval", "25000"),
    ("relay_future_events_flush_interval", "1000"),
    ("queue_topic", "knowstr:events"),
    ("queue_send_timeout_ms", "1000"),
    ("queue_max_pending_messages", "10000"),
    ("queue_block_if_queue_full", "true"),
];

#[derive(Debug, Clone)]
pub struct Settings {
    pub worker_main_loop_interval: Duration,
    pub worker_max_relays: usize,
    pub scheduler_main_loop_interval: Duration,
    pub scheduler_fails_count_threshold: u64,
    /// Seconds.
    pub scheduler_max_worker_latency: i64,
    /// Seconds a fresh dedup lock lives before it must be made permanent.
    pub redis_lock_timeout: u64,
    pub relay_future_events_flush_interval: Duration,
    pub relay_defaults: RelayDefaults,
    pub queue: QueueSettings,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub topic: String,
    pub send_timeout: Duration,
    pub max_pending_messages: usize,
    pub block_if_queue_full: bool,
}

/// Relay attributes applied to newly discovered relays and merged under stored
/// relay fields at load time, keyed by relay field name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayDefaults(BTreeMap<String, String>);

impl RelayDefaults {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn is_active(&self) -> bool {
        self.get("active").is_some_and(parse_flag)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn with(mut self, field: &str, value: &str) -> Self {
        self.0.insert(field.to_string(), value.to_string());
        self
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_map(&HashMap::new())
    }
}

impl Settings {
    /// Builds settings from the raw hash, falling back to [`DEFAULT_SETTINGS`] for
    /// missing or unparsable values.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let mut merged: HashMap<&str, &str> = DEFAULT_SETTINGS.iter().copied().collect();
        for (k, v) in map {
            merged.insert(k.as_str(), v.as_str());
        }

        let relay_defaults = RelayDefaults(
            merged
                .iter()
                .filter_map(|(k, v)| {
                    k.strip_prefix(RELAY_DEFAULT_PREFIX)
                        .map(|field| (field.to_string(), v.to_string()))
                })
                .collect(),
        );

        Self {
            worker_main_loop_interval: Duration::from_millis(
                parse_or(&merged, "worker_main_loop_interval", 3000u64).max(100),
            ),
            worker_max_relays: parse_or(&merged, "worker_max_relays", 10usize),
            scheduler_main_loop_interval: Duration::from_millis(
                parse_or(&merged, "scheduler_main_loop_interval", 3000u64).max(100),
            ),
            scheduler_fails_count_threshold: parse_or(&merged, "scheduler_fails_count_threshold", 5u64),
            scheduler_max_worker_latency: parse_or(&merged, "scheduler_max_worker_latency", 120i64),
            redis_lock_timeout: parse_or(&merged, "redis_lock_timeout", 2u64).max(1),
            relay_future_events_flush_interval: Duration::from_millis(
                parse_or(&merged, "relay_future_events_flush_interval", 1000u64).max(10),
            ),
            relay_defaults,
            queue: QueueSettings {
                topic: merged
                    .get("queue_topic")
                    .map(|v| v.trim())
                    .filter(|v| !v.is_empty())
                    .unwrap_or("knowstr:events")
                    .to_string(),
                send_timeout: Duration::from_millis(parse_or(&merged, "queue_send_timeout_ms", 1000u64)),
                max_pending_messages: parse_or(&merged, "queue_max_pending_messages", 10_000usize).max(1),
                block_if_queue_full: merged
                    .get("queue_block_if_queue_full")
                    .copied()
                    .map(parse_flag)
                    .unwrap_or(true),
            },
        }
    }

    /// Seeds missing defaults into the store, then loads the effective settings.
    pub async fn load(store: &dyn Store) -> Result<Self> {
        store.seed_settings(DEFAULT_SETTINGS).await?;
        let raw = store.settings().await?;
        let settings = Self::from_map(&raw);
        info!(
            worker_max_relays = settings.worker_max_relays,
            queue_topic = %settings.queue.topic,
            "settings loaded"
        );
        Ok(settings)
    }
}

/// Store flags are written as `"1"`/`"0"`; operators sometimes type `true`.
pub fn parse_flag(value: &str) -> bool {
    let v = value.trim();
    v == "1" || v.eq_ignore_ascii_case("true")
}

fn parse_or<T: FromStr>(map: &HashMap<&str, &str>, key: &str, default: T) -> T {
    map.get(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}
