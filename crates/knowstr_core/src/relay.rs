/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use knowstr_protocol::Filter;
use serde_json::Value;
use tracing::warn;

use crate::settings::{parse_flag, RelayDefaults};

pub const FIELD_URL: &str = "url";
pub const FIELD_ACTIVE: &str = "active";
pub const FIELD_IP: &str = "ip";
pub const FIELD_SHOULD_LOAD_PAST: &str = "should_load_past";
pub const FIELD_CURSOR: &str = "last_seen_past_event_created_at";

/// Cursor value of a relay whose backlog has never been requested.
pub const CURSOR_NOT_STARTED: i64 = -1;
/// Cursor value of a relay whose backlog is exhausted.
pub const CURSOR_EXHAUSTED: i64 = 0;

/// Store identifier of a relay: the base64 encoding of its URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelayId(String);

impl RelayId {
    pub fn from_url(url: &str) -> Self {
        Self(B64.encode(url.as_bytes()))
    }

    /// Wraps an id read back from the store.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn url(&self) -> Result<String> {
        let bytes = B64.decode(&self.0).context("relay id is not base64")?;
        String::from_utf8(bytes).context("relay id is not utf-8")
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Relay configuration and backlog cursor, as loaded by a crawler.
#[derive(Debug, Clone)]
pub struct Relay {
    pub id: RelayId,
    pub url: String,
    pub active: bool,
    pub always_on: bool,
    pub should_load_past: bool,
    pub should_load_future: bool,
    pub should_load_past_again: bool,
    pub eose_delay: Duration,
    pub event_delay: Duration,
    pub handshake_timeout: Duration,
    pub max_server_latency: Duration,
    pub ping_interval: Duration,
    pub past_filters: Vec<Filter>,
    pub future_filters: Vec<Filter>,
    pub ip: Option<String>,
    cursor: i64,
    stored_cursor: Option<i64>,
}

impl Relay {
    /// Merges stored relay fields over `defaults`.
    pub fn from_fields(
        id: RelayId,
        stored: &HashMap<String, String>,
        defaults: &RelayDefaults,
    ) -> Result<Self> {
        let mut merged: HashMap<&str, &str> = defaults.fields().collect();
        merged.extend(stored.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let get = |field: &str| merged.get(field).copied();
        let flag = |field: &str| get(field).is_some_and(parse_flag);
        let millis = |field: &str, fallback: u64| {
            Duration::from_millis(
                get(field)
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .unwrap_or(fallback),
            )
        };

        let url = match stored.get(FIELD_URL) {
            Some(url) => url.clone(),
            None => id.url()?,
        };
        let stored_cursor = stored
            .get(FIELD_CURSOR)
            .and_then(|v| v.trim().parse::<i64>().ok());

        Ok(Self {
            past_filters: filters(&url, get("past_filters")),
            future_filters: filters(&url, get("future_filters")),
            active: flag(FIELD_ACTIVE),
            always_on: flag("always_on"),
            should_load_past: flag(FIELD_SHOULD_LOAD_PAST),
            should_load_future: flag("should_load_future"),
            should_load_past_again: flag("should_load_past_again"),
            eose_delay: millis("eose_delay", 0),
            event_delay: millis("event_delay", 0),
            handshake_timeout: millis("handshake_timeout", 5000),
            max_server_latency: millis("max_server_latency", 0),
            ping_interval: millis("ping_interval", 25_000).max(Duration::from_millis(100)),
            ip: stored.get(FIELD_IP).cloned(),
            cursor: stored_cursor.unwrap_or(CURSOR_NOT_STARTED),
            stored_cursor,
            id,
            url,
        })
    }

    /// A relay with every loading mode disabled has nothing to crawl.
    pub fn has_work(&self) -> bool {
        self.should_load_past || self.should_load_future || self.should_load_past_again
    }

    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    pub fn set_cursor(&mut self, cursor: i64) {
        self.cursor = cursor;
    }

    /// The cursor to persist, if it moved since it was last loaded or written.
    pub fn unsaved_cursor(&self) -> Option<i64> {
        (self.stored_cursor != Some(self.cursor)).then_some(self.cursor)
    }

    pub fn mark_cursor_saved(&mut self, cursor: i64) {
        self.stored_cursor = Some(cursor);
    }

    pub fn future_filters_since(&self, now: i64) -> Vec<Filter> {
        with_bound(&self.future_filters, "since", now)
    }

    pub fn past_filters_until(&self) -> Vec<Filter> {
        with_bound(&self.past_filters, "until", self.cursor)
    }
}

/// Hash fields written for a relay discovered for the first time.
pub fn new_relay_fields(url: &str, defaults: &RelayDefaults) -> Vec<(String, String)> {
    let mut fields = vec![(FIELD_URL.to_string(), url.to_string())];
    fields.extend(defaults.fields().map(|(k, v)| (k.to_string(), v.to_string())));
    fields
}

fn filters(url: &str, raw: Option<&str>) -> Vec<Filter> {
    let parsed = raw.map(serde_json::from_str::<Vec<Filter>>);
    match parsed {
        Some(Ok(filters)) if !filters.is_empty() => filters,
        Some(Err(e)) => {
            warn!(relay = %url, "bad filter template, using limit only: {e}");
            vec![limit_only()]
        }
        _ => vec![limit_only()],
    }
}

fn limit_only() -> Filter {
    let mut f = Filter::new();
    f.insert("limit".to_string(), Value::from(1000));
    f
}

fn with_bound(filters: &[Filter], key: &str, value: i64) -> Vec<Filter> {
    filters
        .iter()
        .cloned()
        .map(|mut f| {
            f.insert(key.to_string(), Value::from(value));
            f
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use serde_json::json;

    fn defaults() -> RelayDefaults {
        Settings::default().relay_defaults
    }

    #[test]
    fn id_round_trips_url() {
        let id = RelayId::from_url("wss://relay.example");
        assert_eq!(id.as_str(), "d3NzOi8vcmVsYXkuZXhhbXBsZQ==");
        assert_eq!(id.url().unwrap(), "wss://relay.example");
    }

    #[test]
    fn stored_fields_override_defaults() {
        let id = RelayId::from_url("wss://relay.example");
        let mut stored = HashMap::new();
        stored.insert("should_load_future".to_string(), "0".to_string());
        stored.insert("ping_interval".to_string(), "1000".to_string());
        stored.insert(FIELD_CURSOR.to_string(), "1700000000".to_string());
        let relay = Relay::from_fields(id, &stored, &defaults()).unwrap();

        assert_eq!(relay.url, "wss://relay.example");
        assert!(relay.should_load_past);
        assert!(!relay.should_load_future);
        assert_eq!(relay.ping_interval, Duration::from_secs(1));
        assert_eq!(relay.handshake_timeout, Duration::from_secs(5));
        assert_eq!(relay.cursor(), 1_700_000_000);
        assert_eq!(relay.unsaved_cursor(), None);
    }

    #[test]
    fn first_run_cursor_is_unset() {
        let id = RelayId::from_url("wss://relay.example");
        let mut relay = Relay::from_fields(id, &HashMap::new(), &defaults()).unwrap();
        assert_eq!(relay.cursor(), CURSOR_NOT_STARTED);
        assert_eq!(relay.unsaved_cursor(), Some(CURSOR_NOT_STARTED));
        relay.set_cursor(42);
        relay.mark_cursor_saved(42);
        assert_eq!(relay.unsaved_cursor(), None);
    }

    #[test]
    fn filters_get_time_bounds() {
        let id = RelayId::from_url("wss://relay.example");
        let mut relay = Relay::from_fields(id, &HashMap::new(), &defaults()).unwrap();
        relay.set_cursor(99);
        assert_eq!(
            Value::Array(relay.past_filters_until().into_iter().map(Value::Object).collect()),
            json!([{"limit": 1000, "until": 99}])
        );
        assert_eq!(
            Value::Array(relay.future_filters_since(5).into_iter().map(Value::Object).collect()),
            json!([{"limit": 1000, "since": 5}])
        );
    }

    #[test]
    fn nothing_enabled_means_no_work() {
        let id = RelayId::from_url("wss://relay.example");
        let defaults = defaults()
            .with("should_load_past", "0")
            .with("should_load_future", "0");
        let relay = Relay::from_fields(id, &HashMap::new(), &defaults).unwrap();
        assert!(!relay.has_work());
    }

    #[test]
    fn new_relays_carry_url_and_defaults() {
        let fields = new_relay_fields("wss://relay.example", &defaults());
        assert_eq!(fields[0], ("url".to_string(), "wss://relay.example".to_string()));
        assert!(fields.iter().any(|(k, v)| k == "ping_interval" && v == "25000"));
    }
}
