/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Shared coordination store.
//!
//! Every piece of state that crosses a process or crawler boundary goes through this
//! trait; its implementations must make each method atomic on its own.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;

use crate::relay::RelayId;

pub const KEY_KNOWN_RELAYS: &str = "known_relays_ids";
pub const KEY_ACTIVE_RELAYS: &str = "active_relays_ids";
pub const KEY_ALWAYS_ON_RELAYS: &str = "always_on_relays_ids";
pub const KEY_RESTART_RELAYS: &str = "restart_relays_ids";
pub const KEY_WORKERS: &str = "workers";
pub const KEY_WORKERS_PING: &str = "workers_ping";
pub const KEY_RELAYS_FAIL: &str = "relays_fail";
pub const KEY_CONNECTIONS: &str = "zconnections";
pub const KEY_TOTAL_EVENTS: &str = "totalevents";
pub const KEY_SCHEDULER: &str = "scheduler";
pub const KEY_IDLE: &str = "idle";
pub const KEY_SETTINGS: &str = "settings";

pub fn relay_key(id: &RelayId) -> String {
    format!("relay:{id}")
}

pub fn relay_errors_key(id: &RelayId) -> String {
    format!("relays_error:{id}")
}

pub fn relay_events_hll_key(id: &RelayId) -> String {
    format!("relay_events_hll:{id}")
}

pub fn worker_key(worker_id: &str) -> String {
    format!("workers:{worker_id}")
}

pub fn event_lock_key(event_id: &str) -> String {
    format!("id:{event_id}")
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    // settings and global flags
    async fn seed_settings(&self, defaults: &[(&str, &str)]) -> Result<()>;
    async fn settings(&self) -> Result<HashMap<String, String>>;
    async fn is_idle(&self) -> Result<bool>;
    async fn set_idle(&self, idle: bool) -> Result<()>;

    // relay records
    async fn relay_fields(&self, id: &RelayId) -> Result<HashMap<String, String>>;
    async fn set_relay_field(&self, id: &RelayId, field: &str, value: &str) -> Result<()>;
    /// Creates the relay hash only if no relay with this id exists yet, registering
    /// it as known (and active when `active`). Returns whether it was created.
    async fn create_relay(
        &self,
        id: &RelayId,
        fields: &[(String, String)],
        active: bool,
    ) -> Result<bool>;
    /// Sets the `active` field and membership of the active set together.
    async fn set_relay_active(&self, id: &RelayId, active: bool) -> Result<()>;
    async fn set_relay_always_on(&self, id: &RelayId, always_on: bool) -> Result<()>;
    async fn active_relays(&self) -> Result<Vec<RelayId>>;
    async fn always_on_relays(&self) -> Result<HashSet<RelayId>>;

    // failures
    async fn record_failure(&self, id: &RelayId, record: &str) -> Result<()>;
    async fn relay_failures(&self) -> Result<HashMap<RelayId, u64>>;
    async fn clear_failures(&self, id: &RelayId) -> Result<()>;

    // connection liveness
    async fn touch_connection(&self, id: &RelayId, now: i64) -> Result<()>;
    async fn drop_connection(&self, id: &RelayId) -> Result<()>;
    /// Relays whose last liveness refresh is at or before `cutoff`.
    async fn stale_connections(&self, cutoff: i64) -> Result<Vec<RelayId>>;
    async fn request_restart(&self, ids: &[RelayId]) -> Result<()>;
    async fn restart_requests(&self) -> Result<HashSet<RelayId>>;
    async fn clear_restart_requests(&self, ids: &[RelayId]) -> Result<()>;

    // event dedup
    /// Tries to take a short-lived lock per event id; the result is aligned with
    /// `event_ids` and is `true` where this caller took the lock.
    async fn lock_events(&self, event_ids: &[String], now: i64, ttl_secs: u64) -> Result<Vec<bool>>;
    async fn lock_events_permanently(&self, event_ids: &[String], now: i64) -> Result<()>;
    /// Feeds the per-relay distinct event estimator and the global counter.
    async fn count_seen(&self, id: &RelayId, event_ids: &[String]) -> Result<()>;

    // workers
    async fn register_worker(&self, worker_id: &str, now: i64) -> Result<()>;
    async fn heartbeat(&self, worker_id: &str, now: i64) -> Result<()>;
    async fn is_worker(&self, worker_id: &str) -> Result<bool>;
    async fn workers(&self) -> Result<Vec<String>>;
    async fn worker_pings(&self) -> Result<HashMap<String, i64>>;
    /// Removes membership, heartbeat and assignment of a worker.
    async fn purge_worker(&self, worker_id: &str) -> Result<()>;
    async fn assigned_relays(&self, worker_id: &str) -> Result<Vec<RelayId>>;
    /// Replaces every listed worker's assignment in one transaction.
    async fn save_assignments(&self, assignments: &[(String, Vec<RelayId>)]) -> Result<()>;

    // scheduler lease
    /// Set-if-absent; `true` when the lease was free and is now ours.
    async fn acquire_lease(&self, now: i64) -> Result<bool>;
    async fn lease(&self) -> Result<Option<i64>>;
    async fn refresh_lease(&self, now: i64) -> Result<()>;
    async fn release_lease(&self) -> Result<()>;
}
