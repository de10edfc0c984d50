/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::relay::{RelayId, FIELD_ACTIVE, FIELD_URL};
use crate::store::Store;

/// In-process store, used as the test double for the Redis store.
///
/// Dedup lock expiry is evaluated against the `now` passed by the caller, so tests
/// control time without sleeping.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    settings: HashMap<String, String>,
    idle: bool,
    relays: HashMap<RelayId, HashMap<String, String>>,
    known: BTreeSet<RelayId>,
    active: BTreeSet<RelayId>,
    always_on: BTreeSet<RelayId>,
    restart: BTreeSet<RelayId>,
    fails: HashMap<RelayId, u64>,
    errors: HashMap<RelayId, BTreeSet<String>>,
    connections: HashMap<RelayId, i64>,
    // event id -> expiry; None once permanent
    locks: HashMap<String, Option<i64>>,
    seen: HashMap<RelayId, HashSet<String>>,
    total_events: u64,
    workers: BTreeSet<String>,
    pings: HashMap<String, i64>,
    assignments: BTreeMap<String, Vec<RelayId>>,
    lease: Option<i64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl MemoryStore {
    pub async fn total_events(&self) -> u64 {
        self.inner.lock().await.total_events
    }

    pub async fn distinct_events(&self, id: &RelayId) -> usize {
        self.inner.lock().await.seen.get(id).map_or(0, HashSet::len)
    }

    pub async fn error_records(&self, id: &RelayId) -> Vec<String> {
        self.inner
            .lock()
            .await
            .errors
            .get(id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_permanently_locked(&self, event_id: &str) -> bool {
        matches!(self.inner.lock().await.locks.get(event_id), Some(None))
    }

    pub async fn is_known(&self, id: &RelayId) -> bool {
        self.inner.lock().await.known.contains(id)
    }

    pub async fn connection(&self, id: &RelayId) -> Option<i64> {
        self.inner.lock().await.connections.get(id).copied()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn seed_settings(&self, defaults: &[(&str, &str)]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for (k, v) in defaults {
            inner
                .settings
                .entry(k.to_string())
                .or_insert_with(|| v.to_string());
        }
        Ok(())
    }

    async fn settings(&self) -> Result<HashMap<String, String>> {
        Ok(self.inner.lock().await.settings.clone())
    }

    async fn is_idle(&self) -> Result<bool> {
        Ok(self.inner.lock().await.idle)
    }

    async fn set_idle(&self, idle: bool) -> Result<()> {
        self.inner.lock().await.idle = idle;
        Ok(())
    }

    async fn relay_fields(&self, id: &RelayId) -> Result<HashMap<String, String>> {
        Ok(self
            .inner
            .lock()
            .await
            .relays
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_relay_field(&self, id: &RelayId, field: &str, value: &str) -> Result<()> {
        self.inner
            .lock()
            .await
            .relays
            .entry(id.clone())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn create_relay(
        &self,
        id: &RelayId,
        fields: &[(String, String)],
        active: bool,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner
            .relays
            .get(id)
            .is_some_and(|r| r.contains_key(FIELD_URL))
        {
            return Ok(false);
        }
        let record = inner.relays.entry(id.clone()).or_default();
        record.extend(fields.iter().cloned());
        if !record.contains_key(FIELD_URL) {
            record.insert(FIELD_URL.to_string(), id.url()?);
        }
        inner.known.insert(id.clone());
        if active {
            inner.active.insert(id.clone());
        }
        Ok(true)
    }

    async fn set_relay_active(&self, id: &RelayId, active: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .relays
            .entry(id.clone())
            .or_default()
            .insert(FIELD_ACTIVE.to_string(), if active { "1" } else { "0" }.to_string());
        if active {
            inner.active.insert(id.clone());
        } else {
            inner.active.remove(id);
        }
        Ok(())
    }

    async fn set_relay_always_on(&self, id: &RelayId, always_on: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .relays
            .entry(id.clone())
            .or_default()
            .insert("always_on".to_string(), if always_on { "1" } else { "0" }.to_string());
        if always_on {
            inner.always_on.insert(id.clone());
        } else {
            inner.always_on.remove(id);
        }
        Ok(())
    }

    async fn active_relays(&self) -> Result<Vec<RelayId>> {
        Ok(self.inner.lock().await.active.iter().cloned().collect())
    }

    async fn always_on_relays(&self) -> Result<HashSet<RelayId>> {
        Ok(self.inner.lock().await.always_on.iter().cloned().collect())
    }

    async fn record_failure(&self, id: &RelayId, record: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        *inner.fails.entry(id.clone()).or_default() += 1;
        inner
            .errors
            .entry(id.clone())
            .or_default()
            .insert(record.to_string());
        Ok(())
    }

    async fn relay_failures(&self) -> Result<HashMap<RelayId, u64>> {
        Ok(self.inner.lock().await.fails.clone())
    }

    async fn clear_failures(&self, id: &RelayId) -> Result<()> {
        self.inner.lock().await.fails.remove(id);
        Ok(())
    }

    async fn touch_connection(&self, id: &RelayId, now: i64) -> Result<()> {
        self.inner.lock().await.connections.insert(id.clone(), now);
        Ok(())
    }

    async fn drop_connection(&self, id: &RelayId) -> Result<()> {
        self.inner.lock().await.connections.remove(id);
        Ok(())
    }

    async fn stale_connections(&self, cutoff: i64) -> Result<Vec<RelayId>> {
        let inner = self.inner.lock().await;
        let mut stale: Vec<(i64, RelayId)> = inner
            .connections
            .iter()
            .filter(|(_, ts)| **ts <= cutoff)
            .map(|(id, ts)| (*ts, id.clone()))
            .collect();
        stale.sort();
        Ok(stale.into_iter().map(|(_, id)| id).collect())
    }

    async fn request_restart(&self, ids: &[RelayId]) -> Result<()> {
        self.inner.lock().await.restart.extend(ids.iter().cloned());
        Ok(())
    }

    async fn restart_requests(&self) -> Result<HashSet<RelayId>> {
        Ok(self.inner.lock().await.restart.iter().cloned().collect())
    }

    async fn clear_restart_requests(&self, ids: &[RelayId]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for id in ids {
            inner.restart.remove(id);
        }
        Ok(())
    }

    async fn lock_events(&self, event_ids: &[String], now: i64, ttl_secs: u64) -> Result<Vec<bool>> {
        let mut inner = self.inner.lock().await;
        let expires = now.saturating_add(ttl_secs as i64);
        Ok(event_ids
            .iter()
            .map(|eid| {
                let held = match inner.locks.get(eid) {
                    Some(None) => true,
                    Some(Some(until)) => *until > now,
                    None => false,
                };
                if !held {
                    inner.locks.insert(eid.clone(), Some(expires));
                }
                !held
            })
            .collect())
    }

    async fn lock_events_permanently(&self, event_ids: &[String], _now: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for eid in event_ids {
            inner.locks.insert(eid.clone(), None);
        }
        Ok(())
    }

    async fn count_seen(&self, id: &RelayId, event_ids: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .seen
            .entry(id.clone())
            .or_default()
            .extend(event_ids.iter().cloned());
        inner.total_events += event_ids.len() as u64;
        Ok(())
    }

    async fn register_worker(&self, worker_id: &str, now: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.workers.insert(worker_id.to_string());
        inner.pings.insert(worker_id.to_string(), now);
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str, now: i64) -> Result<()> {
        self.inner
            .lock()
            .await
            .pings
            .insert(worker_id.to_string(), now);
        Ok(())
    }

    async fn is_worker(&self, worker_id: &str) -> Result<bool> {
        Ok(self.inner.lock().await.workers.contains(worker_id))
    }

    async fn workers(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock().await.workers.iter().cloned().collect())
    }

    async fn worker_pings(&self) -> Result<HashMap<String, i64>> {
        Ok(self.inner.lock().await.pings.clone())
    }

    async fn purge_worker(&self, worker_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.pings.remove(worker_id);
        inner.assignments.remove(worker_id);
        inner.workers.remove(worker_id);
        Ok(())
    }

    async fn assigned_relays(&self, worker_id: &str) -> Result<Vec<RelayId>> {
        Ok(self
            .inner
            .lock()
            .await
            .assignments
            .get(worker_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_assignments(&self, assignments: &[(String, Vec<RelayId>)]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for (worker_id, relays) in assignments {
            if relays.is_empty() {
                inner.assignments.remove(worker_id);
            } else {
                inner.assignments.insert(worker_id.clone(), relays.clone());
            }
        }
        Ok(())
    }

    async fn acquire_lease(&self, now: i64) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.lease.is_some() {
            return Ok(false);
        }
        inner.lease = Some(now);
        Ok(true)
    }

    async fn lease(&self) -> Result<Option<i64>> {
        Ok(self.inner.lock().await.lease)
    }

    async fn refresh_lease(&self, now: i64) -> Result<()> {
        self.inner.lock().await.lease = Some(now);
        Ok(())
    }

    async fn release_lease(&self) -> Result<()> {
        self.inner.lock().await.lease = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_locks_expire_unless_permanent() {
        let store = MemoryStore::new();
        let ids = vec!["a".to_string(), "b".to_string()];

        assert_eq!(store.lock_events(&ids, 100, 2).await.unwrap(), vec![true, true]);
        assert_eq!(store.lock_events(&ids, 101, 2).await.unwrap(), vec![false, false]);

        store.lock_events_permanently(&ids[..1], 101).await.unwrap();
        assert_eq!(store.lock_events(&ids, 102, 2).await.unwrap(), vec![false, true]);
        assert!(store.is_permanently_locked("a").await);
        assert!(!store.is_permanently_locked("b").await);
    }

    #[tokio::test]
    async fn create_relay_is_set_if_absent() {
        let store = MemoryStore::new();
        let id = RelayId::from_url("wss://a.example");
        let fields = vec![("url".to_string(), "wss://a.example".to_string())];

        assert!(store.create_relay(&id, &fields, false).await.unwrap());
        assert!(!store.create_relay(&id, &fields, true).await.unwrap());
        assert!(store.is_known(&id).await);
        assert!(store.active_relays().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_connections_are_range_queried() {
        let store = MemoryStore::new();
        let old = RelayId::from_url("wss://old.example");
        let fresh = RelayId::from_url("wss://fresh.example");
        store.touch_connection(&old, 10).await.unwrap();
        store.touch_connection(&fresh, 100).await.unwrap();

        assert_eq!(store.stale_connections(40).await.unwrap(), vec![old.clone()]);
        store.drop_connection(&old).await.unwrap();
        assert!(store.stale_connections(40).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn purge_removes_every_worker_record() {
        let store = MemoryStore::new();
        store.register_worker("w1", 5).await.unwrap();
        store
            .save_assignments(&[("w1".to_string(), vec![RelayId::from_url("wss://a.example")])])
            .await
            .unwrap();

        store.purge_worker("w1").await.unwrap();
        assert!(!store.is_worker("w1").await.unwrap());
        assert!(store.worker_pings().await.unwrap().is_empty());
        assert!(store.assigned_relays("w1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let store = MemoryStore::new();
        assert!(store.acquire_lease(1).await.unwrap());
        assert!(!store.acquire_lease(2).await.unwrap());
        store.refresh_lease(3).await.unwrap();
        assert_eq!(store.lease().await.unwrap(), Some(3));
        store.release_lease().await.unwrap();
        assert!(store.acquire_lease(4).await.unwrap());
    }
}
