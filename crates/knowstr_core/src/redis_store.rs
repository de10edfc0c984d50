/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::info;

use crate::relay::{RelayId, FIELD_ACTIVE, FIELD_URL};
use crate::store::*;

// Creates a relay hash atomically unless its url field already exists.
// KEYS: relay hash, known set, active set. ARGV: url, id, active flag, field pairs...
const CREATE_RELAY_SCRIPT: &str = r#"
    if redis.call("HSETNX", KEYS[1], "url", ARGV[1]) == 0 then
      return 0
    end
    for i = 4, #ARGV, 2 do
      redis.call("HSET", KEYS[1], ARGV[i], ARGV[i + 1])
    end
    redis.call("SADD", KEYS[2], ARGV[2])
    if ARGV[3] == "1" then
      redis.call("SADD", KEYS[3], ARGV[2])
    end
    return 1
"#;

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("redis connect")?;
        info!("redis store connected");
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn ids(raw: Vec<String>) -> Vec<RelayId> {
    raw.into_iter().map(RelayId::from_raw).collect()
}

fn flag(on: bool) -> &'static str {
    if on {
        "1"
    } else {
        "0"
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn seed_settings(&self, defaults: &[(&str, &str)]) -> Result<()> {
        let mut pipe = redis::pipe();
        for (key, value) in defaults {
            pipe.cmd("HSETNX").arg(KEY_SETTINGS).arg(*key).arg(*value).ignore();
        }
        pipe.query_async::<()>(&mut self.conn())
            .await
            .context("seed settings")
    }

    async fn settings(&self) -> Result<HashMap<String, String>> {
        redis::cmd("HGETALL")
            .arg(KEY_SETTINGS)
            .query_async(&mut self.conn())
            .await
            .context("load settings")
    }

    async fn is_idle(&self) -> Result<bool> {
        let idle: Option<String> = redis::cmd("GET")
            .arg(KEY_IDLE)
            .query_async(&mut self.conn())
            .await
            .context("read idle flag")?;
        Ok(idle.is_some_and(|v| !v.is_empty()))
    }

    async fn set_idle(&self, idle: bool) -> Result<()> {
        let mut cmd = if idle {
            let mut c = redis::cmd("SET");
            c.arg(KEY_IDLE).arg("1");
            c
        } else {
            let mut c = redis::cmd("DEL");
            c.arg(KEY_IDLE);
            c
        };
        cmd.query_async::<()>(&mut self.conn())
            .await
            .context("write idle flag")
    }

    async fn relay_fields(&self, id: &RelayId) -> Result<HashMap<String, String>> {
        redis::cmd("HGETALL")
            .arg(relay_key(id))
            .query_async(&mut self.conn())
            .await
            .context("load relay")
    }

    async fn set_relay_field(&self, id: &RelayId, field: &str, value: &str) -> Result<()> {
        redis::cmd("HSET")
            .arg(relay_key(id))
            .arg(field)
            .arg(value)
            .query_async::<()>(&mut self.conn())
            .await
            .with_context(|| format!("update relay field {field}"))
    }

    async fn create_relay(
        &self,
        id: &RelayId,
        fields: &[(String, String)],
        active: bool,
    ) -> Result<bool> {
        let url = match fields.iter().find(|(k, _)| k == FIELD_URL) {
            Some((_, url)) => url.clone(),
            None => id.url()?,
        };
        let script = redis::Script::new(CREATE_RELAY_SCRIPT);
        let mut invocation = script.key(relay_key(id));
        invocation
            .key(KEY_KNOWN_RELAYS)
            .key(KEY_ACTIVE_RELAYS)
            .arg(url)
            .arg(id.as_str())
            .arg(flag(active));
        for (k, v) in fields {
            invocation.arg(k).arg(v);
        }
        let created: i64 = invocation
            .invoke_async(&mut self.conn())
            .await
            .context("create relay")?;
        Ok(created == 1)
    }

    async fn set_relay_active(&self, id: &RelayId, active: bool) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(relay_key(id))
            .arg(FIELD_ACTIVE)
            .arg(flag(active))
            .ignore();
        pipe.cmd(if active { "SADD" } else { "SREM" })
            .arg(KEY_ACTIVE_RELAYS)
            .arg(id.as_str())
            .ignore();
        pipe.query_async::<()>(&mut self.conn())
            .await
            .context("set relay active")
    }

    async fn set_relay_always_on(&self, id: &RelayId, always_on: bool) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(relay_key(id))
            .arg("always_on")
            .arg(flag(always_on))
            .ignore();
        pipe.cmd(if always_on { "SADD" } else { "SREM" })
            .arg(KEY_ALWAYS_ON_RELAYS)
            .arg(id.as_str())
            .ignore();
        pipe.query_async::<()>(&mut self.conn())
            .await
            .context("set relay always-on")
    }

    async fn active_relays(&self) -> Result<Vec<RelayId>> {
        let raw: Vec<String> = redis::cmd("SMEMBERS")
            .arg(KEY_ACTIVE_RELAYS)
            .query_async(&mut self.conn())
            .await
            .context("read active relays")?;
        Ok(ids(raw))
    }

    async fn always_on_relays(&self) -> Result<HashSet<RelayId>> {
        let raw: Vec<String> = redis::cmd("SMEMBERS")
            .arg(KEY_ALWAYS_ON_RELAYS)
            .query_async(&mut self.conn())
            .await
            .context("read always-on relays")?;
        Ok(ids(raw).into_iter().collect())
    }

    async fn record_failure(&self, id: &RelayId, record: &str) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.cmd("HINCRBY")
            .arg(KEY_RELAYS_FAIL)
            .arg(id.as_str())
            .arg(1)
            .ignore();
        pipe.cmd("SADD").arg(relay_errors_key(id)).arg(record).ignore();
        pipe.query_async::<()>(&mut self.conn())
            .await
            .context("record relay failure")
    }

    async fn relay_failures(&self) -> Result<HashMap<RelayId, u64>> {
        let raw: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(KEY_RELAYS_FAIL)
            .query_async(&mut self.conn())
            .await
            .context("read relay failures")?;
        Ok(raw
            .into_iter()
            .filter_map(|(id, count)| Some((RelayId::from_raw(id), count.parse::<u64>().ok()?)))
            .collect())
    }

    async fn clear_failures(&self, id: &RelayId) -> Result<()> {
        redis::cmd("HDEL")
            .arg(KEY_RELAYS_FAIL)
            .arg(id.as_str())
            .query_async::<()>(&mut self.conn())
            .await
            .context("clear relay failures")
    }

    async fn touch_connection(&self, id: &RelayId, now: i64) -> Result<()> {
        redis::cmd("ZADD")
            .arg(KEY_CONNECTIONS)
            .arg(now)
            .arg(id.as_str())
            .query_async::<()>(&mut self.conn())
            .await
            .context("touch connection")
    }

    async fn drop_connection(&self, id: &RelayId) -> Result<()> {
        redis::cmd("ZREM")
            .arg(KEY_CONNECTIONS)
            .arg(id.as_str())
            .query_async::<()>(&mut self.conn())
            .await
            .context("drop connection")
    }

    async fn stale_connections(&self, cutoff: i64) -> Result<Vec<RelayId>> {
        let raw: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(KEY_CONNECTIONS)
            .arg("-inf")
            .arg(cutoff)
            .query_async(&mut self.conn())
            .await
            .context("read stale connections")?;
        Ok(ids(raw))
    }

    async fn request_restart(&self, ids: &[RelayId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("SADD");
        cmd.arg(KEY_RESTART_RELAYS);
        for id in ids {
            cmd.arg(id.as_str());
        }
        cmd.query_async::<()>(&mut self.conn())
            .await
            .context("request relay restart")
    }

    async fn restart_requests(&self) -> Result<HashSet<RelayId>> {
        let raw: Vec<String> = redis::cmd("SMEMBERS")
            .arg(KEY_RESTART_RELAYS)
            .query_async(&mut self.conn())
            .await
            .context("read restart requests")?;
        Ok(ids(raw).into_iter().collect())
    }

    async fn clear_restart_requests(&self, ids: &[RelayId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("SREM");
        cmd.arg(KEY_RESTART_RELAYS);
        for id in ids {
            cmd.arg(id.as_str());
        }
        cmd.query_async::<()>(&mut self.conn())
            .await
            .context("clear restart requests")
    }

    async fn lock_events(&self, event_ids: &[String], now: i64, ttl_secs: u64) -> Result<Vec<bool>> {
        if event_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for eid in event_ids {
            pipe.cmd("SET")
                .arg(event_lock_key(eid))
                .arg(now)
                .arg("NX")
                .arg("EX")
                .arg(ttl_secs);
        }
        let replies: Vec<Option<String>> = pipe
            .query_async(&mut self.conn())
            .await
            .context("lock events")?;
        Ok(replies.into_iter().map(|r| r.is_some()).collect())
    }

    async fn lock_events_permanently(&self, event_ids: &[String], now: i64) -> Result<()> {
        if event_ids.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for eid in event_ids {
            pipe.cmd("SET").arg(event_lock_key(eid)).arg(now).ignore();
        }
        pipe.query_async::<()>(&mut self.conn())
            .await
            .context("lock events permanently")
    }

    async fn count_seen(&self, id: &RelayId, event_ids: &[String]) -> Result<()> {
        if event_ids.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.cmd("PFADD").arg(relay_events_hll_key(id)).arg(event_ids).ignore();
        pipe.cmd("INCRBY")
            .arg(KEY_TOTAL_EVENTS)
            .arg(event_ids.len())
            .ignore();
        pipe.query_async::<()>(&mut self.conn())
            .await
            .context("count seen events")
    }

    async fn register_worker(&self, worker_id: &str, now: i64) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SADD")
            .arg(KEY_WORKERS)
            .arg(worker_id)
            .ignore();
        pipe.cmd("HSET")
            .arg(KEY_WORKERS_PING)
            .arg(worker_id)
            .arg(now)
            .ignore();
        pipe.query_async::<()>(&mut self.conn())
            .await
            .context("register worker")
    }

    async fn heartbeat(&self, worker_id: &str, now: i64) -> Result<()> {
        redis::cmd("HSET")
            .arg(KEY_WORKERS_PING)
            .arg(worker_id)
            .arg(now)
            .query_async::<()>(&mut self.conn())
            .await
            .context("worker heartbeat")
    }

    async fn is_worker(&self, worker_id: &str) -> Result<bool> {
        redis::cmd("SISMEMBER")
            .arg(KEY_WORKERS)
            .arg(worker_id)
            .query_async(&mut self.conn())
            .await
            .context("check worker membership")
    }

    async fn workers(&self) -> Result<Vec<String>> {
        redis::cmd("SMEMBERS")
            .arg(KEY_WORKERS)
            .query_async(&mut self.conn())
            .await
            .context("read workers")
    }

    async fn worker_pings(&self) -> Result<HashMap<String, i64>> {
        let raw: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(KEY_WORKERS_PING)
            .query_async(&mut self.conn())
            .await
            .context("read worker pings")?;
        Ok(raw
            .into_iter()
            .filter_map(|(wid, ts)| Some((wid, ts.parse::<i64>().ok()?)))
            .collect())
    }

    async fn purge_worker(&self, worker_id: &str) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HDEL")
            .arg(KEY_WORKERS_PING)
            .arg(worker_id)
            .ignore();
        pipe.cmd("DEL").arg(worker_key(worker_id)).ignore();
        pipe.cmd("SREM").arg(KEY_WORKERS).arg(worker_id).ignore();
        pipe.query_async::<()>(&mut self.conn())
            .await
            .context("purge worker")
    }

    async fn assigned_relays(&self, worker_id: &str) -> Result<Vec<RelayId>> {
        let raw: Vec<String> = redis::cmd("SMEMBERS")
            .arg(worker_key(worker_id))
            .query_async(&mut self.conn())
            .await
            .context("read worker assignment")?;
        Ok(ids(raw))
    }

    async fn save_assignments(&self, assignments: &[(String, Vec<RelayId>)]) -> Result<()> {
        if assignments.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (worker_id, relays) in assignments {
            let key = worker_key(worker_id);
            pipe.cmd("DEL").arg(&key).ignore();
            if !relays.is_empty() {
                pipe.cmd("SADD")
                    .arg(&key)
                    .arg(relays.iter().map(RelayId::as_str).collect::<Vec<_>>())
                    .ignore();
            }
        }
        pipe.query_async::<()>(&mut self.conn())
            .await
            .context("save assignments")
    }

    async fn acquire_lease(&self, now: i64) -> Result<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(KEY_SCHEDULER)
            .arg(now)
            .arg("NX")
            .query_async(&mut self.conn())
            .await
            .context("acquire scheduler lease")?;
        Ok(reply.is_some())
    }

    async fn lease(&self) -> Result<Option<i64>> {
        let raw: Option<String> = redis::cmd("GET")
            .arg(KEY_SCHEDULER)
            .query_async(&mut self.conn())
            .await
            .context("read scheduler lease")?;
        Ok(raw.and_then(|v| v.parse::<i64>().ok()))
    }

    async fn refresh_lease(&self, now: i64) -> Result<()> {
        redis::cmd("SET")
            .arg(KEY_SCHEDULER)
            .arg(now)
            .query_async::<()>(&mut self.conn())
            .await
            .context("refresh scheduler lease")
    }

    async fn release_lease(&self) -> Result<()> {
        redis::cmd("DEL")
            .arg(KEY_SCHEDULER)
            .query_async::<()>(&mut self.conn())
            .await
            .context("release scheduler lease")
    }
}
