/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Singleton control loop: lease, eviction, restarts and relay rebalancing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::ExitReason;
use crate::now_secs;
use crate::relay::RelayId;
use crate::settings::Settings;
use crate::store::Store;

/// A lease is held while its holder ticked within the last five intervals.
pub fn lease_is_fresh(held_at: i64, now: i64, tick: Duration) -> bool {
    let age_ms = now.saturating_sub(held_at).saturating_mul(1000);
    (age_ms as i128) < 5 * tick.as_millis() as i128
}

/// Relays to deactivate: at or over the fail threshold, active and not always-on.
pub fn relays_to_evict(
    failures: &HashMap<RelayId, u64>,
    active: &HashSet<RelayId>,
    always_on: &HashSet<RelayId>,
    threshold: u64,
) -> Vec<RelayId> {
    let mut evict: Vec<RelayId> = failures
        .iter()
        .filter(|(id, count)| **count >= threshold && active.contains(*id) && !always_on.contains(*id))
        .map(|(id, _)| id.clone())
        .collect();
    evict.sort();
    evict
}

/// Splits known workers into live and dead.
///
/// Live means registered and pinged less than `max_latency` seconds ago. Heartbeats
/// left behind by unregistered workers count as dead so they get cleaned up.
pub fn partition_workers(
    members: &[String],
    pings: &HashMap<String, i64>,
    now: i64,
    max_latency: i64,
) -> (Vec<String>, Vec<String>) {
    let mut live = Vec::new();
    let mut dead = Vec::new();
    for wid in members {
        match pings.get(wid) {
            Some(ts) if now.saturating_sub(*ts) < max_latency => live.push(wid.clone()),
            _ => dead.push(wid.clone()),
        }
    }
    let mut orphans: Vec<String> = pings
        .keys()
        .filter(|wid| !members.contains(wid))
        .cloned()
        .collect();
    orphans.sort();
    dead.extend(orphans);
    live.sort();
    dead.sort();
    dead.dedup();
    (live, dead)
}

/// What to do with stale liveness records and pending restart requests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RestartPlan {
    /// Stale active relays to restart.
    pub restart: Vec<RelayId>,
    /// Stale records of inactive relays, which no crawler will ever refresh.
    pub forget: Vec<RelayId>,
    /// Pending restart requests for inactive relays, which no worker will consume.
    pub cancel: Vec<RelayId>,
}

pub fn plan_restarts(
    stale: &[RelayId],
    active: &HashSet<RelayId>,
    pending: &HashSet<RelayId>,
) -> RestartPlan {
    let (mut restart, mut forget): (Vec<RelayId>, Vec<RelayId>) =
        stale.iter().cloned().partition(|id| active.contains(id));
    let mut cancel: Vec<RelayId> = pending
        .iter()
        .filter(|id| !active.contains(*id))
        .cloned()
        .collect();
    restart.sort();
    restart.dedup();
    forget.sort();
    forget.dedup();
    cancel.sort();
    RestartPlan {
        restart,
        forget,
        cancel,
    }
}

/// Levels relay assignments across workers in one pass.
///
/// Worker quotas are `r / w`, plus one for the `r % w` workers currently holding the
/// most relays, so counts differ by at most one. Workers keep what they hold up to
/// their quota; the excess (taken from the tail) and unassigned relays fill the
/// workers under quota. Relays no longer in `relays`, or held twice, are dropped.
pub fn rebalance(
    current: &[(String, Vec<RelayId>)],
    relays: &[RelayId],
) -> Vec<(String, Vec<RelayId>)> {
    if current.is_empty() {
        return Vec::new();
    }
    let mut unique = HashSet::new();
    let relays: Vec<&RelayId> = relays.iter().filter(|id| unique.insert(*id)).collect();

    let mut held: HashSet<&RelayId> = HashSet::new();
    let mut next: Vec<(String, Vec<RelayId>)> = current
        .iter()
        .map(|(wid, ids)| {
            let kept = ids
                .iter()
                .filter(|id| unique.contains(id) && held.insert(*id))
                .cloned()
                .collect();
            (wid.clone(), kept)
        })
        .collect();

    let workers = next.len();
    let base = relays.len() / workers;
    let extra = relays.len() % workers;
    let mut by_load: Vec<usize> = (0..workers).collect();
    by_load.sort_by(|a, b| next[*b].1.len().cmp(&next[*a].1.len()));
    let mut quota = vec![base; workers];
    for &i in by_load.iter().take(extra) {
        quota[i] += 1;
    }

    let mut pool: VecDeque<RelayId> = VecDeque::new();
    for (i, (_, ids)) in next.iter_mut().enumerate() {
        if ids.len() > quota[i] {
            pool.extend(ids.drain(quota[i]..));
        }
    }
    pool.extend(relays.iter().filter(|id| !held.contains(*id)).map(|id| (*id).clone()));

    for (i, (_, ids)) in next.iter_mut().enumerate() {
        while ids.len() < quota[i] {
            match pool.pop_front() {
                Some(id) => ids.push(id),
                None => break,
            }
        }
    }
    next
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    settings: Arc<Settings>,
    config: Config,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, settings: Arc<Settings>, config: Config) -> Self {
        Self {
            store,
            settings,
            config,
        }
    }

    /// Takes the lease, replacing a stale one, then checks the idle flag.
    ///
    /// Fails with [`ExitReason::AlreadyRunning`] when another scheduler holds a fresh
    /// lease and with [`ExitReason::Idle`] when the idle flag is set. An idle exit
    /// gives the lease back.
    pub async fn check_in(&self) -> anyhow::Result<()> {
        self.take_lease(now_secs()).await?;
        if self.store.is_idle().await? {
            self.stop().await;
            return Err(ExitReason::Idle.into());
        }
        Ok(())
    }

    async fn take_lease(&self, now: i64) -> anyhow::Result<()> {
        if self.store.acquire_lease(now).await? {
            info!("scheduler lease acquired");
            return Ok(());
        }
        if let Some(held_at) = self.store.lease().await? {
            if lease_is_fresh(held_at, now, self.settings.scheduler_main_loop_interval) {
                return Err(ExitReason::AlreadyRunning.into());
            }
            warn!(held_at, "taking over stale scheduler lease");
        }
        self.store.release_lease().await?;
        if !self.store.acquire_lease(now).await? {
            return Err(ExitReason::AlreadyRunning.into());
        }
        info!("scheduler lease acquired");
        Ok(())
    }

    /// One control pass. `Some` means the scheduler must exit.
    pub async fn tick(&self, now: i64) -> Option<ExitReason> {
        if let Err(e) = self.store.refresh_lease(now).await {
            warn!("lease refresh failed: {e:#}");
        }
        match self.store.is_idle().await {
            Ok(true) => return Some(ExitReason::Idle),
            Ok(false) => {}
            Err(e) => warn!("idle check failed: {e:#}"),
        }

        self.evict_failing().await;
        self.restart_stale(now).await;
        let live = self.cleanup_workers(now).await;
        if live.is_empty() {
            debug!("no live workers");
            return None;
        }
        self.rebalance(&live).await;
        None
    }

    async fn evict_failing(&self) {
        let (failures, active, always_on) = match tokio::try_join!(
            self.store.relay_failures(),
            self.store.active_relays(),
            self.store.always_on_relays(),
        ) {
            Ok(v) => v,
            Err(e) => {
                warn!("read failure state failed: {e:#}");
                return;
            }
        };
        let active: HashSet<RelayId> = active.into_iter().collect();
        let threshold = self.settings.scheduler_fails_count_threshold;
        for id in relays_to_evict(&failures, &active, &always_on, threshold) {
            match self.store.set_relay_active(&id, false).await {
                Ok(()) => info!(relay = %id, fails = failures.get(&id).copied().unwrap_or_default(), "relay evicted"),
                Err(e) => warn!(relay = %id, "evict failed: {e:#}"),
            }
        }
    }

    async fn restart_stale(&self, now: i64) {
        let cutoff = now - self.config.connection_ttl;
        let (stale, active, pending) = match tokio::try_join!(
            self.store.stale_connections(cutoff),
            self.store.active_relays(),
            self.store.restart_requests(),
        ) {
            Ok(v) => v,
            Err(e) => {
                warn!("read stale connections failed: {e:#}");
                return;
            }
        };
        let active: HashSet<RelayId> = active.into_iter().collect();
        let plan = plan_restarts(&stale, &active, &pending);

        for id in &plan.forget {
            if let Err(e) = self.store.drop_connection(id).await {
                warn!(relay = %id, "drop liveness record failed: {e:#}");
            }
        }
        if let Err(e) = self.store.clear_restart_requests(&plan.cancel).await {
            warn!("clear restart requests failed: {e:#}");
        }
        if plan.restart.is_empty() {
            return;
        }
        info!(count = plan.restart.len(), "requesting restart of stale relays");
        if let Err(e) = self.store.request_restart(&plan.restart).await {
            warn!("request restart failed: {e:#}");
        }
    }

    async fn cleanup_workers(&self, now: i64) -> Vec<String> {
        let (members, pings) = match tokio::try_join!(self.store.workers(), self.store.worker_pings()) {
            Ok(v) => v,
            Err(e) => {
                warn!("read workers failed: {e:#}");
                return Vec::new();
            }
        };
        let (live, dead) = partition_workers(
            &members,
            &pings,
            now,
            self.settings.scheduler_max_worker_latency,
        );
        for wid in dead {
            match self.store.purge_worker(&wid).await {
                Ok(()) => info!(worker = %wid, "purged dead worker"),
                Err(e) => warn!(worker = %wid, "purge failed: {e:#}"),
            }
        }
        live
    }

    async fn rebalance(&self, live: &[String]) {
        let relays = match self.store.active_relays().await {
            Ok(relays) => relays,
            Err(e) => {
                warn!("read active relays failed: {e:#}");
                return;
            }
        };
        let mut current = Vec::with_capacity(live.len());
        for wid in live {
            match self.store.assigned_relays(wid).await {
                Ok(ids) => current.push((wid.clone(), ids)),
                Err(e) => {
                    warn!(worker = %wid, "read assignment failed: {e:#}");
                    return;
                }
            }
        }
        let next = rebalance(&current, &relays);
        if next == current {
            return;
        }
        match self.store.save_assignments(&next).await {
            Ok(()) => debug!(workers = next.len(), relays = relays.len(), "assignments saved"),
            Err(e) => warn!("save assignments failed: {e:#}"),
        }
    }

    /// Ticks until shutdown or an exit condition, then releases the lease.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> ExitReason {
        let mut tick = tokio::time::interval(self.settings.scheduler_main_loop_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break ExitReason::Shutdown;
                    }
                }
                _ = tick.tick() => {
                    if let Some(reason) = self.tick(now_secs()).await {
                        break reason;
                    }
                }
            }
        };
        info!(%reason, "scheduler stopping");
        self.stop().await;
        reason
    }

    pub async fn stop(&self) {
        if let Err(e) = self.store.release_lease().await {
            warn!("release lease failed: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;

    fn id(n: usize) -> RelayId {
        RelayId::from_url(&format!("wss://r{n}.example"))
    }

    fn counts(assignments: &[(String, Vec<RelayId>)]) -> Vec<usize> {
        assignments.iter().map(|(_, ids)| ids.len()).collect()
    }

    fn empty_workers(n: usize) -> Vec<(String, Vec<RelayId>)> {
        (0..n).map(|i| (format!("w{i}"), Vec::new())).collect()
    }

    fn assert_exact_cover(assignments: &[(String, Vec<RelayId>)], relays: &[RelayId]) {
        let mut all: Vec<RelayId> = assignments.iter().flat_map(|(_, ids)| ids.clone()).collect();
        all.sort();
        let mut expected = relays.to_vec();
        expected.sort();
        assert_eq!(all, expected);
    }

    #[test]
    fn ten_relays_over_three_workers() {
        let relays: Vec<RelayId> = (0..10).map(id).collect();
        let next = rebalance(&empty_workers(3), &relays);
        assert_eq!(counts(&next), vec![4, 3, 3]);
        assert_exact_cover(&next, &relays);
    }

    #[test]
    fn rebalance_converges_in_one_pass() {
        for workers in 1..6 {
            for r in 0..23 {
                let relays: Vec<RelayId> = (0..r).map(id).collect();
                // skewed start: everything on the first worker, plus a gone relay
                let mut current = empty_workers(workers);
                current[0].1 = relays.clone();
                current[0].1.push(id(999));
                let next = rebalance(&current, &relays);

                let c = counts(&next);
                let max = c.iter().max().copied().unwrap_or(0);
                let min = c.iter().min().copied().unwrap_or(0);
                assert!(max - min <= 1, "w={workers} r={r} counts={c:?}");
                assert_exact_cover(&next, &relays);
            }
        }
    }

    #[test]
    fn balanced_assignment_is_left_alone() {
        let relays: Vec<RelayId> = (0..4).map(id).collect();
        let current = vec![
            ("a".to_string(), vec![id(0), id(1)]),
            ("b".to_string(), vec![id(2), id(3)]),
        ];
        assert_eq!(rebalance(&current, &relays), current);
    }

    #[test]
    fn new_worker_only_takes_excess() {
        let relays: Vec<RelayId> = (0..4).map(id).collect();
        let current = vec![
            ("a".to_string(), vec![id(0), id(1), id(2), id(3)]),
            ("b".to_string(), Vec::new()),
        ];
        let next = rebalance(&current, &relays);
        assert_eq!(next[0].1, vec![id(0), id(1)]);
        assert_eq!(next[1].1, vec![id(2), id(3)]);
    }

    #[test]
    fn duplicates_across_workers_collapse() {
        let relays = vec![id(0), id(1)];
        let current = vec![
            ("a".to_string(), vec![id(0)]),
            ("b".to_string(), vec![id(0)]),
        ];
        let next = rebalance(&current, &relays);
        assert_eq!(next[0].1, vec![id(0)]);
        assert_eq!(next[1].1, vec![id(1)]);
    }

    #[test]
    fn eviction_spares_always_on_and_inactive() {
        let failures = HashMap::from([(id(1), 5), (id(2), 9), (id(3), 4), (id(4), 7)]);
        let active = HashSet::from([id(1), id(2), id(3)]);
        let always_on = HashSet::from([id(2)]);
        assert_eq!(relays_to_evict(&failures, &active, &always_on, 5), vec![id(1)]);
    }

    #[test]
    fn workers_split_by_heartbeat_age() {
        let members = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let pings = HashMap::from([
            ("a".to_string(), 990),
            ("b".to_string(), 880),
            ("z".to_string(), 999),
        ]);
        let (live, dead) = partition_workers(&members, &pings, 1000, 120);
        assert_eq!(live, vec!["a".to_string()]);
        assert_eq!(dead, vec!["b".to_string(), "c".to_string(), "z".to_string()]);
    }

    #[test]
    fn corrupt_heartbeat_counts_as_dead() {
        let members = vec!["a".to_string(), "b".to_string()];
        let pings = HashMap::from([("a".to_string(), i64::MIN), ("b".to_string(), i64::MAX)]);
        let (live, dead) = partition_workers(&members, &pings, 1000, 120);
        assert_eq!(live, vec!["b".to_string()]);
        assert_eq!(dead, vec!["a".to_string()]);
    }

    #[test]
    fn stale_records_of_inactive_relays_are_dropped() {
        let active = HashSet::from([id(1), id(2)]);
        let pending = HashSet::from([id(2), id(3)]);
        let plan = plan_restarts(&[id(1), id(4), id(1)], &active, &pending);
        assert_eq!(
            plan,
            RestartPlan {
                restart: vec![id(1)],
                forget: vec![id(4)],
                cancel: vec![id(3)],
            }
        );
    }

    #[test]
    fn lease_freshness() {
        let tick = Duration::from_secs(3);
        assert!(lease_is_fresh(100, 114, tick));
        assert!(!lease_is_fresh(100, 115, tick));
    }

    fn scheduler(store: Arc<MemoryStore>) -> Scheduler {
        Scheduler::new(store, Arc::new(Settings::default()), Config::default())
    }

    #[tokio::test]
    async fn fresh_lease_blocks_second_scheduler() {
        let store = Arc::new(MemoryStore::new());
        store.acquire_lease(now_secs()).await.unwrap();
        let err = scheduler(store).check_in().await.unwrap_err();
        assert_eq!(err.downcast_ref::<ExitReason>(), Some(&ExitReason::AlreadyRunning));
    }

    #[tokio::test]
    async fn duplicate_scheduler_fails_even_when_idle() {
        let store = Arc::new(MemoryStore::new());
        store.acquire_lease(now_secs()).await.unwrap();
        store.set_idle(true).await.unwrap();
        let err = scheduler(store).check_in().await.unwrap_err();
        assert_eq!(err.downcast_ref::<ExitReason>(), Some(&ExitReason::AlreadyRunning));
    }

    #[tokio::test]
    async fn idle_check_in_gives_the_lease_back() {
        let store = Arc::new(MemoryStore::new());
        store.set_idle(true).await.unwrap();
        let err = scheduler(store.clone()).check_in().await.unwrap_err();
        assert_eq!(err.downcast_ref::<ExitReason>(), Some(&ExitReason::Idle));
        assert_eq!(store.lease().await.unwrap(), None);
    }

    #[tokio::test]
    async fn tick_forgets_stale_inactive_relays() {
        let store = Arc::new(MemoryStore::new());
        let s = scheduler(store.clone());
        let now = 10_000;

        store.touch_connection(&id(5), now - 600).await.unwrap();
        store.request_restart(&[id(5)]).await.unwrap();
        assert_eq!(s.tick(now).await, None);

        assert_eq!(store.stale_connections(now).await.unwrap(), Vec::<RelayId>::new());
        assert!(store.restart_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_lease_is_taken_over() {
        let store = Arc::new(MemoryStore::new());
        store.acquire_lease(now_secs() - 3600).await.unwrap();
        scheduler(store.clone()).check_in().await.unwrap();
        assert!(store.lease().await.unwrap().unwrap() > now_secs() - 60);
    }

    #[tokio::test]
    async fn tick_evicts_restarts_and_assigns() {
        let store = Arc::new(MemoryStore::new());
        let s = scheduler(store.clone());
        let now = 10_000;

        for n in 0..3 {
            store.set_relay_active(&id(n), true).await.unwrap();
        }
        store.set_relay_always_on(&id(2), true).await.unwrap();
        for _ in 0..5 {
            store.record_failure(&id(0), "{}").await.unwrap();
            store.record_failure(&id(2), "{}").await.unwrap();
        }
        store.touch_connection(&id(1), now - 61).await.unwrap();
        store.register_worker("live", now - 1).await.unwrap();
        store.register_worker("dead", now - 500).await.unwrap();

        assert_eq!(s.tick(now).await, None);

        assert_eq!(store.active_relays().await.unwrap(), {
            let mut v = vec![id(1), id(2)];
            v.sort();
            v
        });
        assert!(store.restart_requests().await.unwrap().contains(&id(1)));
        assert_eq!(store.workers().await.unwrap(), vec!["live".to_string()]);
        assert_eq!(store.assigned_relays("live").await.unwrap().len(), 2);
        assert_eq!(store.lease().await.unwrap(), Some(now));
    }

    #[tokio::test]
    async fn idle_flag_ends_the_loop() {
        let store = Arc::new(MemoryStore::new());
        store.set_idle(true).await.unwrap();
        assert_eq!(scheduler(store).tick(1).await, Some(ExitReason::Idle));
    }
}
