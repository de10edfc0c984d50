/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use rand::seq::SliceRandom;
use rand::{rngs::OsRng, Rng, RngCore};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::crawler::{CrawlerPhase, RelayCrawler};
use crate::error::ExitReason;
use crate::queue::EventSink;
use crate::relay::RelayId;
use crate::session::CrawlerHandle;
use crate::settings::Settings;
use crate::store::Store;
use crate::now_secs;

/// What one worker tick changes in the crawler pool.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickPlan {
    pub stop: Vec<RelayId>,
    pub create: Vec<RelayId>,
    pub start: Vec<RelayId>,
    /// Restart requests this worker acted on and may clear.
    pub consumed_restarts: Vec<RelayId>,
}

/// Reconciles the owned crawlers against the assignment.
///
/// `owned` must not contain stopped crawlers. Newly created crawlers are idle and
/// compete for the free slots with the existing idle ones, in shuffled order.
pub fn plan_tick<R: Rng + ?Sized>(
    owned: &HashMap<RelayId, CrawlerPhase>,
    assigned: &[RelayId],
    restarts: &HashSet<RelayId>,
    max_relays: usize,
    rng: &mut R,
) -> TickPlan {
    let assigned_set: HashSet<&RelayId> = assigned.iter().collect();

    let stop: BTreeSet<RelayId> = owned
        .keys()
        .filter(|id| !assigned_set.contains(id) || restarts.contains(*id))
        .cloned()
        .collect();
    let consumed_restarts: BTreeSet<RelayId> = restarts
        .iter()
        .filter(|id| assigned_set.contains(id) || owned.contains_key(*id))
        .cloned()
        .collect();

    let kept = |id: &RelayId| owned.contains_key(id) && !stop.contains(id);
    let mut seen = HashSet::new();
    let create: Vec<RelayId> = assigned
        .iter()
        .filter(|id| !kept(*id) && seen.insert(*id))
        .cloned()
        .collect();

    let running = owned
        .iter()
        .filter(|(id, phase)| kept(*id) && phase.is_running())
        .count();
    let capacity = max_relays.saturating_sub(running);

    let mut eligible: Vec<RelayId> = owned
        .iter()
        .filter(|(id, phase)| kept(*id) && **phase == CrawlerPhase::Idle)
        .map(|(id, _)| id.clone())
        .chain(create.iter().cloned())
        .collect();
    eligible.sort();
    eligible.shuffle(rng);
    eligible.truncate(capacity);

    TickPlan {
        stop: stop.into_iter().collect(),
        create,
        start: eligible,
        consumed_restarts: consumed_restarts.into_iter().collect(),
    }
}

pub fn new_worker_id() -> String {
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    hex::encode(b)
}

pub struct Worker {
    id: String,
    store: Arc<dyn Store>,
    sink: Arc<dyn EventSink>,
    settings: Arc<Settings>,
    config: Config,
    crawlers: HashMap<RelayId, CrawlerHandle>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn Store>,
        sink: Arc<dyn EventSink>,
        settings: Arc<Settings>,
        config: Config,
    ) -> Self {
        Self {
            id: new_worker_id(),
            store,
            sink,
            settings,
            config,
            crawlers: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Relay ids this worker holds a crawler for, with their phases.
    pub fn crawlers(&self) -> HashMap<RelayId, CrawlerPhase> {
        self.crawlers
            .iter()
            .map(|(id, h)| (id.clone(), h.phase()))
            .collect()
    }

    pub async fn check_in(&self) -> anyhow::Result<()> {
        self.store.register_worker(&self.id, now_secs()).await?;
        info!(worker = %self.id, "worker registered");
        Ok(())
    }

    /// One reconciliation pass. `Some` means the worker must shut down.
    pub async fn tick(&mut self) -> Option<ExitReason> {
        let now = now_secs();
        if let Err(e) = self.store.heartbeat(&self.id, now).await {
            warn!(worker = %self.id, "heartbeat failed: {e:#}");
        }
        match self.store.is_worker(&self.id).await {
            Ok(false) => return Some(ExitReason::Deregistered),
            Ok(true) => {}
            Err(e) => warn!(worker = %self.id, "membership check failed: {e:#}"),
        }
        match self.store.is_idle().await {
            Ok(true) => return Some(ExitReason::Idle),
            Ok(false) => {}
            Err(e) => warn!(worker = %self.id, "idle check failed: {e:#}"),
        }

        let assigned = match self.store.assigned_relays(&self.id).await {
            Ok(assigned) => assigned,
            Err(e) => {
                warn!(worker = %self.id, "read assignment failed: {e:#}");
                return None;
            }
        };
        let restarts = self.store.restart_requests().await.unwrap_or_else(|e| {
            warn!(worker = %self.id, "read restart requests failed: {e:#}");
            HashSet::new()
        });

        // single-use crawlers: a stopped one is replaced below if still assigned
        self.crawlers.retain(|_, h| h.phase() != CrawlerPhase::Stopped);

        let plan = plan_tick(
            &self.crawlers(),
            &assigned,
            &restarts,
            self.settings.worker_max_relays,
            &mut rand::thread_rng(),
        );
        self.apply(plan).await;
        None
    }

    async fn apply(&mut self, plan: TickPlan) {
        let grace = self.config.stop_grace;
        let mut stopping: Vec<CrawlerHandle> = plan
            .stop
            .iter()
            .filter_map(|id| self.crawlers.remove(id))
            .collect();
        join_all(stopping.iter_mut().map(|h| h.stop(grace))).await;

        if let Err(e) = self.store.clear_restart_requests(&plan.consumed_restarts).await {
            warn!(worker = %self.id, "clear restart requests failed: {e:#}");
        }

        for id in plan.create {
            let crawler = RelayCrawler::new(
                id.clone(),
                self.store.clone(),
                self.sink.clone(),
                self.settings.clone(),
            );
            self.crawlers.insert(id, CrawlerHandle::new(crawler));
        }
        for id in &plan.start {
            if let Some(handle) = self.crawlers.get_mut(id) {
                handle.start();
            }
        }
        debug!(
            worker = %self.id,
            stopped = plan.stop.len(),
            started = plan.start.len(),
            owned = self.crawlers.len(),
            "tick"
        );
    }

    /// Ticks until the shutdown signal fires or a tick asks to exit, then stops.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> ExitReason {
        let mut tick = tokio::time::interval(self.settings.worker_main_loop_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break ExitReason::Shutdown;
                    }
                }
                _ = tick.tick() => {
                    if let Some(reason) = self.tick().await {
                        break reason;
                    }
                }
            }
        };
        info!(worker = %self.id, %reason, "worker stopping");
        self.stop().await;
        reason
    }

    /// Stops every crawler and removes the worker's records.
    pub async fn stop(&mut self) {
        let grace = self.config.stop_grace;
        let mut handles: Vec<CrawlerHandle> = self.crawlers.drain().map(|(_, h)| h).collect();
        join_all(handles.iter_mut().map(|h| h.stop(grace))).await;
        if let Err(e) = self.store.purge_worker(&self.id).await {
            warn!(worker = %self.id, "deregister failed: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use crate::queue::MemorySink;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn id(n: u8) -> RelayId {
        RelayId::from_url(&format!("wss://r{n}.example"))
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn unassigned_and_restarted_crawlers_stop() {
        let owned = HashMap::from([
            (id(1), CrawlerPhase::Active),
            (id(2), CrawlerPhase::Active),
            (id(3), CrawlerPhase::Idle),
        ]);
        let restarts = HashSet::from([id(2), id(9)]);
        let plan = plan_tick(&owned, &[id(2), id(3), id(4)], &restarts, 10, &mut rng());

        let mut expected_stop = vec![id(1), id(2)];
        expected_stop.sort();
        assert_eq!(plan.stop, expected_stop);
        assert_eq!(plan.consumed_restarts, vec![id(2)]);
        assert_eq!(plan.create, vec![id(2), id(4)]);

        let mut started = plan.start.clone();
        started.sort();
        let mut expected_start = vec![id(2), id(3), id(4)];
        expected_start.sort();
        assert_eq!(started, expected_start);
    }

    #[test]
    fn starts_are_capped_by_running_crawlers() {
        let owned = HashMap::from([
            (id(1), CrawlerPhase::Active),
            (id(2), CrawlerPhase::Starting),
        ]);
        let assigned: Vec<RelayId> = (1..=6).map(id).collect();
        let plan = plan_tick(&owned, &assigned, &HashSet::new(), 3, &mut rng());

        assert!(plan.stop.is_empty());
        assert_eq!(plan.create.len(), 4);
        assert_eq!(plan.start.len(), 1);
        assert!(plan.create.contains(&plan.start[0]));
    }

    #[test]
    fn full_worker_starts_nothing() {
        let owned = HashMap::from([(id(1), CrawlerPhase::Active), (id(2), CrawlerPhase::Idle)]);
        let plan = plan_tick(&owned, &[id(1), id(2)], &HashSet::new(), 1, &mut rng());
        assert_eq!(plan, TickPlan::default());
    }

    #[test]
    fn worker_ids_are_random_hex() {
        let a = new_worker_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, new_worker_id());
    }

    fn worker(store: Arc<MemoryStore>) -> Worker {
        let settings = Settings::default();
        Worker::new(store, Arc::new(MemorySink::new()), Arc::new(settings), Config::default())
    }

    #[tokio::test]
    async fn deregistered_worker_exits() {
        let store = Arc::new(MemoryStore::new());
        let mut w = worker(store.clone());
        w.check_in().await.unwrap();
        assert_eq!(w.tick().await, None);

        store.purge_worker(w.id()).await.unwrap();
        assert_eq!(w.tick().await, Some(ExitReason::Deregistered));
    }

    #[tokio::test]
    async fn idle_flag_stops_worker() {
        let store = Arc::new(MemoryStore::new());
        let mut w = worker(store.clone());
        w.check_in().await.unwrap();
        store.set_idle(true).await.unwrap();
        assert_eq!(w.tick().await, Some(ExitReason::Idle));
    }

    #[tokio::test]
    async fn stop_removes_worker_records() {
        let store = Arc::new(MemoryStore::new());
        let mut w = worker(store.clone());
        w.check_in().await.unwrap();
        w.stop().await;
        assert!(!store.is_worker(w.id()).await.unwrap());
        assert!(store.worker_pings().await.unwrap().is_empty());
    }
}
