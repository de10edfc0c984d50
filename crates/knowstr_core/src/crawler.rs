/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Per-relay crawl state machine.
//!
//! [`RelayCrawler`] does not own the socket. The session driver feeds it
//! [`SessionEvent`]s in arrival order and writes out whatever the crawler queued in
//! its outbox, so the whole protocol can be exercised without a network.

use std::sync::Arc;
use std::time::Duration;

use knowstr_protocol::{extract_relays, ClientMessage, Event, RelayMessage};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::failure::{CrawlFailure, CLOSE_CODE_GO_AWAY};
use crate::queue::{publish_batch, EventSink};
use crate::relay::{
    new_relay_fields, Relay, RelayId, CURSOR_EXHAUSTED, CURSOR_NOT_STARTED, FIELD_CURSOR, FIELD_IP,
    FIELD_SHOULD_LOAD_PAST,
};
use crate::settings::Settings;
use crate::store::Store;

pub const SUB_FUTURE: &str = "FUTURE";
pub const SUB_PAST_PREFIX: &str = "PAST_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlerPhase {
    Idle,
    Starting,
    Active,
    Stopping,
    Stopped,
}

impl CrawlerPhase {
    /// Counts against the worker's concurrency cap.
    pub fn is_running(self) -> bool {
        matches!(self, CrawlerPhase::Starting | CrawlerPhase::Active)
    }
}

/// Everything that can happen to a crawler's session.
#[derive(Debug)]
pub enum SessionEvent {
    /// The HTTP upgrade succeeded; carries the peer address when known.
    Upgraded { ip: Option<String> },
    Open,
    Frame(String),
    PeerPing(Vec<u8>),
    Keepalive,
    FlushTick,
    WatchdogExpired,
    Closed { code: Option<u16>, reason: String },
    Failed(CrawlFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

pub struct RelayCrawler {
    id: RelayId,
    store: Arc<dyn Store>,
    sink: Arc<dyn EventSink>,
    settings: Arc<Settings>,
    relay: Option<Relay>,
    phase: watch::Sender<CrawlerPhase>,
    page: Vec<Event>,
    future: Vec<Event>,
    outbox: Vec<Outbound>,
    watchdog: Option<Instant>,
    cancel: CancellationToken,
}

impl RelayCrawler {
    pub fn new(
        id: RelayId,
        store: Arc<dyn Store>,
        sink: Arc<dyn EventSink>,
        settings: Arc<Settings>,
    ) -> Self {
        let (phase, _) = watch::channel(CrawlerPhase::Idle);
        Self {
            id,
            store,
            sink,
            settings,
            relay: None,
            phase,
            page: Vec::new(),
            future: Vec::new(),
            outbox: Vec::new(),
            watchdog: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &RelayId {
        &self.id
    }

    pub fn relay(&self) -> Option<&Relay> {
        self.relay.as_ref()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Token that stops the session, including any delay or publish in progress.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> CrawlerPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CrawlerPhase> {
        self.phase.subscribe()
    }

    pub fn set_phase(&self, phase: CrawlerPhase) {
        self.phase.send_replace(phase);
    }

    pub fn watchdog(&self) -> Option<Instant> {
        self.watchdog
    }

    pub fn drain_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    fn url(&self) -> &str {
        self.relay
            .as_ref()
            .map_or(self.id.as_str(), |r| r.url.as_str())
    }

    /// Reads the relay's stored fields merged over the configured defaults.
    pub async fn load(&mut self) -> anyhow::Result<&Relay> {
        let stored = self.store.relay_fields(&self.id).await?;
        let relay = Relay::from_fields(self.id.clone(), &stored, &self.settings.relay_defaults)?;
        Ok(self.relay.insert(relay))
    }

    pub async fn handle(&mut self, now: i64, event: SessionEvent) -> Flow {
        if self.relay.is_none() {
            return Flow::Stop;
        }
        match event {
            SessionEvent::Upgraded { ip } => {
                if let Some(ip) = ip {
                    self.record_ip(ip).await;
                }
                Flow::Continue
            }
            SessionEvent::Open => self.on_open(now).await,
            SessionEvent::Frame(text) => self.on_frame(now, &text).await,
            SessionEvent::PeerPing(payload) => {
                self.outbox.push(Outbound::Pong(payload));
                self.arm_watchdog();
                Flow::Continue
            }
            SessionEvent::Keepalive => self.on_keepalive(now).await,
            SessionEvent::FlushTick => self.flush_future(now).await,
            SessionEvent::WatchdogExpired => {
                warn!(relay = %self.url(), "relay stopped pinging");
                Flow::Stop
            }
            SessionEvent::Closed { code, reason } => match code {
                Some(code) if code == CLOSE_CODE_GO_AWAY => {
                    self.fail(CrawlFailure::ForcedClose { code, reason }).await
                }
                _ => {
                    info!(relay = %self.url(), ?code, "connection closed");
                    Flow::Stop
                }
            },
            SessionEvent::Failed(failure) => self.fail(failure).await,
        }
    }

    /// Cleanup run once the session is over: drops the liveness record and
    /// persists the cursor if it moved.
    pub async fn finish(&mut self) {
        self.set_phase(CrawlerPhase::Stopping);
        self.watchdog = None;
        if let Err(e) = self.store.drop_connection(&self.id).await {
            warn!(relay = %self.url(), "drop liveness record failed: {e:#}");
        }
        self.persist_cursor().await;
        self.page.clear();
        self.future.clear();
        self.outbox.clear();
        self.set_phase(CrawlerPhase::Stopped);
    }

    async fn record_ip(&mut self, ip: String) {
        if let Err(e) = self.store.set_relay_field(&self.id, FIELD_IP, &ip).await {
            warn!(relay = %self.url(), "store peer ip failed: {e:#}");
        }
        if let Some(relay) = self.relay.as_mut() {
            relay.ip = Some(ip);
        }
    }

    async fn on_open(&mut self, now: i64) -> Flow {
        let Some(relay) = self.relay.as_ref() else {
            return Flow::Stop;
        };
        if !relay.has_work() {
            info!(relay = %relay.url, "nothing to load, deactivating");
            if let Err(e) = self.store.set_relay_active(&self.id, false).await {
                warn!(relay = %relay.url, "deactivate failed: {e:#}");
            }
            return Flow::Stop;
        }
        let future = relay
            .should_load_future
            .then(|| relay.future_filters_since(now));
        let past = relay.should_load_past && relay.cursor() != CURSOR_EXHAUSTED;

        self.set_phase(CrawlerPhase::Active);
        if let Err(e) = self.store.touch_connection(&self.id, now).await {
            warn!(relay = %self.url(), "liveness refresh failed: {e:#}");
        }
        if let Some(filters) = future {
            self.send(ClientMessage::req(SUB_FUTURE, filters));
        }
        if past {
            self.request_past(now);
        }
        debug!(relay = %self.url(), "subscriptions sent");
        Flow::Continue
    }

    async fn on_frame(&mut self, now: i64, text: &str) -> Flow {
        let msg = match RelayMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(relay = %self.url(), "discarding frame: {e}");
                return Flow::Continue;
            }
        };
        match msg {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                let delay = self.relay.as_ref().map(|r| r.event_delay).unwrap_or_default();
                if !self.pause(delay).await {
                    return Flow::Stop;
                }
                if subscription_id == SUB_FUTURE {
                    self.future.push(event);
                } else {
                    self.page.push(event);
                }
                Flow::Continue
            }
            RelayMessage::Eose { subscription_id } => {
                let requested = subscription_id
                    .strip_prefix(SUB_PAST_PREFIX)
                    .and_then(|t| t.parse::<i64>().ok());
                match requested {
                    Some(requested) => self.on_past_eose(now, &subscription_id, requested).await,
                    None => Flow::Continue,
                }
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                self.fail(CrawlFailure::SubscriptionClosed {
                    subscription_id,
                    message,
                })
                .await
            }
            RelayMessage::Notice { message } => {
                debug!(relay = %self.url(), %message, "notice");
                Flow::Continue
            }
            RelayMessage::Ok | RelayMessage::Count | RelayMessage::Auth => {
                trace!(relay = %self.url(), "ignoring control frame");
                Flow::Continue
            }
            RelayMessage::Unknown { command } => self.fail(CrawlFailure::UnknownMessage(command)).await,
        }
    }

    async fn on_past_eose(&mut self, now: i64, subscription_id: &str, requested: i64) -> Flow {
        self.send(ClientMessage::close(subscription_id));
        let page = std::mem::take(&mut self.page);
        if !self.process_batch(now, &page).await {
            return Flow::Stop;
        }
        let page_min = page.iter().map(|e| e.created_at).min();

        let Some(relay) = self.relay.as_mut() else {
            return Flow::Stop;
        };
        let cursor = next_cursor(relay.cursor(), requested, page_min);
        relay.set_cursor(cursor);
        if cursor == CURSOR_EXHAUSTED {
            if relay.should_load_past_again {
                info!(relay = %relay.url, "backlog exhausted, reloading from now");
                relay.set_cursor(now);
            } else {
                info!(relay = %relay.url, "backlog exhausted");
                relay.should_load_past = false;
                if let Err(e) = self
                    .store
                    .set_relay_field(&self.id, FIELD_SHOULD_LOAD_PAST, "0")
                    .await
                {
                    warn!(relay = %self.url(), "disable past loading failed: {e:#}");
                }
                self.persist_cursor().await;
                return Flow::Continue;
            }
        }

        let delay = relay.eose_delay;
        if !self.pause(delay).await {
            return Flow::Stop;
        }
        self.request_past(now);
        Flow::Continue
    }

    async fn on_keepalive(&mut self, now: i64) -> Flow {
        self.outbox.push(Outbound::Ping(now.to_be_bytes().to_vec()));
        if let Err(e) = self.store.touch_connection(&self.id, now).await {
            warn!(relay = %self.url(), "liveness refresh failed: {e:#}");
        }
        self.persist_cursor().await;
        Flow::Continue
    }

    async fn flush_future(&mut self, now: i64) -> Flow {
        if self.future.is_empty() {
            return Flow::Continue;
        }
        let batch = std::mem::take(&mut self.future);
        if self.process_batch(now, &batch).await {
            Flow::Continue
        } else {
            Flow::Stop
        }
    }

    /// Counts, mines for relays, dedups and forwards a batch. `false` means the
    /// batch could not be forwarded and the crawler must stop.
    async fn process_batch(&mut self, now: i64, events: &[Event]) -> bool {
        if events.is_empty() {
            return true;
        }
        let ids: Vec<String> = events.iter().map(|e| e.id.clone()).collect();
        if let Err(e) = self.store.count_seen(&self.id, &ids).await {
            warn!(relay = %self.url(), "count events failed: {e:#}");
        }
        self.discover(events).await;

        let locks = match self
            .store
            .lock_events(&ids, now, self.settings.redis_lock_timeout)
            .await
        {
            Ok(locks) => locks,
            Err(e) => {
                warn!(relay = %self.url(), "dedup lock failed: {e:#}");
                return false;
            }
        };
        let fresh: Vec<&Event> = events
            .iter()
            .zip(locks)
            .filter_map(|(event, locked)| locked.then_some(event))
            .collect();
        if fresh.is_empty() {
            return true;
        }

        let published = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(relay = %self.url(), "publish interrupted by stop");
                return false;
            }
            res = publish_batch(self.sink.as_ref(), &fresh) => res,
        };
        if let Err(e) = published {
            warn!(relay = %self.url(), "publish failed: {e}");
            return false;
        }
        let fresh_ids: Vec<String> = fresh.iter().map(|e| e.id.clone()).collect();
        if let Err(e) = self.store.lock_events_permanently(&fresh_ids, now).await {
            warn!(relay = %self.url(), "permanent dedup lock failed: {e:#}");
        }
        debug!(relay = %self.url(), received = events.len(), published = fresh.len(), "batch forwarded");
        true
    }

    async fn discover(&self, events: &[Event]) {
        let defaults = &self.settings.relay_defaults;
        for url in extract_relays(events) {
            let id = RelayId::from_url(&url);
            let fields = new_relay_fields(&url, defaults);
            match self.store.create_relay(&id, &fields, defaults.is_active()).await {
                Ok(true) => info!(relay = %url, "discovered relay"),
                Ok(false) => {}
                Err(e) => warn!(relay = %url, "create relay failed: {e:#}"),
            }
        }
    }

    async fn fail(&mut self, failure: CrawlFailure) -> Flow {
        if !failure.is_hard() {
            info!(relay = %self.url(), "{failure}");
            return Flow::Stop;
        }
        warn!(relay = %self.url(), error = %failure, "relay failure");
        if let Err(e) = self.store.record_failure(&self.id, &failure.record()).await {
            warn!(relay = %self.url(), "record failure failed: {e:#}");
        }
        if failure.deactivates() {
            if let Err(e) = self.store.set_relay_active(&self.id, false).await {
                warn!(relay = %self.url(), "deactivate failed: {e:#}");
            }
        }
        Flow::Stop
    }

    /// Sleeps for `delay` unless stopped first. `false` means stopped.
    async fn pause(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return true;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn request_past(&mut self, now: i64) {
        let Some(relay) = self.relay.as_mut() else {
            return;
        };
        if relay.cursor() == CURSOR_NOT_STARTED {
            relay.set_cursor(now);
        }
        let sid = format!("{SUB_PAST_PREFIX}{}", relay.cursor());
        let msg = ClientMessage::req(sid, relay.past_filters_until());
        self.outbox.push(Outbound::Text(msg.to_json()));
    }

    fn send(&mut self, msg: ClientMessage) {
        self.outbox.push(Outbound::Text(msg.to_json()));
    }

    fn arm_watchdog(&mut self) {
        let latency = self
            .relay
            .as_ref()
            .map(|r| r.max_server_latency)
            .unwrap_or_default();
        if !latency.is_zero() {
            self.watchdog = Some(Instant::now() + latency);
        }
    }

    async fn persist_cursor(&mut self) {
        let Some(relay) = self.relay.as_mut() else {
            return;
        };
        let Some(cursor) = relay.unsaved_cursor() else {
            return;
        };
        if cursor == CURSOR_NOT_STARTED {
            return;
        }
        match self
            .store
            .set_relay_field(&self.id, FIELD_CURSOR, &cursor.to_string())
            .await
        {
            Ok(()) => relay.mark_cursor_saved(cursor),
            Err(e) => warn!(relay = %relay.url, "persist cursor failed: {e:#}"),
        }
    }
}

/// Cursor after a backlog page requested with `until = requested`.
///
/// An empty page exhausts the backlog. A page that did not reach below the requested
/// boundary, including one whose events all lie above it because the relay ignored
/// `until`, moves it back by one second so pagination cannot stall, at the price of
/// skipping further events sharing that second.
pub fn next_cursor(previous: i64, requested: i64, page_min: Option<i64>) -> i64 {
    match page_min {
        None => CURSOR_EXHAUSTED,
        Some(min) if min >= requested => (requested - 1).max(CURSOR_EXHAUSTED),
        Some(min) => previous.min(min).max(CURSOR_EXHAUSTED),
    }
}
