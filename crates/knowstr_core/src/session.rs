/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::MaybeTlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::crawler::{CrawlerPhase, Flow, Outbound, RelayCrawler, SessionEvent};
use crate::failure::CrawlFailure;
use crate::now_secs;
use crate::relay::RelayId;
use crate::store::Store;

/// Worker-side view of a crawler: its phase and a way to stop it.
pub struct CrawlerHandle {
    id: RelayId,
    store: Arc<dyn Store>,
    pending: Option<RelayCrawler>,
    phase: watch::Receiver<CrawlerPhase>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CrawlerHandle {
    pub fn new(crawler: RelayCrawler) -> Self {
        Self {
            id: crawler.id().clone(),
            store: crawler.store().clone(),
            phase: crawler.subscribe(),
            cancel: crawler.cancel_token(),
            pending: Some(crawler),
            task: None,
        }
    }

    pub fn id(&self) -> &RelayId {
        &self.id
    }

    pub fn phase(&self) -> CrawlerPhase {
        if self.pending.is_none() && self.task.is_none() {
            return CrawlerPhase::Stopped;
        }
        *self.phase.borrow()
    }

    /// Spawns the session. Only an idle crawler can start; returns whether it did.
    pub fn start(&mut self) -> bool {
        let Some(crawler) = self.pending.take() else {
            return false;
        };
        crawler.set_phase(CrawlerPhase::Starting);
        self.task = Some(tokio::spawn(run(crawler)));
        true
    }

    /// Cancels the session and waits up to `grace` for its cleanup writes. A session
    /// that does not finish in time is aborted and its liveness record dropped here.
    /// Safe to call repeatedly.
    pub async fn stop(&mut self, grace: Duration) {
        self.cancel.cancel();
        self.pending = None;
        let Some(mut task) = self.task.take() else {
            return;
        };
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => warn!(relay = %self.id, "crawler task failed: {e}"),
            Err(_) => {
                warn!(relay = %self.id, "crawler did not stop in time, aborting");
                task.abort();
            }
        }
        if let Err(e) = self.store.drop_connection(&self.id).await {
            warn!(relay = %self.id, "drop liveness record failed: {e:#}");
        }
    }
}

/// Drives one relay session to completion, then runs the crawler's cleanup.
pub async fn run(mut crawler: RelayCrawler) {
    let cancel = crawler.cancel_token();
    drive(&mut crawler, &cancel).await;
    crawler.finish().await;
}

async fn drive(crawler: &mut RelayCrawler, cancel: &CancellationToken) {
    let relay = match crawler.load().await {
        Ok(relay) => relay,
        Err(e) => {
            warn!(relay = %crawler.id(), "load relay failed: {e:#}");
            return;
        }
    };
    let url = relay.url.clone();
    let handshake_timeout = relay.handshake_timeout;
    let ping_interval = relay.ping_interval;
    let flush_interval = crawler.settings().relay_future_events_flush_interval;

    debug!(relay = %url, "connecting");
    let connect = tokio::time::timeout(handshake_timeout, tokio_tungstenite::connect_async(url.as_str()));
    let ws = tokio::select! {
        _ = cancel.cancelled() => return,
        res = connect => match res {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => {
                crawler.handle(now_secs(), SessionEvent::Failed(e.into())).await;
                return;
            }
            Err(_) => {
                let failure = CrawlFailure::HandshakeTimeout(handshake_timeout);
                crawler.handle(now_secs(), SessionEvent::Failed(failure)).await;
                return;
            }
        }
    };

    let ip = peer_ip(ws.get_ref());
    crawler.handle(now_secs(), SessionEvent::Upgraded { ip }).await;
    let (mut tx, mut rx) = ws.split();

    let mut flow = crawler.handle(now_secs(), SessionEvent::Open).await;
    if let Err(e) = write_outbox(&mut tx, crawler).await {
        flow = crawler.handle(now_secs(), SessionEvent::Failed(e.into())).await;
    }

    let mut flush = tokio::time::interval(flush_interval);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut keepalive = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while flow == Flow::Continue {
        let watchdog = crawler.watchdog();
        flow = tokio::select! {
            _ = cancel.cancelled() => Flow::Stop,
            _ = flush.tick() => crawler.handle(now_secs(), SessionEvent::FlushTick).await,
            _ = keepalive.tick() => crawler.handle(now_secs(), SessionEvent::Keepalive).await,
            _ = expire(watchdog) => crawler.handle(now_secs(), SessionEvent::WatchdogExpired).await,
            msg = rx.next() => {
                let event = match msg {
                    None => SessionEvent::Failed(CrawlFailure::PeerClosed),
                    Some(Err(e)) => SessionEvent::Failed(e.into()),
                    Some(Ok(Message::Text(text))) => SessionEvent::Frame(text),
                    Some(Ok(Message::Ping(payload))) => SessionEvent::PeerPing(payload),
                    Some(Ok(Message::Close(frame))) => SessionEvent::Closed {
                        code: frame.as_ref().map(|f| u16::from(f.code)),
                        reason: frame.map(|f| f.reason.into_owned()).unwrap_or_default(),
                    },
                    Some(Ok(_)) => continue,
                };
                crawler.handle(now_secs(), event).await
            }
        };
        if let Err(e) = write_outbox(&mut tx, crawler).await {
            if flow == Flow::Continue {
                flow = crawler.handle(now_secs(), SessionEvent::Failed(e.into())).await;
            }
        }
    }

    crawler.set_phase(CrawlerPhase::Stopping);
    if let Err(e) = tx.close().await {
        debug!(relay = %url, "close failed: {e}");
    }
}

async fn write_outbox<S>(tx: &mut S, crawler: &mut RelayCrawler) -> Result<(), tungstenite::Error>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    for out in crawler.drain_outbox() {
        let msg = match out {
            Outbound::Text(text) => Message::Text(text),
            Outbound::Ping(payload) => Message::Ping(payload),
            Outbound::Pong(payload) => Message::Pong(payload),
        };
        tx.send(msg).await?;
    }
    Ok(())
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn peer_ip(stream: &MaybeTlsStream<TcpStream>) -> Option<String> {
    let addr = match stream {
        MaybeTlsStream::Plain(s) => s.peer_addr(),
        MaybeTlsStream::Rustls(s) => s.get_ref().0.peer_addr(),
        _ => return None,
    };
    addr.ok().map(|a| a.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use crate::queue::MemorySink;
    use crate::relay::new_relay_fields;
    use crate::settings::Settings;
    use knowstr_protocol::Event;
    use secp256k1::SecretKey;
    use serde_json::json;
    use tokio::net::TcpListener;

    /// Serves one connection that sends a single FUTURE event, then drains input.
    async fn one_event_relay() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sk = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let event = Event::finalize(&sk, now_secs(), 1, vec![], "hi").unwrap();
        let frame = json!(["EVENT", "FUTURE", event]).to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(frame)).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });
        format!("ws://{addr}")
    }

    async fn started(url: &str, fields: &[(&str, &str)]) -> (Arc<MemoryStore>, RelayId, CrawlerHandle) {
        let store = Arc::new(MemoryStore::new());
        let settings = Arc::new(Settings::default());
        let id = RelayId::from_url(url);
        store
            .create_relay(&id, &new_relay_fields(url, &settings.relay_defaults), true)
            .await
            .unwrap();
        for (k, v) in fields {
            store.set_relay_field(&id, k, v).await.unwrap();
        }
        let crawler = RelayCrawler::new(id.clone(), store.clone(), Arc::new(MemorySink::new()), settings);
        let mut handle = CrawlerHandle::new(crawler);
        assert!(handle.start());

        for _ in 0..100 {
            if store.connection(&id).await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(store.connection(&id).await.is_some());
        (store, id, handle)
    }

    #[tokio::test]
    async fn stop_during_event_delay_cleans_up() {
        let url = one_event_relay().await;
        let (store, id, mut handle) =
            started(&url, &[("event_delay", "5000"), ("should_load_past", "0")]).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        handle.stop(Duration::from_secs(2)).await;
        assert_eq!(handle.phase(), CrawlerPhase::Stopped);
        assert_eq!(store.connection(&id).await, None);
        assert!(store.relay_fields(&id).await.unwrap().contains_key("ip"));
    }

    #[tokio::test]
    async fn aborted_session_still_drops_liveness() {
        let url = one_event_relay().await;
        let (store, id, mut handle) =
            started(&url, &[("event_delay", "5000"), ("should_load_past", "0")]).await;

        handle.stop(Duration::ZERO).await;
        assert_eq!(handle.phase(), CrawlerPhase::Stopped);
        assert_eq!(store.connection(&id).await, None);

        handle.stop(Duration::ZERO).await;
    }
}
