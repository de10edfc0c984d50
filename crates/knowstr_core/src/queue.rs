/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Outbound event queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use knowstr_protocol::Event;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::info;

use crate::settings::QueueSettings;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full")]
    Full,

    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("queue backend: {0}")]
    Backend(String),
}

/// Durable sink for crawled events. `publish` resolves only once the backend has
/// confirmed the write.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), QueueError>;
}

/// Publishes one message per event and waits for every confirmation.
pub async fn publish_batch(sink: &dyn EventSink, events: &[&Event]) -> Result<(), QueueError> {
    let mut payloads = Vec::with_capacity(events.len());
    for event in events {
        payloads.push(serde_json::to_vec(event).map_err(|e| QueueError::Backend(e.to_string()))?);
    }
    let results = join_all(payloads.into_iter().map(|p| sink.publish(p))).await;
    results.into_iter().collect::<Result<Vec<()>, _>>()?;
    Ok(())
}

/// Appends events to a Redis stream named after the queue topic.
pub struct RedisStreamSink {
    conn: ConnectionManager,
    topic: String,
    permits: Semaphore,
    send_timeout: Duration,
    block_if_full: bool,
}

impl RedisStreamSink {
    pub async fn connect(url: &str, settings: &QueueSettings) -> Result<Self> {
        let client = redis::Client::open(url).context("queue url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("queue connect")?;
        info!(topic = %settings.topic, "queue producer ready");
        Ok(Self {
            conn,
            topic: settings.topic.clone(),
            permits: Semaphore::new(settings.max_pending_messages.min(Semaphore::MAX_PERMITS)),
            send_timeout: settings.send_timeout,
            block_if_full: settings.block_if_queue_full,
        })
    }

    async fn send(&self, payload: Vec<u8>) -> Result<(), QueueError> {
        let _permit = if self.block_if_full {
            self.permits
                .acquire()
                .await
                .map_err(|e| QueueError::Backend(e.to_string()))?
        } else {
            self.permits.try_acquire().map_err(|_| QueueError::Full)?
        };
        let mut conn = self.conn.clone();
        let _id: String = redis::cmd("XADD")
            .arg(&self.topic)
            .arg("*")
            .arg("event")
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl EventSink for RedisStreamSink {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), QueueError> {
        // zero disables the timeout
        if self.send_timeout.is_zero() {
            return self.send(payload).await;
        }
        tokio::time::timeout(self.send_timeout, self.send(payload))
            .await
            .map_err(|_| QueueError::Timeout(self.send_timeout))?
    }
}

/// Keeps published payloads in memory.
#[derive(Default)]
pub struct MemorySink {
    published: Mutex<Vec<Vec<u8>>>,
    failing: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl MemorySink {
    /// Makes every following publish fail until turned off again.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub async fn published(&self) -> Vec<Event> {
        self.published
            .lock()
            .await
            .iter()
            .filter_map(|p| serde_json::from_slice(p).ok())
            .collect()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), QueueError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(QueueError::Backend("sink unavailable".to_string()));
        }
        self.published.lock().await.push(payload);
        Ok(())
    }
}
