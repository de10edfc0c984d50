/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;

use knowstr_core::config::Config;
use knowstr_core::queue::{EventSink, RedisStreamSink};
use knowstr_core::redis_store::RedisStore;
use knowstr_core::settings::Settings;
use knowstr_core::store::Store;
use knowstr_core::worker::Worker;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let config = Config::from_env();
    let store: Arc<dyn Store> = Arc::new(RedisStore::connect(&config.redis_url).await?);
    let settings = Arc::new(Settings::load(store.as_ref()).await?);
    let sink: Arc<dyn EventSink> =
        Arc::new(RedisStreamSink::connect(&config.queue_url, &settings.queue).await?);

    let mut worker = Worker::new(store, sink, settings, config);
    worker.check_in().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("ctrl-c received, shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                error!("ctrl-c handler failed: {e}");
                std::future::pending::<()>().await;
            }
        }
    });

    let reason = worker.run(shutdown_rx).await;
    info!(worker = %worker.id(), %reason, "worker exited");
    Ok(())
}
