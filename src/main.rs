use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use webcast_ingestor::buffer::DurableBuffer;
use webcast_ingestor::config::IngestorConfig;
use webcast_ingestor::oracle::UnconfiguredOracle;
use webcast_ingestor::store::StoreWriter;
use webcast_ingestor::supervisor::{CredentialPool, Supervisor};
use webcast_ingestor::GiftAggregator;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var("INGESTOR_CONFIG").unwrap_or_else(|_| "config.yml".into());
    let config = IngestorConfig::load(&config_path).context("loading configuration")?;

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    match config.logging.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(tracing_subscriber::EnvFilter::new(log_level))
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .with_current_span(true)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(tracing_subscriber::EnvFilter::new(log_level))
                .with_target(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .init();
        }
    }

    info!("starting webcast ingestor v{}", env!("CARGO_PKG_VERSION"));
    info!(path = %config_path, "configuration loaded");

    let buffer = Arc::new(
        DurableBuffer::connect(&config.buffer.redis_url)
            .await
            .context("connecting to durable buffer")?,
    );
    info!("durable buffer connected");

    let store = Arc::new(
        StoreWriter::connect(
            &config.store.mongo_url,
            &config.store.db_name,
            Arc::clone(&buffer),
            config.buffer.chat_batch_size,
            config.buffer.gift_batch_size,
            config.buffer.stat_batch_size,
            config.buffer.buffer_timeout_secs,
        )
        .await
        .context("connecting to store")?,
    );
    info!("store connected");

    let periodic_flush_cancel = CancellationToken::new();
    let periodic_flush_handle = store.start_periodic_flush(periodic_flush_cancel.clone());

    let aggregator = GiftAggregator::new(
        Arc::clone(&store),
        Arc::clone(&buffer),
        config.aggregator.max_buffer_size,
        config.aggregator.combo_timeout_secs,
        config.aggregator.dedup_cap,
        config.aggregator.dedup_ttl_secs,
        config.aggregator.small_gift_threshold,
    );
    aggregator.start();
    info!("gift aggregator started");

    let credentials = CredentialPool::load(Arc::clone(&buffer))
        .await
        .context("loading credential pool")?;
    info!(count = credentials.len().await, "credential pool ready");

    let oracle: Arc<dyn webcast_ingestor::session::protocol::SignatureOracle> =
        Arc::new(UnconfiguredOracle);
    let http = reqwest::Client::builder()
        .build()
        .context("building http client")?;

    let supervisor = Supervisor::new(
        http,
        oracle,
        Arc::clone(&store),
        Arc::clone(&aggregator),
        credentials,
        Duration::from_secs(config.discovery.interval_secs),
        config.store.zombie_timeout_secs,
        config.discovery.page_size,
        config.discovery.page_delay_ms,
        config.discovery.account_sec_uid.clone(),
    );

    let run_handle = tokio::spawn(Arc::clone(&supervisor).run());

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received, draining sessions");

    supervisor.shutdown().await;
    let _ = run_handle.await;

    periodic_flush_cancel.cancel();
    let _ = periodic_flush_handle.await;

    if let Err(e) = store.flush_gifts().await {
        warn!(error = %e, "failed to flush pending gifts during shutdown");
    }
    if let Err(e) = store.flush_chats().await {
        warn!(error = %e, "failed to flush pending chats during shutdown");
    }
    if let Err(e) = store.flush_stats().await {
        warn!(error = %e, "failed to flush pending stats during shutdown");
    }

    aggregator.stop().await;
    store.close().await;
    buffer.close().await;

    info!("shutdown complete");
    Ok(())
}
