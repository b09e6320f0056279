use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use fhir_ig_registry::artifact::ArtifactFetcher;
use fhir_ig_registry::config::Config;
use fhir_ig_registry::feed::{FeedFetcher, FeedIndex};
use fhir_ig_registry::server::{self, AppState};
use fhir_ig_registry::store::Store;
use fhir_ig_registry::sync::{self, SyncService};
use fhir_ig_registry::log;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    log::init()?;

    std::fs::create_dir_all(config.data_dir())?;
    let store = Store::open(&config.db_path()).await?;

    let client = reqwest::Client::builder()
        .user_agent(concat!("fhir-ig-registry/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let index = FeedIndex::new(client.clone(), &config.feed_index_url, config.index_timeout());
    let fetcher = FeedFetcher::new(client.clone(), config.retry_policy(), config.fetch_timeout());
    let sync_service = Arc::new(SyncService::new(
        store,
        index,
        fetcher,
        config.batch_size,
        config.max_concurrent_feeds,
    ));
    let artifacts = Arc::new(ArtifactFetcher::new(
        client,
        config.download_dir(),
        &config.registry_base_url,
        &config.fallback_registry_url,
        config.fetch_timeout(),
    ));

    // Serve whatever is on disk right away; refresh only when it is stale.
    if let Err(e) = sync_service.refresh_if_stale(config.max_cache_age()).await {
        error!("initial sync failed: {e}");
    }
    tokio::spawn(sync::run_scheduler(
        Arc::clone(&sync_service),
        config.refresh_interval(),
    ));

    let state = AppState::new(sync_service, artifacts, config.search_cutoff);
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
