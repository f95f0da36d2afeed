//! PriceWatch - competitor pricing intelligence backend.
//!
//! A timer hits the cron entrypoints; the runner claims leased batches of
//! due competitors, snapshots their pricing pages, diffs against the last
//! snapshot, and emits entitlement-gated insights.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pricewatch_backend::{
    api::{router, AppState},
    crawler::fetch::HttpFetcher,
    email::LogEmailSender,
    models::Config,
    store::Store,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Arc::new(Config::from_env()?);
    let store = Store::open(&config.database_path).context("open store")?;
    info!(database = %config.database_path, "Store ready");

    if config.cron_secret.is_none() {
        tracing::warn!("CRON_SECRET not set - cron endpoints will reject all callers");
    }

    let state = AppState {
        store,
        fetcher: Arc::new(HttpFetcher::new(&config)),
        email: Arc::new(LogEmailSender::new()),
        config: config.clone(),
    };
    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pricewatch_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
