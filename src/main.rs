use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use kappa_scan::api;
use kappa_scan::catalog;
use kappa_scan::config::Config;
use kappa_scan::state::{AppState, AppStateInner};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("failed to load configuration")?;

    tracing::info!(
        "kappa-scan starting, catalog: {}, listen: {}, auth: {}",
        config.catalog_dir.display(),
        config.listen_addr,
        if config.auth_token.is_some() { "bearer" } else { "none" },
    );

    // Icons are decoded once at startup and shared by every run
    let catalog = catalog::load_catalog(&config.catalog_dir, &config.detection)
        .with_context(|| format!("failed to load catalog from {}", config.catalog_dir.display()))?;

    tracing::info!(
        "{} of {} catalog item(s) have a usable icon",
        catalog.loadable().count(),
        catalog.len()
    );

    let listen_addr = config.listen_addr.clone();
    let state: AppState = Arc::new(Mutex::new(AppStateInner::new(config, catalog)));

    let app = api::router(state).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&listen_addr)
        .await
        .context(format!("failed to bind to {listen_addr}"))?;

    tracing::info!("listening on {listen_addr}");

    axum::serve(listener, app)
        .await
        .context("server error")?;

    Ok(())
}
