use anyhow::{Context, Result};
use elba_connect::api::{create_router, run_state_cleanup, AppState, StateManager};
use elba_connect::bus::NatsClient;
use elba_connect::config::AppConfig;
use elba_connect::organisation::OrganisationStore;
use elba_connect::vendor::RestVendorClient;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "elba_connect=info,tower_http=info".into()),
        )
        .init();

    info!("elba-connect starting...");

    let config = AppConfig::load().context("Failed to load configuration")?;
    config.require_webhook_secret()?;
    let config = config.shared();

    info!(
        port = config.server.port,
        db_path = %config.store.db_path,
        nats_url = %config.nats.url,
        oauth = config.vendor.supports_oauth(),
        "Configuration loaded"
    );

    let store = Arc::new(
        OrganisationStore::new(&config.store.db_path, &config.store.encryption_key)
            .context("Failed to initialize organisation store")?,
    );

    let nats = NatsClient::connect(config.nats.clone()).await?;
    let publisher = Arc::new(nats.publisher());

    let vendor = Arc::new(RestVendorClient::new(config.vendor.clone())?);

    let oauth_states = StateManager::new(config.server.oauth_state_expiry_secs);
    tokio::spawn(run_state_cleanup(oauth_states.clone(), 60));

    let router = create_router(AppState {
        config: Arc::clone(&config),
        store,
        publisher,
        vendor,
        oauth_states,
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.server.port))
        .await
        .context("Failed to bind HTTP port")?;
    info!(port = config.server.port, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("HTTP server error")?;

    info!("elba-connect stopped");
    Ok(())
}
