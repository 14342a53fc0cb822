use anyhow::{Context, Result};
use connector_worker::intake::run_intake;
use connector_worker::{JobQueue, Pipeline, QueuePublisher, RetryPolicy};
use elba_connect::api::{create_router, run_state_cleanup, AppState, StateManager};
use elba_connect::broker::NangoClient;
use elba_connect::bus::{EventPublisher, NatsClient};
use elba_connect::config::AppConfig;
use elba_connect::elba::ElbaClient;
use elba_connect::organisation::OrganisationStore;
use elba_connect::vendor::{RestVendorClient, VendorClient};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "connector_worker=info,elba_connect=info".into()),
        )
        .init();

    info!("Connector worker starting...");

    let config = AppConfig::load()
        .context("Failed to load configuration")?
        .shared();

    info!(
        db_path = %config.store.db_path,
        elba_url = %config.elba.api_base_url,
        vendor_url = %config.vendor.api_base_url,
        broker = config.broker.is_some(),
        nats = config.nats.enabled,
        sync_interval_secs = config.sync.interval_secs,
        "Configuration loaded"
    );

    let store = Arc::new(
        OrganisationStore::new(&config.store.db_path, &config.store.encryption_key)
            .context("Failed to initialize organisation store")?,
    );

    let elba = Arc::new(ElbaClient::new(
        config.elba.api_base_url.clone(),
        config.elba.api_key.clone(),
    ));
    let vendor: Arc<dyn VendorClient> = Arc::new(RestVendorClient::new(config.vendor.clone())?);

    let queue = JobQueue::new(RetryPolicy::from(&config.functions));

    let nats = if config.nats.enabled {
        Some(NatsClient::connect(config.nats.clone()).await?)
    } else {
        None
    };
    let publisher: Arc<dyn EventPublisher> = match &nats {
        Some(nats) => Arc::new(nats.publisher()),
        None => Arc::new(QueuePublisher::new(queue.clone())),
    };

    let mut pipeline = Pipeline::new(
        Arc::clone(&store),
        elba,
        Arc::clone(&vendor),
        Arc::clone(&publisher),
        Arc::clone(&config),
    );
    if let Some(broker) = config.broker.clone() {
        pipeline = pipeline.with_broker(Arc::new(NangoClient::new(broker)));
    }
    let pipeline = Arc::new(pipeline);

    queue.start(pipeline.clone())?;

    // Token refresh chains live in the queue; restart them.
    if let Err(e) = pipeline.resume_refreshes().await {
        warn!(error = %e, "Failed to resume token refreshes");
    }

    let scheduler = Arc::clone(&pipeline).start_scheduler();

    match nats {
        Some(nats) => {
            let intake = tokio::spawn(run_intake(
                nats.jetstream().clone(),
                nats.config().clone(),
                queue.clone(),
            ));

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
            intake.abort();
        }
        None => {
            // Single-process mode: the webhook surface feeds the local queue.
            config.require_webhook_secret()?;

            let oauth_states = StateManager::new(config.server.oauth_state_expiry_secs);
            tokio::spawn(run_state_cleanup(oauth_states.clone(), 60));

            let router = create_router(AppState {
                config: Arc::clone(&config),
                store,
                publisher,
                vendor,
                oauth_states,
            });

            let listener =
                tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.server.port))
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
        }
    }

    scheduler.abort();
    let dropped = queue.len();
    queue.shutdown();
    info!(dropped_jobs = dropped, "Connector worker stopped");
    Ok(())
}
