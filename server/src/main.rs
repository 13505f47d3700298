//! Tandem Server binary.

use std::sync::Arc;

use tandem_engine::Schema;
use tandem_server::cache::{FileStorage, LocalCache};
use tandem_server::config::Config;
use tandem_server::coordinator::SyncCoordinator;
use tandem_server::notifier::{ChangeNotifier, NotifierConfig};
use tandem_server::remote::PgRemoteStore;
use tandem_server::{build_app, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Tandem Server on {}:{}", config.host, config.port);

    let schema = Arc::new(Schema::default());

    let storage = FileStorage::open(&config.cache_dir)?;
    tracing::info!(dir = %config.cache_dir.display(), "Local cache opened");
    let cache = Arc::new(LocalCache::new(Arc::new(storage), schema.clone()));

    let remote = PgRemoteStore::new(config.remote.as_ref(), schema)?;
    if config.remote_configured() {
        tracing::info!("Remote store configured");
    } else {
        tracing::warn!("Remote store not configured, serving from local cache only");
    }

    let coordinator = Arc::new(SyncCoordinator::new(Arc::new(remote), cache));
    let notifier = Arc::new(ChangeNotifier::new(
        coordinator.clone(),
        NotifierConfig {
            subscribe_timeout: config.subscribe_timeout,
            poll_interval: config.poll_interval,
        },
    ));

    let addr = format!("{}:{}", config.host, config.port);
    let app = build_app(AppState::new(coordinator, notifier, config));

    // Start server
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
