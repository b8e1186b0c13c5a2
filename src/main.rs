//! Entry point: load config, wire dependencies, and run the dispatcher.

use fleetcast::auth::JwtSecret;
use fleetcast::config::Config;
use fleetcast::db::{self, FleetStore, MemoryFleetStore, PgFleetStore};
use fleetcast::error::AppError;
use fleetcast::repositories::RedisRepository;
use fleetcast::services::{Dispatcher, HttpNotifier, LogNotifier, Notifier};
use fleetcast::{create_app, AppState};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().map_err(AppError::from)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store: Arc<dyn FleetStore> = match &config.database_url {
        Some(url) => Arc::new(PgFleetStore::new(db::create_pool(url).await?)),
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory fleet store");
            Arc::new(MemoryFleetStore::new())
        }
    };

    let mut dispatcher = Dispatcher::new();
    let mut relayed = None;
    if let Some(url) = &config.redis_url {
        let repo = RedisRepository::new(url)?;
        relayed = Some(repo.subscribe().await?);
        dispatcher = dispatcher.with_backplane(repo);
    }

    let notifier: Arc<dyn Notifier> = match &config.notify_url {
        Some(url) => Arc::new(HttpNotifier::new(url.clone())?),
        None => Arc::new(LogNotifier),
    };

    let mut state = AppState::new(config.app_key.clone(), dispatcher, store, notifier);
    if let Some(secret) = &config.identity_jwt_secret {
        state = state.with_identity(JwtSecret::new(secret.clone()));
    }
    if let Some(rx) = relayed {
        state.watcher.spawn_backplane_listener(rx);
    }
    state.watcher.clone().spawn(config.poll_interval);

    let app = create_app(state);

    tracing::info!(addr = %config.server_addr, "listening");
    let listener = tokio::net::TcpListener::bind(config.server_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
