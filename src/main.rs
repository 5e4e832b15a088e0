use std::sync::Arc;

use canvas_collab::config::Config;
use canvas_collab::services::registry::{Registry, RegistryConfig};
use canvas_collab::services::store::{CanvasStore, PgStore};
use canvas_collab::state::AppState;
use canvas_collab::{db, routes};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().expect("invalid configuration");

    let pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("database init failed");
    let store: Arc<dyn CanvasStore> = Arc::new(PgStore::new(pool));

    let registry = Registry::spawn(Arc::clone(&store), RegistryConfig::from(&config));
    let state = AppState::new(registry.clone(), store);

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .expect("failed to bind");

    tracing::info!(port = config.port, autosave_secs = config.autosave_interval.as_secs(), "canvas-collab listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server failed");

    // No new connections past this point; flush whatever sessions are still live.
    if let Err(e) = registry.shutdown().await {
        tracing::warn!(error = %e, "registry shutdown incomplete");
    }
    tracing::info!("canvas-collab stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
