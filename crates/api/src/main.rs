//! CrewFlow notification API server binary entrypoint.

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crewflow_common::config::AppConfig;
use crewflow_common::db::create_pool;
use crewflow_notify::registry::SubscriptionRegistry;

use crewflow_api::routes::create_router;
use crewflow_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("crewflow_api=debug,crewflow_notify=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting CrewFlow notification server...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Create database connection pool
    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    tracing::info!("Database pool created");

    // Run migrations
    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    // Live-connection registry: constructed here, drained at shutdown
    let registry = Arc::new(SubscriptionRegistry::new(config.stream_queue_capacity));

    // Build application state
    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(pool, registry.clone(), config);

    // Build router
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("API server listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Received shutdown signal, stopping gracefully...");
        })
        .await?;

    // Close every live stream before exiting
    registry.drain();

    tracing::info!("CrewFlow notification server stopped.");
    Ok(())
}
