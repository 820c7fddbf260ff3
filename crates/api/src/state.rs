//! Shared application state for the Axum API server.

use std::sync::Arc;

use sqlx::PgPool;

use crewflow_common::config::AppConfig;
use crewflow_notify::broker::EventBroker;
use crewflow_notify::registry::SubscriptionRegistry;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub registry: Arc<SubscriptionRegistry>,
    pub broker: EventBroker,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(pool: PgPool, registry: Arc<SubscriptionRegistry>, config: AppConfig) -> Self {
        let broker = EventBroker::new(pool.clone(), registry.clone());
        Self {
            pool,
            registry,
            broker,
            config,
        }
    }
}
