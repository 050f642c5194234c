//! Replica Server - coordinator host for Replica Store.
//!
//! Runs the coordinator side of one registry: clients attach over a WebSocket
//! carrying the engine's event protocol, and replica snapshots are persisted
//! to PostgreSQL.

mod config;
mod db;
mod error;
mod handlers;
mod routes;
mod websocket;

use crate::config::Config;
use crate::websocket::{ConnectionManager, WsTransport};
use axum::Router;
use replica_engine::{Registry, Role};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub transport: Arc<WsTransport>,
    pub conn_manager: Arc<ConnectionManager>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "replica_server=debug,replica_engine=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Replica Server on {}:{}", config.host, config.port);

    // Create database pool
    let pool = db::create_pool(&config.database_url).await?;

    // Run migrations
    tracing::info!("Running database migrations...");
    db::run_migrations(&pool).await?;

    // Build the coordinator registry
    let conn_manager = ConnectionManager::new_shared();
    let transport = Arc::new(WsTransport::new(
        conn_manager.clone(),
        config.request_timeout,
    ));
    let registry = Registry::builder(config.namespace.clone(), config.store.clone())
        .role(Role::Coordinator)
        .config(config.engine())
        .transport(transport.clone())
        .store(Arc::new(db::PgStore::new(pool)))
        .build();
    registry.spawn_eviction();
    tracing::info!(registry = %registry.prefix(), "Coordinator registry ready");

    let state = AppState {
        registry: registry.clone(),
        transport,
        conn_manager,
    };

    // Build router
    let app = Router::new()
        .merge(routes::create_routes())
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        )
        .with_state(state);

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // Persist every connected replica before exiting
    tracing::info!("Shutting down coordinator registry");
    registry.shutdown().await;

    Ok(())
}
