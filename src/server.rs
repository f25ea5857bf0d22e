//! Process bootstrap: tracing, database pool, and the observability
//! endpoint (`/metrics`, `/healthz`).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::routing::get;
use axum::{Json, Router};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::infra::{Result, ShutdownSignal};
use crate::metrics::MetricsRegistry;

/// Initialize the tracing subscriber. `RUST_LOG` wins; default is info.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Connect the shared database pool.
pub async fn connect_pool(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_db_connections)
        .connect(&config.database_url)
        .await?;
    Ok(pool)
}

/// Shared state of the observability endpoint.
#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<MetricsRegistry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics(State(state): State<AppState>) -> ([(header::HeaderName, &'static str); 1], String) {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus().await,
    )
}

/// Serve the observability endpoint until shutdown.
pub async fn serve_metrics(
    addr: SocketAddr,
    metrics: Arc<MetricsRegistry>,
    shutdown: ShutdownSignal,
) -> anyhow::Result<()> {
    let app = router(AppState { metrics });
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "metrics endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;
    Ok(())
}
