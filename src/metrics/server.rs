use crate::metrics::{Metrics, MetricsSnapshot};
use axum::{extract::State, routing::get, Json, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

async fn health_check() -> &'static str {
    "ok"
}

async fn get_vars(State(metrics): State<Arc<Metrics>>) -> Json<MetricsSnapshot> {
    Json(metrics.snapshot())
}

/// Routes exposing the pipeline counters
pub fn metrics_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/debug/vars", get(get_vars))
        .layer(TraceLayer::new_for_http())
        .with_state(metrics)
}

/// Serve [`metrics_router`] on an already bound listener until `shutdown` is cancelled
pub async fn run_metrics_server(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    info!(addr = %listener.local_addr()?, "Metrics server listening");

    axum::serve(listener, metrics_router(metrics))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Metrics server shutting down");
        })
        .await
}
