// Health and metrics endpoint for the caseforge worker
use crate::metrics;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use caseforge_common::types::QueueKind;
use caseforge_common::SharedQueue;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Clone)]
pub struct HealthState {
    pub worker_id: String,
    pub sandbox: &'static str,
    pub queue: SharedQueue,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// GET /health
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "worker_id": state.worker_id,
            "sandbox": state.sandbox,
        })),
    )
}

/// GET /metrics - Prometheus text format; queue depths are sampled per scrape
async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    for kind in QueueKind::all_variants() {
        match state.queue.depth(*kind).await {
            Ok(depth) => metrics::set_queue_depth(*kind, depth),
            Err(e) => warn!(queue = %kind, error = %e, "Failed to sample queue depth"),
        }
    }

    match metrics::render_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to render metrics: {}", e),
        )
            .into_response(),
    }
}

pub async fn serve(
    addr: &str,
    state: HealthState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Health server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stopping| *stopping).await;
        })
        .await?;
    Ok(())
}
