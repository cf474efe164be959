//! HTTP surface: `GET /healthz` and `POST /chat`.
//!
//! `/chat` takes `{"question": "..."}` and answers `{"prompt", "answer"}`:
//! 200 on success, 502 with an `LLM error: ...` answer when generation failed,
//! 500 with `{"error"}` when embedding or retrieval failed.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::pipeline::QueryPipeline;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub question: String,
}

pub fn router(pipeline: Arc<QueryPipeline>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/chat", post(chat))
        .layer(TraceLayer::new_for_http())
        .with_state(pipeline)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

async fn chat(
    State(pipeline): State<Arc<QueryPipeline>>,
    Json(request): Json<ChatRequest>,
) -> Response {
    match pipeline.answer(&request.question).await {
        Ok(outcome) if outcome.degraded => (StatusCode::BAD_GATEWAY, Json(outcome)).into_response(),
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => {
            error!(error = %e, "Chat request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Serve `pipeline` on `addr` until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    pipeline: Arc<QueryPipeline>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, router(pipeline))
        .with_graceful_shutdown(shutdown)
        .await
}
