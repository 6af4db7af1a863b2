use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::error::IngestError;
use crate::ingest::types::IngestOutcome;
use crate::metrics::Metrics;
use crate::model::{CorrelationGroup, Event};
use crate::pipeline::{DeadLetter, Engine};

/// How far back `/debug/groups/{user_id}` looks.
const DEBUG_GROUP_HOURS: i64 = 24;
const DEBUG_DEAD_LETTERS: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Debug routes are mounted only when `DEBUG_ROUTES=1`.
pub fn debug_routes_enabled() -> bool {
    std::env::var("DEBUG_ROUTES").is_ok_and(|v| v.trim() == "1")
}

/// Ops router. `/metrics` is mounted only when a recorder handle is passed in.
pub fn router(engine: Arc<Engine>, metrics: Option<&Metrics>) -> Router {
    let state = AppState { engine };
    let mut app = Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/events", post(post_event));

    if debug_routes_enabled() {
        app = app
            .route("/debug/groups/{user_id}", get(debug_groups))
            .route("/debug/dead-letters", get(debug_dead_letters));
    }

    let mut app = app
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .with_state(state);
    if let Some(m) = metrics {
        app = app.merge(m.router());
    }
    app
}

/// Serve `app` on `listener` until `signal` resolves, then stop the engine:
/// workers drain, queued notifications go out, the final snapshot is written.
pub async fn serve(
    listener: tokio::net::TcpListener,
    app: Router,
    engine: Arc<Engine>,
    signal: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await;
    tracing::info!(target: "pipeline", "server stopped accepting connections");
    engine.shutdown().await;
    served
}

#[derive(Serialize)]
struct RejectBody {
    error: String,
}

async fn post_event(State(state): State<AppState>, Json(event): Json<Event>) -> Response {
    match state.engine.ingestor().ingest(event).await {
        Ok(outcome) => (StatusCode::ACCEPTED, Json::<IngestOutcome>(outcome)).into_response(),
        Err(IngestError::Store(e)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(RejectBody { error: e }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(RejectBody {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn debug_groups(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<CorrelationGroup>>, StatusCode> {
    state
        .engine
        .board()
        .list_groups(&user_id, DEBUG_GROUP_HOURS)
        .await
        .map(Json)
        .map_err(|e| {
            tracing::warn!(target: "pipeline", error = %e, "debug group listing failed");
            StatusCode::SERVICE_UNAVAILABLE
        })
}

async fn debug_dead_letters(State(state): State<AppState>) -> Json<Vec<DeadLetter>> {
    Json(state.engine.dead_letters().snapshot_last_n(DEBUG_DEAD_LETTERS))
}
