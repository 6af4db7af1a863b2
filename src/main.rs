//! Activity Actions — Binary Entrypoint
//! Boots the pipeline engine and serves the ops router (health, metrics,
//! inbound events, debug). On SIGINT/SIGTERM the engine is shut down cleanly.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use shuttle_runtime::CustomError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use activity_actions::metrics::Metrics;
use activity_actions::Engine;

/// Compact logs by default, JSON lines when `LOG_FORMAT=json`.
/// A subscriber installed by the runtime takes precedence.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,activity_actions=info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Resolves on SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Ctrl-C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

/// The router plus the engine it fronts, so the engine outlives the server
/// and gets its shutdown pass.
struct PipelineService {
    router: Router,
    engine: Arc<Engine>,
}

#[shuttle_runtime::async_trait]
impl shuttle_runtime::Service for PipelineService {
    async fn bind(self, addr: SocketAddr) -> Result<(), shuttle_runtime::Error> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(CustomError::new)?;
        activity_actions::api::serve(listener, self.router, self.engine, shutdown_signal())
            .await
            .map_err(CustomError::new)?;
        Ok(())
    }
}

#[shuttle_runtime::main]
async fn axum() -> Result<PipelineService, shuttle_runtime::Error> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let metrics = match Metrics::init() {
        Ok(m) => Some(m),
        Err(e) => {
            tracing::warn!(error = %e, "metrics recorder not installed; /metrics disabled");
            None
        }
    };

    let engine = activity_actions::build_engine_from_env()
        .await
        .map_err(shuttle_runtime::Error::Custom)?;

    let router = activity_actions::router(engine.clone(), metrics.as_ref());
    Ok(PipelineService { router, engine })
}
