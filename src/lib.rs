// src/lib.rs
// Public library surface: the binary, the demo, and integration tests build on it.

pub mod api;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod query;
pub mod store;

// Event flow: ingest -> correlate -> synth -> generate
pub mod correlate;
pub mod generate;
pub mod ingest;
pub mod reasoning;
pub mod synth;

// Delivery & orchestration
pub mod notify;
pub mod pipeline;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::config::{AiConfig, PipelineConfig};
pub use crate::ingest::Ingestor;
pub use crate::notify::{NotifierMux, PipelineNotification};
pub use crate::pipeline::{Engine, EngineBuilder};
pub use crate::query::{ActionBoard, ActionFilter};

use std::sync::Arc;

use anyhow::Context;

/// Build an engine from the default config locations and spawn its background jobs.
///
/// Reads `PIPELINE_CONFIG_PATH` (or `config/pipeline.toml`), `config/ai.json`,
/// `SNAPSHOT_PATH`, `NOTIFY_WEBHOOK_URL`, and `AI_TEST_MODE`.
pub async fn build_engine_from_env() -> anyhow::Result<Arc<Engine>> {
    let cfg = PipelineConfig::load_default().context("load pipeline config")?;
    let ai = AiConfig::load_or_default("config/ai.json").context("load config/ai.json")?;
    let client = reasoning::build_client_from_config(&ai);
    tracing::info!(
        target: "pipeline",
        provider = client.provider_name(),
        "reasoning client ready"
    );

    let mut builder = EngineBuilder::new(cfg)
        .reasoning(client)
        .notifier(NotifierMux::from_env());
    if let Ok(path) = std::env::var("SNAPSHOT_PATH") {
        if !path.trim().is_empty() {
            builder = builder.snapshot_path(path.trim());
        }
    }
    let engine = builder.build().context("build pipeline engine")?;
    engine.spawn_background();
    Ok(engine)
}
