// src/ingest/types.rs
use anyhow::Result;

use crate::model::Event;

/// Platform adapter that already converted raw payloads into normalized events.
#[async_trait::async_trait]
pub trait EventSource: Send + Sync {
    async fn fetch_latest(&self) -> Result<Vec<Event>>;
    fn name(&self) -> &'static str;
}

/// Where freshly stored events go next (the correlation queue).
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn enqueue(&self, user_id: &str, event_id: &str);
}

/// Outcome of `Ingestor::ingest` for an accepted event.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "result", content = "event_id")]
pub enum IngestOutcome {
    Stored(String),
    Duplicate(String),
}

impl IngestOutcome {
    pub fn event_id(&self) -> &str {
        match self {
            IngestOutcome::Stored(id) | IngestOutcome::Duplicate(id) => id,
        }
    }
}
