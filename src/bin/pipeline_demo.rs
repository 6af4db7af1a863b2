//! Runs two related events (a chat message and a pull request) through the
//! pipeline with the scripted reasoning client and prints what comes out.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use activity_actions::model::{Event, EventType, Platform};
use activity_actions::notify::{ChannelNotifier, LogNotifier};
use activity_actions::reasoning::ScriptedClient;
use activity_actions::{ActionFilter, EngineBuilder, NotifierMux, PipelineConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let channel = ChannelNotifier::new(16);
    let mut rx = channel.subscribe();
    let engine = EngineBuilder::new(PipelineConfig::load_default()?)
        .reasoning(Arc::new(ScriptedClient::canned()))
        .notifier(
            NotifierMux::new()
                .with(Arc::new(LogNotifier))
                .with(Arc::new(channel)),
        )
        .build()?;

    let now = Utc::now();
    let chat = Event::new("chat:demo-a", "alice", Platform::Chat, EventType::Message, now - chrono::Duration::minutes(5))
        .with_project("core")
        .with_keywords(["urgent", "review"])
        .with_urgency(0.8)
        .with_raw(json!({"channel": "C42", "message_id": "1700000000"}));
    let pr = Event::new("code_host:demo-b", "alice", Platform::CodeHost, EventType::PullRequest, now)
        .with_project("core")
        .with_keywords(["review", "security"])
        .with_urgency(0.7)
        .with_raw(json!({"repo": "acme/core", "number": 42}));

    for ev in [chat, pr] {
        let outcome = engine.ingestor().ingest(ev).await?;
        println!("ingested {}", outcome.event_id());
    }

    if !engine.wait_idle(Duration::from_secs(5)).await {
        println!("pipeline did not drain in time");
    }
    while let Ok(n) = rx.try_recv() {
        println!("notification: {}", serde_json::to_string(&n)?);
    }
    for a in engine.board().list_actions("alice", ActionFilter::default()).await? {
        println!(
            "[{:?}] {} ({} min) -> {}",
            a.priority,
            a.title,
            a.estimated_time_minutes,
            a.action_links
                .iter()
                .map(|l| l.url.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    engine.shutdown().await;
    println!("pipeline-demo done");
    Ok(())
}
