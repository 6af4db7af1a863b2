// tests/pipeline_e2e.rs
//
// Full pipeline: ingest -> correlation workers -> generation workers -> board,
// with the scripted reasoning client and an in-process notification channel.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde_json::json;
use tokio::sync::broadcast;

use activity_actions::model::{Event, EventType, GroupStatus, Platform, Priority};
use activity_actions::notify::{ChannelNotifier, Notifier};
use activity_actions::reasoning::{PromptKind, ScriptedClient};
use activity_actions::{
    ActionFilter, Engine, EngineBuilder, NotifierMux, PipelineConfig, PipelineNotification,
};

fn pair(user: &str) -> (Event, Event) {
    let now = Utc::now();
    let chat = Event::new(
        format!("chat:{user}-a"),
        user,
        Platform::Chat,
        EventType::Message,
        now - Duration::minutes(5),
    )
    .with_project("core")
    .with_keywords(["urgent", "review"])
    .with_urgency(0.8)
    .with_raw(json!({"channel": "C42", "message_id": "1700000000"}));
    let pr = Event::new(
        format!("code_host:{user}-b"),
        user,
        Platform::CodeHost,
        EventType::PullRequest,
        now,
    )
    .with_project("core")
    .with_keywords(["review", "security"])
    .with_urgency(0.7)
    .with_raw(json!({"repo": "acme/core", "number": 42}));
    (chat, pr)
}

fn build(
    client: Arc<ScriptedClient>,
    snapshot: Option<&std::path::Path>,
) -> (Arc<Engine>, broadcast::Receiver<PipelineNotification>) {
    let channel = ChannelNotifier::new(64);
    let rx = channel.subscribe();
    let mut builder = EngineBuilder::new(PipelineConfig::default())
        .reasoning(client)
        .notifier(NotifierMux::new().with(Arc::new(channel)));
    if let Some(p) = snapshot {
        builder = builder.snapshot_path(p);
    }
    (builder.build().expect("engine builds"), rx)
}

fn drain(rx: &mut broadcast::Receiver<PipelineNotification>) -> Vec<PipelineNotification> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn related_pair_produces_one_action_and_two_notifications() {
    let client = Arc::new(ScriptedClient::canned());
    let (engine, mut rx) = build(client.clone(), None);

    let (a, b) = pair("alice");
    engine.ingestor().ingest(a).await.unwrap();
    engine.ingestor().ingest(b).await.unwrap();
    assert!(engine.wait_idle(StdDuration::from_secs(5)).await, "pipeline drained");

    let actions = engine
        .board()
        .list_actions("alice", ActionFilter::default())
        .await
        .unwrap();
    assert_eq!(actions.len(), 1);
    let action = &actions[0];
    assert_eq!(action.priority, Priority::High);
    assert_eq!(action.action_links.len(), 2);

    let groups = engine.board().list_groups("alice", 24).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].status, GroupStatus::ActionsGenerated);
    assert_eq!(groups[0].correlation_id, action.correlation_id);

    let notes = drain(&mut rx);
    assert_eq!(notes.len(), 2, "{notes:?}");
    match &notes[0] {
        PipelineNotification::CorrelationCreated {
            user_id,
            correlation_id,
            strength,
            platforms,
        } => {
            assert_eq!(user_id, "alice");
            assert_eq!(correlation_id, &action.correlation_id);
            assert!(*strength >= 0.3);
            assert_eq!(platforms, &vec![Platform::Chat, Platform::CodeHost]);
        }
        other => panic!("expected correlation_created first, got {other:?}"),
    }
    match &notes[1] {
        PipelineNotification::ActionGenerated {
            action_id,
            priority,
            ..
        } => {
            assert_eq!(action_id, &action.action_id);
            assert_eq!(*priority, Priority::High);
        }
        other => panic!("expected action_generated, got {other:?}"),
    }

    assert_eq!(client.calls(PromptKind::Sufficiency), 1);
    assert_eq!(client.calls(PromptKind::Generation), 1);
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_delivery_does_not_regenerate() {
    let client = Arc::new(ScriptedClient::canned());
    let (engine, _rx) = build(client.clone(), None);

    let (a, b) = pair("bob");
    for ev in [a.clone(), b.clone(), a, b] {
        engine.ingestor().ingest(ev).await.unwrap();
    }
    assert!(engine.wait_idle(StdDuration::from_secs(5)).await);

    let actions = engine
        .board()
        .list_actions("bob", ActionFilter::default())
        .await
        .unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(client.total_calls(), 2);
    assert!(engine.dead_letters().is_empty());
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_generation_leaves_group_open() {
    let client = Arc::new(ScriptedClient::canned().with_default(
        PromptKind::Generation,
        Ok(r#"{"title": "", "priority": "low"}"#.to_string()),
    ));
    let (engine, mut rx) = build(client.clone(), None);

    let (a, b) = pair("carol");
    engine.ingestor().ingest(a).await.unwrap();
    engine.ingestor().ingest(b).await.unwrap();
    assert!(engine.wait_idle(StdDuration::from_secs(5)).await);

    assert!(engine
        .board()
        .list_actions("carol", ActionFilter::default())
        .await
        .unwrap()
        .is_empty());
    let groups = engine.board().list_groups("carol", 24).await.unwrap();
    assert_eq!(groups[0].status, GroupStatus::Open);

    let notes = drain(&mut rx);
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].kind(), "correlation_created");
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshot_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("snapshot.json");

    let (engine, _rx) = build(Arc::new(ScriptedClient::canned()), Some(&path));
    let (a, b) = pair("dave");
    engine.ingestor().ingest(a.clone()).await.unwrap();
    engine.ingestor().ingest(b).await.unwrap();
    assert!(engine.wait_idle(StdDuration::from_secs(5)).await);
    engine.shutdown().await;
    assert!(path.exists(), "final snapshot written");

    let client = Arc::new(ScriptedClient::canned());
    let (restored, _rx) = build(client.clone(), Some(&path));
    let actions = restored
        .board()
        .list_actions("dave", ActionFilter::default())
        .await
        .unwrap();
    assert_eq!(actions.len(), 1);

    // Re-delivery after restart is still a duplicate.
    let again = restored.ingestor().ingest(a).await.unwrap();
    assert_eq!(again.event_id(), "chat:dave-a");
    assert!(restored.wait_idle(StdDuration::from_secs(5)).await);
    assert_eq!(client.total_calls(), 0);
    restored.shutdown().await;
}

/// A delivery channel that never answers.
struct Hung;

#[async_trait::async_trait]
impl Notifier for Hung {
    async fn notify(&self, _n: &PipelineNotification) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
    fn name(&self) -> &'static str {
        "hung"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hung_notifier_does_not_stall_workers() {
    let client = Arc::new(ScriptedClient::canned());
    let engine = EngineBuilder::new(PipelineConfig::default())
        .reasoning(client.clone())
        .notifier(NotifierMux::new().with(Arc::new(Hung)))
        .build()
        .expect("engine builds");

    let (a, b) = pair("erin");
    engine.ingestor().ingest(a).await.unwrap();
    engine.ingestor().ingest(b).await.unwrap();

    // Both notifications sit undelivered, so the engine never looks idle...
    assert!(!engine.wait_idle(StdDuration::from_millis(500)).await);
    assert_eq!(engine.pending(), 2);

    // ...but correlation and generation finished anyway.
    let actions = engine
        .board()
        .list_actions("erin", ActionFilter::default())
        .await
        .unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(client.total_calls(), 2);

    // Another user's events still flow while delivery is stuck.
    let (c, d) = pair("frank");
    engine.ingestor().ingest(c).await.unwrap();
    engine.ingestor().ingest(d).await.unwrap();
    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(5);
    loop {
        let n = engine
            .board()
            .list_actions("frank", ActionFilter::default())
            .await
            .unwrap()
            .len();
        if n == 1 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "frank's action never appeared");
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
}
