// tests/action_generation.rs
//
// Generator behavior against in-memory stores and the scripted reasoning client.
//
// Covered:
// - success path (links, priority expiry, group status)
// - quota exhaustion makes zero reasoning calls (including at the default 20)
// - "insufficient" verdict makes zero generation calls
// - empty / generic titles are not persisted and leave the group open
// - reasoning errors and timeouts yield no action

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

use activity_actions::config::pipeline::GenerationSection;
use activity_actions::correlate::{Correlator, CorrelatorSettings, StaticPolicy, UserLocks};
use activity_actions::error::ReasoningError;
use activity_actions::generate::{
    ActionGenerator, GenerationOutcome, LinkTemplates, QualityGate, Rejection,
};
use activity_actions::model::{
    ActionRecommendation, ActionType, Event, EventType, GroupStatus, Platform, Priority,
};
use activity_actions::reasoning::{PromptKind, ScriptedClient};
use activity_actions::store::{
    ActionStore, EventStore, GroupStore, MemoryActionStore, MemoryEventStore, MemoryGroupStore,
    QuotaCounter, RollingQuota,
};

fn t(min: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap() + Duration::minutes(min)
}

struct Harness {
    events: Arc<MemoryEventStore>,
    groups: Arc<MemoryGroupStore>,
    actions: Arc<MemoryActionStore>,
    quota: Arc<RollingQuota>,
    client: Arc<ScriptedClient>,
    correlator: Correlator,
    generator: ActionGenerator,
}

impl Harness {
    fn new(client: ScriptedClient, daily_limit: u32, timeout: StdDuration) -> Self {
        let events = Arc::new(MemoryEventStore::new());
        let groups = Arc::new(MemoryGroupStore::new());
        let actions = Arc::new(MemoryActionStore::new());
        let quota = Arc::new(RollingQuota::daily(daily_limit));
        let client = Arc::new(client);
        let locks = UserLocks::new();
        let correlator = Correlator::new(
            events.clone(),
            groups.clone(),
            Arc::new(StaticPolicy::default()),
            locks.clone(),
            CorrelatorSettings::default(),
        );
        let generator = ActionGenerator::new(
            events.clone(),
            groups.clone(),
            actions.clone(),
            quota.clone(),
            client.clone(),
            QualityGate::default(),
            LinkTemplates::default(),
            locks,
            timeout,
        );
        Self {
            events,
            groups,
            actions,
            quota,
            client,
            correlator,
            generator,
        }
    }

    fn with_client(client: ScriptedClient) -> Self {
        Self::new(client, 20, StdDuration::from_secs(8))
    }

    /// Stores the chat message + pull request pair and correlates it.
    async fn correlated_pair(&self) -> String {
        let chat = Event::new("chat:a", "u1", Platform::Chat, EventType::Message, t(0))
            .with_project("core")
            .with_keywords(["urgent", "review"])
            .with_urgency(0.8)
            .with_raw(json!({"channel": "C42", "message_id": "1700000000"}));
        let pr = Event::new("code_host:b", "u1", Platform::CodeHost, EventType::PullRequest, t(5))
            .with_project("core")
            .with_keywords(["review", "security"])
            .with_urgency(0.7)
            .with_raw(json!({"repo": "acme/core", "number": 42}));
        self.events.append(chat).await.unwrap();
        self.events.append(pr).await.unwrap();
        self.correlator.process("chat:a").await.unwrap();
        let out = self.correlator.process("code_host:b").await.unwrap();
        assert!(out.trigger_generation, "pair should trigger generation");
        out.correlation_id.expect("pair should be grouped")
    }

    async fn group_status(&self, cid: &str) -> GroupStatus {
        self.groups.get(cid).await.unwrap().unwrap().status
    }
}

fn draft_with_title(title: &str) -> String {
    json!({
        "title": title,
        "description": "desc",
        "priority": "medium",
        "action_type": "review",
        "estimated_time_minutes": 15
    })
    .to_string()
}

#[tokio::test]
async fn generates_one_linked_action_and_closes_group() {
    let h = Harness::with_client(ScriptedClient::canned());
    let cid = h.correlated_pair().await;
    let now = t(10);

    let action = h
        .generator
        .generate_at(&cid, now)
        .await
        .into_action()
        .expect("action generated");

    assert_eq!(action.title, "Review auth token refresh PR");
    assert_eq!(action.priority, Priority::High);
    assert_eq!(action.action_type, ActionType::Review);
    assert_eq!(action.estimated_time_minutes, 20);
    assert_eq!(action.expires_at, now + Priority::High.lifetime());
    assert_eq!(action.correlation_id, cid);
    assert!(action.related_people.contains("bob"));

    let urls: Vec<&str> = action.action_links.iter().map(|l| l.url.as_str()).collect();
    assert_eq!(
        urls,
        vec![
            "https://code.example.com/acme/core/pull/42",
            "https://chat.example.com/archives/C42/p1700000000",
        ]
    );

    assert_eq!(h.client.calls(PromptKind::Sufficiency), 1);
    assert_eq!(h.client.calls(PromptKind::Generation), 1);
    assert_eq!(h.group_status(&cid).await, GroupStatus::ActionsGenerated);
    assert_eq!(h.actions.list_for_user("u1").await.unwrap().len(), 1);
    assert_eq!(h.quota.used("u1", now).await.unwrap(), 1);

    // A closed group never yields a second action.
    let again = h.generator.generate_at(&cid, now).await;
    assert!(matches!(again, GenerationOutcome::NotOpen(GroupStatus::ActionsGenerated)));
    assert_eq!(h.client.total_calls(), 2);
}

#[tokio::test]
async fn exhausted_quota_makes_no_reasoning_calls() {
    let h = Harness::new(ScriptedClient::canned(), 1, StdDuration::from_secs(8));
    let cid = h.correlated_pair().await;
    let now = t(10);
    assert!(h.quota.try_acquire("u1", now).await.unwrap());

    let out = h.generator.generate_at(&cid, now).await;
    assert!(matches!(out, GenerationOutcome::QuotaExceeded { used: 1, limit: 1 }));
    assert_eq!(h.client.total_calls(), 0);
    assert_eq!(h.group_status(&cid).await, GroupStatus::Open);
}

#[tokio::test]
async fn live_actions_count_against_quota() {
    let h = Harness::new(ScriptedClient::canned(), 1, StdDuration::from_secs(8));
    let cid = h.correlated_pair().await;
    let now = t(60);
    h.actions
        .insert(ActionRecommendation::new(
            "earlier",
            "u1",
            "other-group",
            "Reply to design thread",
            "",
            Priority::Medium,
            ActionType::Respond,
            10,
            t(0),
        ))
        .await
        .unwrap();

    let out = h.generator.generate_at(&cid, now).await;
    assert!(matches!(out, GenerationOutcome::QuotaExceeded { .. }));
    assert_eq!(h.client.total_calls(), 0);
}

async fn seed_live_actions(h: &Harness, n: usize) {
    for i in 0..n {
        h.actions
            .insert(ActionRecommendation::new(
                format!("earlier-{i}"),
                "u1",
                format!("other-group-{i}"),
                format!("Reply to design thread {i}"),
                "",
                Priority::Medium,
                ActionType::Respond,
                10,
                t(i as i64),
            ))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn default_daily_limit_blocks_the_twenty_first_action() {
    let limit = GenerationSection::default().daily_limit;
    assert_eq!(limit, 20);
    let h = Harness::new(ScriptedClient::canned(), limit, StdDuration::from_secs(8));
    let cid = h.correlated_pair().await;
    seed_live_actions(&h, limit as usize).await;

    let out = h.generator.generate_at(&cid, t(60)).await;
    assert!(
        matches!(out, GenerationOutcome::QuotaExceeded { used: 20, limit: 20 }),
        "{out:?}"
    );
    assert_eq!(h.client.total_calls(), 0);
    assert_eq!(h.group_status(&cid).await, GroupStatus::Open);
    assert_eq!(h.actions.list_for_user("u1").await.unwrap().len(), 20);
}

#[tokio::test]
async fn nineteen_live_actions_leave_room_for_one_more() {
    let h = Harness::with_client(ScriptedClient::canned());
    let cid = h.correlated_pair().await;
    seed_live_actions(&h, 19).await;

    let out = h.generator.generate_at(&cid, t(60)).await;
    assert!(out.into_action().is_some());
    assert_eq!(h.client.total_calls(), 2);
    assert_eq!(h.actions.list_for_user("u1").await.unwrap().len(), 20);
}

#[tokio::test]
async fn insufficient_verdict_skips_generation_call() {
    let client = ScriptedClient::canned().with_default(
        PromptKind::Sufficiency,
        Ok(r#"{"sufficient": false, "reason": "routine chatter"}"#.to_string()),
    );
    let h = Harness::with_client(client);
    let cid = h.correlated_pair().await;

    let out = h.generator.generate_at(&cid, t(10)).await;
    match out {
        GenerationOutcome::Insufficient { reason } => assert_eq!(reason, "routine chatter"),
        other => panic!("expected Insufficient, got {other:?}"),
    }
    assert_eq!(h.client.calls(PromptKind::Sufficiency), 1);
    assert_eq!(h.client.calls(PromptKind::Generation), 0);
    assert!(h.actions.list_for_user("u1").await.unwrap().is_empty());
    assert_eq!(h.group_status(&cid).await, GroupStatus::Open);
}

#[tokio::test]
async fn empty_title_is_not_persisted_and_group_stays_open() {
    let client = ScriptedClient::canned()
        .with_default(PromptKind::Generation, Ok(draft_with_title("")));
    let h = Harness::with_client(client);
    let cid = h.correlated_pair().await;
    let now = t(10);

    let out = h.generator.generate_at(&cid, now).await;
    assert!(matches!(out, GenerationOutcome::Rejected(Rejection::EmptyTitle)));
    assert!(h.actions.list_for_user("u1").await.unwrap().is_empty());
    assert_eq!(h.group_status(&cid).await, GroupStatus::Open);
    assert_eq!(h.quota.used("u1", now).await.unwrap(), 0);
}

#[tokio::test]
async fn generic_title_is_rejected() {
    let client = ScriptedClient::canned()
        .with_default(PromptKind::Generation, Ok(draft_with_title("Check messages")));
    let h = Harness::with_client(client);
    let cid = h.correlated_pair().await;

    let out = h.generator.generate_at(&cid, t(10)).await;
    assert!(matches!(out, GenerationOutcome::Rejected(Rejection::Generic(_))));
    assert_eq!(h.group_status(&cid).await, GroupStatus::Open);
}

#[tokio::test]
async fn reasoning_failure_yields_no_action() {
    let client = ScriptedClient::canned();
    client.push(PromptKind::Sufficiency, Err(ReasoningError::Http(503)));
    let h = Harness::with_client(client);
    let cid = h.correlated_pair().await;

    let out = h.generator.generate_at(&cid, t(10)).await;
    assert!(matches!(
        out,
        GenerationOutcome::ServiceError {
            stage: PromptKind::Sufficiency,
            error: ReasoningError::Http(503)
        }
    ));
    assert_eq!(h.client.calls(PromptKind::Generation), 0);
    assert_eq!(h.group_status(&cid).await, GroupStatus::Open);

    // The scripted failure is used up; the next trigger succeeds.
    assert!(h.generator.generate_at(&cid, t(11)).await.into_action().is_some());
}

#[tokio::test(start_paused = true)]
async fn slow_reasoning_call_times_out() {
    let client = ScriptedClient::canned().with_delay(StdDuration::from_secs(30));
    let h = Harness::new(client, 20, StdDuration::from_secs(8));
    let cid = h.correlated_pair().await;

    let out = h.generator.generate_at(&cid, t(10)).await;
    assert!(matches!(
        out,
        GenerationOutcome::ServiceError {
            stage: PromptKind::Sufficiency,
            error: ReasoningError::Timeout(_)
        }
    ));
    assert!(h.actions.list_for_user("u1").await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_group_is_reported() {
    let h = Harness::with_client(ScriptedClient::canned());
    assert!(matches!(
        h.generator.generate_at("nope", t(0)).await,
        GenerationOutcome::GroupNotFound
    ));
    assert_eq!(h.client.total_calls(), 0);
}
