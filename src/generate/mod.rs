//! Action generation: quota, sufficiency check, generation, quality gate,
//! deep links, persistence.

pub mod links;
pub mod prompts;
pub mod quality;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::correlate::UserLocks;
use crate::error::{ReasoningError, StoreError};
use crate::model::{ActionRecommendation, GroupStatus};
use crate::reasoning::{DynReasoningClient, Prompt, PromptKind};
use crate::store::{ActionStore, EventStore, GroupStore, QuotaCounter};
use crate::synth::{ContextBundle, ContextSynthesizer};

pub use links::LinkTemplates;
pub use prompts::{parse_draft, parse_verdict, ActionDraft, Verdict};
pub use quality::{QualityGate, Rejection};

/// Why a generation attempt did or did not produce an action.
#[derive(Debug, Clone)]
pub enum GenerationOutcome {
    Generated(ActionRecommendation),
    GroupNotFound,
    NotOpen(GroupStatus),
    /// None of the group's events are still stored.
    NoContext,
    QuotaExceeded { used: u32, limit: u32 },
    Insufficient { reason: String },
    ServiceError { stage: PromptKind, error: ReasoningError },
    Rejected(Rejection),
    Store(StoreError),
}

impl GenerationOutcome {
    /// Label for `actions_skipped_total{reason}`; `None` for a generated action.
    pub fn skip_reason(&self) -> Option<&'static str> {
        Some(match self {
            GenerationOutcome::Generated(_) => return None,
            GenerationOutcome::GroupNotFound => "group_not_found",
            GenerationOutcome::NotOpen(_) => "group_not_open",
            GenerationOutcome::NoContext => "no_context",
            GenerationOutcome::QuotaExceeded { .. } => "quota_exceeded",
            GenerationOutcome::Insufficient { .. } => "insufficient",
            GenerationOutcome::ServiceError { .. } => "service_error",
            GenerationOutcome::Rejected(r) => r.label(),
            GenerationOutcome::Store(_) => "store_error",
        })
    }

    pub fn into_action(self) -> Option<ActionRecommendation> {
        match self {
            GenerationOutcome::Generated(a) => Some(a),
            _ => None,
        }
    }
}

pub struct ActionGenerator {
    groups: Arc<dyn GroupStore>,
    actions: Arc<dyn ActionStore>,
    quota: Arc<dyn QuotaCounter>,
    synth: ContextSynthesizer,
    client: DynReasoningClient,
    gate: QualityGate,
    links: LinkTemplates,
    locks: UserLocks,
    timeout: Duration,
}

impl ActionGenerator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        events: Arc<dyn EventStore>,
        groups: Arc<dyn GroupStore>,
        actions: Arc<dyn ActionStore>,
        quota: Arc<dyn QuotaCounter>,
        client: DynReasoningClient,
        gate: QualityGate,
        links: LinkTemplates,
        locks: UserLocks,
        timeout: Duration,
    ) -> Self {
        Self {
            synth: ContextSynthesizer::new(events, groups.clone()),
            groups,
            actions,
            quota,
            client,
            gate,
            links,
            locks,
            timeout,
        }
    }

    pub fn synthesizer(&self) -> &ContextSynthesizer {
        &self.synth
    }

    /// At most one action for the group; `None` covers every skip and failure.
    pub async fn generate(&self, correlation_id: &str) -> Option<ActionRecommendation> {
        self.generate_detailed(correlation_id).await.into_action()
    }

    pub async fn generate_detailed(&self, correlation_id: &str) -> GenerationOutcome {
        self.generate_at(correlation_id, Utc::now()).await
    }

    /// Same as [`ActionGenerator::generate_detailed`] with an explicit clock.
    pub async fn generate_at(&self, correlation_id: &str, now: DateTime<Utc>) -> GenerationOutcome {
        let outcome = match self.run(correlation_id, now).await {
            Ok(o) => o,
            Err(e) => GenerationOutcome::Store(e),
        };
        match &outcome {
            GenerationOutcome::Generated(a) => {
                counter!("actions_generated_total").increment(1);
                info!(
                    target: "generate",
                    correlation_id,
                    user_id = %a.user_id,
                    action_id = %a.action_id,
                    priority = %a.priority,
                    "action generated"
                );
            }
            other => {
                let reason = other.skip_reason().unwrap_or("unknown");
                counter!("actions_skipped_total", "reason" => reason).increment(1);
                match other {
                    GenerationOutcome::ServiceError { stage, error } => {
                        warn!(target: "generate", correlation_id, stage = stage.as_str(), error = %error, "reasoning call failed; no action");
                    }
                    GenerationOutcome::Store(e) => {
                        warn!(target: "generate", correlation_id, error = %e, "store failure during generation");
                    }
                    _ => debug!(target: "generate", correlation_id, reason, "no action generated"),
                }
            }
        }
        outcome
    }

    async fn run(
        &self,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<GenerationOutcome, StoreError> {
        let Some(group) = self.groups.get(correlation_id).await? else {
            return Ok(GenerationOutcome::GroupNotFound);
        };
        if !group.is_open() {
            return Ok(GenerationOutcome::NotOpen(group.status));
        }
        let user_id = group.user_id.clone();

        // 1) Quota, before any external call.
        if let Some(exceeded) = self.quota_exceeded(&user_id, now).await? {
            return Ok(exceeded);
        }

        // 2) Context.
        let Some(bundle) = self.synth.build(correlation_id).await? else {
            return Ok(GenerationOutcome::NoContext);
        };
        debug!(
            target: "generate",
            correlation_id,
            members = bundle.member_event_ids.len(),
            bundle_hash = %crate::ingest::anon_hash(&bundle.render()),
            "context bundle ready"
        );

        // 3) Sufficiency.
        let verdict = match self.call(prompts::sufficiency_prompt(&bundle)).await {
            Ok(text) => match parse_verdict(&text) {
                Ok(v) => v,
                Err(error) => {
                    return Ok(GenerationOutcome::ServiceError {
                        stage: PromptKind::Sufficiency,
                        error,
                    })
                }
            },
            Err(error) => {
                return Ok(GenerationOutcome::ServiceError {
                    stage: PromptKind::Sufficiency,
                    error,
                })
            }
        };
        if !verdict.sufficient {
            return Ok(GenerationOutcome::Insufficient {
                reason: verdict.reason,
            });
        }

        // 4) Generation + quality gate.
        let draft = match self.call(prompts::generation_prompt(&bundle)).await {
            Ok(text) => match parse_draft(&text) {
                Ok(d) => d,
                Err(error) => {
                    return Ok(GenerationOutcome::ServiceError {
                        stage: PromptKind::Generation,
                        error,
                    })
                }
            },
            Err(error) => {
                return Ok(GenerationOutcome::ServiceError {
                    stage: PromptKind::Generation,
                    error,
                })
            }
        };
        if let Err(r) = self.gate.check(&draft.title) {
            return Ok(GenerationOutcome::Rejected(r));
        }

        // 5) Links from member events.
        let members = self.synth.member_events(&group).await?;
        let links = self.links.links_for(&members);

        // 6) Persist under the user lock.
        let _guard = self.locks.acquire(&user_id).await;
        let Some(mut group) = self.groups.get(correlation_id).await? else {
            return Ok(GenerationOutcome::GroupNotFound);
        };
        if !group.is_open() {
            return Ok(GenerationOutcome::NotOpen(group.status));
        }
        if !self.quota.try_acquire(&user_id, now).await? {
            let used = self.quota.used(&user_id, now).await?;
            return Ok(GenerationOutcome::QuotaExceeded {
                used,
                limit: self.quota.limit(),
            });
        }

        let action = build_action(&bundle, draft, links, now);
        if let Err(e) = self.actions.insert(action.clone()).await {
            self.quota.release(&user_id, now).await?;
            return Err(e);
        }
        group.status = GroupStatus::ActionsGenerated;
        if let Err(e) = self.groups.upsert(group).await {
            warn!(target: "generate", correlation_id, error = %e, "action stored but group status update failed");
        }
        Ok(GenerationOutcome::Generated(action))
    }

    async fn quota_exceeded(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<GenerationOutcome>, StoreError> {
        let limit = self.quota.limit();
        let live = self
            .actions
            .count_live_since(user_id, now - chrono::Duration::hours(24), now)
            .await? as u32;
        let used = self.quota.used(user_id, now).await?.max(live);
        Ok((used >= limit).then_some(GenerationOutcome::QuotaExceeded { used, limit }))
    }

    async fn call(&self, prompt: Prompt) -> Result<String, ReasoningError> {
        let started = Instant::now();
        let res = tokio::time::timeout(self.timeout, self.client.complete(&prompt)).await;
        histogram!("reasoning_call_ms", "kind" => prompt.kind.as_str())
            .record(started.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(inner) => inner,
            Err(_) => Err(ReasoningError::Timeout(self.timeout)),
        }
    }
}

fn build_action(
    bundle: &ContextBundle,
    draft: ActionDraft,
    links: Vec<crate::model::ActionLink>,
    now: DateTime<Utc>,
) -> ActionRecommendation {
    let description = if draft.description.is_empty() {
        bundle.key_insights.join("; ")
    } else {
        draft.description
    };
    let mut people: Vec<String> = draft
        .related_people
        .into_iter()
        .filter(|p| !p.eq_ignore_ascii_case(&bundle.user_id))
        .collect();
    if people.is_empty() {
        people = bundle.people.clone();
    }
    ActionRecommendation::new(
        uuid::Uuid::new_v4().to_string(),
        &bundle.user_id,
        &bundle.correlation_id,
        draft.title,
        description,
        draft.priority,
        draft.action_type,
        draft.estimated_time_minutes,
        now,
    )
    .with_reasoning(draft.reasoning)
    .with_links(links)
    .with_people(people)
}
