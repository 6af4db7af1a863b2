//! Correlator: places each newly stored event into an existing open group or
//! starts a new one.

pub mod locks;
pub mod policy;
pub mod similarity;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Duration;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::error::CorrelateError;
use crate::model::{CorrelationGroup, Event, Platform};
use crate::store::{EventStore, GroupStore};

pub use locks::UserLocks;
pub use policy::{HotReloadPolicy, PolicySource, SimilarityPolicy, SimilarityWeights, StaticPolicy};
pub use similarity::{similarity, SimilarityBreakdown};

#[derive(Debug, Clone, Copy)]
pub struct CorrelatorSettings {
    /// Events farther apart than this never share a group.
    pub window: Duration,
    /// Minimum admission score, and minimum strength to request generation.
    pub threshold: f32,
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        Self {
            window: Duration::minutes(30),
            threshold: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Event already belongs to a group or was processed before.
    AlreadyProcessed,
    /// New singleton group.
    Created,
    /// New group pairing this event with an earlier ungrouped one.
    Seeded { partner_event_id: String },
    /// Joined an existing open group, possibly evicting its weakest member.
    Extended { evicted_event_id: Option<String> },
}

#[derive(Debug, Clone)]
pub struct CorrelationOutcome {
    pub user_id: String,
    pub event_id: String,
    pub correlation_id: Option<String>,
    pub placement: Placement,
    pub strength: f32,
    /// Hand the group to the generation queue.
    pub trigger_generation: bool,
    /// First time the group qualifies as a correlation; announce it.
    pub announce: bool,
    /// Platforms spanned by the group's members.
    pub platforms: Vec<Platform>,
}

pub struct Correlator {
    events: Arc<dyn EventStore>,
    groups: Arc<dyn GroupStore>,
    policy: Arc<dyn PolicySource>,
    locks: UserLocks,
    settings: CorrelatorSettings,
}

struct Candidate {
    group: CorrelationGroup,
    admission: f32,
    /// (member id, similarity to the new event)
    member_scores: Vec<(String, f32)>,
}

impl Correlator {
    pub fn new(
        events: Arc<dyn EventStore>,
        groups: Arc<dyn GroupStore>,
        policy: Arc<dyn PolicySource>,
        locks: UserLocks,
        settings: CorrelatorSettings,
    ) -> Self {
        Self {
            events,
            groups,
            policy,
            locks,
            settings,
        }
    }

    pub fn settings(&self) -> CorrelatorSettings {
        self.settings
    }

    /// Correlate one stored event. Idempotent per `event_id`; all group changes
    /// are committed at once or not at all.
    pub async fn process(&self, event_id: &str) -> Result<CorrelationOutcome, CorrelateError> {
        let event = self
            .events
            .by_id(event_id)
            .await?
            .ok_or_else(|| CorrelateError::EventNotFound(event_id.to_string()))?;
        if event.user_id.trim().is_empty() {
            return Err(CorrelateError::Malformed {
                event_id: event_id.to_string(),
                reason: "empty user_id".into(),
            });
        }

        let _guard = self.locks.acquire(&event.user_id).await;

        if self.groups.is_processed(event_id).await?
            || self.groups.group_of_event(event_id).await?.is_some()
        {
            debug!(target: "correlate", event_id, "event already correlated; skipping");
            return Ok(CorrelationOutcome {
                user_id: event.user_id.clone(),
                event_id: event_id.to_string(),
                correlation_id: self.groups.group_of_event(event_id).await?,
                placement: Placement::AlreadyProcessed,
                strength: 0.0,
                trigger_generation: false,
                announce: false,
                platforms: Vec::new(),
            });
        }

        let policy = self.policy.current();
        let window_start = event.timestamp - self.settings.window;
        let mut members: HashMap<String, Event> = HashMap::new();
        members.insert(event.event_id.clone(), event.clone());

        // 1) Score every eligible open group.
        let open = self
            .groups
            .open_for_user(&event.user_id, window_start)
            .await?;
        let mut best: Option<Candidate> = None;
        for group in open {
            let Some(candidate) = self
                .score_group(&event, group, &policy, &mut members)
                .await?
            else {
                continue;
            };
            let better = match &best {
                None => true,
                Some(b) => candidate.admission > b.admission,
            };
            if better {
                best = Some(candidate);
            }
        }

        let (mut group, placement) = match best {
            Some(c) if c.admission >= self.settings.threshold => {
                let evicted = self.extend(&event, &c.member_scores, c.admission, c.group.clone());
                let placement = Placement::Extended {
                    evicted_event_id: evicted.1.clone(),
                };
                if let Some(id) = &evicted.1 {
                    counter!("correlation_evictions_total").increment(1);
                    debug!(target: "correlate", correlation_id = %c.group.correlation_id, evicted = %id, "evicted weakest member");
                }
                counter!("correlation_groups_extended_total").increment(1);
                (evicted.0, placement)
            }
            _ => self.start_group(&event, &policy, window_start, &mut members).await?,
        };

        let threshold = self.settings.threshold;
        let trigger_generation = group.needs_trigger(threshold);
        if trigger_generation {
            group.mark_triggered();
        }
        let announce = group.strength >= threshold && !group.announced;
        if announce {
            group.announced = true;
        }

        let platforms = self.platforms_of(&group, &mut members).await?;
        let outcome = CorrelationOutcome {
            user_id: event.user_id.clone(),
            event_id: event.event_id.clone(),
            correlation_id: Some(group.correlation_id.clone()),
            placement,
            strength: group.strength,
            trigger_generation,
            announce,
            platforms,
        };

        self.groups.commit(&event.event_id, vec![group]).await?;

        info!(
            target: "correlate",
            user_id = %outcome.user_id,
            event_id = %outcome.event_id,
            correlation_id = ?outcome.correlation_id,
            placement = ?outcome.placement,
            strength = outcome.strength,
            trigger = outcome.trigger_generation,
            "event correlated"
        );
        Ok(outcome)
    }

    /// Admission score of `group` for `event`, or `None` if the group is not
    /// eligible (some member outside the window, or no member still stored).
    async fn score_group(
        &self,
        event: &Event,
        group: CorrelationGroup,
        policy: &SimilarityPolicy,
        cache: &mut HashMap<String, Event>,
    ) -> Result<Option<Candidate>, CorrelateError> {
        let mut member_scores = Vec::with_capacity(group.member_count());
        for id in group.member_ids() {
            let Some(member) = self.load_cached(id, cache).await? else {
                warn!(target: "correlate", correlation_id = %group.correlation_id, member = id, "group member missing from store");
                continue;
            };
            let dt = (member.timestamp - event.timestamp).abs();
            if dt > self.settings.window {
                return Ok(None);
            }
            member_scores.push((id.to_string(), similarity(event, &member, policy)));
        }
        if member_scores.is_empty() {
            return Ok(None);
        }
        let admission = member_scores
            .iter()
            .map(|(_, s)| *s)
            .fold(0.0f32, f32::max);
        Ok(Some(Candidate {
            group,
            admission,
            member_scores,
        }))
    }

    /// Admit `event` into `group`, evicting the member least similar to it
    /// when the group is already full.
    fn extend(
        &self,
        event: &Event,
        member_scores: &[(String, f32)],
        admission: f32,
        mut group: CorrelationGroup,
    ) -> (CorrelationGroup, Option<String>) {
        let mut evicted = None;
        if group.is_full() {
            let weakest = member_scores
                .iter()
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(id, _)| id.clone());
            if let Some(id) = weakest {
                if group.evict(&id) {
                    evicted = Some(id);
                }
            }
        }
        group.admit(event.event_id.clone(), admission, event.timestamp);
        (group, evicted)
    }

    /// No open group qualified: pair with the best already-processed ungrouped
    /// event in the window, or start a singleton.
    async fn start_group(
        &self,
        event: &Event,
        policy: &SimilarityPolicy,
        window_start: chrono::DateTime<chrono::Utc>,
        cache: &mut HashMap<String, Event>,
    ) -> Result<(CorrelationGroup, Placement), CorrelateError> {
        let recent = self.events.recent(&event.user_id, window_start).await?;
        let mut partner: Option<(Event, f32)> = None;
        for other in recent {
            if other.event_id == event.event_id
                || (other.timestamp - event.timestamp).abs() > self.settings.window
            {
                continue;
            }
            if !self.groups.is_processed(&other.event_id).await?
                || self.groups.group_of_event(&other.event_id).await?.is_some()
            {
                continue;
            }
            let s = similarity(event, &other, policy);
            if s >= self.settings.threshold && partner.as_ref().map_or(true, |(_, best)| s > *best) {
                partner = Some((other, s));
            }
        }

        let correlation_id = uuid::Uuid::new_v4().to_string();
        match partner {
            Some((other, s)) => {
                let (first, second) = if other.timestamp <= event.timestamp {
                    (&other, event)
                } else {
                    (event, &other)
                };
                let mut group = CorrelationGroup::new(
                    correlation_id,
                    &event.user_id,
                    &first.event_id,
                    first.timestamp,
                );
                group.admit(second.event_id.clone(), s, second.timestamp);
                cache.insert(other.event_id.clone(), other.clone());
                counter!("correlation_groups_created_total").increment(1);
                Ok((
                    group,
                    Placement::Seeded {
                        partner_event_id: other.event_id,
                    },
                ))
            }
            None => {
                counter!("correlation_groups_created_total").increment(1);
                Ok((
                    CorrelationGroup::new(
                        correlation_id,
                        &event.user_id,
                        &event.event_id,
                        event.timestamp,
                    ),
                    Placement::Created,
                ))
            }
        }
    }

    async fn platforms_of(
        &self,
        group: &CorrelationGroup,
        cache: &mut HashMap<String, Event>,
    ) -> Result<Vec<Platform>, CorrelateError> {
        let mut out = BTreeSet::new();
        for id in group.member_ids() {
            if let Some(ev) = self.load_cached(id, cache).await? {
                out.insert(ev.platform);
            }
        }
        Ok(out.into_iter().collect())
    }

    async fn load_cached(
        &self,
        id: &str,
        cache: &mut HashMap<String, Event>,
    ) -> Result<Option<Event>, CorrelateError> {
        if let Some(ev) = cache.get(id) {
            return Ok(Some(ev.clone()));
        }
        let loaded = self.events.by_id(id).await?;
        if let Some(ev) = &loaded {
            cache.insert(id.to_string(), ev.clone());
        }
        Ok(loaded)
    }
}
