//! Correlation groups: sets of events believed to describe one unit of work.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Hard cap on members per group, primary included.
pub const MAX_GROUP_MEMBERS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Open,
    ActionsGenerated,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationGroup {
    pub correlation_id: String,
    pub user_id: String,
    pub primary_event_id: String,
    /// Discovery order; never contains the primary.
    #[serde(default)]
    pub related_event_ids: Vec<String>,
    /// Highest pairwise similarity observed among members. Never decreases.
    pub strength: f32,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub status: GroupStatus,
    /// Bumped on every membership change.
    #[serde(default)]
    pub mutation_seq: u64,
    /// `mutation_seq` at which generation was last requested.
    #[serde(default)]
    pub triggered_seq: Option<u64>,
    /// Whether `correlation_created` has been announced for this group.
    #[serde(default)]
    pub announced: bool,
}

impl CorrelationGroup {
    /// New singleton group seeded by `primary_event_id`.
    pub fn new(
        correlation_id: impl Into<String>,
        user_id: impl Into<String>,
        primary_event_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            user_id: user_id.into(),
            primary_event_id: primary_event_id.into(),
            related_event_ids: Vec::new(),
            strength: 0.0,
            created_at: now,
            last_updated_at: now,
            status: GroupStatus::Open,
            mutation_seq: 0,
            triggered_seq: None,
            announced: false,
        }
    }

    /// All member ids, primary first.
    pub fn member_ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary_event_id.as_str())
            .chain(self.related_event_ids.iter().map(String::as_str))
    }

    pub fn member_count(&self) -> usize {
        1 + self.related_event_ids.len()
    }

    pub fn is_full(&self) -> bool {
        self.member_count() >= MAX_GROUP_MEMBERS
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.member_ids().any(|id| id == event_id)
    }

    pub fn is_open(&self) -> bool {
        self.status == GroupStatus::Open
    }

    /// Open groups go stale `ttl` after their last update.
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now.signed_duration_since(self.last_updated_at) >= ttl
    }

    /// Append a member and fold `similarity` into `strength`.
    pub fn admit(&mut self, event_id: impl Into<String>, similarity: f32, now: DateTime<Utc>) {
        self.related_event_ids.push(event_id.into());
        self.strength = self.strength.max(similarity.clamp(0.0, 1.0));
        self.touch(now);
    }

    /// Remove a member. Evicting the primary promotes the oldest related event.
    /// Returns false if the id was not a member or is the only member.
    pub fn evict(&mut self, event_id: &str) -> bool {
        if self.primary_event_id == event_id {
            if self.related_event_ids.is_empty() {
                return false;
            }
            self.primary_event_id = self.related_event_ids.remove(0);
            return true;
        }
        let before = self.related_event_ids.len();
        self.related_event_ids.retain(|id| id != event_id);
        before != self.related_event_ids.len()
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_updated_at {
            self.last_updated_at = now;
        }
        self.mutation_seq += 1;
    }

    /// True when the latest mutation has not yet requested generation.
    pub fn needs_trigger(&self, threshold: f32) -> bool {
        self.is_open() && self.strength >= threshold && self.triggered_seq != Some(self.mutation_seq)
    }

    pub fn mark_triggered(&mut self) {
        self.triggered_seq = Some(self.mutation_seq);
    }
}
