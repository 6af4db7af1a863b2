//! Action recommendations and their lifecycle.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::event::Platform;

pub const MAX_TITLE_CHARS: usize = 60;
pub const MIN_ESTIMATED_MINUTES: u32 = 5;
pub const MAX_ESTIMATED_MINUTES: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    Medium,
    Low,
    Fyi,
}

impl Priority {
    /// How long an action of this priority stays actionable.
    pub fn lifetime(&self) -> Duration {
        match self {
            Priority::Urgent => Duration::hours(4),
            Priority::High => Duration::hours(8),
            Priority::Medium => Duration::hours(24),
            Priority::Low => Duration::hours(72),
            Priority::Fyi => Duration::days(7),
        }
    }

    /// Lenient parse for model output; unknown labels yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "urgent" | "critical" => Some(Priority::Urgent),
            "high" => Some(Priority::High),
            "medium" | "normal" => Some(Priority::Medium),
            "low" => Some(Priority::Low),
            "fyi" | "info" => Some(Priority::Fyi),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
            Priority::Fyi => "fyi",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Review,
    Respond,
    Update,
    Meeting,
    FollowUp,
    Create,
    Fix,
}

impl ActionType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "review" => Some(ActionType::Review),
            "respond" | "reply" => Some(ActionType::Respond),
            "update" => Some(ActionType::Update),
            "meeting" => Some(ActionType::Meeting),
            "follow_up" | "followup" => Some(ActionType::FollowUp),
            "create" => Some(ActionType::Create),
            "fix" => Some(ActionType::Fix),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Completed,
    Dismissed,
    Expired,
}

/// Deep link into the platform where the work happens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLink {
    pub platform: Platform,
    pub url: String,
    pub label: String,
    pub action_type: ActionType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    /// 1..=5
    pub score: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecommendation {
    pub action_id: String,
    pub user_id: String,
    pub correlation_id: String,
    pub title: String,
    pub description: String,
    pub reasoning: String,
    pub priority: Priority,
    pub action_type: ActionType,
    pub estimated_time_minutes: u32,
    #[serde(default)]
    pub action_links: Vec<ActionLink>,
    #[serde(default)]
    pub related_people: BTreeSet<String>,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_notes: Option<String>,
}

impl ActionRecommendation {
    /// `expires_at` is derived from `priority`; estimated time is clamped to 5..=30.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        action_id: impl Into<String>,
        user_id: impl Into<String>,
        correlation_id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        priority: Priority,
        action_type: ActionType,
        estimated_time_minutes: u32,
        generated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            action_id: action_id.into(),
            user_id: user_id.into(),
            correlation_id: correlation_id.into(),
            title: title.into(),
            description: description.into(),
            reasoning: String::new(),
            priority,
            action_type,
            estimated_time_minutes: clamp_minutes(estimated_time_minutes),
            action_links: Vec::new(),
            related_people: BTreeSet::new(),
            generated_at,
            expires_at: generated_at + priority.lifetime(),
            status: ActionStatus::Pending,
            feedback: None,
            completion_notes: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    pub fn with_links(mut self, links: Vec<ActionLink>) -> Self {
        self.action_links = links;
        self
    }

    pub fn with_people<I, S>(mut self, people: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.related_people = people.into_iter().map(Into::into).collect();
        self
    }

    /// Still actionable at `now` (not expired by time and not closed).
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at && self.status != ActionStatus::Expired
    }
}

pub fn clamp_minutes(m: u32) -> u32 {
    m.clamp(MIN_ESTIMATED_MINUTES, MAX_ESTIMATED_MINUTES)
}
