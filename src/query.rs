//! Read and mutation surface over generated actions and groups.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::StoreError;
use crate::model::{
    ActionRecommendation, ActionStatus, CorrelationGroup, Feedback, Priority,
};
use crate::store::{ActionStore, GroupStore};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BoardError {
    #[error("action {0} not found")]
    NotFound(String),

    #[error("action {action_id} is {from:?}; cannot become {to:?}")]
    InvalidTransition {
        action_id: String,
        from: ActionStatus,
        to: ActionStatus,
    },

    #[error("feedback score {0} outside 1..=5")]
    InvalidScore(u8),

    #[error("store: {0}")]
    Store(String),
}

impl From<StoreError> for BoardError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { id, .. } => BoardError::NotFound(id),
            other => BoardError::Store(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionFilter {
    pub priority: Option<Priority>,
    pub status: Option<ActionStatus>,
}

impl ActionFilter {
    fn matches(&self, a: &ActionRecommendation) -> bool {
        self.priority.map_or(true, |p| p == a.priority)
            && self.status.map_or(true, |s| s == a.status)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActionStats {
    pub total: usize,
    pub pending: usize,
    pub completed: usize,
    pub dismissed: usize,
    pub expired: usize,
    pub feedback_count: usize,
    pub mean_feedback: Option<f32>,
}

#[derive(Clone)]
pub struct ActionBoard {
    actions: Arc<dyn ActionStore>,
    groups: Arc<dyn GroupStore>,
}

impl ActionBoard {
    pub fn new(actions: Arc<dyn ActionStore>, groups: Arc<dyn GroupStore>) -> Self {
        Self { actions, groups }
    }

    /// Non-expired actions, newest first.
    pub async fn list_actions(
        &self,
        user_id: &str,
        filter: ActionFilter,
    ) -> Result<Vec<ActionRecommendation>, BoardError> {
        self.list_actions_at(user_id, filter, Utc::now()).await
    }

    pub async fn list_actions_at(
        &self,
        user_id: &str,
        filter: ActionFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<ActionRecommendation>, BoardError> {
        Ok(self
            .actions
            .list_for_user(user_id)
            .await?
            .into_iter()
            .filter(|a| a.is_live(now) && filter.matches(a))
            .collect())
    }

    /// Groups of any status touched in the last `hours`, newest first.
    pub async fn list_groups(
        &self,
        user_id: &str,
        hours: i64,
    ) -> Result<Vec<CorrelationGroup>, BoardError> {
        self.list_groups_at(user_id, hours, Utc::now()).await
    }

    pub async fn list_groups_at(
        &self,
        user_id: &str,
        hours: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<CorrelationGroup>, BoardError> {
        let since = now - Duration::hours(hours.max(0));
        Ok(self.groups.list_for_user(user_id, since).await?)
    }

    pub async fn mark_completed(
        &self,
        action_id: &str,
        notes: Option<String>,
    ) -> Result<ActionRecommendation, BoardError> {
        self.transition(action_id, ActionStatus::Completed, notes, Utc::now())
            .await
    }

    pub async fn mark_dismissed(&self, action_id: &str) -> Result<ActionRecommendation, BoardError> {
        self.transition(action_id, ActionStatus::Dismissed, None, Utc::now())
            .await
    }

    /// Only pending, unexpired actions can be closed.
    pub async fn transition(
        &self,
        action_id: &str,
        to: ActionStatus,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ActionRecommendation, BoardError> {
        let mut action = self.load(action_id).await?;
        let from = if action.status == ActionStatus::Pending && !action.is_live(now) {
            ActionStatus::Expired
        } else {
            action.status
        };
        if from != ActionStatus::Pending
            || !matches!(to, ActionStatus::Completed | ActionStatus::Dismissed)
        {
            return Err(BoardError::InvalidTransition {
                action_id: action_id.to_string(),
                from,
                to,
            });
        }
        action.status = to;
        action.completion_notes = notes
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        self.actions.update(action.clone()).await?;
        tracing::info!(target: "generate", action_id, user_id = %action.user_id, status = ?to, "action closed");
        Ok(action)
    }

    /// Score must be 1..=5; a later submission replaces an earlier one.
    pub async fn submit_feedback(
        &self,
        action_id: &str,
        score: u8,
        text: Option<String>,
    ) -> Result<ActionRecommendation, BoardError> {
        if !(1..=5).contains(&score) {
            return Err(BoardError::InvalidScore(score));
        }
        let mut action = self.load(action_id).await?;
        action.feedback = Some(Feedback {
            score,
            text: text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
        });
        self.actions.update(action.clone()).await?;
        Ok(action)
    }

    pub async fn stats(&self, user_id: &str) -> Result<ActionStats, BoardError> {
        self.stats_at(user_id, Utc::now()).await
    }

    /// Pending actions past `expires_at` count as expired even before the sweep.
    pub async fn stats_at(&self, user_id: &str, now: DateTime<Utc>) -> Result<ActionStats, BoardError> {
        let mut s = ActionStats::default();
        let mut score_sum = 0u32;
        for a in self.actions.list_for_user(user_id).await? {
            s.total += 1;
            match a.status {
                ActionStatus::Pending if !a.is_live(now) => s.expired += 1,
                ActionStatus::Pending => s.pending += 1,
                ActionStatus::Completed => s.completed += 1,
                ActionStatus::Dismissed => s.dismissed += 1,
                ActionStatus::Expired => s.expired += 1,
            }
            if let Some(f) = &a.feedback {
                s.feedback_count += 1;
                score_sum += f.score as u32;
            }
        }
        if s.feedback_count > 0 {
            s.mean_feedback = Some(score_sum as f32 / s.feedback_count as f32);
        }
        Ok(s)
    }

    async fn load(&self, action_id: &str) -> Result<ActionRecommendation, BoardError> {
        self.actions
            .get(action_id)
            .await?
            .ok_or_else(|| BoardError::NotFound(action_id.to_string()))
    }
}
