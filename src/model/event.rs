//! Normalized activity events, as handed over by platform adapters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Source platform family. New families are added here as adapters appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Platform {
    Chat,
    CodeHost,
    Docs,
    IssueTracker,
    Calendar,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Chat => "chat",
            Platform::CodeHost => "code_host",
            Platform::Docs => "docs",
            Platform::IssueTracker => "issue_tracker",
            Platform::Calendar => "calendar",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Platform-specific kind of activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum EventType {
    Message,
    Mention,
    ThreadReply,
    PullRequest,
    ReviewRequested,
    ReviewComment,
    Commit,
    Issue,
    PageEdit,
    PageComment,
    Meeting,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Message => "message",
            EventType::Mention => "mention",
            EventType::ThreadReply => "thread_reply",
            EventType::PullRequest => "pull_request",
            EventType::ReviewRequested => "review_requested",
            EventType::ReviewComment => "review_comment",
            EventType::Commit => "commit",
            EventType::Issue => "issue",
            EventType::PageEdit => "page_edit",
            EventType::PageComment => "page_comment",
            EventType::Meeting => "meeting",
        }
    }

    /// Event types that ask the user to review or approve something.
    pub fn is_review_request(&self) -> bool {
        matches!(self, EventType::ReviewRequested | EventType::PullRequest)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized record of user activity on an external platform.
/// Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub platform: Platform,
    pub event_type: EventType,
    #[serde(default)]
    pub keywords: BTreeSet<String>,
    pub urgency_score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_context: Option<String>,
    #[serde(default)]
    pub mentioned_users: BTreeSet<String>,
    /// Opaque platform payload, kept for audit and link building only.
    #[serde(default)]
    pub raw_data: serde_json::Value,
}

impl Event {
    pub fn new(
        event_id: impl Into<String>,
        user_id: impl Into<String>,
        platform: Platform,
        event_type: EventType,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            timestamp,
            user_id: user_id.into(),
            platform,
            event_type,
            keywords: BTreeSet::new(),
            urgency_score: 0.0,
            project_context: None,
            mentioned_users: BTreeSet::new(),
            raw_data: serde_json::Value::Null,
        }
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_urgency(mut self, urgency: f32) -> Self {
        self.urgency_score = urgency;
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project_context = Some(project.into());
        self
    }

    pub fn with_mentions<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mentioned_users = users.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw_data = raw;
        self
    }

    /// String field from the raw payload, if the adapter provided one.
    pub fn raw_str(&self, key: &str) -> Option<&str> {
        self.raw_data
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Integer-ish field from the raw payload (numbers or numeric strings).
    pub fn raw_u64(&self, key: &str) -> Option<u64> {
        match self.raw_data.get(key)? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Outcome of `EventStore::append`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppendResult {
    Stored,
    Duplicate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn serde_uses_snake_case_tags() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let ev = Event::new("e1", "u1", Platform::CodeHost, EventType::PullRequest, ts)
            .with_keywords(["review"])
            .with_urgency(0.7);
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["platform"], json!("code_host"));
        assert_eq!(v["event_type"], json!("pull_request"));
        assert!(v.get("project_context").is_none());
    }

    #[test]
    fn raw_accessors_tolerate_shapes() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let ev = Event::new("e1", "u1", Platform::CodeHost, EventType::PullRequest, ts)
            .with_raw(json!({"repo": " acme/core ", "number": "42", "title": ""}));
        assert_eq!(ev.raw_str("repo"), Some("acme/core"));
        assert_eq!(ev.raw_u64("number"), Some(42));
        assert_eq!(ev.raw_str("title"), None);
        assert_eq!(ev.raw_str("missing"), None);
    }
}
