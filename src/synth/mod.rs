//! Context synthesis: turn a correlation group into a structured bundle the
//! reasoning service can read. Deterministic for a given group and event set.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreResult;
use crate::ingest::{normalize_text, truncate_chars};
use crate::model::{CorrelationGroup, Event, EventType, Platform};
use crate::store::{EventStore, GroupStore};

const MAX_PREVIEWS_PER_PLATFORM: usize = 3;
const PREVIEW_CHARS: usize = 140;
const HIGH_URGENCY: f32 = 0.5;
const URGENT_KEYWORDS: &[&str] = &[
    "urgent", "asap", "blocker", "blocking", "critical", "hotfix", "security", "outage",
    "incident", "deadline", "prod",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventPreview {
    pub event_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformSlice {
    pub platform: Platform,
    pub event_count: usize,
    /// Channel, repository, page, issue key or meeting title.
    pub identifiers: Vec<String>,
    /// Most recent first.
    pub previews: Vec<EventPreview>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UrgencySignals {
    pub high_urgency_events: usize,
    pub urgent_keywords: Vec<String>,
    pub review_requests: usize,
    pub direct_mentions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextBundle {
    pub correlation_id: String,
    pub user_id: String,
    pub strength: f32,
    pub project: Option<String>,
    pub member_event_ids: Vec<String>,
    pub platforms: Vec<PlatformSlice>,
    pub key_insights: Vec<String>,
    pub urgency_signals: Vec<String>,
    pub signals: UrgencySignals,
    pub people: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

pub struct ContextSynthesizer {
    events: Arc<dyn EventStore>,
    groups: Arc<dyn GroupStore>,
}

impl ContextSynthesizer {
    pub fn new(events: Arc<dyn EventStore>, groups: Arc<dyn GroupStore>) -> Self {
        Self { events, groups }
    }

    /// `None` when the group is unknown or none of its events are still stored.
    pub async fn build(&self, correlation_id: &str) -> StoreResult<Option<ContextBundle>> {
        let Some(group) = self.groups.get(correlation_id).await? else {
            return Ok(None);
        };
        let mut members = Vec::with_capacity(group.member_count());
        for id in group.member_ids() {
            if let Some(ev) = self.events.by_id(id).await? {
                members.push(ev);
            }
        }
        Ok(synthesize(&group, members))
    }

    /// Member events of a group, oldest first. Missing events are skipped.
    pub async fn member_events(&self, group: &CorrelationGroup) -> StoreResult<Vec<Event>> {
        let mut members = Vec::with_capacity(group.member_count());
        for id in group.member_ids() {
            if let Some(ev) = self.events.by_id(id).await? {
                members.push(ev);
            }
        }
        members.sort_by(|a, b| (a.timestamp, &a.event_id).cmp(&(b.timestamp, &b.event_id)));
        Ok(members)
    }
}

/// Pure bundle construction from a group and whatever member events exist.
pub fn synthesize(group: &CorrelationGroup, mut events: Vec<Event>) -> Option<ContextBundle> {
    if events.is_empty() {
        return None;
    }
    events.sort_by(|a, b| (a.timestamp, &a.event_id).cmp(&(b.timestamp, &b.event_id)));
    let first_seen = events.first()?.timestamp;
    let last_seen = events.last()?.timestamp;

    let platforms = platform_breakdown(&events);
    let project = dominant_project(&events);
    let people = people_involved(&events, &group.user_id);
    let signals = urgency(&events, &group.user_id);

    let key_insights = insights(&platforms, project.as_deref(), &events, &people, first_seen, last_seen);
    let urgency_signals = describe_urgency(&signals);

    Some(ContextBundle {
        correlation_id: group.correlation_id.clone(),
        user_id: group.user_id.clone(),
        strength: group.strength,
        project,
        member_event_ids: events.iter().map(|e| e.event_id.clone()).collect(),
        platforms,
        key_insights,
        urgency_signals,
        signals,
        people,
        first_seen,
        last_seen,
    })
}

fn identifier(ev: &Event) -> Option<String> {
    match ev.platform {
        Platform::Chat => ev.raw_str("channel").map(|c| {
            if c.starts_with('#') {
                c.to_string()
            } else {
                format!("#{c}")
            }
        }),
        Platform::CodeHost => ev.raw_str("repo").map(|r| match ev.raw_u64("number") {
            Some(n) => format!("{r}#{n}"),
            None => r.to_string(),
        }),
        Platform::Docs => ev.raw_str("page_title").or_else(|| ev.raw_str("page_id")).map(str::to_string),
        Platform::IssueTracker => ev.raw_str("issue_key").map(str::to_string),
        Platform::Calendar => ev.raw_str("title").map(str::to_string),
    }
}

fn preview_text(ev: &Event) -> String {
    let raw = ev
        .raw_str("text")
        .or_else(|| ev.raw_str("title"))
        .or_else(|| ev.raw_str("summary"));
    match raw.map(normalize_text).filter(|s| !s.is_empty()) {
        Some(text) => truncate_chars(&text, PREVIEW_CHARS),
        None => format!("{} on {}", ev.event_type, ev.platform),
    }
}

fn platform_breakdown(events: &[Event]) -> Vec<PlatformSlice> {
    let mut by_platform: BTreeMap<Platform, Vec<&Event>> = BTreeMap::new();
    for ev in events {
        by_platform.entry(ev.platform).or_default().push(ev);
    }
    by_platform
        .into_iter()
        .map(|(platform, evs)| {
            let identifiers: BTreeSet<String> = evs.iter().filter_map(|e| identifier(e)).collect();
            let previews = evs
                .iter()
                .rev()
                .take(MAX_PREVIEWS_PER_PLATFORM)
                .map(|e| EventPreview {
                    event_id: e.event_id.clone(),
                    event_type: e.event_type,
                    timestamp: e.timestamp,
                    text: preview_text(e),
                })
                .collect();
            PlatformSlice {
                platform,
                event_count: evs.len(),
                identifiers: identifiers.into_iter().collect(),
                previews,
            }
        })
        .collect()
}

/// Most frequent project; ties go to the alphabetically first.
fn dominant_project(events: &[Event]) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for p in events.iter().filter_map(|e| e.project_context.as_deref()) {
        *counts.entry(p).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0)))
        .map(|(p, _)| p.to_string())
}

fn top_keywords(events: &[Event], n: usize) -> Vec<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for kw in events.iter().flat_map(|e| e.keywords.iter()) {
        *counts.entry(kw.as_str()).or_default() += 1;
    }
    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    ranked.into_iter().take(n).map(|(k, _)| k.to_string()).collect()
}

fn people_involved(events: &[Event], user_id: &str) -> Vec<String> {
    let mut people = BTreeSet::new();
    for ev in events {
        for p in &ev.mentioned_users {
            if !p.eq_ignore_ascii_case(user_id) {
                people.insert(p.clone());
            }
        }
        if let Some(author) = ev.raw_str("author") {
            if !author.eq_ignore_ascii_case(user_id) {
                people.insert(author.to_lowercase());
            }
        }
    }
    people.into_iter().collect()
}

fn urgency(events: &[Event], user_id: &str) -> UrgencySignals {
    let urgent_keywords: BTreeSet<String> = events
        .iter()
        .flat_map(|e| e.keywords.iter())
        .filter(|k| URGENT_KEYWORDS.contains(&k.as_str()))
        .cloned()
        .collect();
    UrgencySignals {
        high_urgency_events: events.iter().filter(|e| e.urgency_score > HIGH_URGENCY).count(),
        urgent_keywords: urgent_keywords.into_iter().collect(),
        review_requests: events.iter().filter(|e| e.event_type.is_review_request()).count(),
        direct_mentions: events
            .iter()
            .filter(|e| e.mentioned_users.iter().any(|m| m.eq_ignore_ascii_case(user_id)))
            .count(),
    }
}

fn insights(
    platforms: &[PlatformSlice],
    project: Option<&str>,
    events: &[Event],
    people: &[String],
    first: DateTime<Utc>,
    last: DateTime<Utc>,
) -> Vec<String> {
    let mut out = Vec::new();
    let names: Vec<&str> = platforms.iter().map(|p| p.platform.as_str()).collect();
    if names.len() > 1 {
        out.push(format!("Activity spans {} platforms: {}", names.len(), names.join(", ")));
    } else {
        out.push(format!("All activity on {}", names.join("")));
    }
    if let Some(p) = project {
        out.push(format!("Work relates to project '{p}'"));
    }
    let kws = top_keywords(events, 3);
    if !kws.is_empty() {
        out.push(format!("Recurring keywords: {}", kws.join(", ")));
    }
    if events.len() > 1 {
        let minutes = last.signed_duration_since(first).num_minutes();
        out.push(format!("{} events within {} minutes", events.len(), minutes));
    }
    if !people.is_empty() {
        out.push(format!("People involved: {}", people.join(", ")));
    }
    out
}

fn describe_urgency(s: &UrgencySignals) -> Vec<String> {
    let mut out = Vec::new();
    if s.high_urgency_events > 0 {
        out.push(format!(
            "{} event(s) with urgency above {HIGH_URGENCY}",
            s.high_urgency_events
        ));
    }
    if !s.urgent_keywords.is_empty() {
        out.push(format!("High-urgency keywords: {}", s.urgent_keywords.join(", ")));
    }
    if s.review_requests > 0 {
        out.push(format!("Review or approval requested ({})", s.review_requests));
    }
    if s.direct_mentions > 0 {
        out.push(format!("User mentioned directly ({})", s.direct_mentions));
    }
    out
}

impl ContextBundle {
    /// Stable plain-text rendering used as the prompt body.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Correlation {} (strength {:.2}, {} events)",
            self.correlation_id,
            self.strength,
            self.member_event_ids.len()
        );
        if let Some(p) = &self.project {
            let _ = writeln!(out, "Project: {p}");
        }
        let _ = writeln!(
            out,
            "Window: {} .. {}",
            self.first_seen.to_rfc3339(),
            self.last_seen.to_rfc3339()
        );
        out.push_str("Platforms:\n");
        for slice in &self.platforms {
            let _ = write!(out, "- {} ({} events)", slice.platform, slice.event_count);
            if !slice.identifiers.is_empty() {
                let _ = write!(out, " [{}]", slice.identifiers.join(", "));
            }
            out.push('\n');
            for p in &slice.previews {
                let _ = writeln!(
                    out,
                    "  * {} {}: {}",
                    p.timestamp.format("%Y-%m-%d %H:%M"),
                    p.event_type,
                    p.text
                );
            }
        }
        out.push_str("Key insights:\n");
        for i in &self.key_insights {
            let _ = writeln!(out, "- {i}");
        }
        out.push_str("Urgency signals:\n");
        if self.urgency_signals.is_empty() {
            out.push_str("- none\n");
        }
        for u in &self.urgency_signals {
            let _ = writeln!(out, "- {u}");
        }
        out
    }

    pub fn platform_set(&self) -> Vec<Platform> {
        self.platforms.iter().map(|p| p.platform).collect()
    }
}
