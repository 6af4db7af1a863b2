//! Deep links into the platforms where the work happens.
//!
//! Each platform has a URL template with `{field}` placeholders filled from the
//! event's raw payload. A template with an unfilled placeholder falls back to a
//! `url` field in the payload, and otherwise yields no link.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::model::{ActionLink, ActionType, Event, EventType, Platform};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkTemplates {
    pub chat: String,
    pub code_host: String,
    pub docs: String,
    pub issue_tracker: String,
    pub calendar: String,
}

impl Default for LinkTemplates {
    fn default() -> Self {
        Self {
            chat: "https://chat.example.com/archives/{channel}/p{message_id}".into(),
            code_host: "https://code.example.com/{repo}/pull/{number}".into(),
            docs: "https://docs.example.com/pages/{page_id}".into(),
            issue_tracker: "https://issues.example.com/browse/{issue_key}".into(),
            calendar: "https://calendar.example.com/event/{calendar_event_id}".into(),
        }
    }
}

impl LinkTemplates {
    fn template(&self, platform: Platform) -> &str {
        match platform {
            Platform::Chat => &self.chat,
            Platform::CodeHost => &self.code_host,
            Platform::Docs => &self.docs,
            Platform::IssueTracker => &self.issue_tracker,
            Platform::Calendar => &self.calendar,
        }
    }

    /// Link for one event, or `None` when neither the template nor the payload
    /// can produce a URL.
    pub fn link_for(&self, event: &Event) -> Option<ActionLink> {
        let url = fill(self.template(event.platform), event)
            .or_else(|| event.raw_str("url").map(str::to_string))?;
        let (label, action_type) = describe(event);
        Some(ActionLink {
            platform: event.platform,
            url,
            label,
            action_type,
        })
    }

    /// Links for a group's events, newest first, one per distinct URL.
    pub fn links_for(&self, events: &[Event]) -> Vec<ActionLink> {
        let mut seen = BTreeSet::new();
        let mut sorted: Vec<&Event> = events.iter().collect();
        sorted.sort_by(|a, b| (b.timestamp, &b.event_id).cmp(&(a.timestamp, &a.event_id)));
        sorted
            .into_iter()
            .filter_map(|e| self.link_for(e))
            .filter(|l| seen.insert(l.url.clone()))
            .collect()
    }
}

fn fill(template: &str, event: &Event) -> Option<String> {
    if template.trim().is_empty() {
        return None;
    }
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}')?;
        let key = &after[..close];
        let value = match event.raw_str(key) {
            Some(s) => s.to_string(),
            None => event.raw_u64(key)?.to_string(),
        };
        out.push_str(&encode_segment(&value));
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Some(out)
}

/// Percent-encode each path segment, keeping `/` so values like `owner/repo`
/// stay readable.
fn encode_segment(v: &str) -> String {
    v.split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn describe(event: &Event) -> (String, ActionType) {
    use EventType::*;
    match event.event_type {
        PullRequest | ReviewRequested | ReviewComment => {
            let label = match (event.raw_str("repo"), event.raw_u64("number")) {
                (Some(r), Some(n)) => format!("Open {r}#{n}"),
                _ => "Open pull request".to_string(),
            };
            (label, ActionType::Review)
        }
        Commit => ("Open commit".to_string(), ActionType::Review),
        Message | Mention | ThreadReply => {
            let label = match event.raw_str("channel") {
                Some(c) => format!("Reply in #{}", c.trim_start_matches('#')),
                None => "Reply in chat".to_string(),
            };
            (label, ActionType::Respond)
        }
        Issue => {
            let label = match event.raw_str("issue_key") {
                Some(k) => format!("Open {k}"),
                None => "Open issue".to_string(),
            };
            (label, ActionType::Fix)
        }
        PageEdit | PageComment => {
            let label = match event.raw_str("page_title") {
                Some(t) => format!("Open page: {t}"),
                None => "Open page".to_string(),
            };
            (label, ActionType::Update)
        }
        Meeting => ("Open meeting".to_string(), ActionType::Meeting),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    fn ev(id: &str, platform: Platform, ty: EventType, min: i64, raw: serde_json::Value) -> Event {
        let t = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap() + Duration::minutes(min);
        Event::new(id, "u1", platform, ty, t).with_raw(raw)
    }

    #[test]
    fn fills_templates_from_payload() {
        let t = LinkTemplates::default();
        let pr = ev(
            "b",
            Platform::CodeHost,
            EventType::PullRequest,
            5,
            json!({"repo": "acme/core", "number": 42}),
        );
        let link = t.link_for(&pr).unwrap();
        assert_eq!(link.url, "https://code.example.com/acme/core/pull/42");
        assert_eq!(link.label, "Open acme/core#42");
        assert_eq!(link.action_type, ActionType::Review);
    }

    #[test]
    fn missing_fields_fall_back_to_url_or_nothing() {
        let t = LinkTemplates::default();
        let with_url = ev(
            "a",
            Platform::Chat,
            EventType::Message,
            0,
            json!({"channel": "eng core", "url": "https://chat.example.com/x"}),
        );
        assert_eq!(t.link_for(&with_url).unwrap().url, "https://chat.example.com/x");
        let bare = ev("c", Platform::Docs, EventType::PageEdit, 0, json!({}));
        assert!(t.link_for(&bare).is_none());
    }

    #[test]
    fn links_are_deduplicated_newest_first() {
        let t = LinkTemplates::default();
        let raw = json!({"channel": "eng-core", "message_id": "1700"});
        let events = vec![
            ev("a", Platform::Chat, EventType::Message, 0, raw.clone()),
            ev("b", Platform::Chat, EventType::ThreadReply, 1, raw),
            ev("c", Platform::IssueTracker, EventType::Issue, 2, json!({"issue_key": "CORE-7"})),
        ];
        let links = t.links_for(&events);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].url, "https://issues.example.com/browse/CORE-7");
        assert_eq!(links[1].url, "https://chat.example.com/archives/eng-core/p1700");
    }

    #[test]
    fn values_are_percent_encoded() {
        assert_eq!(encode_segment("a b/c?d"), "a%20b/c%3Fd");
        assert_eq!(encode_segment("owner/repo"), "owner/repo");
        assert_eq!(encode_segment("ünï#1"), "%C3%BCn%C3%AF%231");
    }

    #[test]
    fn payload_values_with_reserved_chars_stay_inside_their_segment() {
        let t = LinkTemplates::default();
        let pr = ev(
            "b",
            Platform::CodeHost,
            EventType::PullRequest,
            5,
            json!({"repo": "acme/core tools", "number": 7}),
        );
        assert_eq!(
            t.link_for(&pr).unwrap().url,
            "https://code.example.com/acme/core%20tools/pull/7"
        );
    }
}
