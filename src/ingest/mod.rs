// src/ingest/mod.rs
pub mod retention;
pub mod types;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use sha2::{Digest, Sha256};

use crate::error::IngestError;
use crate::ingest::types::{EventSink, EventSource, IngestOutcome};
use crate::model::{AppendResult, Event, Platform};
use crate::store::EventStore;

/// Keywords kept per event after normalization.
pub const MAX_KEYWORDS: usize = 32;

/// Normalize text: decode entities, strip tags, collapse whitespace, trim.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: once_cell::sync::OnceCell<Option<regex::Regex>> =
        once_cell::sync::OnceCell::new();
    if let Some(re) = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").ok()) {
        out = re.replace_all(&out, "").to_string();
    }

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cut `s` to at most `max` chars, appending an ellipsis when shortened.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Stable idempotency key: platform prefix + sha256 prefix of the natural key
/// (e.g. channel + message ts, repo + PR number).
pub fn derive_event_id(platform: Platform, natural_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(platform.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(natural_key.trim().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(platform.as_str().len() + 1 + 32);
    out.push_str(platform.as_str());
    out.push(':');
    for b in digest.iter().take(16) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Short anonymized id for logging user text without logging the text.
pub fn anon_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(12);
    for b in digest.iter().take(6) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

fn normalize_set<'a>(items: impl IntoIterator<Item = &'a String>, strip: char) -> BTreeSet<String> {
    items
        .into_iter()
        .map(|s| s.trim().trim_start_matches(strip).trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Validate and canonicalize an adapter event. Pure; `now` is injected.
pub fn validate_event(
    mut event: Event,
    now: DateTime<Utc>,
    max_future_skew: Duration,
) -> Result<Event, IngestError> {
    event.event_id = event.event_id.trim().to_string();
    event.user_id = event.user_id.trim().to_string();
    if event.event_id.is_empty() {
        return Err(IngestError::MissingField("event_id"));
    }
    if event.user_id.is_empty() {
        return Err(IngestError::MissingField("user_id"));
    }
    if !event.urgency_score.is_finite() || !(0.0..=1.0).contains(&event.urgency_score) {
        return Err(IngestError::UrgencyOutOfRange(event.urgency_score));
    }
    let ahead = event.timestamp.signed_duration_since(now);
    if ahead > max_future_skew {
        return Err(IngestError::FromTheFuture(ahead.num_seconds()));
    }

    let mut keywords: BTreeSet<String> = normalize_set(&event.keywords, '#');
    while keywords.len() > MAX_KEYWORDS {
        keywords.pop_last();
    }
    event.keywords = keywords;
    event.mentioned_users = normalize_set(&event.mentioned_users, '@');
    event.project_context = event
        .project_context
        .map(|p| normalize_text(&p))
        .filter(|p| !p.is_empty());
    Ok(event)
}

/// Ingestion boundary: validate, append, hand off to correlation.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn EventStore>,
    sink: Option<Arc<dyn EventSink>>,
    max_future_skew: Duration,
}

impl Ingestor {
    pub fn new(store: Arc<dyn EventStore>, max_future_skew: Duration) -> Self {
        crate::metrics::ensure_metrics_described();
        Self {
            store,
            sink: None,
            max_future_skew,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub async fn ingest(&self, event: Event) -> Result<IngestOutcome, IngestError> {
        self.ingest_at(event, Utc::now()).await
    }

    /// Same as [`Ingestor::ingest`] with an explicit clock.
    pub async fn ingest_at(
        &self,
        event: Event,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, IngestError> {
        let event = match validate_event(event, now, self.max_future_skew) {
            Ok(ev) => ev,
            Err(e) => {
                counter!("events_rejected_total").increment(1);
                tracing::warn!(target: "ingest", error = %e, "event rejected at ingest boundary");
                return Err(e);
            }
        };
        let (user_id, event_id) = (event.user_id.clone(), event.event_id.clone());

        match self.store.append(event).await? {
            AppendResult::Duplicate => {
                counter!("events_duplicate_total").increment(1);
                tracing::debug!(target: "ingest", %user_id, %event_id, "duplicate event ignored");
                Ok(IngestOutcome::Duplicate(event_id))
            }
            AppendResult::Stored => {
                counter!("events_ingested_total").increment(1);
                tracing::debug!(target: "ingest", %user_id, %event_id, "event stored");
                if let Some(sink) = &self.sink {
                    sink.enqueue(&user_id, &event_id).await;
                }
                Ok(IngestOutcome::Stored(event_id))
            }
        }
    }

    /// Pull once from each adapter and ingest everything it returned.
    /// Returns (stored, duplicates, rejected).
    pub async fn run_sources_once(&self, sources: &[Box<dyn EventSource>]) -> (usize, usize, usize) {
        let (mut stored, mut dup, mut rejected) = (0, 0, 0);
        for src in sources {
            let batch = match src.fetch_latest().await {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(target: "ingest", error = ?e, source = src.name(), "source error");
                    continue;
                }
            };
            for ev in batch {
                match self.ingest(ev).await {
                    Ok(IngestOutcome::Stored(_)) => stored += 1,
                    Ok(IngestOutcome::Duplicate(_)) => dup += 1,
                    Err(_) => rejected += 1,
                }
            }
        }
        tracing::info!(target: "ingest", stored, duplicates = dup, rejected, "source poll finished");
        (stored, dup, rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventType;
    use crate::store::MemoryEventStore;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<String>>);

    #[async_trait::async_trait]
    impl EventSink for RecordingSink {
        async fn enqueue(&self, _user_id: &str, event_id: &str) {
            self.0.lock().push(event_id.to_string());
        }
    }

    #[test]
    fn normalize_text_decodes_and_collapses() {
        let s = "  Hello,&nbsp;&nbsp; <b>world</b>\n\n “ok” ";
        assert_eq!(normalize_text(s), "Hello, world \"ok\"");
    }

    #[test]
    fn derived_ids_are_stable_and_platform_scoped() {
        let a = derive_event_id(Platform::Chat, "C42/1700000000.0001");
        let b = derive_event_id(Platform::Chat, " C42/1700000000.0001 ");
        let c = derive_event_id(Platform::CodeHost, "C42/1700000000.0001");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("chat:"));
        assert_eq!(a.len(), "chat:".len() + 32);
    }

    #[test]
    fn validation_canonicalizes_sets() {
        let ev = Event::new(" e1 ", "u1", Platform::Chat, EventType::Message, now())
            .with_keywords(["#Review", " AUTH ", ""])
            .with_mentions(["@Alice", "bob"])
            .with_project("  ");
        let ev = validate_event(ev, now(), Duration::minutes(5)).unwrap();
        assert_eq!(ev.event_id, "e1");
        assert_eq!(
            ev.keywords.iter().cloned().collect::<Vec<_>>(),
            vec!["auth".to_string(), "review".to_string()]
        );
        assert!(ev.mentioned_users.contains("alice"));
        assert!(ev.project_context.is_none());
    }

    #[test]
    fn validation_rejects_bad_input() {
        let base = || Event::new("e1", "u1", Platform::Chat, EventType::Message, now());
        let skew = Duration::minutes(5);
        assert_eq!(
            validate_event(base().with_urgency(1.5), now(), skew),
            Err(IngestError::UrgencyOutOfRange(1.5))
        );
        let mut no_user = base();
        no_user.user_id = " ".into();
        assert_eq!(
            validate_event(no_user, now(), skew),
            Err(IngestError::MissingField("user_id"))
        );
        let mut future = base();
        future.timestamp = now() + Duration::hours(1);
        assert!(matches!(
            validate_event(future, now(), skew),
            Err(IngestError::FromTheFuture(3600))
        ));
    }

    struct FixedSource(Vec<Event>);

    #[async_trait::async_trait]
    impl EventSource for FixedSource {
        async fn fetch_latest(&self) -> anyhow::Result<Vec<Event>> {
            Ok(self.0.clone())
        }
        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    struct BrokenSource;

    #[async_trait::async_trait]
    impl EventSource for BrokenSource {
        async fn fetch_latest(&self) -> anyhow::Result<Vec<Event>> {
            anyhow::bail!("adapter offline")
        }
        fn name(&self) -> &'static str {
            "broken"
        }
    }

    #[tokio::test]
    async fn source_poll_counts_outcomes() {
        let store = Arc::new(MemoryEventStore::new());
        let ing = Ingestor::new(store.clone(), Duration::minutes(5));
        let t = Utc::now() - Duration::minutes(1);
        let ok = Event::new("e1", "u1", Platform::Chat, EventType::Message, t);
        let bad = Event::new("e2", "u1", Platform::Chat, EventType::Message, t).with_urgency(7.0);
        let sources: Vec<Box<dyn EventSource>> = vec![
            Box::new(BrokenSource),
            Box::new(FixedSource(vec![ok.clone(), ok, bad])),
        ];
        assert_eq!(ing.run_sources_once(&sources).await, (1, 1, 1));
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicates_are_not_enqueued_twice() {
        let store = Arc::new(MemoryEventStore::new());
        let sink = Arc::new(RecordingSink::default());
        let ing = Ingestor::new(store.clone(), Duration::minutes(5)).with_sink(sink.clone());
        let ev = Event::new("e1", "u1", Platform::Chat, EventType::Message, now());

        let first = ing.ingest_at(ev.clone(), now()).await.unwrap();
        let second = ing.ingest_at(ev, now()).await.unwrap();
        assert_eq!(first, IngestOutcome::Stored("e1".into()));
        assert_eq!(second, IngestOutcome::Duplicate("e1".into()));
        assert_eq!(sink.0.lock().as_slice(), ["e1".to_string()]);
        assert_eq!(store.len().await.unwrap(), 1);
    }
}
