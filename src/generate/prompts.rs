//! Fixed prompt templates and tolerant parsing of the replies.
//!
//! Models wrap JSON in code fences, prepend chatter, or answer a yes/no
//! question in prose. Parsing accepts all of that and only gives up when no
//! usable structure is left.

use serde::Deserialize;

use crate::error::ReasoningError;
use crate::model::{ActionType, Priority, MAX_ESTIMATED_MINUTES, MIN_ESTIMATED_MINUTES};
use crate::reasoning::{sanitize_line, Prompt, PromptKind};
use crate::synth::ContextBundle;

pub const SUFFICIENCY_SYSTEM: &str = "You triage cross-platform work activity for one person. \
Decide whether the context below justifies exactly one concrete next action for them. \
Answer with JSON only: {\"sufficient\": true|false, \"reason\": \"<short reason>\"}. \
Say false for chatter, FYI-only updates, or anything that needs no action from this person.";

pub const GENERATION_SYSTEM: &str = "You turn cross-platform work activity into one specific, \
time-boxed next action for one person. Answer with JSON only, using these keys: \
title (imperative, at most 60 characters, names the concrete artifact), description, \
priority (urgent|high|medium|low|fyi), action_type (review|respond|update|meeting|follow_up|create|fix), \
estimated_time_minutes (5-30), reasoning (why now), related_people (list of user ids). \
Never use generic titles such as 'Check messages' or 'Review activity'.";

pub fn sufficiency_prompt(bundle: &ContextBundle) -> Prompt {
    Prompt {
        kind: PromptKind::Sufficiency,
        system: SUFFICIENCY_SYSTEM.to_string(),
        user: bundle.render(),
    }
}

pub fn generation_prompt(bundle: &ContextBundle) -> Prompt {
    Prompt {
        kind: PromptKind::Generation,
        system: GENERATION_SYSTEM.to_string(),
        user: bundle.render(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub sufficient: bool,
    pub reason: String,
}

/// Parsed generation reply, before the quality gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDraft {
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub action_type: ActionType,
    pub estimated_time_minutes: u32,
    pub reasoning: String,
    pub related_people: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BoolLike {
    Bool(bool),
    Text(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberLike {
    Int(i64),
    Float(f64),
    Text(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PeopleLike {
    List(Vec<String>),
    Csv(String),
}

#[derive(Deserialize)]
struct VerdictWire {
    #[serde(alias = "is_sufficient", alias = "answer")]
    sufficient: BoolLike,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct DraftWire {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default, alias = "type")]
    action_type: Option<String>,
    #[serde(default, alias = "estimated_minutes", alias = "minutes")]
    estimated_time_minutes: Option<NumberLike>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default, alias = "people")]
    related_people: Option<PeopleLike>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DraftAny {
    Wrapped { action: Box<DraftAny> },
    Flat(DraftWire),
}

/// Strip Markdown code fences and surrounding prose, returning the outermost
/// `{...}` span if there is one.
fn json_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn truthy(s: &str) -> Option<bool> {
    let word: String = s
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_lowercase();
    match word.as_str() {
        "yes" | "true" | "sufficient" | "y" => Some(true),
        "no" | "false" | "insufficient" | "n" => Some(false),
        _ => None,
    }
}

pub fn parse_verdict(text: &str) -> Result<Verdict, ReasoningError> {
    if let Some(span) = json_span(text) {
        if let Ok(w) = serde_json::from_str::<VerdictWire>(span) {
            let sufficient = match w.sufficient {
                BoolLike::Bool(b) => Some(b),
                BoolLike::Text(t) => truthy(&t),
            };
            if let Some(sufficient) = sufficient {
                return Ok(Verdict {
                    sufficient,
                    reason: sanitize_line(w.reason.as_deref().unwrap_or_default(), 200),
                });
            }
        }
    }
    let stripped = text.trim().trim_start_matches("```").trim();
    match truthy(stripped) {
        Some(sufficient) => Ok(Verdict {
            sufficient,
            reason: sanitize_line(stripped, 200),
        }),
        None => Err(ReasoningError::Malformed(format!(
            "unrecognized sufficiency verdict ({} chars)",
            text.len()
        ))),
    }
}

fn minutes(n: Option<NumberLike>) -> u32 {
    let raw = match n {
        Some(NumberLike::Int(i)) => i,
        Some(NumberLike::Float(f)) if f.is_finite() => f.round() as i64,
        Some(NumberLike::Text(t)) => t
            .trim()
            .split(|c: char| !c.is_ascii_digit())
            .next()
            .and_then(|d| d.parse().ok())
            .unwrap_or(15),
        _ => 15,
    };
    raw.clamp(MIN_ESTIMATED_MINUTES as i64, MAX_ESTIMATED_MINUTES as i64) as u32
}

pub fn parse_draft(text: &str) -> Result<ActionDraft, ReasoningError> {
    let span = json_span(text)
        .ok_or_else(|| ReasoningError::Malformed("no JSON object in generation reply".into()))?;
    let mut any: DraftAny = serde_json::from_str(span)
        .map_err(|e| ReasoningError::Malformed(format!("generation reply: {e}")))?;
    let wire = loop {
        match any {
            DraftAny::Flat(w) => break w,
            DraftAny::Wrapped { action } => any = *action,
        }
    };

    let people = match wire.related_people {
        Some(PeopleLike::List(v)) => v,
        Some(PeopleLike::Csv(s)) => s.split(',').map(str::to_string).collect(),
        None => Vec::new(),
    };

    Ok(ActionDraft {
        title: sanitize_line(wire.title.as_deref().unwrap_or_default(), 200),
        description: wire.description.unwrap_or_default().trim().to_string(),
        priority: wire
            .priority
            .as_deref()
            .and_then(Priority::parse)
            .unwrap_or(Priority::Medium),
        action_type: wire
            .action_type
            .as_deref()
            .and_then(ActionType::parse)
            .unwrap_or(ActionType::FollowUp),
        estimated_time_minutes: minutes(wire.estimated_time_minutes),
        reasoning: wire.reasoning.unwrap_or_default().trim().to_string(),
        related_people: people
            .into_iter()
            .map(|p| p.trim().trim_start_matches('@').to_lowercase())
            .filter(|p| !p.is_empty())
            .collect(),
    })
}
