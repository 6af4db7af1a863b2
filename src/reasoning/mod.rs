//! Reasoning service boundary: "given a prompt, return text".
//!
//! Production uses the OpenAI chat completions API; tests and local runs use
//! [`ScriptedClient`]. Every call is bounded by a timeout in the caller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::AiConfig;
use crate::error::ReasoningError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    Sufficiency,
    Generation,
}

impl PromptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptKind::Sufficiency => "sufficiency",
            PromptKind::Generation => "generation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub kind: PromptKind,
    pub system: String,
    pub user: String,
}

#[async_trait]
pub trait ReasoningClient: Send + Sync {
    async fn complete(&self, prompt: &Prompt) -> Result<String, ReasoningError>;
    /// Provider name for diagnostics.
    fn provider_name(&self) -> &'static str;
}

pub type DynReasoningClient = Arc<dyn ReasoningClient>;

/// Factory: build a client according to config and environment variables.
///
/// * If `AI_TEST_MODE=mock`, returns a scripted client with canned answers.
/// * Else if `config.enabled==false`, returns a disabled client.
/// * Else builds the real provider.
pub fn build_client_from_config(config: &AiConfig) -> DynReasoningClient {
    if std::env::var("AI_TEST_MODE")
        .map(|v| v == "mock")
        .unwrap_or(false)
    {
        return Arc::new(ScriptedClient::canned());
    }
    if !config.enabled {
        return Arc::new(DisabledClient);
    }
    match config.provider.as_str() {
        "openai" => match OpenAiProvider::new(config) {
            Ok(p) => Arc::new(p),
            Err(e) => {
                tracing::warn!(target: "generate", error = %e, "reasoning provider init failed; disabled");
                Arc::new(DisabledClient)
            }
        },
        other => {
            tracing::warn!(target: "generate", provider = other, "unsupported reasoning provider; disabled");
            Arc::new(DisabledClient)
        }
    }
}

// ------------------------------------------------------------
// OpenAI
// ------------------------------------------------------------

pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl OpenAiProvider {
    pub fn new(config: &AiConfig) -> Result<Self, ReasoningError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("activity-actions/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4))
            .timeout(config.timeout())
            .build()
            .map_err(|e| ReasoningError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            endpoint: format!("{}/chat/completions", config.base_url),
        })
    }
}

#[async_trait]
impl ReasoningClient for OpenAiProvider {
    async fn complete(&self, prompt: &Prompt) -> Result<String, ReasoningError> {
        if self.api_key.is_empty() {
            return Err(ReasoningError::Disabled);
        }

        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            max_tokens: u32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: String,
        }

        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: &prompt.system,
                },
                Msg {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            temperature: 0.2,
            max_tokens: match prompt.kind {
                PromptKind::Sufficiency => 60,
                PromptKind::Generation => 400,
            },
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ReasoningError::Timeout(Duration::ZERO)
                } else {
                    ReasoningError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ReasoningError::RateLimited);
        }
        if !status.is_success() {
            return Err(ReasoningError::Http(status.as_u16()));
        }
        let body: Resp = resp
            .json()
            .await
            .map_err(|e| ReasoningError::Malformed(e.to_string()))?;
        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ReasoningError::Malformed("empty completion".into()))
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}

/// Always fails with `Disabled`; used when reasoning is turned off.
pub struct DisabledClient;

#[async_trait]
impl ReasoningClient for DisabledClient {
    async fn complete(&self, _prompt: &Prompt) -> Result<String, ReasoningError> {
        Err(ReasoningError::Disabled)
    }
    fn provider_name(&self) -> &'static str {
        "disabled"
    }
}

// ------------------------------------------------------------
// Scripted mock
// ------------------------------------------------------------

type Scripted = Result<String, ReasoningError>;

/// Deterministic mock. Each prompt kind has a queue of scripted replies; when a
/// queue runs dry the kind's default reply is used. Counts calls per kind.
#[derive(Default)]
pub struct ScriptedClient {
    sufficiency: Mutex<VecDeque<Scripted>>,
    generation: Mutex<VecDeque<Scripted>>,
    default_sufficiency: Mutex<Option<Scripted>>,
    default_generation: Mutex<Option<Scripted>>,
    delay: Mutex<Option<Duration>>,
    sufficiency_calls: AtomicUsize,
    generation_calls: AtomicUsize,
}

pub const CANNED_SUFFICIENT: &str = r#"{"sufficient": true, "reason": "review requested with related discussion"}"#;
pub const CANNED_ACTION: &str = r#"{
  "title": "Review auth token refresh PR",
  "description": "The PR discussed in chat is waiting on your review.",
  "priority": "high",
  "action_type": "review",
  "estimated_time_minutes": 20,
  "reasoning": "Review was requested and the change touches security-sensitive code.",
  "related_people": ["bob"]
}"#;

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always judges sufficient and returns one well-formed review action.
    pub fn canned() -> Self {
        Self::new()
            .with_default(PromptKind::Sufficiency, Ok(CANNED_SUFFICIENT.to_string()))
            .with_default(PromptKind::Generation, Ok(CANNED_ACTION.to_string()))
    }

    pub fn with_default(self, kind: PromptKind, reply: Scripted) -> Self {
        *self.default_slot(kind).lock() = Some(reply);
        self
    }

    pub fn push(&self, kind: PromptKind, reply: Scripted) {
        self.queue(kind).lock().push_back(reply);
    }

    /// Sleep before answering; used to exercise caller timeouts.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = Some(delay);
        self
    }

    pub fn calls(&self, kind: PromptKind) -> usize {
        match kind {
            PromptKind::Sufficiency => self.sufficiency_calls.load(Ordering::SeqCst),
            PromptKind::Generation => self.generation_calls.load(Ordering::SeqCst),
        }
    }

    pub fn total_calls(&self) -> usize {
        self.calls(PromptKind::Sufficiency) + self.calls(PromptKind::Generation)
    }

    fn queue(&self, kind: PromptKind) -> &Mutex<VecDeque<Scripted>> {
        match kind {
            PromptKind::Sufficiency => &self.sufficiency,
            PromptKind::Generation => &self.generation,
        }
    }

    fn default_slot(&self, kind: PromptKind) -> &Mutex<Option<Scripted>> {
        match kind {
            PromptKind::Sufficiency => &self.default_sufficiency,
            PromptKind::Generation => &self.default_generation,
        }
    }
}

#[async_trait]
impl ReasoningClient for ScriptedClient {
    async fn complete(&self, prompt: &Prompt) -> Result<String, ReasoningError> {
        match prompt.kind {
            PromptKind::Sufficiency => self.sufficiency_calls.fetch_add(1, Ordering::SeqCst),
            PromptKind::Generation => self.generation_calls.fetch_add(1, Ordering::SeqCst),
        };
        let delay = *self.delay.lock();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let scripted = self.queue(prompt.kind).lock().pop_front();
        match scripted {
            Some(reply) => reply,
            None => self
                .default_slot(prompt.kind)
                .lock()
                .clone()
                .unwrap_or(Err(ReasoningError::Disabled)),
        }
    }

    fn provider_name(&self) -> &'static str {
        "mock"
    }
}

/// ASCII-only, single line, at most `max` chars, whitespace collapsed.
pub fn sanitize_line(input: &str, max: usize) -> String {
    let mut out = String::with_capacity(max.min(input.len()));
    let mut prev_space = false;
    for ch in input.chars() {
        let c = match ch {
            '\r' | '\n' | '\t' => ' ',
            '\u{2018}' | '\u{2019}' => '\'',
            '\u{201C}' | '\u{201D}' => '"',
            '\u{2013}' | '\u{2014}' => '-',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => ' ',
        };
        if c == ' ' {
            if !prev_space && !out.is_empty() {
                out.push(' ');
            }
            prev_space = true;
        } else {
            out.push(c);
            prev_space = false;
        }
        if out.len() >= max {
            break;
        }
    }
    out.trim().to_string()
}
