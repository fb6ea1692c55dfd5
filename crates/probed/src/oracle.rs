//! Decision oracle client.
//!
//! [`ChatBackend::complete`] is one attempt against a chat-completions
//! endpoint. [`DecisionOracle::call`] wraps it with the retry discipline:
//! parse, validate, and on any failure back off exponentially and try
//! again, without bound.

use async_trait::async_trait;
use probe_core::decision::OracleReply;
use probe_core::prompt::OraclePrompt;
use probe_core::Config;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OracleError>;

/// Why an oracle call is made. Logged with every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallPurpose {
    Decision,
    ExecutionPlan,
    PhaseTasks,
    PhaseName,
    StuckVerdict,
    KnowledgeReview,
    Consolidation,
    Diagnostic,
}

impl CallPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::ExecutionPlan => "execution_plan",
            Self::PhaseTasks => "phase_tasks",
            Self::PhaseName => "phase_name",
            Self::StuckVerdict => "stuck_verdict",
            Self::KnowledgeReview => "knowledge_review",
            Self::Consolidation => "consolidation",
            Self::Diagnostic => "diagnostic",
        }
    }
}

/// Which configured model serves a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    /// Fast model for per-cycle decisions and knowledge upkeep.
    Chat,
    /// Slower model for planning and stuck verdicts.
    Reasoner,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    /// Ask the endpoint for a JSON object.
    pub json_mode: bool,
    pub model: String,
    pub purpose: CallPurpose,
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// One attempt. Returns the parsed reply; in text mode a reply that is
    /// not JSON comes back as a JSON string.
    async fn complete(&self, request: &ChatRequest) -> Result<Value>;
}

/// OpenAI-compatible `/chat/completions` client.
#[derive(Debug, Clone)]
pub struct OpenAiBackend {
    base_url: String,
    api_key: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiBackend {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http,
        })
    }

    pub fn from_config(config: &Config, api_key: impl Into<String>) -> Result<Self> {
        Self::new(
            config.oracle_base_url.clone(),
            api_key,
            Duration::from_secs(config.oracle_timeout_sec),
        )
    }

    fn build_request_body(request: &ChatRequest) -> Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user},
            ],
            "stream": false,
        });
        if request.json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }
        body
    }
}

/// Parse reply content; text mode falls back to a plain string.
fn parse_content(content: &str, json_mode: bool) -> Result<Value> {
    match serde_json::from_str(content) {
        Ok(value) => Ok(value),
        Err(_) if !json_mode => Ok(Value::String(content.to_string())),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    async fn complete(&self, request: &ChatRequest) -> Result<Value> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::build_request_body(request);

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(OracleError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body: CompletionBody = response.json().await?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| OracleError::InvalidResponse("no message content".to_string()))?;

        parse_content(&content, request.json_mode)
    }
}

/// Retrying, validating front of a [`ChatBackend`].
#[derive(Clone)]
pub struct DecisionOracle {
    backend: Arc<dyn ChatBackend>,
    chat_model: String,
    reasoner_model: String,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl std::fmt::Debug for DecisionOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionOracle")
            .field("chat_model", &self.chat_model)
            .field("reasoner_model", &self.reasoner_model)
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .finish_non_exhaustive()
    }
}

impl DecisionOracle {
    pub fn new(backend: Arc<dyn ChatBackend>, config: &Config) -> Self {
        Self {
            backend,
            chat_model: config.oracle_model.clone(),
            reasoner_model: config.oracle_reasoner_model.clone(),
            initial_backoff: Duration::from_millis(config.oracle_initial_backoff_ms),
            max_backoff: Duration::from_millis(config.oracle_max_backoff_ms),
        }
    }

    pub fn model(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Chat => &self.chat_model,
            ModelTier::Reasoner => &self.reasoner_model,
        }
    }

    /// Call until a reply parses as `T` and passes its check.
    ///
    /// Transport errors and rejected replies are both retried after a delay
    /// that starts at the initial backoff and doubles up to the cap. A
    /// validated reply is returned as is and never re-requested.
    pub async fn call<T: OracleReply>(
        &self,
        prompt: &OraclePrompt,
        purpose: CallPurpose,
        tier: ModelTier,
    ) -> T {
        let request = ChatRequest {
            system: prompt.system.clone(),
            user: prompt.user.clone(),
            json_mode: true,
            model: self.model(tier).to_string(),
            purpose,
        };

        let mut delay = self.initial_backoff;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            debug!(purpose = purpose.as_str(), attempt, model = %request.model, "oracle call");

            match self.backend.complete(&request).await {
                Ok(value) => match serde_json::from_value::<T>(value) {
                    Ok(reply) if reply.is_acceptable() => return reply,
                    Ok(_) => {
                        warn!(
                            purpose = purpose.as_str(),
                            attempt,
                            retry_in_ms = delay.as_millis() as u64,
                            "oracle reply rejected by validator"
                        );
                    }
                    Err(err) => {
                        warn!(
                            purpose = purpose.as_str(),
                            attempt,
                            error = %err,
                            retry_in_ms = delay.as_millis() as u64,
                            "oracle reply has the wrong shape"
                        );
                    }
                },
                Err(err) => {
                    warn!(
                        purpose = purpose.as_str(),
                        attempt,
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "oracle call failed"
                    );
                }
            }

            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.max_backoff);
        }
    }

    /// Single plain-text call with no retry, for connectivity checks.
    /// Returns the reply text and how long it took.
    pub async fn probe(&self, tier: ModelTier, user: &str) -> Result<(String, Duration)> {
        let request = ChatRequest {
            system: "You are a helpful assistant.".to_string(),
            user: user.to_string(),
            json_mode: false,
            model: self.model(tier).to_string(),
            purpose: CallPurpose::Diagnostic,
        };
        let started = Instant::now();
        let value = self.backend.complete(&request).await?;
        let text = match value {
            Value::String(s) => s,
            other => other.to_string(),
        };
        Ok((text, started.elapsed()))
    }
}
