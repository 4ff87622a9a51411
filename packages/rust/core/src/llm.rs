//! LLM provider seam and the OpenAI-compatible client.
//!
//! [`complete_json`] layers the retry policy and a single repair re-prompt
//! over any [`LlmClient`], so callers only supply a validator.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use markwise_shared::{LlmConfig, MarkwiseError, Result};

use crate::retry::{RetryPolicy, classify_llm_error};

/// How much of a rejected reply is quoted back in a repair prompt.
const REPAIR_QUOTE_CHARS: usize = 2_000;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// One chat completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
}

/// Raw model output plus usage.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub tokens_used: u64,
}

/// A chat model that answers with a JSON object.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn model(&self) -> &str;

    /// Single call, no retries. Errors are classified by the caller.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible client
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: u64,
}

/// Client for `/chat/completions` on OpenAI or any compatible endpoint.
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>, config: &LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MarkwiseError::config(format!("failed to build LLM client: {e}")))?;

        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| MarkwiseError::config("API key contains invalid header characters"))?;
        headers.insert(AUTHORIZATION, bearer);
        Ok(headers)
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn status_error(status: StatusCode, headers: &HeaderMap, body: &str) -> MarkwiseError {
    let snippet: String = body.chars().take(300).collect();
    if status == StatusCode::TOO_MANY_REQUESTS {
        MarkwiseError::RateLimited {
            message: snippet,
            retry_after: parse_retry_after(headers),
        }
    } else if status.is_server_error() {
        MarkwiseError::http(status.as_u16(), snippet)
    } else {
        MarkwiseError::Llm(format!("provider returned {status}: {snippet}"))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(model = %self.model))]
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            temperature: self.temperature,
            max_tokens: request.max_tokens,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        debug!(prompt_chars = request.prompt.len(), "chat completion request");

        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MarkwiseError::Timeout(format!("LLM call to {url} timed out"))
                } else {
                    MarkwiseError::Network(format!("LLM call to {url} failed: {e}"))
                }
            })?;

        let status = response.status();
        let headers = response.headers().clone();
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                MarkwiseError::Timeout(format!("LLM response from {url} timed out"))
            } else {
                MarkwiseError::Network(format!("failed to read LLM response: {e}"))
            }
        })?;

        if !status.is_success() {
            return Err(status_error(status, &headers, &text));
        }

        let envelope: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| MarkwiseError::schema(format!("malformed completion envelope: {e}")))?;

        let tokens_used = envelope.usage.map(|u| u.total_tokens).unwrap_or(0);
        let content = envelope
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| MarkwiseError::schema("completion had no content"))?;

        Ok(Completion {
            text: content,
            tokens_used,
        })
    }
}

// ---------------------------------------------------------------------------
// JSON replies
// ---------------------------------------------------------------------------

/// Strip a surrounding markdown code fence, which some models add anyway.
pub fn strip_code_blocks(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Outcome of [`complete_json`]: the validated value or the final
/// validation error, plus what it cost.
#[derive(Debug)]
pub struct JsonReply<T> {
    pub parsed: Result<T>,
    pub tokens_used: u64,
    /// Model calls that returned a reply (1, or 2 with a repair).
    pub replies: u32,
}

/// Ask for JSON, validate it, and re-prompt once with the problem if the
/// reply is rejected.
///
/// The outer `Err` is a provider failure that survived the retry policy, or
/// cancellation. A reply that still fails validation after the repair comes
/// back as `Ok` with `parsed` set to the error.
pub async fn complete_json<T, V>(
    client: &dyn LlmClient,
    retry: &RetryPolicy,
    request: &CompletionRequest,
    validate: V,
    cancel: &CancellationToken,
) -> Result<JsonReply<T>>
where
    V: Fn(&str) -> Result<T>,
{
    // A malformed completion envelope gets the same single repair as a
    // reply the validator rejects.
    let (first_text, first_tokens, problem) =
        match retry.execute(|| client.complete(request), classify_llm_error, cancel).await {
            Ok(first) => match validate(strip_code_blocks(&first.text)) {
                Ok(value) => {
                    return Ok(JsonReply {
                        parsed: Ok(value),
                        tokens_used: first.tokens_used,
                        replies: 1,
                    });
                }
                Err(problem) => (first.text, first.tokens_used, problem),
            },
            Err(problem @ MarkwiseError::Schema { .. }) => (String::new(), 0, problem),
            Err(e) => return Err(e),
        };

    warn!(model = client.model(), error = %problem, "reply rejected, sending repair prompt");

    let quoted: String = first_text.chars().take(REPAIR_QUOTE_CHARS).collect();
    let repair = &CompletionRequest {
        system: request.system.clone(),
        prompt: format!(
            "{}\n\nYour previous reply was rejected: {problem}\n\nPrevious reply:\n{quoted}\n\n\
             Reply again with only a JSON object in the requested format.",
            request.prompt
        ),
        max_tokens: request.max_tokens,
    };

    match retry
        .execute(|| client.complete(repair), classify_llm_error, cancel)
        .await
    {
        Ok(second) => Ok(JsonReply {
            parsed: validate(strip_code_blocks(&second.text)),
            tokens_used: first_tokens + second.tokens_used,
            replies: 2,
        }),
        Err(problem @ MarkwiseError::Schema { .. }) => Ok(JsonReply {
            parsed: Err(problem),
            tokens_used: first_tokens,
            replies: 2,
        }),
        Err(e) => Err(e),
    }
}
