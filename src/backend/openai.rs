//! OpenAI-compatible chat completions backend.
//!
//! Works with any endpoint speaking the `/chat/completions` protocol; the
//! default base URL points at DeepSeek.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::sse::{DONE_MARKER, SseDecoder};
use super::traits::{Backend, BackendStream, Completion, CompletionRequest, StreamUnit};
use crate::error::BackendErrorKind;
use crate::types::TokenUsage;
use crate::{Result, SkaldError};

/// Default base URL (DeepSeek's OpenAI-compatible API).
pub const DEFAULT_BASE_URL: &str = "https://api.deepseek.com";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Client for OpenAI-compatible chat completion endpoints.
#[derive(Clone)]
pub struct OpenAiBackend {
    api_key: String,
    http: Client,
    base_url: String,
    request_timeout: Duration,
}

impl std::fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field("base_url", &self.base_url)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl OpenAiBackend {
    /// Create a backend against the default base URL.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    /// Create a backend with a custom base URL (also used with wiremock).
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SkaldError::Configuration(format!("failed to build HTTP client: {e}")))?;
        let base_url: String = base_url.into();
        Ok(Self {
            api_key: api_key.into(),
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Deadline for non-streaming requests. Streams are bounded by the
    /// session timeout instead.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request_body(request: &CompletionRequest, stream: bool) -> Result<Value> {
        let mut body = match serde_json::to_value(&request.params)? {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        body.insert("model".into(), json!(request.model));
        body.insert(
            "messages".into(),
            json!([
                {"role": "system", "content": request.system_prompt},
                {"role": "user", "content": request.user_prompt},
            ]),
        );
        body.insert("stream".into(), json!(stream));
        if stream {
            body.insert("stream_options".into(), json!({"include_usage": true}));
        }
        Ok(Value::Object(body))
    }

    async fn post(&self, body: &Value, timeout: Option<Duration>) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self.http.post(&url).bearer_auth(&self.api_key).json(body);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let response = builder.send().await.map_err(transport_error)?;
        check_status(response).await
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let body = Self::request_body(request, false)?;
        let response = self.post(&body, Some(self.request_timeout)).await?;
        let parsed: ChatResponse = response.json().await.map_err(transport_error)?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            SkaldError::backend(BackendErrorKind::Unknown, "response contained no choices")
        })?;
        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            usage: parsed.usage.unwrap_or_default(),
            model: parsed.model.unwrap_or_else(|| request.model.clone()),
            finish_reason: choice.finish_reason,
        })
    }

    async fn stream_complete(&self, request: &CompletionRequest) -> Result<BackendStream> {
        let body = Self::request_body(request, true)?;
        let response = self.post(&body, None).await?;
        debug!(model = %request.model, "backend stream opened");

        let state = ChunkState {
            bytes: Box::pin(response.bytes_stream()),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            finish: None,
            done: false,
        };
        Ok(Box::pin(stream::unfold(state, next_unit)))
    }

    async fn health_check(&self) -> Result<()> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await.map(|_| ())
    }
}

struct ChunkState<S> {
    bytes: S,
    decoder: SseDecoder,
    pending: VecDeque<StreamUnit>,
    /// Finish reason held back until the stream ends, so a trailing usage
    /// chunk is still delivered before it.
    finish: Option<String>,
    done: bool,
}

impl<S> ChunkState<S> {
    fn handle_payload(&mut self, payload: &str) {
        if self.done {
            return;
        }
        if payload.trim() == DONE_MARKER {
            self.end();
            return;
        }
        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "skipping unparseable stream chunk");
                return;
            }
        };
        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            self.pending.push_back(StreamUnit::Error(message));
            self.done = true;
            return;
        }
        let chunk: ChatChunk = match serde_json::from_value(value) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, "skipping stream chunk with unexpected shape");
                return;
            }
        };
        if let Some(choice) = chunk.choices.into_iter().next() {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                self.pending.push_back(StreamUnit::Content(content));
            }
            if let Some(reason) = choice.finish_reason {
                self.finish = Some(reason);
            }
        }
        if let Some(usage) = chunk.usage {
            self.pending.push_back(StreamUnit::Usage(usage));
        }
    }

    fn end(&mut self) {
        if let Some(reason) = self.finish.take() {
            self.pending.push_back(StreamUnit::Finish(reason));
        }
        self.done = true;
    }
}

async fn next_unit<S, B>(mut state: ChunkState<S>) -> Option<(Result<StreamUnit>, ChunkState<S>)>
where
    S: futures_util::Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    loop {
        if let Some(unit) = state.pending.pop_front() {
            return Some((Ok(unit), state));
        }
        if state.done {
            return None;
        }
        match state.bytes.next().await {
            Some(Ok(chunk)) => {
                for payload in state.decoder.push(chunk.as_ref()) {
                    state.handle_payload(&payload);
                }
            }
            Some(Err(e)) => {
                state.done = true;
                return Some((Err(transport_error(e)), state));
            }
            None => {
                if let Some(payload) = state.decoder.finish() {
                    state.handle_payload(&payload);
                }
                state.end();
            }
        }
    }
}

fn transport_error(e: reqwest::Error) -> SkaldError {
    let kind = if e.is_timeout() {
        BackendErrorKind::Timeout
    } else {
        BackendErrorKind::Unknown
    };
    SkaldError::backend(kind, e.to_string())
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let kind = match status {
        StatusCode::TOO_MANY_REQUESTS => BackendErrorKind::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => BackendErrorKind::Timeout,
        _ => BackendErrorKind::Unknown,
    };
    let body = response.text().await.unwrap_or_default();
    let detail: String = body.chars().take(200).collect();
    Err(SkaldError::backend(
        kind,
        format!("HTTP {}: {}", status.as_u16(), detail.trim()),
    ))
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}
