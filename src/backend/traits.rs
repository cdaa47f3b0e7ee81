//! The backend contract consumed by the dispatcher.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::types::{ModelParams, TokenUsage};

/// One prompt sent to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub model: String,
    #[serde(default)]
    pub params: ModelParams,
}

impl CompletionRequest {
    pub fn new(
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            model: model.into(),
            params: ModelParams::default(),
        }
    }

    pub fn params(mut self, params: ModelParams) -> Self {
        self.params = params;
        self
    }
}

/// A finished, non-streaming completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    #[serde(default)]
    pub usage: TokenUsage,
    /// Model that served the request, as reported by the backend.
    pub model: String,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// One unit of a streaming completion.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUnit {
    /// Incremental content.
    Content(String),
    /// Token accounting. May arrive more than once; the last value counts.
    Usage(TokenUsage),
    /// The backend finished generating, with its reported reason.
    Finish(String),
    /// The backend reported an error in-band.
    Error(String),
}

/// Lazy, finite, non-restartable sequence of stream units.
pub type BackendStream = Pin<Box<dyn Stream<Item = Result<StreamUnit>> + Send>>;

/// A text-generation backend.
///
/// Implementations must be cancel-safe: dropping the future returned by
/// [`complete`](Backend::complete), or the stream returned by
/// [`stream_complete`](Backend::stream_complete), abandons the upstream call.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend name for logging and metrics.
    fn name(&self) -> &str;

    /// Run a completion to the end.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Open a streaming completion.
    async fn stream_complete(&self, request: &CompletionRequest) -> Result<BackendStream>;

    /// Probe backend reachability.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
