//! Execution request and result types

use serde::{Deserialize, Serialize};

use super::TokenUsage;

/// Caller-supplied input payload, keyed by field name.
///
/// `serde_json::Map` keeps keys sorted, which the cache key relies on.
pub type InputFields = serde_json::Map<String, serde_json::Value>;

/// One call into the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub function_id: String,
    #[serde(default)]
    pub input: InputFields,
    /// Backend model to use instead of the function default.
    #[serde(default, alias = "model_name", skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
    /// Whether a cached result may be returned (sync path only).
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
}

fn default_use_cache() -> bool {
    true
}

impl ExecutionRequest {
    pub fn new(function_id: impl Into<String>, input: InputFields) -> Self {
        Self {
            function_id: function_id.into(),
            input,
            model_override: None,
            use_cache: true,
        }
    }

    /// Build a request from a JSON object literal.
    ///
    /// Non-object values produce an empty input map.
    pub fn from_json(function_id: impl Into<String>, input: serde_json::Value) -> Self {
        let input = match input {
            serde_json::Value::Object(map) => map,
            _ => InputFields::new(),
        };
        Self::new(function_id, input)
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model_override = Some(model.into());
        self
    }

    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }
}

/// Outcome of a completed (or cached) execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub function_id: String,
    pub content: String,
    pub usage: TokenUsage,
    pub model_used: String,
    /// Wall time of the backend call, in seconds.
    pub execution_time: f64,
    #[serde(default)]
    pub cached: bool,
}
