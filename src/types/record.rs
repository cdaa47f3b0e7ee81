//! Persistence records emitted after each execution

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Final status of an execution as seen by the history sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

/// One executed function call, as handed to an
/// [`ExecutionSink`](crate::sink::ExecutionSink).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub conversation_id: Uuid,
    pub function_id: String,
    pub function_name: String,
    pub model_used: String,
    /// Rendered user prompt sent to the backend.
    pub user_input: String,
    pub ai_response: String,
    pub total_tokens: u32,
    pub execution_time: f64,
    pub status: ExecutionStatus,
    /// Free-form details: original input fields, model params, stream flag, error text.
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
