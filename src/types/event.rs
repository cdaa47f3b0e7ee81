//! Outbound streaming events

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TokenUsage;

/// Current wall-clock time in epoch seconds.
pub fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// A structured event on a streaming session's outbound channel.
///
/// Serialised with a `type` tag, e.g.
/// `{"type":"token","content":"Hello","timestamp":1700000000}`.
///
/// A session always emits `connected`, then `start`, any number of
/// `token`/`heartbeat` events, one of `end`/`error`, and finally one of
/// `stream_completed`/`stream_error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Connected {
        stream_id: Uuid,
        timestamp: i64,
    },
    Start {
        function_id: String,
        timestamp: i64,
    },
    Token {
        content: String,
        timestamp: i64,
    },
    End {
        usage: TokenUsage,
        execution_time: f64,
        finish_reason: Option<String>,
        timestamp: i64,
    },
    Error {
        message: String,
        timestamp: i64,
    },
    StreamCompleted {
        stream_id: Uuid,
        timestamp: i64,
    },
    StreamError {
        stream_id: Uuid,
        error: String,
        timestamp: i64,
    },
    Heartbeat {
        timestamp: i64,
    },
}

impl StreamEvent {
    pub fn connected(stream_id: Uuid) -> Self {
        StreamEvent::Connected {
            stream_id,
            timestamp: now_timestamp(),
        }
    }

    pub fn start(function_id: impl Into<String>) -> Self {
        StreamEvent::Start {
            function_id: function_id.into(),
            timestamp: now_timestamp(),
        }
    }

    pub fn token(content: impl Into<String>) -> Self {
        StreamEvent::Token {
            content: content.into(),
            timestamp: now_timestamp(),
        }
    }

    pub fn end(usage: TokenUsage, execution_time: f64, finish_reason: Option<String>) -> Self {
        StreamEvent::End {
            usage,
            execution_time,
            finish_reason,
            timestamp: now_timestamp(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
            timestamp: now_timestamp(),
        }
    }

    pub fn stream_completed(stream_id: Uuid) -> Self {
        StreamEvent::StreamCompleted {
            stream_id,
            timestamp: now_timestamp(),
        }
    }

    pub fn stream_error(stream_id: Uuid, error: impl Into<String>) -> Self {
        StreamEvent::StreamError {
            stream_id,
            error: error.into(),
            timestamp: now_timestamp(),
        }
    }

    pub fn heartbeat() -> Self {
        StreamEvent::Heartbeat {
            timestamp: now_timestamp(),
        }
    }

    /// Wire name of the event (`type` field).
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Connected { .. } => "connected",
            StreamEvent::Start { .. } => "start",
            StreamEvent::Token { .. } => "token",
            StreamEvent::End { .. } => "end",
            StreamEvent::Error { .. } => "error",
            StreamEvent::StreamCompleted { .. } => "stream_completed",
            StreamEvent::StreamError { .. } => "stream_error",
            StreamEvent::Heartbeat { .. } => "heartbeat",
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            StreamEvent::Connected { timestamp, .. }
            | StreamEvent::Start { timestamp, .. }
            | StreamEvent::Token { timestamp, .. }
            | StreamEvent::End { timestamp, .. }
            | StreamEvent::Error { timestamp, .. }
            | StreamEvent::StreamCompleted { timestamp, .. }
            | StreamEvent::StreamError { timestamp, .. }
            | StreamEvent::Heartbeat { timestamp } => *timestamp,
        }
    }

    /// `end` or `error`: closes the function-level part of a session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::End { .. } | StreamEvent::Error { .. })
    }

    /// `stream_completed` or `stream_error`: the last event of a session.
    pub fn is_session_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::StreamCompleted { .. } | StreamEvent::StreamError { .. }
        )
    }
}
