//! Skald - parameterized AI text functions behind one dispatch contract
//!
//! A function is a declarative [`FunctionDescriptor`]: an input schema, a
//! prompt template and model defaults. The [`ExecutionDispatcher`] looks
//! functions up, validates input, serves repeated calls from a TTL + LRU
//! [`ResponseCache`], calls a [`Backend`] and records every execution to an
//! [`ExecutionSink`]. Streaming executions are admitted by a
//! [`SessionManager`] with a hard concurrency ceiling and relayed as
//! [`StreamEvent`]s, ready to be framed as server-sent events.
//!
//! # Example
//!
//! ```rust,no_run
//! use skald::{ExecutionRequest, Skald};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> skald::Result<()> {
//!     let dispatcher = Skald::builder()
//!         .openai("sk-your-key", None)
//!         .build()?;
//!
//!     let result = dispatcher
//!         .execute(ExecutionRequest::from_json(
//!             "translation_zh_to_en",
//!             json!({"text": "你好"}),
//!         ))
//!         .await?;
//!
//!     println!("{} ({} tokens)", result.content, result.usage.total_tokens);
//!     Ok(())
//! }
//! ```
//!
//! # Streaming Example
//!
//! ```rust,no_run
//! use futures_util::StreamExt;
//! use skald::{ExecutionRequest, Skald, sse_frames};
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> skald::Result<()> {
//!     let dispatcher = Skald::builder().openai("sk-your-key", None).build()?;
//!     let events = dispatcher.stream_execute(
//!         ExecutionRequest::from_json("text_summary", json!({"text": "..."})),
//!         CancellationToken::new(),
//!     )?;
//!
//!     let mut frames = Box::pin(sse_frames(events));
//!     while let Some(frame) = frames.next().await {
//!         print!("{frame}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod cache;
#[cfg(feature = "cli")]
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod session;
pub mod sink;
pub mod telemetry;
pub mod types;

// Re-export main types at crate root
pub use error::{BackendErrorKind, Result, SkaldError};

pub use backend::{
    Backend, BackendStream, Completion, CompletionRequest, RetryConfig, RetryingBackend,
    StreamUnit,
};
#[cfg(feature = "openai")]
pub use backend::OpenAiBackend;
pub use cache::{CacheConfig, CacheStats, ResponseCache};
pub use dispatcher::{EventStream, ExecutionDispatcher, ServiceStats, Skald, SkaldBuilder};
pub use registry::{
    FieldSpec, FieldType, FunctionDefinition, FunctionDescriptor, FunctionInfo, FunctionRegistry,
    InputSchema, PromptTemplate,
};
pub use session::{
    SessionConfig, SessionGuard, SessionManager, SessionState, StreamSession, encode_frame,
    error_frame, sse_frames,
};
pub use sink::{ExecutionSink, JsonlSink, NoopSink};
pub use types::{
    ExecutionRecord, ExecutionRequest, ExecutionResult, ExecutionStatus, InputFields, ModelParams,
    StreamEvent, TokenUsage,
};

/// Crate version.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
