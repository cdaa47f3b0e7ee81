//! Text-generation backends.
//!
//! [`Backend`] is the seam between the dispatcher and whatever produces
//! completions. The crate ships an OpenAI-compatible HTTP client
//! ([`OpenAiBackend`], feature `openai`) and [`RetryingBackend`], a
//! decorator that retries transient failures of any backend.

#[cfg(feature = "openai")]
mod openai;
mod retry;
#[cfg(feature = "openai")]
mod sse;
mod traits;

#[cfg(feature = "openai")]
pub use openai::{DEFAULT_BASE_URL, OpenAiBackend};
pub use retry::{RetryConfig, RetryingBackend};
pub use traits::{Backend, BackendStream, Completion, CompletionRequest, StreamUnit};

/// Model used when neither the request nor the function names one.
pub const DEFAULT_MODEL: &str = "deepseek-chat";
