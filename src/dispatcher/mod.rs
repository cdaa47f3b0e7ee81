//! The execution dispatcher.
//!
//! [`ExecutionDispatcher`] ties the registry, the response cache, the
//! session manager and a [`Backend`] together. It serves two paths:
//!
//! - [`execute`](ExecutionDispatcher::execute): lookup, validation, cache
//!   probe, one backend call, cache store, persistence.
//! - [`stream_execute`](ExecutionDispatcher::stream_execute): lookup,
//!   validation, admission, then a spawned relay that forwards backend units
//!   as [`StreamEvent`]s over a bounded channel. See [`relay`] for the event
//!   sequence and how each way of ending a stream is reported.
//!
//! Persistence goes to an [`ExecutionSink`] on a detached task; its
//! failures are logged and never surface to callers.

mod builder;
mod relay;

pub use builder::{Skald, SkaldBuilder};

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::backend::{Backend, CompletionRequest};
use crate::cache::{CacheStats, ResponseCache};
use crate::error::BackendErrorKind;
use crate::registry::{FunctionDescriptor, FunctionInfo, FunctionRegistry};
use crate::session::{SessionGuard, SessionManager};
use crate::sink::ExecutionSink;
use crate::telemetry;
use crate::types::{
    ExecutionRecord, ExecutionRequest, ExecutionResult, ExecutionStatus, StreamEvent, TokenUsage,
};
use crate::{Result, SkaldError};

use relay::StreamRelay;

/// Default number of events buffered between the relay and its consumer.
pub const DEFAULT_STREAM_BUFFER: usize = 64;

/// Default deadline for a synchronous backend call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Outbound events of one streaming session.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Snapshot of service state for the admin surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub cache: CacheStats,
    pub active_streams: usize,
    pub max_concurrent_streams: usize,
    /// Number of active functions.
    pub functions: usize,
}

/// Orchestrates function executions against a backend.
pub struct ExecutionDispatcher {
    registry: Arc<FunctionRegistry>,
    cache: Arc<ResponseCache>,
    sessions: Arc<SessionManager>,
    backend: Arc<dyn Backend>,
    sink: Arc<dyn ExecutionSink>,
    default_model: String,
    request_timeout: Duration,
    stream_buffer: usize,
}

impl ExecutionDispatcher {
    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Run a function to completion.
    #[instrument(skip(self, request), fields(function_id = %request.function_id))]
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        self.execute_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Run a function to completion, abandoning the backend call if
    /// `cancel` fires first.
    pub async fn execute_with_cancel(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let descriptor = self.registry.get(&request.function_id)?;
        self.registry.validate(&descriptor, &request.input)?;

        if request.use_cache
            && let Some(hit) = self.cache.get(&descriptor.id, &request.input)
        {
            debug!(function_id = %descriptor.id, "serving cached result");
            return Ok(ExecutionResult {
                cached: true,
                ..hit
            });
        }

        let completion_request = self.completion_request(&descriptor, &request);
        let start = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SkaldError::Cancelled),
            res = tokio::time::timeout(
                self.request_timeout,
                self.backend.complete(&completion_request),
            ) => res.unwrap_or_else(|_| Err(SkaldError::backend(
                BackendErrorKind::Timeout,
                format!("no response within {}s", self.request_timeout.as_secs()),
            ))),
        };
        let elapsed = start.elapsed().as_secs_f64();

        match outcome {
            Ok(completion) => {
                let model_used = if completion.model.is_empty() {
                    completion_request.model.clone()
                } else {
                    completion.model
                };
                let result = ExecutionResult {
                    function_id: descriptor.id.clone(),
                    content: completion.content,
                    usage: completion.usage,
                    model_used,
                    execution_time: elapsed,
                    cached: false,
                };
                self.cache.set(&descriptor.id, &request.input, result.clone());
                record_execution(&descriptor.id, "sync", ExecutionStatus::Completed, elapsed);
                record_tokens(&descriptor.id, &result.usage);
                self.persist(ExecutionRecord {
                    conversation_id: Uuid::new_v4(),
                    function_id: descriptor.id.clone(),
                    function_name: descriptor.name.clone(),
                    model_used: result.model_used.clone(),
                    user_input: completion_request.user_prompt,
                    ai_response: result.content.clone(),
                    total_tokens: result.usage.total_tokens,
                    execution_time: elapsed,
                    status: ExecutionStatus::Completed,
                    metadata: json!({
                        "input": request.input,
                        "model_params": descriptor.model_params,
                        "stream": false,
                        "finish_reason": completion.finish_reason,
                    }),
                    created_at: chrono::Utc::now(),
                });
                Ok(result)
            }
            Err(e) => {
                let status = failure_status(&e);
                record_execution(&descriptor.id, "sync", status, elapsed);
                warn!(
                    function_id = %descriptor.id,
                    model = %completion_request.model,
                    elapsed_ms = (elapsed * 1000.0) as u64,
                    error = %e,
                    "execution failed"
                );
                self.persist(ExecutionRecord {
                    conversation_id: Uuid::new_v4(),
                    function_id: descriptor.id.clone(),
                    function_name: descriptor.name.clone(),
                    model_used: completion_request.model.clone(),
                    user_input: completion_request.user_prompt,
                    ai_response: String::new(),
                    total_tokens: 0,
                    execution_time: elapsed,
                    status,
                    metadata: json!({
                        "input": request.input,
                        "stream": false,
                        "error": e.to_string(),
                    }),
                    created_at: chrono::Utc::now(),
                });
                Err(e)
            }
        }
    }

    /// Open a streaming execution.
    ///
    /// Lookup, validation and admission failures are returned directly;
    /// everything after admission is reported on the returned stream, which
    /// always ends with `stream_completed` or `stream_error`. Cancelling
    /// `cancel` or dropping the stream abandons the backend call and fails
    /// the session. A consumer that stops reading is treated as idle: its
    /// session is reaped and closing events it has no room for are dropped.
    ///
    /// # Panics
    ///
    /// Requires a tokio runtime context; the relay runs on a spawned task.
    #[instrument(skip(self, request, cancel), fields(function_id = %request.function_id))]
    pub fn stream_execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream> {
        let descriptor = self.registry.get(&request.function_id)?;
        self.registry.validate(&descriptor, &request.input)?;
        if !descriptor.supports_streaming {
            return Err(SkaldError::StreamingUnsupported(descriptor.id.clone()));
        }
        let guard = SessionGuard::admit(&self.sessions, &descriptor.id)?;

        let (tx, rx) = mpsc::channel(self.stream_buffer);
        let relay = StreamRelay {
            completion_request: self.completion_request(&descriptor, &request),
            descriptor,
            input: request.input,
            backend: Arc::clone(&self.backend),
            cache: Arc::clone(&self.cache),
            sink: Arc::clone(&self.sink),
            heartbeat_interval: self.sessions.config().heartbeat_interval,
            tx,
            cancel,
        };
        tokio::spawn(relay.run(guard));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    // ========================================================================
    // Admin surface
    // ========================================================================

    /// Active functions in registration order.
    pub fn list_functions(&self) -> Vec<FunctionInfo> {
        self.registry.infos()
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            cache: self.cache.stats(),
            active_streams: self.sessions.active_count(),
            max_concurrent_streams: self.sessions.capacity(),
            functions: self.registry.list().len(),
        }
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Drop cached results of one function. Returns the number removed.
    pub fn clear_function_cache(&self, function_id: &str) -> usize {
        self.cache.invalidate(function_id)
    }

    /// Probe the backend.
    pub async fn health(&self) -> Result<()> {
        self.backend.health_check().await
    }

    /// Start the periodic session reaper.
    pub fn spawn_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        self.sessions.spawn_reaper(shutdown)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn completion_request(
        &self,
        descriptor: &FunctionDescriptor,
        request: &ExecutionRequest,
    ) -> CompletionRequest {
        let model = request
            .model_override
            .clone()
            .or_else(|| descriptor.default_model.clone())
            .unwrap_or_else(|| self.default_model.clone());
        CompletionRequest {
            system_prompt: descriptor.system_prompt.clone(),
            user_prompt: descriptor.render_prompt(&request.input),
            model,
            params: descriptor.model_params.clone(),
        }
    }

    fn persist(&self, record: ExecutionRecord) {
        persist(&self.sink, record);
    }
}

/// Hand a record to the sink on a detached task.
pub(crate) fn persist(sink: &Arc<dyn ExecutionSink>, record: ExecutionRecord) {
    let sink = Arc::clone(sink);
    tokio::spawn(async move {
        let function_id = record.function_id.clone();
        if let Err(e) = sink.record(record).await {
            warn!(function_id = %function_id, error = %e, "failed to persist execution record");
        }
    });
}

fn failure_status(error: &SkaldError) -> ExecutionStatus {
    match error {
        SkaldError::Backend {
            kind: BackendErrorKind::Timeout,
            ..
        } => ExecutionStatus::Timeout,
        _ => ExecutionStatus::Failed,
    }
}

pub(crate) fn record_execution(
    function_id: &str,
    mode: &'static str,
    status: ExecutionStatus,
    elapsed_secs: f64,
) {
    metrics::counter!(telemetry::EXECUTIONS_TOTAL,
        "function" => function_id.to_owned(),
        "mode" => mode,
        "status" => status.as_str(),
    )
    .increment(1);
    metrics::histogram!(telemetry::EXECUTION_DURATION_SECONDS,
        "function" => function_id.to_owned(),
        "mode" => mode,
    )
    .record(elapsed_secs);
}

pub(crate) fn record_tokens(function_id: &str, usage: &TokenUsage) {
    metrics::counter!(telemetry::TOKENS_TOTAL,
        "function" => function_id.to_owned(),
        "direction" => "prompt",
    )
    .increment(u64::from(usage.prompt_tokens));
    metrics::counter!(telemetry::TOKENS_TOTAL,
        "function" => function_id.to_owned(),
        "direction" => "completion",
    )
    .increment(u64::from(usage.completion_tokens));
}
