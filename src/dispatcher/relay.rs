//! Streaming relay: backend units in, session events out.
//!
//! Every session emits `connected`, `start`, any number of `token` and
//! `heartbeat` events, exactly one of `end`/`error`, then exactly one of
//! `stream_completed`/`stream_error`. The trailing event tells the consumer
//! whether the session itself ended cleanly:
//!
//! | how the stream ended          | inner   | trailing           | record    |
//! |-------------------------------|---------|--------------------|-----------|
//! | backend finished              | `end`   | `stream_completed` | completed |
//! | backend reported an error     | `error` | `stream_completed` | failed    |
//! | cancelled or consumer gone    | `error` | `stream_error`     | failed    |
//! | session reaped for inactivity | `error` | `stream_error`     | timeout   |
//! | relay panicked                | `error` | `stream_error`     | (none)    |

use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{persist, record_execution, record_tokens};
use crate::backend::{Backend, CompletionRequest, StreamUnit};
use crate::cache::ResponseCache;
use crate::registry::FunctionDescriptor;
use crate::session::SessionGuard;
use crate::sink::ExecutionSink;
use crate::types::{ExecutionRecord, ExecutionResult, ExecutionStatus, InputFields, StreamEvent, TokenUsage};

/// How the relay loop ended.
enum RelayOutcome {
    Finished,
    BackendFailed,
    Aborted(&'static str),
    Expired,
}

/// Why relaying stopped before the backend finished.
enum Halt {
    Cancelled,
    Disconnected,
    Expired,
    Backend(String),
}

/// What the backend has produced so far.
#[derive(Default)]
struct Progress {
    content: String,
    usage: Option<TokenUsage>,
    finish_reason: Option<String>,
}

/// Everything one streaming session needs, owned by its relay task.
pub(super) struct StreamRelay {
    pub(super) descriptor: Arc<FunctionDescriptor>,
    pub(super) input: InputFields,
    pub(super) completion_request: CompletionRequest,
    pub(super) backend: Arc<dyn Backend>,
    pub(super) cache: Arc<ResponseCache>,
    pub(super) sink: Arc<dyn ExecutionSink>,
    pub(super) heartbeat_interval: Duration,
    pub(super) tx: mpsc::Sender<StreamEvent>,
    pub(super) cancel: CancellationToken,
}

impl StreamRelay {
    pub(super) async fn run(self, guard: SessionGuard) {
        let session_id = guard.id();
        self.deliver(StreamEvent::connected(session_id)).await;

        let outcome = AssertUnwindSafe(self.relay(&guard)).catch_unwind().await;

        // The session is closed before the closing events go out, so a
        // stalled consumer never holds a slot.
        let (inner, trailing) = match outcome {
            Ok((RelayOutcome::Finished, inner)) => {
                guard.complete();
                (inner, StreamEvent::stream_completed(session_id))
            }
            Ok((RelayOutcome::BackendFailed, inner)) => {
                guard.fail();
                (inner, StreamEvent::stream_completed(session_id))
            }
            Ok((RelayOutcome::Aborted(reason), inner)) => {
                guard.fail();
                (inner, StreamEvent::stream_error(session_id, reason))
            }
            Ok((RelayOutcome::Expired, inner)) => {
                // Already removed by the reaper.
                guard.fail();
                (inner, StreamEvent::stream_error(session_id, "stream session expired"))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(session_id = %session_id, panic = %message, "stream relay panicked");
                guard.fail();
                (
                    StreamEvent::error("internal error"),
                    StreamEvent::stream_error(session_id, "internal error"),
                )
            }
        };
        self.deliver(inner).await;
        self.deliver(trailing).await;
    }

    /// Relay the backend stream, then settle the outcome. Returns the
    /// outcome with its inner terminal event (`end` or `error`).
    async fn relay(&self, guard: &SessionGuard) -> (RelayOutcome, StreamEvent) {
        let session_id = guard.id();
        let start = Instant::now();
        let mut progress = Progress::default();

        // The backend stream is dropped when `pump` returns.
        let halted = self.pump(guard, &mut progress).await;

        match halted {
            Ok(()) => self.finished(session_id, progress, start),
            Err(Halt::Backend(message)) => {
                self.backend_failed(session_id, &message, &progress.content, start)
            }
            Err(Halt::Cancelled) => {
                self.abort(session_id, "stream cancelled", &progress.content, start)
            }
            Err(Halt::Disconnected) => {
                self.abort(session_id, "client disconnected", &progress.content, start)
            }
            Err(Halt::Expired) => self.expired(session_id, &progress.content, start),
        }
    }

    async fn pump(&self, guard: &SessionGuard, progress: &mut Progress) -> Result<(), Halt> {
        let function_id = self.descriptor.id.as_str();
        self.emit(guard, StreamEvent::start(function_id)).await?;

        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + self.heartbeat_interval, self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut upstream = {
            let mut open = pin!(self.backend.stream_complete(&self.completion_request));
            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(Halt::Cancelled),
                    _ = self.tx.closed() => return Err(Halt::Disconnected),
                    _ = heartbeat.tick() => self.beat(guard).await?,
                    opened = &mut open => {
                        break opened.map_err(|e| Halt::Backend(e.to_string()))?;
                    }
                }
            }
        };
        debug!(session_id = %guard.id(), function_id, model = %self.completion_request.model, "relaying backend stream");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Halt::Cancelled),
                _ = self.tx.closed() => return Err(Halt::Disconnected),
                _ = heartbeat.tick() => self.beat(guard).await?,
                unit = upstream.next() => {
                    match unit {
                        None => return Ok(()),
                        Some(Ok(StreamUnit::Content(delta))) => {
                            if !guard.touch() {
                                return Err(Halt::Expired);
                            }
                            progress.content.push_str(&delta);
                            self.emit(guard, StreamEvent::token(delta)).await?;
                        }
                        Some(Ok(StreamUnit::Usage(latest))) => progress.usage = Some(latest),
                        Some(Ok(StreamUnit::Finish(reason))) => {
                            progress.finish_reason = Some(reason);
                            return Ok(());
                        }
                        Some(Ok(StreamUnit::Error(message))) => return Err(Halt::Backend(message)),
                        Some(Err(e)) => return Err(Halt::Backend(e.to_string())),
                    }
                    heartbeat.reset();
                }
            }
        }
    }

    /// Heartbeat tick: stop if the session was reaped, otherwise send one.
    async fn beat(&self, guard: &SessionGuard) -> Result<(), Halt> {
        if !guard.is_live() {
            return Err(Halt::Expired);
        }
        self.emit(guard, StreamEvent::heartbeat()).await
    }

    /// Send one event, waiting for channel room while watching for
    /// cancellation and reaping.
    async fn emit(&self, guard: &SessionGuard, event: StreamEvent) -> Result<(), Halt> {
        let mut send = pin!(self.tx.send(event));
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Halt::Cancelled),
                sent = &mut send => return sent.map_err(|_| Halt::Disconnected),
                _ = tokio::time::sleep(self.heartbeat_interval) => {
                    if !guard.is_live() {
                        return Err(Halt::Expired);
                    }
                }
            }
        }
    }

    /// Send a closing event. A consumer that makes no room within one
    /// heartbeat interval loses it.
    async fn deliver(&self, event: StreamEvent) {
        if let Err(SendTimeoutError::Timeout(event)) =
            self.tx.send_timeout(event, self.heartbeat_interval).await
        {
            debug!(event = event.kind(), "consumer stalled, dropping stream event");
        }
    }

    fn finished(
        &self,
        session_id: Uuid,
        progress: Progress,
        start: Instant,
    ) -> (RelayOutcome, StreamEvent) {
        let function_id = self.descriptor.id.as_str();
        let elapsed = start.elapsed().as_secs_f64();
        let usage = progress.usage.unwrap_or_default();
        let finish_reason = progress.finish_reason;

        let result = ExecutionResult {
            function_id: function_id.to_string(),
            content: progress.content,
            usage,
            model_used: self.completion_request.model.clone(),
            execution_time: elapsed,
            cached: false,
        };
        self.cache.set(function_id, &self.input, result.clone());
        record_execution(function_id, "stream", ExecutionStatus::Completed, elapsed);
        record_tokens(function_id, &usage);
        debug!(
            session_id = %session_id,
            function_id,
            elapsed_ms = (elapsed * 1000.0) as u64,
            "stream completed"
        );
        self.persist(
            session_id,
            ExecutionStatus::Completed,
            &result.content,
            usage.total_tokens,
            elapsed,
            json!({"finish_reason": finish_reason}),
        );
        (
            RelayOutcome::Finished,
            StreamEvent::end(usage, elapsed, finish_reason),
        )
    }

    fn backend_failed(
        &self,
        session_id: Uuid,
        message: &str,
        partial: &str,
        start: Instant,
    ) -> (RelayOutcome, StreamEvent) {
        let elapsed = start.elapsed().as_secs_f64();
        warn!(
            session_id = %session_id,
            function_id = %self.descriptor.id,
            error = message,
            "backend stream failed"
        );
        record_execution(&self.descriptor.id, "stream", ExecutionStatus::Failed, elapsed);
        self.persist(
            session_id,
            ExecutionStatus::Failed,
            partial,
            0,
            elapsed,
            json!({"error": message}),
        );
        (RelayOutcome::BackendFailed, StreamEvent::error(message))
    }

    fn abort(
        &self,
        session_id: Uuid,
        reason: &'static str,
        partial: &str,
        start: Instant,
    ) -> (RelayOutcome, StreamEvent) {
        let elapsed = start.elapsed().as_secs_f64();
        debug!(session_id = %session_id, function_id = %self.descriptor.id, reason, "stream aborted");
        record_execution(&self.descriptor.id, "stream", ExecutionStatus::Failed, elapsed);
        self.persist(
            session_id,
            ExecutionStatus::Failed,
            partial,
            0,
            elapsed,
            json!({"error": reason}),
        );
        (RelayOutcome::Aborted(reason), StreamEvent::error(reason))
    }

    fn expired(&self, session_id: Uuid, partial: &str, start: Instant) -> (RelayOutcome, StreamEvent) {
        let elapsed = start.elapsed().as_secs_f64();
        warn!(session_id = %session_id, function_id = %self.descriptor.id, "stream session expired");
        record_execution(&self.descriptor.id, "stream", ExecutionStatus::Timeout, elapsed);
        self.persist(
            session_id,
            ExecutionStatus::Timeout,
            partial,
            0,
            elapsed,
            json!({"error": "stream session expired"}),
        );
        (RelayOutcome::Expired, StreamEvent::error("stream session expired"))
    }

    fn persist(
        &self,
        session_id: Uuid,
        status: ExecutionStatus,
        response: &str,
        total_tokens: u32,
        elapsed: f64,
        mut metadata: serde_json::Value,
    ) {
        if let Some(map) = metadata.as_object_mut() {
            map.insert("input".into(), json!(self.input));
            map.insert("stream".into(), json!(true));
            map.insert("session_id".into(), json!(session_id));
        }
        persist(
            &self.sink,
            ExecutionRecord {
                conversation_id: Uuid::new_v4(),
                function_id: self.descriptor.id.clone(),
                function_name: self.descriptor.name.clone(),
                model_used: self.completion_request.model.clone(),
                user_input: self.completion_request.user_prompt.clone(),
                ai_response: response.to_string(),
                total_tokens,
                execution_time: elapsed,
                status,
                metadata,
                created_at: chrono::Utc::now(),
            },
        );
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
