//! Telemetry metric name constants.
//!
//! Centralised metric names for skald operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `skald_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `function`: function id (e.g. "translation_zh_to_en")
//! - `mode`: "sync" or "stream"
//! - `status`: outcome, "completed", "failed" or "timeout"
//! - `direction`: "prompt" or "completion"

/// Total executions dispatched to the backend (cache hits excluded).
///
/// Labels: `function`, `mode`, `status`.
pub const EXECUTIONS_TOTAL: &str = "skald_executions_total";

/// Backend call duration in seconds.
///
/// Labels: `function`, `mode`.
pub const EXECUTION_DURATION_SECONDS: &str = "skald_execution_duration_seconds";

/// Total response cache hits.
///
/// Labels: `function`.
pub const CACHE_HITS_TOTAL: &str = "skald_cache_hits_total";

/// Total response cache misses (absent or expired).
///
/// Labels: `function`.
pub const CACHE_MISSES_TOTAL: &str = "skald_cache_misses_total";

/// Total entries evicted to make room under the capacity ceiling.
pub const CACHE_EVICTIONS_TOTAL: &str = "skald_cache_evictions_total";

/// Streaming sessions currently admitted or active.
pub const STREAM_SESSIONS_ACTIVE: &str = "skald_stream_sessions_active";

/// Streaming admissions rejected at the concurrency ceiling.
pub const STREAM_REJECTIONS_TOTAL: &str = "skald_stream_rejections_total";

/// Streaming sessions removed by the inactivity reaper.
pub const STREAM_SESSIONS_REAPED_TOTAL: &str = "skald_stream_sessions_reaped_total";

/// Total retry attempts against the backend (not counting the initial request).
///
/// Labels: `backend`, `operation`.
pub const RETRIES_TOTAL: &str = "skald_retries_total";

/// Total tokens consumed.
///
/// Labels: `function`, `direction` ("prompt" | "completion").
pub const TOKENS_TOTAL: &str = "skald_tokens_total";
