use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use serde_json::json;
use skald::registry::builtin;
use skald::{
    Backend, BackendErrorKind, BackendStream, Completion, CompletionRequest, EventStream,
    ExecutionDispatcher, ExecutionRecord, ExecutionRequest, ExecutionSink, ExecutionStatus,
    Result, SessionConfig, Skald, SkaldError, StreamEvent, StreamUnit, TokenUsage, sse_frames,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Scripted backend
// ============================================================================

/// One step of a scripted backend stream.
#[derive(Clone)]
enum Step {
    Unit(StreamUnit),
    Fail(&'static str),
    /// Yields content after a pause.
    Delayed(Duration, &'static str),
    /// Never yields again.
    Hang,
    Panic,
}

fn content(s: &str) -> Step {
    Step::Unit(StreamUnit::Content(s.into()))
}

struct ScriptedBackend {
    steps: Vec<Step>,
    open_error: Option<fn() -> SkaldError>,
    hang_on_open: bool,
    opened: AtomicU32,
    completed: AtomicU32,
}

impl ScriptedBackend {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            open_error: None,
            hang_on_open: false,
            opened: AtomicU32::new(0),
            completed: AtomicU32::new(0),
        }
    }

    fn refusing(open_error: fn() -> SkaldError) -> Self {
        Self {
            open_error: Some(open_error),
            ..Self::new(Vec::new())
        }
    }

    /// Never finishes opening the stream.
    fn unresponsive() -> Self {
        Self {
            hang_on_open: true,
            ..Self::new(Vec::new())
        }
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(Completion {
            content: "from complete".into(),
            usage: TokenUsage::default(),
            model: request.model.clone(),
            finish_reason: None,
        })
    }

    async fn stream_complete(&self, _request: &CompletionRequest) -> Result<BackendStream> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if let Some(open_error) = self.open_error {
            return Err(open_error());
        }
        if self.hang_on_open {
            std::future::pending::<()>().await;
        }
        let units = stream::iter(self.steps.clone()).then(|step| async move {
            match step {
                Step::Unit(unit) => Ok(unit),
                Step::Delayed(pause, text) => {
                    tokio::time::sleep(pause).await;
                    Ok(StreamUnit::Content(text.into()))
                }
                Step::Fail(message) => Err(SkaldError::backend(BackendErrorKind::Unknown, message)),
                Step::Hang => std::future::pending().await,
                Step::Panic => panic!("scripted backend exploded"),
            }
        });
        Ok(Box::pin(units))
    }
}

/// Yields tokens forever and records when its stream is dropped.
struct EndlessBackend {
    dropped: Arc<AtomicBool>,
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for EndlessBackend {
    fn name(&self) -> &str {
        "endless"
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<Completion> {
        Err(SkaldError::backend(BackendErrorKind::Unknown, "unused"))
    }

    async fn stream_complete(&self, _request: &CompletionRequest) -> Result<BackendStream> {
        let flag = DropFlag(Arc::clone(&self.dropped));
        Ok(Box::pin(stream::repeat_with(move || {
            let _flag = &flag;
            Ok(StreamUnit::Content("la".into()))
        })))
    }
}

struct ChannelSink(mpsc::UnboundedSender<ExecutionRecord>);

#[async_trait]
impl ExecutionSink for ChannelSink {
    async fn record(&self, record: ExecutionRecord) -> Result<()> {
        let _ = self.0.send(record);
        Ok(())
    }
}

struct Harness {
    dispatcher: ExecutionDispatcher,
    backend: Arc<ScriptedBackend>,
    records: mpsc::UnboundedReceiver<ExecutionRecord>,
}

fn harness_with(backend: ScriptedBackend, sessions: SessionConfig) -> Harness {
    let backend = Arc::new(backend);
    let (tx, records) = mpsc::unbounded_channel();
    let dispatcher = Skald::builder()
        .backend_arc(backend.clone())
        .sessions(sessions)
        .sink(Arc::new(ChannelSink(tx)))
        .build()
        .unwrap();
    Harness {
        dispatcher,
        backend,
        records,
    }
}

fn harness(steps: Vec<Step>) -> Harness {
    harness_with(ScriptedBackend::new(steps), SessionConfig::new())
}

impl Harness {
    fn open(&self) -> EventStream {
        self.open_with(CancellationToken::new())
    }

    fn open_with(&self, cancel: CancellationToken) -> EventStream {
        self.dispatcher
            .stream_execute(translate("你好"), cancel)
            .unwrap()
    }

    async fn next_record(&mut self) -> ExecutionRecord {
        tokio::time::timeout(Duration::from_secs(5), self.records.recv())
            .await
            .expect("no record within 5s")
            .expect("sink channel closed")
    }
}

fn translate(text: &str) -> ExecutionRequest {
    ExecutionRequest::from_json(builtin::TRANSLATION_ZH_TO_EN, json!({ "text": text }))
}

fn kinds(events: &[StreamEvent]) -> Vec<&'static str> {
    events.iter().map(StreamEvent::kind).collect()
}

fn error_message(event: &StreamEvent) -> &str {
    match event {
        StreamEvent::Error { message, .. } => message,
        other => panic!("expected error event, got {other:?}"),
    }
}

fn stream_error(event: &StreamEvent) -> &str {
    match event {
        StreamEvent::StreamError { error, .. } => error,
        other => panic!("expected stream_error event, got {other:?}"),
    }
}

// ============================================================================
// Normal completion
// ============================================================================

#[tokio::test]
async fn full_event_sequence() {
    let mut h = harness(vec![
        content("Hel"),
        content("lo"),
        Step::Unit(StreamUnit::Usage(TokenUsage::new(3, 2))),
        Step::Unit(StreamUnit::Finish("stop".into())),
        content("after finish"),
    ]);

    let events: Vec<StreamEvent> = h.open().collect().await;
    assert_eq!(
        kinds(&events),
        [
            "connected",
            "start",
            "token",
            "token",
            "end",
            "stream_completed"
        ]
    );

    let stream_id = match &events[0] {
        StreamEvent::Connected { stream_id, .. } => *stream_id,
        other => panic!("expected connected, got {other:?}"),
    };
    match &events[5] {
        StreamEvent::StreamCompleted { stream_id: id, .. } => assert_eq!(*id, stream_id),
        other => panic!("expected stream_completed, got {other:?}"),
    }
    match &events[1] {
        StreamEvent::Start { function_id, .. } => {
            assert_eq!(function_id, builtin::TRANSLATION_ZH_TO_EN)
        }
        other => panic!("expected start, got {other:?}"),
    }
    match &events[4] {
        StreamEvent::End {
            usage,
            finish_reason,
            ..
        } => {
            assert_eq!(usage.total_tokens, 5);
            assert_eq!(finish_reason.as_deref(), Some("stop"));
        }
        other => panic!("expected end, got {other:?}"),
    }

    assert_eq!(h.dispatcher.sessions().active_count(), 0);

    let record = h.next_record().await;
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.ai_response, "Hello");
    assert_eq!(record.total_tokens, 5);
    assert_eq!(record.metadata["stream"], true);
    assert_eq!(record.metadata["session_id"], json!(stream_id));
}

#[tokio::test]
async fn completed_stream_populates_the_cache() {
    let h = harness(vec![content("Hel"), content("lo")]);

    let events: Vec<StreamEvent> = h.open().collect().await;
    match &events[events.len() - 2] {
        StreamEvent::End {
            usage,
            finish_reason,
            ..
        } => {
            assert_eq!(*usage, TokenUsage::default());
            assert!(finish_reason.is_none());
        }
        other => panic!("expected end, got {other:?}"),
    }

    let cached = h.dispatcher.execute(translate("你好")).await.unwrap();
    assert!(cached.cached);
    assert_eq!(cached.content, "Hello");
    assert_eq!(h.backend.completed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn frames_are_sse_data_lines() {
    let h = harness(vec![content("Hi")]);

    let frames: Vec<String> = sse_frames(h.open()).collect().await;
    assert_eq!(frames.len(), 5);
    for frame in &frames {
        assert!(frame.starts_with("data: "), "frame: {frame:?}");
        assert!(frame.ends_with("\n\n"), "frame: {frame:?}");
        let payload: serde_json::Value =
            serde_json::from_str(frame.trim_start_matches("data: ").trim_end()).unwrap();
        assert!(payload["timestamp"].is_i64());
    }
    assert!(frames[2].contains("\"type\":\"token\""));
    assert!(frames[2].contains("\"content\":\"Hi\""));
}

// ============================================================================
// Backend failures
// ============================================================================

#[tokio::test]
async fn in_band_error_ends_with_stream_completed() {
    let mut h = harness(vec![
        content("partial"),
        Step::Unit(StreamUnit::Error("quota exceeded".into())),
        content("never sent"),
    ]);

    let events: Vec<StreamEvent> = h.open().collect().await;
    assert_eq!(
        kinds(&events),
        ["connected", "start", "token", "error", "stream_completed"]
    );
    assert_eq!(error_message(&events[3]), "quota exceeded");
    assert!(h.dispatcher.cache().is_empty());
    assert_eq!(h.dispatcher.sessions().active_count(), 0);

    let record = h.next_record().await;
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.ai_response, "partial");
}

#[tokio::test]
async fn transport_error_mid_stream() {
    let h = harness(vec![content("partial"), Step::Fail("connection reset")]);

    let events: Vec<StreamEvent> = h.open().collect().await;
    assert_eq!(
        kinds(&events),
        ["connected", "start", "token", "error", "stream_completed"]
    );
    assert!(error_message(&events[3]).contains("connection reset"));
}

#[tokio::test]
async fn backend_refusing_to_open() {
    let h = harness_with(
        ScriptedBackend::refusing(|| {
            SkaldError::backend(BackendErrorKind::RateLimited, "HTTP 429: slow down")
        }),
        SessionConfig::new(),
    );

    let events: Vec<StreamEvent> = h.open().collect().await;
    assert_eq!(
        kinds(&events),
        ["connected", "start", "error", "stream_completed"]
    );
    assert!(error_message(&events[2]).contains("slow down"));
    assert_eq!(h.dispatcher.sessions().active_count(), 0);
}

#[tokio::test]
async fn panicking_backend_is_contained() {
    let h = harness(vec![content("a"), Step::Panic]);

    let events: Vec<StreamEvent> = h.open().collect().await;
    assert_eq!(
        kinds(&events),
        ["connected", "start", "token", "error", "stream_error"]
    );
    assert_eq!(error_message(&events[3]), "internal error");
    assert_eq!(stream_error(&events[4]), "internal error");
    assert_eq!(h.dispatcher.sessions().active_count(), 0);

    // The dispatcher keeps serving after a relay panic.
    let next: Vec<StreamEvent> = h.open().collect().await;
    assert_eq!(next.first().map(StreamEvent::kind), Some("connected"));
}

// ============================================================================
// Cancellation and disconnection
// ============================================================================

#[tokio::test]
async fn cancellation_ends_with_stream_error() {
    let mut h = harness(vec![content("Hi"), Step::Hang]);
    let cancel = CancellationToken::new();
    let mut events = h.open_with(cancel.clone());

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(events.next().await.unwrap());
    }
    assert_eq!(kinds(&seen), ["connected", "start", "token"]);

    cancel.cancel();
    let rest: Vec<StreamEvent> = events.collect().await;
    assert_eq!(kinds(&rest), ["error", "stream_error"]);
    assert_eq!(error_message(&rest[0]), "stream cancelled");
    assert_eq!(stream_error(&rest[1]), "stream cancelled");
    assert_eq!(h.dispatcher.sessions().active_count(), 0);

    let record = h.next_record().await;
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.ai_response, "Hi");
}

#[tokio::test(start_paused = true)]
async fn dropping_the_consumer_frees_the_session() {
    let mut h = harness(vec![content("Hi"), Step::Hang]);
    let mut events = h.open();
    for _ in 0..3 {
        events.next().await.unwrap();
    }
    assert_eq!(h.dispatcher.sessions().active_count(), 1);

    drop(events);
    let record = h.next_record().await;
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.metadata["error"], "client disconnected");
    assert_eq!(h.dispatcher.sessions().active_count(), 0);
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test]
async fn non_streaming_function_is_rejected() {
    let backend = Arc::new(ScriptedBackend::new(vec![content("x")]));
    let dispatcher = Skald::builder()
        .backend_arc(backend.clone())
        .function(builtin::text_summary().supports_streaming(false))
        .build()
        .unwrap();

    let err = dispatcher
        .stream_execute(
            ExecutionRequest::from_json(builtin::TEXT_SUMMARY, json!({"text": "x"})),
            CancellationToken::new(),
        )
        .err()
        .unwrap();
    assert!(matches!(err, SkaldError::StreamingUnsupported(_)));
    assert_eq!(dispatcher.sessions().active_count(), 0);
    assert_eq!(backend.opened.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invalid_input_is_rejected_before_admission() {
    let h = harness(vec![content("x")]);

    let err = h
        .dispatcher
        .stream_execute(
            ExecutionRequest::from_json(builtin::TRANSLATION_ZH_TO_EN, json!({})),
            CancellationToken::new(),
        )
        .err()
        .unwrap();
    assert!(matches!(err, SkaldError::ValidationFailed { .. }));
    assert_eq!(h.dispatcher.sessions().active_count(), 0);
    assert_eq!(h.backend.opened.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn admission_ceiling_rejects_extra_streams() {
    let h = harness_with(
        ScriptedBackend::new(vec![Step::Hang]),
        SessionConfig::new().max_concurrent_streams(1),
    );

    let cancel = CancellationToken::new();
    let first = h.open_with(cancel.clone());

    let err = h
        .dispatcher
        .stream_execute(translate("再见"), CancellationToken::new())
        .err()
        .unwrap();
    assert!(matches!(err, SkaldError::CapacityExceeded { limit: 1 }));
    assert_eq!(err.status_code(), 503);

    cancel.cancel();
    let _: Vec<StreamEvent> = first.collect().await;
    assert_eq!(h.dispatcher.sessions().active_count(), 0);

    let again = h
        .dispatcher
        .stream_execute(translate("再见"), CancellationToken::new());
    assert!(again.is_ok());
}

// ============================================================================
// Heartbeats and expiry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn heartbeats_flow_while_backend_is_silent() {
    let h = harness_with(
        ScriptedBackend::new(vec![content("Hi"), Step::Hang]),
        SessionConfig::new().heartbeat_interval(Duration::from_secs(1)),
    );
    let cancel = CancellationToken::new();
    let mut events = h.open_with(cancel.clone());

    let mut seen = Vec::new();
    for _ in 0..5 {
        seen.push(events.next().await.unwrap());
    }
    assert_eq!(
        kinds(&seen),
        ["connected", "start", "token", "heartbeat", "heartbeat"]
    );

    cancel.cancel();
    let rest: Vec<StreamEvent> = events.collect().await;
    assert_eq!(kinds(&rest), ["error", "stream_error"]);
}

#[tokio::test(start_paused = true)]
async fn idle_session_is_expired_by_the_reaper() {
    let mut h = harness_with(
        ScriptedBackend::new(vec![Step::Hang]),
        SessionConfig::new()
            .stream_timeout(Duration::from_secs(5))
            .heartbeat_interval(Duration::from_secs(1))
            .reap_interval(Duration::from_secs(1)),
    );
    let shutdown = CancellationToken::new();
    let reaper = h.dispatcher.spawn_reaper(shutdown.clone());

    let events: Vec<StreamEvent> = h.open().collect().await;
    let n = events.len();
    assert_eq!(kinds(&events[..2]), ["connected", "start"]);
    assert!(
        events[2..n - 2]
            .iter()
            .all(|e| matches!(e, StreamEvent::Heartbeat { .. }))
    );
    assert_eq!(error_message(&events[n - 2]), "stream session expired");
    assert_eq!(stream_error(&events[n - 1]), "stream session expired");
    assert_eq!(h.dispatcher.sessions().active_count(), 0);

    let record = h.next_record().await;
    assert_eq!(record.status, ExecutionStatus::Timeout);

    shutdown.cancel();
    reaper.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn heartbeats_wait_for_silence() {
    let h = harness_with(
        ScriptedBackend::new(vec![
            Step::Delayed(Duration::from_millis(600), "a"),
            Step::Delayed(Duration::from_millis(600), "b"),
            Step::Delayed(Duration::from_millis(600), "c"),
            Step::Delayed(Duration::from_millis(600), "d"),
            Step::Hang,
        ]),
        SessionConfig::new().heartbeat_interval(Duration::from_secs(1)),
    );
    let cancel = CancellationToken::new();
    let mut events = h.open_with(cancel.clone());

    let mut seen = Vec::new();
    for _ in 0..7 {
        seen.push(events.next().await.unwrap());
    }
    assert_eq!(
        kinds(&seen),
        [
            "connected",
            "start",
            "token",
            "token",
            "token",
            "token",
            "heartbeat"
        ]
    );

    cancel.cancel();
    let rest: Vec<StreamEvent> = events.collect().await;
    assert_eq!(kinds(&rest), ["error", "stream_error"]);
}

#[tokio::test(start_paused = true)]
async fn session_reaped_while_opening_ends_the_stream() {
    let mut h = harness_with(
        ScriptedBackend::unresponsive(),
        SessionConfig::new()
            .stream_timeout(Duration::from_secs(5))
            .heartbeat_interval(Duration::from_secs(1))
            .reap_interval(Duration::from_secs(1)),
    );
    let shutdown = CancellationToken::new();
    let reaper = h.dispatcher.spawn_reaper(shutdown.clone());

    let events: Vec<StreamEvent> =
        tokio::time::timeout(Duration::from_secs(3600), h.open().collect())
            .await
            .expect("stream never ended after its session was reaped");
    let n = events.len();
    assert_eq!(kinds(&events[..2]), ["connected", "start"]);
    assert!(
        events[2..n - 2]
            .iter()
            .all(|e| matches!(e, StreamEvent::Heartbeat { .. }))
    );
    assert_eq!(error_message(&events[n - 2]), "stream session expired");
    assert_eq!(stream_error(&events[n - 1]), "stream session expired");
    assert_eq!(h.backend.opened.load(Ordering::SeqCst), 1);
    assert_eq!(h.dispatcher.sessions().active_count(), 0);

    let record = h.next_record().await;
    assert_eq!(record.status, ExecutionStatus::Timeout);

    shutdown.cancel();
    reaper.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stalled_consumer_cannot_pin_a_cancelled_relay() {
    let dropped = Arc::new(AtomicBool::new(false));
    let dispatcher = Skald::builder()
        .backend(EndlessBackend {
            dropped: Arc::clone(&dropped),
        })
        .stream_buffer(4)
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    // Held but never polled.
    let events = dispatcher
        .stream_execute(translate("你好"), cancel.clone())
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(dispatcher.sessions().active_count(), 1);
    assert!(!dropped.load(Ordering::SeqCst));

    cancel.cancel();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(dropped.load(Ordering::SeqCst));
    assert_eq!(dispatcher.sessions().active_count(), 0);
    drop(events);
}

#[tokio::test(start_paused = true)]
async fn stalled_consumer_is_released_by_the_reaper() {
    let dropped = Arc::new(AtomicBool::new(false));
    let dispatcher = Skald::builder()
        .backend(EndlessBackend {
            dropped: Arc::clone(&dropped),
        })
        .stream_buffer(4)
        .sessions(
            SessionConfig::new()
                .stream_timeout(Duration::from_secs(5))
                .heartbeat_interval(Duration::from_secs(1))
                .reap_interval(Duration::from_secs(1)),
        )
        .build()
        .unwrap();
    let shutdown = CancellationToken::new();
    let reaper = dispatcher.spawn_reaper(shutdown.clone());
    let events = dispatcher
        .stream_execute(translate("你好"), CancellationToken::new())
        .unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(dropped.load(Ordering::SeqCst));
    assert_eq!(dispatcher.sessions().active_count(), 0);
    drop(events);

    shutdown.cancel();
    reaper.await.unwrap();
}
