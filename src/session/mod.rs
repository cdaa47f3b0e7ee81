//! Streaming session admission and lifecycle.
//!
//! [`SessionManager`] gates how many streaming sessions may be open at once
//! and tracks each open session through
//! `Admitted → Active → {Completed | Failed | Expired}`. Terminal sessions
//! are dropped from the live set immediately; no history is kept.
//!
//! Sessions that see no activity for `stream_timeout` are expired by
//! [`SessionManager::reap_expired`], which runs before every admission and
//! periodically from the task started by [`SessionManager::spawn_reaper`].

mod frame;

pub use frame::{encode_frame, error_frame, sse_frames};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::telemetry;
use crate::{Result, SkaldError};

/// Shortest heartbeat or reaper period; tokio intervals reject zero.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Configuration for streaming sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Ceiling on concurrently open sessions. Default: 100.
    pub max_concurrent_streams: usize,
    /// Inactivity after which a session is reaped. Default: 5 minutes.
    pub stream_timeout: Duration,
    /// Heartbeat period while the backend is silent. Default: 30 seconds.
    pub heartbeat_interval: Duration,
    /// Period of the background reaper task. Default: 60 seconds.
    pub reap_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 100,
            stream_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            reap_interval: Duration::from_secs(60),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_concurrent_streams(mut self, n: usize) -> Self {
        self.max_concurrent_streams = n;
        self
    }

    pub fn stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(MIN_PERIOD);
        self
    }

    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval.max(MIN_PERIOD);
        self
    }

    /// Raise zero periods set directly on the fields to the minimum.
    fn normalized(mut self) -> Self {
        self.heartbeat_interval = self.heartbeat_interval.max(MIN_PERIOD);
        self.reap_interval = self.reap_interval.max(MIN_PERIOD);
        self
    }
}

/// Lifecycle state of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Admitted,
    Active,
    Completed,
    Expired,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Admitted => "admitted",
            SessionState::Active => "active",
            SessionState::Completed => "completed",
            SessionState::Expired => "expired",
            SessionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Expired | SessionState::Failed
        )
    }
}

/// Snapshot of one live session.
#[derive(Debug, Clone)]
pub struct StreamSession {
    pub id: Uuid,
    pub function_id: String,
    pub state: SessionState,
    pub created_at: Instant,
    pub last_activity_at: Instant,
}

/// Admission control and lifecycle tracking for streaming sessions.
#[derive(Debug)]
pub struct SessionManager {
    config: SessionConfig,
    sessions: Mutex<HashMap<Uuid, StreamSession>>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config: config.normalized(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Admit a new session for `function_id`.
    ///
    /// Expired sessions are reaped first, so a slot held by a vanished
    /// client is reclaimed before the ceiling is checked.
    pub fn admit(&self, function_id: &str) -> Result<Uuid> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let reaped = reap_locked(&mut sessions, now, self.config.stream_timeout);

        if sessions.len() >= self.config.max_concurrent_streams {
            let active = sessions.len();
            drop(sessions);
            record_reaped(reaped);
            metrics::counter!(telemetry::STREAM_REJECTIONS_TOTAL).increment(1);
            metrics::gauge!(telemetry::STREAM_SESSIONS_ACTIVE).set(active as f64);
            warn!(
                function_id,
                limit = self.config.max_concurrent_streams,
                "stream admission rejected"
            );
            return Err(SkaldError::CapacityExceeded {
                limit: self.config.max_concurrent_streams,
            });
        }

        let id = Uuid::new_v4();
        sessions.insert(
            id,
            StreamSession {
                id,
                function_id: function_id.to_string(),
                state: SessionState::Admitted,
                created_at: now,
                last_activity_at: now,
            },
        );
        let active = sessions.len();
        drop(sessions);

        record_reaped(reaped);
        metrics::gauge!(telemetry::STREAM_SESSIONS_ACTIVE).set(active as f64);
        debug!(session_id = %id, function_id, active, "stream session admitted");
        Ok(id)
    }

    /// Record activity on a session.
    ///
    /// The first touch moves the session to `Active`. Returns false when the
    /// session is no longer live (completed, failed or reaped).
    pub fn touch(&self, id: Uuid) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(&id) {
            Some(session) => {
                session.state = SessionState::Active;
                session.last_activity_at = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Close a session as `Completed`. Returns false if it was not live.
    pub fn complete(&self, id: Uuid) -> bool {
        self.close(id, SessionState::Completed)
    }

    /// Close a session as `Failed`. Returns false if it was not live.
    pub fn fail(&self, id: Uuid) -> bool {
        self.close(id, SessionState::Failed)
    }

    fn close(&self, id: Uuid, state: SessionState) -> bool {
        let mut sessions = self.sessions.lock();
        let removed = sessions.remove(&id);
        let active = sessions.len();
        drop(sessions);

        match removed {
            Some(session) => {
                metrics::gauge!(telemetry::STREAM_SESSIONS_ACTIVE).set(active as f64);
                debug!(
                    session_id = %id,
                    function_id = %session.function_id,
                    state = state.as_str(),
                    elapsed_ms = session.created_at.elapsed().as_millis() as u64,
                    "stream session closed"
                );
                true
            }
            None => false,
        }
    }

    /// Expire every session idle for longer than the stream timeout.
    ///
    /// Applies regardless of state. Returns the number of sessions removed.
    pub fn reap_expired(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let reaped = reap_locked(&mut sessions, Instant::now(), self.config.stream_timeout);
        let active = sessions.len();
        drop(sessions);

        if reaped > 0 {
            record_reaped(reaped);
            metrics::gauge!(telemetry::STREAM_SESSIONS_ACTIVE).set(active as f64);
        }
        reaped
    }

    /// Whether `id` is still admitted or active.
    pub fn is_live(&self, id: Uuid) -> bool {
        self.sessions.lock().contains_key(&id)
    }

    /// Snapshot of a live session.
    pub fn session(&self, id: Uuid) -> Option<StreamSession> {
        self.sessions.lock().get(&id).cloned()
    }

    /// Number of sessions currently admitted or active.
    pub fn active_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Configured concurrency ceiling.
    pub fn capacity(&self) -> usize {
        self.config.max_concurrent_streams
    }

    /// Spawn the periodic reaper. It runs until `shutdown` is cancelled.
    pub fn spawn_reaper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let period = manager.config.reap_interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = manager.reap_expired();
                        if reaped > 0 {
                            info!(
                                reaped,
                                remaining = manager.active_count(),
                                "reaped idle stream sessions"
                            );
                        }
                    }
                }
            }
        })
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

fn reap_locked(
    sessions: &mut HashMap<Uuid, StreamSession>,
    now: Instant,
    timeout: Duration,
) -> usize {
    let before = sessions.len();
    sessions.retain(|id, session| {
        let idle = now.duration_since(session.last_activity_at);
        if idle > timeout {
            debug!(
                session_id = %id,
                function_id = %session.function_id,
                state = SessionState::Expired.as_str(),
                idle_secs = idle.as_secs(),
                "stream session expired"
            );
            false
        } else {
            true
        }
    });
    before - sessions.len()
}

fn record_reaped(reaped: usize) {
    if reaped > 0 {
        metrics::counter!(telemetry::STREAM_SESSIONS_REAPED_TOTAL).increment(reaped as u64);
    }
}

/// Owns one admitted session and closes it exactly once.
///
/// Dropping the guard without calling [`complete`](Self::complete) or
/// [`fail`](Self::fail) fails the session, so an aborted relay task never
/// leaves a slot occupied.
#[derive(Debug)]
pub struct SessionGuard {
    manager: Arc<SessionManager>,
    id: Uuid,
    closed: bool,
}

impl SessionGuard {
    pub fn new(manager: Arc<SessionManager>, id: Uuid) -> Self {
        Self {
            manager,
            id,
            closed: false,
        }
    }

    /// Admit a session and wrap it in a guard.
    pub fn admit(manager: &Arc<SessionManager>, function_id: &str) -> Result<Self> {
        let id = manager.admit(function_id)?;
        Ok(Self::new(Arc::clone(manager), id))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn touch(&self) -> bool {
        self.manager.touch(self.id)
    }

    pub fn is_live(&self) -> bool {
        self.manager.is_live(self.id)
    }

    pub fn complete(mut self) -> bool {
        self.closed = true;
        self.manager.complete(self.id)
    }

    pub fn fail(mut self) -> bool {
        self.closed = true;
        self.manager.fail(self.id)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.closed {
            self.manager.fail(self.id);
        }
    }
}
