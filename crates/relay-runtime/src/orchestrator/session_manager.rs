//! Session manager: bounded set of running backend processes.
//!
//! Sessions are keyed by their raw backend id, so every start, stop and
//! close for one logical session targets the same process no matter how the
//! caller spelled the [`SessionId`]. At most `max_concurrent` sessions run at
//! once; starting another evicts the oldest-started one.
//!
//! Lifecycle operations are serialized by an async lock held across the
//! backend round trip. The table itself sits behind a sync lock that is
//! never held across an await.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_core::events::RelayEvent;
use relay_core::ids::{BackendSessionId, SessionId};
use relay_core::protocol::SessionConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::{AgentBackend, EventStream};
use crate::errors::{Result, RuntimeError};
use crate::event_emitter::EventEmitter;

/// A session the manager believes is running.
#[derive(Clone, Debug)]
pub struct RunningSession {
    /// Identifier the session was started with.
    pub id: SessionId,
    /// Identifier of the backend process.
    pub raw_id: BackendSessionId,
    /// Launch configuration.
    pub config: SessionConfig,
    /// When the backend confirmed the launch.
    pub started_at: DateTime<Utc>,
    /// Cancelled when the session leaves the running set.
    pub cancel: CancellationToken,
}

/// A freshly started session.
#[derive(Debug)]
pub struct StartedSession {
    /// The session's event channel.
    pub events: EventStream,
    /// Cancelled when the session is stopped, closed, evicted or dropped.
    pub cancel: CancellationToken,
    /// Sessions stopped to make room, oldest first.
    pub evicted: Vec<RunningSession>,
}

/// Result of [`SessionManager::ensure_running`].
#[derive(Debug)]
pub enum EnsureOutcome {
    /// The session was already running; nothing changed.
    AlreadyRunning,
    /// The session was started.
    Started(StartedSession),
}

/// Result of [`SessionManager::reconcile`].
#[derive(Clone, Debug, Default)]
pub struct ReconcileReport {
    /// Local sessions the backend no longer runs; removed locally.
    pub dropped: Vec<RunningSession>,
    /// Backend sessions this manager never started; left alone.
    pub unknown: Vec<BackendSessionId>,
}

#[derive(Default)]
struct SessionTable {
    /// Raw ids in start order.
    order: VecDeque<BackendSessionId>,
    sessions: HashMap<BackendSessionId, RunningSession>,
}

impl SessionTable {
    fn insert(&mut self, session: RunningSession) {
        self.order.push_back(session.raw_id.clone());
        let _ = self.sessions.insert(session.raw_id.clone(), session);
    }

    fn remove(&mut self, raw_id: &BackendSessionId) -> Option<RunningSession> {
        let session = self.sessions.remove(raw_id)?;
        self.order.retain(|id| id != raw_id);
        session.cancel.cancel();
        Some(session)
    }

    fn oldest(&self) -> Option<BackendSessionId> {
        self.order.front().cloned()
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}

/// Owner of the running-session set.
pub struct SessionManager {
    backend: Arc<dyn AgentBackend>,
    emitter: Arc<EventEmitter>,
    max_concurrent: usize,
    settle_delay: Duration,
    lifecycle: tokio::sync::Mutex<()>,
    table: Mutex<SessionTable>,
}

impl SessionManager {
    /// Create a manager. A cap of 0 is treated as 1.
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        emitter: Arc<EventEmitter>,
        max_concurrent: usize,
        settle_delay: Duration,
    ) -> Self {
        Self {
            backend,
            emitter,
            max_concurrent: max_concurrent.max(1),
            settle_delay,
            lifecycle: tokio::sync::Mutex::new(()),
            table: Mutex::new(SessionTable::default()),
        }
    }

    /// Maximum number of simultaneously running sessions.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Start `session_id` unless it is already running, evicting the
    /// oldest-started session when at the cap.
    #[instrument(skip(self, config), fields(session_id = %session_id))]
    pub async fn ensure_running(
        &self,
        session_id: &SessionId,
        config: &SessionConfig,
    ) -> Result<EnsureOutcome> {
        let _guard = self.lifecycle.lock().await;
        if self.is_running(session_id) {
            debug!("session already running");
            return Ok(EnsureOutcome::AlreadyRunning);
        }
        let started = self.start_locked(session_id, config).await?;
        Ok(EnsureOutcome::Started(started))
    }

    /// Terminate a session. Local state is cleared even if the backend fails.
    ///
    /// Returns the removed session, or `None` if it was not running.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn stop(&self, session_id: &SessionId) -> Option<RunningSession> {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked(session_id, ShutdownKind::Stop).await
    }

    /// Like [`stop`](Self::stop) but through the protocol-aware close path.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn close(&self, session_id: &SessionId) -> Option<RunningSession> {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked(session_id, ShutdownKind::Close).await
    }

    /// Stop, wait for the settle delay, then start again with `config`.
    #[instrument(skip(self, config), fields(session_id = %session_id))]
    pub async fn restart(
        &self,
        session_id: &SessionId,
        config: &SessionConfig,
    ) -> Result<StartedSession> {
        let _guard = self.lifecycle.lock().await;
        let _ = self.stop_locked(session_id, ShutdownKind::Stop).await;
        tokio::time::sleep(self.settle_delay).await;
        self.start_locked(session_id, config).await
    }

    /// Whether the process behind `session_id` is running.
    pub fn is_running(&self, session_id: &SessionId) -> bool {
        self.table.lock().sessions.contains_key(&session_id.raw_id())
    }

    /// Running sessions in start order.
    pub fn list_running(&self) -> Vec<SessionId> {
        let table = self.table.lock();
        table
            .order
            .iter()
            .filter_map(|raw| table.sessions.get(raw).map(|s| s.id.clone()))
            .collect()
    }

    /// Snapshot of one running session.
    pub fn get(&self, session_id: &SessionId) -> Option<RunningSession> {
        self.table.lock().sessions.get(&session_id.raw_id()).cloned()
    }

    /// Number of sessions counted against the concurrency cap.
    pub fn running_count(&self) -> usize {
        self.table.lock().len()
    }

    /// Align the local running set with the backend's.
    ///
    /// Local sessions the backend does not report are dropped (their tokens
    /// cancelled). Backend sessions unknown locally are only logged.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let _guard = self.lifecycle.lock().await;
        let remote = self
            .backend
            .list_running_sessions()
            .await
            .map_err(|source| RuntimeError::ReconcileFailure { source })?;

        let mut report = ReconcileReport::default();
        {
            let mut table = self.table.lock();
            let stale: Vec<BackendSessionId> = table
                .order
                .iter()
                .filter(|raw| !remote.contains(raw))
                .cloned()
                .collect();
            for raw in stale {
                if let Some(session) = table.remove(&raw) {
                    report.dropped.push(session);
                }
            }
            report.unknown = remote
                .into_iter()
                .filter(|raw| !table.sessions.contains_key(raw))
                .collect();
        }

        for session in &report.dropped {
            warn!(session_id = %session.id, "backend no longer runs session, dropping");
            let _ = self.emitter.emit(RelayEvent::SessionStopped {
                session_id: session.id.clone(),
            });
        }
        for raw in &report.unknown {
            info!(raw_id = %raw, "backend runs a session not tracked locally");
        }
        Ok(report)
    }

    async fn start_locked(
        &self,
        session_id: &SessionId,
        config: &SessionConfig,
    ) -> Result<StartedSession> {
        let mut evicted = Vec::new();
        while self.running_count() >= self.max_concurrent {
            let Some(oldest) = self.table.lock().oldest() else {
                break;
            };
            if let Some(session) = self.shutdown_raw(&oldest, ShutdownKind::Stop).await {
                info!(evicted = %session.id, "evicted oldest session to respect cap");
                let _ = self.emitter.emit(RelayEvent::SessionEvicted {
                    session_id: session.id.clone(),
                });
                evicted.push(session);
            }
        }

        let raw_id = session_id.raw_id();
        let events = self
            .backend
            .start_session(&raw_id, config)
            .await
            .map_err(|source| {
                warn!(error = %source, "session failed to start");
                RuntimeError::StartFailure {
                    session_id: session_id.clone(),
                    source,
                }
            })?;

        let cancel = CancellationToken::new();
        self.table.lock().insert(RunningSession {
            id: session_id.clone(),
            raw_id,
            config: config.clone(),
            started_at: Utc::now(),
            cancel: cancel.clone(),
        });
        info!(model = %config.model, "session started");
        let _ = self.emitter.emit(RelayEvent::SessionStarted {
            session_id: session_id.clone(),
        });

        Ok(StartedSession {
            events,
            cancel,
            evicted,
        })
    }

    async fn stop_locked(
        &self,
        session_id: &SessionId,
        kind: ShutdownKind,
    ) -> Option<RunningSession> {
        let session = self.shutdown_raw(&session_id.raw_id(), kind).await;
        if session.is_none() {
            debug!("session not running, nothing to stop");
        }
        session
    }

    /// Remove a session locally, then ask the backend to shut it down.
    async fn shutdown_raw(
        &self,
        raw_id: &BackendSessionId,
        kind: ShutdownKind,
    ) -> Option<RunningSession> {
        let session = self.table.lock().remove(raw_id)?;

        let result = match kind {
            ShutdownKind::Stop => self.backend.stop_session(raw_id).await,
            ShutdownKind::Close => self.backend.close_session(raw_id).await,
        };
        if let Err(source) = result {
            let error = RuntimeError::StopFailure {
                session_id: session.id.clone(),
                source,
            };
            warn!(session_id = %session.id, %error, "backend did not confirm shutdown");
        } else {
            info!(session_id = %session.id, kind = kind.as_str(), "session shut down");
        }
        let _ = self.emitter.emit(RelayEvent::SessionStopped {
            session_id: session.id.clone(),
        });
        Some(session)
    }
}

#[derive(Clone, Copy, Debug)]
enum ShutdownKind {
    Stop,
    Close,
}

impl ShutdownKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Close => "close",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
