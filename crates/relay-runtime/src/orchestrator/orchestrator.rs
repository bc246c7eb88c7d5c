//! Orchestrator: the entry point callers drive.
//!
//! Owns the session manager and the shared state, spawns one
//! [`EventRouter`] task per started session and turns backend failures into
//! conversation-visible state (system messages, cleared loading flags).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use relay_core::events::RelayEvent;
use relay_core::ids::{BackendSessionId, CallId, ConversationId, RequestToken, SessionId};
use relay_core::messages::{Conversation, ConversationMode, Message};
use relay_core::protocol::{ReviewDecision, SessionConfig};
use relay_settings::RelaySettings;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use crate::backend::AgentBackend;
use crate::errors::{Result, RuntimeError};
use crate::event_emitter::EventEmitter;
use crate::orchestrator::session_manager::{
    EnsureOutcome, ReconcileReport, RunningSession, SessionManager, StartedSession,
};
use crate::router::{EventRouter, RouterExit, RouterOptions};
use crate::state::approvals::{ApprovalCoordinator, ApprovalRequest, DecisionOutcome};
use crate::state::conversation_store::{ConversationStore, ConversationSummary};
use crate::state::turn_diff::{TurnDiffTracker, UndoOutcome};

/// Multi-session orchestrator.
pub struct Orchestrator {
    backend: Arc<dyn AgentBackend>,
    settings: RelaySettings,
    emitter: Arc<EventEmitter>,
    sessions: SessionManager,
    store: Arc<Mutex<ConversationStore>>,
    approvals: Arc<ApprovalCoordinator>,
    diffs: Arc<TurnDiffTracker>,
    /// Last launch configuration per conversation. Outlives the session so a
    /// message can relaunch it and undo knows the working directory.
    launch_configs: DashMap<ConversationId, SessionConfig>,
    /// Router task per running backend process.
    routers: DashMap<BackendSessionId, RouterTask>,
}

struct RouterTask {
    session_id: SessionId,
    handle: JoinHandle<RouterExit>,
}

impl Orchestrator {
    /// Orchestrator over `backend` with state sized from `settings`.
    pub fn new(backend: Arc<dyn AgentBackend>, settings: RelaySettings) -> Self {
        let emitter = Arc::new(EventEmitter::with_capacity(settings.router.event_buffer));
        let sessions = SessionManager::new(
            backend.clone(),
            emitter.clone(),
            settings.sessions.max_concurrent,
            settings.sessions.restart_settle(),
        );
        Self {
            store: Arc::new(Mutex::new(ConversationStore::new(emitter.clone()))),
            approvals: Arc::new(ApprovalCoordinator::new(backend.clone(), emitter.clone())),
            diffs: Arc::new(TurnDiffTracker::new(backend.clone(), emitter.clone())),
            backend,
            settings,
            emitter,
            sessions,
            launch_configs: DashMap::new(),
            routers: DashMap::new(),
        }
    }

    /// Settings the orchestrator was built with.
    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Notification emitter shared by every component.
    pub fn emitter(&self) -> &Arc<EventEmitter> {
        &self.emitter
    }

    /// Subscribe to state change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.emitter.subscribe()
    }

    /// Running-session bookkeeping.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Pending approval requests.
    pub fn approvals(&self) -> &Arc<ApprovalCoordinator> {
        &self.approvals
    }

    /// Per-conversation undo stacks.
    pub fn diffs(&self) -> &Arc<TurnDiffTracker> {
        &self.diffs
    }

    // ── Conversations ───────────────────────────────────────────────────

    /// Create an empty conversation backed by a fresh session id.
    pub fn create_conversation(&self, title: Option<String>) -> ConversationId {
        self.store.lock().create(None, title)
    }

    /// Create a conversation and start its session in `working_directory`
    /// with the configured backend defaults.
    pub async fn open_conversation(
        &self,
        working_directory: &Path,
        title: Option<String>,
    ) -> Result<ConversationId> {
        let conversation_id = self.create_conversation(title);
        let config = self.settings.backend.session_config(working_directory);
        self.ensure_session(&SessionId::from(&conversation_id), config)
            .await?;
        Ok(conversation_id)
    }

    /// Snapshot of one conversation.
    pub fn conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.store.lock().get(id)
    }

    /// Summaries of every conversation.
    pub fn list_conversations(&self) -> Vec<ConversationSummary> {
        self.store.lock().list()
    }

    /// Set a conversation's title.
    pub fn rename_conversation(&self, id: &ConversationId, title: impl Into<String>) -> Result<()> {
        self.store.lock().rename(id, title)
    }

    /// Pin or unpin a conversation.
    pub fn set_favorite(&self, id: &ConversationId, favorite: bool) -> Result<()> {
        self.store.lock().set_favorite(id, favorite)
    }

    /// Change a conversation's interaction mode.
    pub fn set_mode(&self, id: &ConversationId, mode: ConversationMode) -> Result<()> {
        self.store.lock().set_mode(id, mode)
    }

    /// Tear a conversation down: close its session, drop its pending
    /// approvals and diffs, then delete it. Returns false if it did not exist.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub async fn delete_conversation(&self, id: &ConversationId) -> bool {
        let session_id = SessionId::from(id);
        if let Some(session) = self.sessions.close(&session_id).await {
            self.session_ended(&session);
        }
        let _ = self.approvals.remove_for_conversation(id);
        let _ = self.diffs.clear(id);
        let _ = self.launch_configs.remove(id);
        self.store.lock().delete(id).is_some()
    }

    // ── Sessions ────────────────────────────────────────────────────────

    /// Make sure `session_id` runs with `config`, starting it (and evicting
    /// the oldest session at the cap) if needed.
    ///
    /// A start failure is also recorded in the conversation as a system
    /// message, and its loading flag is cleared.
    #[instrument(skip(self, config), fields(session_id = %session_id))]
    pub async fn ensure_session(&self, session_id: &SessionId, config: SessionConfig) -> Result<()> {
        let conversation_id = session_id.conversation_id();
        let _ = self.store.lock().ensure(&conversation_id);

        match self.sessions.ensure_running(session_id, &config).await {
            Ok(EnsureOutcome::AlreadyRunning) => {
                debug!("session already running, keeping its launch configuration");
                Ok(())
            }
            Ok(EnsureOutcome::Started(started)) => {
                let _ = self.launch_configs.insert(conversation_id, config);
                self.attach_router(session_id, started);
                Ok(())
            }
            Err(error) => {
                // Later sends retry the launch with this configuration.
                let _ = self.launch_configs.insert(conversation_id.clone(), config);
                self.prune_routers();
                self.record_failure(&conversation_id, "Failed to start session", &error);
                Err(error)
            }
        }
    }

    /// Append a user message and forward it to the conversation's session,
    /// relaunching the session from its last configuration if needed.
    #[instrument(skip(self, text), fields(conversation_id = %conversation_id))]
    pub async fn send_message(&self, conversation_id: &ConversationId, text: &str) -> Result<()> {
        let session_id = SessionId::from(conversation_id);
        if !self.store.lock().contains(conversation_id) {
            return Err(RuntimeError::ConversationNotFound(conversation_id.clone()));
        }
        let config = match self.launch_configs.get(conversation_id) {
            Some(config) => config.clone(),
            None => return Err(RuntimeError::SessionNotRunning(session_id)),
        };

        {
            let mut store = self.store.lock();
            let _ = store.append(conversation_id, Message::user(text))?;
            let _ = store.set_loading(conversation_id, true)?;
        }
        self.ensure_session(&session_id, config).await?;

        if let Err(source) = self.backend.send_message(&session_id.raw_id(), text).await {
            let error = RuntimeError::SendFailure {
                conversation_id: conversation_id.clone(),
                source,
            };
            self.record_failure(conversation_id, "Failed to send message", &error);
            return Err(error);
        }
        debug!("message forwarded");
        Ok(())
    }

    /// Ask the current turn to stop.
    ///
    /// Loading is cleared and any streaming message finalized right away;
    /// a backend failure is only logged.
    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    pub async fn interrupt(&self, conversation_id: &ConversationId) -> Result<()> {
        {
            let mut store = self.store.lock();
            let _ = store.finalize_streaming(conversation_id)?;
            let _ = store.set_loading(conversation_id, false)?;
        }
        let session_id = SessionId::from(conversation_id);
        if !self.sessions.is_running(&session_id) {
            return Ok(());
        }
        if let Err(error) = self.backend.interrupt(&session_id.raw_id()).await {
            warn!(%error, "interrupt not confirmed by backend");
        }
        Ok(())
    }

    /// Stop a session. Returns false if it was not running.
    pub async fn stop_session(&self, session_id: &SessionId) -> bool {
        match self.sessions.stop(session_id).await {
            Some(session) => {
                self.session_ended(&session);
                true
            }
            None => false,
        }
    }

    /// Close a session through the protocol-aware path.
    pub async fn close_session(&self, session_id: &SessionId) -> bool {
        match self.sessions.close(session_id).await {
            Some(session) => {
                self.session_ended(&session);
                true
            }
            None => false,
        }
    }

    /// Stop and relaunch a session with its last configuration.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn restart_session(&self, session_id: &SessionId) -> Result<()> {
        let conversation_id = session_id.conversation_id();
        let config = match self.launch_configs.get(&conversation_id) {
            Some(config) => config.clone(),
            None => return Err(RuntimeError::SessionNotRunning(session_id.clone())),
        };
        if let Some(previous) = self.sessions.get(session_id) {
            self.session_ended(&previous);
        }
        match self.sessions.restart(session_id, &config).await {
            Ok(started) => {
                self.attach_router(session_id, started);
                Ok(())
            }
            Err(error) => {
                self.prune_routers();
                self.record_failure(&conversation_id, "Failed to restart session", &error);
                Err(error)
            }
        }
    }

    /// Whether `session_id` is in the running set.
    pub fn is_running(&self, session_id: &SessionId) -> bool {
        self.sessions.is_running(session_id)
    }

    /// Running sessions in start order.
    pub fn running_sessions(&self) -> Vec<SessionId> {
        self.sessions.list_running()
    }

    // ── Approvals and undo ──────────────────────────────────────────────

    /// Submit a decision for a pending approval request.
    ///
    /// On success the request's placeholder message records the decision.
    pub async fn decide_approval(
        &self,
        call_id: &CallId,
        decision: ReviewDecision,
        token: &RequestToken,
    ) -> Result<DecisionOutcome> {
        let outcome = self.approvals.decide(call_id, decision, token).await?;
        if let DecisionOutcome::Submitted(request) = &outcome {
            let mut store = self.store.lock();
            if let Some(message_id) = store.find_approval(&request.conversation_id, call_id) {
                let _ = store.update_message(&request.conversation_id, &message_id, |message| {
                    message.content.push_str(&format!("\n{decision}"));
                });
            }
        }
        Ok(outcome)
    }

    /// Pending approvals in arrival order, optionally for one conversation.
    pub fn pending_approvals(&self, conversation_id: Option<&ConversationId>) -> Vec<ApprovalRequest> {
        self.approvals.pending(conversation_id)
    }

    /// Revert the conversation's most recent turn in its working directory.
    pub async fn undo_last_turn(&self, conversation_id: &ConversationId) -> Result<UndoOutcome> {
        let directory = self.working_directory(conversation_id)?;
        self.diffs.undo(conversation_id, &directory).await
    }

    // ── Housekeeping ────────────────────────────────────────────────────

    /// Align the running set with the backend and clean up after sessions
    /// the backend no longer runs.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let report = self.sessions.reconcile().await?;
        for session in &report.dropped {
            self.session_ended(session);
        }
        Ok(report)
    }

    /// Run [`reconcile`](Self::reconcile) every `reconcileIntervalMs` until
    /// `cancel` fires.
    pub fn spawn_reconcile_loop(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let period = self.settings.sessions.reconcile_interval();
        tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick completes immediately.
                let _ = interval.tick().await;
                loop {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(error) = this.reconcile().await {
                                warn!(%error, "reconcile failed");
                            }
                        }
                    }
                }
                debug!("reconcile loop stopped");
            }
            .instrument(info_span!("reconcile_loop")),
        )
    }

    /// Close every running session and wait for their routers to finish.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let running = self.sessions.list_running();
        info!(count = running.len(), "shutting down sessions");
        for session_id in running {
            let _ = self.close_session(&session_id).await;
        }
        let raw_ids: Vec<BackendSessionId> =
            self.routers.iter().map(|entry| entry.key().clone()).collect();
        for raw_id in raw_ids {
            if let Some((_, task)) = self.routers.remove(&raw_id) {
                task.handle.abort();
            }
        }
    }

    /// Directory of the running session, else of the last launch.
    fn working_directory(&self, conversation_id: &ConversationId) -> Result<PathBuf> {
        let session_id = SessionId::from(conversation_id);
        if let Some(running) = self.sessions.get(&session_id) {
            return Ok(running.config.working_directory);
        }
        self.launch_configs
            .get(conversation_id)
            .map(|config| config.working_directory.clone())
            .ok_or(RuntimeError::SessionNotRunning(session_id))
    }

    fn attach_router(&self, session_id: &SessionId, started: StartedSession) {
        for evicted in &started.evicted {
            self.session_ended(evicted);
        }
        let router = EventRouter::new(
            session_id.clone(),
            self.store.clone(),
            self.approvals.clone(),
            self.diffs.clone(),
            RouterOptions {
                surface_exec_output: self.settings.router.surface_exec_output,
            },
        );
        let span = info_span!("router", session_id = %session_id);
        let handle = tokio::spawn(router.run(started.events, started.cancel).instrument(span));
        let task = RouterTask {
            session_id: session_id.clone(),
            handle,
        };
        if let Some(previous) = self.routers.insert(session_id.raw_id(), task) {
            previous.handle.abort();
        }
    }

    /// Clean up after sessions that left the running set without passing
    /// through [`session_ended`](Self::session_ended), such as those evicted
    /// by a start that then failed.
    fn prune_routers(&self) {
        let gone: Vec<SessionId> = self
            .routers
            .iter()
            .filter(|entry| !self.sessions.is_running(&entry.session_id))
            .map(|entry| entry.session_id.clone())
            .collect();
        for session_id in gone {
            debug!(session_id = %session_id, "pruning router of stopped session");
            self.forget_session(&session_id);
        }
    }

    /// Local cleanup once a session left the running set. Its router was
    /// already cancelled by the session manager.
    fn session_ended(&self, session: &RunningSession) {
        self.forget_session(&session.id);
    }

    fn forget_session(&self, session_id: &SessionId) {
        let _ = self.routers.remove(&session_id.raw_id());
        let conversation_id = session_id.conversation_id();
        let _ = self.approvals.remove_for_conversation(&conversation_id);
        let mut store = self.store.lock();
        if store.contains(&conversation_id) {
            let _ = store.finalize_streaming(&conversation_id);
            let _ = store.set_loading(&conversation_id, false);
        }
    }

    fn record_failure(&self, conversation_id: &ConversationId, what: &str, error: &RuntimeError) {
        warn!(conversation_id = %conversation_id, %error, category = error.category(), "{what}");
        let mut store = self.store.lock();
        if !store.contains(conversation_id) {
            return;
        }
        let _ = store.finalize_streaming(conversation_id);
        let _ = store.append(conversation_id, Message::system(format!("{what}: {error}")));
        let _ = store.set_loading(conversation_id, false);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
