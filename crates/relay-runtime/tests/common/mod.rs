//! In-memory backend shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_core::ids::{BackendSessionId, RequestToken};
use relay_core::protocol::{AgentEvent, EventEnvelope, ReviewDecision, SessionConfig};
use relay_runtime::{AgentBackend, BackendError, BackendResult, EventStream, Orchestrator};
use relay_settings::RelaySettings;
use tokio::sync::{Notify, mpsc};

/// A command the orchestrator sent to the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Start(BackendSessionId),
    Stop(BackendSessionId),
    Close(BackendSessionId),
    Send(BackendSessionId, String),
    Interrupt(BackendSessionId),
    ExecDecision(RequestToken, ReviewDecision),
    PatchDecision(RequestToken, ReviewDecision),
    ReversePatch(String, PathBuf),
    ListRunning,
}

/// Records every call and hands out one event channel per started session.
pub struct FakeBackend {
    calls: Mutex<Vec<Call>>,
    channels: Mutex<HashMap<BackendSessionId, mpsc::Sender<EventEnvelope>>>,
    failing_starts: Mutex<HashSet<BackendSessionId>>,
    fail_decisions: AtomicBool,
    reverse_patch_applies: AtomicBool,
    decision_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            channels: Mutex::new(HashMap::new()),
            failing_starts: Mutex::new(HashSet::new()),
            fail_decisions: AtomicBool::new(false),
            reverse_patch_applies: AtomicBool::new(true),
            decision_gate: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, f: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| f(c)).count()
    }

    pub fn fail_start_for(&self, raw_id: BackendSessionId) {
        let _ = self.failing_starts.lock().insert(raw_id);
    }

    pub fn set_fail_decisions(&self, fail: bool) {
        self.fail_decisions.store(fail, Ordering::SeqCst);
    }

    pub fn set_reverse_patch_applies(&self, applies: bool) {
        self.reverse_patch_applies.store(applies, Ordering::SeqCst);
    }

    /// Hold every later decision until the returned gate is notified.
    pub fn gate_decisions(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.decision_gate.lock() = Some(gate.clone());
        gate
    }

    /// Simulate a backend process dying without the orchestrator noticing.
    pub fn crash(&self, raw_id: &BackendSessionId) {
        let _ = self.channels.lock().remove(raw_id);
    }

    /// Push an event into a running session's channel.
    pub async fn emit(&self, raw_id: &BackendSessionId, event: AgentEvent) {
        let tx = self
            .channels
            .lock()
            .get(raw_id)
            .cloned()
            .unwrap_or_else(|| panic!("session {raw_id} has no channel"));
        tx.send(EventEnvelope::new(event)).await.unwrap();
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    async fn decision(&self, call: Call) -> BackendResult<()> {
        self.record(call);
        let gate = self.decision_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_decisions.load(Ordering::SeqCst) {
            return Err(BackendError::Rejected("decision refused".into()));
        }
        Ok(())
    }

    fn shutdown(&self, raw_id: &BackendSessionId) -> BackendResult<()> {
        match self.channels.lock().remove(raw_id) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotRunning(raw_id.clone())),
        }
    }
}

#[async_trait]
impl AgentBackend for FakeBackend {
    async fn start_session(
        &self,
        raw_id: &BackendSessionId,
        _config: &SessionConfig,
    ) -> BackendResult<EventStream> {
        self.record(Call::Start(raw_id.clone()));
        if self.failing_starts.lock().contains(raw_id) {
            return Err(BackendError::Launch("binary not found".into()));
        }
        let (tx, rx) = mpsc::channel(64);
        let _ = self.channels.lock().insert(raw_id.clone(), tx);
        Ok(rx)
    }

    async fn stop_session(&self, raw_id: &BackendSessionId) -> BackendResult<()> {
        self.record(Call::Stop(raw_id.clone()));
        self.shutdown(raw_id)
    }

    async fn close_session(&self, raw_id: &BackendSessionId) -> BackendResult<()> {
        self.record(Call::Close(raw_id.clone()));
        self.shutdown(raw_id)
    }

    async fn send_message(&self, raw_id: &BackendSessionId, text: &str) -> BackendResult<()> {
        self.record(Call::Send(raw_id.clone(), text.to_owned()));
        if self.channels.lock().contains_key(raw_id) {
            Ok(())
        } else {
            Err(BackendError::NotRunning(raw_id.clone()))
        }
    }

    async fn interrupt(&self, raw_id: &BackendSessionId) -> BackendResult<()> {
        self.record(Call::Interrupt(raw_id.clone()));
        Ok(())
    }

    async fn respond_exec_approval(
        &self,
        token: &RequestToken,
        decision: ReviewDecision,
    ) -> BackendResult<()> {
        self.decision(Call::ExecDecision(token.clone(), decision)).await
    }

    async fn respond_patch_approval(
        &self,
        token: &RequestToken,
        decision: ReviewDecision,
    ) -> BackendResult<()> {
        self.decision(Call::PatchDecision(token.clone(), decision)).await
    }

    async fn apply_reverse_patch(
        &self,
        unified_diff: &str,
        directory: &Path,
    ) -> BackendResult<bool> {
        self.record(Call::ReversePatch(
            unified_diff.to_owned(),
            directory.to_path_buf(),
        ));
        Ok(self.reverse_patch_applies.load(Ordering::SeqCst))
    }

    async fn list_running_sessions(&self) -> BackendResult<Vec<BackendSessionId>> {
        self.record(Call::ListRunning);
        Ok(self.channels.lock().keys().cloned().collect())
    }
}

/// Orchestrator over a fresh fake backend with a concurrency cap of `cap`.
pub fn orchestrator(cap: usize) -> (Orchestrator, Arc<FakeBackend>) {
    let backend = FakeBackend::new();
    let mut settings = RelaySettings::default();
    settings.sessions.max_concurrent = cap;
    (Orchestrator::new(backend.clone(), settings), backend)
}

pub fn config() -> SessionConfig {
    RelaySettings::default()
        .backend
        .session_config(Path::new("/work"))
}

/// Poll `condition` until it holds, letting router tasks run in between.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
