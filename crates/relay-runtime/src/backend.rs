//! Process-control interface to the backend agent.
//!
//! The backend owns the agent subprocesses and their transport. Everything
//! here addresses a process by its raw [`BackendSessionId`]; translating a
//! caller-facing [`relay_core::ids::SessionId`] happens in the session
//! manager.

use std::path::Path;

use async_trait::async_trait;
use relay_core::ids::{BackendSessionId, RequestToken};
use relay_core::protocol::{EventEnvelope, ReviewDecision, SessionConfig};
use thiserror::Error;
use tokio::sync::mpsc;

/// Events of one session, in emission order. Closed when the session ends.
pub type EventStream = mpsc::Receiver<EventEnvelope>;

/// Errors reported by the backend.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The process could not be launched.
    #[error("backend process failed to launch: {0}")]
    Launch(String),
    /// The command channel failed.
    #[error("backend transport error: {0}")]
    Transport(String),
    /// The backend refused the command.
    #[error("backend rejected the command: {0}")]
    Rejected(String),
    /// No process with this id is running.
    #[error("backend session not running: {0}")]
    NotRunning(BackendSessionId),
}

/// Result type for backend calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Commands the orchestrator sends to the backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Launch a session and return its event channel.
    async fn start_session(
        &self,
        raw_id: &BackendSessionId,
        config: &SessionConfig,
    ) -> BackendResult<EventStream>;

    /// Terminate a session's process.
    async fn stop_session(&self, raw_id: &BackendSessionId) -> BackendResult<()>;

    /// Protocol-level shutdown that ends the event channel cleanly.
    async fn close_session(&self, raw_id: &BackendSessionId) -> BackendResult<()>;

    /// Forward a user message.
    async fn send_message(&self, raw_id: &BackendSessionId, text: &str) -> BackendResult<()>;

    /// Ask the current turn to stop.
    async fn interrupt(&self, raw_id: &BackendSessionId) -> BackendResult<()>;

    /// Answer a command approval request identified by `token`.
    async fn respond_exec_approval(
        &self,
        token: &RequestToken,
        decision: ReviewDecision,
    ) -> BackendResult<()>;

    /// Answer a patch approval request identified by `token`.
    async fn respond_patch_approval(
        &self,
        token: &RequestToken,
        decision: ReviewDecision,
    ) -> BackendResult<()>;

    /// Apply `unified_diff` in reverse inside `directory`.
    ///
    /// `Ok(false)` means the patch did not apply; nothing was changed.
    async fn apply_reverse_patch(&self, unified_diff: &str, directory: &Path)
    -> BackendResult<bool>;

    /// Raw ids of every process the backend believes is running.
    async fn list_running_sessions(&self) -> BackendResult<Vec<BackendSessionId>>;
}
