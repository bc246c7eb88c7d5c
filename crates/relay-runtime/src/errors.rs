//! Runtime error types.

use relay_core::ids::{CallId, ConversationId, SessionId};
use relay_core::protocol::{ApprovalKind, ReviewDecision};

use crate::backend::BackendError;

/// Errors surfaced by the orchestration engine.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The backend process would not launch. The session stays not-running.
    #[error("failed to start session {session_id}: {source}")]
    StartFailure {
        /// Session that failed to start.
        session_id: SessionId,
        /// Backend error.
        source: BackendError,
    },

    /// The backend did not confirm a stop or close. Local state is cleared anyway.
    #[error("failed to stop session {session_id}: {source}")]
    StopFailure {
        /// Session being stopped.
        session_id: SessionId,
        /// Backend error.
        source: BackendError,
    },

    /// A user message could not be delivered.
    #[error("failed to send message to {conversation_id}: {source}")]
    SendFailure {
        /// Conversation the message belongs to.
        conversation_id: ConversationId,
        /// Backend error.
        source: BackendError,
    },

    /// The backend did not accept an approval decision. The request stays pending.
    #[error("failed to submit decision for {call_id}: {source}")]
    ApprovalSubmitFailure {
        /// Request the decision was for.
        call_id: CallId,
        /// Backend error.
        source: BackendError,
    },

    /// Reverse-applying the latest turn diff failed. The diff stack is unchanged.
    #[error("undo failed for {conversation_id}: {reason}")]
    UndoFailure {
        /// Conversation being reverted.
        conversation_id: ConversationId,
        /// What went wrong.
        reason: String,
    },

    /// Listing running sessions on the backend failed.
    #[error("failed to reconcile sessions: {source}")]
    ReconcileFailure {
        /// Backend error.
        source: BackendError,
    },

    /// The decision is not valid for this kind of request.
    #[error("decision {decision} is not allowed for {kind} request {call_id}")]
    InvalidDecision {
        /// Request the decision was for.
        call_id: CallId,
        /// Rejected decision.
        decision: ReviewDecision,
        /// Kind of the pending request.
        kind: ApprovalKind,
    },

    /// No conversation with this id exists.
    #[error("conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    /// The session is not running and cannot be started implicitly.
    #[error("session not running: {0}")]
    SessionNotRunning(SessionId),

    /// The conversation has no recorded turn diff.
    #[error("nothing to undo in {0}")]
    NothingToUndo(ConversationId),
}

impl RuntimeError {
    /// Whether retrying the same operation can succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::StartFailure { .. }
            | Self::StopFailure { .. }
            | Self::SendFailure { .. }
            | Self::ApprovalSubmitFailure { .. }
            | Self::UndoFailure { .. }
            | Self::ReconcileFailure { .. } => true,
            Self::InvalidDecision { .. }
            | Self::ConversationNotFound(_)
            | Self::SessionNotRunning(_)
            | Self::NothingToUndo(_) => false,
        }
    }

    /// Stable category string for logs and notifications.
    pub fn category(&self) -> &'static str {
        match self {
            Self::StartFailure { .. } => "start_failure",
            Self::StopFailure { .. } => "stop_failure",
            Self::SendFailure { .. } => "send_failure",
            Self::ApprovalSubmitFailure { .. } => "approval_submit_failure",
            Self::UndoFailure { .. } => "undo_failure",
            Self::ReconcileFailure { .. } => "reconcile_failure",
            Self::InvalidDecision { .. } => "invalid_decision",
            Self::ConversationNotFound(_) => "conversation_not_found",
            Self::SessionNotRunning(_) => "session_not_running",
            Self::NothingToUndo(_) => "nothing_to_undo",
        }
    }
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
