//! Inbound agent events and outbound command shapes.
//!
//! Only the fields needed for routing and approval correlation are modelled.
//! Events arrive wrapped in an [`EventEnvelope`]:
//!
//! ```json
//! { "id": "sub-1", "msg": { "type": "agent_message_delta", "delta": "Hel" } }
//! ```
//!
//! Unknown `type` values deserialize to [`AgentEvent::Unknown`] so a newer
//! backend never breaks the router.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ids::{CallId, RequestToken};

// ─────────────────────────────────────────────────────────────────────────────
// Inbound events
// ─────────────────────────────────────────────────────────────────────────────

/// One event delivered on a session's event channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Submission id the event belongs to (opaque to the router).
    #[serde(default)]
    pub id: String,
    /// The event payload.
    pub msg: AgentEvent,
}

impl EventEnvelope {
    /// Wrap an event with an empty submission id.
    #[must_use]
    pub fn new(msg: AgentEvent) -> Self {
        Self {
            id: String::new(),
            msg,
        }
    }
}

/// Events emitted by the agent backend, tagged by `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// The backend acknowledged the session configuration.
    SessionConfigured {
        /// Backend-side session identifier.
        session_id: String,
        /// Negotiated model.
        model: String,
    },

    /// A turn started.
    TaskStarted,

    /// A turn finished.
    TaskComplete {
        /// Last agent message of the turn, if the backend reports it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_agent_message: Option<String>,
    },

    /// A complete agent message.
    AgentMessage {
        /// Message text.
        message: String,
    },

    /// Incremental fragment of a streaming agent message.
    AgentMessageDelta {
        /// Text fragment.
        delta: String,
    },

    /// The agent asks for permission to run a command.
    ExecApprovalRequest(ExecApprovalRequest),

    /// The agent asks for permission to apply a patch.
    ApplyPatchApprovalRequest(PatchApprovalRequest),

    /// A command started running.
    ExecCommandBegin {
        /// Pairs this event with its `ExecCommandEnd`.
        call_id: CallId,
        /// Command and arguments.
        command: Vec<String>,
        /// Working directory of the command.
        cwd: PathBuf,
    },

    /// Incremental output of a running command.
    ExecCommandOutputDelta {
        /// Pairs this chunk with its `ExecCommandBegin`.
        call_id: CallId,
        /// Output fragment.
        chunk: String,
    },

    /// A command finished.
    ExecCommandEnd {
        /// Pairs this event with its `ExecCommandBegin`.
        call_id: CallId,
        /// Captured stdout.
        #[serde(default)]
        stdout: String,
        /// Captured stderr.
        #[serde(default)]
        stderr: String,
        /// Exit code.
        exit_code: i32,
    },

    /// A patch is about to be applied.
    PatchApplyBegin {
        /// Pairs this event with its `PatchApplyEnd`.
        call_id: CallId,
        /// True when no approval was requested for this patch.
        #[serde(default)]
        auto_approved: bool,
        /// Proposed changes keyed by path.
        changes: BTreeMap<PathBuf, FileChange>,
    },

    /// A patch application finished.
    PatchApplyEnd {
        /// Pairs this event with its `PatchApplyBegin`.
        call_id: CallId,
        /// Captured stdout.
        #[serde(default)]
        stdout: String,
        /// Captured stderr.
        #[serde(default)]
        stderr: String,
        /// Whether the patch applied cleanly.
        success: bool,
    },

    /// Cumulative unified diff of the current turn.
    TurnDiff {
        /// Unified diff text.
        unified_diff: String,
    },

    /// The turn ended early.
    TurnAborted {
        /// Why the turn ended.
        reason: TurnAbortReason,
    },

    /// The backend reported an error for the current turn.
    Error {
        /// Error text.
        message: String,
    },

    /// Any event type the router does not know about.
    #[serde(other)]
    Unknown,
}

impl AgentEvent {
    /// Stable snake_case name of the event type, used in logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionConfigured { .. } => "session_configured",
            Self::TaskStarted => "task_started",
            Self::TaskComplete { .. } => "task_complete",
            Self::AgentMessage { .. } => "agent_message",
            Self::AgentMessageDelta { .. } => "agent_message_delta",
            Self::ExecApprovalRequest(_) => "exec_approval_request",
            Self::ApplyPatchApprovalRequest(_) => "apply_patch_approval_request",
            Self::ExecCommandBegin { .. } => "exec_command_begin",
            Self::ExecCommandOutputDelta { .. } => "exec_command_output_delta",
            Self::ExecCommandEnd { .. } => "exec_command_end",
            Self::PatchApplyBegin { .. } => "patch_apply_begin",
            Self::PatchApplyEnd { .. } => "patch_apply_end",
            Self::TurnDiff { .. } => "turn_diff",
            Self::TurnAborted { .. } => "turn_aborted",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }

    /// Whether this event closes the current turn.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::TaskComplete { .. } | Self::TurnAborted { .. } | Self::Error { .. }
        )
    }
}

/// Permission request for running a command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecApprovalRequest {
    /// Correlation key.
    pub call_id: CallId,
    /// Token to hand back with the decision.
    pub request_token: RequestToken,
    /// Command and arguments.
    pub command: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Why the agent wants to run it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Permission request for applying a patch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatchApprovalRequest {
    /// Correlation key.
    pub call_id: CallId,
    /// Token to hand back with the decision.
    pub request_token: RequestToken,
    /// Proposed changes keyed by path.
    pub changes: BTreeMap<PathBuf, FileChange>,
    /// Why the agent wants to apply it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Root the agent asks write access for, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant_root: Option<PathBuf>,
}

/// One file-level change proposed by a patch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileChange {
    /// New file.
    Add {
        /// File content.
        content: String,
    },
    /// Removed file.
    Delete {
        /// Previous content.
        #[serde(default)]
        content: String,
    },
    /// Modified (and possibly moved) file.
    Update {
        /// Unified diff of the change.
        unified_diff: String,
        /// Destination when the file is moved.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        move_path: Option<PathBuf>,
    },
}

/// Why a turn ended early.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnAbortReason {
    /// The user interrupted the turn.
    Interrupted,
    /// A new turn replaced this one.
    Replaced,
    /// A review session ended.
    ReviewEnded,
    /// Any other reason.
    #[serde(other)]
    Other,
}

impl fmt::Display for TurnAbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupted => write!(f, "interrupted"),
            Self::Replaced => write!(f, "replaced"),
            Self::ReviewEnded => write!(f, "review_ended"),
            Self::Other => write!(f, "other"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound commands
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of operation awaiting approval.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    /// Shell command execution.
    Exec,
    /// Patch application.
    ApplyPatch,
}

impl fmt::Display for ApprovalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exec => write!(f, "exec"),
            Self::ApplyPatch => write!(f, "apply_patch"),
        }
    }
}

/// A human decision on an approval request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Run this one request.
    Approved,
    /// Run this request and identical future ones for the rest of the
    /// session. Only valid for exec requests.
    ApprovedForSession,
    /// Do not run it; the agent continues with something else.
    Denied,
    /// Do not run it and stop the turn.
    Abort,
}

impl ReviewDecision {
    /// Whether the decision may be submitted for a request of `kind`.
    ///
    /// Session-scoped trust only applies to repeatable commands.
    #[must_use]
    pub fn is_allowed_for(self, kind: ApprovalKind) -> bool {
        !matches!(
            (self, kind),
            (Self::ApprovedForSession, ApprovalKind::ApplyPatch)
        )
    }
}

impl fmt::Display for ReviewDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::ApprovedForSession => write!(f, "approved_for_session"),
            Self::Denied => write!(f, "denied"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

/// When the backend escalates to the user for approval.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPolicy {
    /// Ask before anything not known to be safe.
    Untrusted,
    /// Ask only when a sandboxed command fails.
    OnFailure,
    /// Let the model decide when to ask.
    #[default]
    OnRequest,
    /// Never ask.
    Never,
}

/// Sandbox applied to commands the backend runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    /// Read-only file system access.
    ReadOnly,
    /// Writes allowed inside the workspace.
    #[default]
    WorkspaceWrite,
    /// No sandbox.
    DangerFullAccess,
}

/// Configuration used to launch a backend session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Working directory of the agent.
    pub working_directory: PathBuf,
    /// Model name.
    pub model: String,
    /// Model provider.
    pub provider: String,
    /// Whether to use a local open-source model server.
    #[serde(default)]
    pub use_oss: bool,
    /// Extra command-line arguments for the backend process.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_args: Vec<String>,
    /// Approval policy.
    #[serde(default)]
    pub approval_policy: ApprovalPolicy,
    /// Sandbox mode.
    #[serde(default)]
    pub sandbox_mode: SandboxMode,
    /// Provider credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("working_directory", &self.working_directory)
            .field("model", &self.model)
            .field("provider", &self.provider)
            .field("use_oss", &self.use_oss)
            .field("custom_args", &self.custom_args)
            .field("approval_policy", &self.approval_policy)
            .field("sandbox_mode", &self.sandbox_mode)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
