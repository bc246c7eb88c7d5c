//! # relay-runtime
//!
//! Orchestration engine for backend agent sessions.
//!
//! - **Session manager**: bounded set of running backend processes, eviction by start order
//! - **Event router**: one task per session applying its events in arrival order
//! - **Conversation store**: messages, streaming assembly, loading flags
//! - **Approval coordinator**: pending exec/patch requests keyed by call id
//! - **Turn diff tracker**: per-conversation diff stacks and undo
//! - **Orchestrator**: the façade tying them together
//!
//! ## Crate Position
//!
//! Depends on: relay-core, relay-settings.
//! The backend process itself sits behind [`backend::AgentBackend`].

#![deny(unsafe_code)]

pub mod backend;
pub mod errors;
pub mod event_emitter;
pub mod orchestrator;
pub mod router;
pub mod state;

pub use backend::{AgentBackend, BackendError, BackendResult, EventStream};
pub use errors::{Result, RuntimeError};
pub use event_emitter::EventEmitter;
pub use orchestrator::orchestrator::Orchestrator;
pub use orchestrator::session_manager::{
    EnsureOutcome, ReconcileReport, RunningSession, SessionManager, StartedSession,
};
pub use router::{EventRouter, RouteEffect, RouterExit, RouterOptions};
pub use state::approvals::{ApprovalCoordinator, ApprovalPayload, ApprovalRequest, DecisionOutcome};
pub use state::conversation_store::{Completion, ConversationStore, ConversationSummary};
pub use state::turn_diff::{TurnDiff, TurnDiffTracker, UndoOutcome};
