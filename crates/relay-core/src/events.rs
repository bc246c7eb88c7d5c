//! Notifications broadcast to observers of orchestrator state.
//!
//! The presentation layer subscribes to these instead of polling the
//! conversation store. Payloads carry identifiers, not full copies; observers
//! fetch what they need.

use serde::{Deserialize, Serialize};

use crate::ids::{CallId, ConversationId, MessageId, SessionId};
use crate::protocol::{ApprovalKind, ReviewDecision};

/// A state change inside the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum RelayEvent {
    /// A conversation was added to the store.
    ConversationCreated {
        conversation_id: ConversationId,
    },
    /// A conversation and its state were removed.
    ConversationDeleted {
        conversation_id: ConversationId,
    },
    /// A message was appended to a conversation.
    MessageAppended {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    /// Message content or streaming state changed.
    MessageUpdated {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    /// A turn started or ended.
    LoadingChanged {
        conversation_id: ConversationId,
        is_loading: bool,
    },
    /// The agent is waiting for a decision.
    ApprovalRequested {
        conversation_id: ConversationId,
        call_id: CallId,
        kind: ApprovalKind,
    },
    /// A decision was accepted by the backend.
    ApprovalResolved {
        conversation_id: ConversationId,
        call_id: CallId,
        decision: ReviewDecision,
    },
    /// A backend process was launched.
    SessionStarted {
        session_id: SessionId,
    },
    /// A session left the running set.
    SessionStopped {
        session_id: SessionId,
    },
    /// Stopped to make room under the concurrency cap.
    SessionEvicted {
        session_id: SessionId,
    },
    /// A turn diff was recorded; `depth` is the new stack size.
    DiffRecorded {
        conversation_id: ConversationId,
        depth: usize,
    },
    /// The most recent turn diff was reverted.
    UndoApplied {
        conversation_id: ConversationId,
        remaining: usize,
    },
}

impl RelayEvent {
    /// Stable snake_case name, used in logs.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ConversationCreated { .. } => "conversation_created",
            Self::ConversationDeleted { .. } => "conversation_deleted",
            Self::MessageAppended { .. } => "message_appended",
            Self::MessageUpdated { .. } => "message_updated",
            Self::LoadingChanged { .. } => "loading_changed",
            Self::ApprovalRequested { .. } => "approval_requested",
            Self::ApprovalResolved { .. } => "approval_resolved",
            Self::SessionStarted { .. } => "session_started",
            Self::SessionStopped { .. } => "session_stopped",
            Self::SessionEvicted { .. } => "session_evicted",
            Self::DiffRecorded { .. } => "diff_recorded",
            Self::UndoApplied { .. } => "undo_applied",
        }
    }

    /// The conversation this event concerns, if any.
    #[must_use]
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::ConversationCreated { conversation_id }
            | Self::ConversationDeleted { conversation_id }
            | Self::MessageAppended { conversation_id, .. }
            | Self::MessageUpdated { conversation_id, .. }
            | Self::LoadingChanged { conversation_id, .. }
            | Self::ApprovalRequested { conversation_id, .. }
            | Self::ApprovalResolved { conversation_id, .. }
            | Self::DiffRecorded { conversation_id, .. }
            | Self::UndoApplied { conversation_id, .. } => Some(conversation_id),
            Self::SessionStarted { .. }
            | Self::SessionStopped { .. }
            | Self::SessionEvicted { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let event = RelayEvent::LoadingChanged {
            conversation_id: ConversationId::from("c1"),
            is_loading: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "loading_changed");
        assert_eq!(json["conversation_id"], "c1");
        assert_eq!(event.event_type(), "loading_changed");
    }

    #[test]
    fn session_events_have_no_conversation() {
        let event = RelayEvent::SessionEvicted {
            session_id: SessionId::persisted("s1"),
        };
        assert!(event.conversation_id().is_none());
        let event = RelayEvent::UndoApplied {
            conversation_id: ConversationId::from("c1"),
            remaining: 0,
        };
        assert_eq!(event.conversation_id().map(ConversationId::as_str), Some("c1"));
    }
}
