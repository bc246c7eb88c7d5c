//! Conversation and message data model.
//!
//! A [`Conversation`] outlives any backend session bound to it. Its messages
//! are append-only apart from the single streaming message that deltas are
//! assembled into; once a turn closes, content is immutable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{BackendSessionId, CallId, ConversationId, MessageId};
use crate::protocol::TurnAbortReason;

/// Maximum length of a title derived from the first user message.
pub const MAX_DERIVED_TITLE_CHARS: usize = 60;

/// Title given to conversations before any user message arrives.
pub const DEFAULT_TITLE: &str = "New conversation";

/// Author of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Typed by the human.
    User,
    /// Produced by the agent.
    Assistant,
    /// Produced by the orchestrator (errors, activity markers).
    System,
    /// Placeholder for a pending approval request.
    Approval,
}

/// Kind of backend activity a marker message tracks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// A shell command.
    Exec,
    /// A patch application.
    Patch,
}

/// Progress of a tracked activity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    /// Begin seen, end not yet.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error or non-zero exit code.
    Failed,
}

/// Back-reference from a marker message to a begin/end pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    /// Correlates begin and end events.
    pub call_id: CallId,
    /// What is running.
    pub kind: ActivityKind,
    /// Current status.
    pub status: ActivityStatus,
}

/// One rendered turn or event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Stable message id.
    pub id: MessageId,
    /// Author of the message.
    pub role: Role,
    /// Rendered text.
    pub content: String,
    /// When the message was created.
    pub timestamp: DateTime<Utc>,
    /// True only for the conversation's active delta assembly target.
    #[serde(default)]
    pub is_streaming: bool,
    /// Approval request this message stands for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_request: Option<CallId>,
    /// Activity this message tracks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<Activity>,
}

impl Message {
    /// Create a terminal (non-streaming) message.
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            is_streaming: false,
            approval_request: None,
            activity: None,
        }
    }

    /// Terminal user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Terminal assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Terminal system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Start a streaming assistant message from its first delta.
    #[must_use]
    pub fn streaming(first_delta: impl Into<String>) -> Self {
        Self {
            is_streaming: true,
            ..Self::new(Role::Assistant, first_delta)
        }
    }

    /// Placeholder for a pending approval request.
    #[must_use]
    pub fn approval(call_id: CallId, content: impl Into<String>) -> Self {
        Self {
            approval_request: Some(call_id),
            ..Self::new(Role::Approval, content)
        }
    }

    /// In-progress marker for an exec or patch activity.
    #[must_use]
    pub fn activity(call_id: CallId, kind: ActivityKind, content: impl Into<String>) -> Self {
        Self {
            activity: Some(Activity {
                call_id,
                kind,
                status: ActivityStatus::Running,
            }),
            ..Self::new(Role::System, content)
        }
    }
}

/// How the agent is allowed to act in a conversation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    /// Full agent: may run commands and edit files.
    #[default]
    Agent,
    /// Chat only.
    Chat,
}

/// The durable unit of chat history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Conversation id; equals the wire form of its session id.
    pub id: ConversationId,
    /// Display title.
    pub title: String,
    /// Messages in arrival order.
    pub messages: Vec<Message>,
    /// Interaction mode.
    #[serde(default)]
    pub mode: ConversationMode,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last change to the conversation or its messages.
    pub updated_at: DateTime<Utc>,
    /// Pinned by the user.
    #[serde(default)]
    pub is_favorite: bool,
    /// True while a turn is in progress.
    #[serde(default)]
    pub is_loading: bool,
    /// Model negotiated by the last `session_configured` event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Backend-side session id from the last `session_configured` event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_session: Option<BackendSessionId>,
    /// Reason the most recent turn was aborted, cleared when a turn starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_abort: Option<TurnAbortReason>,
    /// Set until a title is given explicitly or derived from a user message.
    #[serde(skip)]
    pub(crate) title_is_default: bool,
}

impl Conversation {
    /// Create an empty conversation. `None` uses [`DEFAULT_TITLE`] until the
    /// first user message arrives.
    #[must_use]
    pub fn new(id: ConversationId, title: Option<String>) -> Self {
        let now = Utc::now();
        let title_is_default = title.is_none();
        Self {
            id,
            title: title.unwrap_or_else(|| DEFAULT_TITLE.to_owned()),
            messages: Vec::new(),
            mode: ConversationMode::default(),
            created_at: now,
            updated_at: now,
            is_favorite: false,
            is_loading: false,
            model: None,
            backend_session: None,
            last_abort: None,
            title_is_default,
        }
    }

    /// Whether the title is still the placeholder.
    pub fn has_default_title(&self) -> bool {
        self.title_is_default
    }

    /// Replace the title; it is never derived again afterwards.
    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = title.into();
        self.title_is_default = false;
        self.touch();
    }

    /// Append a message, deriving the title from the first user message.
    pub fn push(&mut self, message: Message) {
        if self.title_is_default && message.role == Role::User {
            let derived = derive_title(&message.content);
            if !derived.is_empty() {
                self.title = derived;
                self.title_is_default = false;
            }
        }
        self.messages.push(message);
        self.touch();
    }

    /// The active streaming message, if any.
    pub fn streaming_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.is_streaming)
    }

    /// Mutable access to the active streaming message, if any.
    pub fn streaming_message_mut(&mut self) -> Option<&mut Message> {
        self.messages.iter_mut().rev().find(|m| m.is_streaming)
    }

    /// Message with `id`.
    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    /// Most recent message.
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Bump `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// First line of `content`, whitespace-trimmed and cut to
/// [`MAX_DERIVED_TITLE_CHARS`] characters.
pub fn derive_title(content: &str) -> String {
    let first_line = content.trim().lines().next().unwrap_or_default().trim();
    if first_line.chars().count() <= MAX_DERIVED_TITLE_CHARS {
        return first_line.to_owned();
    }
    let cut: String = first_line.chars().take(MAX_DERIVED_TITLE_CHARS).collect();
    cut.trim_end().to_owned()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
