//! Conversation store: all conversations and their messages.
//!
//! A plain state container; callers share it as
//! `Arc<parking_lot::Mutex<ConversationStore>>` and hold the lock only for
//! the duration of one mutation. Every mutation emits the matching
//! [`RelayEvent`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use relay_core::events::RelayEvent;
use relay_core::ids::{BackendSessionId, CallId, ConversationId, MessageId, SessionId};
use relay_core::messages::{Conversation, ConversationMode, Message};
use relay_core::protocol::TurnAbortReason;
use serde::Serialize;
use tracing::debug;

use crate::errors::{Result, RuntimeError};
use crate::event_emitter::EventEmitter;

/// Listing entry without the message bodies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    /// Conversation id.
    pub id: ConversationId,
    /// Display title.
    pub title: String,
    /// Interaction mode.
    pub mode: ConversationMode,
    /// Pinned by the user.
    pub is_favorite: bool,
    /// True while a turn is in progress.
    pub is_loading: bool,
    /// Number of messages.
    pub message_count: usize,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl From<&Conversation> for ConversationSummary {
    fn from(conv: &Conversation) -> Self {
        Self {
            id: conv.id.clone(),
            title: conv.title.clone(),
            mode: conv.mode,
            is_favorite: conv.is_favorite,
            is_loading: conv.is_loading,
            message_count: conv.messages.len(),
            updated_at: conv.updated_at,
        }
    }
}

/// Result of applying a full agent message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    /// The streamed content already matched; the streaming message was closed.
    Finalized(MessageId),
    /// A new terminal message was appended.
    Appended(MessageId),
}

impl Completion {
    /// Id of the completed message.
    pub fn message_id(&self) -> &MessageId {
        match self {
            Self::Finalized(id) | Self::Appended(id) => id,
        }
    }
}

/// Holds every conversation.
pub struct ConversationStore {
    conversations: HashMap<ConversationId, Conversation>,
    emitter: Arc<EventEmitter>,
}

impl ConversationStore {
    /// Empty store.
    pub fn new(emitter: Arc<EventEmitter>) -> Self {
        Self {
            conversations: HashMap::new(),
            emitter,
        }
    }

    // ── CRUD ────────────────────────────────────────────────────────────

    /// Create a conversation. Without an id, a fresh not-yet-persisted
    /// session id is allocated.
    pub fn create(&mut self, id: Option<ConversationId>, title: Option<String>) -> ConversationId {
        let id = id.unwrap_or_else(|| SessionId::new().conversation_id());
        if self.conversations.contains_key(&id) {
            return id;
        }
        let _ = self
            .conversations
            .insert(id.clone(), Conversation::new(id.clone(), title));
        debug!(conversation_id = %id, "conversation created");
        let _ = self.emitter.emit(RelayEvent::ConversationCreated {
            conversation_id: id.clone(),
        });
        id
    }

    /// Create the conversation if missing. Returns true when it was created.
    pub fn ensure(&mut self, id: &ConversationId) -> bool {
        if self.conversations.contains_key(id) {
            return false;
        }
        let _ = self.create(Some(id.clone()), None);
        true
    }

    /// Whether the conversation exists.
    pub fn contains(&self, id: &ConversationId) -> bool {
        self.conversations.contains_key(id)
    }

    /// Snapshot of one conversation.
    pub fn get(&self, id: &ConversationId) -> Option<Conversation> {
        self.conversations.get(id).cloned()
    }

    /// Borrow a conversation without cloning it.
    pub fn with<R>(&self, id: &ConversationId, f: impl FnOnce(&Conversation) -> R) -> Option<R> {
        self.conversations.get(id).map(f)
    }

    /// Favourites first, then most recently updated.
    pub fn list(&self) -> Vec<ConversationSummary> {
        let mut list: Vec<ConversationSummary> =
            self.conversations.values().map(ConversationSummary::from).collect();
        list.sort_by(|a, b| {
            b.is_favorite
                .cmp(&a.is_favorite)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        list
    }

    /// Number of conversations.
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Set an explicit title.
    pub fn rename(&mut self, id: &ConversationId, title: impl Into<String>) -> Result<()> {
        self.conversation_mut(id)?.set_title(title);
        Ok(())
    }

    /// Pin or unpin.
    pub fn set_favorite(&mut self, id: &ConversationId, favorite: bool) -> Result<()> {
        let conv = self.conversation_mut(id)?;
        conv.is_favorite = favorite;
        conv.touch();
        Ok(())
    }

    /// Change the interaction mode.
    pub fn set_mode(&mut self, id: &ConversationId, mode: ConversationMode) -> Result<()> {
        let conv = self.conversation_mut(id)?;
        conv.mode = mode;
        conv.touch();
        Ok(())
    }

    /// Remove a conversation. Only explicit deletes destroy conversations.
    pub fn delete(&mut self, id: &ConversationId) -> Option<Conversation> {
        let removed = self.conversations.remove(id)?;
        debug!(conversation_id = %id, "conversation deleted");
        let _ = self.emitter.emit(RelayEvent::ConversationDeleted {
            conversation_id: id.clone(),
        });
        Some(removed)
    }

    // ── Turn state ──────────────────────────────────────────────────────

    /// Set the loading flag. Returns true when it changed.
    pub fn set_loading(&mut self, id: &ConversationId, loading: bool) -> Result<bool> {
        let conv = self.conversation_mut(id)?;
        if conv.is_loading == loading {
            return Ok(false);
        }
        conv.is_loading = loading;
        let _ = self.emitter.emit(RelayEvent::LoadingChanged {
            conversation_id: id.clone(),
            is_loading: loading,
        });
        Ok(true)
    }

    /// Whether a turn is in progress.
    pub fn is_loading(&self, id: &ConversationId) -> bool {
        self.conversations.get(id).is_some_and(|c| c.is_loading)
    }

    /// Record what the backend negotiated for this conversation's session.
    pub fn record_session_configured(
        &mut self,
        id: &ConversationId,
        model: String,
        backend_session: BackendSessionId,
    ) -> Result<()> {
        let conv = self.conversation_mut(id)?;
        conv.model = Some(model);
        conv.backend_session = Some(backend_session);
        Ok(())
    }

    /// Record why the last turn ended early, or clear it.
    pub fn set_last_abort(
        &mut self,
        id: &ConversationId,
        reason: Option<TurnAbortReason>,
    ) -> Result<()> {
        self.conversation_mut(id)?.last_abort = reason;
        Ok(())
    }

    // ── Messages ────────────────────────────────────────────────────────

    /// Append a message.
    pub fn append(&mut self, id: &ConversationId, message: Message) -> Result<MessageId> {
        let message_id = message.id.clone();
        self.conversation_mut(id)?.push(message);
        self.emit_appended(id, &message_id);
        Ok(message_id)
    }

    /// Append `delta` to the active streaming message, or start one.
    pub fn append_delta(&mut self, id: &ConversationId, delta: &str) -> Result<MessageId> {
        let conv = self.conversation_mut(id)?;
        if let Some(active) = conv.streaming_message_mut() {
            active.content.push_str(delta);
            let message_id = active.id.clone();
            conv.touch();
            self.emit_updated(id, &message_id);
            return Ok(message_id);
        }
        self.append(id, Message::streaming(delta))
    }

    /// Close the active streaming message, if any.
    pub fn finalize_streaming(&mut self, id: &ConversationId) -> Result<Option<MessageId>> {
        let conv = self.conversation_mut(id)?;
        let Some(active) = conv.streaming_message_mut() else {
            return Ok(None);
        };
        active.is_streaming = false;
        let message_id = active.id.clone();
        conv.touch();
        self.emit_updated(id, &message_id);
        Ok(Some(message_id))
    }

    /// Apply a full agent message.
    ///
    /// Any active streaming message is closed first. When its content equals
    /// `text` the full message only confirms what was streamed and nothing is
    /// appended.
    pub fn complete_message(&mut self, id: &ConversationId, text: &str) -> Result<Completion> {
        let streamed = self.conversation_mut(id)?.streaming_message().map(|m| m.content == text);
        let finalized = self.finalize_streaming(id)?;
        match (streamed, finalized) {
            (Some(true), Some(message_id)) => Ok(Completion::Finalized(message_id)),
            _ => self
                .append(id, Message::assistant(text))
                .map(Completion::Appended),
        }
    }

    /// Mutate one message in place.
    pub fn update_message(
        &mut self,
        id: &ConversationId,
        message_id: &MessageId,
        f: impl FnOnce(&mut Message),
    ) -> Result<bool> {
        let conv = self.conversation_mut(id)?;
        let Some(message) = conv.messages.iter_mut().find(|m| &m.id == message_id) else {
            return Ok(false);
        };
        f(message);
        conv.touch();
        self.emit_updated(id, message_id);
        Ok(true)
    }

    /// Message tracking the activity `call_id`, if any.
    pub fn find_activity(&self, id: &ConversationId, call_id: &CallId) -> Option<MessageId> {
        self.conversations.get(id)?.messages.iter().rev().find_map(|m| {
            m.activity
                .as_ref()
                .filter(|a| &a.call_id == call_id)
                .map(|_| m.id.clone())
        })
    }

    /// Message standing for the approval request `call_id`, if any.
    pub fn find_approval(&self, id: &ConversationId, call_id: &CallId) -> Option<MessageId> {
        self.conversations
            .get(id)?
            .messages
            .iter()
            .rev()
            .find(|m| m.approval_request.as_ref() == Some(call_id))
            .map(|m| m.id.clone())
    }

    fn conversation_mut(&mut self, id: &ConversationId) -> Result<&mut Conversation> {
        self.conversations
            .get_mut(id)
            .ok_or_else(|| RuntimeError::ConversationNotFound(id.clone()))
    }

    fn emit_appended(&self, id: &ConversationId, message_id: &MessageId) {
        let _ = self.emitter.emit(RelayEvent::MessageAppended {
            conversation_id: id.clone(),
            message_id: message_id.clone(),
        });
    }

    fn emit_updated(&self, id: &ConversationId, message_id: &MessageId) {
        let _ = self.emitter.emit(RelayEvent::MessageUpdated {
            conversation_id: id.clone(),
            message_id: message_id.clone(),
        });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
