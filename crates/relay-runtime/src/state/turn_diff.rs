//! Per-conversation stack of turn diffs, most recent first.
//!
//! Undo reads the top diff, asks the backend to reverse-apply it and only
//! pops it when the backend reports success. Undos are serialized so two
//! concurrent requests never revert the same diff twice.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_core::events::RelayEvent;
use relay_core::ids::ConversationId;
use tracing::{info, instrument, trace, warn};

use crate::backend::AgentBackend;
use crate::errors::{Result, RuntimeError};
use crate::event_emitter::EventEmitter;

/// Cumulative file changes of one turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnDiff {
    /// Unique per tracker; identifies the entry across replacements.
    pub id: u64,
    /// Cumulative diff of the turn.
    pub unified_diff: String,
    /// Turn the diff was recorded in, as handed out by
    /// [`TurnDiffTracker::begin_turn`], when known.
    pub turn: Option<u64>,
    /// When the diff arrived.
    pub recorded_at: DateTime<Utc>,
}

/// Result of a successful undo.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UndoOutcome {
    /// The diff that was reverted and popped.
    pub reverted: TurnDiff,
    /// Diffs left on the stack.
    pub remaining: usize,
}

/// Undo stacks for every conversation.
///
/// Stacks belong to the conversation, not the session: they survive stops,
/// evictions and relaunches and are only dropped by [`clear`](Self::clear).
pub struct TurnDiffTracker {
    stacks: Mutex<HashMap<ConversationId, VecDeque<TurnDiff>>>,
    undo_lock: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
    next_turn: AtomicU64,
    backend: Arc<dyn AgentBackend>,
    emitter: Arc<EventEmitter>,
}

impl TurnDiffTracker {
    /// Tracker reverting diffs through `backend`.
    pub fn new(backend: Arc<dyn AgentBackend>, emitter: Arc<EventEmitter>) -> Self {
        Self {
            stacks: Mutex::new(HashMap::new()),
            undo_lock: tokio::sync::Mutex::new(()),
            next_id: AtomicU64::new(1),
            next_turn: AtomicU64::new(1),
            backend,
            emitter,
        }
    }

    /// Allocate the identity of a new turn.
    ///
    /// Identities are unique across every session the tracker has seen, so a
    /// relaunched session never coalesces into a turn recorded before it.
    pub fn begin_turn(&self, conversation_id: &ConversationId) -> u64 {
        let turn = self.next_turn.fetch_add(1, Ordering::Relaxed);
        trace!(conversation_id = %conversation_id, turn, "turn started");
        turn
    }

    /// Push a diff on top of the conversation's stack. Returns the new depth.
    pub fn push(&self, conversation_id: &ConversationId, unified_diff: impl Into<String>) -> usize {
        let entry = self.entry(unified_diff.into(), None);
        let depth = {
            let mut stacks = self.stacks.lock();
            let stack = stacks.entry(conversation_id.clone()).or_default();
            stack.push_front(entry);
            stack.len()
        };
        self.emit_recorded(conversation_id, depth);
        depth
    }

    /// Record the cumulative diff of `turn`, an identity from
    /// [`begin_turn`](Self::begin_turn).
    ///
    /// If the top entry belongs to the same turn it is replaced, so one undo
    /// always reverts exactly one turn.
    pub fn push_for_turn(
        &self,
        conversation_id: &ConversationId,
        turn: u64,
        unified_diff: impl Into<String>,
    ) -> usize {
        let entry = self.entry(unified_diff.into(), Some(turn));
        let depth = {
            let mut stacks = self.stacks.lock();
            let stack = stacks.entry(conversation_id.clone()).or_default();
            if stack.front().is_some_and(|top| top.turn == Some(turn)) {
                let _ = stack.pop_front();
            }
            stack.push_front(entry);
            stack.len()
        };
        self.emit_recorded(conversation_id, depth);
        depth
    }

    /// Most recent diff, without removing it.
    pub fn latest(&self, conversation_id: &ConversationId) -> Option<TurnDiff> {
        self.stacks
            .lock()
            .get(conversation_id)
            .and_then(|stack| stack.front().cloned())
    }

    /// Remove and return the most recent diff.
    pub fn pop_latest(&self, conversation_id: &ConversationId) -> Option<TurnDiff> {
        let mut stacks = self.stacks.lock();
        let stack = stacks.get_mut(conversation_id)?;
        let popped = stack.pop_front();
        if stack.is_empty() {
            let _ = stacks.remove(conversation_id);
        }
        popped
    }

    /// Diff texts, most recent first.
    pub fn diffs(&self, conversation_id: &ConversationId) -> Vec<String> {
        self.stacks
            .lock()
            .get(conversation_id)
            .map(|stack| stack.iter().map(|d| d.unified_diff.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of diffs on the conversation's stack.
    pub fn depth(&self, conversation_id: &ConversationId) -> usize {
        self.stacks.lock().get(conversation_id).map_or(0, VecDeque::len)
    }

    /// Forget a conversation's diffs.
    pub fn clear(&self, conversation_id: &ConversationId) -> usize {
        self.stacks
            .lock()
            .remove(conversation_id)
            .map_or(0, |stack| stack.len())
    }

    /// Revert the most recent diff in `directory`.
    ///
    /// The diff is popped only when the backend reports success; a `false`
    /// result or a backend error leaves the stack as it was.
    #[instrument(skip(self, directory), fields(conversation_id = %conversation_id))]
    pub async fn undo(
        &self,
        conversation_id: &ConversationId,
        directory: &Path,
    ) -> Result<UndoOutcome> {
        let _guard = self.undo_lock.lock().await;
        let top = self
            .latest(conversation_id)
            .ok_or_else(|| RuntimeError::NothingToUndo(conversation_id.clone()))?;

        let applied = self
            .backend
            .apply_reverse_patch(&top.unified_diff, directory)
            .await;
        match applied {
            Ok(true) => {}
            Ok(false) => {
                warn!("reverse patch did not apply, keeping diff");
                return Err(RuntimeError::UndoFailure {
                    conversation_id: conversation_id.clone(),
                    reason: "reverse patch did not apply".into(),
                });
            }
            Err(error) => {
                warn!(%error, "reverse patch failed, keeping diff");
                return Err(RuntimeError::UndoFailure {
                    conversation_id: conversation_id.clone(),
                    reason: error.to_string(),
                });
            }
        }

        let remaining = self.remove_entry(conversation_id, top.id);
        info!(remaining, "turn reverted");
        let _ = self.emitter.emit(RelayEvent::UndoApplied {
            conversation_id: conversation_id.clone(),
            remaining,
        });
        Ok(UndoOutcome {
            reverted: top,
            remaining,
        })
    }

    /// Remove the entry with `id`, wherever it sits now. Returns the new depth.
    fn remove_entry(&self, conversation_id: &ConversationId, id: u64) -> usize {
        let mut stacks = self.stacks.lock();
        let Some(stack) = stacks.get_mut(conversation_id) else {
            return 0;
        };
        let before = stack.len();
        stack.retain(|d| d.id != id);
        if stack.len() == before {
            // Replaced by a newer diff of the same turn while the patch ran.
            warn!(diff_id = id, "reverted diff no longer on the stack");
        }
        let remaining = stack.len();
        if remaining == 0 {
            let _ = stacks.remove(conversation_id);
        }
        remaining
    }

    fn entry(&self, unified_diff: String, turn: Option<u64>) -> TurnDiff {
        TurnDiff {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            unified_diff,
            turn,
            recorded_at: Utc::now(),
        }
    }

    fn emit_recorded(&self, conversation_id: &ConversationId, depth: usize) {
        let _ = self.emitter.emit(RelayEvent::DiffRecorded {
            conversation_id: conversation_id.clone(),
            depth,
        });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
