//! Approval coordinator: pending exec/patch requests keyed by call id.
//!
//! Decisions are submitted with the stored request token. An entry is taken
//! out of the map before the backend round trip, so two concurrent decisions
//! for the same call id produce at most one submission. If the backend
//! refuses the decision the entry is put back and the caller can retry,
//! unless the owning conversation was torn down during the round trip.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_core::events::RelayEvent;
use relay_core::ids::{CallId, ConversationId, RequestToken};
use relay_core::protocol::{AgentEvent, ApprovalKind, FileChange, ReviewDecision};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::backend::AgentBackend;
use crate::errors::{Result, RuntimeError};
use crate::event_emitter::EventEmitter;

/// What the agent wants to do.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApprovalPayload {
    /// Run a command.
    Exec {
        /// Command line, one argument per element.
        command: Vec<String>,
        /// Directory the command would run in.
        cwd: PathBuf,
        /// Why the agent wants to run it.
        reason: Option<String>,
    },
    /// Apply a patch.
    ApplyPatch {
        /// Changes keyed by path.
        changes: BTreeMap<PathBuf, FileChange>,
        /// Why the agent wants to apply them.
        reason: Option<String>,
        /// Root the agent asks write access for, if any.
        grant_root: Option<PathBuf>,
    },
}

impl ApprovalPayload {
    /// Exec or patch.
    pub fn kind(&self) -> ApprovalKind {
        match self {
            Self::Exec { .. } => ApprovalKind::Exec,
            Self::ApplyPatch { .. } => ApprovalKind::ApplyPatch,
        }
    }

    /// One-line description for the approval placeholder message.
    pub fn summary(&self) -> String {
        match self {
            Self::Exec { command, .. } => format!("Run `{}`?", command.join(" ")),
            Self::ApplyPatch { changes, .. } => match changes.len() {
                1 => format!(
                    "Apply changes to {}?",
                    changes.keys().next().map_or_else(String::new, |p| p.display().to_string())
                ),
                n => format!("Apply changes to {n} files?"),
            },
        }
    }
}

/// A request waiting for a human decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    /// Identifies the tool call; the map key.
    pub call_id: CallId,
    /// Opaque token the backend expects back with the decision.
    pub request_token: RequestToken,
    /// Conversation whose session raised the request.
    pub conversation_id: ConversationId,
    /// What is being asked for.
    pub payload: ApprovalPayload,
    /// When the request event was routed.
    pub received_at: DateTime<Utc>,
    #[serde(skip)]
    seq: u64,
}

impl ApprovalRequest {
    /// Exec or patch.
    pub fn kind(&self) -> ApprovalKind {
        self.payload.kind()
    }
}

/// Result of [`ApprovalCoordinator::decide`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecisionOutcome {
    /// The backend accepted the decision; the entry is gone.
    Submitted(ApprovalRequest),
    /// No matching entry (already decided, superseded or torn down).
    Ignored,
}

/// Tracks outstanding approval requests across all conversations.
pub struct ApprovalCoordinator {
    pending: DashMap<CallId, ApprovalRequest>,
    /// Bumped on every teardown of a conversation.
    teardowns: DashMap<ConversationId, u64>,
    backend: Arc<dyn AgentBackend>,
    emitter: Arc<EventEmitter>,
    next_seq: AtomicU64,
}

impl ApprovalCoordinator {
    /// Empty coordinator submitting decisions to `backend`.
    pub fn new(backend: Arc<dyn AgentBackend>, emitter: Arc<EventEmitter>) -> Self {
        Self {
            pending: DashMap::new(),
            teardowns: DashMap::new(),
            backend,
            emitter,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Store the request carried by an approval-request event.
    ///
    /// Returns `None` for any other event. A request with an already known
    /// call id replaces the stored one.
    pub fn register(
        &self,
        conversation_id: &ConversationId,
        event: &AgentEvent,
    ) -> Option<ApprovalRequest> {
        let (call_id, request_token, payload) = match event {
            AgentEvent::ExecApprovalRequest(req) => (
                req.call_id.clone(),
                req.request_token.clone(),
                ApprovalPayload::Exec {
                    command: req.command.clone(),
                    cwd: req.cwd.clone(),
                    reason: req.reason.clone(),
                },
            ),
            AgentEvent::ApplyPatchApprovalRequest(req) => (
                req.call_id.clone(),
                req.request_token.clone(),
                ApprovalPayload::ApplyPatch {
                    changes: req.changes.clone(),
                    reason: req.reason.clone(),
                    grant_root: req.grant_root.clone(),
                },
            ),
            _ => return None,
        };

        let request = ApprovalRequest {
            call_id: call_id.clone(),
            request_token,
            conversation_id: conversation_id.clone(),
            payload,
            received_at: Utc::now(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let kind = request.kind();
        if let Some(previous) = self.pending.insert(call_id.clone(), request.clone()) {
            warn!(
                call_id = %call_id,
                conversation_id = %previous.conversation_id,
                "duplicate approval request, replacing stored entry"
            );
        } else {
            info!(call_id = %call_id, conversation_id = %conversation_id, %kind, "approval requested");
        }
        let _ = self.emitter.emit(RelayEvent::ApprovalRequested {
            conversation_id: conversation_id.clone(),
            call_id,
            kind,
        });
        Some(request)
    }

    /// Submit a decision for `call_id`.
    ///
    /// A missing entry or a token that no longer matches the stored one is a
    /// no-op. `approved_for_session` is rejected for patch requests and the
    /// entry is kept.
    #[instrument(skip(self, token), fields(call_id = %call_id, %decision))]
    pub async fn decide(
        &self,
        call_id: &CallId,
        decision: ReviewDecision,
        token: &RequestToken,
    ) -> Result<DecisionOutcome> {
        let kind = {
            let Some(entry) = self.pending.get(call_id) else {
                debug!("no pending request, ignoring decision");
                return Ok(DecisionOutcome::Ignored);
            };
            if &entry.request_token != token {
                warn!("request token does not match pending request, ignoring decision");
                return Ok(DecisionOutcome::Ignored);
            }
            entry.kind()
        };
        if !decision.is_allowed_for(kind) {
            return Err(RuntimeError::InvalidDecision {
                call_id: call_id.clone(),
                decision,
                kind,
            });
        }

        let Some((_, request)) = self
            .pending
            .remove_if(call_id, |_, entry| &entry.request_token == token)
        else {
            debug!("request resolved concurrently, ignoring decision");
            return Ok(DecisionOutcome::Ignored);
        };
        let generation = self.teardown_generation(&request.conversation_id);

        let submitted = match kind {
            ApprovalKind::Exec => {
                self.backend
                    .respond_exec_approval(&request.request_token, decision)
                    .await
            }
            ApprovalKind::ApplyPatch => {
                self.backend
                    .respond_patch_approval(&request.request_token, decision)
                    .await
            }
        };

        match submitted {
            Ok(()) => {
                info!(conversation_id = %request.conversation_id, "approval decision submitted");
                let _ = self.emitter.emit(RelayEvent::ApprovalResolved {
                    conversation_id: request.conversation_id.clone(),
                    call_id: call_id.clone(),
                    decision,
                });
                Ok(DecisionOutcome::Submitted(request))
            }
            Err(source) => {
                if self.teardown_generation(&request.conversation_id) == generation {
                    warn!(error = %source, "backend refused approval decision, keeping request");
                    // A newer request with the same call id wins over the restored one.
                    let _ = self.pending.entry(call_id.clone()).or_insert(request);
                } else {
                    debug!(
                        error = %source,
                        conversation_id = %request.conversation_id,
                        "backend refused approval decision for a torn down conversation"
                    );
                }
                Err(RuntimeError::ApprovalSubmitFailure {
                    call_id: call_id.clone(),
                    source,
                })
            }
        }
    }

    /// Pending requests in arrival order, optionally for one conversation.
    pub fn pending(&self, conversation_id: Option<&ConversationId>) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> = self
            .pending
            .iter()
            .filter(|entry| conversation_id.is_none_or(|c| &entry.conversation_id == c))
            .map(|entry| entry.value().clone())
            .collect();
        requests.sort_by_key(|r| r.seq);
        requests
    }

    /// Pending request for `call_id`.
    pub fn get(&self, call_id: &CallId) -> Option<ApprovalRequest> {
        self.pending.get(call_id).map(|entry| entry.value().clone())
    }

    /// Whether `call_id` is still pending.
    pub fn contains(&self, call_id: &CallId) -> bool {
        self.pending.contains_key(call_id)
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Forget every request of a conversation being torn down.
    ///
    /// Decisions still in flight for the conversation are not restored if the
    /// backend refuses them.
    pub fn remove_for_conversation(&self, conversation_id: &ConversationId) -> usize {
        *self.teardowns.entry(conversation_id.clone()).or_insert(0) += 1;
        let before = self.pending.len();
        self.pending
            .retain(|_, request| &request.conversation_id != conversation_id);
        let removed = before.saturating_sub(self.pending.len());
        if removed > 0 {
            debug!(conversation_id = %conversation_id, removed, "dropped pending approvals");
        }
        removed
    }

    fn teardown_generation(&self, conversation_id: &ConversationId) -> u64 {
        self.teardowns.get(conversation_id).map_or(0, |g| *g)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use mockall::predicate::eq;
    use relay_core::logging::capture_logs;
    use relay_core::protocol::{ExecApprovalRequest, PatchApprovalRequest};

    use super::*;
    use crate::backend::{BackendError, MockAgentBackend};

    fn exec_event(call: &str, token: &str) -> AgentEvent {
        AgentEvent::ExecApprovalRequest(ExecApprovalRequest {
            call_id: CallId::from(call),
            request_token: RequestToken::from(token),
            command: vec!["rm".into(), "-rf".into(), "target".into()],
            cwd: PathBuf::from("/work"),
            reason: None,
        })
    }

    fn patch_event(call: &str, token: &str) -> AgentEvent {
        let mut changes = BTreeMap::new();
        let _ = changes.insert(
            PathBuf::from("src/lib.rs"),
            FileChange::Update {
                unified_diff: "@@".into(),
                move_path: None,
            },
        );
        AgentEvent::ApplyPatchApprovalRequest(PatchApprovalRequest {
            call_id: CallId::from(call),
            request_token: RequestToken::from(token),
            changes,
            reason: None,
            grant_root: None,
        })
    }

    fn coordinator(mock: MockAgentBackend) -> ApprovalCoordinator {
        ApprovalCoordinator::new(Arc::new(mock), Arc::new(EventEmitter::new()))
    }

    fn conv(id: &str) -> ConversationId {
        ConversationId::from(id)
    }

    #[test]
    fn non_approval_events_are_not_registered() {
        let coord = coordinator(MockAgentBackend::new());
        assert!(coord.register(&conv("c1"), &AgentEvent::TaskStarted).is_none());
        assert!(coord.is_empty());
    }

    #[test]
    fn register_stores_payload() {
        let coord = coordinator(MockAgentBackend::new());
        let request = coord.register(&conv("c1"), &exec_event("abc", "t1")).unwrap();
        assert_eq!(request.kind(), ApprovalKind::Exec);
        assert_eq!(request.payload.summary(), "Run `rm -rf target`?");
        assert!(coord.contains(&CallId::from("abc")));
    }

    #[tokio::test]
    async fn decide_twice_submits_once() {
        let mut mock = MockAgentBackend::new();
        let _ = mock
            .expect_respond_exec_approval()
            .with(eq(RequestToken::from("t1")), eq(ReviewDecision::Approved))
            .times(1)
            .returning(|_, _| Ok(()));
        let coord = coordinator(mock);
        let _ = coord.register(&conv("c1"), &exec_event("abc", "t1"));

        let call = CallId::from("abc");
        let token = RequestToken::from("t1");
        let first = coord.decide(&call, ReviewDecision::Approved, &token).await.unwrap();
        assert_matches!(first, DecisionOutcome::Submitted(req) if req.call_id == call);
        let second = coord.decide(&call, ReviewDecision::Approved, &token).await.unwrap();
        assert_eq!(second, DecisionOutcome::Ignored);
        assert!(coord.is_empty());
    }

    #[tokio::test]
    async fn decide_unknown_call_is_noop() {
        let coord = coordinator(MockAgentBackend::new());
        let outcome = coord
            .decide(&CallId::from("missing"), ReviewDecision::Denied, &RequestToken::from("t"))
            .await
            .unwrap();
        assert_eq!(outcome, DecisionOutcome::Ignored);
    }

    #[tokio::test]
    async fn stale_token_is_ignored() {
        let (logs, _guard) = capture_logs();
        let coord = coordinator(MockAgentBackend::new());
        let _ = coord.register(&conv("c1"), &exec_event("abc", "t2"));

        let outcome = coord
            .decide(&CallId::from("abc"), ReviewDecision::Approved, &RequestToken::from("t1"))
            .await
            .unwrap();
        assert_eq!(outcome, DecisionOutcome::Ignored);
        assert!(coord.contains(&CallId::from("abc")));
        assert!(logs.has_message("request token does not match"));
    }

    #[tokio::test]
    async fn session_scoped_approval_rejected_for_patches() {
        let coord = coordinator(MockAgentBackend::new());
        let _ = coord.register(&conv("c1"), &patch_event("p1", "t1"));

        let result = coord
            .decide(&CallId::from("p1"), ReviewDecision::ApprovedForSession, &RequestToken::from("t1"))
            .await;
        assert_matches!(result, Err(RuntimeError::InvalidDecision { kind: ApprovalKind::ApplyPatch, .. }));
        assert!(coord.contains(&CallId::from("p1")));
    }

    #[tokio::test]
    async fn patch_decision_uses_patch_path() {
        let mut mock = MockAgentBackend::new();
        let _ = mock.expect_respond_exec_approval().never();
        let _ = mock
            .expect_respond_patch_approval()
            .with(eq(RequestToken::from("t1")), eq(ReviewDecision::Denied))
            .times(1)
            .returning(|_, _| Ok(()));
        let coord = coordinator(mock);
        let _ = coord.register(&conv("c1"), &patch_event("p1", "t1"));

        let outcome = coord
            .decide(&CallId::from("p1"), ReviewDecision::Denied, &RequestToken::from("t1"))
            .await
            .unwrap();
        assert_matches!(outcome, DecisionOutcome::Submitted(_));
    }

    #[tokio::test]
    async fn failed_submission_keeps_entry_for_retry() {
        let mut mock = MockAgentBackend::new();
        let mut attempts = 0;
        let _ = mock
            .expect_respond_exec_approval()
            .times(2)
            .returning(move |_, _| {
                attempts += 1;
                if attempts == 1 {
                    Err(BackendError::Transport("pipe closed".into()))
                } else {
                    Ok(())
                }
            });
        let coord = coordinator(mock);
        let _ = coord.register(&conv("c1"), &exec_event("abc", "t1"));
        let call = CallId::from("abc");
        let token = RequestToken::from("t1");

        let first = coord.decide(&call, ReviewDecision::Abort, &token).await;
        assert_matches!(first, Err(RuntimeError::ApprovalSubmitFailure { .. }));
        assert!(coord.contains(&call));

        let retry = coord.decide(&call, ReviewDecision::Abort, &token).await.unwrap();
        assert_matches!(retry, DecisionOutcome::Submitted(_));
        assert!(!coord.contains(&call));
    }

    #[tokio::test]
    async fn refusal_after_teardown_is_not_restored() {
        use std::sync::{OnceLock, Weak};

        let slot: Arc<OnceLock<Weak<ApprovalCoordinator>>> = Arc::new(OnceLock::new());
        let mut mock = MockAgentBackend::new();
        let teardown = slot.clone();
        let _ = mock
            .expect_respond_exec_approval()
            .times(1)
            .returning(move |_, _| {
                // The conversation is deleted while the decision is in flight.
                if let Some(coord) = teardown.get().and_then(Weak::upgrade) {
                    let _ = coord.remove_for_conversation(&conv("c1"));
                }
                Err(BackendError::Transport("pipe closed".into()))
            });
        let coord = Arc::new(coordinator(mock));
        let _ = slot.set(Arc::downgrade(&coord));
        let _ = coord.register(&conv("c1"), &exec_event("abc", "t1"));

        let result = coord
            .decide(&CallId::from("abc"), ReviewDecision::Denied, &RequestToken::from("t1"))
            .await;
        assert_matches!(result, Err(RuntimeError::ApprovalSubmitFailure { .. }));
        assert!(coord.is_empty());
    }

    #[test]
    fn duplicate_call_id_replaces_entry() {
        let (logs, _guard) = capture_logs();
        let coord = coordinator(MockAgentBackend::new());
        let _ = coord.register(&conv("c1"), &exec_event("abc", "t1"));
        let _ = coord.register(&conv("c1"), &exec_event("abc", "t2"));

        assert_eq!(coord.len(), 1);
        assert_eq!(
            coord.get(&CallId::from("abc")).unwrap().request_token,
            RequestToken::from("t2")
        );
        assert!(logs.has_event(tracing::Level::WARN, "duplicate approval request"));
    }

    #[test]
    fn pending_filters_by_conversation_in_arrival_order() {
        let coord = coordinator(MockAgentBackend::new());
        let _ = coord.register(&conv("c1"), &exec_event("a", "t"));
        let _ = coord.register(&conv("c2"), &exec_event("b", "t"));
        let _ = coord.register(&conv("c1"), &patch_event("c", "t"));

        let all: Vec<_> = coord.pending(None).into_iter().map(|r| r.call_id).collect();
        assert_eq!(all, vec![CallId::from("a"), CallId::from("b"), CallId::from("c")]);

        let c1: Vec<_> = coord
            .pending(Some(&conv("c1")))
            .into_iter()
            .map(|r| r.call_id)
            .collect();
        assert_eq!(c1, vec![CallId::from("a"), CallId::from("c")]);
    }

    #[test]
    fn teardown_removes_only_that_conversation() {
        let coord = coordinator(MockAgentBackend::new());
        let _ = coord.register(&conv("c1"), &exec_event("a", "t"));
        let _ = coord.register(&conv("c2"), &exec_event("b", "t"));
        assert_eq!(coord.remove_for_conversation(&conv("c1")), 1);
        assert_eq!(coord.len(), 1);
        assert!(coord.contains(&CallId::from("b")));
    }

    #[test]
    fn request_serializes_for_observers() {
        let coord = coordinator(MockAgentBackend::new());
        let request = coord.register(&conv("c1"), &exec_event("abc", "t1")).unwrap();
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["callId"], "abc");
        assert_eq!(json["conversationId"], "c1");
        assert_eq!(json["payload"]["kind"], "exec");
        assert_eq!(json["payload"]["command"][0], "rm");
        assert!(json.get("seq").is_none());
    }
}
