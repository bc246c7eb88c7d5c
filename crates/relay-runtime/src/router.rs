//! Event router: one per running session.
//!
//! Consumes the session's event channel and applies each event, in arrival
//! order, to the conversation store, the approval coordinator and the turn
//! diff tracker. [`EventRouter::handle`] is synchronous; nothing in the
//! routing path waits on the backend, so approval requests never block
//! later events.

use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;
use relay_core::ids::{BackendSessionId, CallId, ConversationId, MessageId, SessionId};
use relay_core::messages::{ActivityKind, ActivityStatus, Message};
use relay_core::protocol::{AgentEvent, EventEnvelope, FileChange, TurnAbortReason};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backend::EventStream;
use crate::errors::Result;
use crate::state::approvals::ApprovalCoordinator;
use crate::state::conversation_store::ConversationStore;
use crate::state::turn_diff::TurnDiffTracker;

/// Routing behaviour switches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouterOptions {
    /// Record exec output on activity markers instead of dropping it.
    pub surface_exec_output: bool,
}

/// What handling one event did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteEffect {
    /// Negotiated model and backend id were recorded.
    Configured,
    /// The loading flag was set to the given value.
    Loading(bool),
    /// A message was appended.
    Appended(MessageId),
    /// An existing message changed.
    Updated(MessageId),
    /// An approval request was registered.
    ApprovalRegistered(CallId),
    /// A turn diff was recorded; carries the new stack depth.
    DiffRecorded(usize),
    /// The turn ended early.
    Aborted(TurnAbortReason),
    /// A system error message was appended.
    Failed(MessageId),
    /// Nothing changed.
    Ignored,
}

/// Why [`EventRouter::run`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouterExit {
    /// The session's token was cancelled.
    Cancelled,
    /// The backend closed the event channel.
    ChannelClosed,
}

/// Applies one session's events to shared state.
pub struct EventRouter {
    session_id: SessionId,
    conversation_id: ConversationId,
    store: Arc<Mutex<ConversationStore>>,
    approvals: Arc<ApprovalCoordinator>,
    diffs: Arc<TurnDiffTracker>,
    options: RouterOptions,
    turn: u64,
    current_turn: Option<u64>,
}

impl EventRouter {
    /// Router for `session_id`'s events, writing into its conversation.
    pub fn new(
        session_id: SessionId,
        store: Arc<Mutex<ConversationStore>>,
        approvals: Arc<ApprovalCoordinator>,
        diffs: Arc<TurnDiffTracker>,
        options: RouterOptions,
    ) -> Self {
        let conversation_id = session_id.conversation_id();
        Self {
            session_id,
            conversation_id,
            store,
            approvals,
            diffs,
            options,
            turn: 0,
            current_turn: None,
        }
    }

    /// Conversation this router writes into.
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Number of turns this router has seen start.
    pub fn turn(&self) -> u64 {
        self.turn
    }

    /// Route events until the channel closes or `cancel` fires.
    ///
    /// When the backend closes the channel mid-turn, loading is cleared and
    /// any streaming message is finalized.
    pub async fn run(mut self, mut events: EventStream, cancel: CancellationToken) -> RouterExit {
        let exit = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break RouterExit::Cancelled,
                next = events.recv() => match next {
                    Some(envelope) => {
                        let _ = self.handle(envelope);
                    }
                    None => break RouterExit::ChannelClosed,
                },
            }
        };
        if exit == RouterExit::ChannelClosed {
            info!(session_id = %self.session_id, "event channel closed");
            self.close_turn();
        }
        exit
    }

    /// Apply one event.
    pub fn handle(&mut self, envelope: EventEnvelope) -> RouteEffect {
        let kind = envelope.msg.kind();
        trace!(conversation_id = %self.conversation_id, event = kind, "routing event");
        match self.apply(envelope.msg) {
            Ok(effect) => effect,
            Err(error) => {
                // Typically the conversation was deleted while its session ran.
                debug!(conversation_id = %self.conversation_id, event = kind, %error, "event dropped");
                RouteEffect::Ignored
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn apply(&mut self, event: AgentEvent) -> Result<RouteEffect> {
        let conv = self.conversation_id.clone();
        match event {
            AgentEvent::SessionConfigured { session_id, model } => {
                self.store.lock().record_session_configured(
                    &conv,
                    model,
                    BackendSessionId::from(session_id),
                )?;
                Ok(RouteEffect::Configured)
            }

            AgentEvent::TaskStarted => {
                self.turn += 1;
                self.current_turn = Some(self.diffs.begin_turn(&conv));
                let mut store = self.store.lock();
                store.set_last_abort(&conv, None)?;
                let _ = store.set_loading(&conv, true)?;
                Ok(RouteEffect::Loading(true))
            }

            AgentEvent::TaskComplete { .. } => {
                self.current_turn = None;
                let mut store = self.store.lock();
                let _ = store.finalize_streaming(&conv)?;
                let _ = store.set_loading(&conv, false)?;
                Ok(RouteEffect::Loading(false))
            }

            AgentEvent::AgentMessage { message } => {
                let completion = self.store.lock().complete_message(&conv, &message)?;
                Ok(RouteEffect::Appended(completion.message_id().clone()))
            }

            AgentEvent::AgentMessageDelta { delta } => {
                let id = self.store.lock().append_delta(&conv, &delta)?;
                Ok(RouteEffect::Updated(id))
            }

            event @ (AgentEvent::ExecApprovalRequest(_)
            | AgentEvent::ApplyPatchApprovalRequest(_)) => {
                if !self.store.lock().contains(&conv) {
                    return Ok(RouteEffect::Ignored);
                }
                let Some(request) = self.approvals.register(&conv, &event) else {
                    return Ok(RouteEffect::Ignored);
                };
                let mut store = self.store.lock();
                if store.find_approval(&conv, &request.call_id).is_none() {
                    let _ = store.append(
                        &conv,
                        Message::approval(request.call_id.clone(), request.payload.summary()),
                    )?;
                }
                Ok(RouteEffect::ApprovalRegistered(request.call_id))
            }

            AgentEvent::ExecCommandBegin {
                call_id, command, ..
            } => {
                let content = format!("$ {}", command.join(" "));
                self.begin_activity(&conv, call_id, ActivityKind::Exec, content)
            }

            AgentEvent::ExecCommandOutputDelta { call_id, chunk } => {
                if !self.options.surface_exec_output {
                    return Ok(RouteEffect::Ignored);
                }
                self.update_activity(&conv, &call_id, |message| {
                    message.content.push('\n');
                    message.content.push_str(chunk.trim_end_matches('\n'));
                })
            }

            AgentEvent::ExecCommandEnd {
                call_id,
                stdout,
                stderr,
                exit_code,
            } => {
                let surface = self.options.surface_exec_output;
                let status = if exit_code == 0 {
                    ActivityStatus::Succeeded
                } else {
                    ActivityStatus::Failed
                };
                self.update_activity(&conv, &call_id, |message| {
                    if let Some(activity) = message.activity.as_mut() {
                        activity.status = status;
                    }
                    if surface {
                        append_output(&mut message.content, &stdout, &stderr);
                    }
                    let _ = write!(message.content, "\n(exit {exit_code})");
                })
            }

            AgentEvent::PatchApplyBegin { call_id, changes, .. } => {
                let mut content = String::from("Applying patch");
                for (path, change) in &changes {
                    let verb = match change {
                        FileChange::Add { .. } => "add",
                        FileChange::Delete { .. } => "delete",
                        FileChange::Update { .. } => "update",
                    };
                    let _ = write!(content, "\n  {verb} {}", path.display());
                }
                self.begin_activity(&conv, call_id, ActivityKind::Patch, content)
            }

            AgentEvent::PatchApplyEnd {
                call_id,
                stdout,
                stderr,
                success,
            } => {
                let status = if success {
                    ActivityStatus::Succeeded
                } else {
                    ActivityStatus::Failed
                };
                self.update_activity(&conv, &call_id, |message| {
                    if let Some(activity) = message.activity.as_mut() {
                        activity.status = status;
                    }
                    append_output(&mut message.content, &stdout, &stderr);
                })
            }

            AgentEvent::TurnDiff { unified_diff } => {
                if !self.store.lock().contains(&conv) {
                    return Ok(RouteEffect::Ignored);
                }
                let depth = match self.current_turn {
                    Some(turn) => self.diffs.push_for_turn(&conv, turn, unified_diff),
                    None => self.diffs.push(&conv, unified_diff),
                };
                Ok(RouteEffect::DiffRecorded(depth))
            }

            AgentEvent::TurnAborted { reason } => {
                self.current_turn = None;
                info!(conversation_id = %conv, %reason, "turn aborted");
                let mut store = self.store.lock();
                let _ = store.finalize_streaming(&conv)?;
                store.set_last_abort(&conv, Some(reason))?;
                let _ = store.set_loading(&conv, false)?;
                Ok(RouteEffect::Aborted(reason))
            }

            AgentEvent::Error { message } => {
                self.current_turn = None;
                warn!(conversation_id = %conv, %message, "backend reported an error");
                let mut store = self.store.lock();
                let _ = store.finalize_streaming(&conv)?;
                let id = store.append(&conv, Message::system(format!("Error: {message}")))?;
                let _ = store.set_loading(&conv, false)?;
                Ok(RouteEffect::Failed(id))
            }

            AgentEvent::Unknown => Ok(RouteEffect::Ignored),
        }
    }

    fn begin_activity(
        &self,
        conv: &ConversationId,
        call_id: CallId,
        kind: ActivityKind,
        content: String,
    ) -> Result<RouteEffect> {
        let mut store = self.store.lock();
        if let Some(existing) = store.find_activity(conv, &call_id) {
            debug!(call_id = %call_id, "duplicate begin event");
            return Ok(RouteEffect::Updated(existing));
        }
        let id = store.append(conv, Message::activity(call_id, kind, content))?;
        Ok(RouteEffect::Appended(id))
    }

    fn update_activity(
        &self,
        conv: &ConversationId,
        call_id: &CallId,
        f: impl FnOnce(&mut Message),
    ) -> Result<RouteEffect> {
        let mut store = self.store.lock();
        let Some(id) = store.find_activity(conv, call_id) else {
            debug!(call_id = %call_id, "no begin event for call, ignoring");
            return Ok(RouteEffect::Ignored);
        };
        let _ = store.update_message(conv, &id, f)?;
        Ok(RouteEffect::Updated(id))
    }

    /// Clear turn state after the session went away.
    fn close_turn(&mut self) {
        self.current_turn = None;
        let mut store = self.store.lock();
        if !store.contains(&self.conversation_id) {
            return;
        }
        let _ = store.finalize_streaming(&self.conversation_id);
        let _ = store.set_loading(&self.conversation_id, false);
    }
}

fn append_output(content: &mut String, stdout: &str, stderr: &str) {
    for output in [stdout, stderr] {
        let output = output.trim_end();
        if !output.is_empty() {
            content.push('\n');
            content.push_str(output);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use assert_matches::assert_matches;
    use relay_core::ids::RequestToken;
    use relay_core::messages::Role;
    use relay_core::protocol::ExecApprovalRequest;
    use tokio::sync::mpsc;

    use super::*;
    use crate::backend::MockAgentBackend;
    use crate::event_emitter::EventEmitter;

    struct Harness {
        router: EventRouter,
        store: Arc<Mutex<ConversationStore>>,
        approvals: Arc<ApprovalCoordinator>,
        diffs: Arc<TurnDiffTracker>,
    }

    fn harness(options: RouterOptions) -> Harness {
        let emitter = Arc::new(EventEmitter::new());
        let backend = Arc::new(MockAgentBackend::new());
        let store = Arc::new(Mutex::new(ConversationStore::new(emitter.clone())));
        let approvals = Arc::new(ApprovalCoordinator::new(backend.clone(), emitter.clone()));
        let diffs = Arc::new(TurnDiffTracker::new(backend, emitter));
        let session = SessionId::persisted("c1");
        let _ = store.lock().ensure(&session.conversation_id());
        let router = EventRouter::new(
            session,
            store.clone(),
            approvals.clone(),
            diffs.clone(),
            options,
        );
        Harness {
            router,
            store,
            approvals,
            diffs,
        }
    }

    fn ev(msg: AgentEvent) -> EventEnvelope {
        EventEnvelope::new(msg)
    }

    fn delta(text: &str) -> EventEnvelope {
        ev(AgentEvent::AgentMessageDelta {
            delta: text.into(),
        })
    }

    impl Harness {
        fn conversation(&self) -> relay_core::messages::Conversation {
            self.store.lock().get(self.router.conversation_id()).unwrap()
        }
    }

    #[test]
    fn task_lifecycle_toggles_loading() {
        let mut h = harness(RouterOptions::default());
        assert_eq!(h.router.handle(ev(AgentEvent::TaskStarted)), RouteEffect::Loading(true));
        assert!(h.conversation().is_loading);
        assert_eq!(h.router.turn(), 1);
        assert_eq!(
            h.router.handle(ev(AgentEvent::TaskComplete { last_agent_message: None })),
            RouteEffect::Loading(false)
        );
        assert!(!h.conversation().is_loading);
    }

    #[test]
    fn deltas_then_complete_reconstruct_message() {
        let mut h = harness(RouterOptions::default());
        let _ = h.router.handle(ev(AgentEvent::TaskStarted));
        let _ = h.router.handle(delta("Hel"));
        let _ = h.router.handle(delta("lo"));
        assert!(h.conversation().messages[0].is_streaming);
        let _ = h.router.handle(ev(AgentEvent::TaskComplete { last_agent_message: None }));

        let conv = h.conversation();
        assert_eq!(conv.messages.len(), 1);
        assert_eq!(conv.messages[0].content, "Hello");
        assert!(!conv.messages[0].is_streaming);
    }

    #[test]
    fn session_configured_records_model() {
        let mut h = harness(RouterOptions::default());
        let effect = h.router.handle(ev(AgentEvent::SessionConfigured {
            session_id: "b-1".into(),
            model: "gpt-5-codex".into(),
        }));
        assert_eq!(effect, RouteEffect::Configured);
        let conv = h.conversation();
        assert_eq!(conv.model.as_deref(), Some("gpt-5-codex"));
        assert_eq!(conv.backend_session, Some(BackendSessionId::from("b-1")));
        assert!(conv.messages.is_empty());
    }

    #[test]
    fn approval_request_registers_and_appends_placeholder_once() {
        let mut h = harness(RouterOptions::default());
        let request = || {
            ev(AgentEvent::ExecApprovalRequest(ExecApprovalRequest {
                call_id: CallId::from("abc"),
                request_token: RequestToken::from("t1"),
                command: vec!["ls".into()],
                cwd: PathBuf::from("/work"),
                reason: None,
            }))
        };
        assert_eq!(
            h.router.handle(request()),
            RouteEffect::ApprovalRegistered(CallId::from("abc"))
        );
        let _ = h.router.handle(request());

        assert_eq!(h.approvals.len(), 1);
        let conv = h.conversation();
        assert_eq!(conv.messages.len(), 1);
        assert_eq!(conv.messages[0].role, Role::Approval);
        assert_eq!(conv.messages[0].approval_request, Some(CallId::from("abc")));
    }

    #[test]
    fn exec_output_dropped_by_default() {
        let mut h = harness(RouterOptions::default());
        let call = CallId::from("x1");
        let _ = h.router.handle(ev(AgentEvent::ExecCommandBegin {
            call_id: call.clone(),
            command: vec!["cargo".into(), "test".into()],
            cwd: PathBuf::from("/work"),
        }));
        assert_eq!(
            h.router.handle(ev(AgentEvent::ExecCommandOutputDelta {
                call_id: call.clone(),
                chunk: "running 3 tests".into(),
            })),
            RouteEffect::Ignored
        );
        let _ = h.router.handle(ev(AgentEvent::ExecCommandEnd {
            call_id: call,
            stdout: "ok".into(),
            stderr: String::new(),
            exit_code: 0,
        }));

        let marker = &h.conversation().messages[0];
        assert_eq!(marker.content, "$ cargo test\n(exit 0)");
        assert_eq!(marker.activity.as_ref().unwrap().status, ActivityStatus::Succeeded);
    }

    #[test]
    fn exec_output_surfaced_when_enabled() {
        let mut h = harness(RouterOptions {
            surface_exec_output: true,
        });
        let call = CallId::from("x1");
        let _ = h.router.handle(ev(AgentEvent::ExecCommandBegin {
            call_id: call.clone(),
            command: vec!["false".into()],
            cwd: PathBuf::from("/work"),
        }));
        let _ = h.router.handle(ev(AgentEvent::ExecCommandOutputDelta {
            call_id: call.clone(),
            chunk: "partial\n".into(),
        }));
        let _ = h.router.handle(ev(AgentEvent::ExecCommandEnd {
            call_id: call,
            stdout: String::new(),
            stderr: "boom".into(),
            exit_code: 1,
        }));

        let marker = &h.conversation().messages[0];
        assert_eq!(marker.content, "$ false\npartial\nboom\n(exit 1)");
        assert_eq!(marker.activity.as_ref().unwrap().status, ActivityStatus::Failed);
    }

    #[test]
    fn exec_end_without_begin_is_ignored() {
        let mut h = harness(RouterOptions::default());
        let effect = h.router.handle(ev(AgentEvent::ExecCommandEnd {
            call_id: CallId::from("orphan"),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        }));
        assert_eq!(effect, RouteEffect::Ignored);
        assert!(h.conversation().messages.is_empty());
    }

    #[test]
    fn patch_begin_end_pairing() {
        let mut h = harness(RouterOptions::default());
        let mut changes = BTreeMap::new();
        let _ = changes.insert(
            PathBuf::from("README.md"),
            FileChange::Add {
                content: "hi".into(),
            },
        );
        let call = CallId::from("p1");
        let _ = h.router.handle(ev(AgentEvent::PatchApplyBegin {
            call_id: call.clone(),
            auto_approved: true,
            changes,
        }));
        let _ = h.router.handle(ev(AgentEvent::PatchApplyEnd {
            call_id: call,
            stdout: "Success".into(),
            stderr: String::new(),
            success: true,
        }));

        let marker = &h.conversation().messages[0];
        assert_eq!(marker.content, "Applying patch\n  add README.md\nSuccess");
        assert_eq!(marker.activity.as_ref().unwrap().kind, ActivityKind::Patch);
        assert_eq!(marker.activity.as_ref().unwrap().status, ActivityStatus::Succeeded);
    }

    #[test]
    fn turn_diffs_coalesce_within_a_turn() {
        let mut h = harness(RouterOptions::default());
        let _ = h.router.handle(ev(AgentEvent::TaskStarted));
        let _ = h.router.handle(ev(AgentEvent::TurnDiff { unified_diff: "a".into() }));
        let _ = h.router.handle(ev(AgentEvent::TurnDiff { unified_diff: "ab".into() }));
        let _ = h.router.handle(ev(AgentEvent::TaskComplete { last_agent_message: None }));
        let _ = h.router.handle(ev(AgentEvent::TaskStarted));
        let effect = h.router.handle(ev(AgentEvent::TurnDiff { unified_diff: "c".into() }));

        assert_eq!(effect, RouteEffect::DiffRecorded(2));
        assert_eq!(h.diffs.diffs(h.router.conversation_id()), vec!["c", "ab"]);
    }

    #[test]
    fn turn_diff_outside_turn_stacks() {
        let mut h = harness(RouterOptions::default());
        let _ = h.router.handle(ev(AgentEvent::TurnDiff { unified_diff: "d1".into() }));
        let _ = h.router.handle(ev(AgentEvent::TurnDiff { unified_diff: "d2".into() }));
        assert_eq!(h.diffs.diffs(h.router.conversation_id()), vec!["d2", "d1"]);
    }

    #[test]
    fn turn_aborted_records_reason() {
        let mut h = harness(RouterOptions::default());
        let _ = h.router.handle(ev(AgentEvent::TaskStarted));
        let _ = h.router.handle(delta("partial"));
        let effect = h.router.handle(ev(AgentEvent::TurnAborted {
            reason: TurnAbortReason::Interrupted,
        }));

        assert_eq!(effect, RouteEffect::Aborted(TurnAbortReason::Interrupted));
        let conv = h.conversation();
        assert!(!conv.is_loading);
        assert_eq!(conv.last_abort, Some(TurnAbortReason::Interrupted));
        assert!(!conv.messages[0].is_streaming);
    }

    #[test]
    fn error_appends_system_message_and_clears_loading() {
        let mut h = harness(RouterOptions::default());
        let _ = h.router.handle(ev(AgentEvent::TaskStarted));
        let effect = h.router.handle(ev(AgentEvent::Error {
            message: "rate limited".into(),
        }));

        assert_matches!(effect, RouteEffect::Failed(_));
        let conv = h.conversation();
        assert!(!conv.is_loading);
        assert_eq!(conv.messages[0].role, Role::System);
        assert_eq!(conv.messages[0].content, "Error: rate limited");
    }

    #[test]
    fn unknown_event_is_ignored() {
        let mut h = harness(RouterOptions::default());
        assert_eq!(h.router.handle(ev(AgentEvent::Unknown)), RouteEffect::Ignored);
    }

    #[test]
    fn events_for_deleted_conversation_are_dropped() {
        let mut h = harness(RouterOptions::default());
        let conv = h.router.conversation_id().clone();
        let _ = h.store.lock().delete(&conv);
        assert_eq!(h.router.handle(delta("late")), RouteEffect::Ignored);
        assert_eq!(
            h.router.handle(ev(AgentEvent::TurnDiff { unified_diff: "x".into() })),
            RouteEffect::Ignored
        );
        let approval = ev(AgentEvent::ExecApprovalRequest(ExecApprovalRequest {
            call_id: CallId::from("late-call"),
            request_token: RequestToken::from("t9"),
            command: vec!["rm".into(), "-rf".into(), "build".into()],
            cwd: PathBuf::from("/work"),
            reason: None,
        }));
        assert_eq!(h.router.handle(approval), RouteEffect::Ignored);
        assert!(h.approvals.is_empty());
        assert_eq!(h.diffs.depth(&conv), 0);
    }

    #[tokio::test]
    async fn run_exits_on_channel_close_and_clears_loading() {
        let h = harness(RouterOptions::default());
        let store = h.store.clone();
        let conv = h.router.conversation_id().clone();
        let (tx, rx) = mpsc::channel(8);
        tx.send(ev(AgentEvent::TaskStarted)).await.unwrap();
        tx.send(delta("Hi")).await.unwrap();
        drop(tx);

        let exit = h.router.run(rx, CancellationToken::new()).await;
        assert_eq!(exit, RouterExit::ChannelClosed);
        let snapshot = store.lock().get(&conv).unwrap();
        assert!(!snapshot.is_loading);
        assert_eq!(snapshot.messages[0].content, "Hi");
        assert!(!snapshot.messages[0].is_streaming);
    }

    #[tokio::test]
    async fn run_exits_on_cancel() {
        let h = harness(RouterOptions::default());
        let (_tx, rx) = mpsc::channel::<EventEnvelope>(8);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(h.router.run(rx, cancel).await, RouterExit::Cancelled);
    }
}
