use std::sync::Arc;

use magister_llm::{
    CancelHandle, FragmentStreamHandle, GenerateRequest, HistoryMessage, Role as HistoryRole,
    StreamEventPayload, Transport,
};
use magister_storage::{ConversationId, Turn, TurnRole};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::events::{ChatEvent, ControllerInput, SendRejection, StreamEventMapped};
use super::state::{
    ConversationHandle, StreamSessionId, StreamTarget, TurnPhase, TurnTransition,
    TurnTransitionResult,
};
use super::store::ConversationStore;
use crate::backend::ConversationBackend;
use crate::i18n::Language;
use crate::reconcile::{DeleteTarget, ReconcileEvent, Reconciler};

/// Coordinates one user turn at a time against the transport and the reconciler.
///
/// Only the driver loop mutates it; transport workers and the reconciler talk back
/// through the inbox.
pub struct TurnController {
    transport: Arc<dyn Transport>,
    reconciler: Reconciler,
    inbox: mpsc::UnboundedSender<ControllerInput>,
    events: mpsc::UnboundedSender<ChatEvent>,
    language: Language,
    store: ConversationStore,
    phase: TurnPhase,
    active_conversation: ConversationHandle,
    active_id: Option<ConversationId>,
    /// Set while a selected conversation's turns are still being loaded.
    loading: Option<ConversationHandle>,
    next_conversation: u64,
    next_stream_session: u64,
    cancel: Option<CancelHandle>,
    pending_user_text: Option<String>,
}

impl TurnController {
    pub fn new(
        transport: Arc<dyn Transport>,
        reconciler: Reconciler,
        inbox: mpsc::UnboundedSender<ControllerInput>,
        events: mpsc::UnboundedSender<ChatEvent>,
        language: Language,
    ) -> Self {
        Self {
            transport,
            reconciler,
            inbox,
            events,
            language,
            store: ConversationStore::new(),
            phase: TurnPhase::Idle,
            active_conversation: ConversationHandle::new(1),
            active_id: None,
            loading: None,
            next_conversation: 2,
            next_stream_session: 1,
            cancel: None,
            pending_user_text: None,
        }
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn active_conversation(&self) -> ConversationHandle {
        self.active_conversation
    }

    pub fn active_id(&self) -> Option<ConversationId> {
        self.active_id
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn set_language(&mut self, language: Language) {
        self.language = language;
    }

    /// Starts a turn: the user turn and an empty in-flight placeholder are appended
    /// before any network work happens.
    pub fn send_message(&mut self, text: &str) -> Result<StreamTarget, SendRejection> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SendRejection::EmptyInput);
        }
        if self.loading.is_some() {
            return Err(SendRejection::Loading);
        }

        let target = StreamTarget::new(
            self.active_conversation,
            StreamSessionId::new(self.next_stream_session),
        );
        if self.transition(TurnTransition::Send(target)).is_err() {
            return Err(SendRejection::NotIdle { phase: self.phase });
        }
        // Reserve the next session id immediately so later sends never reuse a target.
        self.next_stream_session = self.next_stream_session.saturating_add(1);

        let history = self.history();
        let user_turn = Turn::user(text);
        let placeholder = Turn::assistant_placeholder();
        for turn in [user_turn, placeholder] {
            if self.store.append(turn.clone()).is_ok() {
                self.emit(ChatEvent::TurnAppended {
                    conversation: target.conversation,
                    turn,
                });
            }
        }
        self.pending_user_text = Some(text.to_string());
        self.mirror();

        let request = GenerateRequest::new(history, text).with_language(self.language.code());
        match self.transport.stream_generate(request) {
            Ok(handle) => self.spawn_stream_pipeline(target, handle),
            Err(error) => {
                tracing::warn!(
                    target = ?target,
                    transport = self.transport.name(),
                    error = %error,
                    "failed to start generation"
                );
                self.fail_turn(target);
            }
        }

        Ok(target)
    }

    /// Aborts the in-flight request and keeps whatever text already arrived.
    pub fn stop_streaming(&mut self) -> bool {
        let Some(target) = self.phase.active_target() else {
            return false;
        };

        if let Some(mut cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if self.transition(TurnTransition::Cancel(target)).is_err() {
            return false;
        }
        tracing::debug!(target = ?target, "turn cancelled");

        if let Ok(turn) = self.store.finalize_last() {
            let turn = turn.clone();
            self.emit(ChatEvent::TurnFinalized {
                conversation: target.conversation,
                turn,
            });
        }
        self.pending_user_text = None;
        self.mirror();
        let _ = self.transition(TurnTransition::Settle);
        true
    }

    /// Starts a fresh, not yet persisted conversation.
    pub fn new_conversation(&mut self) {
        self.stop_streaming();
        self.reset_active();
    }

    /// Switches to a stored conversation; its turns arrive once the reconciler loads them.
    pub fn select_conversation(&mut self, id: ConversationId) {
        self.stop_streaming();
        let handle = self.reset_active();
        self.loading = Some(handle);
        self.reconciler.open(handle, id);
    }

    pub fn delete_conversation(&mut self, id: ConversationId) {
        if self.active_id == Some(id) {
            self.stop_streaming();
            self.reconciler.delete(DeleteTarget::Id(id));
            self.reset_active();
        } else {
            self.reconciler.delete(DeleteTarget::Id(id));
        }
    }

    /// Drops the active conversation, persisted or not.
    pub fn delete_active_conversation(&mut self) {
        self.stop_streaming();
        self.reconciler
            .delete(DeleteTarget::Handle(self.active_conversation));
        self.reset_active();
    }

    /// Sets a user-chosen title on a stored conversation; blank titles are ignored.
    pub fn rename_conversation(&mut self, id: ConversationId, title: &str) -> bool {
        let title = title.trim();
        if title.is_empty() {
            return false;
        }
        self.reconciler.rename(id, title.to_string());
        true
    }

    pub fn clear_all(&mut self) {
        self.stop_streaming();
        self.reconciler.delete_all();
        self.reset_active();
    }

    pub fn list_conversations(&self) {
        self.reconciler.list();
    }

    pub fn handle_input(&mut self, input: ControllerInput) {
        match input {
            ControllerInput::Stream(event) => self.handle_stream_event(event),
            ControllerInput::StreamClosed(target) => self.handle_stream_closed(target),
            ControllerInput::Reconciled(event) => self.handle_reconcile_event(event),
        }
    }

    fn handle_stream_event(&mut self, event: StreamEventMapped) {
        let target = event.target;
        if !self.phase.accepts_stream_event(target) {
            // Late output of a cancelled or replaced request.
            tracing::trace!(target = ?target, "dropping stale stream event");
            return;
        }

        match event.payload {
            StreamEventPayload::Delta(delta) => self.apply_delta(target, delta),
            StreamEventPayload::Done => self.complete_turn(target),
            StreamEventPayload::UpstreamError(message) => {
                tracing::warn!(target = ?target, error = %message, "model backend reported an error");
                self.fail_turn(target);
            }
            StreamEventPayload::TransportError(message) => {
                tracing::warn!(target = ?target, error = %message, "transport failed");
                self.fail_turn(target);
            }
            StreamEventPayload::Cancelled => {
                self.stop_streaming();
            }
        }
    }

    fn handle_stream_closed(&mut self, target: StreamTarget) {
        if self.phase.accepts_stream_event(target) {
            tracing::warn!(target = ?target, "stream ended before a terminal event");
            self.fail_turn(target);
        }
    }

    fn apply_delta(&mut self, target: StreamTarget, delta: String) {
        if matches!(self.phase, TurnPhase::Sending(_)) {
            let _ = self.transition(TurnTransition::FirstFragment(target));
        }
        if delta.is_empty() {
            return;
        }

        if let Ok(turn) = self.store.update_last(&delta) {
            let turn_id = turn.id.clone();
            self.emit(ChatEvent::DeltaApplied {
                conversation: target.conversation,
                turn_id,
                delta,
            });
        }
    }

    fn complete_turn(&mut self, target: StreamTarget) {
        let has_text = self
            .store
            .in_flight()
            .is_some_and(|turn| !turn.content.trim().is_empty());
        if !has_text {
            tracing::warn!(target = ?target, "reply completed without any text");
            self.fail_turn(target);
            return;
        }

        if self.transition(TurnTransition::Complete(target)).is_err() {
            return;
        }
        self.cancel = None;

        let Ok(turn) = self.store.finalize_last() else {
            let _ = self.transition(TurnTransition::Settle);
            return;
        };
        let turn = turn.clone();
        let assistant_text = turn.content.clone();
        self.emit(ChatEvent::TurnFinalized {
            conversation: target.conversation,
            turn,
        });

        self.mirror();
        if let Some(user_text) = self.pending_user_text.take() {
            let first_user_text = self
                .store
                .get()
                .iter()
                .find(|turn| turn.is_user())
                .map(|turn| turn.content.clone())
                .unwrap_or_else(|| user_text.clone());
            self.reconciler.record_exchange(
                target.conversation,
                user_text,
                assistant_text,
                first_user_text,
            );
        }

        let _ = self.transition(TurnTransition::Settle);
    }

    fn fail_turn(&mut self, target: StreamTarget) {
        if self.transition(TurnTransition::Fail(target)).is_err() {
            return;
        }
        self.cancel = None;
        self.pending_user_text = None;

        if let Ok(turn) = self.store.fail_last(self.language.apology()) {
            let turn = turn.clone();
            self.emit(ChatEvent::TurnFinalized {
                conversation: target.conversation,
                turn,
            });
        }
        self.mirror();
    }

    fn handle_reconcile_event(&mut self, event: ReconcileEvent) {
        match event {
            ReconcileEvent::Created { conversation, id } => {
                if conversation == self.active_conversation {
                    self.active_id = Some(id);
                }
                self.emit(ChatEvent::ConversationCreated { conversation, id });
            }
            ReconcileEvent::Opened {
                conversation,
                loaded,
            } => {
                if self.loading != Some(conversation) {
                    return;
                }
                self.loading = None;
                self.active_id = Some(loaded.summary.id);
                self.store.replace(loaded.turns);
                self.emit(ChatEvent::TurnsReplaced {
                    conversation,
                    turns: self.store.get().to_vec(),
                });
                self.emit(ChatEvent::TitleChanged {
                    conversation: Some(conversation),
                    id: loaded.summary.id,
                    title: loaded.summary.title,
                });
            }
            ReconcileEvent::OpenFailed {
                conversation,
                message,
            } => {
                if self.loading == Some(conversation) {
                    self.loading = None;
                }
                self.emit(ChatEvent::Notice { message });
            }
            ReconcileEvent::TitleResolved {
                conversation,
                id,
                title,
            } => self.emit(ChatEvent::TitleChanged {
                conversation: Some(conversation),
                id,
                title,
            }),
            ReconcileEvent::Renamed { id, title } => self.emit(ChatEvent::TitleChanged {
                conversation: (self.active_id == Some(id)).then_some(self.active_conversation),
                id,
                title,
            }),
            ReconcileEvent::Listed { conversations } => {
                self.emit(ChatEvent::ConversationList { conversations })
            }
            ReconcileEvent::Deleted { id } => self.emit(ChatEvent::ConversationDeleted { id }),
            ReconcileEvent::Cleared => self.emit(ChatEvent::ConversationList {
                conversations: Vec::new(),
            }),
            ReconcileEvent::Failed { operation, message } => self.emit(ChatEvent::Notice {
                message: format!("{operation}: {message}"),
            }),
        }
    }

    fn spawn_stream_pipeline(&mut self, target: StreamTarget, handle: FragmentStreamHandle) {
        let FragmentStreamHandle { stream, worker } = handle;
        let (mut receiver, cancel) = stream.into_parts();
        tokio::spawn(worker);

        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            while let Some(payload) = receiver.recv().await {
                let event = StreamEventMapped { target, payload };
                if inbox.send(ControllerInput::Stream(event)).is_err() {
                    return;
                }
            }
            let _ = inbox.send(ControllerInput::StreamClosed(target));
        });

        self.cancel = Some(cancel);
    }

    /// Settled, non-empty turns in order; the new user text is sent separately.
    fn history(&self) -> Vec<HistoryMessage> {
        self.store
            .get()
            .iter()
            .filter(|turn| !turn.in_flight && !turn.content.trim().is_empty())
            .map(|turn| {
                let role = match turn.role {
                    TurnRole::User => HistoryRole::User,
                    TurnRole::Assistant => HistoryRole::Assistant,
                };
                HistoryMessage::new(role, turn.content.clone())
            })
            .collect()
    }

    fn mirror(&self) {
        self.reconciler
            .mirror(self.active_conversation, self.store.settled_turns());
    }

    fn reset_active(&mut self) -> ConversationHandle {
        let handle = ConversationHandle::new(self.next_conversation);
        self.next_conversation = self.next_conversation.saturating_add(1);

        self.reconciler.release(self.active_conversation);
        self.active_conversation = handle;
        self.active_id = None;
        self.loading = None;
        self.store.clear();
        self.emit(ChatEvent::TurnsReplaced {
            conversation: handle,
            turns: Vec::new(),
        });
        handle
    }

    fn transition(&mut self, transition: TurnTransition) -> TurnTransitionResult {
        let result = self.phase.apply(transition);
        match result {
            Ok(phase) => {
                self.phase = phase;
                self.emit(ChatEvent::PhaseChanged {
                    phase,
                    activity: phase.activity(),
                });
            }
            Err(rejection) => {
                tracing::debug!(transition = ?transition, rejection = ?rejection, "turn transition rejected");
            }
        }
        result
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }

    /// Drives the controller until the command channel closes.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ChatCommand>,
        mut inbox: mpsc::UnboundedReceiver<ControllerInput>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(input) = inbox.recv() => self.handle_input(input),
            }
        }

        self.stop_streaming();
        self.reconciler.flush().await;
        tracing::debug!("turn controller stopped");
    }

    fn handle_command(&mut self, command: ChatCommand) {
        match command {
            ChatCommand::Send(text) => {
                if let Err(rejection) = self.send_message(&text) {
                    self.emit(ChatEvent::SendRejected { rejection });
                }
            }
            ChatCommand::Stop => {
                self.stop_streaming();
            }
            ChatCommand::NewConversation => self.new_conversation(),
            ChatCommand::Select(id) => self.select_conversation(id),
            ChatCommand::Rename { id, title } => {
                if !self.rename_conversation(id, &title) {
                    tracing::debug!(id = %id, "ignoring blank title");
                }
            }
            ChatCommand::Delete(id) => self.delete_conversation(id),
            ChatCommand::DeleteActive => self.delete_active_conversation(),
            ChatCommand::ClearAll => self.clear_all(),
            ChatCommand::List => self.list_conversations(),
            ChatCommand::SetLanguage(language) => self.set_language(language),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Send(String),
    Stop,
    NewConversation,
    Select(ConversationId),
    Rename { id: ConversationId, title: String },
    Delete(ConversationId),
    DeleteActive,
    ClearAll,
    List,
    SetLanguage(Language),
}

/// Sending side of a running chat session.
#[derive(Clone)]
pub struct ChatHandle {
    commands: mpsc::UnboundedSender<ChatCommand>,
}

impl ChatHandle {
    pub fn send(&self, command: ChatCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn send_message(&self, text: impl Into<String>) -> bool {
        self.send(ChatCommand::Send(text.into()))
    }

    pub fn stop_streaming(&self) -> bool {
        self.send(ChatCommand::Stop)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub language: Language,
    pub title_max_chars: usize,
}

/// Spawns the reconciler and the controller driver loop.
///
/// Dropping every `ChatHandle` ends the session once pending persistence has finished.
pub fn spawn_session(
    transport: Arc<dyn Transport>,
    backend: ConversationBackend,
    options: SessionOptions,
    events: mpsc::UnboundedSender<ChatEvent>,
) -> (ChatHandle, JoinHandle<()>) {
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (reconciler, _reconcile_task) =
        Reconciler::spawn(backend, options.title_max_chars, inbox_tx.clone());

    let controller = TurnController::new(transport, reconciler, inbox_tx, events, options.language);
    let task = tokio::spawn(controller.run(commands_rx, inbox_rx));

    (
        ChatHandle {
            commands: commands_tx,
        },
        task,
    )
}
