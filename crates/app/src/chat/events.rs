use magister_llm::StreamEventPayload;
use magister_storage::{ConversationId, Turn, TurnId};

use super::state::{Activity, ConversationHandle, StreamTarget, TurnPhase};
use crate::backend::ConversationSummary;
use crate::reconcile::ReconcileEvent;

/// Transport payload tagged with the request it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEventMapped {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

/// Everything that reaches the controller from background tasks.
#[derive(Debug)]
pub enum ControllerInput {
    Stream(StreamEventMapped),
    /// The forwarder for `target` has nothing more to deliver.
    StreamClosed(StreamTarget),
    Reconciled(ReconcileEvent),
}

/// Why `send_message` did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendRejection {
    EmptyInput,
    NotIdle { phase: TurnPhase },
    /// The selected conversation has not arrived yet.
    Loading,
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    TurnsReplaced {
        conversation: ConversationHandle,
        turns: Vec<Turn>,
    },
    TurnAppended {
        conversation: ConversationHandle,
        turn: Turn,
    },
    DeltaApplied {
        conversation: ConversationHandle,
        turn_id: TurnId,
        delta: String,
    },
    TurnFinalized {
        conversation: ConversationHandle,
        turn: Turn,
    },
    PhaseChanged {
        phase: TurnPhase,
        activity: Activity,
    },
    ConversationCreated {
        conversation: ConversationHandle,
        id: ConversationId,
    },
    TitleChanged {
        conversation: Option<ConversationHandle>,
        id: ConversationId,
        title: String,
    },
    ConversationDeleted {
        id: ConversationId,
    },
    ConversationList {
        conversations: Vec<ConversationSummary>,
    },
    SendRejected {
        rejection: SendRejection,
    },
    /// A backend operation failed; the UI keeps going.
    Notice {
        message: String,
    },
}
