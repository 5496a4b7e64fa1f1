pub mod controller;
pub mod events;
pub mod state;
pub mod store;

pub use controller::{ChatCommand, ChatHandle, SessionOptions, TurnController, spawn_session};
pub use events::{ChatEvent, ControllerInput, SendRejection, StreamEventMapped};
pub use state::{
    Activity, ConversationHandle, StreamSessionId, StreamTarget, TurnPhase, TurnTransition,
    TurnTransitionRejection,
};
pub use store::{ConversationStore, StoreRejection};
