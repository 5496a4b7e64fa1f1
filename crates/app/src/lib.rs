#![deny(unsafe_code)]

/// Conversation persistence: the remote chat API for signed-in users and the local
/// store for guests.
pub mod backend;
/// Turn lifecycle, the conversation store and the controller driver loop.
pub mod chat;
/// Terminal front end.
pub mod cli;
pub mod i18n;
/// Background worker that records exchanges, titles and conversation changes.
pub mod reconcile;
/// Settings persistence.
pub mod settings;

#[cfg(test)]
pub(crate) mod testing;
