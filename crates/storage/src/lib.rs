use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ConversationId, GuestConversationId, RemoteConversationId, TurnId};
pub use memory::MemoryLocalStore;
pub use sqlite::SqliteLocalStore;
pub use types::{
    ConversationRecord, DEFAULT_CONVERSATION_TITLE, GroupRef, NewConversation, Turn, TurnRole,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Session-scoped storage for guest conversations.
///
/// Implementations store finalized turns only; callers filter in-flight turns out before
/// saving, so a reload never resurrects a half-written reply.
pub trait LocalStore: Send + Sync {
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>>;
    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>>;
    fn get_conversation(
        &self,
        conversation_id: GuestConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>>;
    fn rename_conversation(
        &self,
        conversation_id: GuestConversationId,
        title: String,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>>;
    fn delete_conversation(
        &self,
        conversation_id: GuestConversationId,
    ) -> BoxFuture<'_, StorageResult<()>>;
    fn delete_all(&self) -> BoxFuture<'_, StorageResult<()>>;
    fn load_turns(
        &self,
        conversation_id: GuestConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<Turn>>>;
    fn save_turns(
        &self,
        conversation_id: GuestConversationId,
        turns: Vec<Turn>,
    ) -> BoxFuture<'_, StorageResult<()>>;
}

pub(crate) fn unix_timestamp_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}
