use std::sync::Arc;

use magister_storage::{
    ConversationId, ConversationRecord, GuestConversationId, LocalStore, NewConversation, Turn,
};
use snafu::{OptionExt, ResultExt};

use super::{
    BackendResult, ConversationNotFoundSnafu, ConversationSummary, LoadedConversation,
    StorageSnafu, derive_title,
};

impl From<ConversationRecord> for ConversationSummary {
    fn from(record: ConversationRecord) -> Self {
        Self {
            id: ConversationId::Guest(record.id),
            title: record.title,
            group_ref: record.group_ref,
        }
    }
}

/// Session-local persistence for anonymous users.
#[derive(Clone)]
pub struct GuestBackend {
    store: Arc<dyn LocalStore>,
}

impl GuestBackend {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    pub async fn create(&self) -> BackendResult<ConversationSummary> {
        let record = self
            .store
            .create_conversation(NewConversation::default())
            .await
            .context(StorageSnafu {
                stage: "guest-create-conversation",
            })?;
        Ok(record.into())
    }

    /// Overwrites the stored turns; callers pass settled turns only.
    pub async fn mirror(&self, id: GuestConversationId, turns: Vec<Turn>) -> BackendResult<()> {
        self.store
            .save_turns(id, turns)
            .await
            .context(StorageSnafu {
                stage: "guest-mirror-turns",
            })
    }

    pub async fn resolve_title(
        &self,
        id: GuestConversationId,
        first_user_text: &str,
        max_chars: usize,
    ) -> BackendResult<String> {
        self.rename(id, &derive_title(first_user_text, max_chars))
            .await
    }

    pub async fn rename(&self, id: GuestConversationId, title: &str) -> BackendResult<String> {
        let record = self
            .store
            .rename_conversation(id, title.to_string())
            .await
            .context(StorageSnafu {
                stage: "guest-rename-conversation",
            })?;
        Ok(record.title)
    }

    pub async fn open(&self, id: GuestConversationId) -> BackendResult<LoadedConversation> {
        let record = self
            .store
            .get_conversation(id)
            .await
            .context(StorageSnafu {
                stage: "guest-open-conversation",
            })?
            .context(ConversationNotFoundSnafu {
                stage: "guest-open-conversation",
                id: ConversationId::Guest(id),
            })?;
        let turns = self.store.load_turns(id).await.context(StorageSnafu {
            stage: "guest-load-turns",
        })?;

        Ok(LoadedConversation {
            summary: record.into(),
            turns,
        })
    }

    pub async fn list(&self) -> BackendResult<Vec<ConversationSummary>> {
        let records = self
            .store
            .list_conversations()
            .await
            .context(StorageSnafu {
                stage: "guest-list-conversations",
            })?;
        Ok(records.into_iter().map(ConversationSummary::from).collect())
    }

    pub async fn delete(&self, id: GuestConversationId) -> BackendResult<()> {
        self.store
            .delete_conversation(id)
            .await
            .context(StorageSnafu {
                stage: "guest-delete-conversation",
            })
    }

    pub async fn delete_all(&self) -> BackendResult<()> {
        self.store.delete_all().await.context(StorageSnafu {
            stage: "guest-delete-all",
        })
    }
}
