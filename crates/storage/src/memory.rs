use std::collections::HashMap;

use snafu::OptionExt;
use tokio::sync::RwLock;

use super::error::{NotFoundSnafu, StorageResult};
use super::ids::GuestConversationId;
use super::types::{ConversationRecord, NewConversation, Turn};
use super::{BoxFuture, LocalStore, unix_timestamp_seconds};

struct StoredConversation {
    record: ConversationRecord,
    turns: Vec<Turn>,
}

/// Guest store that lives exactly as long as the process.
#[derive(Default)]
pub struct MemoryLocalStore {
    conversations: RwLock<HashMap<GuestConversationId, StoredConversation>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryLocalStore {
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let now = unix_timestamp_seconds();
            let record = ConversationRecord {
                id: GuestConversationId::new_v7(),
                title: input.title,
                group_ref: input.group_ref,
                created_at_unix_seconds: now,
                updated_at_unix_seconds: now,
            };

            self.conversations.write().await.insert(
                record.id,
                StoredConversation {
                    record: record.clone(),
                    turns: Vec::new(),
                },
            );
            Ok(record)
        })
    }

    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let conversations = self.conversations.read().await;
            let mut records = conversations
                .values()
                .map(|stored| stored.record.clone())
                .collect::<Vec<_>>();
            // Uuid v7 ids sort by creation time, which breaks same-second ties.
            records.sort_by(|left, right| {
                right
                    .updated_at_unix_seconds
                    .cmp(&left.updated_at_unix_seconds)
                    .then_with(|| right.id.cmp(&left.id))
            });
            Ok(records)
        })
    }

    fn get_conversation(
        &self,
        conversation_id: GuestConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>> {
        Box::pin(async move {
            Ok(self
                .conversations
                .read()
                .await
                .get(&conversation_id)
                .map(|stored| stored.record.clone()))
        })
    }

    fn rename_conversation(
        &self,
        conversation_id: GuestConversationId,
        title: String,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let mut conversations = self.conversations.write().await;
            let stored = conversations
                .get_mut(&conversation_id)
                .context(NotFoundSnafu {
                    stage: "memory-rename-conversation",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                })?;

            let title = title.trim();
            if !title.is_empty() {
                stored.record.title = title.to_string();
            }
            stored.record.updated_at_unix_seconds = unix_timestamp_seconds();
            Ok(stored.record.clone())
        })
    }

    fn delete_conversation(
        &self,
        conversation_id: GuestConversationId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.conversations
                .write()
                .await
                .remove(&conversation_id)
                .map(|_| ())
                .context(NotFoundSnafu {
                    stage: "memory-delete-conversation",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                })
        })
    }

    fn delete_all(&self) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.conversations.write().await.clear();
            Ok(())
        })
    }

    fn load_turns(
        &self,
        conversation_id: GuestConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<Turn>>> {
        Box::pin(async move {
            self.conversations
                .read()
                .await
                .get(&conversation_id)
                .map(|stored| stored.turns.clone())
                .context(NotFoundSnafu {
                    stage: "memory-load-turns",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                })
        })
    }

    fn save_turns(
        &self,
        conversation_id: GuestConversationId,
        turns: Vec<Turn>,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let mut conversations = self.conversations.write().await;
            let stored = conversations
                .get_mut(&conversation_id)
                .context(NotFoundSnafu {
                    stage: "memory-save-turns",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                })?;
            stored.turns = turns;
            stored.record.updated_at_unix_seconds = unix_timestamp_seconds();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageError;

    #[tokio::test]
    async fn saved_turns_replace_previous_mirror() {
        let store = MemoryLocalStore::new();
        let record = store
            .create_conversation(NewConversation::default())
            .await
            .expect("create conversation");
        assert!(record.has_default_title());

        store
            .save_turns(record.id, vec![Turn::user("första")])
            .await
            .expect("first save");
        store
            .save_turns(record.id, vec![Turn::user("första"), Turn::user("andra")])
            .await
            .expect("second save");

        let turns = store.load_turns(record.id).await.expect("load turns");
        let contents = turns.iter().map(|turn| turn.content.as_str()).collect::<Vec<_>>();
        assert_eq!(contents, vec!["första", "andra"]);
    }

    #[tokio::test]
    async fn rename_keeps_title_when_new_title_is_blank() {
        let store = MemoryLocalStore::new();
        let record = store
            .create_conversation(NewConversation::default())
            .await
            .expect("create conversation");

        let renamed = store
            .rename_conversation(record.id, "Loopar".to_string())
            .await
            .expect("rename");
        assert_eq!(renamed.title, "Loopar");

        let unchanged = store
            .rename_conversation(record.id, "   ".to_string())
            .await
            .expect("blank rename");
        assert_eq!(unchanged.title, "Loopar");
    }

    #[tokio::test]
    async fn missing_conversation_reports_not_found() {
        let store = MemoryLocalStore::new();
        let missing = GuestConversationId::new_v7();

        let error = store.save_turns(missing, Vec::new()).await.err();
        assert!(matches!(error, Some(StorageError::NotFound { .. })));

        store.delete_all().await.expect("delete all on empty store");
        assert!(store.list_conversations().await.expect("list").is_empty());
    }
}
