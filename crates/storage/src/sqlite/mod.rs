use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteMigrateSnafu, SqliteQuerySnafu, StorageResult,
};
use super::ids::{GuestConversationId, TurnId};
use super::types::{ConversationRecord, GroupRef, NewConversation, Turn, TurnRole};
use super::{BoxFuture, LocalStore, unix_timestamp_seconds};

pub const IN_MEMORY_DATABASE: &str = ":memory:";

/// Guest store backed by SQLite.
///
/// `:memory:` keeps data for the lifetime of the process (the pool pins its single
/// connection); a file path keeps guest conversations across crashes of the front end.
#[derive(Debug, Clone)]
pub struct SqliteLocalStore {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteLocalStore {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let in_memory = database_url.contains(":memory:");
        let mut connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(5_000));
        if !in_memory {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }

        // One pinned connection: an in-memory database lives and dies with it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "opened guest conversation store");
        Ok(Self { pool, database_url })
    }

    pub async fn open_in_memory() -> StorageResult<Self> {
        Self::open(IN_MEMORY_DATABASE).await
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    async fn fetch_record(
        &self,
        conversation_id: GuestConversationId,
        stage: &'static str,
    ) -> StorageResult<Option<ConversationRecord>> {
        let row = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, title, group_ref, created_at, updated_at FROM guest_conversations WHERE id = ?",
        )
        .bind(conversation_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu { stage })?;

        row.map(conversation_row_to_record).transpose()
    }
}

impl LocalStore for SqliteLocalStore {
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let conversation_id = GuestConversationId::new_v7();
            let now = u64_to_i64(unix_timestamp_seconds(), "conversation-create-now")?;

            sqlx::query(
                "INSERT INTO guest_conversations (id, title, group_ref, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(conversation_id.to_string())
            .bind(input.title.clone())
            .bind(input.group_ref.map(|group| group.0))
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-create-insert",
            })?;

            Ok(ConversationRecord {
                id: conversation_id,
                title: input.title,
                group_ref: input.group_ref,
                created_at_unix_seconds: i64_to_u64(now, "conversation-create-created-at")?,
                updated_at_unix_seconds: i64_to_u64(now, "conversation-create-updated-at")?,
            })
        })
    }

    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, title, group_ref, created_at, updated_at FROM guest_conversations ORDER BY updated_at DESC, id DESC",
            )
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-list-query",
            })?;

            rows.into_iter().map(conversation_row_to_record).collect()
        })
    }

    fn get_conversation(
        &self,
        conversation_id: GuestConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>> {
        Box::pin(async move {
            self.fetch_record(conversation_id, "conversation-get-query")
                .await
        })
    }

    fn rename_conversation(
        &self,
        conversation_id: GuestConversationId,
        title: String,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let now = u64_to_i64(unix_timestamp_seconds(), "conversation-rename-now")?;
            let title = title.trim().to_string();
            let title = if title.is_empty() { None } else { Some(title) };

            let result = sqlx::query(
                "UPDATE guest_conversations SET title = COALESCE(?, title), updated_at = ? WHERE id = ?",
            )
            .bind(title)
            .bind(now)
            .bind(conversation_id.to_string())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-rename-apply",
            })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "conversation-rename-missing",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }

            self.fetch_record(conversation_id, "conversation-rename-load")
                .await?
                .context(NotFoundSnafu {
                    stage: "conversation-rename-load-missing",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                })
        })
    }

    fn delete_conversation(
        &self,
        conversation_id: GuestConversationId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM guest_conversations WHERE id = ?")
                .bind(conversation_id.to_string())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-delete-apply",
                })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "conversation-delete-missing",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }
            Ok(())
        })
    }

    fn delete_all(&self) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM guest_conversations")
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-delete-all",
                })?;
            Ok(())
        })
    }

    fn load_turns(
        &self,
        conversation_id: GuestConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<Turn>>> {
        Box::pin(async move {
            if self
                .fetch_record(conversation_id, "turns-load-conversation")
                .await?
                .is_none()
            {
                return NotFoundSnafu {
                    stage: "turns-load-missing",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }

            let rows = sqlx::query_as::<_, TurnRow>(
                "SELECT turn_id, role, content FROM guest_turns WHERE conversation_id = ? ORDER BY seq ASC",
            )
            .bind(conversation_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "turns-load-query",
            })?;

            rows.into_iter().map(turn_row_to_turn).collect()
        })
    }

    fn save_turns(
        &self,
        conversation_id: GuestConversationId,
        turns: Vec<Turn>,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let now = u64_to_i64(unix_timestamp_seconds(), "turns-save-now")?;
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "turns-save-begin",
            })?;

            let touched = sqlx::query("UPDATE guest_conversations SET updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(conversation_id.to_string())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "turns-save-touch-conversation",
                })?;
            if touched.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "turns-save-missing",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }

            // The mirror is a full snapshot, so the previous rows are replaced wholesale.
            sqlx::query("DELETE FROM guest_turns WHERE conversation_id = ?")
                .bind(conversation_id.to_string())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "turns-save-clear",
                })?;

            for (seq, turn) in turns.iter().enumerate() {
                let seq = u64_to_i64(seq as u64, "turns-save-seq")?;
                sqlx::query(
                    "INSERT INTO guest_turns (conversation_id, seq, turn_id, role, content) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(conversation_id.to_string())
                .bind(seq)
                .bind(turn.id.as_str())
                .bind(turn.role.as_str())
                .bind(turn.content.as_str())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "turns-save-insert",
                })?;
            }

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "turns-save-commit",
            })?;
            Ok(())
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    title: String,
    group_ref: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct TurnRow {
    turn_id: String,
    role: String,
    content: String,
}

fn conversation_row_to_record(row: ConversationRow) -> StorageResult<ConversationRecord> {
    Ok(ConversationRecord {
        id: GuestConversationId::parse(&row.id)?,
        title: row.title,
        group_ref: row.group_ref.map(GroupRef),
        created_at_unix_seconds: i64_to_u64(row.created_at, "conversation-row-created-at")?,
        updated_at_unix_seconds: i64_to_u64(row.updated_at, "conversation-row-updated-at")?,
    })
}

fn turn_row_to_turn(row: TurnRow) -> StorageResult<Turn> {
    let role = TurnRole::parse(&row.role).context(InvariantViolationSnafu {
        stage: "turn-role-from-sql",
        details: format!("unknown turn role '{}'", row.role),
    })?;
    Ok(Turn::new(TurnId::parse(&row.turn_id)?, role, row.content))
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| super::error::StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| super::error::StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == IN_MEMORY_DATABASE {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == IN_MEMORY_DATABASE {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
