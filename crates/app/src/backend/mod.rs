use std::sync::Arc;

use magister_storage::{
    ConversationId, DEFAULT_CONVERSATION_TITLE, GroupRef, LocalStore, StorageError, Turn,
};
use snafu::Snafu;

pub mod guest;
pub mod remote;

pub use guest::GuestBackend;
pub use remote::{ChatApi, HttpChatApi, RemoteBackend};

pub const DEFAULT_TITLE_MAX_CHARS: usize = 50;
const TITLE_ELLIPSIS: &str = "...";

/// Who is using the app; fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionIdentity {
    Authenticated { token: String },
    Anonymous,
}

impl SessionIdentity {
    /// A blank token counts as no token.
    pub fn from_token(token: Option<String>) -> Self {
        match token.map(|token| token.trim().to_string()) {
            Some(token) if !token.is_empty() => Self::Authenticated { token },
            _ => Self::Anonymous,
        }
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            Self::Authenticated { token } => Some(token),
            Self::Anonymous => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub title: String,
    pub group_ref: Option<GroupRef>,
}

impl ConversationSummary {
    pub fn has_default_title(&self) -> bool {
        self.title == DEFAULT_CONVERSATION_TITLE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedConversation {
    pub summary: ConversationSummary,
    pub turns: Vec<Turn>,
}

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BackendError {
    #[snafu(display("chat api request failed on `{stage}`, {source}"))]
    Request {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("chat api returned status {status} on `{stage}`: {body}"))]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("chat api returned unknown message role '{role}'"))]
    UnknownRole { stage: &'static str, role: String },
    #[snafu(display("local store failed on `{stage}`, {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("conversation {id} not found"))]
    ConversationNotFound {
        stage: &'static str,
        id: ConversationId,
    },
    #[snafu(display("conversation {id} belongs to another persistence target"))]
    IdentityMismatch {
        stage: &'static str,
        id: ConversationId,
    },
}

/// Persistence target chosen once per session from the identity mode.
#[derive(Clone)]
pub enum ConversationBackend {
    Remote(RemoteBackend),
    Guest(GuestBackend),
}

impl ConversationBackend {
    pub fn remote(api: Arc<dyn ChatApi>) -> Self {
        Self::Remote(RemoteBackend::new(api))
    }

    pub fn guest(store: Arc<dyn LocalStore>) -> Self {
        Self::Guest(GuestBackend::new(store))
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Self::Guest(_))
    }

    pub async fn create(&self) -> BackendResult<ConversationSummary> {
        match self {
            Self::Remote(backend) => backend.create().await,
            Self::Guest(backend) => backend.create().await,
        }
    }

    /// Guest sessions store the settled turns; remote sessions record exchanges instead.
    pub async fn mirror_turns(&self, id: ConversationId, turns: Vec<Turn>) -> BackendResult<()> {
        match self {
            Self::Remote(_) => Ok(()),
            Self::Guest(backend) => backend.mirror(guest_id(id, "mirror-turns")?, turns).await,
        }
    }

    /// Records one finalized exchange server-side; guests have nothing to submit.
    pub async fn submit_exchange(
        &self,
        id: ConversationId,
        user_text: &str,
        assistant_text: &str,
    ) -> BackendResult<()> {
        match self {
            Self::Remote(backend) => {
                backend
                    .submit_exchange(remote_id(id, "submit-exchange")?, user_text, assistant_text)
                    .await
            }
            Self::Guest(_) => Ok(()),
        }
    }

    pub async fn resolve_title(
        &self,
        id: ConversationId,
        first_user_text: &str,
        max_chars: usize,
    ) -> BackendResult<String> {
        match self {
            Self::Remote(backend) => {
                backend
                    .resolve_title(remote_id(id, "resolve-title")?, first_user_text, max_chars)
                    .await
            }
            Self::Guest(backend) => {
                backend
                    .resolve_title(guest_id(id, "resolve-title")?, first_user_text, max_chars)
                    .await
            }
        }
    }

    /// Sets a user-chosen title and returns the one the target stored.
    pub async fn rename(&self, id: ConversationId, title: &str) -> BackendResult<String> {
        match self {
            Self::Remote(backend) => backend.rename(remote_id(id, "rename-conversation")?, title).await,
            Self::Guest(backend) => backend.rename(guest_id(id, "rename-conversation")?, title).await,
        }
    }

    pub async fn open(&self, id: ConversationId) -> BackendResult<LoadedConversation> {
        match self {
            Self::Remote(backend) => backend.open(remote_id(id, "open-conversation")?).await,
            Self::Guest(backend) => backend.open(guest_id(id, "open-conversation")?).await,
        }
    }

    pub async fn list(&self) -> BackendResult<Vec<ConversationSummary>> {
        match self {
            Self::Remote(backend) => backend.list().await,
            Self::Guest(backend) => backend.list().await,
        }
    }

    pub async fn delete(&self, id: ConversationId) -> BackendResult<()> {
        match self {
            Self::Remote(backend) => backend.delete(remote_id(id, "delete-conversation")?).await,
            Self::Guest(backend) => backend.delete(guest_id(id, "delete-conversation")?).await,
        }
    }

    pub async fn delete_all(&self) -> BackendResult<()> {
        match self {
            Self::Remote(backend) => backend.delete_all().await,
            Self::Guest(backend) => backend.delete_all().await,
        }
    }
}

fn remote_id(
    id: ConversationId,
    stage: &'static str,
) -> BackendResult<magister_storage::RemoteConversationId> {
    match id.as_remote() {
        Some(id) => Ok(id),
        None => IdentityMismatchSnafu { stage, id }.fail(),
    }
}

fn guest_id(
    id: ConversationId,
    stage: &'static str,
) -> BackendResult<magister_storage::GuestConversationId> {
    match id.as_guest() {
        Some(id) => Ok(id),
        None => IdentityMismatchSnafu { stage, id }.fail(),
    }
}

/// Title derived from the first user message: at most `max_chars` characters, with
/// `...` appended when something was cut.
pub fn derive_title(first_user_text: &str, max_chars: usize) -> String {
    let text = first_user_text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let mut title = text.chars().take(max_chars).collect::<String>();
    title.push_str(TITLE_ELLIPSIS);
    title
}

#[cfg(test)]
mod tests {
    use super::*;
    use magister_storage::{MemoryLocalStore, RemoteConversationId};

    #[test]
    fn short_text_is_used_as_is() {
        assert_eq!(derive_title("  Vad är en loop?  ", 50), "Vad är en loop?");
    }

    #[test]
    fn long_text_is_cut_on_characters_not_bytes() {
        let text = "å".repeat(60);
        let title = derive_title(&text, DEFAULT_TITLE_MAX_CHARS);

        assert_eq!(title.chars().count(), DEFAULT_TITLE_MAX_CHARS + TITLE_ELLIPSIS.len());
        assert!(title.ends_with("å..."));
    }

    #[test]
    fn identity_from_blank_token_is_anonymous() {
        assert_eq!(
            SessionIdentity::from_token(Some("  ".to_string())),
            SessionIdentity::Anonymous
        );
        assert_eq!(
            SessionIdentity::from_token(Some(" jwt ".to_string())).token(),
            Some("jwt")
        );
    }

    #[tokio::test]
    async fn guest_backend_refuses_remote_ids() {
        let backend = ConversationBackend::guest(Arc::new(MemoryLocalStore::new()));
        let remote = ConversationId::Remote(RemoteConversationId(4));

        assert!(matches!(
            backend.mirror_turns(remote, Vec::new()).await,
            Err(BackendError::IdentityMismatch { .. })
        ));
        assert!(matches!(
            backend.open(remote).await,
            Err(BackendError::IdentityMismatch { .. })
        ));
        assert!(matches!(
            backend.rename(remote, "Loopar").await,
            Err(BackendError::IdentityMismatch { .. })
        ));
    }
}
