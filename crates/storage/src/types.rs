use super::ids::{GuestConversationId, TurnId};

/// Sentinel title every new conversation starts with.
///
/// Title derivation replaces it exactly once; detection always compares against this
/// constant, independent of the display language.
pub const DEFAULT_CONVERSATION_TITLE: &str = "Ny konversation";

/// Storage-local turn role, decoupled from the transport's history roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "user" => Some(Self::User),
            "assistant" | "model" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// One message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub id: TurnId,
    pub role: TurnRole,
    pub content: String,
    pub in_flight: bool,
}

impl Turn {
    pub fn new(id: TurnId, role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            in_flight: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TurnId::generate(), TurnRole::User, content)
    }

    /// Empty assistant placeholder that is populated while streaming.
    pub fn assistant_placeholder() -> Self {
        Self {
            id: TurnId::generate(),
            role: TurnRole::Assistant,
            content: String::new(),
            in_flight: true,
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self.role, TurnRole::User)
    }
}

/// Optional folder a conversation is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupRef(pub i64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: GuestConversationId,
    pub title: String,
    pub group_ref: Option<GroupRef>,
    pub created_at_unix_seconds: u64,
    pub updated_at_unix_seconds: u64,
}

impl ConversationRecord {
    pub fn has_default_title(&self) -> bool {
        self.title == DEFAULT_CONVERSATION_TITLE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub title: String,
    pub group_ref: Option<GroupRef>,
}

impl Default for NewConversation {
    fn default() -> Self {
        Self {
            title: DEFAULT_CONVERSATION_TITLE.to_string(),
            group_ref: None,
        }
    }
}
