use std::fmt;
use std::str::FromStr;

use snafu::ResultExt;
use uuid::Uuid;

use super::error::{InvalidIdSnafu, InvariantViolationSnafu, StorageError, StorageResult};

const GUEST_ID_PREFIX: &str = "guest_";

/// Identifier of a conversation owned by the local guest session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GuestConversationId(pub Uuid);

impl GuestConversationId {
    pub fn new(raw: Uuid) -> Self {
        Self(raw)
    }

    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }

    /// Accepts both the prefixed display form and a bare UUID.
    pub fn parse(raw: &str) -> StorageResult<Self> {
        let trimmed = raw.trim();
        let bare = trimmed.strip_prefix(GUEST_ID_PREFIX).unwrap_or(trimmed);
        let parsed = Uuid::parse_str(bare).context(InvalidIdSnafu {
            stage: "parse-guest-conversation-id",
            id_type: "guest-conversation-id",
            raw: raw.to_string(),
        })?;
        Ok(Self(parsed))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for GuestConversationId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{GUEST_ID_PREFIX}{}", self.0)
    }
}

impl FromStr for GuestConversationId {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}

/// Server-assigned numeric conversation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteConversationId(pub i64);

impl RemoteConversationId {
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for RemoteConversationId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Durable conversation identity.
///
/// The two variants come from different persistence targets and are never
/// converted into one another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationId {
    Remote(RemoteConversationId),
    Guest(GuestConversationId),
}

impl ConversationId {
    pub fn as_remote(&self) -> Option<RemoteConversationId> {
        match self {
            Self::Remote(id) => Some(*id),
            Self::Guest(_) => None,
        }
    }

    pub fn as_guest(&self) -> Option<GuestConversationId> {
        match self {
            Self::Guest(id) => Some(*id),
            Self::Remote(_) => None,
        }
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(id) => write!(formatter, "{id}"),
            Self::Guest(id) => write!(formatter, "{id}"),
        }
    }
}

impl From<RemoteConversationId> for ConversationId {
    fn from(value: RemoteConversationId) -> Self {
        Self::Remote(value)
    }
}

impl From<GuestConversationId> for ConversationId {
    fn from(value: GuestConversationId) -> Self {
        Self::Guest(value)
    }
}

/// Opaque turn identifier, unique within one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(String);

impl TurnId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return InvariantViolationSnafu {
                stage: "parse-turn-id",
                details: "turn id must not be empty".to_string(),
            }
            .fail();
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl From<i64> for TurnId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}
