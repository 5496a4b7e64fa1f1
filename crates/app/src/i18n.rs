use serde::{Deserialize, Serialize};

/// Language the tutor answers in and the front end speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    #[default]
    #[serde(rename = "sv")]
    Swedish,
    #[serde(rename = "en")]
    English,
}

impl Language {
    pub fn code(self) -> &'static str {
        match self {
            Self::Swedish => "sv",
            Self::English => "en",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sv" | "swedish" | "svenska" => Some(Self::Swedish),
            "en" | "english" | "engelska" => Some(Self::English),
            _ => None,
        }
    }

    /// Replaces the assistant reply when generation fails.
    pub fn apology(self) -> &'static str {
        match self {
            Self::Swedish => "Oj, något gick fel! Försök igen om en stund.",
            Self::English => "Oops, something went wrong! Try again in a moment.",
        }
    }

    pub fn waiting_indicator(self) -> &'static str {
        match self {
            Self::Swedish => "Magister T funderar",
            Self::English => "Magister T is thinking",
        }
    }

    /// Display label for a conversation that still carries the default title.
    pub fn untitled_conversation(self) -> &'static str {
        match self {
            Self::Swedish => magister_storage::DEFAULT_CONVERSATION_TITLE,
            Self::English => "New conversation",
        }
    }

    pub fn no_conversations(self) -> &'static str {
        match self {
            Self::Swedish => "Inga konversationer ännu.",
            Self::English => "No conversations yet.",
        }
    }

    pub fn busy(self) -> &'static str {
        match self {
            Self::Swedish => "Vänta tills svaret är klart, eller skriv /stop.",
            Self::English => "Wait for the reply to finish, or type /stop.",
        }
    }

    pub fn stopped(self) -> &'static str {
        match self {
            Self::Swedish => "(avbrutet)",
            Self::English => "(stopped)",
        }
    }

    pub fn help(self) -> &'static str {
        match self {
            Self::Swedish => {
                "Kommandon: /stop /new /list /open <n> /rename <n> <titel> /delete <n> /clear /lang <sv|en> /quit"
            }
            Self::English => {
                "Commands: /stop /new /list /open <n> /rename <n> <title> /delete <n> /clear /lang <sv|en> /quit"
            }
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}
