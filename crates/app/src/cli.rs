use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use magister_llm::{TransportError, create_transport};
use magister_storage::{LocalStore, MemoryLocalStore, SqliteLocalStore, StorageError, TurnRole};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::backend::{ConversationBackend, ConversationSummary, HttpChatApi, SessionIdentity};
use crate::chat::{
    ChatCommand, ChatEvent, SendRejection, SessionOptions, TurnPhase, spawn_session,
};
use crate::i18n::Language;
use crate::settings::{GuestStoreKind, Settings, SettingsStore};

#[derive(Debug, Parser)]
#[command(name = "magister")]
#[command(about = "Streaming tutor chat in the terminal", long_about = None)]
pub struct Cli {
    /// Settings file; defaults to the platform config directory.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Bearer token of a signed-in account; without one the session runs as a guest.
    #[arg(long, env = "MAGISTER_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
    /// Answer language, `sv` or `en`.
    #[arg(long, value_parser = parse_language)]
    pub language: Option<Language>,
    /// Keep guest conversations in this SQLite file instead of memory.
    #[arg(long)]
    pub guest_db: Option<PathBuf>,
}

fn parse_language(value: &str) -> Result<Language, String> {
    Language::parse(value).ok_or_else(|| format!("unsupported language '{value}', use sv or en"))
}

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("failed to start the reply transport on `{stage}`, {source}"))]
    Transport {
        stage: &'static str,
        source: TransportError,
    },
    #[snafu(display("failed to open the guest store on `{stage}`, {source}"))]
    GuestStore {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to read input on `{stage}`, {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to write output on `{stage}`, {source}"))]
    WriteOutput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("chat session ended abnormally on `{stage}`, {source}"))]
    Session {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
}

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Message(String),
    Stop,
    New,
    List,
    /// 1-based index into the last listing.
    Open(usize),
    Rename(usize, String),
    Delete(usize),
    Clear,
    Language(Language),
    Help,
    Quit,
    Invalid(String),
}

impl ReplCommand {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Some(Self::Message(line.to_string()));
        };

        if let Some(rest) = command.strip_prefix("rename") {
            return Some(parse_rename(rest).unwrap_or_else(|| invalid(line)));
        }

        let mut parts = command.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let argument = parts.next();
        let parsed = match (name, argument) {
            ("stop", None) => Self::Stop,
            ("new", None) => Self::New,
            ("list", None) => Self::List,
            ("open", Some(index)) => parse_index(index).map_or_else(|| invalid(line), Self::Open),
            ("delete", Some(index)) => {
                parse_index(index).map_or_else(|| invalid(line), Self::Delete)
            }
            ("clear", None) => Self::Clear,
            ("lang", Some(code)) => Language::parse(code).map_or_else(|| invalid(line), Self::Language),
            ("help", None) => Self::Help,
            ("quit" | "exit", None) => Self::Quit,
            _ => invalid(line),
        };
        Some(parsed)
    }
}

/// `<n> <title>`; the title is the rest of the line.
fn parse_rename(rest: &str) -> Option<ReplCommand> {
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let (index, title) = rest.trim().split_once(char::is_whitespace)?;
    Some(ReplCommand::Rename(parse_index(index)?, title.trim().to_string()))
}

fn parse_index(raw: &str) -> Option<usize> {
    raw.parse::<usize>().ok().filter(|index| *index > 0)
}

fn invalid(line: &str) -> ReplCommand {
    ReplCommand::Invalid(line.to_string())
}

/// Writes chat events as plain terminal text.
pub struct Renderer<W> {
    out: W,
    language: Language,
    listing: Vec<ConversationSummary>,
    streamed: String,
    waiting: bool,
}

const CLEAR_LINE: &str = "\r\x1b[2K";

impl<W: Write> Renderer<W> {
    pub fn new(out: W, language: Language) -> Self {
        Self {
            out,
            language,
            listing: Vec::new(),
            streamed: String::new(),
            waiting: false,
        }
    }

    pub fn set_language(&mut self, language: Language) {
        self.language = language;
    }

    pub fn listed(&self, index: usize) -> Option<&ConversationSummary> {
        index.checked_sub(1).and_then(|index| self.listing.get(index))
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn line(&mut self, text: &str) -> std::io::Result<()> {
        writeln!(self.out, "{text}")?;
        self.out.flush()
    }

    pub fn render(&mut self, event: &ChatEvent) -> std::io::Result<()> {
        match event {
            ChatEvent::TurnsReplaced { turns, .. } => {
                for turn in turns {
                    writeln!(self.out, "{}{}", speaker(turn.role), turn.content)?;
                }
            }
            ChatEvent::TurnAppended { turn, .. } => {
                if turn.role == TurnRole::Assistant {
                    self.streamed.clear();
                    self.waiting = true;
                    write!(
                        self.out,
                        "{}({}...)",
                        speaker(turn.role),
                        self.language.waiting_indicator()
                    )?;
                }
            }
            ChatEvent::DeltaApplied { delta, .. } => {
                self.clear_waiting()?;
                self.streamed.push_str(delta);
                write!(self.out, "{delta}")?;
            }
            ChatEvent::TurnFinalized { turn, .. } => {
                self.clear_waiting()?;
                if turn.content != self.streamed {
                    if !self.streamed.is_empty() {
                        writeln!(self.out)?;
                    }
                    write!(self.out, "{}", turn.content)?;
                }
                writeln!(self.out)?;
                self.streamed.clear();
            }
            ChatEvent::PhaseChanged { phase, .. } => {
                if matches!(phase, TurnPhase::Cancelled(_)) {
                    self.clear_waiting()?;
                    let gap = if self.streamed.is_empty() { "" } else { " " };
                    write!(self.out, "{gap}{}", self.language.stopped())?;
                }
            }
            ChatEvent::ConversationList { conversations } => {
                self.listing = conversations.clone();
                if conversations.is_empty() {
                    writeln!(self.out, "{}", self.language.no_conversations())?;
                }
                for (index, summary) in conversations.iter().enumerate() {
                    let title = if summary.has_default_title() {
                        self.language.untitled_conversation()
                    } else {
                        summary.title.as_str()
                    };
                    writeln!(self.out, "{:>3}. {title}", index + 1)?;
                }
            }
            ChatEvent::TitleChanged { title, .. } => writeln!(self.out, "# {title}")?,
            ChatEvent::SendRejected { rejection } => match rejection {
                SendRejection::EmptyInput => {}
                SendRejection::NotIdle { .. } | SendRejection::Loading => {
                    writeln!(self.out, "{}", self.language.busy())?
                }
            },
            ChatEvent::Notice { message } => writeln!(self.out, "! {message}")?,
            ChatEvent::ConversationCreated { .. } | ChatEvent::ConversationDeleted { .. } => {}
        }
        self.out.flush()
    }

    /// Swaps the waiting indicator for the bare speaker label once text arrives.
    fn clear_waiting(&mut self) -> std::io::Result<()> {
        if std::mem::take(&mut self.waiting) {
            write!(self.out, "{CLEAR_LINE}{}", speaker(TurnRole::Assistant))?;
        }
        Ok(())
    }
}

fn speaker(role: TurnRole) -> &'static str {
    match role {
        TurnRole::User => "> ",
        TurnRole::Assistant => "Magister T: ",
    }
}

pub async fn build_backend(
    identity: &SessionIdentity,
    settings: &Settings,
    guest_db: Option<PathBuf>,
) -> CliResult<ConversationBackend> {
    if let SessionIdentity::Authenticated { token } = identity {
        let api = HttpChatApi::new(reqwest::Client::new(), settings.backend_url.clone(), token.clone());
        return Ok(ConversationBackend::remote(Arc::new(api)));
    }

    let sqlite_path = match (guest_db, settings.guest_store.kind) {
        (Some(path), _) => Some(path),
        (None, GuestStoreKind::Sqlite) => Some(settings.guest_store.database_path()),
        (None, GuestStoreKind::Memory) => None,
    };
    let store: Arc<dyn LocalStore> = match sqlite_path {
        Some(path) => Arc::new(
            SqliteLocalStore::open(&path.to_string_lossy())
                .await
                .context(GuestStoreSnafu {
                    stage: "open-sqlite-guest-store",
                })?,
        ),
        None => Arc::new(MemoryLocalStore::new()),
    };
    Ok(ConversationBackend::guest(store))
}

pub async fn run(cli: Cli) -> CliResult<()> {
    let settings_store = cli
        .config
        .clone()
        .map_or_else(SettingsStore::load, SettingsStore::new);
    let settings = settings_store.settings();
    let language = cli.language.unwrap_or(settings.language);
    let identity = SessionIdentity::from_token(cli.token.clone());

    let transport = create_transport(settings.transport_config(identity.token())).context(
        TransportSnafu {
            stage: "create-transport",
        },
    )?;
    let backend = build_backend(&identity, &settings, cli.guest_db.clone()).await?;
    tracing::info!(
        transport = transport.name(),
        guest = backend.is_guest(),
        language = %language,
        "starting chat session"
    );

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (handle, session) = spawn_session(
        transport,
        backend,
        SessionOptions {
            language,
            title_max_chars: settings.title_max_chars,
        },
        events_tx,
    );

    let mut renderer = Renderer::new(std::io::stdout(), language);
    renderer.line(language.help()).context(WriteOutputSnafu { stage: "render-help" })?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context(ReadInputSnafu { stage: "read-stdin-line" })? else {
                    break;
                };
                let Some(command) = ReplCommand::parse(&line) else {
                    continue;
                };
                let command = match command {
                    ReplCommand::Quit => break,
                    ReplCommand::Help => {
                        renderer.line(renderer.language.help()).context(WriteOutputSnafu { stage: "render-help" })?;
                        continue;
                    }
                    ReplCommand::Invalid(line) => {
                        tracing::debug!(line = %line, "unrecognized command");
                        renderer.line(renderer.language.help()).context(WriteOutputSnafu { stage: "render-help" })?;
                        continue;
                    }
                    ReplCommand::Message(text) => ChatCommand::Send(text),
                    ReplCommand::Stop => ChatCommand::Stop,
                    ReplCommand::New => ChatCommand::NewConversation,
                    ReplCommand::List => ChatCommand::List,
                    ReplCommand::Clear => ChatCommand::ClearAll,
                    ReplCommand::Language(language) => {
                        renderer.set_language(language);
                        if let Err(error) = settings_store.set_language(language) {
                            tracing::warn!(error = %error, "failed to save language setting");
                        }
                        ChatCommand::SetLanguage(language)
                    }
                    ReplCommand::Open(index) => match renderer.listed(index) {
                        Some(summary) => ChatCommand::Select(summary.id),
                        None => {
                            renderer.line(renderer.language.no_conversations()).context(WriteOutputSnafu { stage: "render-listing" })?;
                            continue;
                        }
                    },
                    ReplCommand::Rename(index, title) => match renderer.listed(index) {
                        Some(summary) => ChatCommand::Rename { id: summary.id, title },
                        None => {
                            renderer.line(renderer.language.no_conversations()).context(WriteOutputSnafu { stage: "render-listing" })?;
                            continue;
                        }
                    },
                    ReplCommand::Delete(index) => match renderer.listed(index) {
                        Some(summary) => ChatCommand::Delete(summary.id),
                        None => {
                            renderer.line(renderer.language.no_conversations()).context(WriteOutputSnafu { stage: "render-listing" })?;
                            continue;
                        }
                    },
                };
                if !handle.send(command) {
                    break;
                }
            }
            Some(event) = events.recv() => {
                renderer.render(&event).context(WriteOutputSnafu { stage: "render-event" })?;
            }
        }
    }

    // Dropping the last handle stops the controller after pending writes are flushed.
    drop(handle);
    session.await.context(SessionSnafu {
        stage: "join-chat-session",
    })?;
    while let Ok(event) = events.try_recv() {
        renderer.render(&event).context(WriteOutputSnafu { stage: "render-event" })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use magister_storage::{ConversationId, RemoteConversationId, Turn};

    use super::*;
    use crate::chat::{Activity, ConversationHandle, StreamSessionId, StreamTarget};

    #[test]
    fn parses_prompt_lines() {
        assert_eq!(ReplCommand::parse("   "), None);
        assert_eq!(
            ReplCommand::parse(" Vad är 2+2? "),
            Some(ReplCommand::Message("Vad är 2+2?".to_string()))
        );
        assert_eq!(ReplCommand::parse("/stop"), Some(ReplCommand::Stop));
        assert_eq!(ReplCommand::parse("/open 2"), Some(ReplCommand::Open(2)));
        assert_eq!(
            ReplCommand::parse("/lang en"),
            Some(ReplCommand::Language(Language::English))
        );
        assert_eq!(
            ReplCommand::parse("/open 0"),
            Some(ReplCommand::Invalid("/open 0".to_string()))
        );
        assert_eq!(
            ReplCommand::parse("/lang de"),
            Some(ReplCommand::Invalid("/lang de".to_string()))
        );
    }

    #[test]
    fn rename_takes_the_rest_of_the_line_as_title() {
        assert_eq!(
            ReplCommand::parse("/rename 2  Loopar i Python "),
            Some(ReplCommand::Rename(2, "Loopar i Python".to_string()))
        );
        for line in ["/rename 2", "/rename 0 Titel", "/rename x Titel", "/renamed 1 Titel"] {
            assert_eq!(
                ReplCommand::parse(line),
                Some(ReplCommand::Invalid(line.to_string()))
            );
        }
    }

    #[test]
    fn cli_flags_parse() {
        let cli = Cli::try_parse_from([
            "magister",
            "--language",
            "en",
            "--guest-db",
            "/tmp/guest.sqlite",
        ])
        .expect("parse flags");

        assert_eq!(cli.language, Some(Language::English));
        assert_eq!(cli.guest_db, Some(PathBuf::from("/tmp/guest.sqlite")));
        assert!(Cli::try_parse_from(["magister", "--language", "fr"]).is_err());
    }

    fn render_all(events: &[ChatEvent]) -> String {
        let mut renderer = Renderer::new(Vec::new(), Language::English);
        for event in events {
            renderer.render(event).expect("render");
        }
        String::from_utf8(renderer.into_inner()).expect("utf8")
    }

    #[test]
    fn streamed_reply_is_printed_once() {
        let conversation = ConversationHandle::new(1);
        let placeholder = Turn::assistant_placeholder();
        let mut finished = placeholder.clone();
        finished.content = "Hello".to_string();
        finished.in_flight = false;

        let output = render_all(&[
            ChatEvent::TurnAppended {
                conversation,
                turn: placeholder.clone(),
            },
            ChatEvent::DeltaApplied {
                conversation,
                turn_id: placeholder.id.clone(),
                delta: "Hel".to_string(),
            },
            ChatEvent::DeltaApplied {
                conversation,
                turn_id: placeholder.id.clone(),
                delta: "lo".to_string(),
            },
            ChatEvent::TurnFinalized {
                conversation,
                turn: finished,
            },
        ]);

        assert_eq!(
            output,
            format!("Magister T: (Magister T is thinking...){CLEAR_LINE}Magister T: Hello\n")
        );
    }

    fn cancelled(conversation: ConversationHandle) -> ChatEvent {
        ChatEvent::PhaseChanged {
            phase: TurnPhase::Cancelled(StreamTarget::new(conversation, StreamSessionId::new(1))),
            activity: Activity::Idle,
        }
    }

    #[test]
    fn stop_before_any_text_replaces_the_waiting_indicator() {
        let conversation = ConversationHandle::new(1);
        let mut stopped = Turn::assistant_placeholder();
        stopped.in_flight = false;

        let output = render_all(&[
            ChatEvent::TurnAppended {
                conversation,
                turn: Turn::assistant_placeholder(),
            },
            cancelled(conversation),
            ChatEvent::TurnFinalized {
                conversation,
                turn: stopped,
            },
        ]);

        assert_eq!(
            output,
            format!("Magister T: (Magister T is thinking...){CLEAR_LINE}Magister T: (stopped)\n")
        );
    }

    #[test]
    fn stop_marker_follows_partial_text() {
        let conversation = ConversationHandle::new(1);
        let mut stopped = Turn::assistant_placeholder();
        stopped.content = "Hal".to_string();
        stopped.in_flight = false;

        let output = render_all(&[
            ChatEvent::TurnAppended {
                conversation,
                turn: Turn::assistant_placeholder(),
            },
            ChatEvent::DeltaApplied {
                conversation,
                turn_id: stopped.id.clone(),
                delta: "Hal".to_string(),
            },
            cancelled(conversation),
            ChatEvent::TurnFinalized {
                conversation,
                turn: stopped,
            },
        ]);

        assert!(output.ends_with("Magister T: Hal (stopped)\n"));
    }

    #[test]
    fn apology_follows_partial_text_on_a_new_line() {
        let conversation = ConversationHandle::new(1);
        let mut failed = Turn::assistant_placeholder();
        failed.content = Language::English.apology().to_string();
        failed.in_flight = false;

        let output = render_all(&[
            ChatEvent::TurnAppended {
                conversation,
                turn: Turn::assistant_placeholder(),
            },
            ChatEvent::DeltaApplied {
                conversation,
                turn_id: failed.id.clone(),
                delta: "Half".to_string(),
            },
            ChatEvent::TurnFinalized {
                conversation,
                turn: failed,
            },
        ]);

        assert!(output.ends_with(&format!("Half\n{}\n", Language::English.apology())));
    }

    #[test]
    fn listing_is_numbered_and_remembered() {
        let mut renderer = Renderer::new(Vec::new(), Language::English);
        let id = ConversationId::Remote(RemoteConversationId(7));
        renderer
            .render(&ChatEvent::ConversationList {
                conversations: vec![ConversationSummary {
                    id,
                    title: magister_storage::DEFAULT_CONVERSATION_TITLE.to_string(),
                    group_ref: None,
                }],
            })
            .expect("render");

        assert_eq!(renderer.listed(1).map(|summary| summary.id), Some(id));
        assert!(renderer.listed(2).is_none());
        let output = String::from_utf8(renderer.into_inner()).expect("utf8");
        assert_eq!(output, "  1. New conversation\n");
    }
}
