use std::future::Future;
use std::pin::Pin;

use snafu::{Snafu, ensure};
use tokio::sync::{mpsc, oneshot};

/// Speaker of one history entry sent to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryMessage {
    pub role: Role,
    pub content: String,
}

impl HistoryMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One generation request: prior turns plus the new user text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateRequest {
    pub history: Vec<HistoryMessage>,
    pub user_text: String,
    pub language: Option<String>,
}

impl GenerateRequest {
    pub fn new(history: Vec<HistoryMessage>, user_text: impl Into<String>) -> Self {
        Self {
            history,
            user_text: user_text.into(),
            language: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Rejects input before any network activity happens.
    pub fn validate(&self, stage: &'static str) -> TransportResult<()> {
        ensure!(!self.user_text.trim().is_empty(), EmptyUserTextSnafu { stage });

        if let Some(index) = self
            .history
            .iter()
            .position(|message| message.content.trim().is_empty())
        {
            return MalformedHistorySnafu { stage, index }.fail();
        }

        Ok(())
    }

    /// History followed by the new user message, in send order.
    pub fn messages(&self) -> Vec<HistoryMessage> {
        let mut messages = self.history.clone();
        messages.push(HistoryMessage::new(Role::User, self.user_text.trim()));
        messages
    }
}

/// Wire-level unit decoded from a backend reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Text(String),
    Done,
    Error(String),
}

/// What a transport worker reports to its consumer.
///
/// Exactly one terminal payload (`Done`, `UpstreamError`, `TransportError` or
/// `Cancelled`) ends every stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    Delta(String),
    Done,
    /// The model backend answered with an error payload.
    UpstreamError(String),
    /// The request itself failed (connect, HTTP status, decode, truncation).
    TransportError(String),
    Cancelled,
}

impl StreamEventPayload {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Delta(_))
    }
}

impl From<Fragment> for StreamEventPayload {
    fn from(fragment: Fragment) -> Self {
        match fragment {
            Fragment::Text(text) => Self::Delta(text),
            Fragment::Done => Self::Done,
            Fragment::Error(message) => Self::UpstreamError(message),
        }
    }
}

pub type TransportWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("user text is empty after trimming"))]
    EmptyUserText { stage: &'static str },
    #[snafu(display("history entry {index} has no content"))]
    MalformedHistory { stage: &'static str, index: usize },
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("http request failed on `{stage}`, {source}"))]
    Http {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("chat backend returned status {status}: {body}"))]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to decode chat backend reply on `{stage}`, {source}"))]
    DecodeBody {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("chat backend reply carried no text"))]
    MissingReplyText { stage: &'static str },
    #[snafu(display("event stream ended before completion"))]
    StreamTruncated { stage: &'static str },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    RigHttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

impl TransportError {
    /// Input problems caught before any network activity.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EmptyUserText { .. } | Self::MalformedHistory { .. }
        )
    }
}

/// Cancellation signal for one in-flight generation.
///
/// Dropping the handle cancels too, so an abandoned stream never keeps its
/// network read alive.
#[derive(Debug)]
pub struct CancelHandle {
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

#[derive(Debug)]
pub struct FragmentReceiver {
    events: mpsc::UnboundedReceiver<StreamEventPayload>,
}

impl FragmentReceiver {
    pub async fn recv(&mut self) -> Option<StreamEventPayload> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEventPayload> {
        self.events.try_recv().ok()
    }
}

/// Lazy, finite, non-restartable sequence of payloads for one request.
#[derive(Debug)]
pub struct FragmentStream {
    events: FragmentReceiver,
    cancel: CancelHandle,
}

impl FragmentStream {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<StreamEventPayload>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            events: FragmentReceiver { events },
            cancel: CancelHandle {
                cancel_tx: Some(cancel_tx),
            },
        }
    }

    pub async fn recv(&mut self) -> Option<StreamEventPayload> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEventPayload> {
        self.events.try_recv()
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel.cancel()
    }

    /// Separates reading from cancelling so they can live on different owners.
    pub fn into_parts(self) -> (FragmentReceiver, CancelHandle) {
        (self.events, self.cancel)
    }
}

pub struct FragmentStreamHandle {
    pub stream: FragmentStream,
    /// Future that performs the request; the caller decides where it runs.
    pub worker: TransportWorker,
}

pub trait Transport: Send + Sync {
    fn name(&self) -> &str;
    fn stream_generate(&self, request: GenerateRequest) -> TransportResult<FragmentStreamHandle>;
}

pub fn make_event_stream() -> (
    mpsc::UnboundedSender<StreamEventPayload>,
    FragmentStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (event_tx, FragmentStream::new(event_rx, cancel_tx), cancel_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_user_text_is_a_validation_error() {
        let request = GenerateRequest::new(Vec::new(), "  \n ");
        let error = request.validate("test").err();

        assert!(matches!(error, Some(TransportError::EmptyUserText { .. })));
        assert!(error.is_some_and(|error| error.is_validation()));
    }

    #[test]
    fn empty_history_entry_is_malformed() {
        let request = GenerateRequest::new(
            vec![
                HistoryMessage::new(Role::User, "hej"),
                HistoryMessage::new(Role::Assistant, ""),
            ],
            "igen",
        );

        assert!(matches!(
            request.validate("test"),
            Err(TransportError::MalformedHistory { index: 1, .. })
        ));
    }

    #[test]
    fn messages_end_with_trimmed_user_text() {
        let request = GenerateRequest::new(
            vec![HistoryMessage::new(Role::User, "första")],
            "  andra  ",
        );
        let messages = request.messages();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1], HistoryMessage::new(Role::User, "andra"));
    }

    #[tokio::test]
    async fn dropping_cancel_handle_signals_the_worker() {
        let (_event_tx, stream, cancel_rx) = make_event_stream();
        let (_events, cancel) = stream.into_parts();

        drop(cancel);
        assert!(cancel_rx.await.is_ok());
    }
}
