use futures::StreamExt;
use serde::Serialize;
use snafu::{OptionExt, ResultExt};
use tokio::sync::{mpsc, oneshot};

use super::sse::{SseDecoder, decode_buffered_reply};
use super::transport::{
    DecodeBodySnafu, Fragment, FragmentStreamHandle, GenerateRequest, HttpSnafu,
    MissingReplyTextSnafu, StatusSnafu, StreamEventPayload, StreamTruncatedSnafu, Transport,
    TransportResult, TransportWorker, make_event_stream,
};

pub const DEFAULT_STREAM_PATH: &str = "/api/chat-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTransportConfig {
    pub base_url: String,
    pub stream_path: String,
    /// Bearer token of the authenticated principal, if any.
    pub token: Option<String>,
}

impl BackendTransportConfig {
    pub fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if self.stream_path.starts_with('/') {
            format!("{base}{}", self.stream_path)
        } else {
            format!("{base}/{}", self.stream_path)
        }
    }
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
}

impl<'a> WireRequest<'a> {
    /// History first, then the trimmed user text.
    fn from_request(request: &'a GenerateRequest) -> Self {
        Self {
            messages: request
                .messages()
                .into_iter()
                .map(|message| WireMessage {
                    role: message.role.as_str(),
                    content: message.content,
                })
                .collect(),
            language: request.language.as_deref(),
        }
    }
}

/// Transport against the chat backend's generation endpoint.
///
/// The reply shape is chosen by the server: `text/event-stream` bodies are decoded
/// incrementally, anything else is read whole as a JSON reply.
pub struct HttpTransport {
    client: reqwest::Client,
    config: BackendTransportConfig,
}

impl HttpTransport {
    pub fn new(config: BackendTransportConfig) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context(HttpSnafu {
                stage: "build-http-client",
            })?;
        Ok(Self { client, config })
    }

    async fn run_stream_worker(
        client: reqwest::Client,
        config: BackendTransportConfig,
        request: GenerateRequest,
        event_tx: mpsc::UnboundedSender<StreamEventPayload>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let endpoint = config.endpoint();

        tokio::select! {
            biased;
            _ = &mut cancel_rx => {
                tracing::debug!(endpoint = %endpoint, "backend stream cancelled");
                let _ = event_tx.send(StreamEventPayload::Cancelled);
            }
            result = Self::pump(&client, &config, &request, &event_tx) => {
                if let Err(error) = result {
                    tracing::warn!(endpoint = %endpoint, error = %error, "backend stream failed");
                    let _ = event_tx.send(StreamEventPayload::TransportError(error.to_string()));
                }
            }
        }
    }

    /// Forwards fragments until a terminal one has been sent.
    async fn pump(
        client: &reqwest::Client,
        config: &BackendTransportConfig,
        request: &GenerateRequest,
        event_tx: &mpsc::UnboundedSender<StreamEventPayload>,
    ) -> TransportResult<()> {
        let body = WireRequest::from_request(request);

        let mut builder = client.post(config.endpoint()).json(&body);
        if let Some(token) = config.token.as_deref() {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.context(HttpSnafu {
            stage: "send-generate-request",
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return StatusSnafu {
                stage: "generate-http-status",
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        if is_event_stream(&response) {
            Self::pump_event_stream(response, event_tx).await
        } else {
            let body = response.text().await.context(HttpSnafu {
                stage: "read-buffered-reply",
            })?;
            let fragments = decode_buffered_reply(&body)
                .context(DecodeBodySnafu {
                    stage: "decode-buffered-reply",
                })?
                .context(MissingReplyTextSnafu {
                    stage: "decode-buffered-reply",
                })?;
            forward(fragments, event_tx);
            Ok(())
        }
    }

    async fn pump_event_stream(
        response: reqwest::Response,
        event_tx: &mpsc::UnboundedSender<StreamEventPayload>,
    ) -> TransportResult<()> {
        let mut decoder = SseDecoder::new();
        let mut bytes = response.bytes_stream();

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.context(HttpSnafu {
                stage: "read-event-stream",
            })?;
            if forward(decoder.push(&chunk), event_tx) {
                return Ok(());
            }
        }

        if forward(decoder.finish(), event_tx) {
            return Ok(());
        }

        StreamTruncatedSnafu {
            stage: "read-event-stream",
        }
        .fail()
    }
}

fn is_event_stream(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .trim_start()
                .to_ascii_lowercase()
                .starts_with("text/event-stream")
        })
}

/// Sends fragments in order and reports whether a terminal one went out.
fn forward(fragments: Vec<Fragment>, event_tx: &mpsc::UnboundedSender<StreamEventPayload>) -> bool {
    for fragment in fragments {
        let payload = StreamEventPayload::from(fragment);
        let terminal = payload.is_terminal();
        if event_tx.send(payload).is_err() || terminal {
            return true;
        }
    }
    false
}

impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "Chat backend"
    }

    fn stream_generate(&self, request: GenerateRequest) -> TransportResult<FragmentStreamHandle> {
        request.validate("backend-stream-generate")?;

        let (event_tx, stream, cancel_rx) = make_event_stream();
        let worker: TransportWorker = Box::pin(Self::run_stream_worker(
            self.client.clone(),
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(FragmentStreamHandle { stream, worker })
    }
}
