use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::transport::{
    CompletionsFailedSnafu, EmptyUserTextSnafu, FragmentStreamHandle, GenerateRequest,
    MissingApiKeySnafu, RigHttpClientSnafu, Role, StreamEventPayload, Transport, TransportError,
    TransportResult, TransportWorker, UnsupportedProviderSnafu, make_event_stream,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

/// Connection and sampling settings for talking to a model provider directly.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub model_id: String,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider_id: RIG_OPENAI_PROVIDER_ID.to_string(),
            api_key: String::new(),
            endpoint: String::new(),
            model_id: DEFAULT_OPENAI_MODEL.to_string(),
            preamble: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

/// Transport that streams straight from an OpenAI-compatible provider through rig,
/// bypassing the chat backend.
pub struct RigTransport {
    config: ModelConfig,
}

impl RigTransport {
    pub fn new(config: ModelConfig) -> TransportResult<Self> {
        ensure!(
            config.provider_id == RIG_OPENAI_PROVIDER_ID,
            UnsupportedProviderSnafu {
                stage: "rig-transport-new",
                provider_id: config.provider_id.clone(),
            }
        );
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-transport-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    fn build_client(config: &ModelConfig) -> TransportResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(RigHttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(role: Role, content: &str) -> RigMessage {
        match role {
            Role::User => RigMessage::user(content.to_string()),
            Role::Assistant => RigMessage::assistant(content.to_string()),
        }
    }

    fn preamble(config: &ModelConfig, request: &GenerateRequest) -> Option<String> {
        let mut parts = Vec::new();

        if let Some(preamble) = &config.preamble
            && !preamble.trim().is_empty()
        {
            parts.push(preamble.clone());
        }
        if let Some(language) = &request.language {
            parts.push(format!("Answer in the language with code '{language}'."));
        }

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    async fn open_stream(
        config: &ModelConfig,
        request: &GenerateRequest,
    ) -> TransportResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(config.model_id.clone());

        let mut messages = request
            .messages()
            .into_iter()
            .map(|message| Self::to_rig_message(message.role, &message.content))
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            return EmptyUserTextSnafu {
                stage: "open-stream-pop-prompt",
            }
            .fail();
        };
        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = Self::preamble(config, request) {
            builder = builder.preamble(preamble);
        }

        if let Some(temperature) = config.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = config.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<StreamEventPayload>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => {
                Some(StreamEventPayload::Delta(text.text))
            }
            _ => None,
        }
    }

    async fn run_stream_worker(
        config: ModelConfig,
        request: GenerateRequest,
        event_tx: mpsc::UnboundedSender<StreamEventPayload>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let mut stream = tokio::select! {
            _ = &mut cancel_rx => {
                let _ = event_tx.send(StreamEventPayload::Cancelled);
                return;
            }
            opened = Self::open_stream(&config, &request) => match opened {
                Ok(stream) => stream,
                Err(error) => {
                    tracing::error!(
                        provider_id = %config.provider_id,
                        model_id = %config.model_id,
                        error = %error,
                        "failed to open provider stream"
                    );
                    let _ = event_tx.send(StreamEventPayload::TransportError(error.to_string()));
                    return;
                }
            },
        };

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    // Stop provider IO promptly.
                    tracing::debug!(model_id = %config.model_id, "provider stream cancelled");
                    stream.cancel();
                    let _ = event_tx.send(StreamEventPayload::Cancelled);
                    return;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(payload) = Self::map_stream_item(item)
                                && event_tx.send(payload).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                model_id = %config.model_id,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = TransportError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            let _ = event_tx.send(StreamEventPayload::UpstreamError(error.to_string()));
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        let _ = event_tx.send(StreamEventPayload::Done);
    }
}

impl Transport for RigTransport {
    fn name(&self) -> &str {
        "Rig OpenAI"
    }

    fn stream_generate(&self, request: GenerateRequest) -> TransportResult<FragmentStreamHandle> {
        request.validate("rig-stream-generate")?;

        let (event_tx, stream, cancel_rx) = make_event_stream();
        let worker: TransportWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(FragmentStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ModelConfig {
        ModelConfig {
            api_key: "sk-test".to_string(),
            ..ModelConfig::default()
        }
    }

    #[test]
    fn rejects_missing_api_key() {
        let error = RigTransport::new(ModelConfig::default()).err();
        assert!(matches!(error, Some(TransportError::MissingApiKey { .. })));
    }

    #[test]
    fn rejects_unknown_provider() {
        let error = RigTransport::new(ModelConfig {
            provider_id: "anthropic".to_string(),
            ..config()
        })
        .err();
        assert!(matches!(
            error,
            Some(TransportError::UnsupportedProvider { .. })
        ));
    }

    #[test]
    fn empty_user_text_fails_before_any_worker_exists() {
        let transport = RigTransport::new(config()).expect("transport");
        let result = transport.stream_generate(GenerateRequest::new(Vec::new(), " "));
        assert!(matches!(result, Err(error) if error.is_validation()));
    }

    #[test]
    fn preamble_carries_language_hint() {
        let request = GenerateRequest::new(Vec::new(), "hej").with_language("sv");
        let preamble = RigTransport::preamble(
            &ModelConfig {
                preamble: Some("Du är en lärare.".to_string()),
                ..config()
            },
            &request,
        )
        .expect("preamble");

        assert!(preamble.starts_with("Du är en lärare."));
        assert!(preamble.ends_with("code 'sv'."));
    }
}
