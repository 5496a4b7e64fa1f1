use std::sync::Arc;

pub mod http;
pub mod rig_adapter;
pub mod sse;
pub mod transport;

pub use http::{BackendTransportConfig, DEFAULT_STREAM_PATH, HttpTransport};
pub use rig_adapter::{DEFAULT_OPENAI_MODEL, ModelConfig, RIG_OPENAI_PROVIDER_ID, RigTransport};
pub use sse::SseDecoder;
pub use transport::{
    CancelHandle, Fragment, FragmentReceiver, FragmentStream, FragmentStreamHandle,
    GenerateRequest, HistoryMessage, Role, StreamEventPayload, Transport, TransportError,
    TransportResult, TransportWorker, make_event_stream,
};

/// Which transport produces replies.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportConfig {
    Backend(BackendTransportConfig),
    Direct(ModelConfig),
}

pub fn create_transport(config: TransportConfig) -> TransportResult<Arc<dyn Transport>> {
    match config {
        TransportConfig::Backend(config) => Ok(Arc::new(HttpTransport::new(config)?)),
        TransportConfig::Direct(config) => Ok(Arc::new(RigTransport::new(config)?)),
    }
}
