use std::collections::VecDeque;
use std::sync::Mutex;

use magister_llm::{
    FragmentStreamHandle, GenerateRequest, StreamEventPayload, Transport, TransportResult,
    TransportWorker, make_event_stream,
};
use magister_storage::{BoxFuture, DEFAULT_CONVERSATION_TITLE, RemoteConversationId};

use crate::backend::remote::{ChatApi, RemoteChat, RemoteChatDetail, RemoteExchange, RemoteMessage};
use crate::backend::{BackendError, BackendResult};

/// One scripted transport reply.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Emit(StreamEventPayload),
    /// Block until cancelled, then report `Cancelled`.
    Hold,
}

/// Transport that replays scripted replies in request order.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_reply(self, steps: Vec<Step>) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.push_back(steps);
        }
        self
    }

    pub(crate) fn requests(&self) -> Vec<GenerateRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

pub(crate) fn deltas(parts: &[&str]) -> Vec<Step> {
    let mut steps = parts
        .iter()
        .map(|part| Step::Emit(StreamEventPayload::Delta((*part).to_string())))
        .collect::<Vec<_>>();
    steps.push(Step::Emit(StreamEventPayload::Done));
    steps
}

impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "Scripted"
    }

    fn stream_generate(&self, request: GenerateRequest) -> TransportResult<FragmentStreamHandle> {
        request.validate("scripted-stream-generate")?;
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let steps = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut scripts| scripts.pop_front())
            .unwrap_or_else(|| deltas(&[]));

        let (event_tx, stream, mut cancel_rx) = make_event_stream();
        let worker: TransportWorker = Box::pin(async move {
            for step in steps {
                match step {
                    Step::Emit(payload) => {
                        if event_tx.send(payload).is_err() {
                            return;
                        }
                    }
                    Step::Hold => {
                        let _ = (&mut cancel_rx).await;
                        let _ = event_tx.send(StreamEventPayload::Cancelled);
                        return;
                    }
                }
            }
        });

        Ok(FragmentStreamHandle { stream, worker })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ApiCall {
    Create { title: String },
    List,
    Get { id: i64 },
    Rename { id: i64, title: String },
    Delete { id: i64 },
    Submit {
        id: i64,
        content: String,
        assistant_content: String,
    },
}

#[derive(Default)]
struct FakeServer {
    chats: Vec<RemoteChatDetail>,
    next_id: i64,
    calls: Vec<ApiCall>,
}

/// In-memory chat API that records every call.
#[derive(Default)]
pub(crate) struct RecordingChatApi {
    server: Mutex<FakeServer>,
    server_title: Option<String>,
    fail_creates: bool,
}

impl RecordingChatApi {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Mimics a backend that titles the chat itself on the first exchange.
    pub(crate) fn with_server_title(mut self, title: &str) -> Self {
        self.server_title = Some(title.to_string());
        self
    }

    pub(crate) fn failing_creates(mut self) -> Self {
        self.fail_creates = true;
        self
    }

    pub(crate) fn with_chat(self, title: &str, messages: &[(&str, &str)]) -> Self {
        if let Ok(mut server) = self.server.lock() {
            server.next_id += 1;
            let id = server.next_id;
            let messages = messages
                .iter()
                .enumerate()
                .map(|(index, (role, content))| RemoteMessage {
                    id: id * 100 + index as i64,
                    role: (*role).to_string(),
                    content: (*content).to_string(),
                    created_at: None,
                })
                .collect();
            server.chats.push(RemoteChatDetail {
                chat: chat(id, title),
                messages,
            });
        }
        self
    }

    pub(crate) fn calls(&self) -> Vec<ApiCall> {
        self.server
            .lock()
            .map(|server| server.calls.clone())
            .unwrap_or_default()
    }

    fn with_server<T>(&self, call: ApiCall, f: impl FnOnce(&mut FakeServer) -> BackendResult<T>) -> BackendResult<T> {
        let mut server = self.server.lock().map_err(|_| status(500, "poisoned"))?;
        server.calls.push(call);
        f(&mut server)
    }
}

fn chat(id: i64, title: &str) -> RemoteChat {
    RemoteChat {
        id,
        title: title.to_string(),
        group_id: None,
        created_at: None,
        updated_at: None,
    }
}

fn status(status: u16, body: &str) -> BackendError {
    BackendError::Status {
        stage: "fake-chat-api",
        status,
        body: body.to_string(),
    }
}

fn find(server: &mut FakeServer, id: i64) -> BackendResult<&mut RemoteChatDetail> {
    server
        .chats
        .iter_mut()
        .find(|detail| detail.chat.id == id)
        .ok_or_else(|| status(404, "Chat not found"))
}

impl ChatApi for RecordingChatApi {
    fn create_chat(&self, title: String) -> BoxFuture<'_, BackendResult<RemoteChat>> {
        Box::pin(async move {
            let fail = self.fail_creates;
            self.with_server(ApiCall::Create { title: title.clone() }, |server| {
                if fail {
                    return Err(status(500, "Failed to create chat"));
                }
                server.next_id += 1;
                let created = chat(server.next_id, &title);
                server.chats.push(RemoteChatDetail {
                    chat: created.clone(),
                    messages: Vec::new(),
                });
                Ok(created)
            })
        })
    }

    fn list_chats(&self) -> BoxFuture<'_, BackendResult<Vec<RemoteChat>>> {
        Box::pin(async move {
            self.with_server(ApiCall::List, |server| {
                Ok(server
                    .chats
                    .iter()
                    .rev()
                    .map(|detail| detail.chat.clone())
                    .collect())
            })
        })
    }

    fn get_chat(&self, id: RemoteConversationId) -> BoxFuture<'_, BackendResult<RemoteChatDetail>> {
        Box::pin(async move {
            self.with_server(ApiCall::Get { id: id.0 }, |server| {
                find(server, id.0).map(|detail| detail.clone())
            })
        })
    }

    fn rename_chat(
        &self,
        id: RemoteConversationId,
        title: String,
    ) -> BoxFuture<'_, BackendResult<RemoteChat>> {
        Box::pin(async move {
            self.with_server(
                ApiCall::Rename {
                    id: id.0,
                    title: title.clone(),
                },
                |server| {
                    let detail = find(server, id.0)?;
                    detail.chat.title = title;
                    Ok(detail.chat.clone())
                },
            )
        })
    }

    fn delete_chat(&self, id: RemoteConversationId) -> BoxFuture<'_, BackendResult<()>> {
        Box::pin(async move {
            self.with_server(ApiCall::Delete { id: id.0 }, |server| {
                find(server, id.0)?;
                server.chats.retain(|detail| detail.chat.id != id.0);
                Ok(())
            })
        })
    }

    fn submit_exchange(
        &self,
        id: RemoteConversationId,
        content: String,
        assistant_content: String,
    ) -> BoxFuture<'_, BackendResult<RemoteExchange>> {
        Box::pin(async move {
            let server_title = self.server_title.clone();
            self.with_server(
                ApiCall::Submit {
                    id: id.0,
                    content: content.clone(),
                    assistant_content: assistant_content.clone(),
                },
                |server| {
                    let detail = find(server, id.0)?;
                    let base = id.0 * 100 + detail.messages.len() as i64;
                    let user_message = RemoteMessage {
                        id: base,
                        role: "user".to_string(),
                        content,
                        created_at: None,
                    };
                    let assistant_message = RemoteMessage {
                        id: base + 1,
                        role: "assistant".to_string(),
                        content: assistant_content,
                        created_at: None,
                    };
                    detail.messages.push(user_message.clone());
                    detail.messages.push(assistant_message.clone());
                    if let Some(title) = server_title
                        && detail.chat.title == DEFAULT_CONVERSATION_TITLE
                    {
                        detail.chat.title = title;
                    }
                    Ok(RemoteExchange {
                        user_message,
                        assistant_message,
                    })
                },
            )
        })
    }
}
