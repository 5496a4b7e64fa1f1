use std::sync::Arc;

use magister_storage::{
    BoxFuture, ConversationId, DEFAULT_CONVERSATION_TITLE, GroupRef, RemoteConversationId, Turn,
    TurnId, TurnRole,
};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::{
    BackendResult, ConversationSummary, LoadedConversation, RequestSnafu, StatusSnafu,
    UnknownRoleSnafu, derive_title,
};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChat {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub group_id: Option<i64>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl RemoteChat {
    pub fn into_summary(self) -> ConversationSummary {
        ConversationSummary {
            id: ConversationId::Remote(RemoteConversationId(self.id)),
            title: self.title,
            group_ref: self.group_id.map(GroupRef),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMessage {
    pub id: i64,
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl RemoteMessage {
    pub fn into_turn(self) -> BackendResult<Turn> {
        let Some(role) = TurnRole::parse(&self.role) else {
            return UnknownRoleSnafu {
                stage: "remote-message-into-turn",
                role: self.role,
            }
            .fail();
        };
        Ok(Turn::new(TurnId::from(self.id), role, self.content))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteChatDetail {
    #[serde(flatten)]
    pub chat: RemoteChat,
    #[serde(default)]
    pub messages: Vec<RemoteMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteExchange {
    pub user_message: RemoteMessage,
    pub assistant_message: RemoteMessage,
}

#[derive(Debug, Deserialize)]
struct ChatList {
    chats: Vec<RemoteChat>,
}

#[derive(Debug, Serialize)]
struct TitleBody<'a> {
    title: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeBody<'a> {
    content: &'a str,
    assistant_content: &'a str,
}

/// The backend's conversation REST API for authenticated users.
pub trait ChatApi: Send + Sync {
    fn create_chat(&self, title: String) -> BoxFuture<'_, BackendResult<RemoteChat>>;
    fn list_chats(&self) -> BoxFuture<'_, BackendResult<Vec<RemoteChat>>>;
    fn get_chat(&self, id: RemoteConversationId) -> BoxFuture<'_, BackendResult<RemoteChatDetail>>;
    fn rename_chat(
        &self,
        id: RemoteConversationId,
        title: String,
    ) -> BoxFuture<'_, BackendResult<RemoteChat>>;
    fn delete_chat(&self, id: RemoteConversationId) -> BoxFuture<'_, BackendResult<()>>;
    fn submit_exchange(
        &self,
        id: RemoteConversationId,
        content: String,
        assistant_content: String,
    ) -> BoxFuture<'_, BackendResult<RemoteExchange>>;
}

pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpChatApi {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/chats{path}", self.base_url)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        stage: &'static str,
    ) -> BackendResult<reqwest::Response> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .context(RequestSnafu { stage })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return StatusSnafu {
                stage,
                status: status.as_u16(),
                body,
            }
            .fail();
        }
        Ok(response)
    }

    async fn send_json<T>(&self, request: reqwest::RequestBuilder, stage: &'static str) -> BackendResult<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.send(request, stage)
            .await?
            .json::<T>()
            .await
            .context(RequestSnafu { stage })
    }
}

impl ChatApi for HttpChatApi {
    fn create_chat(&self, title: String) -> BoxFuture<'_, BackendResult<RemoteChat>> {
        Box::pin(async move {
            let request = self
                .client
                .post(self.url(""))
                .json(&TitleBody { title: &title });
            self.send_json(request, "create-remote-chat").await
        })
    }

    fn list_chats(&self) -> BoxFuture<'_, BackendResult<Vec<RemoteChat>>> {
        Box::pin(async move {
            let request = self.client.get(self.url(""));
            let list: ChatList = self.send_json(request, "list-remote-chats").await?;
            Ok(list.chats)
        })
    }

    fn get_chat(&self, id: RemoteConversationId) -> BoxFuture<'_, BackendResult<RemoteChatDetail>> {
        Box::pin(async move {
            let request = self.client.get(self.url(&format!("/{}", id.0)));
            self.send_json(request, "get-remote-chat").await
        })
    }

    fn rename_chat(
        &self,
        id: RemoteConversationId,
        title: String,
    ) -> BoxFuture<'_, BackendResult<RemoteChat>> {
        Box::pin(async move {
            let request = self
                .client
                .put(self.url(&format!("/{}", id.0)))
                .json(&TitleBody { title: &title });
            self.send_json(request, "rename-remote-chat").await
        })
    }

    fn delete_chat(&self, id: RemoteConversationId) -> BoxFuture<'_, BackendResult<()>> {
        Box::pin(async move {
            let request = self.client.delete(self.url(&format!("/{}", id.0)));
            self.send(request, "delete-remote-chat").await.map(|_| ())
        })
    }

    fn submit_exchange(
        &self,
        id: RemoteConversationId,
        content: String,
        assistant_content: String,
    ) -> BoxFuture<'_, BackendResult<RemoteExchange>> {
        Box::pin(async move {
            let request = self
                .client
                .post(self.url(&format!("/{}/messages", id.0)))
                .json(&ExchangeBody {
                    content: &content,
                    assistant_content: &assistant_content,
                });
            self.send_json(request, "submit-remote-exchange").await
        })
    }
}

/// Server-backed persistence for an authenticated principal.
#[derive(Clone)]
pub struct RemoteBackend {
    api: Arc<dyn ChatApi>,
}

impl RemoteBackend {
    pub fn new(api: Arc<dyn ChatApi>) -> Self {
        Self { api }
    }

    pub async fn create(&self) -> BackendResult<ConversationSummary> {
        let chat = self
            .api
            .create_chat(DEFAULT_CONVERSATION_TITLE.to_string())
            .await?;
        Ok(chat.into_summary())
    }

    pub async fn submit_exchange(
        &self,
        id: RemoteConversationId,
        user_text: &str,
        assistant_text: &str,
    ) -> BackendResult<()> {
        let exchange = self
            .api
            .submit_exchange(id, user_text.to_string(), assistant_text.to_string())
            .await?;
        let user_turn = exchange.user_message.into_turn()?;
        let assistant_turn = exchange.assistant_message.into_turn()?;
        tracing::debug!(
            conversation = %id,
            user_turn = user_turn.id.as_str(),
            assistant_turn = assistant_turn.id.as_str(),
            "exchange recorded"
        );
        Ok(())
    }

    pub async fn rename(&self, id: RemoteConversationId, title: &str) -> BackendResult<String> {
        let renamed = self.api.rename_chat(id, title.to_string()).await?;
        if renamed.title.trim().is_empty() {
            Ok(title.to_string())
        } else {
            Ok(renamed.title)
        }
    }

    /// Adopts a title the server already chose, otherwise sets one derived locally.
    pub async fn resolve_title(
        &self,
        id: RemoteConversationId,
        first_user_text: &str,
        max_chars: usize,
    ) -> BackendResult<String> {
        let detail = self.api.get_chat(id).await?;
        if detail.chat.title != DEFAULT_CONVERSATION_TITLE && !detail.chat.title.trim().is_empty()
        {
            return Ok(detail.chat.title);
        }

        self.rename(id, &derive_title(first_user_text, max_chars))
            .await
    }

    pub async fn open(&self, id: RemoteConversationId) -> BackendResult<LoadedConversation> {
        let detail = self.api.get_chat(id).await?;
        let turns = detail
            .messages
            .into_iter()
            .map(RemoteMessage::into_turn)
            .collect::<BackendResult<Vec<_>>>()?;
        Ok(LoadedConversation {
            summary: detail.chat.into_summary(),
            turns,
        })
    }

    pub async fn list(&self) -> BackendResult<Vec<ConversationSummary>> {
        Ok(self
            .api
            .list_chats()
            .await?
            .into_iter()
            .map(RemoteChat::into_summary)
            .collect())
    }

    pub async fn delete(&self, id: RemoteConversationId) -> BackendResult<()> {
        self.api.delete_chat(id).await
    }

    /// The API has no bulk endpoint; delete chats one by one and stop at the first failure.
    pub async fn delete_all(&self) -> BackendResult<()> {
        for chat in self.api.list_chats().await? {
            self.api.delete_chat(RemoteConversationId(chat.id)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use axum::{
        Json, Router,
        extract::{Path, State},
        http::{HeaderMap, Method, StatusCode, Uri, header},
        routing::{get, post},
    };
    use serde_json::{Value, json};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::backend::BackendError;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Debug, Clone, PartialEq)]
    struct RecordedRequest {
        method: Method,
        path: String,
        authorization: Option<String>,
        body: Value,
    }

    #[derive(Clone, Default)]
    struct MockState {
        requests: Arc<Mutex<Vec<RecordedRequest>>>,
    }

    impl MockState {
        fn record(&self, method: Method, uri: &Uri, headers: &HeaderMap, body: Value) {
            let authorization = headers
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            self.requests
                .lock()
                .expect("requests lock")
                .push(RecordedRequest {
                    method,
                    path: uri.path().to_string(),
                    authorization,
                    body,
                });
        }

        fn requests(&self) -> Vec<RecordedRequest> {
            self.requests.lock().expect("requests lock").clone()
        }
    }

    async fn create_chat_route(
        State(state): State<MockState>,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        state.record(method, &uri, &headers, body.clone());
        (
            StatusCode::CREATED,
            Json(json!({
                "id": 1,
                "title": body["title"],
                "createdAt": "2025-01-02T10:00:00.000Z",
            })),
        )
    }

    async fn list_chats_route(
        State(state): State<MockState>,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
    ) -> Json<Value> {
        state.record(method, &uri, &headers, Value::Null);
        Json(json!({
            "chats": [
                {"id": 1, "title": "Loopar"},
                {"id": 2, "title": DEFAULT_CONVERSATION_TITLE},
            ]
        }))
    }

    async fn get_chat_route(
        State(state): State<MockState>,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
    ) -> (StatusCode, &'static str) {
        state.record(method, &uri, &headers, Value::Null);
        (StatusCode::NOT_FOUND, "Chat not found")
    }

    async fn rename_chat_route(
        State(state): State<MockState>,
        Path(chat_id): Path<i64>,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        state.record(method, &uri, &headers, body.clone());
        Json(json!({"id": chat_id, "title": body["title"]}))
    }

    async fn delete_chat_route(
        State(state): State<MockState>,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
    ) -> StatusCode {
        state.record(method, &uri, &headers, Value::Null);
        StatusCode::NO_CONTENT
    }

    async fn submit_exchange_route(
        State(state): State<MockState>,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        state.record(method, &uri, &headers, body.clone());
        (
            StatusCode::CREATED,
            Json(json!({
                "userMessage": {"id": 11, "role": "user", "content": body["content"]},
                "assistantMessage": {"id": 12, "role": "assistant", "content": body["assistantContent"]},
            })),
        )
    }

    async fn spawn_chat_server() -> (String, MockState, oneshot::Sender<()>, JoinHandle<()>) {
        let state = MockState::default();
        let app = Router::new()
            .route("/api/chats", get(list_chats_route).post(create_chat_route))
            .route(
                "/api/chats/{chat_id}",
                get(get_chat_route)
                    .put(rename_chat_route)
                    .delete(delete_chat_route),
            )
            .route("/api/chats/{chat_id}/messages", post(submit_exchange_route))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock chat server");
        let address = listener.local_addr().expect("mock chat server address");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("mock chat server should run");
        });

        (format!("http://{address}"), state, shutdown_tx, handle)
    }

    async fn shutdown(shutdown_tx: oneshot::Sender<()>, handle: JoinHandle<()>) {
        let _ = shutdown_tx.send(());
        tokio::time::timeout(TEST_TIMEOUT, handle)
            .await
            .expect("mock chat server stops before timeout")
            .expect("mock chat server joins");
    }

    #[test]
    fn chat_detail_decodes_flat_backend_shape() {
        let detail: RemoteChatDetail = serde_json::from_str(
            r#"{
                "id": 7,
                "title": "Loopar i Python",
                "createdAt": "2025-01-02T10:00:00.000Z",
                "updatedAt": "2025-01-02T10:05:00.000Z",
                "messages": [
                    {"id": 11, "role": "user", "content": "Vad är en loop?", "createdAt": "x"},
                    {"id": 12, "role": "assistant", "content": "En loop upprepar.", "createdAt": "y"}
                ]
            }"#,
        )
        .expect("decode chat detail");

        assert_eq!(detail.chat.id, 7);
        assert_eq!(detail.messages.len(), 2);

        let turn = detail.messages[1].clone().into_turn().expect("into turn");
        assert_eq!(turn.id.as_str(), "12");
        assert_eq!(turn.role, TurnRole::Assistant);
        assert!(!turn.in_flight);
    }

    #[test]
    fn exchange_body_uses_camel_case() {
        let body = serde_json::to_value(ExchangeBody {
            content: "Hej",
            assistant_content: "Hej hej!",
        })
        .expect("serialize exchange body");

        assert_eq!(
            body,
            serde_json::json!({"content": "Hej", "assistantContent": "Hej hej!"})
        );
    }

    #[test]
    fn unknown_role_is_rejected() {
        let message = RemoteMessage {
            id: 1,
            role: "system".to_string(),
            content: "x".to_string(),
            created_at: None,
        };
        assert!(message.into_turn().is_err());
    }

    #[test]
    fn url_has_single_slash() {
        let api = HttpChatApi::new(reqwest::Client::new(), "http://localhost:3001/", "token");
        assert_eq!(api.url("/5/messages"), "http://localhost:3001/api/chats/5/messages");
    }

    #[tokio::test]
    async fn chat_api_sends_bearer_token_and_camel_case_bodies() {
        let (base_url, state, shutdown_tx, handle) = spawn_chat_server().await;
        let api = HttpChatApi::new(reqwest::Client::new(), format!("{base_url}/"), "jwt");
        let id = RemoteConversationId(1);

        let created = api
            .create_chat(DEFAULT_CONVERSATION_TITLE.to_string())
            .await
            .expect("create chat");
        assert_eq!(created.id, 1);
        assert_eq!(created.title, DEFAULT_CONVERSATION_TITLE);

        let exchange = api
            .submit_exchange(id, "Vad är en loop?".to_string(), "En upprepning.".to_string())
            .await
            .expect("submit exchange");
        let assistant = exchange.assistant_message.into_turn().expect("assistant turn");
        assert_eq!(assistant.id.as_str(), "12");
        assert_eq!(assistant.content, "En upprepning.");

        let renamed = api
            .rename_chat(id, "Loopar".to_string())
            .await
            .expect("rename chat");
        assert_eq!(renamed.title, "Loopar");

        api.delete_chat(id).await.expect("delete chat");

        let requests = state.requests();
        let routes = requests
            .iter()
            .map(|request| (request.method.clone(), request.path.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            routes,
            vec![
                (Method::POST, "/api/chats"),
                (Method::POST, "/api/chats/1/messages"),
                (Method::PUT, "/api/chats/1"),
                (Method::DELETE, "/api/chats/1"),
            ]
        );
        assert!(
            requests
                .iter()
                .all(|request| request.authorization.as_deref() == Some("Bearer jwt"))
        );
        assert_eq!(
            requests[1].body,
            json!({"content": "Vad är en loop?", "assistantContent": "En upprepning."})
        );
        assert_eq!(requests[2].body, json!({"title": "Loopar"}));

        shutdown(shutdown_tx, handle).await;
    }

    #[tokio::test]
    async fn remote_backend_clears_every_listed_chat() {
        let (base_url, state, shutdown_tx, handle) = spawn_chat_server().await;
        let backend = RemoteBackend::new(Arc::new(HttpChatApi::new(
            reqwest::Client::new(),
            base_url,
            "jwt",
        )));

        let listed = backend.list().await.expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, ConversationId::Remote(RemoteConversationId(1)));
        assert!(listed[1].has_default_title());

        backend.delete_all().await.expect("delete all");

        let deleted = state
            .requests()
            .into_iter()
            .filter(|request| request.method == Method::DELETE)
            .map(|request| request.path)
            .collect::<Vec<_>>();
        assert_eq!(deleted, vec!["/api/chats/1", "/api/chats/2"]);

        shutdown(shutdown_tx, handle).await;
    }

    #[tokio::test]
    async fn error_status_keeps_the_response_body() {
        let (base_url, _state, shutdown_tx, handle) = spawn_chat_server().await;
        let backend = RemoteBackend::new(Arc::new(HttpChatApi::new(
            reqwest::Client::new(),
            base_url,
            "jwt",
        )));

        let result = backend.open(RemoteConversationId(99)).await;
        assert!(matches!(
            result,
            Err(BackendError::Status { status: 404, ref body, .. }) if body == "Chat not found"
        ));

        shutdown(shutdown_tx, handle).await;
    }
}
