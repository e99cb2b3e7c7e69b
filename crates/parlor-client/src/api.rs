//! REST surface of the chat backend.
//!
//! All mutations (send, edit, delete, react, pin) go through these
//! endpoints. The push channel only ever delivers server-confirmed
//! entities back to us.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use thiserror::Error;

use parlor_shared::constants::HTTP_TIMEOUT_SECS;
use parlor_shared::types::{
    ChatId, ChatRoom, GroupRequest, Message, MessagePage, MessageRequest, MessageSearchResult,
    MessageId, User, UserId,
};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Credential missing or rejected by the server")]
    Auth,
    #[error("Request rejected: {0}")]
    Validation(String),
    #[error("Resource conflict: {0}")]
    Conflict(String),
    #[error("Transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Server returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Malformed response body: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ApiError>;

fn classify_status(status: StatusCode, message: String) -> ApiError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Auth,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ApiError::Validation(message),
        StatusCode::NOT_FOUND | StatusCode::CONFLICT => ApiError::Conflict(message),
        _ => ApiError::Api {
            status: status.as_u16(),
            message,
        },
    }
}

/// Everything the engine needs from the backend over HTTP.
///
/// Behind a trait so the orchestrator can be driven against an
/// in-memory double in tests.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_chats(&self) -> Result<Vec<ChatRoom>>;
    async fn fetch_messages(&self, chat_id: &ChatId, page: u32, size: u32)
        -> Result<MessagePage>;
    async fn create_message(&self, request: &MessageRequest) -> Result<Message>;
    async fn edit_message(&self, message_id: &MessageId, content: &str) -> Result<Message>;
    async fn delete_message(&self, message_id: &MessageId) -> Result<()>;
    async fn react_to_message(&self, message_id: &MessageId, emoji: &str) -> Result<Message>;
    async fn pin_message(&self, message_id: &MessageId, pinned: bool) -> Result<Message>;
    async fn mark_read(&self, message_id: &MessageId) -> Result<()>;
    async fn search_messages(
        &self,
        query: &str,
        chat_id: Option<&ChatId>,
    ) -> Result<MessageSearchResult>;
    async fn search_users(&self, query: &str) -> Result<Vec<User>>;
    async fn start_direct_chat(&self, user_id: &UserId) -> Result<ChatRoom>;
    async fn create_group(&self, request: &GroupRequest) -> Result<()>;
    async fn set_presence(&self, online: bool) -> Result<()>;
}

/// `ChatApi` over a real HTTP backend.
pub struct HttpApi {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    /// Every request requires a bearer token. A client without one
    /// fails locally instead of bothering the server.
    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let token = self.token.as_deref().ok_or(ApiError::Auth)?;
        let url = format!("{}{}", self.base_url, path);
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    async fn execute(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(classify_status(status, message))
    }

    async fn json<T: serde::de::DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = self.execute(builder).await?;
        Ok(response.json().await?)
    }

    async fn unit(&self, builder: RequestBuilder) -> Result<()> {
        self.execute(builder).await?;
        Ok(())
    }
}

#[async_trait]
impl ChatApi for HttpApi {
    async fn list_chats(&self) -> Result<Vec<ChatRoom>> {
        self.json(self.request(Method::GET, "/api/chats")?).await
    }

    async fn fetch_messages(
        &self,
        chat_id: &ChatId,
        page: u32,
        size: u32,
    ) -> Result<MessagePage> {
        let builder = self
            .request(Method::GET, "/api/messages")?
            .query(&[("chatId", chat_id.as_str())])
            .query(&[("page", page), ("size", size)]);
        self.json(builder).await
    }

    async fn create_message(&self, request: &MessageRequest) -> Result<Message> {
        self.json(self.request(Method::POST, "/api/messages")?.json(request))
            .await
    }

    async fn edit_message(&self, message_id: &MessageId, content: &str) -> Result<Message> {
        let path = format!("/api/messages/{}", message_id);
        let body = serde_json::json!({ "content": content });
        self.json(self.request(Method::PUT, &path)?.json(&body)).await
    }

    async fn delete_message(&self, message_id: &MessageId) -> Result<()> {
        let path = format!("/api/messages/{}", message_id);
        self.unit(self.request(Method::DELETE, &path)?).await
    }

    async fn react_to_message(&self, message_id: &MessageId, emoji: &str) -> Result<Message> {
        let path = format!("/api/messages/{}/react", message_id);
        let body = serde_json::json!({ "emoji": emoji });
        self.json(self.request(Method::POST, &path)?.json(&body)).await
    }

    async fn pin_message(&self, message_id: &MessageId, pinned: bool) -> Result<Message> {
        let path = format!("/api/messages/{}/pin", message_id);
        let builder = self
            .request(Method::PUT, &path)?
            .query(&[("pinned", pinned)]);
        self.json(builder).await
    }

    async fn mark_read(&self, message_id: &MessageId) -> Result<()> {
        let path = format!("/api/messages/{}/read", message_id);
        self.unit(self.request(Method::POST, &path)?).await
    }

    async fn search_messages(
        &self,
        query: &str,
        chat_id: Option<&ChatId>,
    ) -> Result<MessageSearchResult> {
        let mut builder = self
            .request(Method::GET, "/api/messages/search")?
            .query(&[("query", query)]);
        if let Some(chat_id) = chat_id {
            builder = builder.query(&[("chatId", chat_id.as_str())]);
        }
        self.json(builder).await
    }

    async fn search_users(&self, query: &str) -> Result<Vec<User>> {
        let builder = self
            .request(Method::GET, "/api/users/search")?
            .query(&[("query", query)]);
        self.json(builder).await
    }

    async fn start_direct_chat(&self, user_id: &UserId) -> Result<ChatRoom> {
        let builder = self
            .request(Method::POST, "/api/chats/direct")?
            .query(&[("userId", user_id.as_str())]);
        self.json(builder).await
    }

    async fn create_group(&self, request: &GroupRequest) -> Result<()> {
        self.unit(self.request(Method::POST, "/api/groups")?.json(request))
            .await
    }

    async fn set_presence(&self, online: bool) -> Result<()> {
        let builder = self
            .request(Method::POST, "/api/users/online")?
            .query(&[("isOnline", online)]);
        self.unit(builder).await
    }
}

// ---
