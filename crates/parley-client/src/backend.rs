use std::future::Future;

use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use parley_types::api::{
    CreateConversationRequest, CreateConversationResponse, MarkReadResponse, SendMessageRequest, SortOrder,
};
use parley_types::models::{ConversationSummary, ConversationView, Message};

use crate::error::{ClientError, ClientResult};

/// Paging parameters for a message fetch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MessageQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Uuid>,
    pub order: SortOrder,
}

/// The server as seen by one authenticated session.
pub trait Backend {
    fn list_conversations(&self) -> impl Future<Output = ClientResult<Vec<ConversationSummary>>> + Send;

    fn get_conversation(&self, conversation_id: Uuid) -> impl Future<Output = ClientResult<ConversationView>> + Send;

    fn create_conversation(
        &self,
        participant_ids: Vec<Uuid>,
    ) -> impl Future<Output = ClientResult<CreateConversationResponse>> + Send;

    fn list_messages(
        &self,
        conversation_id: Uuid,
        query: MessageQuery,
    ) -> impl Future<Output = ClientResult<Vec<Message>>> + Send;

    fn send_message(
        &self,
        conversation_id: Uuid,
        content: String,
        client_ref: Uuid,
    ) -> impl Future<Output = ClientResult<Message>> + Send;

    fn mark_read(&self, message_id: Uuid) -> impl Future<Output = ClientResult<bool>> + Send;
}

/// REST backend over `reqwest`, authenticated with a bearer token.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url, token)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn fetch<T: DeserializeOwned>(&self, req: RequestBuilder) -> ClientResult<T> {
        let resp = req.bearer_auth(&self.token).send().await?;
        let resp = check(resp).await?;
        Ok(resp.json().await?)
    }
}

/// Turn a non-success response into `ClientError::Api`, keeping the server's
/// `{"error": ...}` message when there is one.
async fn check(resp: Response) -> ClientResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or(body);
    Err(ClientError::Api {
        status: status.as_u16(),
        message,
    })
}

impl Backend for HttpBackend {
    async fn list_conversations(&self) -> ClientResult<Vec<ConversationSummary>> {
        self.fetch(self.client.get(self.url("/conversations"))).await
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> ClientResult<ConversationView> {
        self.fetch(self.client.get(self.url(&format!("/conversations/{}", conversation_id))))
            .await
    }

    async fn create_conversation(&self, participant_ids: Vec<Uuid>) -> ClientResult<CreateConversationResponse> {
        let body = CreateConversationRequest { participant_ids };
        self.fetch(self.client.post(self.url("/conversations")).json(&body)).await
    }

    async fn list_messages(&self, conversation_id: Uuid, query: MessageQuery) -> ClientResult<Vec<Message>> {
        let url = self.url(&format!("/conversations/{}/messages", conversation_id));
        self.fetch(self.client.get(url).query(&query)).await
    }

    async fn send_message(&self, conversation_id: Uuid, content: String, client_ref: Uuid) -> ClientResult<Message> {
        let url = self.url(&format!("/conversations/{}/messages", conversation_id));
        let body = SendMessageRequest {
            content,
            client_ref: Some(client_ref),
        };
        self.fetch(self.client.post(url).json(&body)).await
    }

    async fn mark_read(&self, message_id: Uuid) -> ClientResult<bool> {
        let url = self.url(&format!("/messages/{}/read", message_id));
        let resp: MarkReadResponse = self.fetch(self.client.post(url)).await?;
        Ok(resp.updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_dropped() {
        let backend = HttpBackend::new("http://localhost:3000/", "t");
        assert_eq!(backend.url("/conversations"), "http://localhost:3000/conversations");
    }

    #[test]
    fn message_query_omits_unset_cursors() {
        let query = MessageQuery {
            limit: Some(20),
            ..Default::default()
        };
        let value = serde_json::to_value(&query).unwrap();
        assert_eq!(value, serde_json::json!({ "limit": 20, "order": "asc" }));
    }
}
