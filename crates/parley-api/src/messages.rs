use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use uuid::Uuid;

use parley_db::models::{DEFAULT_PAGE_SIZE, MessagePage};
use parley_types::api::{Claims, MarkReadResponse, SendMessageRequest, SortOrder};
use parley_types::models::Message;

use crate::error::{ApiError, blocking};
use crate::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor: a message id; only messages strictly older are returned.
    pub before: Option<Uuid>,
    /// Cursor: a message id; only messages strictly newer are returned.
    pub after: Option<Uuid>,
    #[serde(default)]
    pub order: SortOrder,
}

fn default_limit() -> u32 {
    DEFAULT_PAGE_SIZE
}

impl From<MessageQuery> for MessagePage {
    fn from(q: MessageQuery) -> Self {
        Self {
            order: q.order,
            limit: q.limit,
            before: q.before,
            after: q.after,
        }
    }
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let messenger = state.messenger.clone();
    let message = blocking(move || {
        messenger.send_message(conversation_id, claims.sub, &req.content, req.client_ref)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<MessageQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    if query.before.is_some() && query.after.is_some() {
        return Err(ApiError::BadRequest("use either before or after, not both".into()));
    }
    let messenger = state.messenger.clone();
    let page = MessagePage::from(query);
    let messages = blocking(move || messenger.list_messages(conversation_id, claims.sub, page)).await?;
    Ok(Json(messages))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let messenger = state.messenger.clone();
    let updated = blocking(move || messenger.mark_read(message_id, claims.sub)).await?;
    Ok(Json(MarkReadResponse { updated }))
}
