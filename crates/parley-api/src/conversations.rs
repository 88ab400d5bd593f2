use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::info;
use uuid::Uuid;

use parley_types::api::{
    AddParticipantRequest, AddParticipantResponse, Claims, CreateConversationRequest, CreateConversationResponse,
};
use parley_types::models::{ConversationSummary, ConversationView};

use crate::error::{ApiError, blocking};
use crate::routes::AppState;

/// 201 for a new conversation, 200 when an existing direct conversation is
/// returned instead.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<(StatusCode, Json<CreateConversationResponse>), ApiError> {
    let messenger = state.messenger.clone();
    let creator = claims.sub;
    let result = blocking(move || messenger.create_conversation(creator, &req.participant_ids)).await?;

    let response = CreateConversationResponse {
        conversation_id: result.conversation.id(),
        created: result.created,
    };
    if result.created {
        info!(
            "{} created conversation {} with {} participants",
            claims.handle,
            response.conversation_id,
            result.conversation.participants.len()
        );
        Ok((StatusCode::CREATED, Json(response)))
    } else {
        Ok((StatusCode::OK, Json(response)))
    }
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    let messenger = state.messenger.clone();
    let list = blocking(move || messenger.list_conversations(claims.sub)).await?;
    Ok(Json(list))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<ConversationView>, ApiError> {
    let messenger = state.messenger.clone();
    let view = blocking(move || messenger.get_conversation(conversation_id, claims.sub)).await?;
    Ok(Json(view))
}

pub async fn add_participant(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AddParticipantRequest>,
) -> Result<Json<AddParticipantResponse>, ApiError> {
    let messenger = state.messenger.clone();
    let added = blocking(move || messenger.add_participant(conversation_id, claims.sub, req.user_id)).await?;
    Ok(Json(AddParticipantResponse { added }))
}
