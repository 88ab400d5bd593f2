use axum::{
    Extension, Json,
    extract::{Path, State},
};
use tracing::warn;
use uuid::Uuid;

use parley_types::api::Claims;
use parley_types::models::{Message, Moderation, Role};

use crate::error::{ApiError, blocking};
use crate::routes::AppState;

/// Partial update of a message's moderation annotations. Only staff
/// accounts (admins and moderators) may write them.
pub async fn update_moderation(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(patch): Json<Moderation>,
) -> Result<Json<Message>, ApiError> {
    let messenger = state.messenger.clone();
    let caller = claims.sub;
    let user = blocking(move || messenger.current_user(caller)).await?;
    if !matches!(user.role, Role::Admin | Role::Moderator) {
        warn!("{} tried to moderate message {} without a staff role", claims.handle, message_id);
        return Err(ApiError::Forbidden);
    }

    let messenger = state.messenger.clone();
    let message = blocking(move || messenger.update_moderation(message_id, &patch)).await?;
    Ok(Json(message))
}
