use axum::{
    Extension, Json,
    extract::{Query, State},
};

use parley_types::api::{Claims, UserQuery};
use parley_types::models::User;

use crate::error::{ApiError, blocking};
use crate::routes::AppState;

/// Every other user, optionally narrowed to one role.
pub async fn list_users(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<User>>, ApiError> {
    let messenger = state.messenger.clone();
    let users = blocking(move || messenger.list_users(claims.sub, query.role)).await?;
    Ok(Json(users))
}

pub async fn current_user(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<User>, ApiError> {
    let messenger = state.messenger.clone();
    let user = blocking(move || messenger.current_user(claims.sub)).await?;
    Ok(Json(user))
}
