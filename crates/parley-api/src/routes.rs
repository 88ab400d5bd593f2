use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use serde::Deserialize;

use parley_gateway::connection;

use crate::auth::{self, decode_token};
use crate::error::ApiError;
use crate::middleware::require_auth;
use crate::service::Messenger;
use crate::{conversations, messages, moderation, users};

/// Shared state for every route handler.
#[derive(Clone)]
pub struct AppState {
    pub messenger: Messenger,
    pub jwt_secret: Arc<str>,
}

impl AppState {
    pub fn new(messenger: Messenger, jwt_secret: impl Into<Arc<str>>) -> Self {
        Self {
            messenger,
            jwt_secret: jwt_secret.into(),
        }
    }
}

/// The full HTTP surface: public auth routes, bearer-protected REST routes,
/// and the `/gateway` WebSocket.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/gateway", get(ws_upgrade));

    let protected_routes = Router::new()
        .route(
            "/conversations",
            get(conversations::list_conversations).post(conversations::create_conversation),
        )
        .route("/conversations/{conversation_id}", get(conversations::get_conversation))
        .route(
            "/conversations/{conversation_id}/participants",
            post(conversations::add_participant),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route("/messages/{message_id}/read", post(messages::mark_read))
        .route("/messages/{message_id}/moderation", patch(moderation::update_moderation))
        .route("/users", get(users::list_users))
        .route("/users/me", get(users::current_user))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct GatewayQuery {
    pub token: Option<String>,
}

/// Browsers cannot set headers on a WebSocket handshake, so the token may
/// also come as `?token=`.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let token = match (&bearer, &query.token) {
        (Some(TypedHeader(Authorization(bearer))), _) => bearer.token(),
        (None, Some(token)) => token.as_str(),
        (None, None) => return Err(ApiError::Unauthorized),
    };
    let claims = decode_token(&state.jwt_secret, token)?;

    let dispatcher = state.messenger.dispatcher().clone();
    let db = state.messenger.db().clone();
    Ok(ws
        .on_upgrade(move |socket| connection::handle_connection(socket, dispatcher, db, claims.sub, claims.handle))
        .into_response())
}
