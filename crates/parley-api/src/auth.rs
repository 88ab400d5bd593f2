use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use tracing::info;
use uuid::Uuid;

use parley_db::queries::NewUser;
use parley_types::api::{Claims, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};
use parley_types::error::MessagingError;
use parley_types::models::Role;

use crate::error::{ApiError, blocking};
use crate::routes::AppState;

const TOKEN_LIFETIME_DAYS: i64 = 30;

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = req.handle.trim().to_string();
    if handle.len() < 3 || handle.len() > 32 {
        return Err(ApiError::BadRequest("handle must be 3-32 characters".into()));
    }
    if req.password.len() < 8 {
        return Err(ApiError::BadRequest("password must be at least 8 characters".into()));
    }

    let db = state.messenger.db().clone();
    let user_id = Uuid::new_v4();
    let display_name = req.display_name;
    let password = req.password;
    let name = handle.clone();
    blocking(move || {
        if db.get_user_by_handle(&name)?.is_some() {
            return Err(MessagingError::Conflict(format!("handle {} is taken", name)));
        }

        // Argon2id with a fresh salt
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?
            .to_string();

        db.create_user(
            user_id,
            NewUser {
                handle: &name,
                display_name: display_name.as_deref(),
                password_hash: &password_hash,
                role: Role::User,
            },
        )
    })
    .await?;

    let token = create_token(&state.jwt_secret, user_id, &handle)?;
    info!("Registered {} ({})", handle, user_id);

    Ok((StatusCode::CREATED, Json(RegisterResponse { user_id, token })))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let db = state.messenger.db().clone();
    let handle = req.handle.clone();
    let row = blocking(move || db.get_user_by_handle(&handle))
        .await?
        .ok_or(ApiError::Unauthorized)?;

    let password = req.password;
    let stored = row.password.clone();
    let verified = tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&stored).map_err(|e| anyhow::anyhow!("bad stored hash: {}", e))?;
        Ok::<_, anyhow::Error>(Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok())
    })
    .await??;
    if !verified {
        return Err(ApiError::Unauthorized);
    }

    let user = row.user;
    let token = create_token(&state.jwt_secret, user.id, &user.handle)?;

    Ok(Json(LoginResponse {
        user_id: user.id,
        handle: user.handle,
        token,
    }))
}

pub fn create_token(secret: &str, user_id: Uuid, handle: &str) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        handle: handle.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(TOKEN_LIFETIME_DAYS)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

pub fn decode_token(secret: &str, token: &str) -> Result<Claims, ApiError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| ApiError::Unauthorized)
}
