use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use costguard_auth::{AuthSession, User};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::{
    services::auth::{self as auth_service, LoginRequest, RegisterRequest},
    util::{require_bearer, rfc3339},
    ApiError, AppState,
};

#[derive(Debug, Serialize, ToSchema)]
pub struct GoogleLoginResponse {
    pub authorize_url: String,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct GoogleLoginQuery {
    pub redirect_uri: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct GoogleCallbackRequest {
    pub code: String,
    pub state: String,
    pub redirect_uri: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionResponse {
    pub token: String,
    pub user: UserResponse,
    pub expires_at: String,
}

impl SessionResponse {
    pub fn new(session: AuthSession, user: User) -> Self {
        Self {
            token: session.token,
            user: user.into(),
            expires_at: rfc3339(session.expires_at),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub role: String,
    pub organization_id: String,
}

impl From<User> for UserResponse {
    fn from(value: User) -> Self {
        Self {
            id: value.public_id,
            email: value.email,
            display_name: value.display_name,
            role: value.role.as_str().to_string(),
            organization_id: value.organization_public_id,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateProfileRequest {
    pub display_name: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/auth/register",
    tag = "Auth",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created and signed in", body = SessionResponse),
        (status = 400, description = "Invalid payload or email already registered", body = crate::error::ErrorResponse)
    )
)]
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    let (session, user) = auth_service::register(state.authenticator(), req)
        .await
        .map_err(ApiError::from)?;

    Ok((StatusCode::CREATED, Json(SessionResponse::new(session, user))))
}

#[utoipa::path(
    post,
    path = "/api/auth/login",
    tag = "Auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Signed in", body = SessionResponse),
        (status = 401, description = "Invalid credentials", body = crate::error::ErrorResponse)
    )
)]
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let (session, user) = auth_service::login(state.authenticator(), req)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(SessionResponse::new(session, user)))
}

#[utoipa::path(
    get,
    path = "/api/auth/google/login",
    tag = "Auth",
    params(GoogleLoginQuery),
    responses(
        (status = 200, description = "Google OAuth authorization URL", body = GoogleLoginResponse),
        (status = 503, description = "Google OAuth not configured", body = crate::error::ErrorResponse)
    )
)]
pub async fn google_login(
    State(state): State<AppState>,
    Query(params): Query<GoogleLoginQuery>,
) -> Result<Json<GoogleLoginResponse>, ApiError> {
    let authorize_url = auth_service::google_login_url(
        state.authenticator(),
        state.oauth_state(),
        &params.redirect_uri,
    )
    .await
    .map_err(ApiError::from)?;

    Ok(Json(GoogleLoginResponse { authorize_url }))
}

#[utoipa::path(
    post,
    path = "/api/auth/google/callback",
    tag = "Auth",
    request_body = GoogleCallbackRequest,
    responses(
        (status = 200, description = "Google OAuth callback succeeded", body = SessionResponse),
        (status = 400, description = "Invalid or expired OAuth state", body = crate::error::ErrorResponse),
        (status = 502, description = "Google rejected the code", body = crate::error::ErrorResponse),
        (status = 503, description = "Google OAuth not configured", body = crate::error::ErrorResponse)
    )
)]
pub async fn google_callback(
    State(state): State<AppState>,
    Json(payload): Json<GoogleCallbackRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let (session, user) = auth_service::google_callback(
        state.authenticator(),
        state.oauth_state(),
        &payload.code,
        &payload.state,
        &payload.redirect_uri,
    )
    .await
    .map_err(ApiError::from)?;

    Ok(Json(SessionResponse::new(session, user)))
}

#[utoipa::path(
    post,
    path = "/api/auth/logout",
    tag = "Auth",
    security(("bearerAuth" = [])),
    responses(
        (status = 204, description = "Session ended"),
        (status = 401, description = "Authentication required", body = crate::error::ErrorResponse)
    )
)]
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let token = require_bearer(&headers)?;
    state.authenticator().logout(&token).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/api/me",
    tag = "Auth",
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Current user", body = UserResponse),
        (status = 401, description = "Authentication required", body = crate::error::ErrorResponse)
    )
)]
pub async fn current_user(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UserResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;
    Ok(Json(user.into()))
}

#[utoipa::path(
    patch,
    path = "/api/me",
    tag = "Auth",
    security(("bearerAuth" = [])),
    request_body = UpdateProfileRequest,
    responses(
        (status = 200, description = "Profile updated", body = UserResponse),
        (status = 400, description = "Invalid display name", body = crate::error::ErrorResponse),
        (status = 401, description = "Authentication required", body = crate::error::ErrorResponse)
    )
)]
pub async fn update_current_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let display_name = req
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty());
    if display_name.is_some_and(|name| name.chars().count() > 255) {
        return Err(ApiError::bad_request(
            "Display name must be at most 255 characters",
        ));
    }

    let user = state
        .authenticator()
        .update_profile(user.id, display_name)
        .await?;
    Ok(Json(user.into()))
}
