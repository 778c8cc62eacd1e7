use costguard_auth::{AuthSession, Authenticator, User};
use serde::Deserialize;
use utoipa::ToSchema;

use super::error::ServiceError;
use crate::state::OAuthStateStore;

const MIN_PASSWORD_LENGTH: usize = 8;

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

pub async fn register(
    authenticator: &Authenticator,
    req: RegisterRequest,
) -> Result<(AuthSession, User), ServiceError> {
    let email = req.email.trim().to_lowercase();
    let mut errors = Vec::new();
    if !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
        errors.push("email: must be a valid email address".to_string());
    }
    if req.password.chars().count() < MIN_PASSWORD_LENGTH {
        errors.push(format!(
            "password: must be at least {MIN_PASSWORD_LENGTH} characters"
        ));
    }
    if !errors.is_empty() {
        return Err(ServiceError::invalid("Invalid registration", errors));
    }

    let display_name = req
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty());
    let user = authenticator
        .register_with_password(&email, &req.password, display_name)
        .await?;
    let session = authenticator.login_with_password(&email, &req.password).await?;

    Ok((session, user))
}

pub async fn login(
    authenticator: &Authenticator,
    req: LoginRequest,
) -> Result<(AuthSession, User), ServiceError> {
    let email = req.email.trim().to_lowercase();
    let session = authenticator
        .login_with_password(&email, &req.password)
        .await?;
    let user = authenticator.user_profile(session.user_id).await?;

    Ok((session, user))
}

pub async fn google_login_url(
    authenticator: &Authenticator,
    oauth_state: &OAuthStateStore,
    redirect_uri: &str,
) -> Result<String, ServiceError> {
    if !authenticator.google_enabled() {
        return Err(costguard_auth::AuthError::GoogleOauthDisabled.into());
    }

    let state = oauth_state.issue().await;
    Ok(authenticator.google_authorization_url(&state, redirect_uri)?)
}

pub async fn google_callback(
    authenticator: &Authenticator,
    oauth_state: &OAuthStateStore,
    code: &str,
    state: &str,
    redirect_uri: &str,
) -> Result<(AuthSession, User), ServiceError> {
    if !oauth_state.consume(state).await {
        return Err(ServiceError::bad_request("invalid or expired OAuth state"));
    }

    let session = authenticator
        .login_with_google_code(code, redirect_uri)
        .await?;
    let user = authenticator.user_profile(session.user_id).await?;

    Ok((session, user))
}
