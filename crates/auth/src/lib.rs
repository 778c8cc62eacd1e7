use anyhow::Context;
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use costguard_config::{AuthConfig, GoogleAuthConfig};
use cuid2::CuidConstructor;
use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, Scope,
    TokenResponse, TokenUrl,
};
use once_cell::sync::Lazy;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool, Transaction};
use thiserror::Error;
use tracing::{debug, info};

pub mod roles;
pub mod vault;

pub use roles::{Permission, Role};
pub use vault::{mask_key, KeyVault, VaultError};

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_API: &str = "https://openidconnect.googleapis.com/v1/userinfo";

/// Ten years; longer lifetimes are clamped.
const MAX_SESSION_TTL_SECONDS: u64 = 10 * 365 * 86_400;

static CUID: Lazy<CuidConstructor> = Lazy::new(CuidConstructor::new);

#[derive(Clone)]
pub struct Authenticator {
    pool: SqlitePool,
    session_ttl: Duration,
    google: Option<GoogleOAuth>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("user already exists")]
    UserExists,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("google oauth is not configured")]
    GoogleOauthDisabled,
    #[error("google oauth error: {0}")]
    GoogleOauth(#[from] anyhow::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("password hashing failed: {0}")]
    PasswordHash(#[from] argon2::password_hash::Error),
    #[error("session not found")]
    SessionNotFound,
    #[error("session expired")]
    SessionExpired,
    #[error("invalid session token")]
    InvalidSession,
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    #[serde(skip_serializing)]
    pub id: i64,
    pub public_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub role: Role,
    #[serde(skip_serializing)]
    pub organization_id: i64,
    #[serde(rename = "organization_id")]
    pub organization_public_id: String,
}

impl User {
    pub fn can(&self, permission: Permission) -> bool {
        self.role.can(permission)
    }
}

#[derive(Debug, Clone)]
pub struct AuthSession {
    pub token: String,
    pub user_id: i64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct GoogleProfile {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

impl Authenticator {
    pub fn new(pool: SqlitePool, config: AuthConfig) -> Self {
        let ttl = config.session_ttl_seconds.min(MAX_SESSION_TTL_SECONDS) as i64;
        let session_ttl = Duration::seconds(ttl);
        let google = GoogleOAuth::from_config(&config.google);

        Self {
            pool,
            session_ttl,
            google,
        }
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    pub fn google_enabled(&self) -> bool {
        self.google.is_some()
    }

    pub fn google_authorization_url(
        &self,
        state: &str,
        redirect_uri: &str,
    ) -> Result<String, AuthError> {
        let google = self.google.as_ref().ok_or(AuthError::GoogleOauthDisabled)?;
        google
            .authorize_url(state, redirect_uri)
            .map_err(AuthError::GoogleOauth)
    }

    pub async fn register_with_password(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> Result<User, AuthError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT id FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&mut *tx)
            .await?;

        if existing.is_some() {
            return Err(AuthError::UserExists);
        }

        let now = Utc::now();
        let password_hash = self.hash_password(password)?;

        let user = self
            .insert_user(
                &mut tx,
                Some(email.to_owned()),
                display_name.map(str::to_owned),
            )
            .await?;

        sqlx::query(
            "INSERT INTO user_identities (user_id, provider, provider_uid, secret, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(user.id)
        .bind("password")
        .bind(email)
        .bind(password_hash)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(user = %user.public_id, role = user.role.as_str(), "registered password user");
        Ok(user)
    }

    pub async fn login_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, AuthError> {
        let identity = sqlx::query(
            "SELECT user_id, secret FROM user_identities WHERE provider = 'password' AND provider_uid = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = identity else {
            return Err(AuthError::InvalidCredentials);
        };

        let secret: String = row.try_get("secret")?;
        let stored_hash = PasswordHash::new(&secret)?;
        Argon2::default()
            .verify_password(password.as_bytes(), &stored_hash)
            .map_err(|_| AuthError::InvalidCredentials)?;

        let user_id: i64 = row.try_get("user_id")?;
        self.fetch_user(user_id).await?;

        self.issue_session(user_id).await
    }

    pub async fn login_with_google_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<AuthSession, AuthError> {
        let google = self.google.as_ref().ok_or(AuthError::GoogleOauthDisabled)?;

        let profile = google
            .exchange_code(code, redirect_uri)
            .await
            .map_err(AuthError::GoogleOauth)?;

        self.login_with_google_profile(profile).await
    }

    pub async fn login_with_google_profile(
        &self,
        profile: GoogleProfile,
    ) -> Result<AuthSession, AuthError> {
        let mut tx = self.pool.begin().await?;

        if let Some(row) = sqlx::query(
            "SELECT user_id FROM user_identities WHERE provider = 'google' AND provider_uid = ?",
        )
        .bind(&profile.id)
        .fetch_optional(&mut *tx)
        .await?
        {
            let user_id: i64 = row.try_get("user_id")?;
            tx.commit().await?;
            return self.issue_session(user_id).await;
        }

        let existing = match profile.email.as_ref() {
            Some(email) => sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE email = ?")
                .bind(email)
                .fetch_optional(&mut *tx)
                .await?,
            None => None,
        };

        let user_id = match existing {
            Some(user_id) => user_id,
            None => {
                self.insert_user(&mut tx, profile.email.clone(), profile.name.clone())
                    .await?
                    .id
            }
        };

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO user_identities (user_id, provider, provider_uid, secret, created_at, updated_at) VALUES (?, ?, ?, NULL, ?, ?)",
        )
        .bind(user_id)
        .bind("google")
        .bind(&profile.id)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(user_id, email = ?profile.email, "linked google identity");
        self.issue_session(user_id).await
    }

    pub async fn authenticate_token(&self, token: &str) -> Result<(User, AuthSession), AuthError> {
        let row = sqlx::query("SELECT user_id, expires_at FROM sessions WHERE token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Err(AuthError::SessionNotFound);
        };

        let user_id: i64 = row.try_get("user_id")?;
        let expires_at: String = row.try_get("expires_at")?;

        let expires_at = DateTime::parse_from_rfc3339(&expires_at)
            .map_err(|_| AuthError::InvalidSession)?
            .with_timezone(&Utc);

        if expires_at <= Utc::now() {
            sqlx::query("DELETE FROM sessions WHERE token = ?")
                .bind(token)
                .execute(&self.pool)
                .await?;
            return Err(AuthError::SessionExpired);
        }

        let user = self.fetch_user(user_id).await?;
        let session = AuthSession {
            token: token.to_owned(),
            user_id,
            expires_at,
        };

        Ok((user, session))
    }

    pub async fn logout(&self, token: &str) -> Result<(), AuthError> {
        let result = sqlx::query("DELETE FROM sessions WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AuthError::SessionNotFound);
        }
        Ok(())
    }

    pub async fn user_profile(&self, user_id: i64) -> Result<User, AuthError> {
        self.fetch_user(user_id).await
    }

    pub async fn update_profile(
        &self,
        user_id: i64,
        display_name: Option<&str>,
    ) -> Result<User, AuthError> {
        sqlx::query("UPDATE users SET display_name = ?, updated_at = ? WHERE id = ?")
            .bind(display_name)
            .bind(Utc::now().to_rfc3339())
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        self.fetch_user(user_id).await
    }

    /// Inserts a user and places them in the organization owning their email
    /// domain. The first member of a freshly created organization is its admin.
    async fn insert_user(
        &self,
        tx: &mut Transaction<'_, sqlx::Sqlite>,
        email: Option<String>,
        display_name: Option<String>,
    ) -> Result<User, AuthError> {
        let now = Utc::now().to_rfc3339();
        let domain = email_domain(email.as_deref());

        let existing_org = sqlx::query("SELECT id, public_id FROM organizations WHERE domain = ?")
            .bind(&domain)
            .fetch_optional(&mut **tx)
            .await?;

        let (organization_id, organization_public_id, role) = match existing_org {
            Some(row) => (row.try_get("id")?, row.try_get("public_id")?, Role::User),
            None => {
                let org_public_id = new_public_id();
                let owner = display_name
                    .clone()
                    .or_else(|| {
                        email
                            .as_deref()
                            .and_then(|value| value.split('@').next())
                            .map(str::to_owned)
                    })
                    .unwrap_or_else(|| "User".to_string());

                let org_id: i64 = sqlx::query_scalar(
                    "INSERT INTO organizations (public_id, name, domain, subscription, spending_limit, alert_threshold, created_at, updated_at) VALUES (?, ?, ?, 'FREE', 100, 80, ?, ?) RETURNING id",
                )
                .bind(&org_public_id)
                .bind(format!("{owner}'s Organization"))
                .bind(&domain)
                .bind(&now)
                .bind(&now)
                .fetch_one(&mut **tx)
                .await?;

                debug!(domain = %domain, "created organization for new user");
                (org_id, org_public_id, Role::Admin)
            }
        };

        let public_id = new_public_id();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO users (public_id, organization_id, email, display_name, role, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&public_id)
        .bind(organization_id)
        .bind(email.as_deref())
        .bind(display_name.as_deref())
        .bind(role.as_str())
        .bind(&now)
        .bind(&now)
        .fetch_one(&mut **tx)
        .await?;

        Ok(User {
            id,
            public_id,
            email,
            display_name,
            role,
            organization_id,
            organization_public_id,
        })
    }

    async fn fetch_user(&self, id: i64) -> Result<User, AuthError> {
        let row = sqlx::query(
            "SELECT u.id, u.public_id, u.email, u.display_name, u.role, u.organization_id, o.public_id AS organization_public_id \
             FROM users u JOIN organizations o ON o.id = u.organization_id WHERE u.id = ?",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        let role: String = row.try_get("role")?;

        Ok(User {
            id,
            public_id: row.try_get("public_id")?,
            email: row.try_get("email")?,
            display_name: row.try_get("display_name")?,
            role: Role::parse(&role).unwrap_or(Role::Viewer),
            organization_id: row.try_get("organization_id")?,
            organization_public_id: row.try_get("organization_public_id")?,
        })
    }

    async fn issue_session(&self, user_id: i64) -> Result<AuthSession, AuthError> {
        let token = self.generate_session_token();
        let now = Utc::now();
        let expires_at = now + self.session_ttl;

        sqlx::query(
            "INSERT INTO sessions (user_id, token, created_at, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(&token)
        .bind(now.to_rfc3339())
        .bind(expires_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(AuthSession {
            token,
            user_id,
            expires_at,
        })
    }

    fn hash_password(&self, password: &str) -> Result<String, argon2::password_hash::Error> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
        Ok(hash.to_string())
    }

    fn generate_session_token(&self) -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }
}

pub fn new_public_id() -> String {
    CUID.create_id()
}

fn email_domain(email: Option<&str>) -> String {
    email
        .and_then(|value| value.split_once('@'))
        .map(|(_, domain)| domain.trim().to_lowercase())
        .filter(|domain| !domain.is_empty())
        .unwrap_or_else(|| "personal".to_string())
}

#[derive(Clone)]
struct GoogleOAuth {
    client: BasicClient,
    http: reqwest::Client,
}

impl GoogleOAuth {
    fn from_config(config: &GoogleAuthConfig) -> Option<Self> {
        let client_id = config.client_id.clone()?;
        let client_secret = config.client_secret.clone()?;

        let client = BasicClient::new(
            ClientId::new(client_id),
            Some(ClientSecret::new(client_secret)),
            AuthUrl::new(GOOGLE_AUTH_URL.to_string()).ok()?,
            Some(TokenUrl::new(GOOGLE_TOKEN_URL.to_string()).ok()?),
        )
        .set_auth_type(oauth2::AuthType::RequestBody);

        let http = reqwest::Client::builder()
            .user_agent("costguard-backend")
            .build()
            .ok()?;

        Some(Self { client, http })
    }

    fn authorize_url(&self, state: &str, redirect_uri: &str) -> anyhow::Result<String> {
        let redirect = RedirectUrl::new(redirect_uri.to_owned())
            .context("invalid redirect uri for google oauth")?;

        let (url, _) = self
            .client
            .clone()
            .set_redirect_uri(redirect)
            .authorize_url(|| CsrfToken::new(state.to_owned()))
            .add_scope(Scope::new("openid".to_string()))
            .add_scope(Scope::new("email".to_string()))
            .add_scope(Scope::new("profile".to_string()))
            .url();

        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> anyhow::Result<GoogleProfile> {
        let redirect = RedirectUrl::new(redirect_uri.to_owned())
            .context("invalid redirect uri for google oauth")?;

        let token_response = self
            .client
            .clone()
            .set_redirect_uri(redirect)
            .exchange_code(AuthorizationCode::new(code.to_owned()))
            .request_async(async_http_client)
            .await
            .context("failed to exchange google oauth code")?;

        let access_token = token_response.access_token().secret();

        let user: GoogleUserInfo = self
            .http
            .get(GOOGLE_USERINFO_API)
            .bearer_auth(access_token)
            .send()
            .await
            .context("failed to call google userinfo api")?
            .error_for_status()
            .context("google userinfo api returned error")?
            .json()
            .await
            .context("failed to decode google userinfo response")?;

        debug!(sub = %user.sub, "fetched google user profile");

        Ok(GoogleProfile {
            id: user.sub,
            email: user.email,
            name: user.name,
        })
    }
}

#[derive(Deserialize)]
struct GoogleUserInfo {
    sub: String,
    email: Option<String>,
    name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::email_domain;

    #[test]
    fn email_domain_is_lowercased_and_defaults_to_personal() {
        assert_eq!(email_domain(Some("Alice@Example.COM")), "example.com");
        assert_eq!(email_domain(Some("no-at-sign")), "personal");
        assert_eq!(email_domain(Some("trailing@")), "personal");
        assert_eq!(email_domain(None), "personal");
    }
}
