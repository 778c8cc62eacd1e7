use costguard_auth::{mask_key, KeyVault};
use costguard_orchestrator::{catalogue, Orchestrator, Provider};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use utoipa::ToSchema;

use super::error::ServiceError;
use crate::util::now_rfc3339;

#[derive(Debug, FromRow)]
struct ApiKeyRow {
    public_id: String,
    provider: String,
    encrypted_key: String,
    is_active: bool,
    last_used: Option<String>,
    last_tested: Option<String>,
    created_at: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MaskedApiKey {
    pub id: String,
    pub provider: String,
    pub is_active: bool,
    pub last_used: Option<String>,
    pub last_tested: Option<String>,
    pub created_at: String,
    pub masked_key: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SaveApiKeyRequest {
    pub provider: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SaveApiKeyResponse {
    pub success: bool,
    pub message: String,
    pub model: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TestApiKeyResponse {
    pub success: bool,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn parse_provider(value: &str) -> Result<Provider, ServiceError> {
    Provider::parse(value).ok_or_else(|| ServiceError::bad_request("Invalid provider"))
}

pub async fn list_keys(
    pool: &SqlitePool,
    vault: &KeyVault,
    user_id: i64,
) -> Result<Vec<MaskedApiKey>, ServiceError> {
    let rows = sqlx::query_as::<_, ApiKeyRow>(
        r#"
        SELECT public_id, provider, encrypted_key, is_active, last_used, last_tested, created_at
        FROM api_keys
        WHERE user_id = ?
        ORDER BY provider ASC
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let masked_key = match vault.decrypt(&row.encrypted_key) {
                Ok(plain) => mask_key(&plain),
                Err(error) => {
                    tracing::warn!(key = %row.public_id, error = ?error, "stored api key could not be decrypted");
                    "****".to_string()
                }
            };
            MaskedApiKey {
                id: row.public_id,
                provider: row.provider,
                is_active: row.is_active,
                last_used: row.last_used,
                last_tested: row.last_tested,
                created_at: row.created_at,
                masked_key,
            }
        })
        .collect())
}

/// Validates `key` against the provider and stores it as the caller's only
/// key for that provider.
pub async fn save_key(
    pool: &SqlitePool,
    vault: &KeyVault,
    orchestrator: &Orchestrator,
    user_id: i64,
    req: SaveApiKeyRequest,
) -> Result<SaveApiKeyResponse, ServiceError> {
    let (Some(provider), Some(key)) = (
        req.provider.filter(|p| !p.trim().is_empty()),
        req.key.filter(|k| !k.trim().is_empty()),
    ) else {
        return Err(ServiceError::bad_request("Provider and key are required"));
    };
    let provider = parse_provider(&provider)?;
    let key = key.trim();

    let validation = orchestrator.validate_key(provider, key).await;
    if !validation.valid {
        return Err(ServiceError::bad_request(
            validation
                .error
                .unwrap_or_else(|| "Invalid API key".to_string()),
        ));
    }

    let encrypted = vault.encrypt(key)?;
    let now = now_rfc3339();

    sqlx::query(
        r#"
        INSERT INTO api_keys (public_id, user_id, provider, encrypted_key, is_active, last_tested, created_at, updated_at)
        VALUES (?, ?, ?, ?, 1, ?, ?, ?)
        ON CONFLICT (user_id, provider) DO UPDATE SET
            encrypted_key = excluded.encrypted_key,
            is_active = 1,
            last_tested = excluded.last_tested,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(costguard_auth::new_public_id())
    .bind(user_id)
    .bind(provider.as_str())
    .bind(&encrypted)
    .bind(&now)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    tracing::info!(provider = %provider, "api key saved");

    Ok(SaveApiKeyResponse {
        success: true,
        message: "API key saved successfully".to_string(),
        model: catalogue::models_for(provider)
            .next()
            .map(|spec| spec.model.to_string()),
    })
}

pub async fn delete_key(
    pool: &SqlitePool,
    user_id: i64,
    provider: &str,
) -> Result<(), ServiceError> {
    let provider = parse_provider(provider)?;
    let result = sqlx::query("DELETE FROM api_keys WHERE user_id = ? AND provider = ?")
        .bind(user_id)
        .bind(provider.as_str())
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(ServiceError::not_found("API key not found"));
    }

    Ok(())
}

/// Re-validates the stored key and records the outcome on the row.
pub async fn test_key(
    pool: &SqlitePool,
    vault: &KeyVault,
    orchestrator: &Orchestrator,
    user_id: i64,
    provider: &str,
) -> Result<TestApiKeyResponse, ServiceError> {
    let provider = parse_provider(provider)?;
    let encrypted: String = sqlx::query_scalar(
        "SELECT encrypted_key FROM api_keys WHERE user_id = ? AND provider = ?",
    )
    .bind(user_id)
    .bind(provider.as_str())
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ServiceError::not_found("API key not found"))?;

    let key = vault.decrypt(&encrypted)?;
    let validation = orchestrator.validate_key(provider, &key).await;

    sqlx::query(
        "UPDATE api_keys SET is_active = ?, last_tested = ?, updated_at = ? WHERE user_id = ? AND provider = ?",
    )
    .bind(validation.valid)
    .bind(now_rfc3339())
    .bind(now_rfc3339())
    .bind(user_id)
    .bind(provider.as_str())
    .execute(pool)
    .await?;

    Ok(TestApiKeyResponse {
        success: true,
        valid: validation.valid,
        error: validation.error,
    })
}

/// Decrypted active key of the caller for `provider`, if any.
pub async fn active_key(
    pool: &SqlitePool,
    vault: &KeyVault,
    user_id: i64,
    provider: Provider,
) -> Result<Option<String>, ServiceError> {
    let encrypted: Option<String> = sqlx::query_scalar(
        "SELECT encrypted_key FROM api_keys WHERE user_id = ? AND provider = ? AND is_active = 1",
    )
    .bind(user_id)
    .bind(provider.as_str())
    .fetch_optional(pool)
    .await?;

    match encrypted {
        Some(encrypted) => Ok(Some(vault.decrypt(&encrypted)?)),
        None => Ok(None),
    }
}

pub async fn active_providers(pool: &SqlitePool, user_id: i64) -> Result<Vec<Provider>, ServiceError> {
    let providers: Vec<String> = sqlx::query_scalar(
        "SELECT provider FROM api_keys WHERE user_id = ? AND is_active = 1 ORDER BY provider",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(providers
        .iter()
        .filter_map(|provider| Provider::parse(provider))
        .collect())
}

pub async fn mark_used(pool: &SqlitePool, user_id: i64, provider: Provider) -> Result<(), ServiceError> {
    sqlx::query("UPDATE api_keys SET last_used = ? WHERE user_id = ? AND provider = ?")
        .bind(now_rfc3339())
        .bind(user_id)
        .bind(provider.as_str())
        .execute(pool)
        .await?;
    Ok(())
}
