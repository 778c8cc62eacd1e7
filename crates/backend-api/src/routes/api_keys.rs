use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::{
    services::api_keys::{
        self as api_key_service, MaskedApiKey, SaveApiKeyRequest, SaveApiKeyResponse,
        TestApiKeyResponse,
    },
    util::require_bearer,
    ApiError, AppState,
};

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiKeysResponse {
    pub keys: Vec<MaskedApiKey>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ProviderQuery {
    pub provider: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TestApiKeyRequest {
    pub provider: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeleteApiKeyResponse {
    pub success: bool,
    pub message: String,
}

#[utoipa::path(
    get,
    path = "/api/api-keys",
    tag = "API Keys",
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Masked provider keys of the current user", body = ApiKeysResponse),
        (status = 401, description = "Authentication required", body = crate::error::ErrorResponse)
    )
)]
pub async fn list_api_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiKeysResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let keys = api_key_service::list_keys(state.db_pool(), state.vault(), user.id)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch api keys: {}", e);
            ApiError::from(e)
        })?;

    Ok(Json(ApiKeysResponse { keys }))
}

#[utoipa::path(
    post,
    path = "/api/api-keys",
    tag = "API Keys",
    security(("bearerAuth" = [])),
    request_body = SaveApiKeyRequest,
    responses(
        (status = 200, description = "Key validated and stored", body = SaveApiKeyResponse),
        (status = 400, description = "Missing fields, unknown provider or rejected key", body = crate::error::ErrorResponse)
    )
)]
pub async fn save_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SaveApiKeyRequest>,
) -> Result<Json<SaveApiKeyResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let response = api_key_service::save_key(
        state.db_pool(),
        state.vault(),
        state.orchestrator(),
        user.id,
        req,
    )
    .await
    .map_err(ApiError::from)?;

    Ok(Json(response))
}

#[utoipa::path(
    delete,
    path = "/api/api-keys",
    tag = "API Keys",
    security(("bearerAuth" = [])),
    params(ProviderQuery),
    responses(
        (status = 200, description = "Key removed", body = DeleteApiKeyResponse),
        (status = 404, description = "No key stored for the provider", body = crate::error::ErrorResponse)
    )
)]
pub async fn delete_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ProviderQuery>,
) -> Result<Json<DeleteApiKeyResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    api_key_service::delete_key(state.db_pool(), user.id, &query.provider)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(DeleteApiKeyResponse {
        success: true,
        message: "API key deleted successfully".to_string(),
    }))
}

#[utoipa::path(
    patch,
    path = "/api/api-keys",
    tag = "API Keys",
    security(("bearerAuth" = [])),
    request_body = TestApiKeyRequest,
    responses(
        (status = 200, description = "Stored key re-validated", body = TestApiKeyResponse),
        (status = 404, description = "No key stored for the provider", body = crate::error::ErrorResponse)
    )
)]
pub async fn test_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TestApiKeyRequest>,
) -> Result<Json<TestApiKeyResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let response = api_key_service::test_key(
        state.db_pool(),
        state.vault(),
        state.orchestrator(),
        user.id,
        &req.provider,
    )
    .await
    .map_err(ApiError::from)?;

    Ok(Json(response))
}
