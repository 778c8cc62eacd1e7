use axum::{extract::State, http::HeaderMap, Json};
use costguard_orchestrator::SelectionPreferences;
use serde::Serialize;
use utoipa::ToSchema;

use crate::{services::preferences as preference_service, util::require_bearer, ApiError, AppState};

#[derive(Debug, Serialize, ToSchema)]
pub struct PreferencesResponse {
    pub success: bool,
    #[schema(value_type = Object)]
    pub preferences: SelectionPreferences,
}

#[utoipa::path(
    get,
    path = "/api/preferences",
    tag = "Preferences",
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Model selection preferences", body = PreferencesResponse),
        (status = 401, description = "Authentication required", body = crate::error::ErrorResponse)
    )
)]
pub async fn get_preferences(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<PreferencesResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let preferences = preference_service::load_preferences(state.db_pool(), user.id)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(PreferencesResponse {
        success: true,
        preferences,
    }))
}

/// Replaces the stored preferences with the request body.
#[utoipa::path(
    put,
    path = "/api/preferences",
    tag = "Preferences",
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Preferences saved", body = PreferencesResponse),
        (status = 400, description = "Weights outside 0..=1 or negative cost cap", body = crate::error::ErrorResponse),
        (status = 401, description = "Authentication required", body = crate::error::ErrorResponse)
    )
)]
pub async fn update_preferences(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(preferences): Json<SelectionPreferences>,
) -> Result<Json<PreferencesResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let preferences = preference_service::save_preferences(state.db_pool(), user.id, preferences)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(PreferencesResponse {
        success: true,
        preferences,
    }))
}
