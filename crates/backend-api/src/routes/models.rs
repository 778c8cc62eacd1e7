use axum::{extract::State, http::HeaderMap, Json};
use costguard_orchestrator::{
    catalogue, selector::savings_vs_premium, ModelSpec, OptimizationMode, Provider, Selection,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    services::{api_keys, preferences},
    util::require_bearer,
    ApiError, AppState,
};

#[derive(Debug, Serialize, ToSchema)]
pub struct ModelsResponse {
    #[schema(value_type = Vec<Object>)]
    pub models: Vec<&'static ModelSpec>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RecommendRequest {
    pub prompt: String,
    pub mode: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RecommendResponse {
    pub success: bool,
    #[schema(value_type = Object)]
    pub recommendation: Selection,
    pub savings_vs_premium: f64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AvailableModel {
    pub id: String,
    pub name: String,
    pub provider: String,
    /// USD per one million input tokens.
    pub input_price: f64,
    /// USD per one million output tokens.
    pub output_price: f64,
    pub context_window: u64,
    pub available: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AvailableModelsResponse {
    pub success: bool,
    pub models: Vec<AvailableModel>,
    pub providers: Vec<String>,
}

#[utoipa::path(
    get,
    path = "/api/models",
    tag = "Models",
    responses(
        (status = 200, description = "Full model catalogue", body = ModelsResponse)
    )
)]
pub async fn list_models() -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: catalogue::all_models().iter().collect(),
    })
}

#[utoipa::path(
    post,
    path = "/api/models/recommend",
    tag = "Models",
    security(("bearerAuth" = [])),
    request_body = RecommendRequest,
    responses(
        (status = 200, description = "Recommended model for the prompt", body = RecommendResponse),
        (status = 400, description = "Empty prompt, unknown mode or no eligible model", body = crate::error::ErrorResponse),
        (status = 401, description = "Authentication required", body = crate::error::ErrorResponse)
    )
)]
pub async fn recommend_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RecommendRequest>,
) -> Result<Json<RecommendResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    if req.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("Prompt is required"));
    }

    let mut prefs = preferences::load_preferences(state.db_pool(), user.id)
        .await
        .map_err(ApiError::from)?;
    if let Some(mode) = req.mode.as_deref() {
        prefs.mode = OptimizationMode::parse(mode)
            .ok_or_else(|| ApiError::bad_request("Invalid mode"))?;
    }

    let recommendation = state.orchestrator().recommend(&req.prompt, &[], &prefs)?;
    let savings = savings_vs_premium(
        recommendation.recommended,
        recommendation.analysis.estimated_tokens,
    );

    Ok(Json(RecommendResponse {
        success: true,
        recommendation,
        savings_vs_premium: savings,
    }))
}

#[utoipa::path(
    get,
    path = "/api/chat/models",
    tag = "Models",
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Models usable with the caller's active keys", body = AvailableModelsResponse),
        (status = 401, description = "Authentication required", body = crate::error::ErrorResponse)
    )
)]
pub async fn available_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AvailableModelsResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let providers = api_keys::active_providers(state.db_pool(), user.id)
        .await
        .map_err(ApiError::from)?;

    let models = providers
        .iter()
        .flat_map(|provider| catalogue::models_for(*provider))
        .map(|spec| AvailableModel {
            id: spec.model.to_string(),
            name: spec.qualified_name(),
            provider: spec.provider.as_str().to_string(),
            input_price: per_million(spec.input_cost),
            output_price: per_million(spec.output_cost),
            context_window: spec.context_window,
            available: true,
        })
        .collect();

    Ok(Json(AvailableModelsResponse {
        success: true,
        models,
        providers: providers
            .iter()
            .map(Provider::as_str)
            .map(str::to_string)
            .collect(),
    }))
}

/// Catalogue prices are per thousand tokens.
fn per_million(per_thousand: f64) -> f64 {
    (per_thousand * 1000.0 * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::per_million;

    #[test]
    fn prices_scale_to_one_million_tokens() {
        assert_eq!(per_million(0.0025), 2.5);
        assert_eq!(per_million(0.00015), 0.15);
    }
}
