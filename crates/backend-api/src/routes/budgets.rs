use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    services::budgets::{self as budget_service, BudgetQuery, BudgetRequest, BudgetStatus},
    util::require_bearer,
    ApiError, AppState,
};

#[derive(Debug, Serialize, ToSchema)]
pub struct BudgetsResponse {
    pub budgets: Vec<BudgetStatus>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BudgetResponse {
    pub budget: BudgetStatus,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeleteBudgetResponse {
    pub success: bool,
}

#[utoipa::path(
    get,
    path = "/api/budgets",
    tag = "Budgets",
    security(("bearerAuth" = [])),
    params(("active_only" = Option<bool>, Query, description = "Only active budgets (default true)")),
    responses(
        (status = 200, description = "Organization budgets with spend in the current period", body = BudgetsResponse),
        (status = 401, description = "Authentication required", body = crate::error::ErrorResponse)
    )
)]
pub async fn list_budgets(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<BudgetQuery>,
) -> Result<Json<BudgetsResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let budgets = budget_service::list_budgets(state.db_pool(), user.organization_id, &query)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch budgets: {}", e);
            ApiError::from(e)
        })?;

    Ok(Json(BudgetsResponse { budgets }))
}

#[utoipa::path(
    post,
    path = "/api/budgets",
    tag = "Budgets",
    security(("bearerAuth" = [])),
    request_body = BudgetRequest,
    responses(
        (status = 201, description = "Budget created", body = BudgetResponse),
        (status = 400, description = "Invalid name, amount, period or threshold", body = crate::error::ErrorResponse),
        (status = 403, description = "Only admins and managers may create budgets", body = crate::error::ErrorResponse)
    )
)]
pub async fn create_budget(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BudgetRequest>,
) -> Result<(StatusCode, Json<BudgetResponse>), ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let budget = budget_service::create_budget(state.db_pool(), &user, req).await?;

    Ok((StatusCode::CREATED, Json(BudgetResponse { budget })))
}

#[utoipa::path(
    get,
    path = "/api/budgets/{budget_id}",
    tag = "Budgets",
    security(("bearerAuth" = [])),
    params(("budget_id" = String, Path, description = "Budget id")),
    responses(
        (status = 200, description = "Budget with current spend", body = BudgetResponse),
        (status = 404, description = "No such budget in the caller's organization", body = crate::error::ErrorResponse)
    )
)]
pub async fn get_budget(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(budget_id): Path<String>,
) -> Result<Json<BudgetResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let budget = budget_service::get_budget(state.db_pool(), user.organization_id, &budget_id).await?;

    Ok(Json(BudgetResponse { budget }))
}

#[utoipa::path(
    put,
    path = "/api/budgets/{budget_id}",
    tag = "Budgets",
    security(("bearerAuth" = [])),
    params(("budget_id" = String, Path, description = "Budget id")),
    request_body = BudgetRequest,
    responses(
        (status = 200, description = "Budget updated", body = BudgetResponse),
        (status = 400, description = "Invalid fields", body = crate::error::ErrorResponse),
        (status = 403, description = "Only admins and managers may update budgets", body = crate::error::ErrorResponse),
        (status = 404, description = "No such budget in the caller's organization", body = crate::error::ErrorResponse)
    )
)]
pub async fn update_budget(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(budget_id): Path<String>,
    Json(req): Json<BudgetRequest>,
) -> Result<Json<BudgetResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let budget = budget_service::update_budget(state.db_pool(), &user, &budget_id, req).await?;

    Ok(Json(BudgetResponse { budget }))
}

#[utoipa::path(
    delete,
    path = "/api/budgets/{budget_id}",
    tag = "Budgets",
    security(("bearerAuth" = [])),
    params(("budget_id" = String, Path, description = "Budget id")),
    responses(
        (status = 200, description = "Budget deleted", body = DeleteBudgetResponse),
        (status = 403, description = "Only admins may delete budgets", body = crate::error::ErrorResponse),
        (status = 404, description = "No such budget in the caller's organization", body = crate::error::ErrorResponse)
    )
)]
pub async fn delete_budget(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(budget_id): Path<String>,
) -> Result<Json<DeleteBudgetResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    budget_service::delete_budget(state.db_pool(), &user, &budget_id).await?;

    Ok(Json(DeleteBudgetResponse { success: true }))
}
