use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    services::{
        evaluator,
        usage::{
            self as usage_service, RecordUsageRequest, UsageLog, UsageLogPage, UsageLogsQuery,
            UsageQuery, UsageReport,
        },
    },
    util::require_bearer,
    ApiError, AppState,
};

#[derive(Debug, Serialize, ToSchema)]
pub struct RecordUsageResponse {
    pub success: bool,
    pub usage: UsageLog,
}

#[utoipa::path(
    get,
    path = "/api/usage",
    tag = "Usage",
    security(("bearerAuth" = [])),
    params(UsageQuery),
    responses(
        (status = 200, description = "Usage rows and summary for the window", body = UsageReport),
        (status = 401, description = "Authentication required", body = crate::error::ErrorResponse)
    )
)]
pub async fn usage_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UsageQuery>,
) -> Result<Json<UsageReport>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let report = usage_service::usage_report(state.db_pool(), user.id, &query)
        .await
        .map_err(|e| {
            tracing::error!("Failed to build usage report: {}", e);
            ApiError::from(e)
        })?;

    Ok(Json(report))
}

#[utoipa::path(
    post,
    path = "/api/usage",
    tag = "Usage",
    security(("bearerAuth" = [])),
    request_body = RecordUsageRequest,
    responses(
        (status = 201, description = "Usage recorded", body = RecordUsageResponse),
        (status = 400, description = "Provider or model missing", body = crate::error::ErrorResponse),
        (status = 401, description = "Authentication required", body = crate::error::ErrorResponse)
    )
)]
pub async fn record_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RecordUsageRequest>,
) -> Result<(StatusCode, Json<RecordUsageResponse>), ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let entry = usage_service::manual_usage(user.id, user.organization_id, req)?;
    let usage = usage_service::record_usage(state.db_pool(), entry)
        .await
        .map_err(|e| {
            tracing::error!("Failed to record usage: {}", e);
            ApiError::from(e)
        })?;

    if let Err(error) = evaluator::evaluate_rules(state.db_pool(), state.users(), &user).await {
        tracing::warn!(error = %error, "notification rule evaluation failed");
    }

    Ok((
        StatusCode::CREATED,
        Json(RecordUsageResponse {
            success: true,
            usage,
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/api/usage-logs",
    tag = "Usage",
    security(("bearerAuth" = [])),
    params(UsageLogsQuery),
    responses(
        (status = 200, description = "One page of usage logs, newest first", body = UsageLogPage),
        (status = 401, description = "Authentication required", body = crate::error::ErrorResponse)
    )
)]
pub async fn list_usage_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UsageLogsQuery>,
) -> Result<Json<UsageLogPage>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let page = usage_service::list_usage_logs(state.db_pool(), user.id, &query)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(page))
}
