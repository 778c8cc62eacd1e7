use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    rate_limit::Bucket,
    services::{
        evaluator::{self, TestEvaluation, CREATION_TEST_WINDOW_MINUTES},
        rules::{self as rule_service, NotificationRule, RulePage, RuleQuery, RuleRequest},
    },
    util::require_bearer,
    ApiError, AppState,
};

#[derive(Debug, Serialize, ToSchema)]
pub struct RuleResponse {
    pub success: bool,
    pub data: NotificationRule,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreatedRuleResponse {
    pub success: bool,
    pub data: NotificationRule,
    pub test_evaluation: TestEvaluation,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RuleTestResponse {
    pub success: bool,
    pub rule_id: String,
    pub result: TestEvaluation,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeletedResponse {
    pub success: bool,
    pub message: String,
}

#[utoipa::path(
    get,
    path = "/api/notifications/rules",
    tag = "Notification Rules",
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "One page of the caller's rules", body = RulePage),
        (status = 400, description = "Invalid paging or sort parameters", body = crate::error::ErrorResponse),
        (status = 429, description = "Rules rate limit exceeded", body = crate::error::ErrorResponse)
    )
)]
pub async fn list_rules(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<RuleQuery>,
) -> Result<Json<RulePage>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate_limited(&token, Bucket::Rules).await?;

    let page = rule_service::list_rules(state.db_pool(), user.id, &query)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch notification rules: {}", e);
            ApiError::from(e)
        })?;

    Ok(Json(page))
}

#[utoipa::path(
    post,
    path = "/api/notifications/rules",
    tag = "Notification Rules",
    security(("bearerAuth" = [])),
    request_body = RuleRequest,
    responses(
        (status = 201, description = "Rule created, with a dry run over the last day", body = CreatedRuleResponse),
        (status = 400, description = "Validation failed, invalid cron expression or duplicate name", body = crate::error::ErrorResponse),
        (status = 429, description = "Rules rate limit exceeded", body = crate::error::ErrorResponse)
    )
)]
pub async fn create_rule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RuleRequest>,
) -> Result<(StatusCode, Json<CreatedRuleResponse>), ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate_limited(&token, Bucket::Rules).await?;

    let rule = rule_service::create_rule(state.db_pool(), user.id, req)
        .await
        .map_err(ApiError::from)?;
    let test_evaluation =
        evaluator::test_rule(state.db_pool(), &rule, CREATION_TEST_WINDOW_MINUTES)
            .await
            .map_err(|e| {
                tracing::error!("Failed to evaluate new rule: {}", e);
                ApiError::from(e)
            })?;

    tracing::info!(rule_id = %rule.public_id, user_id = user.id, "notification rule created");

    Ok((
        StatusCode::CREATED,
        Json(CreatedRuleResponse {
            success: true,
            data: rule,
            test_evaluation,
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/api/notifications/rules/{rule_id}",
    tag = "Notification Rules",
    security(("bearerAuth" = [])),
    params(
        ("rule_id" = String, Path, description = "Rule public identifier")
    ),
    responses(
        (status = 200, description = "Rule", body = RuleResponse),
        (status = 404, description = "Rule not found", body = crate::error::ErrorResponse)
    )
)]
pub async fn get_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RuleResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate_limited(&token, Bucket::Rules).await?;

    let rule = rule_service::get_rule(state.db_pool(), user.id, &rule_id)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(RuleResponse {
        success: true,
        data: rule,
    }))
}

#[utoipa::path(
    put,
    path = "/api/notifications/rules/{rule_id}",
    tag = "Notification Rules",
    security(("bearerAuth" = [])),
    params(
        ("rule_id" = String, Path, description = "Rule public identifier")
    ),
    request_body = RuleRequest,
    responses(
        (status = 200, description = "Rule updated", body = RuleResponse),
        (status = 400, description = "Validation failed", body = crate::error::ErrorResponse),
        (status = 404, description = "Rule not found", body = crate::error::ErrorResponse)
    )
)]
pub async fn update_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<RuleRequest>,
) -> Result<Json<RuleResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate_limited(&token, Bucket::Rules).await?;

    let rule = rule_service::update_rule(state.db_pool(), user.id, &rule_id, req)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(RuleResponse {
        success: true,
        data: rule,
    }))
}

#[utoipa::path(
    delete,
    path = "/api/notifications/rules/{rule_id}",
    tag = "Notification Rules",
    security(("bearerAuth" = [])),
    params(
        ("rule_id" = String, Path, description = "Rule public identifier")
    ),
    responses(
        (status = 200, description = "Rule deleted", body = DeletedResponse),
        (status = 404, description = "Rule not found", body = crate::error::ErrorResponse)
    )
)]
pub async fn delete_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DeletedResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate_limited(&token, Bucket::Rules).await?;

    rule_service::delete_rule(state.db_pool(), user.id, &rule_id)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(DeletedResponse {
        success: true,
        message: "Notification rule deleted successfully".to_string(),
    }))
}

#[utoipa::path(
    post,
    path = "/api/notifications/rules/{rule_id}/test",
    tag = "Notification Rules",
    security(("bearerAuth" = [])),
    params(
        ("rule_id" = String, Path, description = "Rule public identifier")
    ),
    responses(
        (status = 200, description = "Dry run over the rule's time window", body = RuleTestResponse),
        (status = 404, description = "Rule not found", body = crate::error::ErrorResponse)
    )
)]
pub async fn test_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RuleTestResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate_limited(&token, Bucket::Rules).await?;

    let rule = rule_service::get_rule(state.db_pool(), user.id, &rule_id)
        .await
        .map_err(ApiError::from)?;
    let result = evaluator::test_rule(state.db_pool(), &rule, rule.time_window)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(RuleTestResponse {
        success: true,
        rule_id: rule.public_id,
        result,
    }))
}
