use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    rate_limit::Bucket,
    realtime::ServerEvent,
    services::notifications::{
        self as notification_service, BulkActionResponse, BulkAnalysis, BulkCreateResponse,
        BulkRequest, BulkStatsQuery, Notification, NotificationList, NotificationQuery,
        UpdateNotificationRequest,
    },
    util::require_bearer,
    ApiError, AppState,
};

#[derive(Debug, Serialize, ToSchema)]
pub struct NotificationResponse {
    pub notification: Notification,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UnreadCountResponse {
    pub count: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MarkAllReadResponse {
    pub updated_count: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct NotificationDeletedResponse {
    pub success: bool,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(untagged)]
pub enum BulkResponse {
    Created(BulkCreateResponse),
    Applied(BulkActionResponse),
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(untagged)]
pub enum BulkStatsResponse {
    Count { count: i64 },
    Analysis(BulkAnalysis),
}

#[utoipa::path(
    get,
    path = "/api/notifications",
    tag = "Notifications",
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Notifications, newest first", body = NotificationList),
        (status = 401, description = "Authentication required", body = crate::error::ErrorResponse)
    )
)]
pub async fn list_notifications(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<NotificationQuery>,
) -> Result<Json<NotificationList>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let list = notification_service::list_notifications(state.db_pool(), user.id, &query)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch notifications: {}", e);
            ApiError::from(e)
        })?;

    Ok(Json(list))
}

#[utoipa::path(
    get,
    path = "/api/notifications/unread-count",
    tag = "Notifications",
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Unread notification count", body = UnreadCountResponse)
    )
)]
pub async fn unread_count(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UnreadCountResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let count = notification_service::unread_count(state.db_pool(), user.id)
        .await
        .map_err(|e| {
            tracing::error!("Failed to count unread notifications: {}", e);
            ApiError::from(e)
        })?;

    Ok(Json(UnreadCountResponse { count }))
}

#[utoipa::path(
    get,
    path = "/api/notifications/{notification_id}",
    tag = "Notifications",
    security(("bearerAuth" = [])),
    params(
        ("notification_id" = String, Path, description = "Notification public identifier")
    ),
    responses(
        (status = 200, description = "Notification", body = NotificationResponse),
        (status = 404, description = "Notification not found", body = crate::error::ErrorResponse)
    )
)]
pub async fn get_notification(
    State(state): State<AppState>,
    Path(notification_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<NotificationResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let notification =
        notification_service::get_notification(state.db_pool(), user.id, &notification_id)
            .await
            .map_err(ApiError::from)?;

    Ok(Json(NotificationResponse { notification }))
}

#[utoipa::path(
    patch,
    path = "/api/notifications/{notification_id}",
    tag = "Notifications",
    security(("bearerAuth" = [])),
    params(
        ("notification_id" = String, Path, description = "Notification public identifier")
    ),
    request_body = UpdateNotificationRequest,
    responses(
        (status = 200, description = "Notification updated", body = NotificationResponse),
        (status = 404, description = "Notification not found", body = crate::error::ErrorResponse)
    )
)]
pub async fn update_notification(
    State(state): State<AppState>,
    Path(notification_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<UpdateNotificationRequest>,
) -> Result<Json<NotificationResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let notification = notification_service::update_notification(
        state.db_pool(),
        user.id,
        &notification_id,
        req,
    )
    .await
    .map_err(ApiError::from)?;
    push_unread_count(&state, user.id).await;

    Ok(Json(NotificationResponse { notification }))
}

#[utoipa::path(
    delete,
    path = "/api/notifications/{notification_id}",
    tag = "Notifications",
    security(("bearerAuth" = [])),
    params(
        ("notification_id" = String, Path, description = "Notification public identifier")
    ),
    responses(
        (status = 200, description = "Notification cancelled and hidden", body = NotificationDeletedResponse),
        (status = 404, description = "Notification not found", body = crate::error::ErrorResponse)
    )
)]
pub async fn delete_notification(
    State(state): State<AppState>,
    Path(notification_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<NotificationDeletedResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    notification_service::delete_notification(state.db_pool(), user.id, &notification_id)
        .await
        .map_err(ApiError::from)?;
    push_unread_count(&state, user.id).await;

    Ok(Json(NotificationDeletedResponse { success: true }))
}

#[utoipa::path(
    post,
    path = "/api/notifications/mark-all-read",
    tag = "Notifications",
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Every unread notification marked read", body = MarkAllReadResponse)
    )
)]
pub async fn mark_all_read(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MarkAllReadResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let updated_count = notification_service::mark_all_read(state.db_pool(), user.id)
        .await
        .map_err(|e| {
            tracing::error!("Failed to mark notifications read: {}", e);
            ApiError::from(e)
        })?;
    push_unread_count(&state, user.id).await;

    Ok(Json(MarkAllReadResponse { updated_count }))
}

#[utoipa::path(
    post,
    path = "/api/notifications/bulk",
    tag = "Notifications",
    security(("bearerAuth" = [])),
    request_body = BulkRequest,
    responses(
        (status = 200, description = "Batch created or action applied", body = BulkResponse),
        (status = 400, description = "Invalid batch or action", body = crate::error::ErrorResponse),
        (status = 403, description = "Some ids are not accessible; details list them", body = crate::error::ErrorResponse),
        (status = 429, description = "Bulk rate limit exceeded", body = crate::error::ErrorResponse)
    )
)]
pub async fn bulk_operation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BulkRequest>,
) -> Result<Json<BulkResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate_limited(&token, Bucket::Bulk).await?;

    let response = match req {
        BulkRequest::Create { notifications } => {
            let created =
                notification_service::bulk_create(state.db_pool(), user.id, notifications)
                    .await
                    .map_err(ApiError::from)?;
            BulkResponse::Created(created)
        }
        BulkRequest::Action {
            action,
            notification_ids,
            filters,
        } => {
            let applied = notification_service::bulk_action(
                state.db_pool(),
                user.id,
                &action,
                notification_ids,
                filters,
            )
            .await
            .map_err(ApiError::from)?;
            tracing::info!(
                user_id = %user.public_id,
                action = %applied.action,
                affected = applied.affected_count,
                "bulk notification action applied"
            );
            BulkResponse::Applied(applied)
        }
    };
    push_unread_count(&state, user.id).await;

    Ok(Json(response))
}

#[utoipa::path(
    get,
    path = "/api/notifications/bulk",
    tag = "Notifications",
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Count or breakdown of matching notifications", body = BulkStatsResponse),
        (status = 400, description = "Unknown action", body = crate::error::ErrorResponse)
    )
)]
pub async fn bulk_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<BulkStatsQuery>,
) -> Result<Json<BulkStatsResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let response = match query.action.as_deref() {
        Some("count") => BulkStatsResponse::Count {
            count: notification_service::bulk_count(state.db_pool(), user.id, &query)
                .await
                .map_err(ApiError::from)?,
        },
        Some("analyze") => BulkStatsResponse::Analysis(
            notification_service::bulk_analyze(state.db_pool(), user.id, &query)
                .await
                .map_err(ApiError::from)?,
        ),
        _ => {
            return Err(ApiError::bad_request(
                "Invalid action. Use 'count' or 'analyze'",
            ))
        }
    };

    Ok(Json(response))
}

/// Keeps open sockets in step after a change that may move the unread count.
async fn push_unread_count(state: &AppState, user_id: i64) {
    match notification_service::unread_count(state.db_pool(), user_id).await {
        Ok(count) => {
            state
                .users()
                .send(user_id, ServerEvent::NotificationUnreadCount { count })
                .await
        }
        Err(e) => tracing::warn!(user_id, "Failed to refresh unread count: {}", e),
    }
}
