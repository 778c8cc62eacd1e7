use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use costguard_auth::{Permission, User};
use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    services::templates::{
        self as template_service, CreateTemplateRequest, NotificationTemplate, RenderedTemplate,
        TemplateFilter, UpdateTemplateRequest,
    },
    util::require_bearer,
    ApiError, AppState,
};

#[derive(Debug, Serialize, ToSchema)]
pub struct TemplatesResponse {
    pub success: bool,
    pub data: Vec<NotificationTemplate>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TemplateResponse {
    pub success: bool,
    pub data: NotificationTemplate,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PreviewResponse {
    pub success: bool,
    pub preview: RenderedTemplate,
}

fn require_template_admin(user: &User) -> Result<(), ApiError> {
    if user.can(Permission::ManageOrganization) {
        Ok(())
    } else {
        Err(ApiError::forbidden(
            "Only organization admins can manage notification templates",
        ))
    }
}

#[utoipa::path(
    get,
    path = "/api/notifications/templates",
    tag = "Notification Templates",
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Templates matching the type and channel filters", body = TemplatesResponse),
        (status = 401, description = "Authentication required", body = crate::error::ErrorResponse)
    )
)]
pub async fn list_templates(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<TemplateFilter>,
) -> Result<Json<TemplatesResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    state.authenticate(&token).await?;

    let data = template_service::list_templates(state.db_pool(), &filter)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch notification templates: {}", e);
            ApiError::from(e)
        })?;

    Ok(Json(TemplatesResponse {
        success: true,
        data,
    }))
}

#[utoipa::path(
    post,
    path = "/api/notifications/templates",
    tag = "Notification Templates",
    security(("bearerAuth" = [])),
    request_body = CreateTemplateRequest,
    responses(
        (status = 201, description = "Template created", body = TemplateResponse),
        (status = 400, description = "Template failed validation", body = crate::error::ErrorResponse),
        (status = 403, description = "Caller is not an organization admin", body = crate::error::ErrorResponse)
    )
)]
pub async fn create_template(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateTemplateRequest>,
) -> Result<(StatusCode, Json<TemplateResponse>), ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;
    require_template_admin(&user)?;

    let template = template_service::create_template(state.db_pool(), req)
        .await
        .map_err(ApiError::from)?;

    Ok((
        StatusCode::CREATED,
        Json(TemplateResponse {
            success: true,
            data: template,
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/api/notifications/templates/{template_id}",
    tag = "Notification Templates",
    security(("bearerAuth" = [])),
    params(
        ("template_id" = String, Path, description = "Template public identifier")
    ),
    responses(
        (status = 200, description = "Template", body = TemplateResponse),
        (status = 404, description = "Template not found", body = crate::error::ErrorResponse)
    )
)]
pub async fn get_template(
    State(state): State<AppState>,
    Path(template_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TemplateResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    state.authenticate(&token).await?;

    let template = template_service::get_template(state.db_pool(), &template_id)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(TemplateResponse {
        success: true,
        data: template,
    }))
}

#[utoipa::path(
    put,
    path = "/api/notifications/templates/{template_id}",
    tag = "Notification Templates",
    security(("bearerAuth" = [])),
    params(
        ("template_id" = String, Path, description = "Template public identifier")
    ),
    request_body = UpdateTemplateRequest,
    responses(
        (status = 200, description = "Template updated", body = TemplateResponse),
        (status = 400, description = "Template failed validation", body = crate::error::ErrorResponse),
        (status = 403, description = "Caller is not an organization admin", body = crate::error::ErrorResponse),
        (status = 404, description = "Template not found", body = crate::error::ErrorResponse)
    )
)]
pub async fn update_template(
    State(state): State<AppState>,
    Path(template_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<UpdateTemplateRequest>,
) -> Result<Json<TemplateResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;
    require_template_admin(&user)?;

    let template = template_service::update_template(state.db_pool(), &template_id, req)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(TemplateResponse {
        success: true,
        data: template,
    }))
}

#[utoipa::path(
    delete,
    path = "/api/notifications/templates/{template_id}",
    tag = "Notification Templates",
    security(("bearerAuth" = [])),
    params(
        ("template_id" = String, Path, description = "Template public identifier")
    ),
    responses(
        (status = 204, description = "Template deleted"),
        (status = 403, description = "Caller is not an organization admin", body = crate::error::ErrorResponse),
        (status = 404, description = "Template not found", body = crate::error::ErrorResponse)
    )
)]
pub async fn delete_template(
    State(state): State<AppState>,
    Path(template_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;
    require_template_admin(&user)?;

    template_service::delete_template(state.db_pool(), &template_id)
        .await
        .map_err(ApiError::from)?;

    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/notifications/templates/{template_id}/preview",
    tag = "Notification Templates",
    security(("bearerAuth" = [])),
    params(
        ("template_id" = String, Path, description = "Template public identifier")
    ),
    responses(
        (status = 200, description = "Template rendered with sample variables", body = PreviewResponse),
        (status = 404, description = "Template not found", body = crate::error::ErrorResponse)
    )
)]
pub async fn preview_template(
    State(state): State<AppState>,
    Path(template_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PreviewResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    state.authenticate(&token).await?;

    let preview = template_service::preview_template(state.db_pool(), &template_id)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(PreviewResponse {
        success: true,
        preview,
    }))
}
