use axum::{extract::State, http::HeaderMap, Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    services::organization::{self as organization_service, Member, Organization, UpdateOrganizationRequest},
    util::require_bearer,
    ApiError, AppState,
};

#[derive(Debug, Serialize, ToSchema)]
pub struct OrganizationResponse {
    pub organization: Organization,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MembersResponse {
    pub members: Vec<Member>,
}

#[utoipa::path(
    get,
    path = "/api/organization",
    tag = "Organization",
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Organization of the current user", body = OrganizationResponse),
        (status = 401, description = "Authentication required", body = crate::error::ErrorResponse)
    )
)]
pub async fn get_organization(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<OrganizationResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let organization = organization_service::get_organization(state.db_pool(), user.organization_id)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch organization: {}", e);
            ApiError::from(e)
        })?;

    Ok(Json(OrganizationResponse { organization }))
}

#[utoipa::path(
    get,
    path = "/api/organization/members",
    tag = "Organization",
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Members of the organization", body = MembersResponse),
        (status = 401, description = "Authentication required", body = crate::error::ErrorResponse)
    )
)]
pub async fn list_members(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MembersResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let members = organization_service::list_members(state.db_pool(), user.organization_id)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch organization members: {}", e);
            ApiError::from(e)
        })?;

    Ok(Json(MembersResponse { members }))
}

#[utoipa::path(
    patch,
    path = "/api/organization",
    tag = "Organization",
    security(("bearerAuth" = [])),
    request_body = UpdateOrganizationRequest,
    responses(
        (status = 200, description = "Organization updated", body = OrganizationResponse),
        (status = 400, description = "Invalid limits", body = crate::error::ErrorResponse),
        (status = 403, description = "Only admins may update the organization", body = crate::error::ErrorResponse)
    )
)]
pub async fn update_organization(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UpdateOrganizationRequest>,
) -> Result<Json<OrganizationResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let organization = organization_service::update_organization(state.db_pool(), &user, req)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(OrganizationResponse { organization }))
}
