use costguard_auth::{Permission, User};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use utoipa::ToSchema;

use super::error::ServiceError;
use crate::util::now_rfc3339;

#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct Organization {
    #[serde(skip)]
    pub id: i64,
    #[serde(rename = "id")]
    pub public_id: String,
    pub name: String,
    pub domain: String,
    pub subscription: String,
    pub spending_limit: f64,
    pub alert_threshold: f64,
    pub member_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct Member {
    #[serde(rename = "id")]
    pub public_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub role: String,
    pub created_at: String,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct UpdateOrganizationRequest {
    pub name: Option<String>,
    pub spending_limit: Option<f64>,
    pub alert_threshold: Option<f64>,
}

pub async fn get_organization(
    pool: &SqlitePool,
    organization_id: i64,
) -> Result<Organization, ServiceError> {
    sqlx::query_as::<_, Organization>(
        r#"
        SELECT o.id, o.public_id, o.name, o.domain, o.subscription, o.spending_limit, o.alert_threshold,
               (SELECT COUNT(*) FROM users u WHERE u.organization_id = o.id) AS member_count,
               o.created_at, o.updated_at
        FROM organizations o
        WHERE o.id = ?
        "#,
    )
    .bind(organization_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ServiceError::not_found("Organization not found"))
}

pub async fn list_members(
    pool: &SqlitePool,
    organization_id: i64,
) -> Result<Vec<Member>, ServiceError> {
    let members = sqlx::query_as::<_, Member>(
        r#"
        SELECT public_id, email, display_name, role, created_at
        FROM users
        WHERE organization_id = ?
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await?;

    Ok(members)
}

pub async fn update_organization(
    pool: &SqlitePool,
    user: &User,
    req: UpdateOrganizationRequest,
) -> Result<Organization, ServiceError> {
    if !user.can(Permission::ManageOrganization) {
        return Err(ServiceError::forbidden(
            "Only organization admins can update organization settings",
        ));
    }

    let mut errors = Vec::new();
    if let Some(name) = &req.name {
        if name.trim().is_empty() || name.chars().count() > 255 {
            errors.push("name must be between 1 and 255 characters".to_string());
        }
    }
    if req.spending_limit.is_some_and(|limit| limit < 0.0) {
        errors.push("spending_limit must be zero or greater".to_string());
    }
    if req
        .alert_threshold
        .is_some_and(|threshold| !(0.0..=100.0).contains(&threshold))
    {
        errors.push("alert_threshold must be between 0 and 100".to_string());
    }
    if !errors.is_empty() {
        return Err(ServiceError::invalid("Invalid organization settings", errors));
    }

    sqlx::query(
        r#"
        UPDATE organizations
        SET name = COALESCE(?, name),
            spending_limit = COALESCE(?, spending_limit),
            alert_threshold = COALESCE(?, alert_threshold),
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(req.name.as_deref().map(str::trim))
    .bind(req.spending_limit)
    .bind(req.alert_threshold)
    .bind(now_rfc3339())
    .bind(user.organization_id)
    .execute(pool)
    .await?;

    tracing::info!(organization = %user.organization_public_id, "organization settings updated");
    get_organization(pool, user.organization_id).await
}
