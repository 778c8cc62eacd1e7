use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{types::Json, FromRow, SqlitePool};
use thiserror::Error;
use utoipa::ToSchema;

use super::{
    error::ServiceError,
    renderer,
    vocabulary::{Channel, NotificationType},
};
use crate::util::now_rfc3339;

const DEFAULT_LOCALE: &str = "en";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Template not found: {notification_type}/{channel}/{locale}")]
    NotFound {
        notification_type: String,
        channel: String,
        locale: String,
    },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl From<TemplateError> for ServiceError {
    fn from(err: TemplateError) -> Self {
        match err {
            TemplateError::NotFound { .. } => ServiceError::not_found(err.to_string()),
            TemplateError::Database(db) => ServiceError::Database(db),
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct NotificationTemplate {
    #[serde(skip)]
    pub id: i64,
    #[serde(rename = "id")]
    pub public_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub channel: String,
    pub subject: Option<String>,
    pub body_template: String,
    pub body_html: Option<String>,
    #[schema(value_type = Object)]
    pub brand: Json<Value>,
    pub locale: String,
    pub is_default: bool,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateTemplateRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub channel: String,
    pub subject: Option<String>,
    pub body_template: String,
    pub body_html: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub brand: Option<Value>,
    pub locale: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct UpdateTemplateRequest {
    pub name: Option<String>,
    pub subject: Option<String>,
    pub body_template: Option<String>,
    pub body_html: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub brand: Option<Value>,
    pub is_default: Option<bool>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct TemplateFilter {
    #[serde(rename = "type")]
    pub notification_type: Option<String>,
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RenderedTemplate {
    pub subject: Option<String>,
    pub body: String,
    pub html: Option<String>,
    pub template_id: String,
    pub template_name: String,
    pub locale: String,
}

const COLUMNS: &str = "id, public_id, name, notification_type, channel, subject, body_template, body_html, brand, locale, is_default, is_active, created_at, updated_at";

pub async fn list_templates(
    pool: &SqlitePool,
    filter: &TemplateFilter,
) -> Result<Vec<NotificationTemplate>, ServiceError> {
    let templates = sqlx::query_as::<_, NotificationTemplate>(&format!(
        r#"
        SELECT {COLUMNS}
        FROM notification_templates
        WHERE (?1 IS NULL OR notification_type = ?1)
          AND (?2 IS NULL OR channel = ?2)
        ORDER BY notification_type, channel, locale, name
        "#
    ))
    .bind(&filter.notification_type)
    .bind(&filter.channel)
    .fetch_all(pool)
    .await?;

    Ok(templates)
}

pub async fn get_template(
    pool: &SqlitePool,
    public_id: &str,
) -> Result<NotificationTemplate, ServiceError> {
    sqlx::query_as::<_, NotificationTemplate>(&format!(
        "SELECT {COLUMNS} FROM notification_templates WHERE public_id = ?"
    ))
    .bind(public_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ServiceError::not_found("Template not found"))
}

pub async fn create_template(
    pool: &SqlitePool,
    req: CreateTemplateRequest,
) -> Result<NotificationTemplate, ServiceError> {
    let mut errors = Vec::new();
    if req.name.trim().is_empty() {
        errors.push("name is required".to_string());
    }
    if NotificationType::parse(&req.notification_type).is_none() {
        errors.push(format!("Invalid notification type: {}", req.notification_type));
    }
    if Channel::parse(&req.channel).is_none() {
        errors.push(format!("Invalid channel: {}", req.channel));
    }
    errors.extend(syntax_errors(
        req.subject.as_deref(),
        Some(&req.body_template),
        req.body_html.as_deref(),
    ));
    if !errors.is_empty() {
        return Err(ServiceError::invalid("Template validation failed", errors));
    }

    let public_id = costguard_auth::new_public_id();
    let now = now_rfc3339();
    let brand = req.brand.unwrap_or_else(|| Value::Object(Default::default()));

    let result = sqlx::query(
        r#"
        INSERT INTO notification_templates
            (public_id, name, notification_type, channel, subject, body_template, body_html, brand, locale, is_default, is_active, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
        "#,
    )
    .bind(&public_id)
    .bind(req.name.trim())
    .bind(&req.notification_type)
    .bind(&req.channel)
    .bind(&req.subject)
    .bind(&req.body_template)
    .bind(&req.body_html)
    .bind(Json(&brand))
    .bind(req.locale.as_deref().unwrap_or(DEFAULT_LOCALE))
    .bind(req.is_default)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await;

    match result {
        Ok(_) => get_template(pool, &public_id).await,
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(
            ServiceError::bad_request("A template with this name already exists for this type, channel and locale"),
        ),
        Err(err) => Err(err.into()),
    }
}

pub async fn update_template(
    pool: &SqlitePool,
    public_id: &str,
    req: UpdateTemplateRequest,
) -> Result<NotificationTemplate, ServiceError> {
    get_template(pool, public_id).await?;

    let errors = syntax_errors(
        req.subject.as_deref(),
        req.body_template.as_deref(),
        req.body_html.as_deref(),
    );
    if !errors.is_empty() {
        return Err(ServiceError::invalid("Template validation failed", errors));
    }

    sqlx::query(
        r#"
        UPDATE notification_templates
        SET name = COALESCE(?, name),
            subject = COALESCE(?, subject),
            body_template = COALESCE(?, body_template),
            body_html = COALESCE(?, body_html),
            brand = COALESCE(?, brand),
            is_default = COALESCE(?, is_default),
            is_active = COALESCE(?, is_active),
            updated_at = ?
        WHERE public_id = ?
        "#,
    )
    .bind(&req.name)
    .bind(&req.subject)
    .bind(&req.body_template)
    .bind(&req.body_html)
    .bind(req.brand.as_ref().map(Json))
    .bind(req.is_default)
    .bind(req.is_active)
    .bind(now_rfc3339())
    .bind(public_id)
    .execute(pool)
    .await?;

    get_template(pool, public_id).await
}

pub async fn delete_template(pool: &SqlitePool, public_id: &str) -> Result<(), ServiceError> {
    let result = sqlx::query("DELETE FROM notification_templates WHERE public_id = ?")
        .bind(public_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(ServiceError::not_found("Template not found"));
    }

    Ok(())
}

/// Picks the active template for a type and channel: the requested locale
/// first, then English, then whichever template is flagged as the default.
pub async fn find_template(
    pool: &SqlitePool,
    notification_type: &str,
    channel: &str,
    locale: &str,
) -> Result<NotificationTemplate, TemplateError> {
    sqlx::query_as::<_, NotificationTemplate>(&format!(
        r#"
        SELECT {COLUMNS}
        FROM notification_templates
        WHERE notification_type = ?1
          AND channel = ?2
          AND is_active = 1
          AND (locale = ?3 OR locale = ?4 OR is_default = 1)
        ORDER BY CASE WHEN locale = ?3 THEN 0 WHEN locale = ?4 THEN 1 ELSE 2 END,
                 is_default DESC,
                 id ASC
        LIMIT 1
        "#
    ))
    .bind(notification_type)
    .bind(channel)
    .bind(locale)
    .bind(DEFAULT_LOCALE)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| TemplateError::NotFound {
        notification_type: notification_type.to_string(),
        channel: channel.to_string(),
        locale: locale.to_string(),
    })
}

pub fn render_template(template: &NotificationTemplate, variables: &Value) -> RenderedTemplate {
    let variables = renderer::with_branding(variables, &template.brand.0);

    RenderedTemplate {
        subject: template
            .subject
            .as_deref()
            .map(|subject| renderer::render(subject, &variables)),
        body: renderer::render(&template.body_template, &variables),
        html: template
            .body_html
            .as_deref()
            .map(|html| renderer::render(html, &variables)),
        template_id: template.public_id.clone(),
        template_name: template.name.clone(),
        locale: template.locale.clone(),
    }
}

pub async fn preview_template(
    pool: &SqlitePool,
    public_id: &str,
) -> Result<RenderedTemplate, ServiceError> {
    let template = get_template(pool, public_id).await?;
    let variables = renderer::preview_variables(&template.notification_type);
    Ok(render_template(&template, &variables))
}

fn syntax_errors(subject: Option<&str>, body: Option<&str>, html: Option<&str>) -> Vec<String> {
    [("subject", subject), ("body_template", body), ("body_html", html)]
        .into_iter()
        .filter_map(|(field, text)| text.map(|text| (field, text)))
        .flat_map(|(field, text)| {
            renderer::validate(text)
                .into_iter()
                .map(move |error| format!("{field}: {error}"))
        })
        .collect()
}

struct BuiltinTemplate {
    name: &'static str,
    notification_type: NotificationType,
    channel: Channel,
    subject: Option<&'static str>,
    body: &'static str,
}

const BUILTIN_TEMPLATES: &[BuiltinTemplate] = &[
    BuiltinTemplate {
        name: "cost-alert-in-app",
        notification_type: NotificationType::CostAlert,
        channel: Channel::InApp,
        subject: Some("Cost alert: {{rule.name}}"),
        body: "Spend reached {{formatCurrency context.currentCost}} in the last {{context.timeframe}} (threshold {{formatCurrency context.threshold}}).",
    },
    BuiltinTemplate {
        name: "cost-alert-email",
        notification_type: NotificationType::CostAlert,
        channel: Channel::Email,
        subject: Some("Cost Alert: {{organization.name}} approaching spend limit"),
        body: "Hello {{default user.name \"there\"}},\n\nYour AI usage costs are approaching the configured threshold.\n\nCurrent spend: {{formatCurrency context.currentCost}}\nThreshold: {{formatCurrency context.threshold}}\nProvider: {{default context.provider \"all\"}}\nTime period: {{context.timeframe}}\n\n{{branding.footerText}}",
    },
    BuiltinTemplate {
        name: "usage-alert-in-app",
        notification_type: NotificationType::UsageAlert,
        channel: Channel::InApp,
        subject: Some("Usage alert: {{rule.name}}"),
        body: "{{formatNumber context.totalTokens}} tokens across {{formatNumber context.requestCount}} requests in the last {{context.timeframe}}.",
    },
    BuiltinTemplate {
        name: "budget-warning-in-app",
        notification_type: NotificationType::BudgetWarning,
        channel: Channel::InApp,
        subject: Some("Budget warning: {{rule.name}}"),
        body: "You have spent {{formatCurrency context.currentCost}} of your {{formatCurrency context.threshold}} budget in the last {{context.timeframe}}.",
    },
];

/// Installs the built-in templates, skipping any that already exist.
/// Returns how many were inserted.
pub async fn seed_builtin_templates(pool: &SqlitePool) -> Result<u64, ServiceError> {
    let now = now_rfc3339();
    let brand = serde_json::json!({
        "brandName": "AI Cost Guardian",
        "primaryColor": "#3b82f6",
        "footerText": "Manage your AI costs intelligently"
    });

    let mut inserted = 0;
    for template in BUILTIN_TEMPLATES {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO notification_templates
                (public_id, name, notification_type, channel, subject, body_template, body_html, brand, locale, is_default, is_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, NULL, ?, ?, 1, 1, ?, ?)
            "#,
        )
        .bind(costguard_auth::new_public_id())
        .bind(template.name)
        .bind(template.notification_type.as_str())
        .bind(template.channel.as_str())
        .bind(template.subject)
        .bind(template.body)
        .bind(Json(&brand))
        .bind(DEFAULT_LOCALE)
        .bind(&now)
        .bind(&now)
        .execute(pool)
        .await?;
        inserted += result.rows_affected();
    }

    tracing::info!(inserted, "built-in notification templates seeded");
    Ok(inserted)
}
