use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{types::Json, FromRow, QueryBuilder, Sqlite, SqlitePool};
use utoipa::ToSchema;

use super::{
    error::ServiceError,
    vocabulary::{Channel, NotificationType, Priority},
    page_offset, Pagination,
};
use crate::util::now_rfc3339;

const MAX_PAGE_SIZE: i64 = 50;
const DEFAULT_PAGE_SIZE: i64 = 20;
/// Upper bound for rule windows and cooldowns: one year in minutes.
pub const MAX_WINDOW_MINUTES: i64 = 525_600;
const MAX_PER_DAY: i64 = 1000;

static CRON_FIELDS: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[0-9\-*/,#?\w\s]+$").ok());

const COMPARISON_OPS: &[&str] = &["gt", "gte", "lt", "lte", "eq"];
const CUSTOM_OPS: &[&str] = &["gt", "gte", "lt", "lte", "eq", "neq", "contains"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RuleConditions {
    pub cost_threshold: Option<f64>,
    pub usage_threshold: Option<i64>,
    #[serde(default)]
    pub provider_filters: Vec<String>,
    #[serde(default)]
    pub model_filters: Vec<String>,
    #[serde(default)]
    pub custom_conditions: Vec<CustomCondition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CustomCondition {
    /// Dotted path into the evaluation context, e.g. `current_cost`.
    pub field: String,
    pub operator: String,
    #[schema(value_type = Object)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChannelConfig {
    #[serde(rename = "type")]
    pub channel_type: String,
    pub destination: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub include_details: bool,
    pub format: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl ChannelConfig {
    fn in_app() -> Self {
        Self {
            channel_type: Channel::InApp.as_str().to_string(),
            destination: None,
            enabled: true,
            include_details: true,
            format: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct NotificationRule {
    #[serde(skip)]
    pub id: i64,
    #[serde(rename = "id")]
    pub public_id: String,
    #[serde(skip)]
    pub user_id: i64,
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub rule_type: String,
    pub enabled: bool,
    #[schema(value_type = RuleConditions)]
    pub conditions: Json<RuleConditions>,
    pub threshold: Option<f64>,
    pub comparison_op: Option<String>,
    pub time_window: i64,
    pub schedule: Option<String>,
    pub timezone: String,
    pub cooldown_minutes: i64,
    pub max_per_day: i64,
    pub priority: String,
    #[schema(value_type = Vec<String>)]
    pub tags: Json<Vec<String>>,
    #[schema(value_type = Vec<ChannelConfig>)]
    pub channels: Json<Vec<ChannelConfig>>,
    pub last_triggered_at: Option<String>,
    #[serde(skip)]
    pub trigger_day: Option<String>,
    pub trigger_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct RuleListItem {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub rule: NotificationRule,
    pub notification_count: i64,
    pub channel_count: i64,
}

/// Body of both create and update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct RuleRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub rule_type: Option<String>,
    pub enabled: Option<bool>,
    pub conditions: Option<RuleConditions>,
    pub threshold: Option<f64>,
    pub comparison_op: Option<String>,
    pub time_window: Option<i64>,
    pub schedule: Option<String>,
    pub timezone: Option<String>,
    pub cooldown_minutes: Option<i64>,
    pub max_per_day: Option<i64>,
    pub priority: Option<String>,
    pub tags: Option<Vec<String>>,
    pub channels: Option<Vec<ChannelConfig>>,
}

#[derive(Debug, Deserialize)]
pub struct RuleQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    #[serde(rename = "type")]
    pub rule_type: Option<String>,
    pub enabled: Option<bool>,
    pub search: Option<String>,
    /// Comma separated; a rule matches when it carries any of them.
    pub tags: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RulePage {
    pub success: bool,
    pub data: Vec<RuleListItem>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, PartialEq)]
struct RuleDraft {
    name: String,
    description: Option<String>,
    rule_type: String,
    enabled: bool,
    conditions: RuleConditions,
    threshold: Option<f64>,
    comparison_op: Option<String>,
    time_window: i64,
    schedule: Option<String>,
    timezone: String,
    cooldown_minutes: i64,
    max_per_day: i64,
    priority: String,
    tags: Vec<String>,
    channels: Vec<ChannelConfig>,
}

impl Default for RuleDraft {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: None,
            rule_type: String::new(),
            enabled: true,
            conditions: RuleConditions::default(),
            threshold: None,
            comparison_op: None,
            time_window: 1440,
            schedule: None,
            timezone: "UTC".to_string(),
            cooldown_minutes: 60,
            max_per_day: 100,
            priority: Priority::Medium.as_str().to_string(),
            tags: Vec::new(),
            channels: vec![ChannelConfig::in_app()],
        }
    }
}

impl From<&NotificationRule> for RuleDraft {
    fn from(rule: &NotificationRule) -> Self {
        Self {
            name: rule.name.clone(),
            description: rule.description.clone(),
            rule_type: rule.rule_type.clone(),
            enabled: rule.enabled,
            conditions: rule.conditions.0.clone(),
            threshold: rule.threshold,
            comparison_op: rule.comparison_op.clone(),
            time_window: rule.time_window,
            schedule: rule.schedule.clone(),
            timezone: rule.timezone.clone(),
            cooldown_minutes: rule.cooldown_minutes,
            max_per_day: rule.max_per_day,
            priority: rule.priority.clone(),
            tags: rule.tags.0.clone(),
            channels: rule.channels.0.clone(),
        }
    }
}

impl RuleDraft {
    fn apply(mut self, req: RuleRequest) -> Self {
        if let Some(name) = req.name {
            self.name = name.trim().to_string();
        }
        if req.description.is_some() {
            self.description = req.description;
        }
        if let Some(rule_type) = req.rule_type {
            self.rule_type = rule_type;
        }
        if let Some(enabled) = req.enabled {
            self.enabled = enabled;
        }
        if let Some(conditions) = req.conditions {
            self.conditions = conditions;
        }
        if req.threshold.is_some() {
            self.threshold = req.threshold;
        }
        if req.comparison_op.is_some() {
            self.comparison_op = req.comparison_op;
        }
        if let Some(time_window) = req.time_window {
            self.time_window = time_window;
        }
        if req.schedule.is_some() {
            self.schedule = req.schedule.filter(|schedule| !schedule.trim().is_empty());
        }
        if let Some(timezone) = req.timezone {
            self.timezone = timezone;
        }
        if let Some(cooldown) = req.cooldown_minutes {
            self.cooldown_minutes = cooldown;
        }
        if let Some(max_per_day) = req.max_per_day {
            self.max_per_day = max_per_day;
        }
        if let Some(priority) = req.priority {
            self.priority = priority;
        }
        if let Some(tags) = req.tags {
            self.tags = tags;
        }
        if let Some(channels) = req.channels {
            self.channels = channels;
        }
        self
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let name_len = self.name.chars().count();
        if name_len == 0 || name_len > 255 {
            errors.push("name: must be between 1 and 255 characters".to_string());
        }
        if self
            .description
            .as_deref()
            .is_some_and(|description| description.chars().count() > 1000)
        {
            errors.push("description: must be at most 1000 characters".to_string());
        }
        if NotificationType::parse(&self.rule_type).is_none() {
            errors.push(format!("type: invalid notification type '{}'", self.rule_type));
        }
        if let Some(op) = &self.comparison_op {
            if !COMPARISON_OPS.contains(&op.as_str()) {
                errors.push(format!("comparison_op: invalid operator '{op}'"));
            }
        }
        if !(1..=MAX_WINDOW_MINUTES).contains(&self.time_window) {
            errors.push(format!(
                "time_window: must be between 1 and {MAX_WINDOW_MINUTES} minutes"
            ));
        }
        if !(0..=MAX_WINDOW_MINUTES).contains(&self.cooldown_minutes) {
            errors.push(format!(
                "cooldown_minutes: must be between 0 and {MAX_WINDOW_MINUTES}"
            ));
        }
        if !(1..=MAX_PER_DAY).contains(&self.max_per_day) {
            errors.push(format!("max_per_day: must be between 1 and {MAX_PER_DAY}"));
        }
        if Priority::parse(&self.priority).is_none() {
            errors.push(format!("priority: invalid priority '{}'", self.priority));
        }
        if self.timezone.trim().is_empty() {
            errors.push("timezone: must not be empty".to_string());
        }
        if self.channels.is_empty() {
            errors.push("channels: at least one channel is required".to_string());
        }
        for (index, channel) in self.channels.iter().enumerate() {
            if Channel::parse(&channel.channel_type).is_none() {
                errors.push(format!(
                    "channels[{index}].type: invalid channel '{}'",
                    channel.channel_type
                ));
            }
        }
        if self.conditions.cost_threshold.is_some_and(|cost| cost < 0.0) {
            errors.push("conditions.cost_threshold: must be zero or greater".to_string());
        }
        if self.conditions.usage_threshold.is_some_and(|tokens| tokens < 0) {
            errors.push("conditions.usage_threshold: must be zero or greater".to_string());
        }
        for (index, condition) in self.conditions.custom_conditions.iter().enumerate() {
            if condition.field.trim().is_empty() {
                errors.push(format!("conditions.custom_conditions[{index}].field: is required"));
            }
            if !CUSTOM_OPS.contains(&condition.operator.as_str()) {
                errors.push(format!(
                    "conditions.custom_conditions[{index}].operator: invalid operator '{}'",
                    condition.operator
                ));
            }
        }
        errors
    }
}

/// Five or six whitespace separated fields drawn from the cron alphabet.
pub fn is_valid_cron(expression: &str) -> bool {
    let Some(alphabet) = CRON_FIELDS.as_ref() else {
        return false;
    };
    let fields = expression.split_whitespace().count();
    (fields == 5 || fields == 6) && alphabet.is_match(expression)
}

const COLUMNS: &str = "r.id, r.public_id, r.user_id, r.name, r.description, r.rule_type, r.enabled, r.conditions, r.threshold, r.comparison_op, r.time_window, r.schedule, r.timezone, r.cooldown_minutes, r.max_per_day, r.priority, r.tags, r.channels, r.last_triggered_at, r.trigger_day, r.trigger_count, r.created_at, r.updated_at";

pub async fn list_rules(
    pool: &SqlitePool,
    user_id: i64,
    query: &RuleQuery,
) -> Result<RulePage, ServiceError> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    if limit > MAX_PAGE_SIZE {
        return Err(ServiceError::bad_request("Limit cannot exceed 50"));
    }
    let limit = limit.max(1);
    let page = query.page.unwrap_or(1).max(1);
    let offset = page_offset(page, limit)?;

    let sort_column = match query.sort_by.as_deref() {
        Some("name") => "r.name",
        Some("updated_at") => "r.updated_at",
        Some("priority") => "r.priority",
        Some("last_triggered_at") => "r.last_triggered_at",
        Some("trigger_count") => "r.trigger_count",
        _ => "r.created_at",
    };
    let sort_order = match query.sort_order.as_deref() {
        Some(order) if order.eq_ignore_ascii_case("asc") => "ASC",
        _ => "DESC",
    };

    let mut select: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        r#"
        SELECT {COLUMNS},
               (SELECT COUNT(*) FROM notifications n WHERE n.rule_id = r.id) AS notification_count,
               json_array_length(r.channels) AS channel_count
        FROM notification_rules r
        "#
    ));
    push_rule_filters(&mut select, user_id, query);
    select
        .push(format!(" ORDER BY {sort_column} {sort_order}, r.id {sort_order} LIMIT "))
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);
    let data = select
        .build_query_as::<RuleListItem>()
        .fetch_all(pool)
        .await?;

    let mut count: QueryBuilder<Sqlite> =
        QueryBuilder::new("SELECT COUNT(*) FROM notification_rules r");
    push_rule_filters(&mut count, user_id, query);
    let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

    Ok(RulePage {
        success: true,
        data,
        pagination: Pagination::new(page, limit, total),
    })
}

fn push_rule_filters(builder: &mut QueryBuilder<Sqlite>, user_id: i64, query: &RuleQuery) {
    builder.push(" WHERE r.user_id = ").push_bind(user_id);
    if let Some(rule_type) = &query.rule_type {
        builder.push(" AND r.rule_type = ").push_bind(rule_type.clone());
    }
    if let Some(enabled) = query.enabled {
        builder.push(" AND r.enabled = ").push_bind(enabled);
    }
    if let Some(search) = query.search.as_deref().filter(|s| !s.trim().is_empty()) {
        let pattern = format!("%{}%", search.trim());
        builder
            .push(" AND (r.name LIKE ")
            .push_bind(pattern.clone())
            .push(" OR r.description LIKE ")
            .push_bind(pattern)
            .push(")");
    }
    let tags: Vec<&str> = query
        .tags
        .as_deref()
        .map(|tags| {
            tags.split(',')
                .map(str::trim)
                .filter(|tag| !tag.is_empty())
                .collect()
        })
        .unwrap_or_default();
    if !tags.is_empty() {
        builder.push(" AND EXISTS (SELECT 1 FROM json_each(r.tags) WHERE json_each.value IN (");
        let mut separated = builder.separated(", ");
        for tag in tags {
            separated.push_bind(tag.to_string());
        }
        separated.push_unseparated("))");
    }
}

pub async fn get_rule(
    pool: &SqlitePool,
    user_id: i64,
    public_id: &str,
) -> Result<NotificationRule, ServiceError> {
    sqlx::query_as::<_, NotificationRule>(&format!(
        "SELECT {COLUMNS} FROM notification_rules r WHERE r.public_id = ? AND r.user_id = ?"
    ))
    .bind(public_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ServiceError::not_found("Notification rule not found"))
}

/// Enabled rules of the user, oldest first.
pub async fn enabled_rules(
    pool: &SqlitePool,
    user_id: i64,
) -> Result<Vec<NotificationRule>, ServiceError> {
    let rules = sqlx::query_as::<_, NotificationRule>(&format!(
        "SELECT {COLUMNS} FROM notification_rules r WHERE r.user_id = ? AND r.enabled = 1 ORDER BY r.id"
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rules)
}

async fn check_draft(
    pool: &SqlitePool,
    user_id: i64,
    draft: &RuleDraft,
    existing_id: Option<i64>,
) -> Result<(), ServiceError> {
    let errors = draft.validate();
    if !errors.is_empty() {
        return Err(ServiceError::invalid("Validation failed", errors));
    }
    if let Some(schedule) = &draft.schedule {
        if !is_valid_cron(schedule) {
            return Err(ServiceError::bad_request("Invalid cron expression"));
        }
    }

    let duplicate: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM notification_rules WHERE user_id = ? AND name = ? AND (? IS NULL OR id != ?)",
    )
    .bind(user_id)
    .bind(&draft.name)
    .bind(existing_id)
    .bind(existing_id)
    .fetch_optional(pool)
    .await?;
    if duplicate.is_some() {
        return Err(ServiceError::conflict("Rule name already exists"));
    }

    Ok(())
}

pub async fn create_rule(
    pool: &SqlitePool,
    user_id: i64,
    req: RuleRequest,
) -> Result<NotificationRule, ServiceError> {
    let draft = RuleDraft::default().apply(req);
    check_draft(pool, user_id, &draft, None).await?;

    let public_id = costguard_auth::new_public_id();
    let now = now_rfc3339();

    sqlx::query(
        r#"
        INSERT INTO notification_rules
            (public_id, user_id, name, description, rule_type, enabled, conditions, threshold, comparison_op,
             time_window, schedule, timezone, cooldown_minutes, max_per_day, priority, tags, channels,
             created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&public_id)
    .bind(user_id)
    .bind(&draft.name)
    .bind(&draft.description)
    .bind(&draft.rule_type)
    .bind(draft.enabled)
    .bind(Json(&draft.conditions))
    .bind(draft.threshold)
    .bind(&draft.comparison_op)
    .bind(draft.time_window)
    .bind(&draft.schedule)
    .bind(&draft.timezone)
    .bind(draft.cooldown_minutes)
    .bind(draft.max_per_day)
    .bind(&draft.priority)
    .bind(Json(&draft.tags))
    .bind(Json(&draft.channels))
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    tracing::info!(rule = %public_id, rule_type = %draft.rule_type, "notification rule created");

    get_rule(pool, user_id, &public_id).await
}

pub async fn update_rule(
    pool: &SqlitePool,
    user_id: i64,
    public_id: &str,
    req: RuleRequest,
) -> Result<NotificationRule, ServiceError> {
    let existing = get_rule(pool, user_id, public_id).await?;
    let draft = RuleDraft::from(&existing).apply(req);
    check_draft(pool, user_id, &draft, Some(existing.id)).await?;

    sqlx::query(
        r#"
        UPDATE notification_rules
        SET name = ?, description = ?, rule_type = ?, enabled = ?, conditions = ?, threshold = ?,
            comparison_op = ?, time_window = ?, schedule = ?, timezone = ?, cooldown_minutes = ?,
            max_per_day = ?, priority = ?, tags = ?, channels = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&draft.name)
    .bind(&draft.description)
    .bind(&draft.rule_type)
    .bind(draft.enabled)
    .bind(Json(&draft.conditions))
    .bind(draft.threshold)
    .bind(&draft.comparison_op)
    .bind(draft.time_window)
    .bind(&draft.schedule)
    .bind(&draft.timezone)
    .bind(draft.cooldown_minutes)
    .bind(draft.max_per_day)
    .bind(&draft.priority)
    .bind(Json(&draft.tags))
    .bind(Json(&draft.channels))
    .bind(now_rfc3339())
    .bind(existing.id)
    .execute(pool)
    .await?;

    get_rule(pool, user_id, public_id).await
}

pub async fn delete_rule(
    pool: &SqlitePool,
    user_id: i64,
    public_id: &str,
) -> Result<(), ServiceError> {
    let result = sqlx::query("DELETE FROM notification_rules WHERE public_id = ? AND user_id = ?")
        .bind(public_id)
        .bind(user_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(ServiceError::not_found("Notification rule not found"));
    }

    Ok(())
}

/// Persists the throttle state after a rule fired.
pub async fn record_trigger(
    pool: &SqlitePool,
    rule_id: i64,
    triggered_at: &str,
    day: &str,
    count: i64,
) -> Result<(), ServiceError> {
    sqlx::query(
        "UPDATE notification_rules SET last_triggered_at = ?, trigger_day = ?, trigger_count = ? WHERE id = ?",
    )
    .bind(triggered_at)
    .bind(day)
    .bind(count)
    .bind(rule_id)
    .execute(pool)
    .await?;
    Ok(())
}
