use std::{collections::BTreeMap, time::Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{types::Json, FromRow, QueryBuilder, Sqlite, SqlitePool};
use utoipa::ToSchema;

use super::{
    error::ServiceError,
    vocabulary::{NotificationStatus, NotificationType, Priority},
};
use crate::util::{now_rfc3339, rfc3339};

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 100;
const MAX_BULK_CREATE: usize = 50;
const MAX_BULK_IDS: usize = 100;

#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct Notification {
    #[serde(skip)]
    pub id: i64,
    #[serde(rename = "id")]
    pub public_id: String,
    pub rule_id: Option<String>,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub priority: String,
    pub title: String,
    pub message: String,
    #[schema(value_type = Object)]
    pub data: Json<Value>,
    pub status: String,
    pub read_at: Option<String>,
    pub acknowledged_at: Option<String>,
    pub archived_at: Option<String>,
    pub expires_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: i64,
    pub rule_id: Option<i64>,
    pub notification_type: NotificationType,
    pub priority: Priority,
    pub title: String,
    pub message: String,
    pub data: Value,
    pub status: NotificationStatus,
    pub expires_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    #[serde(default)]
    pub unread_only: bool,
    #[serde(rename = "type")]
    pub notification_type: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct NotificationList {
    pub notifications: Vec<Notification>,
    pub total: i64,
    pub unread_count: i64,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct UpdateNotificationRequest {
    pub read: Option<bool>,
    pub acknowledged: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct BulkNotificationInput {
    #[serde(rename = "type")]
    pub notification_type: Option<String>,
    pub priority: Option<String>,
    pub title: Option<String>,
    pub message: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub data: Option<Value>,
    pub expires_at: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct BulkFilters {
    #[serde(rename = "type")]
    pub notification_type: Option<String>,
    pub priority: Option<String>,
    pub status: Option<String>,
    pub older_than: Option<String>,
    pub newer_than: Option<String>,
}

/// Either a batch of notifications to create or an action over existing ones.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum BulkRequest {
    Create {
        notifications: Vec<BulkNotificationInput>,
    },
    Action {
        action: String,
        notification_ids: Vec<String>,
        #[serde(default)]
        filters: Option<BulkFilters>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkAction {
    MarkRead,
    MarkUnread,
    Delete,
    Acknowledge,
    Archive,
    Restore,
}

impl BulkAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mark_read" => Some(BulkAction::MarkRead),
            "mark_unread" => Some(BulkAction::MarkUnread),
            "delete" => Some(BulkAction::Delete),
            "acknowledge" => Some(BulkAction::Acknowledge),
            "archive" => Some(BulkAction::Archive),
            "restore" => Some(BulkAction::Restore),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BulkAction::MarkRead => "mark_read",
            BulkAction::MarkUnread => "mark_unread",
            BulkAction::Delete => "delete",
            BulkAction::Acknowledge => "acknowledge",
            BulkAction::Archive => "archive",
            BulkAction::Restore => "restore",
        }
    }

    /// Rows the action may touch.
    fn precondition(&self) -> &'static str {
        match self {
            BulkAction::Archive => "deleted_at IS NULL AND archived_at IS NULL",
            BulkAction::Restore => "(status = 'CANCELLED' OR archived_at IS NOT NULL)",
            _ => "deleted_at IS NULL",
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BulkCreateResult {
    pub index: usize,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BulkCreateError {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BulkCreateResponse {
    pub success: bool,
    pub created_count: usize,
    pub results: Vec<BulkCreateResult>,
    pub errors: Vec<BulkCreateError>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BulkActionResponse {
    pub success: bool,
    pub message: String,
    pub action: String,
    pub requested_count: usize,
    pub affected_count: u64,
    /// Milliseconds spent applying the action.
    pub execution_time: u128,
    pub invalid_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct BulkStatsQuery {
    pub action: Option<String>,
    #[serde(rename = "type")]
    pub notification_type: Option<String>,
    pub priority: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BulkAnalysis {
    pub total: i64,
    pub unread: i64,
    pub by_type: BTreeMap<String, i64>,
    pub by_priority: BTreeMap<String, i64>,
    pub by_status: BTreeMap<String, i64>,
}

const COLUMNS: &str = "n.id, n.public_id, r.public_id AS rule_id, n.notification_type, n.priority, n.title, n.message, n.data, n.status, n.read_at, n.acknowledged_at, n.archived_at, n.expires_at, n.created_at, n.updated_at";

pub async fn create_notification(
    pool: &SqlitePool,
    notification: NewNotification,
) -> Result<Notification, ServiceError> {
    let public_id = costguard_auth::new_public_id();
    let now = now_rfc3339();

    sqlx::query(
        r#"
        INSERT INTO notifications
            (public_id, user_id, rule_id, notification_type, priority, title, message, data, status, expires_at, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&public_id)
    .bind(notification.user_id)
    .bind(notification.rule_id)
    .bind(notification.notification_type.as_str())
    .bind(notification.priority.as_str())
    .bind(&notification.title)
    .bind(&notification.message)
    .bind(Json(&notification.data))
    .bind(notification.status.as_str())
    .bind(&notification.expires_at)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    get_notification(pool, notification.user_id, &public_id).await
}

pub async fn list_notifications(
    pool: &SqlitePool,
    user_id: i64,
    query: &NotificationQuery,
) -> Result<NotificationList, ServiceError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let offset = query.offset.unwrap_or(0).max(0);

    let filter = r#"
        n.user_id = ?1
          AND n.deleted_at IS NULL
          AND (?2 = 0 OR n.read_at IS NULL)
          AND (?3 IS NULL OR n.notification_type = ?3)
    "#;

    let notifications = sqlx::query_as::<_, Notification>(&format!(
        r#"
        SELECT {COLUMNS}
        FROM notifications n
        LEFT JOIN notification_rules r ON r.id = n.rule_id
        WHERE {filter}
        ORDER BY n.created_at DESC, n.id DESC
        LIMIT ?4 OFFSET ?5
        "#
    ))
    .bind(user_id)
    .bind(query.unread_only)
    .bind(&query.notification_type)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let total: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM notifications n WHERE {filter}"
    ))
    .bind(user_id)
    .bind(query.unread_only)
    .bind(&query.notification_type)
    .fetch_one(pool)
    .await?;

    Ok(NotificationList {
        notifications,
        total,
        unread_count: unread_count(pool, user_id).await?,
    })
}

pub async fn unread_count(pool: &SqlitePool, user_id: i64) -> Result<i64, ServiceError> {
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND read_at IS NULL AND deleted_at IS NULL",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

pub async fn get_notification(
    pool: &SqlitePool,
    user_id: i64,
    public_id: &str,
) -> Result<Notification, ServiceError> {
    sqlx::query_as::<_, Notification>(&format!(
        r#"
        SELECT {COLUMNS}
        FROM notifications n
        LEFT JOIN notification_rules r ON r.id = n.rule_id
        WHERE n.public_id = ? AND n.user_id = ? AND n.deleted_at IS NULL
        "#
    ))
    .bind(public_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ServiceError::not_found("Notification not found"))
}

pub async fn update_notification(
    pool: &SqlitePool,
    user_id: i64,
    public_id: &str,
    req: UpdateNotificationRequest,
) -> Result<Notification, ServiceError> {
    get_notification(pool, user_id, public_id).await?;
    let now = now_rfc3339();

    match req.read {
        Some(true) => {
            sqlx::query(
                "UPDATE notifications SET status = 'READ', read_at = COALESCE(read_at, ?), updated_at = ? WHERE public_id = ? AND user_id = ?",
            )
            .bind(&now)
            .bind(&now)
            .bind(public_id)
            .bind(user_id)
            .execute(pool)
            .await?;
        }
        Some(false) => {
            sqlx::query(
                "UPDATE notifications SET status = 'DELIVERED', read_at = NULL, updated_at = ? WHERE public_id = ? AND user_id = ?",
            )
            .bind(&now)
            .bind(public_id)
            .bind(user_id)
            .execute(pool)
            .await?;
        }
        None => {}
    }

    if let Some(acknowledged) = req.acknowledged {
        sqlx::query(
            "UPDATE notifications SET acknowledged_at = ?, updated_at = ? WHERE public_id = ? AND user_id = ?",
        )
        .bind(acknowledged.then_some(&now))
        .bind(&now)
        .bind(public_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    }

    get_notification(pool, user_id, public_id).await
}

/// Soft delete: the row stays, cancelled and hidden from listings.
pub async fn delete_notification(
    pool: &SqlitePool,
    user_id: i64,
    public_id: &str,
) -> Result<(), ServiceError> {
    let now = now_rfc3339();
    let result = sqlx::query(
        r#"
        UPDATE notifications
        SET status = 'CANCELLED', deleted_at = ?, updated_at = ?
        WHERE public_id = ? AND user_id = ? AND deleted_at IS NULL
        "#,
    )
    .bind(&now)
    .bind(&now)
    .bind(public_id)
    .bind(user_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ServiceError::not_found("Notification not found"));
    }

    Ok(())
}

pub async fn mark_all_read(pool: &SqlitePool, user_id: i64) -> Result<u64, ServiceError> {
    let now = now_rfc3339();
    let result = sqlx::query(
        r#"
        UPDATE notifications
        SET status = 'READ', read_at = ?, updated_at = ?
        WHERE user_id = ? AND read_at IS NULL AND deleted_at IS NULL
        "#,
    )
    .bind(&now)
    .bind(&now)
    .bind(user_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn bulk_create(
    pool: &SqlitePool,
    user_id: i64,
    inputs: Vec<BulkNotificationInput>,
) -> Result<BulkCreateResponse, ServiceError> {
    if inputs.is_empty() || inputs.len() > MAX_BULK_CREATE {
        return Err(ServiceError::bad_request(format!(
            "Between 1 and {MAX_BULK_CREATE} notifications can be created at once"
        )));
    }

    let mut results = Vec::with_capacity(inputs.len());
    let mut errors = Vec::new();

    for (index, input) in inputs.into_iter().enumerate() {
        let outcome = match validate_bulk_input(user_id, input) {
            Ok(notification) => create_notification(pool, notification)
                .await
                .map_err(|error| error.to_string()),
            Err(error) => Err(error),
        };

        match outcome {
            Ok(notification) => results.push(BulkCreateResult {
                index,
                success: true,
                id: Some(notification.public_id),
            }),
            Err(error) => {
                results.push(BulkCreateResult {
                    index,
                    success: false,
                    id: None,
                });
                errors.push(BulkCreateError { index, error });
            }
        }
    }

    let created_count = results.iter().filter(|result| result.success).count();
    Ok(BulkCreateResponse {
        success: errors.is_empty(),
        created_count,
        results,
        errors,
    })
}

fn validate_bulk_input(
    user_id: i64,
    input: BulkNotificationInput,
) -> Result<NewNotification, String> {
    let notification_type = input
        .notification_type
        .as_deref()
        .and_then(NotificationType::parse)
        .ok_or_else(|| "Invalid notification type".to_string())?;
    let priority = match input.priority.as_deref() {
        Some(value) => Priority::parse(value).ok_or_else(|| "Invalid priority".to_string())?,
        None => Priority::Medium,
    };
    let title = input
        .title
        .filter(|title| !title.trim().is_empty())
        .ok_or_else(|| "title is required".to_string())?;
    let message = input
        .message
        .filter(|message| !message.trim().is_empty())
        .ok_or_else(|| "message is required".to_string())?;
    let expires_at = input
        .expires_at
        .as_deref()
        .map(|value| normalise_timestamp(value).ok_or_else(|| "Invalid expires_at".to_string()))
        .transpose()?;

    Ok(NewNotification {
        user_id,
        rule_id: None,
        notification_type,
        priority,
        title,
        message,
        data: input.data.unwrap_or_else(|| Value::Object(Default::default())),
        status: NotificationStatus::Pending,
        expires_at,
    })
}

pub async fn bulk_action(
    pool: &SqlitePool,
    user_id: i64,
    action: &str,
    ids: Vec<String>,
    filters: Option<BulkFilters>,
) -> Result<BulkActionResponse, ServiceError> {
    let action = BulkAction::parse(action).ok_or_else(|| ServiceError::bad_request("Invalid action"))?;
    if ids.is_empty() || ids.len() > MAX_BULK_IDS {
        return Err(ServiceError::bad_request(format!(
            "Between 1 and {MAX_BULK_IDS} notification ids are required"
        )));
    }
    let filters = filters.unwrap_or_default();
    let older_than = parse_filter_time(filters.older_than.as_deref(), "older_than")?;
    let newer_than = parse_filter_time(filters.newer_than.as_deref(), "newer_than")?;

    let started = Instant::now();

    let mut owned_query: QueryBuilder<Sqlite> =
        QueryBuilder::new("SELECT public_id FROM notifications WHERE user_id = ");
    owned_query.push_bind(user_id).push(" AND public_id IN (");
    let mut separated = owned_query.separated(", ");
    for id in &ids {
        separated.push_bind(id.clone());
    }
    separated.push_unseparated(")");
    let owned: Vec<String> = owned_query.build_query_scalar().fetch_all(pool).await?;

    let invalid_ids: Vec<String> = ids
        .iter()
        .filter(|id| !owned.contains(id))
        .cloned()
        .collect();
    if !invalid_ids.is_empty() {
        return Err(ServiceError::Inaccessible(
            "Some notifications not found or not accessible".to_string(),
            invalid_ids,
        ));
    }

    let now = now_rfc3339();
    let mut update: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE notifications SET ");
    push_set_clause(&mut update, action, &now);
    update.push(", updated_at = ").push_bind(now.clone());
    update
        .push(" WHERE user_id = ")
        .push_bind(user_id)
        .push(" AND ")
        .push(action.precondition())
        .push(" AND public_id IN (");
    let mut separated = update.separated(", ");
    for id in &ids {
        separated.push_bind(id.clone());
    }
    separated.push_unseparated(")");
    push_filters(
        &mut update,
        &filters,
        older_than.as_deref(),
        newer_than.as_deref(),
    );

    let affected = update.build().execute(pool).await?.rows_affected();

    tracing::info!(action = action.as_str(), requested = ids.len(), affected, "bulk notification action applied");

    Ok(BulkActionResponse {
        success: true,
        message: format!(
            "Bulk {} completed: {affected} notifications affected",
            action.as_str()
        ),
        action: action.as_str().to_string(),
        requested_count: ids.len(),
        affected_count: affected,
        execution_time: started.elapsed().as_millis(),
        invalid_ids: Vec::new(),
    })
}

fn push_set_clause(builder: &mut QueryBuilder<Sqlite>, action: BulkAction, now: &str) {
    match action {
        BulkAction::MarkRead => {
            builder
                .push("status = 'READ', read_at = COALESCE(read_at, ")
                .push_bind(now.to_string())
                .push(")");
        }
        BulkAction::MarkUnread => {
            builder.push("status = 'DELIVERED', read_at = NULL");
        }
        BulkAction::Delete => {
            builder
                .push("status = 'CANCELLED', deleted_at = ")
                .push_bind(now.to_string());
        }
        BulkAction::Acknowledge => {
            builder
                .push("status = 'READ', acknowledged_at = ")
                .push_bind(now.to_string())
                .push(", read_at = COALESCE(read_at, ")
                .push_bind(now.to_string())
                .push(")");
        }
        BulkAction::Archive => {
            builder.push("archived_at = ").push_bind(now.to_string());
        }
        BulkAction::Restore => {
            builder.push(
                "deleted_at = NULL, archived_at = NULL, status = CASE WHEN read_at IS NULL THEN 'DELIVERED' ELSE 'READ' END",
            );
        }
    }
}

fn push_filters(
    builder: &mut QueryBuilder<Sqlite>,
    filters: &BulkFilters,
    older_than: Option<&str>,
    newer_than: Option<&str>,
) {
    if let Some(kind) = &filters.notification_type {
        builder.push(" AND notification_type = ").push_bind(kind.clone());
    }
    if let Some(priority) = &filters.priority {
        builder.push(" AND priority = ").push_bind(priority.clone());
    }
    if let Some(status) = &filters.status {
        builder.push(" AND status = ").push_bind(status.clone());
    }
    if let Some(older_than) = older_than {
        builder.push(" AND created_at < ").push_bind(older_than.to_string());
    }
    if let Some(newer_than) = newer_than {
        builder.push(" AND created_at > ").push_bind(newer_than.to_string());
    }
}

pub async fn bulk_count(
    pool: &SqlitePool,
    user_id: i64,
    query: &BulkStatsQuery,
) -> Result<i64, ServiceError> {
    let count = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM notifications
        WHERE user_id = ?1
          AND deleted_at IS NULL
          AND (?2 IS NULL OR notification_type = ?2)
          AND (?3 IS NULL OR priority = ?3)
          AND (?4 IS NULL OR status = ?4)
        "#,
    )
    .bind(user_id)
    .bind(&query.notification_type)
    .bind(&query.priority)
    .bind(&query.status)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

pub async fn bulk_analyze(
    pool: &SqlitePool,
    user_id: i64,
    query: &BulkStatsQuery,
) -> Result<BulkAnalysis, ServiceError> {
    let rows: Vec<(String, String, String, Option<String>)> = sqlx::query_as(
        r#"
        SELECT notification_type, priority, status, read_at
        FROM notifications
        WHERE user_id = ?1
          AND deleted_at IS NULL
          AND (?2 IS NULL OR notification_type = ?2)
          AND (?3 IS NULL OR priority = ?3)
          AND (?4 IS NULL OR status = ?4)
        "#,
    )
    .bind(user_id)
    .bind(&query.notification_type)
    .bind(&query.priority)
    .bind(&query.status)
    .fetch_all(pool)
    .await?;

    let mut analysis = BulkAnalysis {
        total: rows.len() as i64,
        unread: 0,
        by_type: BTreeMap::new(),
        by_priority: BTreeMap::new(),
        by_status: BTreeMap::new(),
    };
    for (kind, priority, status, read_at) in rows {
        *analysis.by_type.entry(kind).or_default() += 1;
        *analysis.by_priority.entry(priority).or_default() += 1;
        *analysis.by_status.entry(status).or_default() += 1;
        if read_at.is_none() {
            analysis.unread += 1;
        }
    }
    Ok(analysis)
}

fn normalise_timestamp(value: &str) -> Option<String> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|at| rfc3339(at.with_timezone(&Utc)))
}

fn parse_filter_time(value: Option<&str>, field: &str) -> Result<Option<String>, ServiceError> {
    value
        .map(|value| {
            normalise_timestamp(value)
                .ok_or_else(|| ServiceError::bad_request(format!("Invalid {field} timestamp")))
        })
        .transpose()
}
