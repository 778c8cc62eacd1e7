use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use utoipa::ToSchema;

use super::error::ServiceError;
use crate::util::now_rfc3339;

#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct Thread {
    #[serde(skip)]
    pub id: i64,
    #[serde(rename = "id")]
    pub public_id: String,
    pub title: String,
    pub description: Option<String>,
    pub thread_type: String,
    pub is_pinned: bool,
    pub is_archived: bool,
    pub is_starred: bool,
    pub message_count: i64,
    pub total_cost: f64,
    pub total_tokens: i64,
    pub last_message_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct Message {
    #[serde(skip)]
    pub id: i64,
    #[serde(rename = "id")]
    pub public_id: String,
    pub role: String,
    pub content: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cost: f64,
    pub latency_ms: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CreateThreadRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub thread_type: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct UpdateThreadRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub is_pinned: Option<bool>,
    pub is_archived: Option<bool>,
    pub is_starred: Option<bool>,
}

/// Fields of a message about to be appended to a thread.
#[derive(Debug, Clone, Default)]
pub struct NewMessage<'a> {
    pub role: &'a str,
    pub content: &'a str,
    pub provider: Option<&'a str>,
    pub model: Option<&'a str>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost: f64,
    pub latency_ms: Option<i64>,
}

const THREAD_COLUMNS: &str = "id, public_id, title, description, thread_type, is_pinned, is_archived, is_starred, message_count, total_cost, total_tokens, last_message_at, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, public_id, role, content, provider, model, prompt_tokens, completion_tokens, total_tokens, cost, latency_ms, created_at";

pub async fn list_threads(pool: &SqlitePool, user_id: i64) -> Result<Vec<Thread>, ServiceError> {
    let threads = sqlx::query_as::<_, Thread>(&format!(
        r#"
        SELECT {THREAD_COLUMNS}
        FROM threads
        WHERE user_id = ? AND is_archived = 0
        ORDER BY is_pinned DESC,
                 last_message_at IS NULL,
                 last_message_at DESC,
                 created_at DESC
        "#
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(threads)
}

pub async fn create_thread(
    pool: &SqlitePool,
    user_id: i64,
    req: CreateThreadRequest,
) -> Result<Thread, ServiceError> {
    let title = req
        .title
        .as_deref()
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .unwrap_or("New Chat");
    if title.chars().count() > 255 {
        return Err(ServiceError::bad_request("Title must be at most 255 characters"));
    }

    let public_id = costguard_auth::new_public_id();
    let now = now_rfc3339();

    sqlx::query(
        r#"
        INSERT INTO threads (public_id, user_id, title, description, thread_type, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&public_id)
    .bind(user_id)
    .bind(title)
    .bind(&req.description)
    .bind(req.thread_type.as_deref().unwrap_or("STANDARD"))
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    get_thread(pool, user_id, &public_id).await
}

/// Loads a thread owned by `user_id`; anyone else's thread reads as missing.
pub async fn get_thread(
    pool: &SqlitePool,
    user_id: i64,
    thread_public_id: &str,
) -> Result<Thread, ServiceError> {
    sqlx::query_as::<_, Thread>(&format!(
        "SELECT {THREAD_COLUMNS} FROM threads WHERE public_id = ? AND user_id = ?"
    ))
    .bind(thread_public_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ServiceError::not_found("Thread not found"))
}

pub async fn list_messages(pool: &SqlitePool, thread_id: i64) -> Result<Vec<Message>, ServiceError> {
    let messages = sqlx::query_as::<_, Message>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = ? ORDER BY created_at ASC, id ASC"
    ))
    .bind(thread_id)
    .fetch_all(pool)
    .await?;

    Ok(messages)
}

pub async fn update_thread(
    pool: &SqlitePool,
    user_id: i64,
    thread_public_id: &str,
    req: UpdateThreadRequest,
) -> Result<Thread, ServiceError> {
    get_thread(pool, user_id, thread_public_id).await?;

    if let Some(title) = &req.title {
        if title.trim().is_empty() || title.chars().count() > 255 {
            return Err(ServiceError::bad_request(
                "Title must be between 1 and 255 characters",
            ));
        }
    }

    sqlx::query(
        r#"
        UPDATE threads
        SET title = COALESCE(?, title),
            description = COALESCE(?, description),
            is_pinned = COALESCE(?, is_pinned),
            is_archived = COALESCE(?, is_archived),
            is_starred = COALESCE(?, is_starred),
            updated_at = ?
        WHERE public_id = ? AND user_id = ?
        "#,
    )
    .bind(req.title.as_deref().map(str::trim))
    .bind(&req.description)
    .bind(req.is_pinned)
    .bind(req.is_archived)
    .bind(req.is_starred)
    .bind(now_rfc3339())
    .bind(thread_public_id)
    .bind(user_id)
    .execute(pool)
    .await?;

    get_thread(pool, user_id, thread_public_id).await
}

pub async fn delete_thread(
    pool: &SqlitePool,
    user_id: i64,
    thread_public_id: &str,
) -> Result<(), ServiceError> {
    let result = sqlx::query("DELETE FROM threads WHERE public_id = ? AND user_id = ?")
        .bind(thread_public_id)
        .bind(user_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(ServiceError::not_found("Thread not found"));
    }

    Ok(())
}

pub async fn insert_message(
    pool: &SqlitePool,
    thread_id: i64,
    message: NewMessage<'_>,
) -> Result<Message, ServiceError> {
    let public_id = costguard_auth::new_public_id();

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO messages
            (public_id, thread_id, role, content, provider, model, prompt_tokens, completion_tokens, total_tokens, cost, latency_ms, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(&public_id)
    .bind(thread_id)
    .bind(message.role)
    .bind(message.content)
    .bind(message.provider)
    .bind(message.model)
    .bind(message.prompt_tokens)
    .bind(message.completion_tokens)
    .bind(message.prompt_tokens + message.completion_tokens)
    .bind(message.cost)
    .bind(message.latency_ms)
    .bind(now_rfc3339())
    .fetch_one(pool)
    .await?;

    sqlx::query_as::<_, Message>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
    ))
    .bind(id)
    .fetch_one(pool)
    .await
    .map_err(ServiceError::from)
}

/// Folds one completed prompt/answer pair into the thread counters.
pub async fn record_exchange(
    pool: &SqlitePool,
    thread_id: i64,
    tokens: i64,
    cost: f64,
) -> Result<(), ServiceError> {
    let now = now_rfc3339();
    sqlx::query(
        r#"
        UPDATE threads
        SET message_count = message_count + 2,
            total_tokens = total_tokens + ?,
            total_cost = total_cost + ?,
            last_message_at = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(tokens)
    .bind(cost)
    .bind(&now)
    .bind(&now)
    .bind(thread_id)
    .execute(pool)
    .await?;

    Ok(())
}
