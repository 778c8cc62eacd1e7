use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    services::threads::{
        self as thread_service, CreateThreadRequest, Message, Thread, UpdateThreadRequest,
    },
    util::require_bearer,
    ApiError, AppState,
};

#[derive(Debug, Serialize, ToSchema)]
pub struct ThreadsResponse {
    pub threads: Vec<Thread>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ThreadResponse {
    pub thread: Thread,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ThreadDetailResponse {
    pub thread: Thread,
    pub messages: Vec<Message>,
}

#[utoipa::path(
    get,
    path = "/api/threads",
    tag = "Threads",
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Non-archived threads, pinned first", body = ThreadsResponse),
        (status = 401, description = "Authentication required", body = crate::error::ErrorResponse)
    )
)]
pub async fn list_threads(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ThreadsResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let threads = thread_service::list_threads(state.db_pool(), user.id)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch threads: {}", e);
            ApiError::from(e)
        })?;

    Ok(Json(ThreadsResponse { threads }))
}

#[utoipa::path(
    post,
    path = "/api/threads",
    tag = "Threads",
    security(("bearerAuth" = [])),
    request_body = CreateThreadRequest,
    responses(
        (status = 201, description = "Thread created", body = ThreadResponse),
        (status = 400, description = "Invalid title", body = crate::error::ErrorResponse),
        (status = 401, description = "Authentication required", body = crate::error::ErrorResponse)
    )
)]
pub async fn create_thread(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateThreadRequest>,
) -> Result<(StatusCode, Json<ThreadResponse>), ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let thread = thread_service::create_thread(state.db_pool(), user.id, req)
        .await
        .map_err(|e| {
            tracing::error!("Failed to create thread: {}", e);
            ApiError::from(e)
        })?;

    Ok((StatusCode::CREATED, Json(ThreadResponse { thread })))
}

#[utoipa::path(
    get,
    path = "/api/threads/{thread_id}",
    tag = "Threads",
    security(("bearerAuth" = [])),
    params(
        ("thread_id" = String, Path, description = "Thread public identifier")
    ),
    responses(
        (status = 200, description = "Thread with its messages in order", body = ThreadDetailResponse),
        (status = 404, description = "Thread not found", body = crate::error::ErrorResponse)
    )
)]
pub async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ThreadDetailResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let thread = thread_service::get_thread(state.db_pool(), user.id, &thread_id)
        .await
        .map_err(ApiError::from)?;
    let messages = thread_service::list_messages(state.db_pool(), thread.id)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch messages: {}", e);
            ApiError::from(e)
        })?;

    Ok(Json(ThreadDetailResponse { thread, messages }))
}

#[utoipa::path(
    patch,
    path = "/api/threads/{thread_id}",
    tag = "Threads",
    security(("bearerAuth" = [])),
    params(
        ("thread_id" = String, Path, description = "Thread public identifier")
    ),
    request_body = UpdateThreadRequest,
    responses(
        (status = 200, description = "Thread updated", body = ThreadResponse),
        (status = 400, description = "Invalid title", body = crate::error::ErrorResponse),
        (status = 404, description = "Thread not found", body = crate::error::ErrorResponse)
    )
)]
pub async fn update_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<UpdateThreadRequest>,
) -> Result<Json<ThreadResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    let thread = thread_service::update_thread(state.db_pool(), user.id, &thread_id, req)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(ThreadResponse { thread }))
}

#[utoipa::path(
    delete,
    path = "/api/threads/{thread_id}",
    tag = "Threads",
    security(("bearerAuth" = [])),
    params(
        ("thread_id" = String, Path, description = "Thread public identifier")
    ),
    responses(
        (status = 204, description = "Thread and its messages deleted"),
        (status = 404, description = "Thread not found", body = crate::error::ErrorResponse)
    )
)]
pub async fn delete_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate(&token).await?;

    thread_service::delete_thread(state.db_pool(), user.id, &thread_id)
        .await
        .map_err(ApiError::from)?;

    Ok(StatusCode::NO_CONTENT)
}
