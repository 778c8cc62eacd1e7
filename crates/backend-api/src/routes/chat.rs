use std::{convert::Infallible, time::Instant};

use axum::{
    extract::State,
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use costguard_orchestrator::{catalogue, find_model, ChatMessage, ChatRole, TokenUsage};
use futures_util::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use utoipa::ToSchema;

use crate::{
    rate_limit::Bucket,
    services::{
        api_keys, evaluator,
        relay::{self, ChatTurn, RelayEvent},
        usage::{self, NewUsage},
    },
    util::require_bearer,
    ApiError, AppState,
};

const RELAY_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Deserialize, ToSchema)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ChatCompletionRequest {
    pub message: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub conversation_history: Vec<HistoryMessage>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CompletionUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cost: f64,
    /// Milliseconds.
    pub latency: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CompletionBody {
    pub content: String,
    pub model: String,
    pub provider: String,
    pub usage: CompletionUsage,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ChatCompletionResponse {
    pub success: bool,
    pub response: CompletionBody,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ChatStreamRequest {
    pub thread_id: String,
    pub message: String,
    pub mode: Option<String>,
    pub model_override: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/chat",
    tag = "Chat",
    security(("bearerAuth" = [])),
    request_body = ChatCompletionRequest,
    responses(
        (status = 200, description = "Completion from the requested model", body = ChatCompletionResponse),
        (status = 400, description = "Missing message, unknown model or no key for the provider", body = crate::error::ErrorResponse),
        (status = 429, description = "Chat rate limit exceeded", body = crate::error::ErrorResponse),
        (status = 502, description = "Provider call failed", body = crate::error::ErrorResponse)
    )
)]
pub async fn chat_completion(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<Json<ChatCompletionResponse>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate_limited(&token, Bucket::Chat).await?;

    let (Some(message), Some(model)) = (
        req.message.filter(|m| !m.trim().is_empty()),
        req.model.filter(|m| !m.trim().is_empty()),
    ) else {
        return Err(ApiError::bad_request("Message and model are required"));
    };
    let spec = find_model(&model).ok_or_else(|| ApiError::bad_request("Invalid model"))?;
    let provider = spec.provider;

    let key = api_keys::active_key(state.db_pool(), state.vault(), user.id, provider)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| {
            ApiError::bad_request(format!(
                "{} API key not configured. Please add your API key in Settings.",
                provider.as_str().to_uppercase()
            ))
        })?;

    let mut messages: Vec<ChatMessage> = req
        .conversation_history
        .into_iter()
        .map(|entry| {
            let role = match entry.role.as_str() {
                "assistant" => ChatRole::Assistant,
                "system" => ChatRole::System,
                _ => ChatRole::User,
            };
            ChatMessage::new(role, entry.content)
        })
        .collect();
    messages.push(ChatMessage::new(ChatRole::User, message.trim()));
    let prompt_text = messages
        .iter()
        .map(|message| message.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let (_, request) = state
        .orchestrator()
        .chat_request(provider, spec.model, messages)?;

    let started = Instant::now();
    let completion = state
        .orchestrator()
        .complete(provider, &key, &request)
        .await?;
    let latency = started.elapsed().as_millis() as i64;

    let tokens = completion.usage.unwrap_or_else(|| {
        TokenUsage::new(
            catalogue::estimate_tokens(&prompt_text),
            catalogue::estimate_tokens(&completion.content),
        )
    });
    let cost = spec.cost(tokens.prompt_tokens, tokens.completion_tokens);
    let prompt_tokens = tokens.prompt_tokens as i64;
    let completion_tokens = tokens.completion_tokens as i64;

    usage::record_usage(
        state.db_pool(),
        NewUsage {
            user_id: user.id,
            organization_id: user.organization_id,
            provider: provider.as_str().to_string(),
            model: spec.model.to_string(),
            operation: "completion",
            prompt_tokens,
            completion_tokens,
            cost,
            latency_ms: Some(latency),
            endpoint: Some("/api/chat".to_string()),
            metadata: json!({ "latency": latency }),
        },
    )
    .await
    .map_err(ApiError::from)?;
    api_keys::mark_used(state.db_pool(), user.id, provider)
        .await
        .map_err(ApiError::from)?;

    if let Err(error) = evaluator::evaluate_rules(state.db_pool(), state.users(), &user).await {
        tracing::warn!(error = %error, "notification rule evaluation failed");
    }

    Ok(Json(ChatCompletionResponse {
        success: true,
        response: CompletionBody {
            content: completion.content,
            model: spec.model.to_string(),
            provider: provider.as_str().to_string(),
            usage: CompletionUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
                cost,
                latency,
            },
        },
    }))
}

#[utoipa::path(
    post,
    path = "/api/chat/stream",
    tag = "Chat",
    security(("bearerAuth" = [])),
    request_body = ChatStreamRequest,
    responses(
        (status = 200, description = "Server-sent events: content, error and metadata payloads, then [DONE]", content_type = "text/event-stream"),
        (status = 400, description = "Empty message or unknown model override", body = crate::error::ErrorResponse),
        (status = 404, description = "Thread not found", body = crate::error::ErrorResponse),
        (status = 429, description = "Chat rate limit exceeded", body = crate::error::ErrorResponse)
    )
)]
pub async fn chat_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatStreamRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let token = require_bearer(&headers)?;
    let (user, _) = state.authenticate_limited(&token, Bucket::Chat).await?;

    let prepared = relay::prepare(
        &state,
        &user,
        ChatTurn {
            thread_id: req.thread_id,
            message: req.message,
            mode: req.mode,
            model_override: req.model_override,
        },
    )
    .await
    .map_err(ApiError::from)?;

    let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
    tokio::spawn(relay::run(state.clone(), user, prepared, Some(tx)));

    let events = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    })
    .map(|event: RelayEvent| Ok(sse_event(&event)))
    .chain(stream::once(async { Ok(Event::default().data("[DONE]")) }));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn sse_event(event: &RelayEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(payload) => Event::default().data(payload),
        Err(error) => Event::default().data(
            json!({ "type": "error", "error": error.to_string() }).to_string(),
        ),
    }
}
