//! The chat relay shared by the SSE endpoint and the WebSocket
//! `message:send` event.

use std::time::Instant;

use costguard_auth::User;
use costguard_orchestrator::{
    analyze, catalogue, find_model, ChatMessage, ChatRole, ModelSpec, OptimizationMode,
    PromptAnalysis, StreamEvent, TokenUsage,
};
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::{types::Json, SqlitePool};
use tokio::sync::mpsc;

use super::{
    api_keys, evaluator,
    error::ServiceError,
    preferences,
    threads::{self, Message, NewMessage, Thread},
    usage::{self, NewUsage},
};
use crate::{realtime::ServerEvent, util::now_rfc3339, AppState};

const OVERRIDE_REASON: &str = "Manual override by user";

/// One user message headed for a model.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub thread_id: String,
    pub message: String,
    pub mode: Option<String>,
    pub model_override: Option<String>,
}

/// Events of a single relay run, serialized as the SSE `data:` payloads.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayEvent {
    Content { content: String },
    Error { error: String },
    Metadata { metadata: Value },
}

/// A turn whose user message is already stored and whose model is chosen.
#[derive(Debug, Clone)]
pub struct PreparedTurn {
    pub thread: Thread,
    pub model: &'static ModelSpec,
    pub recommended: &'static ModelSpec,
    pub reason: String,
    pub messages: Vec<ChatMessage>,
    pub user_message: Message,
}

/// Validates the turn, picks the model and stores the user message with its
/// prompt analysis.
pub async fn prepare(
    state: &AppState,
    user: &User,
    turn: ChatTurn,
) -> Result<PreparedTurn, ServiceError> {
    let pool = state.db_pool();
    let thread = threads::get_thread(pool, user.id, &turn.thread_id).await?;

    let content = turn.message.trim();
    if content.is_empty() {
        return Err(ServiceError::bad_request("Message is required"));
    }

    let mut prefs = preferences::load_preferences(pool, user.id).await?;
    if let Some(mode) = turn.mode.as_deref() {
        prefs.mode =
            OptimizationMode::parse(mode).ok_or_else(|| ServiceError::bad_request("Invalid mode"))?;
    }

    let (model, recommended, reason, analysis) = match turn
        .model_override
        .as_deref()
        .filter(|name| !name.trim().is_empty())
    {
        Some(name) => {
            let model =
                find_model(name).ok_or_else(|| ServiceError::bad_request("Invalid model"))?;
            let recommended = state
                .orchestrator()
                .recommend(content, &[], &prefs)
                .map(|selection| selection.recommended)
                .unwrap_or(model);
            (model, recommended, OVERRIDE_REASON.to_string(), analyze(content, &[]))
        }
        None => {
            let selection = state.orchestrator().recommend(content, &[], &prefs)?;
            (
                selection.recommended,
                selection.recommended,
                selection.reasoning,
                selection.analysis,
            )
        }
    };

    let mut messages: Vec<ChatMessage> = threads::list_messages(pool, thread.id)
        .await?
        .into_iter()
        .map(|message| {
            let role = match message.role.as_str() {
                "assistant" => ChatRole::Assistant,
                "system" => ChatRole::System,
                _ => ChatRole::User,
            };
            ChatMessage::new(role, message.content)
        })
        .collect();
    messages.push(ChatMessage::new(ChatRole::User, content));

    let user_message = threads::insert_message(
        pool,
        thread.id,
        NewMessage {
            role: "user",
            content,
            ..Default::default()
        },
    )
    .await?;
    record_analysis(pool, user_message.id, model, &reason, &analysis).await?;

    state
        .threads()
        .broadcast(
            &thread.public_id,
            ServerEvent::MessageNew {
                thread_id: thread.public_id.clone(),
                message: serde_json::to_value(&user_message)?,
            },
        )
        .await;

    tracing::info!(
        thread = %thread.public_id,
        provider = %model.provider,
        model = model.model,
        "chat turn prepared"
    );

    Ok(PreparedTurn {
        thread,
        model,
        recommended,
        reason,
        messages,
        user_message,
    })
}

async fn record_analysis(
    pool: &SqlitePool,
    message_id: i64,
    model: &ModelSpec,
    reason: &str,
    analysis: &PromptAnalysis,
) -> Result<(), ServiceError> {
    sqlx::query(
        r#"
        INSERT INTO prompt_analyses
            (message_id, content_type, complexity, estimated_tokens, recommended_model,
             recommended_provider, reasoning, analysis, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(message_id)
    .bind(analysis.content_type.as_str())
    .bind(analysis.complexity.as_str())
    .bind(analysis.estimated_tokens as i64)
    .bind(model.model)
    .bind(model.provider.as_str())
    .bind(reason)
    .bind(Json(analysis))
    .bind(now_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

/// Streams the prepared turn from the provider. Every event goes to the
/// thread's subscribers and, when given, to `events`. The run always ends
/// with `chat:done` on the thread.
pub async fn run(
    state: AppState,
    user: User,
    turn: PreparedTurn,
    events: Option<mpsc::Sender<RelayEvent>>,
) {
    let thread_id = turn.thread.public_id.clone();
    let emitter = Emitter {
        state: &state,
        thread_id: &thread_id,
        events: events.as_ref(),
    };

    if let Err(error) = relay(&state, &user, turn, &emitter).await {
        tracing::warn!(thread = %thread_id, error = %error, "chat relay failed");
        emitter.emit(RelayEvent::Error { error }).await;
    }

    state
        .threads()
        .broadcast(
            &thread_id,
            ServerEvent::ChatDone {
                thread_id: thread_id.clone(),
            },
        )
        .await;
}

struct Emitter<'a> {
    state: &'a AppState,
    thread_id: &'a str,
    events: Option<&'a mpsc::Sender<RelayEvent>>,
}

impl Emitter<'_> {
    async fn emit(&self, event: RelayEvent) {
        let thread_id = self.thread_id.to_string();
        let broadcast = match &event {
            RelayEvent::Content { content } => ServerEvent::ChatToken {
                thread_id,
                content: content.clone(),
            },
            RelayEvent::Error { error } => ServerEvent::ChatError {
                thread_id,
                error: error.clone(),
            },
            RelayEvent::Metadata { metadata } => ServerEvent::ChatMetadata {
                thread_id,
                metadata: metadata.clone(),
            },
        };
        self.state.threads().broadcast(self.thread_id, broadcast).await;

        if let Some(events) = self.events {
            // The SSE client may have gone away; the relay still finishes.
            let _ = events.send(event).await;
        }
    }
}

async fn relay(
    state: &AppState,
    user: &User,
    turn: PreparedTurn,
    emitter: &Emitter<'_>,
) -> Result<(), String> {
    let pool = state.db_pool();
    let model = turn.model;
    let provider = model.provider;

    let key = api_keys::active_key(pool, state.vault(), user.id, provider)
        .await
        .map_err(|error| error.client_message())?
        .ok_or_else(|| format!("No API key found for {provider}"))?;

    let prompt_text: String = turn
        .messages
        .iter()
        .map(|message| message.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let (_, request) = state
        .orchestrator()
        .chat_request(provider, model.model, turn.messages)
        .map_err(|error| ServiceError::from(error).client_message())?;

    let started = Instant::now();
    let mut stream = state
        .orchestrator()
        .stream(provider, &key, &request)
        .await
        .map_err(|error| ServiceError::from(error).client_message())?;

    let mut response = String::new();
    let mut reported: Option<TokenUsage> = None;
    while let Some(event) = stream.next().await {
        match event.map_err(|error| error.to_string())? {
            StreamEvent::Delta(content) => {
                if content.is_empty() {
                    continue;
                }
                response.push_str(&content);
                emitter.emit(RelayEvent::Content { content }).await;
            }
            StreamEvent::Usage(usage) => reported = Some(usage),
            StreamEvent::Done => break,
        }
    }
    let latency = started.elapsed().as_millis() as i64;

    let usage = reported.unwrap_or_else(|| {
        TokenUsage::new(
            catalogue::estimate_tokens(&prompt_text),
            catalogue::estimate_tokens(&response),
        )
    });
    let prompt_tokens = usage.prompt_tokens as i64;
    let completion_tokens = usage.completion_tokens as i64;
    let total_tokens = prompt_tokens + completion_tokens;
    let cost = model.cost(usage.prompt_tokens, usage.completion_tokens);

    let assistant = persist(
        state,
        user,
        &turn.thread,
        model,
        &response,
        prompt_tokens,
        completion_tokens,
        cost,
        latency,
    )
    .await
    .map_err(|error| error.client_message())?;

    emitter
        .emit(RelayEvent::Metadata {
            metadata: json!({
                "id": assistant.public_id,
                "selected_model": model.model,
                "selected_provider": provider.as_str(),
                "recommended_model": turn.recommended.model,
                "model_reason": turn.reason,
                "prompt_tokens": prompt_tokens,
                "completion_tokens": completion_tokens,
                "total_tokens": total_tokens,
                "cost": cost,
                "latency": latency,
            }),
        })
        .await;

    if let Ok(message) = serde_json::to_value(&assistant) {
        state
            .threads()
            .broadcast(
                &turn.thread.public_id,
                ServerEvent::MessageNew {
                    thread_id: turn.thread.public_id.clone(),
                    message,
                },
            )
            .await;
    }

    if let Err(error) = evaluator::evaluate_rules(pool, state.users(), user).await {
        tracing::warn!(error = %error, "notification rule evaluation failed");
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn persist(
    state: &AppState,
    user: &User,
    thread: &Thread,
    model: &ModelSpec,
    response: &str,
    prompt_tokens: i64,
    completion_tokens: i64,
    cost: f64,
    latency: i64,
) -> Result<Message, ServiceError> {
    let pool = state.db_pool();
    let assistant = threads::insert_message(
        pool,
        thread.id,
        NewMessage {
            role: "assistant",
            content: response,
            provider: Some(model.provider.as_str()),
            model: Some(model.model),
            prompt_tokens,
            completion_tokens,
            cost,
            latency_ms: Some(latency),
        },
    )
    .await?;

    threads::record_exchange(pool, thread.id, prompt_tokens + completion_tokens, cost).await?;
    api_keys::mark_used(pool, user.id, model.provider).await?;
    usage::record_usage(
        pool,
        NewUsage {
            user_id: user.id,
            organization_id: user.organization_id,
            provider: model.provider.as_str().to_string(),
            model: model.model.to_string(),
            operation: "chat",
            prompt_tokens,
            completion_tokens,
            cost,
            latency_ms: Some(latency),
            endpoint: Some("/api/chat/stream".to_string()),
            metadata: json!({
                "thread_id": thread.public_id,
                "message_id": assistant.public_id,
                "latency": latency,
            }),
        },
    )
    .await?;

    Ok(assistant)
}
