use std::collections::HashMap;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use costguard_auth::User;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::{
    sync::{broadcast::error::RecvError, mpsc},
    task::JoinHandle,
};

use crate::{
    rate_limit::Bucket,
    realtime::{ClientEvent, PresenceEntry, ServerEvent},
    services::{
        relay::{self, ChatTurn},
        threads, ServiceError,
    },
    util::now_rfc3339,
    ApiError, AppState,
};

const OUTBOUND_CAPACITY: usize = 100;

#[derive(Debug, Deserialize)]
pub struct WebSocketQuery {
    token: Option<String>,
}

/// Thread public id to the task forwarding its broadcasts to this socket.
type JoinedThreads = HashMap<String, JoinHandle<()>>;

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WebSocketQuery>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let token = params
        .token
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ApiError::unauthorized("Missing access token"))?;
    let (user, _) = state.authenticate(&token).await?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user)))
}

async fn handle_socket(socket: WebSocket, state: AppState, user: User) {
    let (mut ws_sender, mut receiver) = socket.split();

    let (out_tx, mut out_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_CAPACITY);
    let sender_task = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Failed to serialize realtime event: {}", e);
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(WsMessage::Text(json)).await {
                tracing::debug!("WebSocket send failed, closing: {}", e);
                break;
            }
        }
    });

    let connection_id = state.users().register(user.id, out_tx.clone()).await;
    tracing::info!(user_id = %user.public_id, connection_id, "websocket connected");

    let _ = out_tx
        .send(ServerEvent::Connected {
            user_id: user.public_id.clone(),
        })
        .await;

    let mut joined = JoinedThreads::new();

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => {
                    if let Err(e) =
                        handle_client_event(event, &out_tx, &state, &user, &mut joined).await
                    {
                        let _ = out_tx
                            .send(ServerEvent::Error {
                                message: client_message(&e),
                            })
                            .await;
                    }
                }
                Err(e) => {
                    tracing::warn!(user_id = %user.public_id, "invalid client event: {}", e);
                    let _ = out_tx
                        .send(ServerEvent::Error {
                            message: "Invalid event format".to_string(),
                        })
                        .await;
                }
            },
            Ok(WsMessage::Close(_)) => break,
            Err(e) => {
                tracing::debug!(user_id = %user.public_id, "websocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    for (thread_id, task) in joined {
        stop_forwarding(task).await;
        state.threads().leave(&thread_id, &user.public_id).await;
    }
    state.users().unregister(user.id, connection_id).await;
    drop(out_tx);
    sender_task.abort();

    tracing::info!(user_id = %user.public_id, connection_id, "websocket disconnected");
}

async fn handle_client_event(
    event: ClientEvent,
    out_tx: &mpsc::Sender<ServerEvent>,
    state: &AppState,
    user: &User,
    joined: &mut JoinedThreads,
) -> Result<(), ServiceError> {
    match event {
        ClientEvent::ThreadJoin { thread_id } => {
            if is_joined(joined, &thread_id) {
                let presence = state.threads().presence(&thread_id).await;
                send(out_tx, ServerEvent::ThreadJoined { thread_id, presence }).await;
                return Ok(());
            }
            // A forwarder whose channel closed is stale; subscribe again.
            joined.remove(&thread_id);

            // Only the owner may subscribe.
            threads::get_thread(state.db_pool(), user.id, &thread_id).await?;

            let entry = PresenceEntry {
                user_id: user.public_id.clone(),
                display_name: user.display_name.clone(),
                status: "online".to_string(),
            };
            let (broadcaster, presence) = state.threads().join(&thread_id, entry.clone()).await;
            let mut rx = broadcaster.subscribe();
            let _ = broadcaster.send(ServerEvent::UserJoined {
                thread_id: thread_id.clone(),
                user: entry,
            });

            let forward_tx = out_tx.clone();
            let forward_thread = thread_id.clone();
            let task = tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            if forward_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(thread = %forward_thread, skipped, "realtime subscriber lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            });
            joined.insert(thread_id.clone(), task);

            send(out_tx, ServerEvent::ThreadJoined { thread_id, presence }).await;
        }
        ClientEvent::ThreadLeave { thread_id } => {
            if let Some(task) = joined.remove(&thread_id) {
                stop_forwarding(task).await;
                state.threads().leave(&thread_id, &user.public_id).await;
            }
            send(out_tx, ServerEvent::ThreadLeft { thread_id }).await;
        }
        ClientEvent::TypingStart { thread_id } => {
            broadcast_typing(state, user, joined, thread_id, true).await?;
        }
        ClientEvent::TypingStop { thread_id } => {
            broadcast_typing(state, user, joined, thread_id, false).await?;
        }
        ClientEvent::PresenceUpdate { thread_id, status } => {
            if !state
                .threads()
                .set_status(&thread_id, &user.public_id, &status)
                .await
            {
                return Err(not_joined());
            }
        }
        ClientEvent::MessageSend {
            thread_id,
            content,
            mode,
            model_override,
        } => {
            if let Err(limited) = state.rate_limiter().enforce(Bucket::Chat, &user.public_id) {
                send(out_tx, ServerEvent::Error { message: limited.message }).await;
                return Ok(());
            }
            let prepared = relay::prepare(
                state,
                user,
                ChatTurn {
                    thread_id,
                    message: content,
                    mode,
                    model_override,
                },
            )
            .await?;
            tokio::spawn(relay::run(state.clone(), user.clone(), prepared, None));
        }
        ClientEvent::Ping => {
            send(
                out_tx,
                ServerEvent::Pong {
                    timestamp: now_rfc3339(),
                },
            )
            .await;
        }
    }

    Ok(())
}

async fn broadcast_typing(
    state: &AppState,
    user: &User,
    joined: &JoinedThreads,
    thread_id: String,
    is_typing: bool,
) -> Result<(), ServiceError> {
    if !is_joined(joined, &thread_id) {
        return Err(not_joined());
    }
    state
        .threads()
        .broadcast(
            &thread_id.clone(),
            ServerEvent::TypingUpdate {
                thread_id,
                user_id: user.public_id.clone(),
                is_typing,
            },
        )
        .await;
    Ok(())
}

fn is_joined(joined: &JoinedThreads, thread_id: &str) -> bool {
    joined
        .get(thread_id)
        .is_some_and(|task| !task.is_finished())
}

/// Aborts the forwarder and waits for it, so its receiver is gone before the
/// hub decides whether the channel is still in use.
async fn stop_forwarding(task: JoinHandle<()>) {
    task.abort();
    let _ = task.await;
}

async fn send(out_tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) {
    let _ = out_tx.send(event).await;
}

fn not_joined() -> ServiceError {
    ServiceError::bad_request("Join the thread first")
}

/// Storage failures are not echoed to the client.
fn client_message(error: &ServiceError) -> String {
    match error {
        ServiceError::Database(_) | ServiceError::Internal(_) => {
            tracing::error!("Failed to handle client event: {}", error);
            "Failed to process event".to_string()
        }
        other => other.to_string(),
    }
}
