//! Realtime fan-out: per-thread broadcast channels and per-user connection registry.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex};

const THREAD_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "thread:join")]
    ThreadJoin { thread_id: String },
    #[serde(rename = "thread:leave")]
    ThreadLeave { thread_id: String },
    #[serde(rename = "typing:start")]
    TypingStart { thread_id: String },
    #[serde(rename = "typing:stop")]
    TypingStop { thread_id: String },
    #[serde(rename = "presence:update")]
    PresenceUpdate { thread_id: String, status: String },
    #[serde(rename = "message:send")]
    MessageSend {
        thread_id: String,
        content: String,
        #[serde(default)]
        mode: Option<String>,
        #[serde(default)]
        model_override: Option<String>,
    },
    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "connected")]
    Connected { user_id: String },
    #[serde(rename = "thread:joined")]
    ThreadJoined {
        thread_id: String,
        presence: Vec<PresenceEntry>,
    },
    #[serde(rename = "thread:left")]
    ThreadLeft { thread_id: String },
    #[serde(rename = "user:joined")]
    UserJoined {
        thread_id: String,
        user: PresenceEntry,
    },
    #[serde(rename = "user:left")]
    UserLeft { thread_id: String, user_id: String },
    #[serde(rename = "typing:update")]
    TypingUpdate {
        thread_id: String,
        user_id: String,
        is_typing: bool,
    },
    #[serde(rename = "presence:update")]
    PresenceUpdate {
        thread_id: String,
        user_id: String,
        status: String,
    },
    #[serde(rename = "message:new")]
    MessageNew {
        thread_id: String,
        message: serde_json::Value,
    },
    #[serde(rename = "chat:token")]
    ChatToken { thread_id: String, content: String },
    #[serde(rename = "chat:metadata")]
    ChatMetadata {
        thread_id: String,
        metadata: serde_json::Value,
    },
    #[serde(rename = "chat:error")]
    ChatError { thread_id: String, error: String },
    #[serde(rename = "chat:done")]
    ChatDone { thread_id: String },
    #[serde(rename = "notification")]
    Notification { notification: serde_json::Value },
    #[serde(rename = "notification:unread-count")]
    NotificationUnreadCount { count: i64 },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "pong")]
    Pong { timestamp: String },
}

struct ThreadChannel {
    sender: broadcast::Sender<ServerEvent>,
    presence: HashMap<String, PresenceSlot>,
}

/// A user stays present while at least one of their sockets has the thread joined.
struct PresenceSlot {
    entry: PresenceEntry,
    connections: usize,
}

impl ThreadChannel {
    fn snapshot(&self) -> Vec<PresenceEntry> {
        self.presence.values().map(|slot| slot.entry.clone()).collect()
    }
}

/// Broadcast channel and presence list per thread public id.
#[derive(Clone, Default)]
pub struct ThreadHub {
    inner: Arc<Mutex<HashMap<String, ThreadChannel>>>,
}

impl ThreadHub {
    /// Counts one more connection of `entry.user_id` on the thread and returns
    /// the channel and everyone present, the joining user included.
    pub async fn join(
        &self,
        thread_id: &str,
        entry: PresenceEntry,
    ) -> (broadcast::Sender<ServerEvent>, Vec<PresenceEntry>) {
        let mut threads = self.inner.lock().await;
        let channel = threads
            .entry(thread_id.to_string())
            .or_insert_with(|| ThreadChannel {
                sender: broadcast::channel(THREAD_CHANNEL_CAPACITY).0,
                presence: HashMap::new(),
            });
        channel
            .presence
            .entry(entry.user_id.clone())
            .and_modify(|slot| slot.connections += 1)
            .or_insert(PresenceSlot {
                entry,
                connections: 1,
            });
        (channel.sender.clone(), channel.snapshot())
    }

    /// Releases one connection of `user_id`. The user is announced as gone once
    /// their last connection leaves; the channel is dropped once nobody is
    /// present and nothing still listens on it.
    pub async fn leave(&self, thread_id: &str, user_id: &str) {
        let mut threads = self.inner.lock().await;
        let Some(channel) = threads.get_mut(thread_id) else {
            return;
        };
        if let Some(slot) = channel.presence.get_mut(user_id) {
            slot.connections = slot.connections.saturating_sub(1);
            if slot.connections == 0 {
                channel.presence.remove(user_id);
                let _ = channel.sender.send(ServerEvent::UserLeft {
                    thread_id: thread_id.to_string(),
                    user_id: user_id.to_string(),
                });
            }
        }
        if channel.presence.is_empty() && channel.sender.receiver_count() == 0 {
            threads.remove(thread_id);
        }
    }

    pub async fn set_status(&self, thread_id: &str, user_id: &str, status: &str) -> bool {
        let mut threads = self.inner.lock().await;
        let Some(channel) = threads.get_mut(thread_id) else {
            return false;
        };
        let Some(slot) = channel.presence.get_mut(user_id) else {
            return false;
        };
        slot.entry.status = status.to_string();
        let _ = channel.sender.send(ServerEvent::PresenceUpdate {
            thread_id: thread_id.to_string(),
            user_id: user_id.to_string(),
            status: status.to_string(),
        });
        true
    }

    pub async fn presence(&self, thread_id: &str) -> Vec<PresenceEntry> {
        self.inner
            .lock()
            .await
            .get(thread_id)
            .map(ThreadChannel::snapshot)
            .unwrap_or_default()
    }

    /// Delivers to every current subscriber; a thread nobody joined is a no-op.
    pub async fn broadcast(&self, thread_id: &str, event: ServerEvent) {
        if let Some(channel) = self.inner.lock().await.get(thread_id) {
            let _ = channel.sender.send(event);
        }
    }
}

/// Outbound queues of every open socket, grouped by user row id.
#[derive(Clone, Default)]
pub struct UserHub {
    inner: Arc<Mutex<HashMap<i64, Vec<(u64, mpsc::Sender<ServerEvent>)>>>>,
    next_id: Arc<AtomicU64>,
}

impl UserHub {
    pub async fn register(&self, user_id: i64, sender: mpsc::Sender<ServerEvent>) -> u64 {
        let connection_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .await
            .entry(user_id)
            .or_default()
            .push((connection_id, sender));
        connection_id
    }

    pub async fn unregister(&self, user_id: i64, connection_id: u64) {
        let mut users = self.inner.lock().await;
        if let Some(connections) = users.get_mut(&user_id) {
            connections.retain(|(id, _)| *id != connection_id);
            if connections.is_empty() {
                users.remove(&user_id);
            }
        }
    }

    pub async fn connection_count(&self, user_id: i64) -> usize {
        self.inner
            .lock()
            .await
            .get(&user_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub async fn send(&self, user_id: i64, event: ServerEvent) {
        let mut users = self.inner.lock().await;
        if let Some(connections) = users.get_mut(&user_id) {
            connections.retain(|(_, sender)| match sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(user_id, "dropping realtime event for slow connection");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }
}
