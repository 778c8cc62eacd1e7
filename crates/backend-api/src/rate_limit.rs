//! Fixed-window request counters kept in process memory.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use costguard_config::RateLimitConfig;
use dashmap::DashMap;

use crate::{util::bearer_token, ApiError, AppState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Api,
    Rules,
    Bulk,
    Chat,
}

impl Bucket {
    fn as_str(&self) -> &'static str {
        match self {
            Bucket::Api => "api",
            Bucket::Rules => "rules",
            Bucket::Bulk => "bulk",
            Bucket::Chat => "chat",
        }
    }

    fn exceeded_message(&self) -> &'static str {
        match self {
            Bucket::Bulk => "Rate limit exceeded. Bulk operations have strict rate limits.",
            _ => "Rate limit exceeded. Please try again later.",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<DashMap<String, Window>>,
    window: Duration,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            window: Duration::from_secs(config.window_seconds.max(1)),
            config,
        }
    }

    fn limit(&self, bucket: Bucket) -> u32 {
        match bucket {
            Bucket::Api => self.config.api_requests,
            Bucket::Rules => self.config.rule_requests,
            Bucket::Bulk => self.config.bulk_requests,
            Bucket::Chat => self.config.chat_requests,
        }
    }

    /// Counts one request against `key` in `bucket`, returning the seconds
    /// to wait when the window is exhausted.
    pub fn check(&self, bucket: Bucket, key: &str) -> Result<(), u64> {
        self.check_at(bucket, key, Instant::now())
    }

    fn check_at(&self, bucket: Bucket, key: &str, now: Instant) -> Result<(), u64> {
        let limit = self.limit(bucket);
        let mut entry = self
            .windows
            .entry(format!("{}:{key}", bucket.as_str()))
            .or_insert(Window {
                count: 0,
                reset_at: now + self.window,
            });

        if now >= entry.reset_at {
            *entry = Window {
                count: 0,
                reset_at: now + self.window,
            };
        }

        if entry.count >= limit {
            let remaining = entry.reset_at.saturating_duration_since(now);
            let seconds = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
            return Err(seconds.max(1));
        }

        entry.count += 1;
        Ok(())
    }

    pub fn enforce(&self, bucket: Bucket, key: &str) -> Result<(), ApiError> {
        self.check(bucket, key).map_err(|retry_after| {
            tracing::warn!(bucket = bucket.as_str(), retry_after, "rate limit exceeded");
            ApiError::too_many_requests(bucket.exceeded_message(), retry_after)
        })
    }

    /// Drops windows that have already expired.
    pub fn prune(&self) {
        let now = Instant::now();
        self.windows.retain(|_, window| window.reset_at > now);
    }
}

pub async fn api_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if !request.uri().path().starts_with("/api/") {
        return next.run(request).await;
    }

    let key = match bearer_token(request.headers()) {
        Ok(Some(token)) => token,
        _ => "anonymous".to_string(),
    };

    if let Err(error) = state.rate_limiter().enforce(Bucket::Api, &key) {
        return error.into_response();
    }

    next.run(request).await
}
