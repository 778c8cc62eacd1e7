use std::{collections::HashMap, sync::Arc, time::Duration as StdDuration, time::Instant};

use costguard_auth::{AuthSession, Authenticator, KeyVault, User};
use costguard_backend_runtime::BackendServices;
use costguard_config::AppConfig;
use costguard_orchestrator::Orchestrator;
use rand::{distributions::Alphanumeric, Rng};
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::{
    rate_limit::{Bucket, RateLimiter},
    realtime::{ThreadHub, UserHub},
    ApiError,
};

const DEFAULT_OAUTH_STATE_TTL: StdDuration = StdDuration::from_secs(600);

#[derive(Clone)]
pub struct AppState {
    pub db_pool: SqlitePool,
    config: Arc<AppConfig>,
    orchestrator: Arc<Orchestrator>,
    authenticator: Authenticator,
    vault: Arc<KeyVault>,
    oauth_state: OAuthStateStore,
    rate_limiter: RateLimiter,
    threads: ThreadHub,
    users: UserHub,
}

impl AppState {
    pub fn new(services: &BackendServices) -> Self {
        Self::with_oauth_store(services, OAuthStateStore::default())
    }

    pub fn with_oauth_store(services: &BackendServices, oauth_state: OAuthStateStore) -> Self {
        Self {
            db_pool: services.db_pool.clone(),
            config: services.config.clone(),
            orchestrator: services.orchestrator.clone(),
            authenticator: services.authenticator.clone(),
            vault: services.vault.clone(),
            oauth_state,
            rate_limiter: RateLimiter::new(services.config.rate_limit.clone()),
            threads: ThreadHub::default(),
            users: UserHub::default(),
        }
    }

    pub fn db_pool(&self) -> &SqlitePool {
        &self.db_pool
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    pub fn vault(&self) -> &KeyVault {
        &self.vault
    }

    pub fn oauth_state(&self) -> &OAuthStateStore {
        &self.oauth_state
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn threads(&self) -> &ThreadHub {
        &self.threads
    }

    pub fn users(&self) -> &UserHub {
        &self.users
    }

    pub async fn authenticate(&self, token: &str) -> Result<(User, AuthSession), ApiError> {
        self.authenticator
            .authenticate_token(token)
            .await
            .map_err(ApiError::from)
    }

    /// Authenticates and then charges one request to the caller's `bucket`.
    pub async fn authenticate_limited(
        &self,
        token: &str,
        bucket: Bucket,
    ) -> Result<(User, AuthSession), ApiError> {
        let (user, session) = self.authenticate(token).await?;
        self.rate_limiter.enforce(bucket, &user.public_id)?;
        Ok((user, session))
    }
}

#[derive(Clone)]
pub struct OAuthStateStore {
    inner: Arc<Mutex<HashMap<String, Instant>>>,
    ttl: StdDuration,
}

impl OAuthStateStore {
    pub fn new(ttl: StdDuration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub async fn issue(&self) -> String {
        let state = Self::random_state();
        self.store(state.clone()).await;
        state
    }

    pub async fn store(&self, state: String) {
        let mut guard = self.inner.lock().await;
        Self::prune(&mut guard, self.ttl);
        guard.insert(state, Instant::now());
    }

    pub async fn consume(&self, state: &str) -> bool {
        let mut guard = self.inner.lock().await;
        Self::prune(&mut guard, self.ttl);
        guard.remove(state).is_some()
    }

    fn random_state() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect()
    }

    fn prune(map: &mut HashMap<String, Instant>, ttl: StdDuration) {
        let now = Instant::now();
        map.retain(|_, created| now.duration_since(*created) <= ttl);
    }
}

impl Default for OAuthStateStore {
    fn default() -> Self {
        Self::new(DEFAULT_OAUTH_STATE_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, Duration};

    #[tokio::test]
    async fn oauth_state_issue_and_consume_once() {
        let store = OAuthStateStore::new(Duration::from_secs(60));
        let state = store.issue().await;

        assert_eq!(state.len(), 32);
        assert!(store.consume(&state).await);
        assert!(!store.consume(&state).await);
    }

    #[tokio::test]
    async fn oauth_state_entry_expires_after_ttl() {
        let store = OAuthStateStore::new(Duration::from_millis(10));
        let state = "expired-state".to_string();
        store.store(state.clone()).await;

        sleep(Duration::from_millis(25)).await;

        assert!(!store.consume(&state).await);
    }
}
