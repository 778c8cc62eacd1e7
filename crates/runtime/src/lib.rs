use std::sync::Arc;

use anyhow::{Context, Result};
use costguard_auth::{Authenticator, KeyVault};
use costguard_config::AppConfig;
use costguard_database::initialize_database;
use costguard_orchestrator::Orchestrator;
use sqlx::SqlitePool;
use tracing::{info, warn};

const PLACEHOLDER_ENCRYPTION_KEY: &str = "default-encryption-key-change-in-production";

pub mod telemetry {
    use anyhow::Result;
    use tracing::Level;
    use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

    pub fn init_tracing() -> Result<()> {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let subscriber = SubscriberBuilder::default()
            .with_max_level(Level::TRACE)
            .with_env_filter(env_filter)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|error| anyhow::anyhow!("failed to set tracing subscriber: {error}"))
    }
}

#[derive(Clone)]
pub struct BackendServices {
    pub config: Arc<AppConfig>,
    pub db_pool: SqlitePool,
    pub authenticator: Authenticator,
    pub orchestrator: Arc<Orchestrator>,
    pub vault: Arc<KeyVault>,
}

impl BackendServices {
    pub async fn initialise(config: &AppConfig) -> Result<Self> {
        let db_pool = initialize_database(&config.database)
            .await
            .context("failed to initialise database")?;

        let authenticator = Authenticator::new(db_pool.clone(), config.auth.clone());
        let orchestrator = Arc::new(
            Orchestrator::new(config).context("failed to initialise provider clients")?,
        );

        if config.security.encryption_key == PLACEHOLDER_ENCRYPTION_KEY {
            warn!("using the placeholder encryption key; set COSTGUARD_SECURITY__ENCRYPTION_KEY");
        }
        let vault = Arc::new(KeyVault::new(&config.security.encryption_key));

        info!(
            google_oauth = authenticator.google_enabled(),
            "backend services ready"
        );

        Ok(Self {
            config: Arc::new(config.clone()),
            db_pool,
            authenticator,
            orchestrator,
            vault,
        })
    }
}

pub async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(?error, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}
