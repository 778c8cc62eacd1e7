use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use costguard_backend_runtime::{self, BackendServices};
use costguard_config::AppConfig;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

fn runtime_config(db_path: &Path, max_connections: u32) -> AppConfig {
    let mut config = AppConfig::default();
    config.database.url = format!("sqlite://{}", db_path.display());
    config.database.max_connections = max_connections;
    config.security.encryption_key = "runtime-test-secret".into();
    config
}

async fn initialise(config: &AppConfig) -> Result<BackendServices> {
    BackendServices::initialise(config)
        .await
        .context("failed to initialise backend services")
}

#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_creates_spend_tracking_schema() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = runtime_config(&temp_dir.path().join("runtime/init.db"), 4);
    let services = initialise(&config).await?;

    for table in [
        "usage_logs",
        "notification_rules",
        "notifications",
        "notification_templates",
        "budgets",
    ] {
        let found: Option<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table)
        .fetch_optional(&services.db_pool)
        .await?;
        assert_eq!(found.as_deref(), Some(table), "missing table {table}");
    }

    assert!(!services.authenticator.google_enabled());
    assert_eq!(services.db_pool.options().get_max_connections(), 4);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn google_sign_in_follows_configured_credentials() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let mut config = runtime_config(&temp_dir.path().join("oauth.db"), 1);
    config.auth.google.client_id = Some("client-id".into());
    config.auth.google.client_secret = Some("client-secret".into());

    let services = initialise(&config).await?;
    assert!(services.authenticator.google_enabled());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stored_provider_keys_only_open_with_the_same_secret() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let services = initialise(&runtime_config(&temp_dir.path().join("vault.db"), 1)).await?;

    let sealed = services.vault.encrypt("sk-live-123456")?;
    assert!(!sealed.contains("sk-live"));
    assert_eq!(services.vault.decrypt(&sealed)?, "sk-live-123456");

    let rotated = costguard_auth::KeyVault::new("another-secret");
    assert!(rotated.decrypt(&sealed).is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_database_reports_bootstrap_context() -> Result<()> {
    let mut config = AppConfig::default();
    config.database.url = "postgres://ledger.invalid/costguard".into();

    let error = match BackendServices::initialise(&config).await {
        Ok(_) => panic!("non-sqlite urls must not initialise"),
        Err(error) => error,
    };
    assert!(
        error.to_string().contains("failed to initialise database"),
        "unexpected error: {error:#}"
    );
    Ok(())
}

#[test]
fn telemetry_can_only_be_installed_once() {
    costguard_backend_runtime::telemetry::init_tracing()
        .expect("first initialisation should succeed");
    assert!(costguard_backend_runtime::telemetry::init_tracing().is_err());
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(unix), ignore = "requires Unix signal handling")]
async fn shutdown_signal_resolves_on_sigint() -> Result<()> {
    let shutdown_task = tokio::spawn(costguard_backend_runtime::shutdown_signal());

    sleep(Duration::from_millis(50)).await;
    #[cfg(unix)]
    unsafe {
        libc::raise(libc::SIGINT);
    }

    timeout(Duration::from_secs(2), shutdown_task).await??;
    Ok(())
}
