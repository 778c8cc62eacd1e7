//! SQLite pool construction.

use std::{path::Path, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use costguard_config::DatabaseConfig;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use tokio::fs;
use tracing::info;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens the pool described by `config`. Every pooled connection enforces
/// foreign keys and runs in WAL mode.
pub async fn prepare_database(config: &DatabaseConfig) -> Result<SqlitePool> {
    let in_memory = is_in_memory(&config.url);
    let mut options = SqliteConnectOptions::from_str(&config.url)
        .with_context(|| format!("invalid sqlite url {}", config.url))?
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    if !in_memory {
        create_parent_dir(&options.clone().get_filename()).await?;
        options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to connect to database {}", config.url))?;

    info!(url = %config.url, in_memory, "database connection established");
    Ok(pool)
}

fn is_in_memory(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

async fn create_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create sqlite directory {}", parent.display())),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(url: String, max_connections: u32) -> DatabaseConfig {
        DatabaseConfig {
            url,
            max_connections,
        }
    }

    #[tokio::test]
    async fn file_database_gets_directories_and_wal() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("spend/ledger/costguard.db");

        let pool = prepare_database(&config(format!("sqlite://{}", db_path.display()), 2))
            .await
            .unwrap();

        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn every_pooled_connection_enforces_foreign_keys() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("fk.db");
        let pool = prepare_database(&config(format!("sqlite://{}", db_path.display()), 3))
            .await
            .unwrap();

        let mut held = Vec::new();
        for _ in 0..3 {
            let mut conn = pool.acquire().await.unwrap();
            let (enabled,): (i64,) = sqlx::query_as("PRAGMA foreign_keys")
                .fetch_one(&mut *conn)
                .await
                .unwrap();
            assert_eq!(enabled, 1);
            held.push(conn);
        }
    }

    #[tokio::test]
    async fn in_memory_database_uses_busy_timeout() {
        let pool = prepare_database(&config("sqlite::memory:".to_string(), 1))
            .await
            .unwrap();

        let (busy_timeout,): (i64,) = sqlx::query_as("PRAGMA busy_timeout")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(busy_timeout, 5000);
    }

    #[tokio::test]
    async fn rejects_non_sqlite_urls() {
        let error = prepare_database(&config("postgres://nowhere/costguard".to_string(), 1))
            .await
            .unwrap_err();
        assert!(error.to_string().contains("invalid sqlite url"));
    }
}
