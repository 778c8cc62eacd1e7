use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use costguard_backend_api::{build_router, services, AppState};
use costguard_backend_runtime::{shutdown_signal, telemetry, BackendServices};
use costguard_config::{load as load_config, AppConfig};
use costguard_database::initialize_database;
use tokio::net::TcpListener;
use tracing::info;

const RATE_LIMIT_PRUNE_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Parser)]
#[command(name = "costguard-backend")]
#[command(about = "AI Cost Guardian backend (serves HTTP by default)")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve,
    /// Apply pending database migrations and exit
    Migrate,
    /// Insert the built-in notification templates that are missing
    SeedTemplates,
    /// Print spend per provider over the last days
    UsageReport {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing().context("failed to initialise tracing")?;
    let config = load_config().context("failed to load configuration")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_server(&config).await,
        Commands::Migrate => migrate(&config).await,
        Commands::SeedTemplates => seed_templates(&config).await,
        Commands::UsageReport { days } => usage_report(&config, days).await,
    }
}

async fn run_server(config: &AppConfig) -> anyhow::Result<()> {
    info!("starting Cost Guardian backend");

    let services = BackendServices::initialise(config)
        .await
        .context("failed to initialise backend services")?;

    let seeded = services::templates::seed_builtin_templates(&services.db_pool)
        .await
        .context("failed to seed notification templates")?;
    if seeded > 0 {
        info!(seeded, "built-in notification templates installed");
    }

    let state = AppState::new(&services);
    spawn_rate_limit_pruner(state.clone());
    let app = build_router(state);

    let address = format!("{}:{}", config.http.address, config.http.port);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind http listener on {address}"))?;

    info!(%address, "http server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    info!("backend shut down");
    Ok(())
}

fn spawn_rate_limit_pruner(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RATE_LIMIT_PRUNE_INTERVAL);
        loop {
            ticker.tick().await;
            state.rate_limiter().prune();
        }
    });
}

async fn migrate(config: &AppConfig) -> anyhow::Result<()> {
    initialize_database(&config.database)
        .await
        .context("failed to apply migrations")?;
    info!(url = %config.database.url, "database is up to date");
    Ok(())
}

async fn seed_templates(config: &AppConfig) -> anyhow::Result<()> {
    let pool = initialize_database(&config.database)
        .await
        .context("failed to open database")?;

    let seeded = services::templates::seed_builtin_templates(&pool)
        .await
        .context("failed to seed notification templates")?;
    println!("Inserted {seeded} built-in templates");
    Ok(())
}

async fn usage_report(config: &AppConfig, days: i64) -> anyhow::Result<()> {
    let pool = initialize_database(&config.database)
        .await
        .context("failed to open database")?;

    let totals = services::usage::totals_by_provider(&pool, days)
        .await
        .context("failed to aggregate usage")?;

    println!("=== USAGE (last {} days) ===", days.max(1));
    if totals.is_empty() {
        println!("No usage recorded");
        return Ok(());
    }

    println!(
        "{:<12} {:>10} {:>14} {:>12}",
        "Provider", "Requests", "Tokens", "Cost (USD)"
    );
    println!("{}", "-".repeat(51));
    for (provider, bucket) in &totals {
        println!(
            "{:<12} {:>10} {:>14} {:>12.4}",
            provider, bucket.requests, bucket.tokens, bucket.cost
        );
    }
    let total_cost: f64 = totals.iter().map(|(_, bucket)| bucket.cost).sum();
    println!("{}", "-".repeat(51));
    println!("{:<12} {:>10} {:>14} {:>12.4}", "Total", "", "", total_cost);
    Ok(())
}
