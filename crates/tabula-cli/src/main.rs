use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tabula_core::PipelineRun;
use tabula_storage::PgStore;
use tabula_sync::SyncConfig;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "tabula")]
#[command(about = "Government statistics ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once: pickup, discovery, download, extraction
    Sync,
    /// Consume results deposited by the extraction worker
    Pickup,
    /// Serve the HTTP API, with the cron scheduler when enabled
    Serve,
    /// Apply database migrations
    Migrate,
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("TABULA_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }
    Ok(())
}

fn print_run(run: &PipelineRun) {
    println!(
        "sync {}: run_id={} sources={} discovered={} downloaded={} extracted={} requests={} picked_up={} errors={}",
        run.status,
        run.id,
        run.sources_checked,
        run.files_discovered,
        run.files_downloaded,
        run.files_extracted,
        run.extraction_requests_created,
        run.extraction_results_processed,
        run.errors.len()
    );
    for err in &run.errors {
        println!(
            "  [{}] {}{}",
            err.phase,
            err.source.as_deref().map(|s| format!("{s}: ")).unwrap_or_default(),
            err.error_message
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let run = tabula_sync::run_sync_once_from_env().await?;
            print_run(&run);
        }
        Commands::Pickup => {
            let outcome = tabula_sync::run_pickup_from_env().await?;
            println!(
                "pickup complete: processed={} rows={} errors={}",
                outcome.processed,
                outcome.rows_inserted,
                outcome.errors.len()
            );
        }
        Commands::Serve => {
            tabula_web::serve_from_env().await?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
            println!("migrations applied");
        }
    }

    Ok(())
}
