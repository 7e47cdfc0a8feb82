use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use shuttle_storage::PgScheduleStore;
use shuttle_sync::{CrawlConfig, SourceRegistry};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "shuttle-cli")]
#[command(about = "Campus shuttle timetable crawler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl every enabled page and reconcile into the store.
    Crawl,
    /// Apply database migrations to DATABASE_URL.
    Migrate,
    /// Decode a saved page offline and print the extracted records.
    Parse {
        #[arg(long)]
        page: String,
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = CrawlConfig::from_env();

    match cli.command.unwrap_or(Commands::Crawl) {
        Commands::Crawl => {
            let report = shuttle_sync::crawl_and_reconcile_from_env().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.success {
                std::process::exit(1);
            }
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL is required for migrate");
            };
            let store = PgScheduleStore::connect(url).await?;
            store.migrate().await?;
            eprintln!("migrations applied");
        }
        Commands::Parse { page, file } => {
            let registry = SourceRegistry::load(&config.sources_path).await?;
            let source = registry
                .find(&page)
                .with_context(|| format!("page {page} not in {}", config.sources_path.display()))?;
            let records = shuttle_adapters::decode_page_file(&file, &source.context(), Utc::now())?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }

    Ok(())
}
