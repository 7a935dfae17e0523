use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use flattrack_ingest::IngestConfig;
use flattrack_storage::PgRecordStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_BATCH_SIZE: usize = 50;

#[derive(Debug, Parser)]
#[command(name = "flattrack")]
#[command(about = "Flat listing tracker command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest one batch of channel messages (default).
    Ingest(IngestArgs),
    /// Create the listing table if it does not exist.
    InitDb,
    /// Serve the listings API and page.
    Serve,
    /// Re-apply field vocabularies to stored records.
    Normalize {
        /// Write the changes instead of only counting them.
        #[arg(long)]
        apply: bool,
    },
}

#[derive(Debug, Args)]
struct IngestArgs {
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
    /// Only messages older than this id; 0 starts from the newest.
    #[arg(long, default_value_t = 0)]
    offset_id: i64,
}

impl Default for IngestArgs {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            offset_id: 0,
        }
    }
}

async fn connect_store() -> Result<PgRecordStore> {
    let config = IngestConfig::from_env();
    PgRecordStore::connect(&config.database_url)
        .await
        .context("connecting to listing store")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("flattrack=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest(IngestArgs::default())) {
        Commands::Ingest(args) => {
            let summary =
                flattrack_ingest::run_ingest_once_from_env(args.batch_size, args.offset_id).await?;
            println!(
                "ingest complete: run_id={} fetched={} new={} known={} persisted={}",
                summary.run_id,
                summary.fetched_messages,
                summary.extracted_messages,
                summary.known_messages,
                summary.persisted_records
            );
        }
        Commands::InitDb => {
            let store = connect_store().await?;
            store.ensure_schema().await.context("creating listing table")?;
            info!("listing table ready");
        }
        Commands::Serve => {
            flattrack_web::serve_from_env().await?;
        }
        Commands::Normalize { apply } => {
            let store = connect_store().await?;
            let summary = flattrack_ingest::normalize_stored_records(&store, apply).await?;
            println!(
                "normalize {}: scanned={} changed={} updated={}",
                if apply { "applied" } else { "dry-run" },
                summary.scanned,
                summary.changed,
                summary.updated
            );
        }
    }

    Ok(())
}
