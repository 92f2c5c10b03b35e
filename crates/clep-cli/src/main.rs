use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use clep_sync::{Pipeline, PipelineConfig, PgStore};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "clep")]
#[command(about = "Classified listing enrichment pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Enqueue new listing ids across all allowed scopes
    Harvest,
    /// Fetch detail for one batch of queued listings
    FetchPosts,
    /// Fetch contact info for at most one listing
    ContactTick,
    /// Download media for one batch of fetched listings
    SyncMedia,
    /// Process pending analysis jobs
    Analyze {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Advance the directory cursor up to the upstream maximum
    CrawlDirectory,
    /// Copy directory phones onto listings missing one
    TransferPhones,
    Migrate,
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("clep=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    if let Commands::Migrate = cli.command {
        PgStore::connect(&config.database_url).await?.migrate().await?;
        println!("migrations applied");
        return Ok(());
    }

    let pipeline = Pipeline::connect(config).await?;
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing the current batch");
            on_signal.cancel();
        }
    });

    let started_at = Utc::now();
    match cli.command {
        Commands::Harvest => {
            let summary = pipeline.harvester()?.harvest_allowed_scopes().await?;
            finish(&pipeline, "harvest", started_at, &summary).await?;
        }
        Commands::FetchPosts => {
            let summary = pipeline.listing_fetcher().fetch_next_posts().await?;
            finish(&pipeline, "fetch-posts", started_at, &summary).await?;
        }
        Commands::ContactTick => {
            let tick = pipeline.contact_fetcher().tick().await?;
            finish(&pipeline, "contact-tick", started_at, &tick).await?;
        }
        Commands::SyncMedia => {
            let summary = pipeline.media_syncer().sync_next_batch().await?;
            finish(&pipeline, "sync-media", started_at, &summary).await?;
        }
        Commands::Analyze { limit } => {
            let limit = limit.unwrap_or(pipeline.config().analyze_limit);
            let summary = pipeline
                .analysis_worker()?
                .process_pending_jobs(limit)
                .await?;
            finish(&pipeline, "analyze", started_at, &summary).await?;
        }
        Commands::CrawlDirectory => {
            let summary = pipeline.directory_crawler().run(cancel).await?;
            finish(&pipeline, "crawl-directory", started_at, &summary).await?;
        }
        Commands::TransferPhones => {
            let summary = pipeline.transfer_matcher().run(&cancel).await;
            finish(&pipeline, "transfer-phones", started_at, &summary).await?;
        }
        Commands::Status => {
            let status = pipeline.store().status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Migrate => {}
    }

    Ok(())
}

async fn finish<T: Serialize>(
    pipeline: &Pipeline,
    stage: &str,
    started_at: chrono::DateTime<Utc>,
    summary: &T,
) -> Result<()> {
    let run = pipeline.record_run(stage, started_at, summary).await?;
    info!(stage, run_id = %run.run_id, "stage run recorded");
    println!("{stage} complete: {}", run.summary);
    Ok(())
}
