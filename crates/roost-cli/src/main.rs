use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{ArgGroup, Parser, Subcommand};
use roost_core::{RunStatus, SearchCriteria};
use roost_pipeline::{
    ListingSource, Pipeline, PipelineConfig, RunOptions, RunOutcome, DEFAULT_MAX_LISTINGS,
};
use roost_providers::{
    AnthropicConfig, AnthropicVision, FirecrawlClient, FirecrawlConfig, Notifier, SearchProvider,
    SendGridConfig, SendGridMailer, VisionProvider,
};
use roost_storage::Store;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "roost")]
#[command(about = "Rental listing scout: search, score, and get notified")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once: acquire listings, score them, send one email.
    #[command(group = ArgGroup::new("source").required(true).args(["location", "url", "from_file"]))]
    Run {
        /// Search this location across listing sites.
        #[arg(long)]
        location: Option<String>,
        /// Crawl a single listing URL instead of searching.
        #[arg(long)]
        url: Option<String>,
        /// Replay listings from a snapshot file instead of the network.
        #[arg(long, value_name = "PATH")]
        from_file: Option<PathBuf>,

        #[arg(long)]
        min_beds: Option<u32>,
        #[arg(long)]
        max_beds: Option<u32>,
        #[arg(long)]
        min_baths: Option<u32>,
        #[arg(long)]
        min_price: Option<u32>,
        #[arg(long)]
        max_price: Option<u32>,
        /// Earliest acceptable availability date (YYYY-MM-DD).
        #[arg(long)]
        start_date: Option<NaiveDate>,
        #[arg(long)]
        end_date: Option<NaiveDate>,
        #[arg(long)]
        property_type: Option<String>,

        /// Notification recipient. Falls back to NOTIFY_EMAIL.
        #[arg(long)]
        email: Option<String>,
        #[arg(long, default_value_t = DEFAULT_MAX_LISTINGS)]
        max_listings: usize,
        /// Acquire and persist only; no scoring, no email.
        #[arg(long)]
        dry_run: bool,
        /// Score but send nothing.
        #[arg(long)]
        skip_email: bool,
        /// Write crawled listings to this file for later --from-file replay.
        #[arg(long, value_name = "PATH")]
        save_snapshot: Option<PathBuf>,
        /// Apply calibrated filtering even with fewer than 10 feedback entries.
        #[arg(long)]
        no_cold_start: bool,
    },
    /// Serve the feedback endpoints the notification email links to.
    Serve {
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let store = open_store().await?;

    match cli.command {
        Commands::Run {
            location,
            url,
            from_file,
            min_beds,
            max_beds,
            min_baths,
            min_price,
            max_price,
            start_date,
            end_date,
            property_type,
            email,
            max_listings,
            dry_run,
            skip_email,
            save_snapshot,
            no_cold_start,
        } => {
            let source = if let Some(path) = from_file {
                ListingSource::Snapshot(path)
            } else if let Some(url) = url {
                ListingSource::SingleUrl(url)
            } else {
                ListingSource::Search(SearchCriteria {
                    location: location.unwrap_or_default(),
                    min_beds,
                    max_beds,
                    min_baths,
                    min_price,
                    max_price,
                    start_date,
                    end_date,
                    property_type,
                })
            };

            let mut options = RunOptions::new(source);
            options.recipient = email.or_else(|| std::env::var("NOTIFY_EMAIL").ok());
            options.max_listings = max_listings;
            options.dry_run = dry_run;
            options.skip_email = skip_email;
            options.save_snapshot = save_snapshot;
            options.force_calibrated = no_cold_start;

            let pipeline = build_pipeline(store)?;
            let outcome = pipeline.execute(options).await?;
            print_summary(&outcome);

            if outcome.status == RunStatus::Failed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Serve { port } => {
            roost_web::serve(store, port).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn open_store() -> Result<Store> {
    let path = std::env::var("DATABASE_PATH").unwrap_or_else(|_| "roost.db".to_string());
    Store::open(&path)
        .await
        .with_context(|| format!("opening database {path}"))
}

fn build_pipeline(store: Store) -> Result<Pipeline> {
    let search: Arc<dyn SearchProvider> = Arc::new(FirecrawlClient::new(FirecrawlConfig::new(
        require_env("FIRECRAWL_API_KEY")?,
    ))?);
    let vision: Arc<dyn VisionProvider> = Arc::new(AnthropicVision::new(AnthropicConfig::new(
        require_env("ANTHROPIC_API_KEY")?,
    ))?);
    let notifier: Arc<dyn Notifier> = Arc::new(SendGridMailer::new(SendGridConfig::new(
        require_env("SENDGRID_API_KEY")?,
        require_env("SENDGRID_FROM_EMAIL")?,
    ))?);
    Ok(Pipeline::new(
        store,
        search,
        vision,
        notifier,
        PipelineConfig::from_env(),
    ))
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{name} must be set"))
}

fn print_summary(outcome: &RunOutcome) {
    let c = &outcome.counters;
    println!();
    println!("run {} finished: {}", outcome.run_id, outcome.status.as_str());
    println!("  found    {:>4}", c.listings_found);
    println!(
        "  crawled  {:>4}   (failures: {})",
        c.listings_crawled, c.crawl_failures
    );
    println!("  scored   {:>4}", c.listings_scored);
    println!("  passed   {:>4}", c.listings_passed);
    println!("  emailed  {:>4}", c.listings_emailed);

    if !outcome.notified.is_empty() {
        println!();
        println!("qualifying listings:");
        for listing in &outcome.notified {
            let price = listing
                .price
                .map(|p| format!("${p}/mo"))
                .unwrap_or_else(|| "price n/a".to_string());
            let avg = listing
                .avg_score
                .map(|a| format!("{a:.1}"))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  [{avg}] {price}  {}",
                listing.address.as_deref().unwrap_or(&listing.url)
            );
        }
    }
}
