use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use shellcast_adapters::{ScriptPreprocessor, ToolRunner};
use shellcast_sync::config::{PipelineConfig, DEFAULT_CONFIG_PATH};
use shellcast_sync::persist::{read_leases_csv, MySqlRiskStore};
use shellcast_sync::prep::prepare_region;
use shellcast_sync::{build_scheduler, connect_store, Pipeline, RunOptions};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "shellcast")]
#[command(about = "Shellfish closure risk from NOAA precipitation forecasts")]
struct Cli {
    /// Pipeline configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once for a region.
    Run {
        #[arg(long)]
        region: String,
        /// Run date, defaults to today (local time).
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Compute outputs without touching the database.
        #[arg(long)]
        dry_run: bool,
        /// Use the cached grid files as they are.
        #[arg(long)]
        skip_download: bool,
    },
    /// Check that the destination database is reachable.
    CheckDb,
    /// Tidy boundaries and lease data and export the region's unit layers.
    Prep {
        #[arg(long)]
        region: String,
    },
    /// Insert or update leases from a centroid CSV.
    SyncLeases {
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Region whose prep output holds the centroid CSV, when --csv is absent.
        #[arg(long)]
        region: Option<String>,
    },
    /// Run the pipeline on the configured cron schedule until interrupted.
    Schedule {
        #[arg(long)]
        region: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = execute(cli).await {
        error!("{err:#}");
        std::process::exit(1);
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let config = PipelineConfig::load(&cli.config)?;

    match cli.command {
        Commands::Run {
            region,
            date,
            dry_run,
            skip_download,
        } => {
            let mut options = RunOptions::today();
            if let Some(date) = date {
                options.run_date = date;
            }
            options.dry_run = dry_run;
            options.skip_download = skip_download;

            let pipeline = Pipeline::new(&config, &region, options)?;
            let summary = pipeline.run_and_notify().await?;
            println!(
                "run complete: run_id={} region={} data_date={} rows={} csv={} persisted={}",
                summary.run.run_id,
                summary.run.region,
                summary.freshness.data_date(),
                summary.merged_rows,
                summary.output_csv,
                summary.persisted.is_some()
            );
        }
        Commands::CheckDb => {
            let store = connect_store(&config.database).await?;
            store.ping().await.context("pinging the risk database")?;
            println!("database reachable");
        }
        Commands::Prep { region } => {
            let preprocessor = ScriptPreprocessor::new(
                ToolRunner::new(config.tools.timeout()),
                config.tools.paths.clone(),
                config.tools.r_scripts.clone(),
            );
            let report = prepare_region(&region, config.region(&region)?, &preprocessor).await?;
            println!(
                "prep complete: lease_centroids={} layers={}",
                report.lease_centroids.display(),
                report.exported.len()
            );
        }
        Commands::SyncLeases { csv, region } => {
            let path = match (csv, region) {
                (Some(path), _) => path,
                (None, Some(region)) => config
                    .region(&region)?
                    .prep
                    .as_ref()
                    .map(|prep| prep.layout().lease_centroids_csv())
                    .with_context(|| format!("region {region} has no prep section"))?,
                (None, None) => anyhow::bail!("pass --csv or --region"),
            };
            let leases = read_leases_csv(&path)?;
            let store = MySqlRiskStore::connect(&config.database)
                .await
                .context("connecting to the risk database")?;
            let report = store.upsert_leases(&leases).await?;
            println!(
                "leases synced: total={} inserted={} updated={}",
                report.total, report.inserted, report.updated
            );
        }
        Commands::Schedule { region } => {
            let cron = config.schedule.clone();
            let mut sched = build_scheduler(config, region.clone()).await?;
            sched.start().await.context("starting scheduler")?;
            info!(region = %region, cron = %cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
