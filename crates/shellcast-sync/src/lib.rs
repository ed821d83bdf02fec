//! Forecast-to-risk pipeline: acquisition, freshness gate, raster processing,
//! reconciliation and persistence for one region per run.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::Serialize;
use shellcast_adapters::{load_layers, CommandRasterTools, RasterTools, ToolRunner};
use shellcast_core::{Freshness, PipelineRun, RiskRecord, Threshold, UnitKind};
use shellcast_storage::workdirs::clear_dir;
use shellcast_storage::{
    sha256_hex, write_atomic, DirectoryGridSource, FtpGridSource, GridAcquisition, GridCache,
    GridSource, GridTemplate, StorageError, WorkDirs,
};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};

pub mod config;
pub mod notify;
pub mod persist;
pub mod prep;
pub mod stages;

use config::{DatabaseConfig, GridConfig, PipelineConfig, RegionConfig, SourceConfig};
use notify::{notifier_from_config, Notification, Notifier};
use persist::{MySqlConnector, MySqlRiskStore, PersistReport, PersistenceWriter, RiskStore, StoreConnector};
use stages::aggregate::{aggregate, write_layer_outputs};
use stages::bands::extract_bands;
use stages::merge::{merge_all, write_records_csv};
use stages::sampler::sample_layer;
use stages::StageError;

pub const CRATE_NAME: &str = "shellcast-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Init,
    ConnectivityCheck,
    Acquire,
    FreshnessCheck,
    Process,
    Reconcile,
    Persist,
    Report,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Init => "init",
            RunStage::ConnectivityCheck => "connectivity_check",
            RunStage::Acquire => "acquire",
            RunStage::FreshnessCheck => "freshness_check",
            RunStage::Process => "process",
            RunStage::Reconcile => "reconcile",
            RunStage::Persist => "persist",
            RunStage::Report => "report",
        };
        f.write_str(name)
    }
}

/// A run failure tagged with the stage that raised it.
#[derive(Debug, Error)]
#[error("{stage} stage failed")]
pub struct PipelineError {
    pub stage: RunStage,
    #[source]
    pub source: anyhow::Error,
}

impl PipelineError {
    fn at<E>(stage: RunStage) -> impl FnOnce(E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        move |err| Self {
            stage,
            source: err.into(),
        }
    }

    /// Stage name plus the full cause chain, for logs and notifications.
    pub fn detail(&self) -> String {
        format!("{}: {:#}", self.stage, self.source)
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub run_date: NaiveDate,
    pub dry_run: bool,
    pub skip_download: bool,
}

impl RunOptions {
    pub fn today() -> Self {
        Self {
            run_date: Local::now().date_naive(),
            dry_run: false,
            skip_download: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LayerSummary {
    pub layer: String,
    pub kind: UnitKind,
    pub units: usize,
    pub observations: usize,
    pub cmus: usize,
    pub table: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    #[serde(flatten)]
    pub run: PipelineRun,
    pub finished_at: DateTime<Utc>,
    pub freshness: Freshness,
    pub downloaded: usize,
    pub grid_files: usize,
    pub thresholds: Vec<Threshold>,
    pub rasters: usize,
    pub layers: Vec<LayerSummary>,
    pub merged_rows: usize,
    pub output_csv: String,
    pub output_sha256: String,
    pub dry_run: bool,
    pub persisted: Option<PersistReport>,
}

struct ProcessOutcome {
    grid_files: usize,
    thresholds: Vec<Threshold>,
    rasters: usize,
    layers: Vec<LayerSummary>,
    records: Vec<Vec<RiskRecord>>,
}

pub struct Pipeline {
    region: String,
    region_config: RegionConfig,
    grid: GridConfig,
    dirs: WorkDirs,
    options: RunOptions,
    source: Arc<dyn GridSource>,
    tools: Arc<dyn RasterTools>,
    store: Arc<dyn StoreConnector>,
    notifier: Arc<dyn Notifier>,
}

impl Pipeline {
    /// Wire a run from configuration. The database is opened by the run
    /// itself, at the connectivity check.
    pub fn new(config: &PipelineConfig, region: &str, options: RunOptions) -> Result<Self> {
        let region_config = config.region(region)?.clone();
        let source: Arc<dyn GridSource> = match &config.source {
            SourceConfig::Ftp {
                host,
                cwd,
                timeout_secs,
            } => Arc::new(FtpGridSource::new(
                host.clone(),
                cwd.clone(),
                Duration::from_secs(*timeout_secs),
            )),
            SourceConfig::Directory { path } => Arc::new(DirectoryGridSource::new(path.clone())),
        };
        let tools = Arc::new(CommandRasterTools::new(
            ToolRunner::new(config.tools.timeout()),
            config.tools.paths.clone(),
        ));
        Ok(Self {
            region: region.to_string(),
            region_config,
            grid: config.grid.clone(),
            dirs: WorkDirs::new(config.data_root.join(region)),
            options,
            source,
            tools,
            store: Arc::new(MySqlConnector::new(config.database.clone())),
            notifier: Arc::from(notifier_from_config(&config.notification)?),
        })
    }

    pub fn with_grid_source(mut self, source: Arc<dyn GridSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_raster_tools(mut self, tools: Arc<dyn RasterTools>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_risk_store(mut self, store: Arc<dyn RiskStore>) -> Self {
        self.store = Arc::new(store);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Run once and notify on failure. Notifier errors are logged, never
    /// returned in place of the run error.
    pub async fn run_and_notify(&self) -> Result<RunSummary, PipelineError> {
        let result = self.run_once().await;
        if let Err(err) = &result {
            error!(region = %self.region, stage = %err.stage, "{}", err.detail());
            let notification = Notification::failure(&self.region, err.detail());
            if let Err(notify_err) = self.notifier.notify(&notification).await {
                warn!(region = %self.region, "failure notification not delivered: {notify_err:#}");
            }
        }
        result
    }

    pub async fn run_once(&self) -> Result<RunSummary, PipelineError> {
        let run = PipelineRun::start(&self.region, self.options.run_date);
        let span = info_span!("pipeline_run", run_id = %run.run_id, region = %run.region);
        self.run_stages(run).instrument(span).await
    }

    async fn run_stages(&self, run: PipelineRun) -> Result<RunSummary, PipelineError> {
        info!(run_date = %run.run_date, dry_run = self.options.dry_run, "[Start pipeline]");
        self.dirs.prepare().await.map_err(PipelineError::at(RunStage::Init))?;

        let store = if self.options.dry_run {
            info!("dry run: database connectivity check skipped");
            None
        } else {
            let store = self
                .store
                .connect()
                .await
                .context("connecting to the risk database")
                .map_err(PipelineError::at(RunStage::ConnectivityCheck))?;
            store
                .ping()
                .await
                .map_err(PipelineError::at(RunStage::ConnectivityCheck))?;
            info!("database reachable");
            Some(store)
        };

        let cache = GridCache::new(self.dirs.raw());
        let downloaded = if self.options.skip_download {
            info!("download skipped; using cached grid files");
            0
        } else {
            self.acquire(&cache, run.run_date)
                .await
                .map_err(PipelineError::at(RunStage::Acquire))?
        };

        let freshness = cache
            .check_freshness(run.run_date)
            .await
            .map_err(PipelineError::at(RunStage::FreshnessCheck))?;
        match freshness {
            Freshness::Fresh(date) => info!(data_date = %date, "grid files are current"),
            Freshness::Stale(date) => warn!(
                data_date = %date,
                run_date = %run.run_date,
                "GRID FILES ARE STALE: results will be computed but not persisted"
            ),
        }
        let data_date = freshness.data_date();

        let outcome = self
            .process(&cache, data_date)
            .await
            .map_err(PipelineError::at(RunStage::Process))?;

        let (csv_path, merged_rows, output_sha256) = self
            .reconcile(outcome.records, data_date)
            .await
            .map_err(PipelineError::at(RunStage::Reconcile))?;

        let persisted = match &store {
            None => {
                info!("dry run: persistence skipped");
                None
            }
            Some(_) if !freshness.allows_persist() => {
                warn!(csv = %csv_path.display(), "stale data: persistence skipped");
                None
            }
            Some(store) => {
                let report = PersistenceWriter::new(&**store)
                    .persist(&csv_path)
                    .await
                    .map_err(PipelineError::at(RunStage::Persist))?;
                Some(report)
            }
        };

        let summary = RunSummary {
            run,
            finished_at: Utc::now(),
            freshness,
            downloaded,
            grid_files: outcome.grid_files,
            thresholds: outcome.thresholds,
            rasters: outcome.rasters,
            layers: outcome.layers,
            merged_rows,
            output_csv: csv_path.display().to_string(),
            output_sha256,
            dry_run: self.options.dry_run,
            persisted,
        };
        self.write_summary(&summary)
            .await
            .map_err(PipelineError::at(RunStage::Report))?;
        info!(merged_rows, persisted = summary.persisted.is_some(), "[Pipeline complete]");
        Ok(summary)
    }

    async fn acquire(&self, cache: &GridCache, run_date: NaiveDate) -> Result<usize, StorageError> {
        info!("[Download PQPF GRBs]");
        let removed = cache.purge_outdated(run_date).await?;
        if !removed.is_empty() {
            info!(removed = removed.len(), "purged outdated cache entries");
        }
        let acquisition = GridAcquisition::new(
            Arc::clone(&self.source),
            cache.clone(),
            GridTemplate {
                prefix: self.grid.prefix.clone(),
                run_hour: self.grid.run_hour,
                horizons: self.grid.horizons.clone(),
            },
        );
        let expected = acquisition.expected_files(run_date);
        let missing = acquisition.files_to_download(&expected).await?;
        let downloaded = acquisition.download(&missing).await?;
        Ok(downloaded.len())
    }

    async fn process(&self, cache: &GridCache, data_date: NaiveDate) -> Result<ProcessOutcome, StageError> {
        clear_dir(&self.dirs.intermediate()).await?;
        let layers = load_layers(&self.region_config.layers)?;
        let thresholds: BTreeSet<Threshold> = match self.region_config.fixed_threshold() {
            Some(threshold) => BTreeSet::from([threshold]),
            None => layers
                .iter()
                .flat_map(|(_, units)| units.iter().filter_map(|u| u.threshold))
                .collect(),
        };
        info!(
            thresholds = %thresholds.iter().map(ToString::to_string).collect::<Vec<_>>().join(","),
            "rainfall thresholds"
        );

        info!("[Subset PQPF GRBs]");
        let raw = cache.grid_files().await?;
        let subsets = stages::subset::subset(
            self.tools.as_ref(),
            &raw,
            &self.region_config.bounds,
            &self.dirs.subsets(),
        )
        .await?;

        info!("[Convert GRB bands to GeoTIFFs]");
        let mut rasters = extract_bands(
            self.tools.as_ref(),
            &subsets,
            &thresholds,
            &self.grid.tiff_prefix,
            &self.dirs.tiffs(),
        )
        .await?;
        if let Some(spec) = &self.region_config.resample {
            info!("[Resample GeoTIFFs]");
            rasters = stages::subset::resample(self.tools.as_ref(), &rasters, spec, &self.dirs.resample()).await?;
        }

        let mut summaries = Vec::with_capacity(layers.len());
        let mut records = Vec::with_capacity(layers.len());
        for (spec, units) in layers {
            info!(layer = %spec.name, units = units.len(), "[Sample probabilities]");
            let unit_count = units.len();
            let layer_rasters = rasters.clone();
            let hour_offset = self.grid.hour_offset;
            let observations =
                tokio::task::spawn_blocking(move || sample_layer(&layer_rasters, &units, hour_offset)).await??;

            let aggregation = aggregate(&observations)?;
            let table = write_layer_outputs(&self.dirs.intermediate(), &spec.name, data_date, &aggregation)?;
            summaries.push(LayerSummary {
                layer: spec.name.clone(),
                kind: spec.kind,
                units: unit_count,
                observations: observations.len(),
                cmus: aggregation.records.len(),
                table: table.display().to_string(),
            });
            records.push(aggregation.records);
        }

        Ok(ProcessOutcome {
            grid_files: raw.len(),
            thresholds: thresholds.into_iter().collect(),
            rasters: rasters.len(),
            layers: summaries,
            records,
        })
    }

    async fn reconcile(
        &self,
        layers: Vec<Vec<RiskRecord>>,
        data_date: NaiveDate,
    ) -> Result<(PathBuf, usize, String), StageError> {
        info!("[Merge layer probabilities]");
        let merged = merge_all(layers);
        if merged.is_empty() {
            return Err(StageError::EmptyMerge);
        }
        clear_dir(&self.dirs.outputs()).await?;
        let path = self
            .dirs
            .outputs()
            .join(format!("pqpf_cmu_probs_{}.csv", data_date.format("%Y-%m-%d")));
        write_records_csv(&path, &merged).map_err(|source| StageError::Csv {
            path: path.clone(),
            source,
        })?;
        let bytes = fs::read(&path).await.map_err(|source| StorageError::Io {
            action: "reading",
            path: path.clone(),
            source,
        })?;
        let sha256 = sha256_hex(&bytes);
        info!(csv = %path.display(), rows = merged.len(), %sha256, "wrote merged risk table");
        Ok((path, merged.len(), sha256))
    }

    async fn write_summary(&self, summary: &RunSummary) -> Result<()> {
        let path = self.dirs.intermediate().join("run_summary.json");
        let bytes = serde_json::to_vec_pretty(summary).context("encoding run summary")?;
        write_atomic(&path, &bytes).await?;
        info!(path = %path.display(), "wrote run summary");
        Ok(())
    }
}

pub async fn connect_store(config: &DatabaseConfig) -> Result<Arc<dyn RiskStore>> {
    let store = MySqlRiskStore::connect(config)
        .await
        .context("connecting to the risk database")?;
    Ok(Arc::new(store))
}

/// Full production run for `region`: today's date, live database.
pub async fn run_scheduled(config: &PipelineConfig, region: &str) -> Result<RunSummary> {
    let pipeline = Pipeline::new(config, region, RunOptions::today())?;
    Ok(pipeline.run_and_notify().await?)
}

pub async fn build_scheduler(config: PipelineConfig, region: String) -> Result<JobScheduler> {
    config.region(&region)?;
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.schedule.clone();
    let config = Arc::new(config);
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let config = Arc::clone(&config);
        let region = region.clone();
        Box::pin(async move {
            info!(region = %region, "scheduled pipeline run triggered");
            if let Err(err) = run_scheduled(&config, &region).await {
                error!(region = %region, "scheduled run failed: {err:#}");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
