//! Staged run: acquisition → sync → index → labels → train/infer → evaluate → backup.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, instrument, warn};

use burnwatch_acquisition::{ImageryCatalog, JobManager, JobProgress, MosaicRequest, TileRequest};
use burnwatch_classifier::{
    CandleCnn, FINAL_MODEL_FILE, InferenceOutcome, ModelSpec, TrainOptions, TrainOutcome,
};
use burnwatch_evaluation::EvaluationOutcome;
use burnwatch_index::{BatchReport, IndexOptions};
use burnwatch_shared::{
    AppConfig, BurnwatchError, ExportJob, JobState, PipelineObserver, Result,
};
use burnwatch_storage::Storage;
use burnwatch_sync::{FileStore, SyncReport, SyncRequest, Synchronizer};

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Pipeline stages, declared in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Download,
    DownloadMosaic,
    Sync,
    Index,
    MakeLabels,
    Train,
    Predict,
    Evaluate,
    Backup,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::Download,
        Stage::DownloadMosaic,
        Stage::Sync,
        Stage::Index,
        Stage::MakeLabels,
        Stage::Train,
        Stage::Predict,
        Stage::Evaluate,
        Stage::Backup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::DownloadMosaic => "download-mosaic",
            Stage::Sync => "sync",
            Stage::Index => "index",
            Stage::MakeLabels => "make-labels",
            Stage::Train => "train",
            Stage::Predict => "predict",
            Stage::Evaluate => "evaluate",
            Stage::Backup => "backup",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Stage::Download => "Submitting tile exports",
            Stage::DownloadMosaic => "Submitting mosaic export",
            Stage::Sync => "Synchronizing exported tiles",
            Stage::Index => "Computing vegetation index",
            Stage::MakeLabels => "Writing labels template",
            Stage::Train => "Training classifier",
            Stage::Predict => "Predicting burned areas",
            Stage::Evaluate => "Evaluating predictions",
            Stage::Backup => "Backing up artifacts",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selected stages. Iteration always follows execution order, whatever
/// the insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageSet {
    stages: BTreeSet<Stage>,
}

impl StageSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, stage: Stage) -> Self {
        self.stages.insert(stage);
        self
    }

    pub fn insert(&mut self, stage: Stage) {
        self.stages.insert(stage);
    }

    /// The leg repeated by the scheduler: download, sync, index, predict.
    pub fn scheduled() -> Self {
        [Stage::Download, Stage::Sync, Stage::Index, Stage::Predict]
            .into_iter()
            .collect()
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Stage> + '_ {
        self.stages.iter().copied()
    }

    pub fn needs_catalog(&self) -> bool {
        self.contains(Stage::Download) || self.contains(Stage::DownloadMosaic)
    }

    pub fn needs_file_store(&self) -> bool {
        self.contains(Stage::Sync)
    }
}

impl FromIterator<Stage> for StageSet {
    fn from_iter<I: IntoIterator<Item = Stage>>(iter: I) -> Self {
        Self {
            stages: iter.into_iter().collect(),
        }
    }
}

/// What one stage produced.
#[derive(Debug)]
pub enum StageResult {
    Download {
        jobs: Vec<ExportJob>,
        /// Final progress when the run waited for the jobs.
        progress: Option<JobProgress>,
    },
    Sync(SyncReport),
    Index(BatchReport),
    MakeLabels {
        rows: usize,
    },
    Train(Box<TrainOutcome>),
    Predict(InferenceOutcome),
    Evaluate(EvaluationOutcome),
    Backup {
        files: Vec<std::path::PathBuf>,
    },
}

impl StageResult {
    /// One-line human summary.
    pub fn summary(&self) -> String {
        match self {
            StageResult::Download { jobs, progress } => {
                let failed = jobs.iter().filter(|j| j.state != JobState::Completed).count();
                match progress {
                    Some(p) => format!("{} jobs, {p} finished, {failed} not completed", jobs.len()),
                    None => format!("{} jobs submitted", jobs.len()),
                }
            }
            StageResult::Sync(report) => format!(
                "{} downloaded, {} already present, {} refused, {} matched",
                report.downloaded, report.skipped_existing, report.skipped_unsafe, report.matched
            ),
            StageResult::Index(report) => format!(
                "{} index rasters written, {} failed",
                report.processed_count(),
                report.failed.len()
            ),
            StageResult::MakeLabels { rows } => format!("{rows} label rows"),
            StageResult::Train(outcome) => format!(
                "{} examples, {} epochs{}",
                outcome.examples,
                outcome.epochs.len(),
                if outcome.stopped_early { " (stopped early)" } else { "" }
            ),
            StageResult::Predict(outcome) => format!(
                "{} predictions, {} burned",
                outcome.rows.len(),
                outcome.rows.iter().filter(|r| r.pred == 1).count()
            ),
            StageResult::Evaluate(EvaluationOutcome::Written { evaluation, .. }) => format!(
                "{} rows correlated, accuracy {:.3}",
                evaluation.rows.len(),
                evaluation.report.accuracy
            ),
            StageResult::Evaluate(EvaluationOutcome::Skipped { reason }) => {
                format!("skipped: {reason}")
            }
            StageResult::Backup { files } => format!("{} files backed up", files.len()),
        }
    }
}

/// Per-stage results of one run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub results: Vec<(Stage, StageResult)>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn get(&self, stage: Stage) -> Option<&StageResult> {
        self.results.iter().find(|(s, _)| *s == stage).map(|(_, r)| r)
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// One configured pipeline with its remote services.
pub struct Pipeline {
    config: AppConfig,
    catalog: Option<Arc<dyn ImageryCatalog>>,
    file_store: Option<Arc<dyn FileStore>>,
    wait_for_jobs: bool,
    poll_interval: Duration,
    sync_dry_run: bool,
    overwrite_labels: bool,
}

impl Pipeline {
    pub fn new(config: AppConfig) -> Self {
        let poll_interval = Duration::from_secs(config.catalog.poll_interval_secs);
        Self {
            config,
            catalog: None,
            file_store: None,
            wait_for_jobs: true,
            poll_interval,
            sync_dry_run: false,
            overwrite_labels: false,
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn ImageryCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_file_store(mut self, store: Arc<dyn FileStore>) -> Self {
        self.file_store = Some(store);
        self
    }

    /// Block download stages until every export job is terminal (default on).
    pub fn with_wait_for_jobs(mut self, wait: bool) -> Self {
        self.wait_for_jobs = wait;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_sync_dry_run(mut self, dry_run: bool) -> Self {
        self.sync_dry_run = dry_run;
        self
    }

    /// Let `make-labels` replace an existing labels table.
    pub fn with_overwrite_labels(mut self, overwrite: bool) -> Self {
        self.overwrite_labels = overwrite;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Execute `stages` strictly in order. The first failing stage aborts
    /// the run; outputs of earlier stages stay on disk.
    #[instrument(skip_all, fields(stages = stages.len()))]
    pub async fn run(
        &self,
        stages: &StageSet,
        observer: &dyn PipelineObserver,
    ) -> Result<RunSummary> {
        let start = Instant::now();
        let mut summary = RunSummary::default();

        for stage in stages.iter() {
            observer.phase(stage.title());
            let stage_start = Instant::now();
            let result = self.run_stage(stage, observer).await.map_err(|e| {
                warn!(%stage, error = %e, "stage failed, aborting run");
                e
            })?;
            info!(
                %stage,
                elapsed_ms = stage_start.elapsed().as_millis(),
                "{}",
                result.summary()
            );
            summary.results.push((stage, result));
        }

        summary.elapsed = start.elapsed();
        info!(
            stages = summary.results.len(),
            elapsed_ms = summary.elapsed.as_millis(),
            "run complete"
        );
        Ok(summary)
    }

    async fn run_stage(&self, stage: Stage, observer: &dyn PipelineObserver) -> Result<StageResult> {
        match stage {
            Stage::Download => self.download_tiles(observer).await,
            Stage::DownloadMosaic => self.download_mosaic(observer).await,
            Stage::Sync => self.sync(observer).await.map(StageResult::Sync),
            Stage::Index => self.index(observer).map(StageResult::Index),
            Stage::MakeLabels => self.make_labels(observer).map(|rows| StageResult::MakeLabels { rows }),
            Stage::Train => self.train(observer).map(|o| StageResult::Train(Box::new(o))),
            Stage::Predict => self.predict(observer).await.map(StageResult::Predict),
            Stage::Evaluate => self.evaluate(observer).map(StageResult::Evaluate),
            Stage::Backup => self.backup().map(|files| StageResult::Backup { files }),
        }
    }

    fn job_manager(&self) -> Result<JobManager> {
        let catalog = self.catalog.clone().ok_or_else(|| {
            BurnwatchError::config("no imagery catalog configured for download stages")
        })?;
        Ok(JobManager::new(catalog))
    }

    async fn finish_jobs(
        &self,
        manager: &JobManager,
        mut jobs: Vec<ExportJob>,
        observer: &dyn PipelineObserver,
    ) -> Result<StageResult> {
        if !self.wait_for_jobs || jobs.is_empty() {
            return Ok(StageResult::Download {
                jobs,
                progress: None,
            });
        }

        let progress = manager.wait_all(&mut jobs, self.poll_interval, observer).await?;
        for job in jobs.iter().filter(|j| j.state != JobState::Completed) {
            warn!(job = %job.description, state = %job.state, "export did not complete");
            observer.warning(&format!("export {} ended {}", job.description, job.state));
        }
        Ok(StageResult::Download {
            jobs,
            progress: Some(progress),
        })
    }

    /// Submit one export per selected tile, waiting for them if configured.
    pub async fn download_tiles(&self, observer: &dyn PipelineObserver) -> Result<StageResult> {
        let manager = self.job_manager()?;
        let request = TileRequest::from_config(&self.config)?;
        let jobs = manager.submit_tiles(&request).await?;
        self.finish_jobs(&manager, jobs, observer).await
    }

    /// Submit the median mosaic export, waiting for it if configured.
    pub async fn download_mosaic(&self, observer: &dyn PipelineObserver) -> Result<StageResult> {
        let manager = self.job_manager()?;
        let request = MosaicRequest::from_config(&self.config)?;
        let jobs: Vec<ExportJob> = manager.submit_mosaic(&request).await?.into_iter().collect();
        self.finish_jobs(&manager, jobs, observer).await
    }

    /// Mirror exported tiles into the raw directory.
    pub async fn sync(&self, observer: &dyn PipelineObserver) -> Result<SyncReport> {
        let store = self.file_store.clone().ok_or_else(|| {
            BurnwatchError::config("no file store configured for the sync stage")
        })?;
        let request = SyncRequest {
            folder_name: self.config.imagery.output_folder.clone(),
            local_dir: self.config.paths.raw_dir.clone(),
            prefix: self.config.imagery.tile_prefix.clone(),
            dry_run: self.sync_dry_run,
        };
        Synchronizer::new(store).sync(&request, observer).await
    }

    /// Index raster for every raw tile.
    pub fn index(&self, observer: &dyn PipelineObserver) -> Result<BatchReport> {
        let paths = &self.config.paths;
        let options = IndexOptions::from(&self.config.index);
        burnwatch_index::batch_compute(&paths.raw_dir, &paths.index_dir, &options, observer)
    }

    /// Labels table template listing every index raster with label 0.
    /// An existing table is kept unless overwriting was requested.
    pub fn make_labels(&self, observer: &dyn PipelineObserver) -> Result<usize> {
        let paths = &self.config.paths;
        if paths.labels_csv.exists() && !self.overwrite_labels {
            let message = format!(
                "{} already exists, leaving it untouched",
                paths.labels_csv.display()
            );
            warn!("{message}");
            observer.warning(&message);
            return Ok(0);
        }
        burnwatch_evaluation::write_label_template(&paths.index_dir, &paths.labels_csv)
    }

    pub fn train(&self, observer: &dyn PipelineObserver) -> Result<TrainOutcome> {
        let paths = &self.config.paths;
        burnwatch_classifier::train::<CandleCnn>(
            &paths.labels_csv,
            &paths.index_dir,
            &paths.models_dir,
            &paths.reports_dir,
            &TrainOptions::from(&self.config.classifier),
            observer,
        )
    }

    /// Run the final model over the index directory and replace the stored
    /// predictions.
    pub async fn predict(&self, observer: &dyn PipelineObserver) -> Result<InferenceOutcome> {
        let paths = &self.config.paths;
        let storage = Storage::open(&paths.db_path).await?;
        burnwatch_classifier::infer::<CandleCnn>(
            &paths.models_dir.join(FINAL_MODEL_FILE),
            &paths.index_dir,
            &paths.predictions_csv(),
            &storage,
            &ModelSpec::from(&self.config.classifier),
            self.config.classifier.threshold,
            observer,
        )
        .await
    }

    pub fn evaluate(&self, observer: &dyn PipelineObserver) -> Result<EvaluationOutcome> {
        let paths = &self.config.paths;
        burnwatch_evaluation::evaluate_files(
            &paths.predictions_csv(),
            &paths.labels_csv,
            &paths.reports_dir,
            self.config.classifier.threshold,
            observer,
        )
    }

    pub fn backup(&self) -> Result<Vec<std::path::PathBuf>> {
        crate::backup::backup_artifacts(&self.config.paths, chrono::Local::now().naive_local())
    }
}
