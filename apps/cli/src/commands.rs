//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use burnwatch_acquisition::EarthEngineCatalog;
use burnwatch_core::{Pipeline, RunSummary, Stage, StageSet, run_every};
use burnwatch_shared::{AppConfig, PipelineObserver, init_config, load_config};
use burnwatch_sync::DriveFileStore;
use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// burnwatch: detect burned areas in satellite imagery.
#[derive(Parser)]
#[command(
    name = "burnwatch",
    version,
    about = "Acquire satellite tiles, compute NDVI, and classify burned areas.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (TOML, or JSON by extension).
    #[arg(long, global = true, env = "BURNWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Submit tile exports to the imagery catalog.
    Download {
        /// Export one median mosaic instead of individual tiles.
        #[arg(long)]
        mosaic: bool,

        /// Return after submission instead of waiting for the jobs.
        #[arg(long)]
        no_wait: bool,
    },

    /// Download exported tiles missing from the raw directory.
    Sync {
        /// List what would be downloaded without writing files.
        #[arg(long)]
        dry_run: bool,
    },

    /// Compute NDVI rasters for every raw tile.
    Index,

    /// Write a labels template for the index rasters.
    MakeLabels {
        /// Replace an existing labels table.
        #[arg(long)]
        force: bool,
    },

    /// Train the burned-area classifier on the labelled rasters.
    Train,

    /// Classify every index raster and store the predictions.
    Predict,

    /// Compare stored predictions with the labels table.
    Evaluate {
        /// Probability above which a raster counts as burned.
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Copy models and reports into the backup directory.
    Backup,

    /// Run several stages in pipeline order.
    Run(RunArgs),

    /// Repeat download, sync, index and predict on a fixed interval.
    Schedule {
        /// Hours between runs.
        #[arg(long, default_value_t = 24.0)]
        hours: f64,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args, Debug, Default)]
pub(crate) struct RunArgs {
    #[arg(long)]
    pub download: bool,
    #[arg(long)]
    pub download_mosaic: bool,
    #[arg(long)]
    pub sync: bool,
    #[arg(long)]
    pub index: bool,
    #[arg(long)]
    pub make_labels: bool,
    #[arg(long)]
    pub train: bool,
    #[arg(long)]
    pub predict: bool,
    #[arg(long)]
    pub evaluate: bool,
    #[arg(long)]
    pub backup: bool,
    /// Do not wait for export jobs to finish.
    #[arg(long)]
    pub no_wait: bool,
}

impl RunArgs {
    fn stages(&self) -> StageSet {
        [
            (self.download, Stage::Download),
            (self.download_mosaic, Stage::DownloadMosaic),
            (self.sync, Stage::Sync),
            (self.index, Stage::Index),
            (self.make_labels, Stage::MakeLabels),
            (self.train, Stage::Train),
            (self.predict, Stage::Predict),
            (self.evaluate, Stage::Evaluate),
            (self.backup, Stage::Backup),
        ]
        .into_iter()
        .filter_map(|(on, stage)| on.then_some(stage))
        .collect()
    }
}

#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Write a config file with defaults.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Show the resolved configuration.
    Show {
        /// Print JSON instead of TOML.
        #[arg(long)]
        json: bool,
    },
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "burnwatch=info",
        1 => "burnwatch=debug",
        _ => "burnwatch=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Options that only make sense for a single subcommand.
#[derive(Default)]
struct Overrides {
    no_wait: bool,
    dry_run: bool,
    overwrite_labels: bool,
    threshold: Option<f64>,
}

pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Download { mosaic, no_wait } => {
            let stage = if mosaic {
                Stage::DownloadMosaic
            } else {
                Stage::Download
            };
            let overrides = Overrides {
                no_wait,
                ..Overrides::default()
            };
            cmd_stages(config_path, StageSet::new().with(stage), overrides).await
        }
        Command::Sync { dry_run } => {
            let overrides = Overrides {
                dry_run,
                ..Overrides::default()
            };
            cmd_stages(config_path, StageSet::new().with(Stage::Sync), overrides).await
        }
        Command::Index => single(config_path, Stage::Index).await,
        Command::MakeLabels { force } => {
            let overrides = Overrides {
                overwrite_labels: force,
                ..Overrides::default()
            };
            cmd_stages(config_path, StageSet::new().with(Stage::MakeLabels), overrides).await
        }
        Command::Train => single(config_path, Stage::Train).await,
        Command::Predict => single(config_path, Stage::Predict).await,
        Command::Evaluate { threshold } => {
            let overrides = Overrides {
                threshold,
                ..Overrides::default()
            };
            cmd_stages(config_path, StageSet::new().with(Stage::Evaluate), overrides).await
        }
        Command::Backup => single(config_path, Stage::Backup).await,
        Command::Run(args) => {
            let stages = args.stages();
            if stages.is_empty() {
                return Err(eyre!("no stages selected; pass at least one stage flag, e.g. --index"));
            }
            let overrides = Overrides {
                no_wait: args.no_wait,
                ..Overrides::default()
            };
            cmd_stages(config_path, stages, overrides).await
        }
        Command::Schedule { hours } => cmd_schedule(config_path, hours).await,
        Command::Config { action } => match action {
            ConfigAction::Init { force } => cmd_config_init(config_path, force),
            ConfigAction::Show { json } => cmd_config_show(config_path, json),
        },
    }
}

fn load(config_path: Option<&Path>) -> Result<AppConfig> {
    let config = load_config(config_path)?;
    Ok(config)
}

/// Attach the remote services `stages` need. Credentials are only read for
/// services that will be used.
fn build_pipeline(config: AppConfig, stages: &StageSet, overrides: &Overrides) -> Result<Pipeline> {
    let mut pipeline = Pipeline::new(config)
        .with_wait_for_jobs(!overrides.no_wait)
        .with_sync_dry_run(overrides.dry_run)
        .with_overwrite_labels(overrides.overwrite_labels);

    if stages.needs_catalog() {
        let catalog = EarthEngineCatalog::from_config(pipeline.config())?;
        pipeline = pipeline.with_catalog(Arc::new(catalog));
    }
    if stages.needs_file_store() {
        let store = DriveFileStore::from_config(pipeline.config())?;
        pipeline = pipeline.with_file_store(Arc::new(store));
    }
    Ok(pipeline)
}

async fn single(config_path: Option<&Path>, stage: Stage) -> Result<()> {
    cmd_stages(config_path, StageSet::new().with(stage), Overrides::default()).await
}

async fn cmd_stages(config_path: Option<&Path>, stages: StageSet, overrides: Overrides) -> Result<()> {
    let mut config = load(config_path)?;
    if let Some(threshold) = overrides.threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(eyre!("threshold {threshold} must be within [0, 1]"));
        }
        config.classifier.threshold = threshold;
    }

    let pipeline = build_pipeline(config, &stages, &overrides)?;
    let observer = CliObserver::new();
    let summary = pipeline.run(&stages, &observer).await;
    observer.finish();

    print_summary(&summary?);
    Ok(())
}

async fn cmd_schedule(config_path: Option<&Path>, hours: f64) -> Result<()> {
    if !(hours.is_finite() && hours > 0.0) {
        return Err(eyre!("--hours must be a positive number"));
    }
    let interval = Duration::from_secs_f64(hours * 3600.0);
    let stages = StageSet::scheduled();
    let pipeline = build_pipeline(load(config_path)?, &stages, &Overrides::default())?;

    info!(hours, "scheduler started, press Ctrl-C to stop");
    println!("Running every {hours} h. Press Ctrl-C to stop.");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let observer = CliObserver::new();
    let report = run_every(&pipeline, &stages, interval, shutdown, &observer).await;
    observer.finish();

    println!(
        "  Scheduler stopped after {} runs ({} failed).",
        report.iterations, report.failures
    );
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!();
    for (stage, result) in &summary.results {
        println!("  {:<16} {}", stage.as_str(), result.summary());
    }
    println!("  {:<16} {:.1}s", "time", summary.elapsed.as_secs_f64());
    println!();
}

fn cmd_config_init(config_path: Option<&Path>, force: bool) -> Result<()> {
    let path = init_config(config_path, force)?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = load(config_path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        println!("{}", toml::to_string_pretty(&config)?);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress observer
// ---------------------------------------------------------------------------

/// Spinner for phases and progress; warnings print above it as `[WARN] ...`.
struct CliObserver {
    spinner: ProgressBar,
}

impl CliObserver {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl PipelineObserver for CliObserver {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn progress(&self, current: usize, total: usize, detail: &str) {
        self.spinner
            .set_message(format!("[{current}/{total}] {detail}"));
    }

    fn warning(&self, message: &str) {
        self.spinner.suspend(|| eprintln!("[WARN] {message}"));
    }
}
