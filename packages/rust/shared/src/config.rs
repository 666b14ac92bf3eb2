//! Application configuration for burnwatch.
//!
//! The config file is resolved from `--config`, then `./burnwatch.toml`,
//! then `~/.burnwatch/burnwatch.toml`. Missing files fall back to defaults.
//! Credentials are never stored here, only the names of the environment
//! variables that hold them.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{BurnwatchError, Result};
use crate::types::AreaOfInterest;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "burnwatch.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".burnwatch";

// ---------------------------------------------------------------------------
// Config structs (matching burnwatch.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub imagery: ImageryConfig,

    #[serde(default)]
    pub classifier: ClassifierConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub drive: DriveConfig,

    #[serde(default)]
    pub paths: PathsConfig,
}

/// `[imagery]` section: what to acquire and where to export it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageryConfig {
    /// GeoJSON file path or inline GeoJSON document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aoi_geojson: Option<String>,

    /// `[min_lon, min_lat, max_lon, max_lat]`, used when `aoi_geojson` does not resolve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<Vec<f64>>,

    /// ISO date, inclusive start of the acquisition window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,

    /// ISO date, end of the acquisition window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,

    #[serde(default = "default_collection")]
    pub collection: String,

    /// Maximum cloudy pixel percentage of a candidate image.
    #[serde(default = "default_cloud_filter")]
    pub cloud_filter: f64,

    #[serde(default = "default_max_tiles")]
    pub max_tiles: usize,

    /// Ground sample distance in meters.
    #[serde(default = "default_export_scale")]
    pub export_scale: u32,

    /// Cloud folder exports land in, and the folder the synchronizer reads.
    #[serde(default = "default_output_folder")]
    pub output_folder: String,

    #[serde(default = "default_tile_prefix")]
    pub tile_prefix: String,

    #[serde(default = "default_red_band")]
    pub red_band: String,

    #[serde(default = "default_nir_band")]
    pub nir_band: String,
}

impl Default for ImageryConfig {
    fn default() -> Self {
        Self {
            aoi_geojson: None,
            bbox: None,
            start_date: None,
            end_date: None,
            collection: default_collection(),
            cloud_filter: default_cloud_filter(),
            max_tiles: default_max_tiles(),
            export_scale: default_export_scale(),
            output_folder: default_output_folder(),
            tile_prefix: default_tile_prefix(),
            red_band: default_red_band(),
            nir_band: default_nir_band(),
        }
    }
}

impl ImageryConfig {
    /// Resolve the configured area of interest.
    pub fn area_of_interest(&self) -> Result<AreaOfInterest> {
        AreaOfInterest::resolve(self.aoi_geojson.as_deref(), self.bbox.as_deref())
    }

    /// Parse and check the acquisition date window.
    pub fn date_range(&self) -> Result<(NaiveDate, NaiveDate)> {
        let start = parse_date("start_date", self.start_date.as_deref())?;
        let end = parse_date("end_date", self.end_date.as_deref())?;
        if start > end {
            return Err(BurnwatchError::config(format!(
                "start_date {start} is after end_date {end}"
            )));
        }
        Ok((start, end))
    }
}

fn parse_date(key: &str, value: Option<&str>) -> Result<NaiveDate> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BurnwatchError::config(format!("imagery.{key} is required")))?;
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|e| {
        BurnwatchError::config(format!("imagery.{key} '{value}' is not a YYYY-MM-DD date: {e}"))
    })
}

fn default_collection() -> String {
    "COPERNICUS/S2_SR_HARMONIZED".into()
}
fn default_cloud_filter() -> f64 {
    80.0
}
fn default_max_tiles() -> usize {
    6
}
fn default_export_scale() -> u32 {
    20
}
fn default_output_folder() -> String {
    "VigiAI".into()
}
fn default_tile_prefix() -> String {
    "tile_".into()
}
fn default_red_band() -> String {
    "B4".into()
}
fn default_nir_band() -> String {
    "B8".into()
}

/// `[classifier]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Model input `[width, height]`.
    #[serde(default = "default_input_size")]
    pub input_size: [usize; 2],

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_epochs")]
    pub epochs: usize,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    #[serde(default = "default_true")]
    pub augment: bool,

    /// Probability above which a raster is predicted burned.
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Epochs without validation-loss improvement before stopping.
    #[serde(default = "default_patience")]
    pub patience: usize,

    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            input_size: default_input_size(),
            batch_size: default_batch_size(),
            epochs: default_epochs(),
            learning_rate: default_learning_rate(),
            augment: true,
            threshold: default_threshold(),
            patience: default_patience(),
            seed: default_seed(),
        }
    }
}

fn default_input_size() -> [usize; 2] {
    [128, 128]
}
fn default_batch_size() -> usize {
    16
}
fn default_epochs() -> usize {
    8
}
fn default_learning_rate() -> f64 {
    5e-4
}
fn default_true() -> bool {
    true
}
fn default_threshold() -> f64 {
    0.5
}
fn default_patience() -> usize {
    5
}
fn default_seed() -> u64 {
    42
}

/// `[index]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Gaussian smoothing sigma in pixels. Zero disables smoothing.
    #[serde(default = "default_smoothing_sigma")]
    pub smoothing_sigma: f64,

    /// Keep processing the remaining rasters when one fails.
    #[serde(default)]
    pub isolate_failures: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            smoothing_sigma: default_smoothing_sigma(),
            isolate_failures: false,
        }
    }
}

fn default_smoothing_sigma() -> f64 {
    0.6
}

/// `[catalog]` section: Earth Engine REST endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_url")]
    pub base_url: String,

    /// Name of the env var holding the cloud project id.
    #[serde(default = "default_project_env")]
    pub project_env: String,

    /// Name of the env var holding the bearer token.
    #[serde(default = "default_catalog_token_env")]
    pub token_env: String,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: default_catalog_url(),
            project_env: default_project_env(),
            token_env: default_catalog_token_env(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl CatalogConfig {
    /// Parsed REST endpoint.
    pub fn endpoint(&self) -> Result<Url> {
        parse_endpoint("catalog.base_url", &self.base_url)
    }
}

fn default_catalog_url() -> String {
    "https://earthengine.googleapis.com".into()
}
fn default_project_env() -> String {
    "EE_PROJECT_ID".into()
}
fn default_catalog_token_env() -> String {
    "EARTHENGINE_TOKEN".into()
}
fn default_poll_interval() -> u64 {
    5
}

/// `[drive]` section: cloud file store endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    #[serde(default = "default_drive_url")]
    pub base_url: String,

    /// Name of the env var holding the bearer token.
    #[serde(default = "default_drive_token_env")]
    pub token_env: String,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            base_url: default_drive_url(),
            token_env: default_drive_token_env(),
        }
    }
}

impl DriveConfig {
    /// Parsed REST endpoint.
    pub fn endpoint(&self) -> Result<Url> {
        parse_endpoint("drive.base_url", &self.base_url)
    }
}

fn parse_endpoint(key: &str, raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| BurnwatchError::config(format!("{key} '{raw}' is not a URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(BurnwatchError::config(format!(
            "{key} '{raw}' must use http or https"
        )));
    }
    Ok(url)
}

fn default_drive_url() -> String {
    "https://www.googleapis.com".into()
}
fn default_drive_token_env() -> String {
    "GOOGLE_DRIVE_TOKEN".into()
}

/// `[paths]` section: local directories and files, relative to the working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_raw_dir")]
    pub raw_dir: PathBuf,
    #[serde(default = "default_index_dir")]
    pub index_dir: PathBuf,
    #[serde(default = "default_labels_csv")]
    pub labels_csv: PathBuf,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            raw_dir: default_raw_dir(),
            index_dir: default_index_dir(),
            labels_csv: default_labels_csv(),
            db_path: default_db_path(),
            models_dir: default_models_dir(),
            reports_dir: default_reports_dir(),
            backup_dir: default_backup_dir(),
        }
    }
}

impl PathsConfig {
    /// Where inference writes its predictions table.
    pub fn predictions_csv(&self) -> PathBuf {
        self.reports_dir.join("burn_predictions.csv")
    }
}

fn default_raw_dir() -> PathBuf {
    PathBuf::from("data/raw")
}
fn default_index_dir() -> PathBuf {
    PathBuf::from("data/ndvi")
}
fn default_labels_csv() -> PathBuf {
    PathBuf::from("data/labels/labels.csv")
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/db/ndvi_data.db")
}
fn default_models_dir() -> PathBuf {
    PathBuf::from("models")
}
fn default_reports_dir() -> PathBuf {
    PathBuf::from("output/reports")
}
fn default_backup_dir() -> PathBuf {
    PathBuf::from("backup")
}

impl AppConfig {
    /// Reject values no stage can work with.
    pub fn validate(&self) -> Result<()> {
        let imagery = &self.imagery;
        if imagery.max_tiles == 0 {
            return Err(BurnwatchError::config("imagery.max_tiles must be at least 1"));
        }
        if imagery.export_scale == 0 {
            return Err(BurnwatchError::config("imagery.export_scale must be positive"));
        }
        if !(0.0..=100.0).contains(&imagery.cloud_filter) {
            return Err(BurnwatchError::config(format!(
                "imagery.cloud_filter {} is not a percentage",
                imagery.cloud_filter
            )));
        }

        let classifier = &self.classifier;
        if classifier.input_size.contains(&0) {
            return Err(BurnwatchError::config("classifier.input_size must be non-zero"));
        }
        if classifier.batch_size == 0 {
            return Err(BurnwatchError::config("classifier.batch_size must be at least 1"));
        }
        if !(0.0..=1.0).contains(&classifier.threshold) {
            return Err(BurnwatchError::config(format!(
                "classifier.threshold {} must be within [0, 1]",
                classifier.threshold
            )));
        }

        self.catalog.endpoint()?;
        self.drive.endpoint()?;

        if !(self.index.smoothing_sigma >= 0.0) {
            return Err(BurnwatchError::config("index.smoothing_sigma must be >= 0"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.burnwatch/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| BurnwatchError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Find the config file to load. An explicit path must exist; otherwise
/// the working directory and then the user config directory are searched.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(BurnwatchError::config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        return Ok(Some(path.to_path_buf()));
    }

    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.is_file() {
        return Ok(Some(local));
    }

    if let Ok(dir) = config_dir() {
        let user = dir.join(CONFIG_FILE_NAME);
        if user.is_file() {
            return Ok(Some(user));
        }
    }

    Ok(None)
}

/// Load the application config. Returns defaults if no file is found.
pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    match resolve_config_path(explicit)? {
        Some(path) => load_config_from(&path),
        None => {
            tracing::debug!("no config file found, using defaults");
            Ok(AppConfig::default())
        }
    }
}

/// Load the application config from a specific file. `.json` files are
/// parsed as JSON, everything else as TOML.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| BurnwatchError::io(path, e))?;

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    let config: AppConfig = if is_json {
        serde_json::from_str(&content).map_err(|e| {
            BurnwatchError::config(format!("failed to parse {}: {e}", path.display()))
        })?
    } else {
        toml::from_str(&content).map_err(|e| {
            BurnwatchError::config(format!("failed to parse {}: {e}", path.display()))
        })?
    };

    config.validate()?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(config)
}

/// Write a default config file. Defaults to `~/.burnwatch/burnwatch.toml`.
/// An existing file is only replaced with `force`.
pub fn init_config(path: Option<&Path>, force: bool) -> Result<PathBuf> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_dir()?.join(CONFIG_FILE_NAME),
    };

    if path.exists() && !force {
        return Err(BurnwatchError::config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| BurnwatchError::io(parent, e))?;
    }

    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| BurnwatchError::config(e.to_string()))?;
    std::fs::write(&path, content).map_err(|e| BurnwatchError::io(&path, e))?;
    tracing::info!(path = %path.display(), "created default config file");

    Ok(path)
}

/// Read a credential from the named environment variable.
pub fn read_secret_env(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val.trim().to_string()),
        _ => Err(BurnwatchError::config(format!(
            "credential not found. Set the {var_name} environment variable."
        ))),
    }
}
