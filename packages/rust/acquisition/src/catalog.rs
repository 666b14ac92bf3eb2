//! Catalog service seam and the request types that cross it.

use async_trait::async_trait;
use burnwatch_shared::{AppConfig, AreaOfInterest, JobState, Result};
use chrono::NaiveDate;

/// Filters for a catalog search.
#[derive(Debug, Clone)]
pub struct CatalogQuery {
    /// Collection id, e.g. `COPERNICUS/S2_SR_HARMONIZED`.
    pub collection: String,
    pub start: NaiveDate,
    /// End of the window (exclusive, as catalog date filters are).
    pub end: NaiveDate,
    pub region: AreaOfInterest,
    /// Maximum cloudy pixel percentage.
    pub max_cloud_pct: f64,
}

impl CatalogQuery {
    /// Build the query from the `[imagery]` section.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let imagery = &config.imagery;
        let region = imagery.area_of_interest()?;
        let (start, end) = imagery.date_range()?;
        Ok(Self {
            collection: imagery.collection.clone(),
            start,
            end,
            region,
            max_cloud_pct: imagery.cloud_filter,
        })
    }
}

/// One image returned by a catalog search.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogImage {
    /// Asset id usable as an export source.
    pub id: String,
    /// Cloudy pixel percentage.
    pub cloud_cover: f64,
}

/// What an export job renders.
#[derive(Debug, Clone)]
pub enum ExportSource {
    /// A single catalog image.
    Image { id: String },
    /// Per-pixel median over every image matching the query.
    MedianComposite { query: CatalogQuery },
}

/// A fully specified export: bands `bands` of `source`, clipped to
/// `region`, cast to 16-bit signed integers, written as a cloud-optimized
/// GeoTIFF.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub source: ExportSource,
    pub bands: Vec<String>,
    pub region: AreaOfInterest,
    pub description: String,
    pub folder: String,
    pub file_name_prefix: String,
    pub scale_m: u32,
    pub crs: String,
    pub max_pixels: u64,
}

/// Export parameters shared by tile and mosaic mode.
#[derive(Debug, Clone)]
pub struct ExportSettings {
    /// Red band name, then near-infrared.
    pub bands: [String; 2],
    pub folder: String,
    pub scale_m: u32,
    /// Prefix of job descriptions and exported file names.
    pub prefix: String,
}

impl ExportSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let imagery = &config.imagery;
        Self {
            bands: [imagery.red_band.clone(), imagery.nir_band.clone()],
            folder: imagery.output_folder.clone(),
            scale_m: imagery.export_scale,
            prefix: imagery.tile_prefix.clone(),
        }
    }

    pub(crate) fn request(&self, source: ExportSource, region: &AreaOfInterest, description: String) -> ExportRequest {
        ExportRequest {
            source,
            bands: self.bands.to_vec(),
            region: region.clone(),
            file_name_prefix: description.clone(),
            description,
            folder: self.folder.clone(),
            scale_m: self.scale_m,
            crs: "EPSG:4326".into(),
            max_pixels: 1_000_000_000_000,
        }
    }
}

/// Tile mode: one job per candidate, at most `max_tiles`.
#[derive(Debug, Clone)]
pub struct TileRequest {
    pub query: CatalogQuery,
    pub settings: ExportSettings,
    pub max_tiles: usize,
}

impl TileRequest {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            query: CatalogQuery::from_config(config)?,
            settings: ExportSettings::from_config(config),
            max_tiles: config.imagery.max_tiles,
        })
    }
}

/// Mosaic mode: one median composite job over every candidate.
#[derive(Debug, Clone)]
pub struct MosaicRequest {
    pub query: CatalogQuery,
    pub settings: ExportSettings,
}

impl MosaicRequest {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            query: CatalogQuery::from_config(config)?,
            settings: ExportSettings::from_config(config),
        })
    }
}

/// Remote imagery catalog and export job service.
#[async_trait]
pub trait ImageryCatalog: Send + Sync {
    /// Images matching the query, in any order.
    async fn list_images(&self, query: &CatalogQuery) -> Result<Vec<CatalogImage>>;

    /// Start an export and return the job id.
    async fn submit_export(&self, request: &ExportRequest) -> Result<String>;

    /// Current state of a previously submitted job.
    async fn job_state(&self, job_id: &str) -> Result<JobState>;
}
