//! Core domain types for burnwatch.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BurnwatchError, Result};

// ---------------------------------------------------------------------------
// AreaOfInterest
// ---------------------------------------------------------------------------

/// Where an [`AreaOfInterest`] was resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AoiSource {
    /// A GeoJSON file or inline GeoJSON document.
    GeoJson,
    /// An axis-aligned `[min_lon, min_lat, max_lon, max_lat]` box.
    BoundingBox,
}

/// Closed polygon constraining every catalog query and export.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaOfInterest {
    geometry: Value,
    source: AoiSource,
    bounds: [f64; 4],
}

impl AreaOfInterest {
    /// Resolve the area of interest from the configured inputs.
    ///
    /// `aoi_geojson` is tried first, as a file path and then as inline JSON.
    /// When it is absent or does not yield a polygon, `bbox` is used.
    /// Fails with a config error when neither resolves.
    pub fn resolve(aoi_geojson: Option<&str>, bbox: Option<&[f64]>) -> Result<Self> {
        if let Some(raw) = aoi_geojson.map(str::trim).filter(|s| !s.is_empty()) {
            match geometry_from_geojson(raw) {
                Some(geometry) => {
                    if let Some(bounds) = geometry_bounds(&geometry) {
                        return Ok(Self {
                            geometry,
                            source: AoiSource::GeoJson,
                            bounds,
                        });
                    }
                    tracing::warn!("aoi_geojson polygon has no coordinates, trying bbox");
                }
                None => tracing::warn!("aoi_geojson did not resolve to a polygon, trying bbox"),
            }
        }

        if let Some(bbox) = bbox {
            return Self::from_bbox(bbox);
        }

        Err(BurnwatchError::config(
            "provide a valid 'aoi_geojson' or a 'bbox' [min_lon, min_lat, max_lon, max_lat]",
        ))
    }

    /// Build a planar rectangle from `[min_lon, min_lat, max_lon, max_lat]`.
    pub fn from_bbox(bbox: &[f64]) -> Result<Self> {
        let [min_lon, min_lat, max_lon, max_lat] = <[f64; 4]>::try_from(bbox).map_err(|_| {
            BurnwatchError::config(format!(
                "bbox must have exactly 4 values, got {}",
                bbox.len()
            ))
        })?;

        if !bbox.iter().all(|v| v.is_finite()) || min_lon >= max_lon || min_lat >= max_lat {
            return Err(BurnwatchError::config(format!(
                "bbox {bbox:?} is not a valid [min_lon, min_lat, max_lon, max_lat] rectangle"
            )));
        }

        let ring = vec![
            vec![min_lon, min_lat],
            vec![max_lon, min_lat],
            vec![max_lon, max_lat],
            vec![min_lon, max_lat],
            vec![min_lon, min_lat],
        ];

        Ok(Self {
            geometry: serde_json::json!({ "type": "Polygon", "coordinates": [ring] }),
            source: AoiSource::BoundingBox,
            bounds: [min_lon, min_lat, max_lon, max_lat],
        })
    }

    /// The GeoJSON geometry object (`Polygon` or `MultiPolygon`).
    pub fn to_geojson(&self) -> &Value {
        &self.geometry
    }

    /// `[min_lon, min_lat, max_lon, max_lat]` of the polygon.
    pub fn bounds(&self) -> [f64; 4] {
        self.bounds
    }

    /// Which input the polygon came from.
    pub fn source(&self) -> AoiSource {
        self.source
    }
}

/// Parse GeoJSON from a file path or an inline document and pull out its polygon geometry.
fn geometry_from_geojson(raw: &str) -> Option<Value> {
    let path = Path::new(raw);
    let text = if path.is_file() {
        match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read aoi_geojson file");
                return None;
            }
        }
    } else {
        raw.to_string()
    };

    let doc: Value = serde_json::from_str(&text).ok()?;
    let geometry = match doc.get("type").and_then(Value::as_str)? {
        "FeatureCollection" => doc.get("features")?.get(0)?.get("geometry")?.clone(),
        "Feature" => doc.get("geometry")?.clone(),
        _ => doc,
    };

    match geometry.get("type").and_then(Value::as_str)? {
        "Polygon" | "MultiPolygon" => Some(geometry),
        _ => None,
    }
}

/// Compute `[min_lon, min_lat, max_lon, max_lat]` over every position of a geometry.
fn geometry_bounds(geometry: &Value) -> Option<[f64; 4]> {
    fn walk(value: &Value, acc: &mut Option<[f64; 4]>) {
        let Some(items) = value.as_array() else {
            return;
        };
        let is_position = items.len() >= 2 && items.iter().all(Value::is_number);
        if is_position {
            let (Some(x), Some(y)) = (items[0].as_f64(), items[1].as_f64()) else {
                return;
            };
            let b = acc.get_or_insert([x, y, x, y]);
            b[0] = b[0].min(x);
            b[1] = b[1].min(y);
            b[2] = b[2].max(x);
            b[3] = b[3].max(y);
        } else {
            for item in items {
                walk(item, acc);
            }
        }
    }

    let mut acc = None;
    walk(geometry.get("coordinates")?, &mut acc);
    acc
}

// ---------------------------------------------------------------------------
// Export jobs
// ---------------------------------------------------------------------------

/// Lifecycle state of a remote export job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// Whether the job has stopped changing.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote export job submitted against the imagery catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportJob {
    /// Identifier assigned by the remote service.
    pub id: String,
    /// Job description, also used as the exported file name prefix.
    pub description: String,
    /// Cloud folder the raster is exported into.
    pub folder: String,
    /// Ground sample distance in meters.
    pub scale_m: u32,
    /// Last observed state.
    pub state: JobState,
    /// When the job was submitted.
    pub submitted_at: DateTime<Utc>,
}

impl ExportJob {
    /// Create a freshly submitted job in `PENDING` state.
    pub fn submitted(
        id: impl Into<String>,
        description: impl Into<String>,
        folder: impl Into<String>,
        scale_m: u32,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            folder: folder.into(),
            scale_m,
            state: JobState::Pending,
            submitted_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Record a newly observed state. Terminal jobs are read-only; returns
    /// whether the state changed.
    pub fn observe(&mut self, state: JobState) -> bool {
        if self.is_terminal() || self.state == state {
            return false;
        }
        self.state = state;
        true
    }
}

// ---------------------------------------------------------------------------
// Labels and predictions
// ---------------------------------------------------------------------------

/// Directory-independent key of a raster path: its final file name.
///
/// Both `/` and `\` are treated as separators so tables written on any
/// platform correlate.
pub fn file_key(path: &str) -> String {
    path.rsplit(['/', '\\']).next().unwrap_or(path).to_string()
}

/// Ground-truth label for one index raster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRecord {
    /// Raster path as written in the labels table.
    pub path: String,
    /// 1 = burned, 0 = not burned.
    pub label: u8,
}

impl LabelRecord {
    pub fn key(&self) -> String {
        file_key(&self.path)
    }
}

/// Classifier output for one index raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    /// Raster path the prediction was made for.
    pub path: String,
    /// Burned-area probability in [0, 1].
    pub prob: f64,
    /// Thresholded binary prediction.
    pub pred: u8,
}

impl PredictionRecord {
    /// Build a record, thresholding `prob` strictly above `threshold`.
    pub fn new(path: impl Into<String>, prob: f64, threshold: f64) -> Self {
        Self {
            path: path.into(),
            prob,
            pred: u8::from(prob > threshold),
        }
    }

    pub fn key(&self) -> String {
        file_key(&self.path)
    }
}
