//! NDVI computation: per-band reflectance normalization, the normalized
//! difference itself, Gaussian smoothing, and the per-file and batch drivers.

use std::path::{Path, PathBuf};

use burnwatch_shared::{BurnwatchError, IndexConfig, PipelineObserver, Result};
use ndarray::{Array2, Zip};
use serde::Serialize;
use tracing::instrument;

use crate::raster::{list_rasters, read_raster, write_index_raster};

/// Added to the denominator so dark pixels never divide by zero.
const EPSILON: f32 = 1e-6;

/// Values above this are scaled integer reflectance rather than [0, 1] floats.
const SCALED_REFLECTANCE_THRESHOLD: f32 = 2.0;
const REFLECTANCE_SCALE: f32 = 1e-4;

/// Gaussian kernel support in standard deviations.
const GAUSSIAN_TRUNCATE: f64 = 4.0;

// ---------------------------------------------------------------------------
// Pure computation
// ---------------------------------------------------------------------------

/// Bring one band into [0, 1] reflectance.
///
/// A band whose maximum (ignoring NaN) exceeds 2 is treated as scaled
/// integer reflectance and multiplied by 1e-4. Every band is clipped to
/// [0, 1] afterwards. Each band is judged on its own values.
pub fn normalize_band(band: &Array2<f32>) -> Array2<f32> {
    let max = band
        .iter()
        .copied()
        .filter(|v| !v.is_nan())
        .fold(f32::NEG_INFINITY, f32::max);
    let scale = if max > SCALED_REFLECTANCE_THRESHOLD {
        REFLECTANCE_SCALE
    } else {
        1.0
    };
    band.mapv(|v| (v * scale).clamp(0.0, 1.0))
}

/// `(nir - red) / (nir + red + eps)` over normalized bands, clipped to [-1, 1].
pub fn compute_index(red: &Array2<f32>, nir: &Array2<f32>) -> Result<Array2<f32>> {
    if red.dim() != nir.dim() {
        return Err(BurnwatchError::validation(format!(
            "band shapes differ: red {:?}, nir {:?}",
            red.dim(),
            nir.dim()
        )));
    }

    let red = normalize_band(red);
    let nir = normalize_band(nir);
    Ok(Zip::from(&nir)
        .and(&red)
        .map_collect(|&n, &r| ((n - r) / (n + r + EPSILON)).clamp(-1.0, 1.0)))
}

fn gaussian_kernel(sigma: f64) -> Vec<f32> {
    let radius = (GAUSSIAN_TRUNCATE * sigma + 0.5) as isize;
    let weights: Vec<f64> = (-radius..=radius)
        .map(|x| (-0.5 * (x as f64 / sigma).powi(2)).exp())
        .collect();
    let sum: f64 = weights.iter().sum();
    weights.into_iter().map(|w| (w / sum) as f32).collect()
}

/// Separable Gaussian blur with nearest-edge padding, clipped to [-1, 1].
///
/// A non-positive `sigma` only clips.
pub fn smooth(index: &Array2<f32>, sigma: f64) -> Array2<f32> {
    if !(sigma > 0.0) {
        return index.mapv(|v| v.clamp(-1.0, 1.0));
    }

    let kernel = gaussian_kernel(sigma);
    let radius = (kernel.len() / 2) as isize;
    let (rows, cols) = index.dim();

    let convolve = |len: usize, sample: &dyn Fn(usize) -> f32| -> Vec<f32> {
        (0..len as isize)
            .map(|i| {
                kernel
                    .iter()
                    .enumerate()
                    .map(|(k, w)| {
                        let j = (i + k as isize - radius).clamp(0, len as isize - 1) as usize;
                        w * sample(j)
                    })
                    .sum()
            })
            .collect()
    };

    let mut horizontal = Array2::<f32>::zeros((rows, cols));
    for r in 0..rows {
        let row = convolve(cols, &|c| index[[r, c]]);
        for (c, v) in row.into_iter().enumerate() {
            horizontal[[r, c]] = v;
        }
    }

    let mut out = Array2::<f32>::zeros((rows, cols));
    for c in 0..cols {
        let col = convolve(rows, &|r| horizontal[[r, c]]);
        for (r, v) in col.into_iter().enumerate() {
            out[[r, c]] = v.clamp(-1.0, 1.0);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// File drivers
// ---------------------------------------------------------------------------

/// Options for index computation.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// 0-based band holding red reflectance.
    pub red_band: usize,
    /// 0-based band holding near-infrared reflectance.
    pub nir_band: usize,
    pub smoothing_sigma: f64,
    /// Record per-file failures and continue instead of aborting the batch.
    pub isolate_failures: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            red_band: 0,
            nir_band: 1,
            smoothing_sigma: 0.6,
            isolate_failures: false,
        }
    }
}

impl From<&IndexConfig> for IndexOptions {
    fn from(config: &IndexConfig) -> Self {
        Self {
            smoothing_sigma: config.smoothing_sigma,
            isolate_failures: config.isolate_failures,
            ..Self::default()
        }
    }
}

/// `<stem>_ndvi.tif` for a raw tile path.
pub fn index_file_name(src: &Path) -> String {
    let stem = src
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{stem}_ndvi.tif")
}

/// Compute the index raster for one raw tile and write it to `dst`.
pub fn compute_index_file(src: &Path, dst: &Path, options: &IndexOptions) -> Result<()> {
    let raster = read_raster(src)?;
    let red = raster.band(options.red_band, src)?;
    let nir = raster.band(options.nir_band, src)?;

    let index = compute_index(red, nir)?;
    let index = smooth(&index, options.smoothing_sigma);

    write_index_raster(dst, &index, &raster.geo)?;
    tracing::debug!(src = %src.display(), dst = %dst.display(), "wrote index raster");
    Ok(())
}

/// Outcome of a batch run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    /// Output rasters written.
    pub processed: Vec<PathBuf>,
    /// Inputs that failed, with the error message (only with `isolate_failures`).
    pub failed: Vec<(PathBuf, String)>,
}

impl BatchReport {
    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }
}

/// Compute an index raster for every `*.tif`/`*.tiff` in `raw_dir`.
///
/// Outputs go to `index_dir/<stem>_ndvi.tif`; the directory is created if
/// absent. By default the first failing tile aborts the batch.
#[instrument(skip_all, fields(raw_dir = %raw_dir.display()))]
pub fn batch_compute(
    raw_dir: &Path,
    index_dir: &Path,
    options: &IndexOptions,
    observer: &dyn PipelineObserver,
) -> Result<BatchReport> {
    std::fs::create_dir_all(index_dir).map_err(|e| BurnwatchError::io(index_dir, e))?;

    let inputs = if raw_dir.is_dir() {
        list_rasters(raw_dir)?
    } else {
        observer.warning(&format!("raw directory {} does not exist", raw_dir.display()));
        Vec::new()
    };

    let total = inputs.len();
    let mut report = BatchReport::default();
    for (i, src) in inputs.iter().enumerate() {
        let name = index_file_name(src);
        observer.progress(i + 1, total, &name);
        let dst = index_dir.join(&name);

        match compute_index_file(src, &dst, options) {
            Ok(()) => report.processed.push(dst),
            Err(e) if options.isolate_failures => {
                tracing::warn!(src = %src.display(), error = %e, "index computation failed");
                observer.warning(&format!("skipping {}: {e}", src.display()));
                report.failed.push((src.clone(), e.to_string()));
            }
            Err(e) => return Err(e),
        }
    }

    tracing::info!(
        processed = report.processed.len(),
        failed = report.failed.len(),
        "index batch finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::test_support::write_two_band_tile;
    use burnwatch_shared::SilentObserver;
    use ndarray::array;
    use uuid::Uuid;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("burnwatch_ndvi_{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn equal_bands_give_zero() {
        let band = array![[1200.0f32, 3000.0], [0.0, 450.0]];
        let index = compute_index(&band, &band).unwrap();
        assert!(index.iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn scaled_reflectance_ratio() {
        let red = array![[3000.0f32]];
        let nir = array![[6000.0f32]];
        let index = compute_index(&red, &nir).unwrap();
        assert!((index[[0, 0]] - 1.0 / 3.0).abs() < 1e-3);
    }

    #[test]
    fn normalization_is_per_band() {
        // Red is already reflectance, nir is scaled integers.
        let red = array![[0.3f32]];
        let nir = array![[6000.0f32]];
        let index = compute_index(&red, &nir).unwrap();
        assert!((index[[0, 0]] - 1.0 / 3.0).abs() < 1e-3);

        let clipped = normalize_band(&array![[-50.0f32, 20000.0]]);
        assert_eq!(clipped, array![[0.0f32, 1.0]]);
    }

    #[test]
    fn dark_pixels_do_not_divide_by_zero() {
        let zeros = Array2::<f32>::zeros((2, 2));
        let index = compute_index(&zeros, &zeros).unwrap();
        assert!(index.iter().all(|v| v.is_finite() && *v == 0.0));
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let a = Array2::<f32>::zeros((2, 2));
        let b = Array2::<f32>::zeros((3, 2));
        assert!(compute_index(&a, &b).is_err());
    }

    #[test]
    fn smoothing_preserves_constant_field_and_range() {
        let flat = Array2::from_elem((5, 7), 0.4f32);
        let smoothed = smooth(&flat, 0.6);
        assert!(smoothed.iter().all(|v| (v - 0.4).abs() < 1e-5));

        let spike = array![[-1.0f32, 1.0, -1.0], [1.0, -1.0, 1.0]];
        let smoothed = smooth(&spike, 0.6);
        assert!(smoothed.iter().all(|v| (-1.0..=1.0).contains(v)));
        assert!(smoothed[[0, 1]] < 1.0);
    }

    #[test]
    fn kernel_is_normalized_with_radius_two() {
        let kernel = gaussian_kernel(0.6);
        assert_eq!(kernel.len(), 5);
        let sum: f32 = kernel.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn file_roundtrip_writes_ndvi_next_to_stem() {
        let dir = temp_dir();
        let raw = dir.join("raw");
        let out = dir.join("ndvi");
        std::fs::create_dir_all(&raw).unwrap();
        write_two_band_tile(&raw.join("tile_0000.tif"), 2, 2, &[3000; 4], &[6000; 4]);
        write_two_band_tile(&raw.join("tile_0001.tif"), 2, 2, &[500; 4], &[500; 4]);

        let report =
            batch_compute(&raw, &out, &IndexOptions::default(), &SilentObserver).unwrap();
        assert_eq!(report.processed_count(), 2);
        assert!(report.failed.is_empty());

        let first = read_raster(&out.join("tile_0000_ndvi.tif")).unwrap();
        assert_eq!(first.bands.len(), 1);
        assert!(first.bands[0].iter().all(|v| (v - 1.0 / 3.0).abs() < 1e-3));
        assert_eq!(first.geo.pixel_scale, Some(vec![20.0, 20.0, 0.0]));

        let second = read_raster(&out.join("tile_0001_ndvi.tif")).unwrap();
        assert!(second.bands[0].iter().all(|v| v.abs() < 1e-6));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn failure_policy_controls_batch() {
        let dir = temp_dir();
        let raw = dir.join("raw");
        let out = dir.join("ndvi");
        std::fs::create_dir_all(&raw).unwrap();
        std::fs::write(raw.join("a_broken.tif"), b"not a tiff").unwrap();
        write_two_band_tile(&raw.join("b_good.tif"), 2, 2, &[100; 4], &[300; 4]);

        assert!(batch_compute(&raw, &out, &IndexOptions::default(), &SilentObserver).is_err());

        let isolating = IndexOptions {
            isolate_failures: true,
            ..IndexOptions::default()
        };
        let report = batch_compute(&raw, &out, &isolating, &SilentObserver).unwrap();
        assert_eq!(report.processed_count(), 1);
        assert_eq!(report.failed.len(), 1);
        assert!(out.join("b_good_ndvi.tif").is_file());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_raw_dir_processes_nothing() {
        let dir = temp_dir();
        let report = batch_compute(
            &dir.join("absent"),
            &dir.join("ndvi"),
            &IndexOptions::default(),
            &SilentObserver,
        )
        .unwrap();
        assert_eq!(report.processed_count(), 0);
        assert!(dir.join("ndvi").is_dir());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
