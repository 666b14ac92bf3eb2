//! Loading index rasters into model inputs and splitting them for validation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use burnwatch_index::read_raster;
use burnwatch_shared::{BurnwatchError, LabelRecord, PipelineObserver, Result};
use ndarray::{Array2, Array3, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

/// Per-axis source weights for area resampling: for every output index,
/// the overlapped source indices and their overlap lengths.
fn area_weights(src_len: usize, dst_len: usize) -> Vec<Vec<(usize, f64)>> {
    let scale = src_len as f64 / dst_len as f64;
    (0..dst_len)
        .map(|i| {
            let start = i as f64 * scale;
            let end = (i as f64 + 1.0) * scale;
            let first = start.floor() as usize;
            let last = (end.ceil() as usize).min(src_len);
            (first..last)
                .filter_map(|s| {
                    let overlap = end.min(s as f64 + 1.0) - start.max(s as f64);
                    (overlap > 1e-12).then_some((s, overlap))
                })
                .collect()
        })
        .collect()
}

/// Resample `src` to `(height, width)` by averaging each output pixel's
/// footprint in the source, weighted by overlap area.
pub fn resize_area(src: &Array2<f32>, width: usize, height: usize) -> Array2<f32> {
    let (src_h, src_w) = src.dim();
    if (src_h, src_w) == (height, width) {
        return src.clone();
    }

    let rows = area_weights(src_h, height);
    let cols = area_weights(src_w, width);
    Array2::from_shape_fn((height, width), |(i, j)| {
        let mut sum = 0.0f64;
        let mut weight = 0.0f64;
        for &(r, wr) in &rows[i] {
            for &(c, wc) in &cols[j] {
                sum += f64::from(src[[r, c]]) * wr * wc;
                weight += wr * wc;
            }
        }
        if weight > 0.0 { (sum / weight) as f32 } else { 0.0 }
    })
}

/// First band of an index raster mapped from [-1, 1] to [0, 1] and resized
/// to `(width, height)`. Non-finite pixels count as index 0.
pub fn load_index_image(path: &Path, size: (usize, usize)) -> Result<Array2<f32>> {
    let raster = read_raster(path)?;
    let band = raster.band(0, path)?;
    let scaled = band.mapv(|v| if v.is_finite() { (v + 1.0) / 2.0 } else { 0.5 });
    Ok(resize_area(&scaled, size.0, size.1))
}

// ---------------------------------------------------------------------------
// Training set
// ---------------------------------------------------------------------------

/// Stacked model inputs with their labels.
#[derive(Debug, Clone)]
pub struct Dataset {
    /// `(n, height, width)`.
    pub inputs: Array3<f32>,
    pub labels: Vec<u8>,
    pub paths: Vec<PathBuf>,
    /// Label rows whose raster was not found.
    pub missing: usize,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Inputs and float targets for the given rows, in that order.
    pub fn select(&self, rows: &[usize]) -> (Array3<f32>, Vec<f32>) {
        let inputs = self.inputs.select(Axis(0), rows);
        let targets = rows.iter().map(|&i| f32::from(self.labels[i])).collect();
        (inputs, targets)
    }
}

/// Where a labels-table path points: absolute paths as written, relative
/// ones by file name inside `index_dir`.
pub fn resolve_label_path(path: &str, index_dir: &Path) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        return candidate.to_path_buf();
    }
    index_dir.join(burnwatch_shared::file_key(path))
}

/// Load every labelled raster that exists. Missing files are counted and
/// reported, not fatal.
pub fn load_training_set(
    labels: &[LabelRecord],
    index_dir: &Path,
    size: (usize, usize),
    observer: &dyn PipelineObserver,
) -> Result<Dataset> {
    let (width, height) = size;
    let mut images = Vec::new();
    let mut kept_labels = Vec::new();
    let mut paths = Vec::new();
    let mut missing = 0usize;

    for (i, record) in labels.iter().enumerate() {
        let path = resolve_label_path(&record.path, index_dir);
        observer.progress(i + 1, labels.len(), &record.key());
        if !path.is_file() {
            tracing::debug!(path = %path.display(), "labelled raster not found");
            missing += 1;
            continue;
        }
        images.push(load_index_image(&path, size)?);
        kept_labels.push(record.label);
        paths.push(path);
    }

    if missing > 0 {
        tracing::warn!(missing, "labelled rasters not found");
        observer.warning(&format!("{missing} labelled rasters were not found and were skipped"));
    }

    let mut inputs = Array3::<f32>::zeros((images.len(), height, width));
    for (i, image) in images.iter().enumerate() {
        inputs.index_axis_mut(Axis(0), i).assign(image);
    }

    Ok(Dataset {
        inputs,
        labels: kept_labels,
        paths,
        missing,
    })
}

// ---------------------------------------------------------------------------
// Validation split
// ---------------------------------------------------------------------------

/// Row indices for training and validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
}

/// Hold out `ceil(fraction * n)` rows for validation with a seeded shuffle.
///
/// The split is stratified by label when there are at least two classes
/// and every class has at least two members. Fewer than two rows leaves
/// everything in training.
pub fn split_validation(labels: &[u8], fraction: f64, seed: u64) -> Split {
    let n = labels.len();
    if n < 2 {
        return Split {
            train: (0..n).collect(),
            validation: Vec::new(),
        };
    }

    let n_val = ((fraction * n as f64).ceil() as usize).clamp(1, n - 1);
    let mut rng = StdRng::seed_from_u64(seed);

    let mut by_class: BTreeMap<u8, Vec<usize>> = BTreeMap::new();
    for (i, &label) in labels.iter().enumerate() {
        by_class.entry(label).or_default().push(i);
    }
    let stratify = by_class.len() >= 2 && by_class.values().all(|rows| rows.len() >= 2);

    let mut split = Split::default();
    if stratify {
        // Proportional allocation, remainder to the largest fractional shares.
        // Every class gets a validation row when there is room for all.
        let floor_min = usize::from(n_val >= by_class.len());
        let mut alloc: Vec<(u8, usize, f64)> = by_class
            .iter()
            .map(|(&class, rows)| {
                let exact = rows.len() as f64 * n_val as f64 / n as f64;
                let share = (exact.floor() as usize).max(floor_min);
                (class, share, exact - exact.floor())
            })
            .collect();
        let mut remainder = n_val.saturating_sub(alloc.iter().map(|a| a.1).sum::<usize>());
        let mut order: Vec<usize> = (0..alloc.len()).collect();
        order.sort_by(|&a, &b| alloc[b].2.total_cmp(&alloc[a].2));
        for idx in order.into_iter().cycle().take(alloc.len() * 2) {
            if remainder == 0 {
                break;
            }
            let class_size = by_class[&alloc[idx].0].len();
            if alloc[idx].1 + 1 < class_size {
                alloc[idx].1 += 1;
                remainder -= 1;
            }
        }

        for (class, count, _) in alloc {
            let mut rows = by_class[&class].clone();
            rows.shuffle(&mut rng);
            split.validation.extend_from_slice(&rows[..count]);
            split.train.extend_from_slice(&rows[count..]);
        }
        split.train.shuffle(&mut rng);
        split.validation.shuffle(&mut rng);
    } else {
        let mut rows: Vec<usize> = (0..n).collect();
        rows.shuffle(&mut rng);
        split.validation = rows[..n_val].to_vec();
        split.train = rows[n_val..].to_vec();
    }
    split
}

pub(crate) fn ensure_examples(dataset: &Dataset) -> Result<()> {
    if dataset.is_empty() {
        return Err(BurnwatchError::validation(
            "no labelled rasters available for training",
        ));
    }
    Ok(())
}
