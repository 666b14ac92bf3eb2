//! Training and inference around an [`ImageModel`].

use std::path::{Path, PathBuf};

use burnwatch_evaluation::{ClassificationReport, ConfusionMatrix, read_labels, write_predictions};
use burnwatch_shared::{
    BurnwatchError, ClassifierConfig, PipelineObserver, PredictionRecord, Result,
};
use burnwatch_storage::Storage;
use ndarray::{Array3, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::instrument;

use crate::augment::augment_batch;
use crate::dataset::{ensure_examples, load_index_image, load_training_set, split_validation};
use crate::model::{ImageModel, ModelSpec};

pub const BEST_MODEL_FILE: &str = "best_model.safetensors";
pub const FINAL_MODEL_FILE: &str = "final_model.safetensors";
pub const METRICS_FILE: &str = "model_metrics.txt";

const VALIDATION_FRACTION: f64 = 0.25;
const MIN_RECOMMENDED_EXAMPLES: usize = 4;
/// Validation accuracy and the training report always cut at 0.5. The
/// configured threshold applies to inference only.
const VALIDATION_THRESHOLD: f64 = 0.5;

// ---------------------------------------------------------------------------
// Options and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct TrainOptions {
    pub spec: ModelSpec,
    pub batch_size: usize,
    pub epochs: usize,
    pub augment: bool,
    /// Epochs without validation-loss improvement before stopping.
    pub patience: usize,
    pub seed: u64,
}

impl From<&ClassifierConfig> for TrainOptions {
    fn from(config: &ClassifierConfig) -> Self {
        Self {
            spec: ModelSpec::from(config),
            batch_size: config.batch_size,
            epochs: config.epochs,
            augment: config.augment,
            patience: config.patience,
            seed: config.seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: Option<f64>,
    pub val_accuracy: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub examples: usize,
    pub missing: usize,
    pub train_size: usize,
    pub val_size: usize,
    pub epochs: Vec<EpochStats>,
    pub stopped_early: bool,
    /// Checkpoint with the best validation accuracy; absent without a
    /// validation split.
    pub best_model: Option<PathBuf>,
    pub final_model: PathBuf,
    pub report: Option<ClassificationReport>,
    pub metrics_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct InferenceOutcome {
    pub rows: Vec<PredictionRecord>,
    pub run_id: String,
    pub csv: PathBuf,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Mean binary cross-entropy of probabilities against 0/1 targets.
fn bce(probs: &[f64], targets: &[f32]) -> f64 {
    const EPS: f64 = 1e-7;
    if probs.is_empty() {
        return 0.0;
    }
    let total: f64 = probs
        .iter()
        .zip(targets)
        .map(|(&p, &t)| {
            let p = p.clamp(EPS, 1.0 - EPS);
            let t = f64::from(t);
            -(t * p.ln() + (1.0 - t) * (1.0 - p).ln())
        })
        .sum();
    total / probs.len() as f64
}

fn accuracy(probs: &[f64], targets: &[f32], threshold: f64) -> f64 {
    if probs.is_empty() {
        return 0.0;
    }
    let correct = probs
        .iter()
        .zip(targets)
        .filter(|&(&p, &t)| (p > threshold) == (t > 0.5))
        .count();
    correct as f64 / probs.len() as f64
}

fn is_index_raster(path: &Path) -> bool {
    path.is_file()
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with("_ndvi.tif"))
}

/// `*_ndvi.tif` files in `dir`, sorted. A missing directory has none.
fn index_rasters(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BurnwatchError::io(dir, e)),
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| is_index_raster(p))
        .collect();
    paths.sort();
    Ok(paths)
}

// ---------------------------------------------------------------------------
// Training
// ---------------------------------------------------------------------------

/// Train a fresh model on the labelled index rasters.
///
/// Writes `best_model.safetensors` (best validation accuracy) and
/// `final_model.safetensors` to `models_dir`, and the validation report to
/// `reports_dir/model_metrics.txt` when a validation split exists.
#[instrument(skip_all, fields(labels = %labels_csv.display(), epochs = opts.epochs))]
pub fn train<M: ImageModel>(
    labels_csv: &Path,
    index_dir: &Path,
    models_dir: &Path,
    reports_dir: &Path,
    opts: &TrainOptions,
    observer: &dyn PipelineObserver,
) -> Result<TrainOutcome> {
    observer.phase("Loading labelled rasters");
    let labels = read_labels(labels_csv)?;
    let dataset = load_training_set(&labels, index_dir, opts.spec.input_size, observer)?;
    ensure_examples(&dataset)?;
    if dataset.len() < MIN_RECOMMENDED_EXAMPLES {
        tracing::warn!(examples = dataset.len(), "very few labelled examples");
        observer.warning(&format!(
            "only {} labelled examples; the model will be unreliable",
            dataset.len()
        ));
    }

    let split = split_validation(&dataset.labels, VALIDATION_FRACTION, opts.seed);
    let validation = (!split.validation.is_empty()).then(|| dataset.select(&split.validation));
    tracing::info!(
        train = split.train.len(),
        validation = split.validation.len(),
        "split dataset"
    );

    std::fs::create_dir_all(models_dir).map_err(|e| BurnwatchError::io(models_dir, e))?;
    let best_path = models_dir.join(BEST_MODEL_FILE);
    let final_path = models_dir.join(FINAL_MODEL_FILE);

    let mut model = M::build(&opts.spec)?;
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let mut history = Vec::with_capacity(opts.epochs);
    let mut best_accuracy = f64::NEG_INFINITY;
    let mut best_loss = f64::INFINITY;
    let mut best_weights: Option<M::Snapshot> = None;
    let mut best_saved = false;
    let mut stale_epochs = 0usize;
    let mut stopped_early = false;

    observer.phase("Training");
    for epoch in 1..=opts.epochs {
        let mut order = split.train.clone();
        order.shuffle(&mut rng);
        let (mut inputs, targets) = dataset.select(&order);
        if opts.augment {
            inputs = augment_batch(&inputs, &mut rng);
        }
        let train_loss = model.fit_epoch(&inputs, &targets, opts.batch_size)?;

        let mut stats = EpochStats {
            epoch,
            train_loss,
            val_loss: None,
            val_accuracy: None,
        };

        if let Some((val_inputs, val_targets)) = &validation {
            let probs = model.predict(val_inputs)?;
            let val_loss = bce(&probs, val_targets);
            let val_accuracy = accuracy(&probs, val_targets, VALIDATION_THRESHOLD);
            stats.val_loss = Some(val_loss);
            stats.val_accuracy = Some(val_accuracy);

            if val_accuracy > best_accuracy {
                best_accuracy = val_accuracy;
                model.save(&best_path)?;
                best_saved = true;
                tracing::debug!(epoch, val_accuracy, "checkpointed best model");
            }

            if val_loss < best_loss {
                best_loss = val_loss;
                best_weights = Some(model.snapshot()?);
                stale_epochs = 0;
            } else {
                stale_epochs += 1;
            }
        }

        tracing::info!(
            epoch,
            train_loss,
            val_loss = ?stats.val_loss,
            val_accuracy = ?stats.val_accuracy,
            "epoch finished"
        );
        observer.progress(epoch, opts.epochs, &format!("loss {train_loss:.4}"));
        history.push(stats);

        if validation.is_some() && stale_epochs >= opts.patience.max(1) {
            if let Some(weights) = &best_weights {
                model.restore(weights)?;
            }
            stopped_early = true;
            tracing::info!(epoch, "early stopping, restored best weights");
            break;
        }
    }

    model.save(&final_path)?;

    let mut report = None;
    let mut metrics_path = None;
    if let Some((val_inputs, val_targets)) = &validation {
        let probs = model.predict(val_inputs)?;
        let cm = ConfusionMatrix::from_pairs(
            probs
                .iter()
                .zip(val_targets)
                .map(|(&p, &t)| (u8::from(t > 0.5), u8::from(p > VALIDATION_THRESHOLD))),
        );
        let rendered = ClassificationReport::from_confusion(&cm);
        std::fs::create_dir_all(reports_dir).map_err(|e| BurnwatchError::io(reports_dir, e))?;
        let path = reports_dir.join(METRICS_FILE);
        std::fs::write(&path, rendered.render()).map_err(|e| BurnwatchError::io(&path, e))?;
        tracing::info!(path = %path.display(), accuracy = rendered.accuracy, "wrote validation report");
        report = Some(rendered);
        metrics_path = Some(path);
    }

    Ok(TrainOutcome {
        examples: dataset.len(),
        missing: dataset.missing,
        train_size: split.train.len(),
        val_size: split.validation.len(),
        epochs: history,
        stopped_early,
        best_model: best_saved.then_some(best_path),
        final_model: final_path,
        report,
        metrics_path,
    })
}

// ---------------------------------------------------------------------------
// Inference
// ---------------------------------------------------------------------------

fn predict_folder<M: ImageModel>(
    model_path: &Path,
    index_dir: &Path,
    spec: &ModelSpec,
    threshold: f64,
    observer: &dyn PipelineObserver,
) -> Result<Vec<PredictionRecord>> {
    let rasters = index_rasters(index_dir)?;
    if rasters.is_empty() {
        return Ok(Vec::new());
    }
    let model = M::load(model_path, spec)?;

    let (width, height) = spec.input_size;
    let mut inputs = Array3::<f32>::zeros((rasters.len(), height, width));
    for (i, path) in rasters.iter().enumerate() {
        observer.progress(i + 1, rasters.len(), &path.display().to_string());
        let image = load_index_image(path, spec.input_size)?;
        inputs.index_axis_mut(Axis(0), i).assign(&image);
    }

    let probs = model.predict(&inputs)?;
    Ok(rasters
        .iter()
        .zip(probs)
        .map(|(path, prob)| {
            PredictionRecord::new(path.to_string_lossy().replace('\\', "/"), prob, threshold)
        })
        .collect())
}

/// Classify every `*_ndvi.tif` in `index_dir`, write the predictions CSV,
/// and replace the stored predictions table.
#[instrument(skip_all, fields(model = %model_path.display(), index_dir = %index_dir.display()))]
pub async fn infer<M: ImageModel>(
    model_path: &Path,
    index_dir: &Path,
    predictions_csv: &Path,
    storage: &Storage,
    spec: &ModelSpec,
    threshold: f64,
    observer: &dyn PipelineObserver,
) -> Result<InferenceOutcome> {
    observer.phase("Running inference");
    let rows = predict_folder::<M>(model_path, index_dir, spec, threshold, observer)?;

    write_predictions(predictions_csv, &rows)?;
    let run_id = storage
        .replace_predictions(&rows, &model_path.to_string_lossy())
        .await?;

    let burned = rows.iter().filter(|r| r.pred == 1).count();
    tracing::info!(rows = rows.len(), burned, run_id = %run_id, "inference complete");

    Ok(InferenceOutcome {
        rows,
        run_id,
        csv: predictions_csv.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::Mutex;

    use burnwatch_index::{GeoTags, write_index_raster};
    use burnwatch_shared::SilentObserver;
    use ndarray::Array2;
    use uuid::Uuid;

    /// Predicts `1 - mean(pixel) + drift`; each epoch increases the drift.
    struct DriftModel {
        drift: Cell<f64>,
        step: f64,
    }

    impl ImageModel for DriftModel {
        type Snapshot = f64;

        fn build(_: &ModelSpec) -> Result<Self> {
            Ok(Self {
                drift: Cell::new(0.0),
                step: 0.05,
            })
        }

        fn load(path: &Path, _: &ModelSpec) -> Result<Self> {
            let text = std::fs::read_to_string(path).map_err(|e| BurnwatchError::io(path, e))?;
            let drift = text
                .trim()
                .parse()
                .map_err(|_| BurnwatchError::model("bad weights"))?;
            Ok(Self {
                drift: Cell::new(drift),
                step: 0.05,
            })
        }

        fn fit_epoch(&mut self, inputs: &Array3<f32>, targets: &[f32], _: usize) -> Result<f64> {
            assert_eq!(inputs.dim().0, targets.len());
            self.drift.set(self.drift.get() + self.step);
            Ok(0.5)
        }

        fn predict(&self, inputs: &Array3<f32>) -> Result<Vec<f64>> {
            Ok(inputs
                .axis_iter(Axis(0))
                .map(|img| {
                    let mean = img.mean().map_or(0.0, f64::from);
                    (1.0 - mean + self.drift.get()).clamp(0.0, 1.0)
                })
                .collect())
        }

        fn snapshot(&self) -> Result<f64> {
            Ok(self.drift.get())
        }

        fn restore(&mut self, snapshot: &f64) -> Result<()> {
            self.drift.set(*snapshot);
            Ok(())
        }

        fn save(&self, path: &Path) -> Result<()> {
            std::fs::write(path, self.drift.get().to_string()).map_err(|e| BurnwatchError::io(path, e))
        }
    }

    struct Workspace {
        root: PathBuf,
    }

    impl Workspace {
        fn new() -> Self {
            let root = std::env::temp_dir().join(format!("burnwatch_lifecycle_{}", Uuid::now_v7()));
            std::fs::create_dir_all(root.join("ndvi")).unwrap();
            Self { root }
        }

        fn index_dir(&self) -> PathBuf {
            self.root.join("ndvi")
        }

        /// Burned tiles have low index values.
        fn write_tile(&self, name: &str, burned: bool) {
            let value = if burned { -0.6 } else { 0.7 };
            let data = Array2::from_elem((6, 6), value);
            write_index_raster(&self.index_dir().join(name), &data, &GeoTags::default()).unwrap();
        }

        fn write_labels(&self, rows: &[(&str, u8)]) -> PathBuf {
            let path = self.root.join("labels.csv");
            let mut text = String::from("path,label\n");
            for (name, label) in rows {
                text.push_str(&format!("{name},{label}\n"));
            }
            std::fs::write(&path, text).unwrap();
            path
        }
    }

    impl Drop for Workspace {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    fn options(epochs: usize) -> TrainOptions {
        TrainOptions {
            spec: ModelSpec {
                input_size: (4, 4),
                learning_rate: 1e-3,
            },
            batch_size: 2,
            epochs,
            augment: true,
            patience: 5,
            seed: 42,
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        warnings: Mutex<Vec<String>>,
    }

    impl PipelineObserver for RecordingObserver {
        fn phase(&self, _: &str) {}
        fn progress(&self, _: usize, _: usize, _: &str) {}
        fn warning(&self, message: &str) {
            self.warnings.lock().unwrap().push(message.to_string());
        }
    }

    fn balanced_workspace() -> (Workspace, PathBuf) {
        let ws = Workspace::new();
        let mut labels = Vec::new();
        let names: Vec<String> = (0..8).map(|i| format!("t{i}_ndvi.tif")).collect();
        for (i, name) in names.iter().enumerate() {
            ws.write_tile(name, i % 2 == 0);
        }
        for (i, name) in names.iter().enumerate() {
            labels.push((name.as_str(), u8::from(i % 2 == 0)));
        }
        let csv = ws.write_labels(&labels);
        (ws, csv)
    }

    #[test]
    fn early_stopping_restores_best_loss_weights() {
        let (ws, labels) = balanced_workspace();
        let outcome = train::<DriftModel>(
            &labels,
            &ws.index_dir(),
            &ws.root.join("models"),
            &ws.root.join("reports"),
            &options(20),
            &SilentObserver,
        )
        .unwrap();

        assert_eq!(outcome.examples, 8);
        assert_eq!((outcome.train_size, outcome.val_size), (6, 2));
        // Validation loss only worsens after the first epoch.
        assert!(outcome.stopped_early);
        assert_eq!(outcome.epochs.len(), 6);

        let final_weights = DriftModel::load(&outcome.final_model, &options(1).spec).unwrap();
        assert!((final_weights.drift.get() - 0.05).abs() < 1e-9);
        assert!(outcome.best_model.as_ref().is_some_and(|p| p.is_file()));
        assert!(outcome.metrics_path.as_ref().is_some_and(|p| p.is_file()));
        assert!(outcome.report.is_some());
    }

    #[test]
    fn missing_rasters_are_skipped_and_small_sets_warn() {
        let ws = Workspace::new();
        ws.write_tile("a_ndvi.tif", true);
        ws.write_tile("b_ndvi.tif", false);
        let labels = ws.write_labels(&[
            ("a_ndvi.tif", 1),
            ("b_ndvi.tif", 0),
            ("gone_ndvi.tif", 1),
        ]);
        let observer = RecordingObserver::default();

        let outcome = train::<DriftModel>(
            &labels,
            &ws.index_dir(),
            &ws.root.join("models"),
            &ws.root.join("reports"),
            &options(2),
            &observer,
        )
        .unwrap();

        assert_eq!(outcome.examples, 2);
        assert_eq!(outcome.missing, 1);
        let warnings = observer.warnings.lock().unwrap();
        assert!(warnings.iter().any(|w| w.contains("not found")));
        assert!(warnings.iter().any(|w| w.contains("only 2")));
    }

    #[test]
    fn single_example_trains_without_validation() {
        let ws = Workspace::new();
        ws.write_tile("a_ndvi.tif", true);
        let labels = ws.write_labels(&[("a_ndvi.tif", 1)]);

        let outcome = train::<DriftModel>(
            &labels,
            &ws.index_dir(),
            &ws.root.join("models"),
            &ws.root.join("reports"),
            &options(3),
            &SilentObserver,
        )
        .unwrap();

        assert_eq!(outcome.val_size, 0);
        assert_eq!(outcome.epochs.len(), 3);
        assert!(outcome.best_model.is_none());
        assert!(outcome.report.is_none());
        assert!(outcome.final_model.is_file());
    }

    #[test]
    fn no_usable_examples_is_an_error() {
        let ws = Workspace::new();
        let labels = ws.write_labels(&[("gone_ndvi.tif", 1)]);
        let err = train::<DriftModel>(
            &labels,
            &ws.index_dir(),
            &ws.root.join("models"),
            &ws.root.join("reports"),
            &options(1),
            &SilentObserver,
        )
        .unwrap_err();
        assert!(matches!(err, BurnwatchError::Validation { .. }));
    }

    #[tokio::test]
    async fn inference_replaces_stored_predictions() {
        let ws = Workspace::new();
        ws.write_tile("t1_ndvi.tif", true);
        ws.write_tile("t2_ndvi.tif", false);
        std::fs::write(ws.index_dir().join("notes.txt"), "ignored").unwrap();
        let model_path = ws.root.join("final_model.safetensors");
        std::fs::write(&model_path, "0").unwrap();

        let storage = Storage::open(&ws.root.join("results.db")).await.unwrap();
        storage
            .replace_predictions(
                &[PredictionRecord::new("old/stale_ndvi.tif", 0.9, 0.5)],
                "old",
            )
            .await
            .unwrap();

        let csv = ws.root.join("reports").join("burn_predictions.csv");
        let spec = options(1).spec;
        let outcome = infer::<DriftModel>(
            &model_path,
            &ws.index_dir(),
            &csv,
            &storage,
            &spec,
            0.5,
            &SilentObserver,
        )
        .await
        .unwrap();

        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(outcome.rows[0].key(), "t1_ndvi.tif");
        assert_eq!(outcome.rows[0].pred, 1);
        assert_eq!(outcome.rows[1].pred, 0);
        assert!(csv.is_file());

        let stored = storage.list_predictions().await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|r| r.key() != "stale_ndvi.tif"));
        assert_eq!(storage.count_runs().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_index_dir_clears_predictions() {
        let ws = Workspace::new();
        let storage = Storage::open(&ws.root.join("results.db")).await.unwrap();
        storage
            .replace_predictions(&[PredictionRecord::new("a_ndvi.tif", 0.9, 0.5)], "old")
            .await
            .unwrap();

        let csv = ws.root.join("burn_predictions.csv");
        let outcome = infer::<DriftModel>(
            &ws.root.join("absent.safetensors"),
            &ws.index_dir(),
            &csv,
            &storage,
            &options(1).spec,
            0.5,
            &SilentObserver,
        )
        .await
        .unwrap();

        assert!(outcome.rows.is_empty());
        assert_eq!(storage.count_predictions().await.unwrap(), 0);
    }

    #[test]
    fn loss_and_accuracy_helpers() {
        assert!((bce(&[0.5, 0.5], &[1.0, 0.0]) - std::f64::consts::LN_2).abs() < 1e-9);
        assert!(bce(&[1.0], &[0.0]).is_finite());
        assert_eq!(
            accuracy(&[0.9, 0.2, 0.7], &[1.0, 0.0, 0.0], VALIDATION_THRESHOLD),
            2.0 / 3.0
        );
    }

    #[test]
    fn inference_threshold_does_not_change_training_options() {
        let strict = ClassifierConfig {
            threshold: 0.9,
            ..ClassifierConfig::default()
        };
        assert_eq!(
            TrainOptions::from(&strict),
            TrainOptions::from(&ClassifierConfig::default())
        );
    }
}
