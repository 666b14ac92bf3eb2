//! Join predictions with ground truth and evaluate them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use burnwatch_shared::{BurnwatchError, LabelRecord, PipelineObserver, PredictionRecord, Result};
use serde::Serialize;
use tracing::instrument;

use crate::report::{ClassificationReport, ConfusionMatrix};
use crate::tables::{read_labels, read_predictions};

/// Report written by [`evaluate_files`]. Kept apart from the training
/// validation report, which lives in the same reports directory.
pub const EVALUATION_METRICS_FILE: &str = "evaluation_metrics.txt";
pub const CONFUSION_FILE: &str = "confusion_matrix.json";

/// One prediction matched to its label.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelatedRow {
    /// Shared file-name key.
    pub key: String,
    /// Path as written in the predictions table.
    pub path: String,
    pub prob: f64,
    pub label: u8,
}

/// Inner join on file name, in prediction order.
///
/// Duplicate keys on either side produce every matching pair.
pub fn correlate(predictions: &[PredictionRecord], labels: &[LabelRecord]) -> Vec<CorrelatedRow> {
    let mut by_key: HashMap<String, Vec<u8>> = HashMap::new();
    for label in labels {
        by_key.entry(label.key()).or_default().push(label.label);
    }

    predictions
        .iter()
        .flat_map(|p| {
            let key = p.key();
            by_key
                .get(&key)
                .into_iter()
                .flatten()
                .map(move |&label| CorrelatedRow {
                    key: key.clone(),
                    path: p.path.clone(),
                    prob: p.prob,
                    label,
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Confusion matrix and report over the correlated rows.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub rows: Vec<CorrelatedRow>,
    pub confusion: ConfusionMatrix,
    pub report: ClassificationReport,
}

/// Evaluate predictions against labels, thresholding `prob > threshold`.
///
/// Returns `None` when no prediction matches a label.
pub fn evaluate(
    predictions: &[PredictionRecord],
    labels: &[LabelRecord],
    threshold: f64,
) -> Option<Evaluation> {
    let rows = correlate(predictions, labels);
    if rows.is_empty() {
        return None;
    }

    let confusion =
        ConfusionMatrix::from_pairs(rows.iter().map(|r| (r.label, u8::from(r.prob > threshold))));
    let report = ClassificationReport::from_confusion(&confusion);
    Some(Evaluation {
        rows,
        confusion,
        report,
    })
}

/// Result of [`evaluate_files`].
#[derive(Debug, Clone)]
pub enum EvaluationOutcome {
    Written {
        metrics_path: PathBuf,
        confusion_path: PathBuf,
        evaluation: Evaluation,
    },
    Skipped {
        reason: String,
    },
}

/// Evaluate the predictions table against the labels table and write
/// [`EVALUATION_METRICS_FILE`] and [`CONFUSION_FILE`] into `out_dir`.
///
/// Missing inputs or an empty join skip the evaluation with a warning.
#[instrument(skip_all, fields(results = %results_csv.display(), labels = %labels_csv.display()))]
pub fn evaluate_files(
    results_csv: &Path,
    labels_csv: &Path,
    out_dir: &Path,
    threshold: f64,
    observer: &dyn PipelineObserver,
) -> Result<EvaluationOutcome> {
    let skip = |reason: String| -> Result<EvaluationOutcome> {
        tracing::warn!(%reason, "evaluation skipped");
        observer.warning(&reason);
        Ok(EvaluationOutcome::Skipped { reason })
    };

    for (what, path) in [("predictions", results_csv), ("labels", labels_csv)] {
        if !path.is_file() {
            return skip(format!("{what} table not found at {}", path.display()));
        }
    }

    let predictions = read_predictions(results_csv)?;
    let labels = read_labels(labels_csv)?;
    let Some(evaluation) = evaluate(&predictions, &labels, threshold) else {
        return skip("no prediction matched a labelled raster".to_string());
    };

    std::fs::create_dir_all(out_dir).map_err(|e| BurnwatchError::io(out_dir, e))?;
    let metrics_path = out_dir.join(EVALUATION_METRICS_FILE);
    std::fs::write(&metrics_path, evaluation.report.render())
        .map_err(|e| BurnwatchError::io(&metrics_path, e))?;

    let confusion_path = out_dir.join(CONFUSION_FILE);
    let json = serde_json::to_string_pretty(&evaluation.confusion.to_json())
        .map_err(|e| BurnwatchError::validation(e.to_string()))?;
    std::fs::write(&confusion_path, json).map_err(|e| BurnwatchError::io(&confusion_path, e))?;

    tracing::info!(
        rows = evaluation.rows.len(),
        accuracy = evaluation.report.accuracy,
        "evaluation written"
    );
    Ok(EvaluationOutcome::Written {
        metrics_path,
        confusion_path,
        evaluation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::write_predictions;
    use burnwatch_shared::SilentObserver;
    use uuid::Uuid;

    fn label(path: &str, label: u8) -> LabelRecord {
        LabelRecord {
            path: path.into(),
            label,
        }
    }

    #[test]
    fn both_predictions_correct() {
        let labels = [label("t1_ndvi.tif", 1), label("t2_ndvi.tif", 0)];
        let predictions = [
            PredictionRecord::new("dir/t1_ndvi.tif", 0.9, 0.5),
            PredictionRecord::new("dir/t2_ndvi.tif", 0.2, 0.5),
        ];

        let eval = evaluate(&predictions, &labels, 0.5).unwrap();
        assert_eq!(eval.confusion.matrix, [[1, 0], [0, 1]]);
        assert_eq!(eval.report.accuracy, 1.0);
    }

    #[test]
    fn join_is_symmetric_under_key_normalization() {
        let a = correlate(
            &[PredictionRecord::new("a/b/tile_ndvi.tif", 0.7, 0.5)],
            &[label("tile_ndvi.tif", 1)],
        );
        let b = correlate(
            &[PredictionRecord::new("tile_ndvi.tif", 0.7, 0.5)],
            &[label("a/b/tile_ndvi.tif", 1)],
        );
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(a[0].key, b[0].key);
    }

    #[test]
    fn duplicates_produce_every_pair_in_prediction_order() {
        let labels = [label("x/t1_ndvi.tif", 1), label("y/t1_ndvi.tif", 0)];
        let predictions = [
            PredictionRecord::new("t2_ndvi.tif", 0.1, 0.5),
            PredictionRecord::new("t1_ndvi.tif", 0.8, 0.5),
        ];
        let rows = correlate(&predictions, &labels);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].label, 1);
        assert_eq!(rows[1].label, 0);
    }

    #[test]
    fn threshold_is_applied_to_probability() {
        let labels = [label("t1_ndvi.tif", 1)];
        // Stored pred says 1, but a stricter threshold flips it.
        let predictions = [PredictionRecord::new("t1_ndvi.tif", 0.6, 0.5)];
        let eval = evaluate(&predictions, &labels, 0.7).unwrap();
        assert_eq!(eval.confusion.matrix, [[0, 0], [1, 0]]);
    }

    #[test]
    fn empty_join_is_none() {
        let labels = [label("other_ndvi.tif", 1)];
        let predictions = [PredictionRecord::new("t1_ndvi.tif", 0.9, 0.5)];
        assert!(evaluate(&predictions, &labels, 0.5).is_none());
    }

    #[test]
    fn files_are_written_or_skipped() {
        let dir = std::env::temp_dir().join(format!("burnwatch_eval_{}", Uuid::now_v7()));
        let results = dir.join("burn_predictions.csv");
        let labels_csv = dir.join("labels.csv");
        let out = dir.join("figures");

        let outcome =
            evaluate_files(&results, &labels_csv, &out, 0.5, &SilentObserver).unwrap();
        assert!(matches!(outcome, EvaluationOutcome::Skipped { .. }));

        write_predictions(
            &results,
            &[
                PredictionRecord::new("data/ndvi/t1_ndvi.tif", 0.9, 0.5),
                PredictionRecord::new("data/ndvi/t2_ndvi.tif", 0.2, 0.5),
            ],
        )
        .unwrap();
        std::fs::write(&labels_csv, "path,label\nt1_ndvi.tif,1\nt2_ndvi.tif,0\n").unwrap();

        let outcome =
            evaluate_files(&results, &labels_csv, &out, 0.5, &SilentObserver).unwrap();
        let EvaluationOutcome::Written {
            metrics_path,
            confusion_path,
            evaluation,
        } = outcome
        else {
            panic!("expected written outcome");
        };
        assert_eq!(evaluation.rows.len(), 2);
        assert_eq!(metrics_path, out.join("evaluation_metrics.txt"));
        assert!(std::fs::read_to_string(metrics_path).unwrap().contains("accuracy"));
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(confusion_path).unwrap()).unwrap();
        assert_eq!(json["matrix"], serde_json::json!([[1, 0], [0, 1]]));

        std::fs::write(&labels_csv, "path,label\nunrelated_ndvi.tif,1\n").unwrap();
        let outcome =
            evaluate_files(&results, &labels_csv, &out, 0.5, &SilentObserver).unwrap();
        assert!(matches!(outcome, EvaluationOutcome::Skipped { .. }));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
