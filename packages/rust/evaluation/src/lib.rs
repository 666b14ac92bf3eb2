//! Label correlation and classifier evaluation for burnwatch.
//!
//! Reads the labels and predictions tables, joins them on file name, and
//! produces a confusion matrix plus a per-class classification report.

pub mod correlate;
pub mod report;
pub mod tables;

pub use correlate::{
    CONFUSION_FILE, CorrelatedRow, EVALUATION_METRICS_FILE, Evaluation, EvaluationOutcome, correlate,
    evaluate, evaluate_files,
};
pub use report::{ClassMetrics, ClassificationReport, ConfusionMatrix};
pub use tables::{read_labels, read_predictions, write_label_template, write_predictions};
