//! Pipeline orchestration for burnwatch.
//!
//! Sequences acquisition, synchronization, index computation, labelling,
//! training, inference, evaluation and backup for one run configuration,
//! and optionally repeats the acquisition-to-inference leg on an interval.

pub mod backup;
pub mod pipeline;
pub mod schedule;

pub use backup::{backup_artifacts, backup_name};
pub use pipeline::{Pipeline, RunSummary, Stage, StageResult, StageSet};
pub use schedule::{ScheduleReport, run_every};
