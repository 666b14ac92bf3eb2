//! Shared types, error model, and configuration for burnwatch.
//!
//! This crate is the foundation depended on by all other burnwatch crates.
//! It provides:
//! - [`BurnwatchError`]: the unified error type
//! - Domain types ([`AreaOfInterest`], [`ExportJob`], [`LabelRecord`], [`PredictionRecord`])
//! - Configuration ([`AppConfig`] and its sections, config loading)
//! - [`PipelineObserver`]: the progress and warning sink passed into every stage

pub mod config;
pub mod error;
pub mod observer;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CatalogConfig, ClassifierConfig, DriveConfig, ImageryConfig, IndexConfig,
    PathsConfig, config_dir, init_config, load_config, load_config_from, read_secret_env,
    resolve_config_path,
};
pub use error::{BurnwatchError, Result};
pub use observer::{PipelineObserver, SilentObserver};
pub use types::{
    AoiSource, AreaOfInterest, ExportJob, JobState, LabelRecord, PredictionRecord, file_key,
};
