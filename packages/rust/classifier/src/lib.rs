//! Burned-area classifier: dataset preparation, training, and inference.
//!
//! The training engine sits behind the [`ImageModel`] trait. [`CandleCnn`]
//! is the production backend, a small convolutional network on `candle`.

pub mod augment;
pub mod cnn;
pub mod dataset;
pub mod lifecycle;
pub mod model;

pub use augment::{Augmentation, augment_batch};
pub use cnn::CandleCnn;
pub use dataset::{
    Dataset, Split, load_index_image, load_training_set, resize_area, resolve_label_path,
    split_validation,
};
pub use lifecycle::{
    BEST_MODEL_FILE, EpochStats, FINAL_MODEL_FILE, InferenceOutcome, METRICS_FILE, TrainOptions,
    TrainOutcome, infer, train,
};
pub use model::{ImageModel, ModelSpec};
