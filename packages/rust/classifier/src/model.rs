//! Training/inference engine seam.

use std::path::Path;

use burnwatch_shared::{ClassifierConfig, Result};
use ndarray::Array3;

/// Shape and optimizer settings of a model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    /// Input `(width, height)` in pixels.
    pub input_size: (usize, usize),
    pub learning_rate: f64,
}

impl From<&ClassifierConfig> for ModelSpec {
    fn from(config: &ClassifierConfig) -> Self {
        Self {
            input_size: (config.input_size[0], config.input_size[1]),
            learning_rate: config.learning_rate,
        }
    }
}

/// A binary image classifier over single-channel inputs.
///
/// Inputs are `(n, height, width)` arrays with values in [0, 1]; outputs
/// are burned-area probabilities.
pub trait ImageModel: Sized {
    /// Opaque copy of the weights.
    type Snapshot;

    /// Fresh, untrained model.
    fn build(spec: &ModelSpec) -> Result<Self>;

    /// Model restored from a saved artifact.
    fn load(path: &Path, spec: &ModelSpec) -> Result<Self>;

    /// One pass over `inputs` in order, in batches of `batch_size`.
    /// Returns the mean training loss.
    fn fit_epoch(&mut self, inputs: &Array3<f32>, targets: &[f32], batch_size: usize)
    -> Result<f64>;

    /// Probability per input.
    fn predict(&self, inputs: &Array3<f32>) -> Result<Vec<f64>>;

    fn snapshot(&self) -> Result<Self::Snapshot>;

    fn restore(&mut self, snapshot: &Self::Snapshot) -> Result<()>;

    fn save(&self, path: &Path) -> Result<()>;
}
