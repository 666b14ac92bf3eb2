//! Convolutional burned-area classifier on `candle`.

use std::collections::HashMap;
use std::path::Path;

use burnwatch_shared::{BurnwatchError, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{
    AdamW, Conv2d, Conv2dConfig, Linear, Module, Optimizer, ParamsAdamW, VarBuilder, VarMap,
};
use ndarray::{Array3, s};

use crate::model::{ImageModel, ModelSpec};

const PREDICT_BATCH: usize = 64;

fn model_err(err: candle_core::Error) -> BurnwatchError {
    BurnwatchError::model(err.to_string())
}

fn conv_cfg() -> Conv2dConfig {
    Conv2dConfig {
        padding: 1,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// Three 3x3 convolution stages, global average pooling, two dense layers.
struct Net {
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    dense1: Linear,
    dense2: Linear,
}

impl Net {
    fn new(vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            conv1: candle_nn::conv2d(1, 16, 3, conv_cfg(), vb.pp("conv1"))?,
            conv2: candle_nn::conv2d(16, 32, 3, conv_cfg(), vb.pp("conv2"))?,
            conv3: candle_nn::conv2d(32, 64, 3, conv_cfg(), vb.pp("conv3"))?,
            dense1: candle_nn::linear(64, 64, vb.pp("dense1"))?,
            dense2: candle_nn::linear(64, 1, vb.pp("dense2"))?,
        })
    }

    /// `(n, 1, h, w)` to `(n,)` logits.
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = self.conv1.forward(xs)?.relu()?.max_pool2d(2)?;
        let xs = self.conv2.forward(&xs)?.relu()?.max_pool2d(2)?;
        let xs = self.conv3.forward(&xs)?.relu()?.mean((2, 3))?;
        let xs = self.dense1.forward(&xs)?.relu()?;
        self.dense2.forward(&xs)?.squeeze(1)
    }
}

/// Mean binary cross-entropy on logits, in the overflow-free form
/// `max(x, 0) - x * t + ln(1 + e^-|x|)`.
fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> candle_core::Result<Tensor> {
    let softplus = logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    logits
        .relu()?
        .sub(&logits.mul(targets)?)?
        .add(&softplus)?
        .mean_all()
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

pub struct CandleCnn {
    varmap: VarMap,
    net: Net,
    optimizer: AdamW,
    device: Device,
    spec: ModelSpec,
}

impl std::fmt::Debug for CandleCnn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleCnn").field("spec", &self.spec).finish()
    }
}

impl CandleCnn {
    fn init(spec: &ModelSpec) -> candle_core::Result<Self> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let net = Net::new(vb)?;
        let params = ParamsAdamW {
            lr: spec.learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-7,
            weight_decay: 0.0,
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;
        Ok(Self {
            varmap,
            net,
            optimizer,
            device,
            spec: spec.clone(),
        })
    }

    /// Rows `start..end` of `inputs` as an `(n, 1, h, w)` tensor.
    fn batch_tensor(
        &self,
        inputs: &Array3<f32>,
        start: usize,
        end: usize,
    ) -> candle_core::Result<Tensor> {
        let (_, h, w) = inputs.dim();
        let data: Vec<f32> = inputs.slice(s![start..end, .., ..]).iter().copied().collect();
        Tensor::from_vec(data, (end - start, 1, h, w), &self.device)
    }

    fn check_shape(&self, inputs: &Array3<f32>) -> Result<()> {
        let (_, h, w) = inputs.dim();
        let (want_w, want_h) = self.spec.input_size;
        if (w, h) != (want_w, want_h) {
            return Err(BurnwatchError::model(format!(
                "input is {w}x{h}, model expects {want_w}x{want_h}"
            )));
        }
        Ok(())
    }

    fn train_epoch(
        &mut self,
        inputs: &Array3<f32>,
        targets: &[f32],
        batch_size: usize,
    ) -> candle_core::Result<f64> {
        let n = inputs.dim().0;
        let batch_size = batch_size.max(1);
        let mut total = 0.0f64;
        let mut start = 0;
        while start < n {
            let end = (start + batch_size).min(n);
            let xs = self.batch_tensor(inputs, start, end)?;
            let ys = Tensor::from_slice(&targets[start..end], end - start, &self.device)?;
            let loss = bce_with_logits(&self.net.forward(&xs)?, &ys)?;
            self.optimizer.backward_step(&loss)?;
            total += f64::from(loss.to_scalar::<f32>()?) * (end - start) as f64;
            start = end;
        }
        Ok(if n == 0 { 0.0 } else { total / n as f64 })
    }

    fn probabilities(&self, inputs: &Array3<f32>) -> candle_core::Result<Vec<f64>> {
        let n = inputs.dim().0;
        let mut out = Vec::with_capacity(n);
        let mut start = 0;
        while start < n {
            let end = (start + PREDICT_BATCH).min(n);
            let xs = self.batch_tensor(inputs, start, end)?;
            let probs = candle_nn::ops::sigmoid(&self.net.forward(&xs)?)?;
            out.extend(probs.to_vec1::<f32>()?.into_iter().map(f64::from));
            start = end;
        }
        Ok(out)
    }
}

impl ImageModel for CandleCnn {
    type Snapshot = HashMap<String, Tensor>;

    fn build(spec: &ModelSpec) -> Result<Self> {
        Self::init(spec).map_err(model_err)
    }

    fn load(path: &Path, spec: &ModelSpec) -> Result<Self> {
        if !path.is_file() {
            return Err(BurnwatchError::model(format!(
                "model file not found: {}",
                path.display()
            )));
        }
        let mut model = Self::init(spec).map_err(model_err)?;
        model.varmap.load(path).map_err(model_err)?;
        Ok(model)
    }

    fn fit_epoch(
        &mut self,
        inputs: &Array3<f32>,
        targets: &[f32],
        batch_size: usize,
    ) -> Result<f64> {
        self.check_shape(inputs)?;
        if inputs.dim().0 != targets.len() {
            return Err(BurnwatchError::model(format!(
                "{} inputs but {} targets",
                inputs.dim().0,
                targets.len()
            )));
        }
        self.train_epoch(inputs, targets, batch_size).map_err(model_err)
    }

    fn predict(&self, inputs: &Array3<f32>) -> Result<Vec<f64>> {
        self.check_shape(inputs)?;
        self.probabilities(inputs).map_err(model_err)
    }

    fn snapshot(&self) -> Result<Self::Snapshot> {
        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| BurnwatchError::model("model weights lock poisoned"))?;
        let snapshot = vars
            .iter()
            .map(|(name, var)| -> Result<(String, Tensor)> {
                Ok((name.clone(), var.as_tensor().copy().map_err(model_err)?))
            })
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(snapshot)
    }

    fn restore(&mut self, snapshot: &Self::Snapshot) -> Result<()> {
        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| BurnwatchError::model("model weights lock poisoned"))?;
        for (name, var) in vars.iter() {
            let saved = snapshot
                .get(name)
                .ok_or_else(|| BurnwatchError::model(format!("snapshot lacks weights for {name}")))?;
            var.set(saved).map_err(model_err)?;
        }
        Ok(())
    }

    fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BurnwatchError::io(parent, e))?;
        }
        self.varmap.save(path).map_err(model_err)
    }
}
