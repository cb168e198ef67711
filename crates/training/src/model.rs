use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Linear, VarBuilder, VarMap};

use crate::TrainingError;

/// A line recognizer maps a batch of grayscale line images `[n, 1, h, w]` to
/// per-timestep class logits `[n, t, classes]`.
pub trait Recognizer {
    fn forward(&self, images: &Tensor) -> Result<Tensor, TrainingError>;

    /// Named trainable parameters, sorted by name.
    fn named_parameters(&self) -> Result<Vec<(String, Var)>, TrainingError>;
}

/// Convolutional recognizer: three strided conv blocks collapse the height
/// axis, a linear head produces per-column class logits. One logit column per
/// four input columns.
pub struct LineCrnn {
    varmap: VarMap,
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    head: Linear,
}

impl LineCrnn {
    pub fn new(classes: usize, hidden: usize, device: &Device) -> Result<Self, TrainingError> {
        if classes < 2 {
            return Err(TrainingError::initialization(
                "recognizer needs at least two output classes",
            ));
        }
        if hidden < 4 {
            return Err(TrainingError::initialization(
                "model.hidden_size must be at least 4",
            ));
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let stride2 = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let stride1 = Conv2dConfig {
            padding: 1,
            stride: 1,
            ..Default::default()
        };

        let conv1 = conv2d(1, hidden / 4, 3, stride2, vb.pp("conv1")).map_err(to_init_error)?;
        let conv2 =
            conv2d(hidden / 4, hidden / 2, 3, stride2, vb.pp("conv2")).map_err(to_init_error)?;
        let conv3 =
            conv2d(hidden / 2, hidden, 3, stride1, vb.pp("conv3")).map_err(to_init_error)?;
        let head = linear(hidden, classes, vb.pp("head")).map_err(to_init_error)?;

        Ok(Self {
            varmap,
            conv1,
            conv2,
            conv3,
            head,
        })
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

impl Recognizer for LineCrnn {
    fn forward(&self, images: &Tensor) -> Result<Tensor, TrainingError> {
        let x = self.conv1.forward(images).map_err(to_runtime_error)?;
        let x = x.relu().map_err(to_runtime_error)?;
        let x = self.conv2.forward(&x).map_err(to_runtime_error)?;
        let x = x.relu().map_err(to_runtime_error)?;
        let x = self.conv3.forward(&x).map_err(to_runtime_error)?;
        let x = x.relu().map_err(to_runtime_error)?;

        // [n, hidden, h', w'] -> pool the residual height away -> [n, hidden, w']
        let x = x.mean(2).map_err(to_runtime_error)?;
        // [n, w', hidden]
        let x = x.transpose(1, 2).map_err(to_runtime_error)?;
        self.head.forward(&x).map_err(to_runtime_error)
    }

    fn named_parameters(&self) -> Result<Vec<(String, Var)>, TrainingError> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| TrainingError::runtime("model parameter map is poisoned"))?;
        let mut params: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(params)
    }
}

fn to_init_error(err: candle_core::Error) -> TrainingError {
    TrainingError::initialization(err.to_string())
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
