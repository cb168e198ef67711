use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::TrainingError;

/// Per-timestep cross entropy against spaced (aligned) labels.
///
/// Class 0 is the blank/padding class and is excluded from the loss and the
/// accuracy count. Logit sequences and alignments may disagree in length;
/// the loss is computed over the shared prefix.
#[derive(Debug, Clone)]
pub struct SpacedCrossEntropy {
    ignore_index: u32,
}

impl SpacedCrossEntropy {
    pub fn new() -> Self {
        Self::default()
    }

    /// `logits`: `[n, t, classes]`, `targets`: `[n, t']` integer class ids.
    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let dims = logits.dims();
        if dims.len() != 3 {
            return Err(TrainingError::runtime(
                "spaced cross entropy expects logits shaped [batch, time, classes]",
            ));
        }
        let (n, logits_t, classes) = (dims[0], dims[1], dims[2]);
        if classes == 0 {
            return Err(TrainingError::runtime(
                "logits class dimension must be greater than zero",
            ));
        }

        let target_dims = targets.dims();
        if target_dims.len() != 2 || target_dims[0] != n {
            return Err(TrainingError::runtime(
                "target tensor must be shaped [batch, time]",
            ));
        }

        let t = logits_t.min(target_dims[1]);
        if t == 0 {
            return Err(TrainingError::runtime(
                "no timesteps available for loss computation",
            ));
        }
        let logits = logits.narrow(1, 0, t).map_err(to_runtime_error)?;
        let targets = targets.narrow(1, 0, t).map_err(to_runtime_error)?;

        let token_count = n * t;
        let logits_flat = logits
            .reshape((token_count, classes))
            .map_err(to_runtime_error)?;
        let log_probs = ops::log_softmax(&logits_flat, D::Minus1).map_err(to_runtime_error)?;

        let targets_flat = targets
            .reshape((token_count,))
            .map_err(to_runtime_error)?;
        let targets_flat = match targets_flat.dtype() {
            DType::U32 => targets_flat,
            DType::I64 | DType::U8 => targets_flat
                .to_dtype(DType::U32)
                .map_err(to_runtime_error)?,
            dtype => {
                return Err(TrainingError::runtime(format!(
                    "unsupported target dtype {:?} for spaced cross entropy",
                    dtype
                )))
            }
        };

        let valid_mask = targets_flat
            .ne(self.ignore_index)
            .map_err(to_runtime_error)?
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?;

        let total_chars = valid_mask
            .sum_all()
            .map_err(to_runtime_error)?
            .to_vec0::<f32>()
            .map_err(to_runtime_error)?
            .round() as usize;
        if total_chars == 0 {
            return Err(TrainingError::runtime(
                "no labeled timesteps remain after masking the blank class",
            ));
        }

        let target_indices = targets_flat.unsqueeze(1).map_err(to_runtime_error)?;
        let nll = log_probs
            .gather(&target_indices, 1)
            .map_err(to_runtime_error)?
            .neg()
            .map_err(to_runtime_error)?
            .squeeze(1)
            .map_err(to_runtime_error)?;

        let weighted = (&nll * &valid_mask).map_err(to_runtime_error)?;
        let loss = weighted
            .sum_all()
            .map_err(to_runtime_error)?
            .affine(1f64 / total_chars as f64, 0.0)
            .map_err(to_runtime_error)?;
        let average_loss = loss.to_vec0::<f32>().map_err(to_runtime_error)?;

        let predictions = logits_flat.argmax(D::Minus1).map_err(to_runtime_error)?;
        let correct = predictions
            .eq(&targets_flat)
            .map_err(to_runtime_error)?
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?;
        let correct = (&correct * &valid_mask).map_err(to_runtime_error)?;
        let correct_chars = correct
            .sum_all()
            .map_err(to_runtime_error)?
            .to_vec0::<f32>()
            .map_err(to_runtime_error)?
            .round() as usize;

        Ok(LossOutput {
            loss,
            metrics: LossMetrics {
                average_loss,
                total_chars,
                correct_chars,
            },
        })
    }
}

impl Default for SpacedCrossEntropy {
    fn default() -> Self {
        Self { ignore_index: 0 }
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone)]
pub struct LossMetrics {
    average_loss: f32,
    total_chars: usize,
    correct_chars: usize,
}

impl LossMetrics {
    pub fn average_loss(&self) -> f32 {
        self.average_loss
    }

    pub fn total_chars(&self) -> usize {
        self.total_chars
    }

    pub fn correct_chars(&self) -> usize {
        self.correct_chars
    }

    pub fn accuracy(&self) -> f32 {
        if self.total_chars == 0 {
            0.0
        } else {
            self.correct_chars as f32 / self.total_chars as f32
        }
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn blank_positions_are_masked() {
        let device = Device::Cpu;
        // two samples, two timesteps, three classes; confident correct logits
        let logits = Tensor::new(
            &[
                [[0.0f32, 10.0, 0.0], [0.0, 0.0, 10.0]],
                [[0.0, 10.0, 0.0], [10.0, 0.0, 0.0]],
            ],
            &device,
        )
        .unwrap();
        // second sample's second timestep is blank
        let targets = Tensor::new(&[[1i64, 2], [1, 0]], &device).unwrap();
        let output = SpacedCrossEntropy::new().compute(&logits, &targets).unwrap();
        assert_eq!(output.metrics.total_chars(), 3);
        assert_eq!(output.metrics.correct_chars(), 3);
        assert!(output.metrics.average_loss() < 0.01);
    }

    #[test]
    fn longer_alignment_uses_shared_prefix() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 2, 4), DType::F32, &device).unwrap();
        let targets = Tensor::new(&[[1i64, 2, 3, 1, 2]], &device).unwrap();
        let output = SpacedCrossEntropy::new().compute(&logits, &targets).unwrap();
        assert_eq!(output.metrics.total_chars(), 2);
    }

    #[test]
    fn all_blank_targets_are_an_error() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &device).unwrap();
        let targets = Tensor::zeros((1, 3), DType::I64, &device).unwrap();
        assert!(SpacedCrossEntropy::new().compute(&logits, &targets).is_err());
    }
}
