use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{config::OptimizerSection, TrainingError};

const EPS: f64 = 1e-12;

/// AdamW over named parameters with fully serializable state, so a resumed
/// run continues with bit-identical moments and step count.
#[derive(Debug)]
pub struct AdamW {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    weight_decay: f64,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
}

impl AdamW {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        section: &OptimizerSection,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let shape = tensor.dims().to_vec();
            let device = tensor.device();
            let first_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
            params.push(ParameterSlot {
                name,
                param: var,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            learning_rate: section.learning_rate,
            beta1: section.beta1,
            beta2: section.beta2,
            epsilon: section.epsilon,
            weight_decay: section.weight_decay,
            params,
            step: 0,
        })
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut pending = Vec::new();
        for (idx, slot) in self.params.iter().enumerate() {
            if let Some(grad) = grads.remove(slot.param.as_tensor()) {
                let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
                pending.push((idx, grad));
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        self.step += 1;
        let bias_correction1 = 1.0 - self.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - self.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for (idx, grad) in pending {
            let slot = &mut self.params[idx];

            let prev_m = slot
                .first_moment
                .affine(self.beta1, 0.0)
                .map_err(to_runtime_error)?;
            let grad_term = grad
                .affine(1.0 - self.beta1, 0.0)
                .map_err(to_runtime_error)?;
            let new_m = prev_m.add(&grad_term).map_err(to_runtime_error)?;

            let grad_sq = grad.sqr().map_err(to_runtime_error)?;
            let prev_v = slot
                .second_moment
                .affine(self.beta2, 0.0)
                .map_err(to_runtime_error)?;
            let grad_sq_term = grad_sq
                .affine(1.0 - self.beta2, 0.0)
                .map_err(to_runtime_error)?;
            let new_v = prev_v.add(&grad_sq_term).map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let v_hat = new_v.affine(scale_v, 0.0).map_err(to_runtime_error)?;
            let denom = v_hat
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, self.epsilon)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(self.learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let base = slot.param.as_tensor().clone();
            let decayed = if self.weight_decay != 0.0 {
                base.affine(1.0 - self.learning_rate * self.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };
            let next = decayed.sub(&update).map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let numel: usize = shape.iter().product();
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape,
                first_moment: flatten_to_vec(&slot.first_moment, numel)?,
                second_moment: flatten_to_vec(&slot.second_moment, numel)?,
            });
        }
        Ok(OptimizerState {
            step: self.step,
            parameters,
        })
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        self.step = state.step;
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let state = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;
            let dims = slot.param.as_tensor().dims().to_vec();
            if dims != state.shape {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }
            let numel: usize = dims.iter().product();
            if state.first_moment.len() != numel || state.second_moment.len() != numel {
                return Err(TrainingError::runtime(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }
            let device = slot.param.as_tensor().device().clone();
            slot.first_moment = Tensor::from_vec(state.first_moment, numel, &device)
                .map_err(to_runtime_error)?
                .reshape(dims.as_slice())
                .map_err(to_runtime_error)?;
            slot.second_moment = Tensor::from_vec(state.second_moment, numel, &device)
                .map_err(to_runtime_error)?
                .reshape(dims.as_slice())
                .map_err(to_runtime_error)?;
        }

        if !by_name.is_empty() {
            return Err(TrainingError::runtime(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor
        .flatten_all()
        .map_err(to_runtime_error)?
        .to_vec1::<f32>()
        .map_err(to_runtime_error)?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during optimizer serialization",
        ));
    }
    Ok(flat)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
