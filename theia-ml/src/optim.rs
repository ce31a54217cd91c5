//! Optimizers with exportable state.
//!
//! candle's built-in optimizers keep their moment estimates private, so a
//! checkpoint could only ever capture the weights. These implementations
//! keep every slot in a named `Var` and can hand the slots to the
//! checkpoint manager and take them back on restore.

use crate::error::{MlError, Result};
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{Optimizer, VarMap};
use std::collections::HashMap;
use theia_core::OptimizerConfig;

/// Snapshot of an optimizer's mutable state.
#[derive(Debug, Clone)]
pub struct OptimizerState {
    /// `"adam"` or `"sgd"`.
    pub kind: String,
    /// Number of updates applied so far.
    pub step: usize,
    /// Slot tensors keyed `<slot>.<variable name>`.
    pub slots: HashMap<String, Tensor>,
}

/// Variables of a `VarMap`, sorted by name.
pub fn named_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| MlError::training("variable store lock poisoned"))?;
    let mut vars: Vec<_> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

fn positional_names(vars: Vec<Var>) -> Vec<(String, Var)> {
    vars.into_iter()
        .enumerate()
        .map(|(index, var)| (format!("param_{index}"), var))
        .collect()
}

fn restore_slot(slots: &HashMap<String, Tensor>, key: &str, target: &Var) -> Result<()> {
    let tensor = slots
        .get(key)
        .ok_or_else(|| MlError::checkpoint(format!("optimizer slot '{key}' missing")))?;
    if tensor.shape() != target.shape() {
        return Err(MlError::checkpoint(format!(
            "optimizer slot '{key}' has shape {:?}, expected {:?}",
            tensor.dims(),
            target.dims()
        )));
    }
    target.set(&tensor.to_device(target.device())?.to_dtype(target.dtype())?)?;
    Ok(())
}

/// Adam hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamParams {
    pub learning_rate: f64,
    pub beta_1: f64,
    pub beta_2: f64,
    pub epsilon: f64,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-7,
        }
    }
}

struct AdamSlot {
    name: String,
    var: Var,
    m: Var,
    v: Var,
}

/// Adam with bias-corrected first and second moments.
pub struct Adam {
    slots: Vec<AdamSlot>,
    params: AdamParams,
    step: usize,
}

impl Adam {
    pub fn from_named(vars: Vec<(String, Var)>, params: AdamParams) -> candle_core::Result<Self> {
        let slots = vars
            .into_iter()
            .map(|(name, var)| {
                let m = Var::zeros(var.shape(), var.dtype(), var.device())?;
                let v = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(AdamSlot { name, var, m, v })
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            slots,
            params,
            step: 0,
        })
    }

    pub fn params(&self) -> &AdamParams {
        &self.params
    }

    fn state(&self) -> Result<OptimizerState> {
        let mut slots = HashMap::new();
        for slot in &self.slots {
            slots.insert(format!("m.{}", slot.name), slot.m.as_tensor().copy()?);
            slots.insert(format!("v.{}", slot.name), slot.v.as_tensor().copy()?);
        }
        Ok(OptimizerState {
            kind: "adam".to_string(),
            step: self.step,
            slots,
        })
    }

    fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        for slot in &self.slots {
            restore_slot(&state.slots, &format!("m.{}", slot.name), &slot.m)?;
            restore_slot(&state.slots, &format!("v.{}", slot.name), &slot.v)?;
        }
        self.step = state.step;
        Ok(())
    }
}

impl Optimizer for Adam {
    type Config = AdamParams;

    fn new(vars: Vec<Var>, params: AdamParams) -> candle_core::Result<Self> {
        Self::from_named(positional_names(vars), params)
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.step += 1;
        let AdamParams {
            learning_rate,
            beta_1,
            beta_2,
            epsilon,
        } = self.params;
        let t = self.step as f64;
        let bias_1 = 1.0 - beta_1.powf(t);
        let bias_2 = 1.0 - beta_2.powf(t);

        for slot in &self.slots {
            let theta = &slot.var;
            if let Some(g) = grads.get(theta) {
                let next_m = ((slot.m.as_tensor() * beta_1)? + (g * (1.0 - beta_1))?)?;
                let next_v = ((slot.v.as_tensor() * beta_2)? + (g.sqr()? * (1.0 - beta_2))?)?;
                let m_hat = (&next_m / bias_1)?;
                let v_hat = (&next_v / bias_2)?;
                let delta = ((m_hat * learning_rate)? / (v_hat.sqrt()? + epsilon)?)?;
                theta.set(&theta.sub(&delta)?)?;
                slot.m.set(&next_m)?;
                slot.v.set(&next_v)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.learning_rate = lr;
    }
}

/// SGD hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SgdParams {
    pub learning_rate: f64,
    pub momentum: f64,
    pub nesterov: bool,
}

struct SgdSlot {
    name: String,
    var: Var,
    velocity: Option<Var>,
}

/// Stochastic gradient descent with optional (Nesterov) momentum.
pub struct Sgd {
    slots: Vec<SgdSlot>,
    params: SgdParams,
    step: usize,
}

impl Sgd {
    pub fn from_named(vars: Vec<(String, Var)>, params: SgdParams) -> candle_core::Result<Self> {
        let slots = vars
            .into_iter()
            .map(|(name, var)| {
                let velocity = if params.momentum > 0.0 {
                    Some(Var::zeros(var.shape(), var.dtype(), var.device())?)
                } else {
                    None
                };
                Ok(SgdSlot {
                    name,
                    var,
                    velocity,
                })
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            slots,
            params,
            step: 0,
        })
    }

    fn state(&self) -> Result<OptimizerState> {
        let mut slots = HashMap::new();
        for slot in &self.slots {
            if let Some(velocity) = &slot.velocity {
                slots.insert(
                    format!("momentum.{}", slot.name),
                    velocity.as_tensor().copy()?,
                );
            }
        }
        Ok(OptimizerState {
            kind: "sgd".to_string(),
            step: self.step,
            slots,
        })
    }

    fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        for slot in &self.slots {
            if let Some(velocity) = &slot.velocity {
                restore_slot(&state.slots, &format!("momentum.{}", slot.name), velocity)?;
            }
        }
        self.step = state.step;
        Ok(())
    }
}

impl Optimizer for Sgd {
    type Config = SgdParams;

    fn new(vars: Vec<Var>, params: SgdParams) -> candle_core::Result<Self> {
        Self::from_named(positional_names(vars), params)
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.step += 1;
        let SgdParams {
            learning_rate,
            momentum,
            nesterov,
        } = self.params;

        for slot in &self.slots {
            let theta = &slot.var;
            let Some(g) = grads.get(theta) else {
                continue;
            };
            match &slot.velocity {
                None => theta.set(&theta.sub(&(g * learning_rate)?)?)?,
                Some(velocity) => {
                    // velocity = momentum * velocity - lr * g
                    let next = ((velocity.as_tensor() * momentum)? - (g * learning_rate)?)?;
                    let update = if nesterov {
                        ((&next * momentum)? - (g * learning_rate)?)?
                    } else {
                        next.clone()
                    };
                    theta.set(&theta.add(&update)?)?;
                    velocity.set(&next)?;
                }
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.learning_rate = lr;
    }
}

/// The optimizer selected in the configuration.
pub enum TrainableOptimizer {
    Adam(Adam),
    Sgd(Sgd),
}

impl TrainableOptimizer {
    /// Build the configured optimizer over every variable in `varmap`.
    pub fn from_config(config: &OptimizerConfig, varmap: &VarMap) -> Result<Self> {
        let vars = named_vars(varmap)?;
        let optimizer = match *config {
            OptimizerConfig::Adam {
                learning_rate,
                beta_1,
                beta_2,
                epsilon,
            } => Self::Adam(Adam::from_named(
                vars,
                AdamParams {
                    learning_rate,
                    beta_1,
                    beta_2,
                    epsilon,
                },
            )?),
            OptimizerConfig::Sgd {
                learning_rate,
                momentum,
                nesterov,
            } => Self::Sgd(Sgd::from_named(
                vars,
                SgdParams {
                    learning_rate,
                    momentum,
                    nesterov,
                },
            )?),
        };
        Ok(optimizer)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Adam(_) => "adam",
            Self::Sgd(_) => "sgd",
        }
    }

    /// Compute gradients of `loss` and apply them.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        match self {
            Self::Adam(opt) => opt.backward_step(loss)?,
            Self::Sgd(opt) => opt.backward_step(loss)?,
        }
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::Adam(opt) => opt.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
        }
    }

    /// Updates applied so far.
    pub fn iterations(&self) -> usize {
        match self {
            Self::Adam(opt) => opt.step,
            Self::Sgd(opt) => opt.step,
        }
    }

    pub fn state(&self) -> Result<OptimizerState> {
        match self {
            Self::Adam(opt) => opt.state(),
            Self::Sgd(opt) => opt.state(),
        }
    }

    pub fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        if state.kind != self.name() {
            return Err(MlError::checkpoint(format!(
                "checkpoint holds {} optimizer state but the run uses {}",
                state.kind,
                self.name()
            )));
        }
        match self {
            Self::Adam(opt) => opt.load_state(state),
            Self::Sgd(opt) => opt.load_state(state),
        }
    }
}
