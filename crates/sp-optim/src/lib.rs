#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one parameter: the structural path of its owning node plus the
/// parameter name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParamKey {
    pub node: String,
    pub name: String,
}

impl ParamKey {
    #[must_use]
    pub fn new(node: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimError {
    InvalidHyperparameter { reason: &'static str },
    GradientShapeMismatch { key: ParamKey, expected: usize, actual: usize },
    StateShapeMismatch { key: ParamKey, reason: &'static str },
    StepOverflow { key: ParamKey },
}

impl fmt::Display for OptimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHyperparameter { reason } => write!(f, "invalid hyperparameter: {reason}"),
            Self::GradientShapeMismatch {
                key,
                expected,
                actual,
            } => write!(
                f,
                "gradient length mismatch for {key}: expected={expected}, actual={actual}"
            ),
            Self::StateShapeMismatch { key, reason } => {
                write!(f, "optimizer state mismatch for {key}: {reason}")
            }
            Self::StepOverflow { key } => write!(f, "step counter overflow for {key}"),
        }
    }
}

impl std::error::Error for OptimError {}

fn adam_bias_correction(beta: f64, step: u64) -> f64 {
    1.0 - beta.powf(step as f64)
}

fn ensure_grad_len_matches_param(
    key: &ParamKey,
    expected: usize,
    actual: usize,
) -> Result<(), OptimError> {
    if expected != actual {
        return Err(OptimError::GradientShapeMismatch {
            key: key.clone(),
            expected,
            actual,
        });
    }
    Ok(())
}

fn ensure_state_len(
    key: &ParamKey,
    expected: usize,
    actual: usize,
    reason: &'static str,
) -> Result<(), OptimError> {
    if expected != actual {
        return Err(OptimError::StateShapeMismatch {
            key: key.clone(),
            reason,
        });
    }
    Ok(())
}

/// Rescale `grad` in place so its L2 norm does not exceed `threshold`.
fn clip_gradient(grad: &mut [f64], threshold: f64) {
    let norm = grad.iter().map(|g| g * g).sum::<f64>().sqrt();
    if norm > threshold {
        let scale = threshold / norm;
        grad.iter_mut().for_each(|g| *g *= scale);
    }
}

/// Trait for parameter optimizers.
///
/// Updates are keyed per parameter so state survives across calls without the
/// optimizer owning the model.
pub trait Optimizer {
    /// Apply one update to `param` given its accumulated `grad`.
    fn step(&mut self, key: &ParamKey, param: &mut [f64], grad: &[f64]) -> Result<(), OptimError>;

    /// Number of updates applied to `key` so far.
    fn step_count(&self, key: &ParamKey) -> u64;

    fn get_lr(&self) -> f64;

    fn set_lr(&mut self, lr: f64);
}

/// Stochastic gradient descent with optional momentum.
#[derive(Debug, Clone)]
pub struct SGD {
    lr: f64,
    momentum: f64,
    steps: BTreeMap<ParamKey, u64>,
    velocity: BTreeMap<ParamKey, Vec<f64>>,
}

impl SGD {
    #[must_use]
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            momentum: 0.0,
            steps: BTreeMap::new(),
            velocity: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    fn validate_hyperparams(&self) -> Result<(), OptimError> {
        if !self.lr.is_finite() || self.lr < 0.0 {
            return Err(OptimError::InvalidHyperparameter {
                reason: "sgd requires a finite non-negative learning rate",
            });
        }
        if !self.momentum.is_finite() || !(0.0..1.0).contains(&self.momentum) {
            return Err(OptimError::InvalidHyperparameter {
                reason: "sgd momentum must be in [0, 1)",
            });
        }
        Ok(())
    }
}

impl Optimizer for SGD {
    fn step(&mut self, key: &ParamKey, param: &mut [f64], grad: &[f64]) -> Result<(), OptimError> {
        self.validate_hyperparams()?;
        ensure_grad_len_matches_param(key, param.len(), grad.len())?;
        let step = self.steps.entry(key.clone()).or_insert(0);
        *step = step
            .checked_add(1)
            .ok_or_else(|| OptimError::StepOverflow { key: key.clone() })?;

        if self.momentum == 0.0 {
            for (p, g) in param.iter_mut().zip(grad.iter()) {
                *p -= self.lr * g;
            }
            return Ok(());
        }

        let velocity = self
            .velocity
            .entry(key.clone())
            .or_insert_with(|| vec![0.0; grad.len()]);
        ensure_state_len(
            key,
            grad.len(),
            velocity.len(),
            "sgd velocity length mismatch with gradient length",
        )?;
        for ((p, g), v) in param.iter_mut().zip(grad.iter()).zip(velocity.iter_mut()) {
            *v = self.momentum * *v + g;
            *p -= self.lr * *v;
        }
        Ok(())
    }

    fn step_count(&self, key: &ParamKey) -> u64 {
        self.steps.get(key).copied().unwrap_or(0)
    }

    fn get_lr(&self) -> f64 {
        self.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }
}

#[derive(Debug, Clone)]
struct AdamSlot {
    step: u64,
    m: Vec<f64>,
    v: Vec<f64>,
}

/// Adam with optional L2 weight decay and per-parameter gradient clipping.
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    grad_clip: f64,
    slots: BTreeMap<ParamKey, AdamSlot>,
}

impl Adam {
    /// Defaults: beta1=0.9, beta2=0.999, eps=1e-8, weight_decay=0.0, no clipping.
    #[must_use]
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            grad_clip: 0.0,
            slots: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    #[must_use]
    pub fn eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    #[must_use]
    pub fn weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Clip each gradient to this L2 norm before the update. `0.0` disables.
    #[must_use]
    pub fn grad_clip(mut self, grad_clip: f64) -> Self {
        self.grad_clip = grad_clip;
        self
    }

    /// Number of parameters with optimizer state.
    #[must_use]
    pub fn tracked_params(&self) -> usize {
        self.slots.len()
    }

    fn validate_hyperparams(&self) -> Result<(), OptimError> {
        let fail = |reason: &'static str| -> Result<(), OptimError> {
            Err(OptimError::InvalidHyperparameter { reason })
        };
        if !self.lr.is_finite() || self.lr < 0.0 {
            return fail("adam requires a finite non-negative learning rate");
        }
        if !self.beta1.is_finite() || !self.beta2.is_finite() {
            return fail("adam betas must be finite");
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return fail("adam betas must be in [0, 1)");
        }
        if !self.eps.is_finite() || self.eps <= 0.0 {
            return fail("adam requires finite eps > 0");
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return fail("adam requires finite non-negative weight_decay");
        }
        if !self.grad_clip.is_finite() || self.grad_clip < 0.0 {
            return fail("adam requires finite non-negative grad_clip");
        }
        Ok(())
    }
}

impl Optimizer for Adam {
    fn step(&mut self, key: &ParamKey, param: &mut [f64], grad: &[f64]) -> Result<(), OptimError> {
        self.validate_hyperparams()?;
        ensure_grad_len_matches_param(key, param.len(), grad.len())?;

        let mut effective_grad = grad.to_vec();
        if self.grad_clip > 0.0 {
            clip_gradient(&mut effective_grad, self.grad_clip);
        }
        if self.weight_decay != 0.0 {
            for (g, p) in effective_grad.iter_mut().zip(param.iter()) {
                *g += self.weight_decay * p;
            }
        }

        let slot = self.slots.entry(key.clone()).or_insert_with(|| AdamSlot {
            step: 0,
            m: vec![0.0; grad.len()],
            v: vec![0.0; grad.len()],
        });
        ensure_state_len(
            key,
            effective_grad.len(),
            slot.m.len(),
            "adam first-moment state length mismatch with gradient length",
        )?;
        ensure_state_len(
            key,
            effective_grad.len(),
            slot.v.len(),
            "adam second-moment state length mismatch with gradient length",
        )?;
        slot.step = slot
            .step
            .checked_add(1)
            .ok_or_else(|| OptimError::StepOverflow { key: key.clone() })?;

        // m = beta1 * m + (1 - beta1) * g;  v = beta2 * v + (1 - beta2) * g^2
        for ((m, v), g) in slot
            .m
            .iter_mut()
            .zip(slot.v.iter_mut())
            .zip(effective_grad.iter())
        {
            *m = self.beta1 * *m + (1.0 - self.beta1) * g;
            *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
        }

        let bias_correction1 = adam_bias_correction(self.beta1, slot.step);
        let bias_correction2 = adam_bias_correction(self.beta2, slot.step);
        for ((p, m), v) in param.iter_mut().zip(slot.m.iter()).zip(slot.v.iter()) {
            let m_hat = m / bias_correction1;
            let v_hat = v / bias_correction2;
            *p -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
        }
        Ok(())
    }

    fn step_count(&self, key: &ParamKey) -> u64 {
        self.slots.get(key).map_or(0, |slot| slot.step)
    }

    fn get_lr(&self) -> f64 {
        self.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }
}

/// Serialisable Adam settings, as found in pipeline and fixture configs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdamConfig {
    pub learn_rate: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_eps")]
    pub eps: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default)]
    pub grad_clip: f64,
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_eps() -> f64 {
    1e-8
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learn_rate: 0.001,
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            weight_decay: 0.0,
            grad_clip: 0.0,
        }
    }
}

impl AdamConfig {
    #[must_use]
    pub fn build(&self) -> Adam {
        Adam::new(self.learn_rate)
            .betas(self.beta1, self.beta2)
            .eps(self.eps)
            .weight_decay(self.weight_decay)
            .grad_clip(self.grad_clip)
    }
}
