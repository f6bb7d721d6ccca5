#![forbid(unsafe_code)]

//! Explicit pseudo-random state.
//!
//! Every stochastic operation in the workspace (parameter initialisation,
//! dropout masks, synthetic gradients) draws from a [`RandomState`] passed in
//! by the caller. There is no process-wide generator, so two callers never
//! race on the same stream.

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::{Distribution, Normal};
use sp_core::Array;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RandomError {
    InvalidRange { low: f64, high: f64 },
    InvalidProbability { p: f64 },
    InvalidStd { std: f64 },
}

impl fmt::Display for RandomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRange { low, high } => {
                write!(f, "uniform range requires finite low < high, got [{low}, {high})")
            }
            Self::InvalidProbability { p } => {
                write!(f, "probability must be finite and in [0, 1], got {p}")
            }
            Self::InvalidStd { std } => {
                write!(f, "normal std must be finite and > 0, got {std}")
            }
        }
    }
}

impl std::error::Error for RandomError {}

#[derive(Debug, Clone)]
pub struct RandomState {
    seed: u64,
    draws: u64,
    rng: StdRng,
}

impl RandomState {
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed,
            draws: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Reset the stream. Everything drawn afterwards depends only on `seed`.
    pub fn set_seed(&mut self, seed: u64) {
        *self = Self::seeded(seed);
    }

    /// The seed most recently applied. Informational only.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Scalars drawn since the last reset.
    #[must_use]
    pub fn draws(&self) -> u64 {
        self.draws
    }

    pub fn next_u64(&mut self) -> u64 {
        self.draws += 1;
        self.rng.next_u64()
    }

    pub fn uniform_scalar(&mut self, low: f64, high: f64) -> Result<f64, RandomError> {
        validate_range(low, high)?;
        self.draws += 1;
        Ok(self.rng.gen_range(low..high))
    }

    /// Independent `U[low, high)` draws in row-major order.
    pub fn uniform(&mut self, shape: Vec<usize>, low: f64, high: f64) -> Result<Array, RandomError> {
        validate_range(low, high)?;
        let mut array = Array::zeros(shape);
        for slot in array.as_mut_slice() {
            *slot = self.rng.gen_range(low..high);
        }
        self.draws += array.numel() as u64;
        Ok(array)
    }

    pub fn normal(&mut self, shape: Vec<usize>, mean: f64, std: f64) -> Result<Array, RandomError> {
        if !std.is_finite() || std <= 0.0 {
            return Err(RandomError::InvalidStd { std });
        }
        let dist = Normal::new(mean, std).map_err(|_| RandomError::InvalidStd { std })?;
        let mut array = Array::zeros(shape);
        for slot in array.as_mut_slice() {
            *slot = dist.sample(&mut self.rng);
        }
        self.draws += array.numel() as u64;
        Ok(array)
    }

    /// 1.0 where the element is kept (probability `keep_prob`), else 0.0.
    pub fn bernoulli_keep_mask(
        &mut self,
        shape: Vec<usize>,
        keep_prob: f64,
    ) -> Result<Array, RandomError> {
        if !keep_prob.is_finite() || !(0.0..=1.0).contains(&keep_prob) {
            return Err(RandomError::InvalidProbability { p: keep_prob });
        }
        let mut array = Array::zeros(shape);
        for slot in array.as_mut_slice() {
            let draw: f64 = self.rng.gen_range(0.0..1.0);
            *slot = if draw < keep_prob { 1.0 } else { 0.0 };
        }
        self.draws += array.numel() as u64;
        Ok(array)
    }
}

fn validate_range(low: f64, high: f64) -> Result<(), RandomError> {
    if !low.is_finite() || !high.is_finite() || low >= high {
        return Err(RandomError::InvalidRange { low, high });
    }
    Ok(())
}
