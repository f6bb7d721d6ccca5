//! Structural comparison of arrays and model outputs.

use serde::Serialize;
use sp_core::{Array, Output};
use sp_nn::Value;

use crate::HarnessError;

pub const DEFAULT_ATOL: f64 = 1e-8;
pub const DEFAULT_RTOL: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum CompareMode {
    /// Bit equality (`f64::to_bits`); `0.0` and `-0.0` differ.
    #[default]
    Exact,
    /// `|a - b| <= atol + rtol * max(|a|, |b|)`; NaN matches only NaN.
    Tolerance { atol: f64, rtol: f64 },
}

impl CompareMode {
    #[must_use]
    pub fn tolerance() -> Self {
        Self::Tolerance {
            atol: DEFAULT_ATOL,
            rtol: DEFAULT_RTOL,
        }
    }

    fn matches(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Exact => lhs.to_bits() == rhs.to_bits(),
            Self::Tolerance { atol, rtol } => {
                if lhs.is_nan() || rhs.is_nan() {
                    return lhs.is_nan() && rhs.is_nan();
                }
                if lhs == rhs {
                    return true;
                }
                (lhs - rhs).abs() <= atol + rtol * lhs.abs().max(rhs.abs())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Mismatch {
    Value {
        leaf: usize,
        index: usize,
        lhs: f64,
        rhs: f64,
    },
    Shape {
        leaf: usize,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    /// Differing nesting: sequence lengths, or array against sequence.
    Structure {
        path: String,
        lhs: String,
        rhs: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub equal: bool,
    pub compared: usize,
    pub mismatched: usize,
    pub max_abs_diff: f64,
    pub first_mismatch: Option<Mismatch>,
}

#[must_use]
pub fn compare_arrays(lhs: &Array, rhs: &Array, mode: CompareMode) -> Comparison {
    let mut acc = Accumulator::new(mode);
    acc.arrays(lhs, rhs);
    acc.finish()
}

#[must_use]
pub fn compare_outputs(lhs: &Output, rhs: &Output, mode: CompareMode) -> Comparison {
    let mut acc = Accumulator::new(mode);
    acc.outputs(lhs, rhs, "$");
    acc.finish()
}

/// Compare raw model values; docs, feature ids and empty values are
/// rejected.
pub fn compare_values(lhs: &Value, rhs: &Value, mode: CompareMode) -> Result<Comparison, HarnessError> {
    let lhs = numeric_output(lhs)?;
    let rhs = numeric_output(rhs)?;
    Ok(compare_outputs(&lhs, &rhs, mode))
}

fn numeric_output(value: &Value) -> Result<Output, HarnessError> {
    value
        .to_output()
        .ok_or_else(|| HarnessError::UnsupportedOutput {
            context: "compare",
            kind: value.kind(),
        })
}

struct Accumulator {
    mode: CompareMode,
    leaf: usize,
    compared: usize,
    mismatched: usize,
    max_abs_diff: f64,
    first_mismatch: Option<Mismatch>,
}

impl Accumulator {
    fn new(mode: CompareMode) -> Self {
        Self {
            mode,
            leaf: 0,
            compared: 0,
            mismatched: 0,
            max_abs_diff: 0.0,
            first_mismatch: None,
        }
    }

    fn mismatch(&mut self, mismatch: Mismatch) {
        self.mismatched += 1;
        if self.first_mismatch.is_none() {
            self.first_mismatch = Some(mismatch);
        }
    }

    fn arrays(&mut self, lhs: &Array, rhs: &Array) {
        let leaf = self.leaf;
        self.leaf += 1;
        if lhs.shape() != rhs.shape() {
            self.mismatch(Mismatch::Shape {
                leaf,
                lhs: lhs.shape().to_vec(),
                rhs: rhs.shape().to_vec(),
            });
            return;
        }
        for (index, (&a, &b)) in lhs.as_slice().iter().zip(rhs.as_slice()).enumerate() {
            self.compared += 1;
            let diff = if a.is_nan() && b.is_nan() {
                0.0
            } else {
                let diff = (a - b).abs();
                if diff.is_nan() { f64::INFINITY } else { diff }
            };
            if diff > self.max_abs_diff {
                self.max_abs_diff = diff;
            }
            if !self.mode.matches(a, b) {
                self.mismatch(Mismatch::Value {
                    leaf,
                    index,
                    lhs: a,
                    rhs: b,
                });
            }
        }
    }

    fn outputs(&mut self, lhs: &Output, rhs: &Output, path: &str) {
        match (lhs, rhs) {
            (Output::Array(a), Output::Array(b)) => self.arrays(a, b),
            (Output::Sequence(a), Output::Sequence(b)) => {
                if a.len() != b.len() {
                    self.mismatch(Mismatch::Structure {
                        path: path.to_string(),
                        lhs: format!("sequence of {}", a.len()),
                        rhs: format!("sequence of {}", b.len()),
                    });
                    return;
                }
                for (index, (item_a, item_b)) in a.iter().zip(b).enumerate() {
                    self.outputs(item_a, item_b, &format!("{path}[{index}]"));
                }
            }
            _ => self.mismatch(Mismatch::Structure {
                path: path.to_string(),
                lhs: lhs.kind().to_string(),
                rhs: rhs.kind().to_string(),
            }),
        }
    }

    fn finish(self) -> Comparison {
        Comparison {
            equal: self.first_mismatch.is_none(),
            compared: self.compared,
            mismatched: self.mismatched,
            max_abs_diff: self.max_abs_diff,
            first_mismatch: self.first_mismatch,
        }
    }
}
