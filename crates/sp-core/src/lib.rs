#![forbid(unsafe_code)]

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over raw bytes. Stable across processes and platforms, unlike
/// `DefaultHasher`, so it is safe to use for anything that feeds a model.
#[must_use]
pub fn det64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[must_use]
pub fn det64_str(value: &str) -> u64 {
    det64(value.as_bytes())
}

#[must_use]
pub fn det64_parts(parts: &[u64]) -> u64 {
    let mut hash = FNV_OFFSET;
    for value in parts {
        for byte in value.to_le_bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayError {
    ShapeDataMismatch { shape: Vec<usize>, len: usize },
    ShapeMismatch { lhs: Vec<usize>, rhs: Vec<usize> },
    RankMismatch { expected: usize, actual: usize },
    EmptyConcat,
    SplitMismatch { expected: usize, actual: usize },
}

impl fmt::Display for ArrayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeDataMismatch { shape, len } => {
                write!(f, "shape {shape:?} does not hold {len} values")
            }
            Self::ShapeMismatch { lhs, rhs } => {
                write!(f, "shape mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::RankMismatch { expected, actual } => {
                write!(f, "rank mismatch expected={expected}, actual={actual}")
            }
            Self::EmptyConcat => write!(f, "cannot concatenate an empty list of arrays"),
            Self::SplitMismatch { expected, actual } => write!(
                f,
                "split lengths cover {actual} rows but array has {expected}"
            ),
        }
    }
}

impl std::error::Error for ArrayError {}

/// Dense row-major array of `f64`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Array {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl Array {
    #[must_use]
    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::full(shape, 0.0)
    }

    #[must_use]
    pub fn full(shape: Vec<usize>, value: f64) -> Self {
        let numel = shape_numel(&shape);
        Self {
            shape,
            data: vec![value; numel],
        }
    }

    pub fn from_shape_vec(shape: Vec<usize>, data: Vec<f64>) -> Result<Self, ArrayError> {
        if shape_numel(&shape) != data.len() {
            return Err(ArrayError::ShapeDataMismatch {
                shape,
                len: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    #[must_use]
    pub fn from_vec(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    /// Flattened copy with shape `[numel]`.
    #[must_use]
    pub fn ravel(&self) -> Self {
        Self::from_vec(self.data.clone())
    }

    pub fn reshape(self, shape: Vec<usize>) -> Result<Self, ArrayError> {
        Self::from_shape_vec(shape, self.data)
    }

    pub fn ensure_rank(&self, expected: usize) -> Result<(), ArrayError> {
        if self.rank() != expected {
            return Err(ArrayError::RankMismatch {
                expected,
                actual: self.rank(),
            });
        }
        Ok(())
    }

    pub fn ensure_same_shape(&self, other: &Self) -> Result<(), ArrayError> {
        if self.shape != other.shape {
            return Err(ArrayError::ShapeMismatch {
                lhs: self.shape.clone(),
                rhs: other.shape.clone(),
            });
        }
        Ok(())
    }

    /// Leading dimension of a 2-D array.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Trailing dimension of a 2-D array.
    #[must_use]
    pub fn cols(&self) -> usize {
        if self.shape.len() < 2 {
            return self.data.len();
        }
        self.shape[1..].iter().product()
    }

    #[must_use]
    pub fn row(&self, index: usize) -> &[f64] {
        let cols = self.cols();
        &self.data[index * cols..(index + 1) * cols]
    }

    pub fn row_mut(&mut self, index: usize) -> &mut [f64] {
        let cols = self.cols();
        &mut self.data[index * cols..(index + 1) * cols]
    }

    pub fn add_assign(&mut self, other: &Self) -> Result<(), ArrayError> {
        self.ensure_same_shape(other)?;
        for (lhs, rhs) in self.data.iter_mut().zip(other.data.iter()) {
            *lhs += rhs;
        }
        Ok(())
    }

    pub fn fill(&mut self, value: f64) {
        self.data.iter_mut().for_each(|slot| *slot = value);
    }

    /// Stack 2-D arrays with equal column counts along the row axis.
    pub fn concat_rows(parts: &[Self]) -> Result<Self, ArrayError> {
        let first = parts.first().ok_or(ArrayError::EmptyConcat)?;
        first.ensure_rank(2)?;
        let cols = first.shape[1];
        let mut data = Vec::with_capacity(parts.iter().map(Self::numel).sum());
        let mut rows = 0usize;
        for part in parts {
            part.ensure_rank(2)?;
            if part.shape[1] != cols {
                return Err(ArrayError::ShapeMismatch {
                    lhs: first.shape.clone(),
                    rhs: part.shape.clone(),
                });
            }
            rows += part.shape[0];
            data.extend_from_slice(&part.data);
        }
        Ok(Self {
            shape: vec![rows, cols],
            data,
        })
    }

    /// Inverse of [`Array::concat_rows`].
    pub fn split_rows(&self, lengths: &[usize]) -> Result<Vec<Self>, ArrayError> {
        self.ensure_rank(2)?;
        let total: usize = lengths.iter().sum();
        if total != self.shape[0] {
            return Err(ArrayError::SplitMismatch {
                expected: self.shape[0],
                actual: total,
            });
        }
        let cols = self.shape[1];
        let mut start = 0usize;
        let mut parts = Vec::with_capacity(lengths.len());
        for length in lengths.iter().copied() {
            let end = start + length * cols;
            parts.push(Self {
                shape: vec![length, cols],
                data: self.data[start..end].to_vec(),
            });
            start = end;
        }
        Ok(parts)
    }

    /// Join 2-D arrays with equal row counts along the column axis.
    pub fn concat_cols(parts: &[Self]) -> Result<Self, ArrayError> {
        let first = parts.first().ok_or(ArrayError::EmptyConcat)?;
        first.ensure_rank(2)?;
        let rows = first.shape[0];
        for part in parts {
            part.ensure_rank(2)?;
            if part.shape[0] != rows {
                return Err(ArrayError::ShapeMismatch {
                    lhs: first.shape.clone(),
                    rhs: part.shape.clone(),
                });
            }
        }
        let cols: usize = parts.iter().map(|part| part.shape[1]).sum();
        let mut data = Vec::with_capacity(rows * cols);
        for row in 0..rows {
            for part in parts {
                data.extend_from_slice(part.row(row));
            }
        }
        Ok(Self {
            shape: vec![rows, cols],
            data,
        })
    }

    /// Inverse of [`Array::concat_cols`].
    pub fn split_cols(&self, widths: &[usize]) -> Result<Vec<Self>, ArrayError> {
        self.ensure_rank(2)?;
        let total: usize = widths.iter().sum();
        if total != self.shape[1] {
            return Err(ArrayError::SplitMismatch {
                expected: self.shape[1],
                actual: total,
            });
        }
        let rows = self.shape[0];
        let mut parts: Vec<Self> = widths
            .iter()
            .map(|width| Self::zeros(vec![rows, *width]))
            .collect();
        for row in 0..rows {
            let source = self.row(row);
            let mut offset = 0usize;
            for (part, width) in parts.iter_mut().zip(widths.iter().copied()) {
                part.row_mut(row)
                    .copy_from_slice(&source[offset..offset + width]);
                offset += width;
            }
        }
        Ok(parts)
    }

    /// Flat concatenation of every array's values, shape `[total]`.
    #[must_use]
    pub fn concatenate(parts: &[Self]) -> Self {
        let mut data = Vec::with_capacity(parts.iter().map(Self::numel).sum());
        for part in parts {
            data.extend_from_slice(&part.data);
        }
        Self::from_vec(data)
    }

    /// Bit-exact digest of shape and values.
    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        let mut parts = Vec::with_capacity(self.shape.len() + self.data.len() + 1);
        parts.push(self.shape.len() as u64);
        parts.extend(self.shape.iter().map(|dim| *dim as u64));
        parts.extend(self.data.iter().map(|value| value.to_bits()));
        det64_parts(&parts)
    }
}

impl Hash for Array {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint64().hash(state);
    }
}

#[must_use]
pub fn shape_numel(shape: &[usize]) -> usize {
    shape.iter().copied().product()
}

/// A model output: one array or an ordered, possibly nested sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Output {
    Array(Array),
    Sequence(Vec<Output>),
}

impl Output {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Array(_) => "array",
            Self::Sequence(_) => "sequence",
        }
    }

    /// Number of arrays at the leaves.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Array(_) => 1,
            Self::Sequence(items) => items.iter().map(Self::leaf_count).sum(),
        }
    }

    /// Leaf arrays in structural order.
    #[must_use]
    pub fn leaves(&self) -> Vec<&Array> {
        let mut leaves = Vec::with_capacity(self.leaf_count());
        self.collect_leaves(&mut leaves);
        leaves
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Array>) {
        match self {
            Self::Array(array) => out.push(array),
            Self::Sequence(items) => items.iter().for_each(|item| item.collect_leaves(out)),
        }
    }

    /// Compact structural description, e.g. `[[7,96],[3,96]]`.
    #[must_use]
    pub fn shape_signature(&self) -> String {
        match self {
            Self::Array(array) => format!("{:?}", array.shape()).replace(' ', ""),
            Self::Sequence(items) => {
                let inner = items
                    .iter()
                    .map(Self::shape_signature)
                    .collect::<Vec<_>>()
                    .join(",");
                format!("[{inner}]")
            }
        }
    }

    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        match self {
            Self::Array(array) => det64_parts(&[0, array.fingerprint64()]),
            Self::Sequence(items) => {
                let mut parts = vec![1, items.len() as u64];
                parts.extend(items.iter().map(Self::fingerprint64));
                det64_parts(&parts)
            }
        }
    }
}
