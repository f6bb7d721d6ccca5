#![forbid(unsafe_code)]

//! Layer tree, forward/backward passes and parameter updates.
//!
//! A [`Model`] is a node holding a layer op, named dims, declared parameters
//! and ordered children. Construction only records structure; parameters are
//! allocated and filled by [`Model::initialize`], which draws from the
//! caller's [`RandomState`]. Training follows a begin/backward/finish shape:
//! [`Model::begin_update`] returns the output and a [`Backprop`] that, given
//! the output gradient, accumulates parameter gradients and returns the
//! input gradient; [`Model::finish_update`] hands the gradients to an
//! [`Optimizer`] and clears them.

mod kernels;

use std::collections::BTreeMap;
use std::fmt;

use sp_core::{Array, ArrayError, Output, det64_parts};
use sp_optim::{OptimError, Optimizer, ParamKey};
use sp_random::{RandomError, RandomState};
use sp_text::{Attr, Doc};

pub const DIM_IN: &str = "nI";
pub const DIM_OUT: &str = "nO";
pub const DIM_VOCAB: &str = "nV";
pub const DIM_PIECES: &str = "nP";

const HASH_BUCKETS: usize = 4;
const LAYER_NORM_EPS: f64 = 1e-8;

#[derive(Debug, Clone, PartialEq)]
pub enum NnError {
    Array(ArrayError),
    Random(RandomError),
    Optim(OptimError),
    Uninitialized {
        node: String,
    },
    AlreadyInitialized {
        node: String,
    },
    MissingDim {
        node: String,
        dim: &'static str,
    },
    InvalidDim {
        node: String,
        dim: &'static str,
        value: usize,
    },
    DimMismatch {
        lhs: String,
        rhs: String,
        lhs_out: usize,
        rhs_in: usize,
    },
    UnknownParam {
        node: String,
        name: String,
    },
    ParamShapeMismatch {
        node: String,
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    InputKind {
        node: String,
        expected: &'static str,
        actual: &'static str,
    },
    InputWidth {
        node: String,
        expected: usize,
        actual: usize,
    },
    ColumnOutOfRange {
        node: String,
        column: usize,
        width: usize,
    },
    InvalidDropout {
        rate: f64,
    },
    EmptyCombinator {
        combinator: &'static str,
    },
}

impl fmt::Display for NnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Array(error) => write!(f, "array failure: {error}"),
            Self::Random(error) => write!(f, "random state failure: {error}"),
            Self::Optim(error) => write!(f, "optimizer failure: {error}"),
            Self::Uninitialized { node } => {
                write!(f, "node '{node}' used before initialize()")
            }
            Self::AlreadyInitialized { node } => {
                write!(f, "node '{node}' is already initialized")
            }
            Self::MissingDim { node, dim } => write!(f, "node '{node}' is missing dim {dim}"),
            Self::InvalidDim { node, dim, value } => {
                write!(f, "node '{node}' has invalid dim {dim}={value}")
            }
            Self::DimMismatch {
                lhs,
                rhs,
                lhs_out,
                rhs_in,
            } => write!(
                f,
                "cannot connect '{lhs}' (nO={lhs_out}) to '{rhs}' (nI={rhs_in})"
            ),
            Self::UnknownParam { node, name } => {
                write!(f, "node '{node}' has no parameter '{name}'")
            }
            Self::ParamShapeMismatch {
                node,
                name,
                expected,
                actual,
            } => write!(
                f,
                "parameter '{node}.{name}' expects shape {expected:?}, got {actual:?}"
            ),
            Self::InputKind {
                node,
                expected,
                actual,
            } => write!(f, "node '{node}' expects {expected} input, got {actual}"),
            Self::InputWidth {
                node,
                expected,
                actual,
            } => write!(
                f,
                "node '{node}' expects input width {expected}, got {actual}"
            ),
            Self::ColumnOutOfRange {
                node,
                column,
                width,
            } => write!(
                f,
                "node '{node}' reads feature column {column} but rows have {width}"
            ),
            Self::InvalidDropout { rate } => {
                write!(f, "dropout rate must be finite and in [0, 1), got {rate}")
            }
            Self::EmptyCombinator { combinator } => {
                write!(f, "{combinator} requires at least one layer")
            }
        }
    }
}

impl std::error::Error for NnError {}

impl From<ArrayError> for NnError {
    fn from(error: ArrayError) -> Self {
        Self::Array(error)
    }
}

impl From<RandomError> for NnError {
    fn from(error: RandomError) -> Self {
        Self::Random(error)
    }
}

impl From<OptimError> for NnError {
    fn from(error: OptimError) -> Self {
        Self::Optim(error)
    }
}

/// Hashed attribute rows: one `Vec<Vec<u64>>` per doc, one row per token
/// (or per n-gram for bag-of-words features).
pub type FeatureRows = Vec<Vec<u64>>;

/// Data flowing between layers.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Docs(Vec<Doc>),
    Features(Vec<FeatureRows>),
    /// One `[tokens, width]` array per doc.
    Arrays(Vec<Array>),
    /// One `[batch, width]` array.
    Array(Array),
    /// The gradient of an input that has none (docs, feature ids).
    Empty,
}

impl Value {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Docs(_) => "docs",
            Self::Features(_) => "features",
            Self::Arrays(_) => "arrays",
            Self::Array(_) => "array",
            Self::Empty => "empty",
        }
    }

    /// Numeric view of the value; `None` for docs, features and empty.
    #[must_use]
    pub fn to_output(&self) -> Option<Output> {
        match self {
            Self::Array(array) => Some(Output::Array(array.clone())),
            Self::Arrays(arrays) => Some(Output::Sequence(
                arrays.iter().cloned().map(Output::Array).collect(),
            )),
            Self::Docs(_) | Self::Features(_) | Self::Empty => None,
        }
    }

    /// Inverse of [`Value::to_output`]; `None` for nesting deeper than one
    /// sequence level, which no layer produces.
    #[must_use]
    pub fn from_output(output: Output) -> Option<Self> {
        match output {
            Output::Array(array) => Some(Self::Array(array)),
            Output::Sequence(items) => items
                .into_iter()
                .map(|item| match item {
                    Output::Array(array) => Some(array),
                    Output::Sequence(_) => None,
                })
                .collect::<Option<Vec<_>>>()
                .map(Self::Arrays),
        }
    }
}

/// Lookup table for pretrained static vectors keyed by hashed attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorTable {
    rows: BTreeMap<u64, usize>,
    vectors: Array,
}

impl VectorTable {
    /// `entries` pairs a key (e.g. `det64_str(word)`) with its vector; all
    /// vectors must share one width.
    pub fn from_entries(width: usize, entries: Vec<(u64, Vec<f64>)>) -> Result<Self, NnError> {
        let mut rows = BTreeMap::new();
        let mut data = Vec::with_capacity(entries.len() * width);
        for (key, vector) in entries {
            if vector.len() != width {
                return Err(NnError::Array(ArrayError::ShapeDataMismatch {
                    shape: vec![width],
                    len: vector.len(),
                }));
            }
            let next = rows.len();
            if rows.insert(key, next).is_some() {
                continue;
            }
            data.extend(vector);
        }
        let vectors = Array::from_shape_vec(vec![rows.len(), width], data)?;
        Ok(Self { rows, vectors })
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.vectors.shape()[1]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: u64) -> Option<&[f64]> {
        self.rows.get(&key).map(|row| self.vectors.row(*row))
    }
}

/// Layer kinds. Each op fixes its declared parameter names and their order.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Chain,
    Concatenate,
    Residual,
    FeatureExtractor { attrs: Vec<Attr> },
    ExtractNgrams { ngram_size: usize, attr: Attr },
    HashEmbed { column: usize, seed: u64 },
    StaticVectors { column: usize, table: VectorTable },
    Maxout,
    LayerNorm,
    ExpandWindow { window: usize },
    Linear,
    SparseLinear { length: usize },
    Logistic,
    Softmax,
    SoftmaxActivation,
    Dropout { rate: f64 },
    ReduceMean,
}

impl Op {
    fn param_names(&self) -> &'static [&'static str] {
        match self {
            Self::HashEmbed { .. } => &["E"],
            Self::StaticVectors { .. } => &["W"],
            Self::Maxout | Self::Linear | Self::SparseLinear { .. } | Self::Softmax => &["W", "b"],
            Self::LayerNorm => &["G", "b"],
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Param {
    name: &'static str,
    value: Option<Array>,
    grad: Option<Array>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    name: String,
    op: Op,
    dims: BTreeMap<&'static str, usize>,
    params: Vec<Param>,
    children: Vec<Model>,
    initialized: bool,
}

/// The uniform traversal interface the snapshot logic is written against.
pub trait Module {
    fn name(&self) -> &str;

    /// Direct sub-modules in a fixed structural order.
    fn children(&self) -> Vec<&dyn Module>;

    /// Declared parameters in declared order; `None` before initialisation.
    fn parameters(&self) -> Vec<(&str, Option<&Array>)>;
}

impl Module for Model {
    fn name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> Vec<&dyn Module> {
        self.children.iter().map(|child| child as &dyn Module).collect()
    }

    fn parameters(&self) -> Vec<(&str, Option<&Array>)> {
        self.params
            .iter()
            .map(|param| (param.name, param.value.as_ref()))
            .collect()
    }
}

/// Pre-order depth-first walk with structural paths (`"0"`, `"0.1"`, ...).
#[must_use]
pub fn walk_modules(root: &dyn Module) -> Vec<(String, &dyn Module)> {
    let mut out = Vec::new();
    walk_modules_into(root, "0".to_string(), &mut out);
    out
}

fn walk_modules_into<'a>(node: &'a dyn Module, path: String, out: &mut Vec<(String, &'a dyn Module)>) {
    let children = node.children();
    out.push((path.clone(), node));
    for (index, child) in children.into_iter().enumerate() {
        walk_modules_into(child, format!("{path}.{index}"), out);
    }
}

impl Model {
    fn new(name: &str, op: Op, dims: &[(&'static str, usize)], children: Vec<Model>) -> Self {
        let params = op
            .param_names()
            .iter()
            .map(|name| Param {
                name: *name,
                value: None,
                grad: None,
            })
            .collect();
        Self {
            name: name.to_string(),
            op,
            dims: dims.iter().copied().collect(),
            params,
            children,
            initialized: false,
        }
    }

    /// Rename the node, e.g. to tag the root of a built model.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn op(&self) -> &Op {
        &self.op
    }

    #[must_use]
    pub fn layers(&self) -> &[Model] {
        &self.children
    }

    #[must_use]
    pub fn has_dim(&self, dim: &str) -> bool {
        self.dims.contains_key(dim)
    }

    pub fn get_dim(&self, dim: &'static str) -> Result<usize, NnError> {
        self.dims.get(dim).copied().ok_or_else(|| NnError::MissingDim {
            node: self.name.clone(),
            dim,
        })
    }

    #[must_use]
    pub fn param_names(&self) -> Vec<&'static str> {
        self.params.iter().map(|param| param.name).collect()
    }

    #[must_use]
    pub fn has_param(&self, name: &str) -> bool {
        self.params.iter().any(|param| param.name == name)
    }

    pub fn get_param(&self, name: &str) -> Result<&Array, NnError> {
        self.param(name)?
            .value
            .as_ref()
            .ok_or_else(|| NnError::Uninitialized {
                node: self.name.clone(),
            })
    }

    /// Accumulated gradient, if a backward pass has touched the parameter
    /// since the last update.
    pub fn get_grad(&self, name: &str) -> Result<Option<&Array>, NnError> {
        Ok(self.param(name)?.grad.as_ref())
    }

    /// Overwrite a parameter; the shape must match the allocated one.
    pub fn set_param(&mut self, name: &str, value: Array) -> Result<(), NnError> {
        let node = self.name.clone();
        let param = self.param_mut(name)?;
        let current = param
            .value
            .as_ref()
            .ok_or_else(|| NnError::Uninitialized { node: node.clone() })?;
        if current.shape() != value.shape() {
            return Err(NnError::ParamShapeMismatch {
                node,
                name: name.to_string(),
                expected: current.shape().to_vec(),
                actual: value.shape().to_vec(),
            });
        }
        param.value = Some(value);
        Ok(())
    }

    fn param(&self, name: &str) -> Result<&Param, NnError> {
        self.params
            .iter()
            .find(|param| param.name == name)
            .ok_or_else(|| NnError::UnknownParam {
                node: self.name.clone(),
                name: name.to_string(),
            })
    }

    fn param_mut(&mut self, name: &str) -> Result<&mut Param, NnError> {
        let node = self.name.clone();
        self.params
            .iter_mut()
            .find(|param| param.name == name)
            .ok_or(NnError::UnknownParam {
                node,
                name: name.to_string(),
            })
    }

    /// Every node, pre-order depth-first.
    #[must_use]
    pub fn walk(&self) -> Vec<&Model> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.walk());
        }
        out
    }

    /// Every node with its structural path, pre-order depth-first.
    #[must_use]
    pub fn walk_with_paths(&self) -> Vec<(String, &Model)> {
        let mut out = Vec::new();
        self.walk_paths_into("0".to_string(), &mut out);
        out
    }

    fn walk_paths_into<'a>(&'a self, path: String, out: &mut Vec<(String, &'a Model)>) {
        out.push((path.clone(), self));
        for (index, child) in self.children.iter().enumerate() {
            child.walk_paths_into(format!("{path}.{index}"), out);
        }
    }

    fn for_each_node_mut(&mut self, visit: &mut dyn FnMut(&mut Model)) {
        visit(self);
        for child in &mut self.children {
            child.for_each_node_mut(visit);
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.walk().iter().all(|node| node.initialized)
    }

    /// Total number of scalar parameters (0 before initialisation).
    #[must_use]
    pub fn param_count(&self) -> usize {
        self.walk()
            .iter()
            .flat_map(|node| node.params.iter())
            .filter_map(|param| param.value.as_ref().map(Array::numel))
            .sum()
    }

    /// Allocate and fill every parameter, pre-order, in declared order.
    pub fn initialize(&mut self, rng: &mut RandomState) -> Result<(), NnError> {
        if self.walk().iter().any(|node| node.initialized) {
            return Err(NnError::AlreadyInitialized {
                node: self.name.clone(),
            });
        }
        self.initialize_node(rng)
    }

    /// Chaining form of [`Model::initialize`].
    pub fn initialized(mut self, rng: &mut RandomState) -> Result<Self, NnError> {
        self.initialize(rng)?;
        Ok(self)
    }

    fn initialize_node(&mut self, rng: &mut RandomState) -> Result<(), NnError> {
        let values = self.allocate_params(rng)?;
        for (param, value) in self.params.iter_mut().zip(values) {
            param.value = Some(value);
        }
        self.initialized = true;
        for child in &mut self.children {
            child.initialize_node(rng)?;
        }
        Ok(())
    }

    fn positive_dim(&self, dim: &'static str) -> Result<usize, NnError> {
        let value = self.get_dim(dim)?;
        if value == 0 {
            return Err(NnError::InvalidDim {
                node: self.name.clone(),
                dim,
                value,
            });
        }
        Ok(value)
    }

    fn allocate_params(&self, rng: &mut RandomState) -> Result<Vec<Array>, NnError> {
        let values = match &self.op {
            Op::HashEmbed { .. } => {
                let n_v = self.positive_dim(DIM_VOCAB)?;
                let n_o = self.positive_dim(DIM_OUT)?;
                vec![rng.uniform(vec![n_v, n_o], -0.1, 0.1)?]
            }
            Op::StaticVectors { .. } => {
                let n_o = self.positive_dim(DIM_OUT)?;
                let n_i = self.positive_dim(DIM_IN)?;
                vec![glorot_uniform(rng, vec![n_o, n_i], n_i, n_o)?]
            }
            Op::Maxout => {
                let n_o = self.positive_dim(DIM_OUT)?;
                let n_p = self.positive_dim(DIM_PIECES)?;
                let n_i = self.positive_dim(DIM_IN)?;
                vec![
                    glorot_uniform(rng, vec![n_o, n_p, n_i], n_i, n_o)?,
                    Array::zeros(vec![n_o, n_p]),
                ]
            }
            Op::LayerNorm => {
                let n_i = self.positive_dim(DIM_IN)?;
                vec![Array::full(vec![n_i], 1.0), Array::zeros(vec![n_i])]
            }
            Op::Linear => {
                let n_o = self.positive_dim(DIM_OUT)?;
                let n_i = self.positive_dim(DIM_IN)?;
                vec![
                    glorot_uniform(rng, vec![n_o, n_i], n_i, n_o)?,
                    Array::zeros(vec![n_o]),
                ]
            }
            Op::SparseLinear { length } => {
                let n_o = self.positive_dim(DIM_OUT)?;
                if *length == 0 {
                    return Err(NnError::InvalidDim {
                        node: self.name.clone(),
                        dim: "length",
                        value: 0,
                    });
                }
                vec![
                    rng.uniform(vec![n_o, *length], -0.1, 0.1)?,
                    Array::zeros(vec![n_o]),
                ]
            }
            Op::Softmax => {
                let n_o = self.positive_dim(DIM_OUT)?;
                let n_i = self.positive_dim(DIM_IN)?;
                vec![Array::zeros(vec![n_o, n_i]), Array::zeros(vec![n_o])]
            }
            _ => Vec::new(),
        };
        Ok(values)
    }

    fn ensure_initialized(&self) -> Result<(), NnError> {
        if !self.initialized {
            return Err(NnError::Uninitialized {
                node: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Inference forward pass: dropout disabled, no random draws.
    pub fn predict(&self, input: Value) -> Result<Value, NnError> {
        let (output, _) = self.forward(input, None)?;
        Ok(output)
    }

    /// Training forward pass. Dropout masks are drawn from `rng`.
    pub fn begin_update(
        &self,
        rng: &mut RandomState,
        input: Value,
    ) -> Result<(Value, Backprop), NnError> {
        let (output, cache) = self.forward(input, Some(rng))?;
        Ok((output, Backprop { cache }))
    }

    /// Hand every accumulated gradient to `optimizer`, then clear it.
    /// Returns the number of parameters updated.
    pub fn finish_update(&mut self, optimizer: &mut dyn Optimizer) -> Result<usize, NnError> {
        self.finish_update_at("0".to_string(), optimizer)
    }

    fn finish_update_at(
        &mut self,
        path: String,
        optimizer: &mut dyn Optimizer,
    ) -> Result<usize, NnError> {
        let mut updated = 0usize;
        for param in &mut self.params {
            let (Some(value), Some(grad)) = (param.value.as_mut(), param.grad.take()) else {
                continue;
            };
            let key = ParamKey::new(path.clone(), param.name);
            optimizer.step(&key, value.as_mut_slice(), grad.as_slice())?;
            updated += 1;
        }
        for (index, child) in self.children.iter_mut().enumerate() {
            updated += child.finish_update_at(format!("{path}.{index}"), optimizer)?;
        }
        Ok(updated)
    }

    fn input_kind_error(&self, expected: &'static str, actual: &Value) -> NnError {
        NnError::InputKind {
            node: self.name.clone(),
            expected,
            actual: actual.kind(),
        }
    }

    fn accumulate_grad(&mut self, name: &str, delta: &[f64]) -> Result<(), NnError> {
        let node = self.name.clone();
        let param = self.param_mut(name)?;
        let shape = param
            .value
            .as_ref()
            .ok_or(NnError::Uninitialized { node })?
            .shape()
            .to_vec();
        let grad = param.grad.get_or_insert_with(|| Array::zeros(shape));
        for (slot, d) in grad.as_mut_slice().iter_mut().zip(delta.iter()) {
            *slot += d;
        }
        Ok(())
    }

    fn forward(
        &self,
        input: Value,
        mut rng: Option<&mut RandomState>,
    ) -> Result<(Value, Cache), NnError> {
        self.ensure_initialized()?;
        match &self.op {
            Op::Chain => {
                let mut current = input;
                let mut caches = Vec::with_capacity(self.children.len());
                for child in &self.children {
                    let (next, cache) = child.forward(current, rng.as_deref_mut())?;
                    caches.push(cache);
                    current = next;
                }
                Ok((current, Cache::Chain(caches)))
            }
            Op::Concatenate => {
                let mut matrices = Vec::with_capacity(self.children.len());
                let mut caches = Vec::with_capacity(self.children.len());
                let mut layout = None;
                for child in &self.children {
                    let (output, cache) = child.forward(input.clone(), rng.as_deref_mut())?;
                    let (matrix, child_layout) = self.to_matrix(output, 0)?;
                    matrices.push(matrix);
                    caches.push(cache);
                    layout.get_or_insert(child_layout);
                }
                let layout = layout.ok_or(NnError::EmptyCombinator {
                    combinator: "concatenate",
                })?;
                let widths = matrices.iter().map(Array::cols).collect::<Vec<_>>();
                let joined = Array::concat_cols(&matrices)?;
                let output = from_matrix(joined, &layout)?;
                Ok((output, Cache::Concatenate { caches, widths, layout }))
            }
            Op::Residual => {
                let child = self.children.first().ok_or(NnError::EmptyCombinator {
                    combinator: "residual",
                })?;
                let (inner, cache) = child.forward(input.clone(), rng)?;
                let (mut sum, layout) = self.to_matrix(input, 0)?;
                let (inner, _) = self.to_matrix(inner, 0)?;
                sum.add_assign(&inner)?;
                Ok((from_matrix(sum, &layout)?, Cache::Residual(Box::new(cache))))
            }
            Op::FeatureExtractor { attrs } => match input {
                Value::Docs(docs) => {
                    let features = docs.iter().map(|doc| doc.to_attr_rows(attrs)).collect();
                    Ok((Value::Features(features), Cache::Nothing))
                }
                other => Err(self.input_kind_error("docs", &other)),
            },
            Op::ExtractNgrams { ngram_size, attr } => match input {
                Value::Docs(docs) => {
                    let features = docs
                        .iter()
                        .map(|doc| count_ngrams(doc, *attr, *ngram_size))
                        .collect();
                    Ok((Value::Features(features), Cache::Nothing))
                }
                other => Err(self.input_kind_error("docs", &other)),
            },
            Op::HashEmbed { column, seed } => self.forward_hash_embed(input, *column, *seed),
            Op::StaticVectors { column, table } => {
                self.forward_static_vectors(input, *column, table)
            }
            Op::Maxout => self.forward_maxout(input),
            Op::LayerNorm => self.forward_layer_norm(input),
            Op::ExpandWindow { window } => self.forward_expand_window(input, *window),
            Op::Linear => self.forward_linear(input),
            Op::SparseLinear { length } => self.forward_sparse_linear(input, *length),
            Op::Logistic => {
                let (mut matrix, layout) = self.to_matrix(input, 0)?;
                matrix
                    .as_mut_slice()
                    .iter_mut()
                    .for_each(|value| *value = kernels::sigmoid(*value));
                let output = from_matrix(matrix.clone(), &layout)?;
                Ok((output, Cache::Activation { output: matrix, layout }))
            }
            Op::Softmax => self.forward_softmax(input),
            Op::SoftmaxActivation => {
                let (mut output, layout) = self.to_matrix(input, 0)?;
                let width = output.cols();
                kernels::softmax_rows(output.as_mut_slice(), width);
                Ok((
                    from_matrix(output.clone(), &layout)?,
                    Cache::SoftmaxActivation { output, layout },
                ))
            }
            Op::Dropout { rate } => {
                let rate = *rate;
                let Some(rng) = rng else {
                    return Ok((input, Cache::Dropout { mask: None }));
                };
                if rate == 0.0 {
                    return Ok((input, Cache::Dropout { mask: None }));
                }
                let (mut matrix, layout) = self.to_matrix(input, 0)?;
                let mut mask = rng.bernoulli_keep_mask(matrix.shape().to_vec(), 1.0 - rate)?;
                let scale = 1.0 / (1.0 - rate);
                mask.as_mut_slice().iter_mut().for_each(|m| *m *= scale);
                for (value, m) in matrix.as_mut_slice().iter_mut().zip(mask.as_slice()) {
                    *value *= m;
                }
                Ok((from_matrix(matrix, &layout)?, Cache::Dropout { mask: Some(mask) }))
            }
            Op::ReduceMean => match input {
                Value::Arrays(arrays) => {
                    let width = self.get_dim(DIM_IN)?;
                    let mut out = Array::zeros(vec![arrays.len(), width]);
                    let mut lengths = Vec::with_capacity(arrays.len());
                    for (index, array) in arrays.iter().enumerate() {
                        self.check_width(array.cols(), width)?;
                        let rows = array.rows();
                        lengths.push(rows);
                        if rows == 0 {
                            continue;
                        }
                        let target = out.row_mut(index);
                        for row in 0..rows {
                            kernels::axpy(1.0 / rows as f64, array.row(row), target);
                        }
                    }
                    Ok((Value::Array(out), Cache::ReduceMean { lengths, width }))
                }
                other => Err(self.input_kind_error("arrays", &other)),
            },
        }
    }

    fn backward(&mut self, cache: Cache, d_output: Value) -> Result<Value, NnError> {
        match cache {
            Cache::Nothing => Ok(Value::Empty),
            Cache::Chain(caches) => {
                let mut gradient = d_output;
                for (child, cache) in self.children.iter_mut().zip(caches).rev() {
                    gradient = child.backward(cache, gradient)?;
                }
                Ok(gradient)
            }
            Cache::Concatenate {
                caches,
                widths,
                layout,
            } => {
                let (matrix, _) = self.to_matrix(d_output, widths.iter().sum())?;
                let parts = matrix.split_cols(&widths)?;
                let mut total = Value::Empty;
                for ((child, cache), part) in self.children.iter_mut().zip(caches).zip(parts) {
                    let d_input = child.backward(cache, from_matrix(part, &layout)?)?;
                    total = add_values(total, d_input)?;
                }
                Ok(total)
            }
            Cache::Residual(cache) => {
                let child = self.children.first_mut().ok_or(NnError::EmptyCombinator {
                    combinator: "residual",
                })?;
                let d_inner = child.backward(*cache, d_output.clone())?;
                add_values(d_output, d_inner)
            }
            Cache::HashEmbed { keys } => self.backward_hash_embed(keys, d_output),
            Cache::Projection { input } => {
                let n_o = self.get_dim(DIM_OUT)?;
                let n_i = self.get_dim(DIM_IN)?;
                let (d_y, _) = self.to_matrix(d_output, n_o)?;
                let mut d_w = vec![0.0; n_o * n_i];
                kernels::gemm_tn_acc(
                    d_y.as_slice(),
                    input.as_slice(),
                    &mut d_w,
                    input.rows(),
                    n_o,
                    n_i,
                );
                self.accumulate_grad("W", &d_w)?;
                Ok(Value::Empty)
            }
            Cache::Maxout {
                input,
                which,
                layout,
            } => self.backward_maxout(input, which, layout, d_output),
            Cache::LayerNorm {
                xhat,
                inv_std,
                layout,
            } => self.backward_layer_norm(xhat, inv_std, layout, d_output),
            Cache::ExpandWindow { window, layout } => {
                self.backward_expand_window(window, layout, d_output)
            }
            Cache::Dense { input, layout } => self.backward_linear(input, layout, d_output),
            Cache::SparseLinear { length, features } => {
                self.backward_sparse_linear(length, features, d_output)
            }
            Cache::Activation { output, layout } => {
                let (mut d_y, _) = self.to_matrix(d_output, output.cols())?;
                d_y.ensure_same_shape(&output)?;
                for (d, y) in d_y.as_mut_slice().iter_mut().zip(output.as_slice()) {
                    *d *= y * (1.0 - y);
                }
                from_matrix(d_y, &layout)
            }
            Cache::Softmax {
                input,
                output,
                layout,
            } => self.backward_softmax(input, output, layout, d_output),
            Cache::SoftmaxActivation { output, layout } => {
                let (d_y, _) = self.to_matrix(d_output, output.cols())?;
                from_matrix(softmax_backward(&d_y, &output)?, &layout)
            }
            Cache::Dropout { mask } => {
                let Some(mask) = mask else {
                    return Ok(d_output);
                };
                let (mut d_y, layout) = self.to_matrix(d_output, mask.cols())?;
                d_y.ensure_same_shape(&mask)?;
                for (d, m) in d_y.as_mut_slice().iter_mut().zip(mask.as_slice()) {
                    *d *= m;
                }
                from_matrix(d_y, &layout)
            }
            Cache::ReduceMean { lengths, width } => {
                let (d_y, _) = self.to_matrix(d_output, width)?;
                let mut grads = Vec::with_capacity(lengths.len());
                for (index, rows) in lengths.into_iter().enumerate() {
                    let mut grad = Array::zeros(vec![rows, width]);
                    if rows > 0 {
                        let scale = 1.0 / rows as f64;
                        for row in 0..rows {
                            kernels::axpy(scale, d_y.row(index), grad.row_mut(row));
                        }
                    }
                    grads.push(grad);
                }
                Ok(Value::Arrays(grads))
            }
        }
    }

    fn expect_features(&self, input: Value) -> Result<Vec<FeatureRows>, NnError> {
        match input {
            Value::Features(features) => Ok(features),
            other => Err(self.input_kind_error("features", &other)),
        }
    }

    fn check_width(&self, actual: usize, expected: usize) -> Result<(), NnError> {
        if actual != expected {
            return Err(NnError::InputWidth {
                node: self.name.clone(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Flatten array-like values into one `[rows, cols]` matrix.
    /// `empty_cols` sizes the result for an empty doc list.
    fn to_matrix(&self, value: Value, empty_cols: usize) -> Result<(Array, Layout), NnError> {
        match value {
            Value::Array(array) => {
                array.ensure_rank(2)?;
                Ok((array, Layout::Batch))
            }
            Value::Arrays(arrays) => {
                let lengths = arrays.iter().map(Array::rows).collect::<Vec<_>>();
                let matrix = if arrays.is_empty() {
                    Array::zeros(vec![0, empty_cols])
                } else {
                    Array::concat_rows(&arrays)?
                };
                Ok((matrix, Layout::Docs(lengths)))
            }
            other => Err(self.input_kind_error("array or arrays", &other)),
        }
    }

    fn forward_hash_embed(
        &self,
        input: Value,
        column: usize,
        seed: u64,
    ) -> Result<(Value, Cache), NnError> {
        let features = self.expect_features(input)?;
        let table = self.get_param("E")?;
        let n_v = self.get_dim(DIM_VOCAB)?;
        let n_o = self.get_dim(DIM_OUT)?;
        let mut outputs = Vec::with_capacity(features.len());
        let mut keys = Vec::with_capacity(features.len());
        for rows in &features {
            let mut out = Array::zeros(vec![rows.len(), n_o]);
            let mut doc_keys = Vec::with_capacity(rows.len());
            for (index, row) in rows.iter().enumerate() {
                let id = *row.get(column).ok_or_else(|| NnError::ColumnOutOfRange {
                    node: self.name.clone(),
                    column,
                    width: row.len(),
                })?;
                let buckets = hash_buckets(id, seed, n_v);
                let target = out.row_mut(index);
                for bucket in buckets {
                    kernels::axpy(1.0, table.row(bucket), target);
                }
                doc_keys.push(buckets);
            }
            outputs.push(out);
            keys.push(doc_keys);
        }
        Ok((Value::Arrays(outputs), Cache::HashEmbed { keys }))
    }

    fn backward_hash_embed(
        &mut self,
        keys: Vec<Vec<[usize; HASH_BUCKETS]>>,
        d_output: Value,
    ) -> Result<Value, NnError> {
        let d_arrays = match d_output {
            Value::Arrays(arrays) => arrays,
            other => return Err(self.input_kind_error("arrays", &other)),
        };
        let n_v = self.get_dim(DIM_VOCAB)?;
        let n_o = self.get_dim(DIM_OUT)?;
        let mut d_table = Array::zeros(vec![n_v, n_o]);
        for (doc_keys, d_y) in keys.iter().zip(d_arrays.iter()) {
            for (index, buckets) in doc_keys.iter().enumerate() {
                for bucket in buckets {
                    kernels::axpy(1.0, d_y.row(index), d_table.row_mut(*bucket));
                }
            }
        }
        self.accumulate_grad("E", d_table.as_slice())?;
        Ok(Value::Empty)
    }

    fn forward_static_vectors(
        &self,
        input: Value,
        column: usize,
        table: &VectorTable,
    ) -> Result<(Value, Cache), NnError> {
        let features = self.expect_features(input)?;
        let n_i = self.get_dim(DIM_IN)?;
        let n_o = self.get_dim(DIM_OUT)?;
        self.check_width(table.width(), n_i)?;
        let mut lookups = Vec::with_capacity(features.len());
        for rows in &features {
            let mut vectors = Array::zeros(vec![rows.len(), n_i]);
            for (index, row) in rows.iter().enumerate() {
                let id = *row.get(column).ok_or_else(|| NnError::ColumnOutOfRange {
                    node: self.name.clone(),
                    column,
                    width: row.len(),
                })?;
                if let Some(vector) = table.get(id) {
                    vectors.row_mut(index).copy_from_slice(vector);
                }
            }
            lookups.push(vectors);
        }
        let (input, layout) = self.to_matrix(Value::Arrays(lookups), n_i)?;
        let w = self.get_param("W")?;
        let out = kernels::gemm_nt(input.as_slice(), w.as_slice(), input.rows(), n_o, n_i);
        let out = Array::from_shape_vec(vec![input.rows(), n_o], out)?;
        Ok((from_matrix(out, &layout)?, Cache::Projection { input }))
    }

    fn forward_maxout(&self, input: Value) -> Result<(Value, Cache), NnError> {
        let n_o = self.get_dim(DIM_OUT)?;
        let n_p = self.get_dim(DIM_PIECES)?;
        let n_i = self.get_dim(DIM_IN)?;
        let (input, layout) = self.to_matrix(input, n_i)?;
        self.check_width(input.cols(), n_i)?;
        let rows = input.rows();
        let w = self.get_param("W")?;
        let b = self.get_param("b")?;
        let mut z = kernels::gemm_nt(input.as_slice(), w.as_slice(), rows, n_o * n_p, n_i);
        kernels::add_bias(&mut z, b.as_slice());
        let mut out = Array::zeros(vec![rows, n_o]);
        let mut which = vec![0usize; rows * n_o];
        for row in 0..rows {
            for o in 0..n_o {
                let pieces = &z[(row * n_o + o) * n_p..(row * n_o + o + 1) * n_p];
                let mut best = 0usize;
                for (piece, value) in pieces.iter().enumerate() {
                    if *value > pieces[best] {
                        best = piece;
                    }
                }
                out.as_mut_slice()[row * n_o + o] = pieces[best];
                which[row * n_o + o] = best;
            }
        }
        Ok((
            from_matrix(out, &layout)?,
            Cache::Maxout {
                input,
                which,
                layout,
            },
        ))
    }

    fn backward_maxout(
        &mut self,
        input: Array,
        which: Vec<usize>,
        layout: Layout,
        d_output: Value,
    ) -> Result<Value, NnError> {
        let n_o = self.get_dim(DIM_OUT)?;
        let n_p = self.get_dim(DIM_PIECES)?;
        let n_i = self.get_dim(DIM_IN)?;
        let (d_y, _) = self.to_matrix(d_output, n_o)?;
        let rows = input.rows();
        let mut d_z = vec![0.0; rows * n_o * n_p];
        for (index, (d, piece)) in d_y.as_slice().iter().zip(which.iter()).enumerate() {
            d_z[index * n_p + piece] = *d;
        }
        let mut d_w = vec![0.0; n_o * n_p * n_i];
        kernels::gemm_tn_acc(&d_z, input.as_slice(), &mut d_w, rows, n_o * n_p, n_i);
        let mut d_b = vec![0.0; n_o * n_p];
        kernels::sum_rows_acc(&d_z, &mut d_b);
        self.accumulate_grad("W", &d_w)?;
        self.accumulate_grad("b", &d_b)?;
        let w = self.get_param("W")?;
        let d_x = kernels::gemm_nn(&d_z, w.as_slice(), rows, n_o * n_p, n_i);
        from_matrix(Array::from_shape_vec(vec![rows, n_i], d_x)?, &layout)
    }

    fn forward_layer_norm(&self, input: Value) -> Result<(Value, Cache), NnError> {
        let n_i = self.get_dim(DIM_IN)?;
        let (input, layout) = self.to_matrix(input, n_i)?;
        self.check_width(input.cols(), n_i)?;
        let g = self.get_param("G")?;
        let b = self.get_param("b")?;
        let rows = input.rows();
        let mut xhat = Array::zeros(vec![rows, n_i]);
        let mut out = Array::zeros(vec![rows, n_i]);
        let mut inv_std = Vec::with_capacity(rows);
        for row in 0..rows {
            let values = input.row(row);
            let mean = values.iter().sum::<f64>() / n_i as f64;
            let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n_i as f64;
            let inv = 1.0 / (var + LAYER_NORM_EPS).sqrt();
            inv_std.push(inv);
            let normed = xhat.row_mut(row);
            for (slot, value) in normed.iter_mut().zip(values.iter()) {
                *slot = (value - mean) * inv;
            }
            let normed = xhat.row(row).to_vec();
            let target = out.row_mut(row);
            for (index, slot) in target.iter_mut().enumerate() {
                *slot = normed[index] * g.as_slice()[index] + b.as_slice()[index];
            }
        }
        Ok((
            from_matrix(out, &layout)?,
            Cache::LayerNorm {
                xhat,
                inv_std,
                layout,
            },
        ))
    }

    fn backward_layer_norm(
        &mut self,
        xhat: Array,
        inv_std: Vec<f64>,
        layout: Layout,
        d_output: Value,
    ) -> Result<Value, NnError> {
        let n_i = self.get_dim(DIM_IN)?;
        let (d_y, _) = self.to_matrix(d_output, n_i)?;
        d_y.ensure_same_shape(&xhat)?;
        let rows = xhat.rows();
        let mut d_g = vec![0.0; n_i];
        let mut d_b = vec![0.0; n_i];
        let mut d_x = Array::zeros(vec![rows, n_i]);
        let g = self.get_param("G")?.as_slice().to_vec();
        let n = n_i as f64;
        for row in 0..rows {
            let dy = d_y.row(row);
            let xh = xhat.row(row);
            let mut sum_dxhat = 0.0;
            let mut sum_dxhat_xhat = 0.0;
            for index in 0..n_i {
                d_g[index] += dy[index] * xh[index];
                d_b[index] += dy[index];
                let dxhat = dy[index] * g[index];
                sum_dxhat += dxhat;
                sum_dxhat_xhat += dxhat * xh[index];
            }
            let target = d_x.row_mut(row);
            for index in 0..n_i {
                let dxhat = dy[index] * g[index];
                target[index] =
                    inv_std[row] / n * (n * dxhat - sum_dxhat - xh[index] * sum_dxhat_xhat);
            }
        }
        self.accumulate_grad("G", &d_g)?;
        self.accumulate_grad("b", &d_b)?;
        from_matrix(d_x, &layout)
    }

    fn forward_expand_window(&self, input: Value, window: usize) -> Result<(Value, Cache), NnError> {
        let n_i = self.get_dim(DIM_IN)?;
        let (input, layout) = self.to_matrix(input, n_i)?;
        self.check_width(input.cols(), n_i)?;
        let span = 2 * window + 1;
        let mut out = Array::zeros(vec![input.rows(), n_i * span]);
        for (start, length) in layout.segments(input.rows()) {
            for i in 0..length {
                let target = out.row_mut(start + i);
                for k in 0..span {
                    let Some(j) = (i + k).checked_sub(window) else {
                        continue;
                    };
                    if j >= length {
                        continue;
                    }
                    target[k * n_i..(k + 1) * n_i].copy_from_slice(input.row(start + j));
                }
            }
        }
        Ok((from_matrix(out, &layout)?, Cache::ExpandWindow { window, layout }))
    }

    fn backward_expand_window(
        &mut self,
        window: usize,
        layout: Layout,
        d_output: Value,
    ) -> Result<Value, NnError> {
        let n_i = self.get_dim(DIM_IN)?;
        let span = 2 * window + 1;
        let (d_y, _) = self.to_matrix(d_output, n_i * span)?;
        let mut d_x = Array::zeros(vec![d_y.rows(), n_i]);
        for (start, length) in layout.segments(d_y.rows()) {
            for i in 0..length {
                let source = d_y.row(start + i);
                for k in 0..span {
                    let Some(j) = (i + k).checked_sub(window) else {
                        continue;
                    };
                    if j >= length {
                        continue;
                    }
                    kernels::axpy(1.0, &source[k * n_i..(k + 1) * n_i], d_x.row_mut(start + j));
                }
            }
        }
        from_matrix(d_x, &layout)
    }

    fn forward_linear(&self, input: Value) -> Result<(Value, Cache), NnError> {
        let n_o = self.get_dim(DIM_OUT)?;
        let n_i = self.get_dim(DIM_IN)?;
        let (input, layout) = self.to_matrix(input, n_i)?;
        self.check_width(input.cols(), n_i)?;
        let w = self.get_param("W")?;
        let b = self.get_param("b")?;
        let mut out = kernels::gemm_nt(input.as_slice(), w.as_slice(), input.rows(), n_o, n_i);
        kernels::add_bias(&mut out, b.as_slice());
        let out = Array::from_shape_vec(vec![input.rows(), n_o], out)?;
        Ok((from_matrix(out, &layout)?, Cache::Dense { input, layout }))
    }

    fn backward_linear(
        &mut self,
        input: Array,
        layout: Layout,
        d_output: Value,
    ) -> Result<Value, NnError> {
        let n_o = self.get_dim(DIM_OUT)?;
        let n_i = self.get_dim(DIM_IN)?;
        let (d_y, _) = self.to_matrix(d_output, n_o)?;
        let rows = input.rows();
        let mut d_w = vec![0.0; n_o * n_i];
        kernels::gemm_tn_acc(d_y.as_slice(), input.as_slice(), &mut d_w, rows, n_o, n_i);
        let mut d_b = vec![0.0; n_o];
        kernels::sum_rows_acc(d_y.as_slice(), &mut d_b);
        self.accumulate_grad("W", &d_w)?;
        self.accumulate_grad("b", &d_b)?;
        let w = self.get_param("W")?;
        let d_x = kernels::gemm_nn(d_y.as_slice(), w.as_slice(), rows, n_o, n_i);
        from_matrix(Array::from_shape_vec(vec![rows, n_i], d_x)?, &layout)
    }

    fn forward_sparse_linear(&self, input: Value, length: usize) -> Result<(Value, Cache), NnError> {
        let features = self.expect_features(input)?;
        let n_o = self.get_dim(DIM_OUT)?;
        let w = self.get_param("W")?;
        let b = self.get_param("b")?;
        let mut out = Array::zeros(vec![features.len(), n_o]);
        for (doc, rows) in features.iter().enumerate() {
            let target = out.row_mut(doc);
            target.copy_from_slice(b.as_slice());
            for row in rows {
                let (key, count) = self.ngram_entry(row)?;
                for (class, slot) in target.iter_mut().enumerate() {
                    *slot += count * w.as_slice()[class * length + sparse_index(key, class, length)];
                }
            }
        }
        Ok((Value::Array(out), Cache::SparseLinear { length, features }))
    }

    fn backward_sparse_linear(
        &mut self,
        length: usize,
        features: Vec<FeatureRows>,
        d_output: Value,
    ) -> Result<Value, NnError> {
        let n_o = self.get_dim(DIM_OUT)?;
        let (d_y, _) = self.to_matrix(d_output, n_o)?;
        let mut d_w = vec![0.0; n_o * length];
        let mut d_b = vec![0.0; n_o];
        kernels::sum_rows_acc(d_y.as_slice(), &mut d_b);
        for (doc, rows) in features.iter().enumerate() {
            let d_row = d_y.row(doc);
            for row in rows {
                let (key, count) = self.ngram_entry(row)?;
                for (class, d) in d_row.iter().enumerate() {
                    d_w[class * length + sparse_index(key, class, length)] += count * d;
                }
            }
        }
        self.accumulate_grad("W", &d_w)?;
        self.accumulate_grad("b", &d_b)?;
        Ok(Value::Empty)
    }

    fn ngram_entry(&self, row: &[u64]) -> Result<(u64, f64), NnError> {
        match row {
            [key, count] => Ok((*key, *count as f64)),
            _ => Err(NnError::ColumnOutOfRange {
                node: self.name.clone(),
                column: 1,
                width: row.len(),
            }),
        }
    }

    fn forward_softmax(&self, input: Value) -> Result<(Value, Cache), NnError> {
        let n_o = self.get_dim(DIM_OUT)?;
        let n_i = self.get_dim(DIM_IN)?;
        let (input, layout) = self.to_matrix(input, n_i)?;
        self.check_width(input.cols(), n_i)?;
        let w = self.get_param("W")?;
        let b = self.get_param("b")?;
        let mut out = kernels::gemm_nt(input.as_slice(), w.as_slice(), input.rows(), n_o, n_i);
        kernels::add_bias(&mut out, b.as_slice());
        kernels::softmax_rows(&mut out, n_o);
        let output = Array::from_shape_vec(vec![input.rows(), n_o], out)?;
        Ok((
            from_matrix(output.clone(), &layout)?,
            Cache::Softmax {
                input,
                output,
                layout,
            },
        ))
    }

    fn backward_softmax(
        &mut self,
        input: Array,
        output: Array,
        layout: Layout,
        d_output: Value,
    ) -> Result<Value, NnError> {
        let n_o = self.get_dim(DIM_OUT)?;
        let (d_y, _) = self.to_matrix(d_output, n_o)?;
        let d_z = softmax_backward(&d_y, &output)?;
        self.backward_linear(input, layout, Value::Array(d_z))
    }
}

/// Gradient through a row-wise softmax: `p * (dy - <dy, p>)`.
fn softmax_backward(d_y: &Array, output: &Array) -> Result<Array, NnError> {
    d_y.ensure_same_shape(output)?;
    let mut d_z = d_y.clone();
    for row in 0..output.rows() {
        let y = output.row(row);
        let inner = kernels::dot(d_y.row(row), y);
        for (slot, (d, p)) in d_z.row_mut(row).iter_mut().zip(d_y.row(row).iter().zip(y)) {
            *slot = p * (d - inner);
        }
    }
    Ok(d_z)
}

#[derive(Debug, Clone, PartialEq)]
enum Layout {
    Batch,
    Docs(Vec<usize>),
}

impl Layout {
    /// `(start_row, length)` per sequence; a batch is one sequence.
    fn segments(&self, rows: usize) -> Vec<(usize, usize)> {
        match self {
            Self::Batch => vec![(0, rows)],
            Self::Docs(lengths) => {
                let mut start = 0usize;
                lengths
                    .iter()
                    .map(|length| {
                        let segment = (start, *length);
                        start += length;
                        segment
                    })
                    .collect()
            }
        }
    }
}

fn from_matrix(matrix: Array, layout: &Layout) -> Result<Value, NnError> {
    match layout {
        Layout::Batch => Ok(Value::Array(matrix)),
        Layout::Docs(lengths) => Ok(Value::Arrays(matrix.split_rows(lengths)?)),
    }
}

fn add_values(lhs: Value, rhs: Value) -> Result<Value, NnError> {
    match (lhs, rhs) {
        (Value::Empty, other) | (other, Value::Empty) => Ok(other),
        (Value::Array(mut a), Value::Array(b)) => {
            a.add_assign(&b)?;
            Ok(Value::Array(a))
        }
        (Value::Arrays(mut a), Value::Arrays(b)) => {
            if a.len() != b.len() {
                return Err(NnError::Array(ArrayError::SplitMismatch {
                    expected: a.len(),
                    actual: b.len(),
                }));
            }
            for (lhs, rhs) in a.iter_mut().zip(b.iter()) {
                lhs.add_assign(rhs)?;
            }
            Ok(Value::Arrays(a))
        }
        (lhs, rhs) => Err(NnError::InputKind {
            node: "gradient".to_string(),
            expected: lhs.kind(),
            actual: rhs.kind(),
        }),
    }
}

fn hash_buckets(id: u64, seed: u64, n_v: usize) -> [usize; HASH_BUCKETS] {
    let mut buckets = [0usize; HASH_BUCKETS];
    for (index, slot) in buckets.iter_mut().enumerate() {
        *slot = (det64_parts(&[seed, id, index as u64]) % n_v as u64) as usize;
    }
    buckets
}

fn sparse_index(key: u64, class: usize, length: usize) -> usize {
    (det64_parts(&[key, class as u64]) % length as u64) as usize
}

/// Count every n-gram of `attr` ids up to `ngram_size`; rows are
/// `[key, count]`, sorted by key.
fn count_ngrams(doc: &Doc, attr: Attr, ngram_size: usize) -> FeatureRows {
    let ids: Vec<u64> = doc.tokens().iter().map(|token| token.attr(attr)).collect();
    let mut counts: BTreeMap<u64, u64> = BTreeMap::new();
    for size in 1..=ngram_size {
        for gram in ids.windows(size) {
            let key = if size == 1 { gram[0] } else { det64_parts(gram) };
            *counts.entry(key).or_insert(0) += 1;
        }
    }
    counts.into_iter().map(|(key, count)| vec![key, count]).collect()
}

fn glorot_uniform(
    rng: &mut RandomState,
    shape: Vec<usize>,
    fan_in: usize,
    fan_out: usize,
) -> Result<Array, NnError> {
    let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
    Ok(rng.uniform(shape, -limit, limit)?)
}

#[derive(Debug)]
enum Cache {
    Nothing,
    Chain(Vec<Cache>),
    Concatenate {
        caches: Vec<Cache>,
        widths: Vec<usize>,
        layout: Layout,
    },
    Residual(Box<Cache>),
    HashEmbed {
        keys: Vec<Vec<[usize; HASH_BUCKETS]>>,
    },
    Projection {
        input: Array,
    },
    Dense {
        input: Array,
        layout: Layout,
    },
    Maxout {
        input: Array,
        which: Vec<usize>,
        layout: Layout,
    },
    LayerNorm {
        xhat: Array,
        inv_std: Vec<f64>,
        layout: Layout,
    },
    ExpandWindow {
        window: usize,
        layout: Layout,
    },
    SparseLinear {
        length: usize,
        features: Vec<FeatureRows>,
    },
    Activation {
        output: Array,
        layout: Layout,
    },
    Softmax {
        input: Array,
        output: Array,
        layout: Layout,
    },
    SoftmaxActivation {
        output: Array,
        layout: Layout,
    },
    Dropout {
        mask: Option<Array>,
    },
    ReduceMean {
        lengths: Vec<usize>,
        width: usize,
    },
}

/// Everything a training forward pass recorded, consumed by one backward
/// pass.
#[derive(Debug)]
pub struct Backprop {
    cache: Cache,
}

impl Backprop {
    /// Accumulate parameter gradients into `model` and return the gradient
    /// with respect to the forward input. `model` must be the model that
    /// produced this backprop.
    pub fn backward(self, model: &mut Model, d_output: Value) -> Result<Value, NnError> {
        model.backward(self.cache, d_output)
    }
}

/// Set the rate of every dropout node in the tree; returns how many nodes
/// were changed.
pub fn set_dropout_rate(model: &mut Model, rate: f64) -> Result<usize, NnError> {
    if !rate.is_finite() || !(0.0..1.0).contains(&rate) {
        return Err(NnError::InvalidDropout { rate });
    }
    let mut changed = 0usize;
    model.for_each_node_mut(&mut |node: &mut Model| {
        if let Op::Dropout { rate: current } = &mut node.op {
            *current = rate;
            changed += 1;
        }
    });
    Ok(changed)
}

fn check_link(lhs: &Model, rhs: &Model) -> Result<(), NnError> {
    if let (Some(lhs_out), Some(rhs_in)) = (lhs.dims.get(DIM_OUT), rhs.dims.get(DIM_IN)) {
        if lhs_out != rhs_in {
            return Err(NnError::DimMismatch {
                lhs: lhs.name.clone(),
                rhs: rhs.name.clone(),
                lhs_out: *lhs_out,
                rhs_in: *rhs_in,
            });
        }
    }
    Ok(())
}

fn preserves_width(op: &Op) -> bool {
    matches!(op, Op::Dropout { .. } | Op::Logistic | Op::SoftmaxActivation)
}

/// Feed each layer's output into the next.
///
/// Adjacent declared widths must agree; width-preserving layers without
/// dims (dropout, activations) pass the previous width through.
pub fn chain(layers: Vec<Model>) -> Result<Model, NnError> {
    if layers.is_empty() {
        return Err(NnError::EmptyCombinator { combinator: "chain" });
    }
    let mut previous: Option<&Model> = None;
    for layer in &layers {
        if let Some(lhs) = previous {
            check_link(lhs, layer)?;
        }
        if layer.dims.contains_key(DIM_OUT) {
            previous = Some(layer);
        } else if !preserves_width(&layer.op) {
            previous = None;
        }
    }
    let mut dims = Vec::new();
    if let Some(n_i) = layers
        .iter()
        .find(|layer| layer.dims.contains_key(DIM_IN) || !preserves_width(&layer.op))
        .and_then(|layer| layer.dims.get(DIM_IN))
    {
        dims.push((DIM_IN, *n_i));
    }
    if let Some(n_o) = layers
        .iter()
        .rev()
        .find(|layer| layer.dims.contains_key(DIM_OUT) || !preserves_width(&layer.op))
        .and_then(|layer| layer.dims.get(DIM_OUT))
    {
        dims.push((DIM_OUT, *n_o));
    }
    Ok(Model::new("chain", Op::Chain, &dims, layers))
}

/// Run every layer on the same input and join outputs column-wise.
pub fn concatenate(layers: Vec<Model>) -> Result<Model, NnError> {
    if layers.is_empty() {
        return Err(NnError::EmptyCombinator {
            combinator: "concatenate",
        });
    }
    let mut dims = Vec::new();
    let widths: Option<Vec<usize>> = layers
        .iter()
        .map(|layer| layer.dims.get(DIM_OUT).copied())
        .collect();
    if let Some(widths) = widths {
        dims.push((DIM_OUT, widths.iter().sum()));
    }
    if let Some(n_i) = layers[0].dims.get(DIM_IN) {
        dims.push((DIM_IN, *n_i));
    }
    Ok(Model::new("concatenate", Op::Concatenate, &dims, layers))
}

/// `y = x + layer(x)`; the layer must preserve width.
pub fn residual(layer: Model) -> Result<Model, NnError> {
    check_link(&layer, &layer)?;
    let dims: Vec<(&'static str, usize)> = [DIM_IN, DIM_OUT]
        .into_iter()
        .filter_map(|dim| layer.dims.get(dim).map(|value| (dim, *value)))
        .collect();
    Ok(Model::new("residual", Op::Residual, &dims, vec![layer]))
}

/// Chain `times` freshly built copies of a layer.
pub fn clone_layers<F>(times: usize, mut make: F) -> Result<Model, NnError>
where
    F: FnMut(usize) -> Result<Model, NnError>,
{
    let layers = (0..times).map(&mut make).collect::<Result<Vec<_>, _>>()?;
    chain(layers)
}

#[must_use]
pub fn feature_extractor(attrs: Vec<Attr>) -> Model {
    Model::new("extract_features", Op::FeatureExtractor { attrs }, &[], Vec::new())
}

#[must_use]
pub fn extract_ngrams(ngram_size: usize, attr: Attr) -> Model {
    Model::new(
        "extract_ngrams",
        Op::ExtractNgrams { ngram_size, attr },
        &[],
        Vec::new(),
    )
}

/// Hashed embedding of feature `column`; each id sums four rows of `E`.
#[must_use]
pub fn hash_embed(n_o: usize, n_v: usize, column: usize, seed: u64) -> Model {
    Model::new(
        "hashembed",
        Op::HashEmbed { column, seed },
        &[(DIM_OUT, n_o), (DIM_VOCAB, n_v)],
        Vec::new(),
    )
}

/// Fixed pretrained vectors looked up by feature `column`, projected to `n_o`.
#[must_use]
pub fn static_vectors(n_o: usize, column: usize, table: VectorTable) -> Model {
    let n_i = table.width();
    Model::new(
        "static_vectors",
        Op::StaticVectors { column, table },
        &[(DIM_OUT, n_o), (DIM_IN, n_i)],
        Vec::new(),
    )
}

#[must_use]
pub fn maxout(n_o: usize, n_i: usize, n_p: usize) -> Model {
    Model::new(
        "maxout",
        Op::Maxout,
        &[(DIM_OUT, n_o), (DIM_IN, n_i), (DIM_PIECES, n_p)],
        Vec::new(),
    )
}

#[must_use]
pub fn layer_norm(n_i: usize) -> Model {
    Model::new(
        "layernorm",
        Op::LayerNorm,
        &[(DIM_OUT, n_i), (DIM_IN, n_i)],
        Vec::new(),
    )
}

/// Concatenate each row with its `window` neighbours on both sides,
/// zero-padded at sequence boundaries.
#[must_use]
pub fn expand_window(n_i: usize, window: usize) -> Model {
    Model::new(
        "expand_window",
        Op::ExpandWindow { window },
        &[(DIM_OUT, n_i * (2 * window + 1)), (DIM_IN, n_i)],
        Vec::new(),
    )
}

#[must_use]
pub fn linear(n_o: usize, n_i: usize) -> Model {
    Model::new("linear", Op::Linear, &[(DIM_OUT, n_o), (DIM_IN, n_i)], Vec::new())
}

/// Hashed linear model over `[key, count]` feature rows.
#[must_use]
pub fn sparse_linear(n_o: usize, length: usize) -> Model {
    Model::new(
        "sparse_linear",
        Op::SparseLinear { length },
        &[(DIM_OUT, n_o)],
        Vec::new(),
    )
}

#[must_use]
pub fn logistic() -> Model {
    Model::new("logistic", Op::Logistic, &[], Vec::new())
}

#[must_use]
pub fn softmax(n_o: usize, n_i: usize) -> Model {
    Model::new("softmax", Op::Softmax, &[(DIM_OUT, n_o), (DIM_IN, n_i)], Vec::new())
}

/// Parameter-free row-wise softmax.
#[must_use]
pub fn softmax_activation() -> Model {
    Model::new("softmax_activation", Op::SoftmaxActivation, &[], Vec::new())
}

#[must_use]
pub fn dropout(rate: f64) -> Model {
    Model::new("dropout", Op::Dropout { rate }, &[], Vec::new())
}

/// Mean over each doc's rows; empty docs map to zeros.
#[must_use]
pub fn reduce_mean(n_i: usize) -> Model {
    Model::new(
        "reduce_mean",
        Op::ReduceMean,
        &[(DIM_OUT, n_i), (DIM_IN, n_i)],
        Vec::new(),
    )
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use sp_core::Array;
    use sp_optim::{Adam, SGD};
    use sp_random::RandomState;
    use sp_text::{Attr, Tokenizer};

    use super::*;

    fn docs(texts: &[&str]) -> Vec<Doc> {
        let tokenizer = Tokenizer::new();
        texts.iter().map(|text| tokenizer.tokenize(text)).collect()
    }

    fn matrix(rows: usize, cols: usize, values: &[f64]) -> Array {
        Array::from_shape_vec(vec![rows, cols], values.to_vec()).expect("matrix should build")
    }

    /// Sum of `output * d_output`, the scalar whose gradient backward computes.
    fn probe(output: &Value, d_output: &Value) -> f64 {
        let lhs = output.to_output().expect("numeric output");
        let rhs = d_output.to_output().expect("numeric gradient");
        lhs.leaves()
            .iter()
            .zip(rhs.leaves())
            .map(|(a, b)| kernels::dot(a.as_slice(), b.as_slice()))
            .sum()
    }

    /// Central-difference check of d(probe)/d(input) for an initialised layer.
    fn check_input_gradient(mut model: Model, input: Array, d_output: Array) {
        let mut rng = RandomState::seeded(0);
        let (output, backprop) = model
            .begin_update(&mut rng, Value::Array(input.clone()))
            .expect("forward should succeed");
        assert_eq!(output.kind(), "array");
        let d_input = backprop
            .backward(&mut model, Value::Array(d_output.clone()))
            .expect("backward should succeed");
        let Value::Array(d_input) = d_input else {
            panic!("expected array gradient, got {}", d_input.kind());
        };
        let d_output = Value::Array(d_output);
        let eps = 1e-6;
        for index in 0..input.numel() {
            let mut plus = input.clone();
            plus.as_mut_slice()[index] += eps;
            let mut minus = input.clone();
            minus.as_mut_slice()[index] -= eps;
            let up = probe(&model.predict(Value::Array(plus)).expect("predict"), &d_output);
            let down = probe(&model.predict(Value::Array(minus)).expect("predict"), &d_output);
            let numeric = (up - down) / (2.0 * eps);
            let analytic = d_input.as_slice()[index];
            assert!(
                (numeric - analytic).abs() < 1e-5,
                "{}: gradient mismatch at {index}: numeric={numeric} analytic={analytic}",
                model.name()
            );
        }
    }

    fn init(model: Model) -> Model {
        model
            .initialized(&mut RandomState::seeded(11))
            .expect("initialize should succeed")
    }

    #[test]
    fn dense_layer_gradients_match_finite_differences() {
        let input = matrix(2, 3, &[0.3, -1.2, 0.8, 1.5, 0.1, -0.4]);
        let d_two = matrix(2, 2, &[1.0, -0.5, 0.25, 2.0]);
        check_input_gradient(init(linear(2, 3)), input.clone(), d_two.clone());
        check_input_gradient(
            init(layer_norm(3)),
            input.clone(),
            matrix(2, 3, &[0.5, -1.0, 0.2, 1.0, 0.3, -0.7]),
        );
        check_input_gradient(init(maxout(2, 3, 3)), input.clone(), d_two.clone());
        check_input_gradient(init(logistic()), input.clone(), matrix(2, 3, &[1.0; 6]));
        check_input_gradient(
            init(softmax_activation()),
            input.clone(),
            matrix(2, 3, &[1.0, 0.0, -2.0, 0.5, 0.5, 3.0]),
        );

        let mut classifier = init(softmax(2, 3));
        classifier
            .set_param("W", matrix(2, 3, &[0.2, -0.1, 0.4, -0.3, 0.5, 0.1]))
            .expect("set W");
        check_input_gradient(classifier, input, matrix(2, 2, &[1.0, -1.0, 0.5, 0.0]));
    }

    #[test]
    fn expand_window_pads_at_doc_boundaries() {
        let mut model = expand_window(1, 1);
        let mut rng = RandomState::seeded(0);
        model.initialize(&mut rng).expect("initialize");
        let input = Value::Arrays(vec![matrix(2, 1, &[1.0, 2.0]), matrix(1, 1, &[3.0])]);
        let (output, backprop) = model.begin_update(&mut rng, input).expect("forward");
        assert_eq!(
            output,
            Value::Arrays(vec![
                matrix(2, 3, &[0.0, 1.0, 2.0, 1.0, 2.0, 0.0]),
                matrix(1, 3, &[0.0, 3.0, 0.0]),
            ])
        );
        let d_input = backprop
            .backward(
                &mut model,
                Value::Arrays(vec![matrix(2, 3, &[1.0; 6]), matrix(1, 3, &[1.0; 3])]),
            )
            .expect("backward");
        assert_eq!(
            d_input,
            Value::Arrays(vec![matrix(2, 1, &[2.0, 2.0]), matrix(1, 1, &[1.0])])
        );
    }

    #[test]
    fn reduce_mean_handles_empty_docs() {
        let mut model = reduce_mean(2);
        let mut rng = RandomState::seeded(0);
        model.initialize(&mut rng).expect("initialize");
        let input = Value::Arrays(vec![matrix(2, 2, &[1.0, 2.0, 3.0, 4.0]), Array::zeros(vec![0, 2])]);
        let (output, backprop) = model.begin_update(&mut rng, input).expect("forward");
        assert_eq!(output, Value::Array(matrix(2, 2, &[2.0, 3.0, 0.0, 0.0])));
        let d_input = backprop
            .backward(&mut model, Value::Array(matrix(2, 2, &[2.0, 4.0, 1.0, 1.0])))
            .expect("backward");
        assert_eq!(
            d_input,
            Value::Arrays(vec![matrix(2, 2, &[1.0, 2.0, 1.0, 2.0]), Array::zeros(vec![0, 2])])
        );
    }

    #[test]
    fn hash_embed_is_deterministic_and_accumulates_gradients() {
        let build = || {
            chain(vec![
                feature_extractor(vec![Attr::Norm]),
                hash_embed(4, 50, 0, 7),
            ])
            .expect("chain should build")
        };
        let corpus = docs(&["the cat sat", "the"]);
        let mut a = build();
        let mut b = build();
        a.initialize(&mut RandomState::seeded(5)).expect("init a");
        b.initialize(&mut RandomState::seeded(5)).expect("init b");
        let ya = a.predict(Value::Docs(corpus.clone())).expect("predict a");
        let yb = b.predict(Value::Docs(corpus.clone())).expect("predict b");
        assert_eq!(ya, yb);
        let Value::Arrays(arrays) = &ya else {
            panic!("expected per-doc arrays");
        };
        assert_eq!(arrays[0].shape(), &[3, 4]);
        // "the" embeds identically wherever it appears.
        assert_eq!(arrays[0].row(0), arrays[1].row(0));

        let mut rng = RandomState::seeded(0);
        let (output, backprop) = a.begin_update(&mut rng, Value::Docs(corpus)).expect("forward");
        let d_output = Value::from_output(output.to_output().expect("numeric")).expect("value");
        let d_input = backprop.backward(&mut a, d_output).expect("backward");
        assert_eq!(d_input, Value::Empty);
        let grad = a.layers()[1].get_grad("E").expect("known param");
        assert!(grad.is_some_and(|grad| grad.as_slice().iter().any(|v| *v != 0.0)));
    }

    #[test]
    fn dropout_only_acts_during_updates() {
        let mut model = dropout(0.5);
        let mut rng = RandomState::seeded(0);
        model.initialize(&mut rng).expect("initialize");
        let input = Value::Array(Array::full(vec![4, 8], 1.0));
        assert_eq!(model.predict(input.clone()).expect("predict"), input);
        let (output, _) = model.begin_update(&mut rng, input.clone()).expect("forward");
        let Value::Array(output) = output else {
            panic!("expected array");
        };
        assert!(output.as_slice().iter().all(|v| *v == 0.0 || *v == 2.0));
        assert!(output.as_slice().iter().any(|v| *v == 0.0));
    }

    #[test]
    fn set_dropout_rate_rewrites_every_dropout_node() {
        let mut model = chain(vec![
            linear(2, 2),
            dropout(0.1),
            residual(chain(vec![linear(2, 2), dropout(0.0)]).expect("inner")).expect("residual"),
        ])
        .expect("chain");
        assert_eq!(set_dropout_rate(&mut model, 0.2).expect("rate should apply"), 2);
        let rates: Vec<f64> = model
            .walk()
            .iter()
            .filter_map(|node| match node.op() {
                Op::Dropout { rate } => Some(*rate),
                _ => None,
            })
            .collect();
        assert_eq!(rates, vec![0.2, 0.2]);
        assert_eq!(
            set_dropout_rate(&mut model, 1.0),
            Err(NnError::InvalidDropout { rate: 1.0 })
        );
    }

    #[test]
    fn chain_rejects_mismatched_dims() {
        let err = chain(vec![linear(4, 3), linear(2, 5)]).expect_err("4 -> 5 must fail");
        assert_eq!(
            err,
            NnError::DimMismatch {
                lhs: "linear".to_string(),
                rhs: "linear".to_string(),
                lhs_out: 4,
                rhs_in: 5,
            }
        );
        assert!(residual(linear(4, 3)).is_err());
        assert!(chain(Vec::new()).is_err());
    }

    #[test]
    fn chain_passes_widths_through_dropout_and_activations() {
        let model = chain(vec![linear(4, 3), dropout(0.1), logistic()]).expect("chain");
        assert_eq!(model.get_dim(DIM_IN), Ok(3));
        assert_eq!(model.get_dim(DIM_OUT), Ok(4));
        assert!(chain(vec![linear(4, 3), dropout(0.1), linear(2, 5)]).is_err());
        let typed = chain(vec![feature_extractor(vec![Attr::Orth]), hash_embed(4, 10, 0, 0)])
            .expect("chain");
        assert!(!typed.has_dim(DIM_IN));
    }

    #[test]
    fn predict_before_initialize_fails_closed() {
        let model = linear(2, 2);
        let err = model
            .predict(Value::Array(Array::zeros(vec![1, 2])))
            .expect_err("uninitialized predict must fail");
        assert_eq!(
            err,
            NnError::Uninitialized {
                node: "linear".to_string()
            }
        );
    }

    #[test]
    fn initialize_twice_is_rejected() {
        let mut model = linear(2, 2);
        let mut rng = RandomState::seeded(0);
        model.initialize(&mut rng).expect("first initialize");
        assert!(matches!(
            model.initialize(&mut rng),
            Err(NnError::AlreadyInitialized { .. })
        ));
    }

    #[test]
    fn zero_dims_fail_at_initialize() {
        let mut model = linear(0, 2);
        assert!(matches!(
            model.initialize(&mut RandomState::seeded(0)),
            Err(NnError::InvalidDim { dim: "nO", .. })
        ));
    }

    #[test]
    fn walk_and_module_traversal_agree() {
        let model = chain(vec![
            feature_extractor(vec![Attr::Orth]),
            concatenate(vec![hash_embed(2, 10, 0, 1), hash_embed(2, 10, 0, 2)]).expect("concat"),
        ])
        .expect("chain");
        let names: Vec<&str> = model.walk().iter().map(|node| node.name()).collect();
        assert_eq!(
            names,
            vec!["chain", "extract_features", "concatenate", "hashembed", "hashembed"]
        );
        let paths: Vec<String> = walk_modules(&model).into_iter().map(|(path, _)| path).collect();
        assert_eq!(paths, vec!["0", "0.0", "0.1", "0.1.0", "0.1.1"]);
        let model_paths: Vec<String> = model
            .walk_with_paths()
            .into_iter()
            .map(|(path, _)| path)
            .collect();
        assert_eq!(paths, model_paths);
    }

    #[test]
    fn finish_update_applies_and_clears_gradients() {
        let mut model = chain(vec![linear(2, 3), logistic()]).expect("chain");
        let mut rng = RandomState::seeded(0);
        model.initialize(&mut rng).expect("initialize");
        let before = model.layers()[0].get_param("W").expect("W").clone();
        let (_, backprop) = model
            .begin_update(&mut rng, Value::Array(matrix(1, 3, &[1.0, 2.0, 3.0])))
            .expect("forward");
        backprop
            .backward(&mut model, Value::Array(matrix(1, 2, &[1.0, -1.0])))
            .expect("backward");
        let mut optimizer = SGD::new(0.5);
        assert_eq!(model.finish_update(&mut optimizer).expect("update"), 2);
        assert_ne!(model.layers()[0].get_param("W").expect("W"), &before);
        assert_eq!(model.layers()[0].get_grad("W").expect("known"), None);
        let key = ParamKey::new("0.0", "W");
        assert_eq!(optimizer.step_count(&key), 1);
        assert_eq!(model.finish_update(&mut Adam::new(0.1)).expect("no grads"), 0);
    }

    #[test]
    fn bag_of_words_counts_ngrams() {
        let doc = &docs(&["a b a b"])[0];
        let rows = count_ngrams(doc, Attr::Orth, 2);
        let total: u64 = rows.iter().map(|row| row[1]).sum();
        // 4 unigrams + 3 bigrams
        assert_eq!(total, 7);
        assert_eq!(rows.len(), 4);
    }

    #[test]
    fn static_vectors_project_known_words() {
        let table = VectorTable::from_entries(
            2,
            vec![(sp_core::det64_str("cat"), vec![1.0, 0.0])],
        )
        .expect("table should build");
        let mut model = chain(vec![
            feature_extractor(vec![Attr::Orth]),
            static_vectors(3, 0, table),
        ])
        .expect("chain");
        model.initialize(&mut RandomState::seeded(0)).expect("init");
        let output = model
            .predict(Value::Docs(docs(&["cat dog"])))
            .expect("predict");
        let Value::Arrays(arrays) = output else {
            panic!("expected arrays");
        };
        assert!(arrays[0].row(0).iter().any(|v| *v != 0.0));
        assert!(arrays[0].row(1).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn value_output_conversion_rejects_non_numeric_kinds() {
        assert!(Value::Docs(Vec::new()).to_output().is_none());
        assert!(Value::Features(Vec::new()).to_output().is_none());
        assert!(Value::Empty.to_output().is_none());
        let nested = Output::Sequence(vec![Output::Sequence(Vec::new())]);
        assert!(Value::from_output(nested).is_none());
    }

    proptest! {
        #[test]
        fn prop_initialization_is_a_function_of_seed(seed in any::<u64>(), width in 1usize..6) {
            let build = || chain(vec![maxout(width, 3, 2), layer_norm(width), linear(2, width)])
                .expect("chain should build");
            let a = build().initialized(&mut RandomState::seeded(seed)).expect("init a");
            let b = build().initialized(&mut RandomState::seeded(seed)).expect("init b");
            prop_assert_eq!(a, b);
        }
    }
}
