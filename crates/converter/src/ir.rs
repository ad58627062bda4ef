//! Intermediate representation of an Anime4K CNN model
//!
//! Every reader produces an [`Anime4kCnn`] and every writer consumes one.
//! Tail tensors are held in shader channel order: the pixel-shuffle
//! permutation has already been applied when the model came from a checkpoint.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::{self, mark_block};

/// Channel permutation between checkpoint (PyTorch pixel-shuffle) order and shader order
///
/// Self-inverse: applying it twice yields the identity.
pub const PIXEL_SHUFFLE_PERM: [usize; 12] = [0, 2, 1, 3, 4, 6, 5, 7, 8, 10, 9, 11];

/// Number of output channels of the aggregation layer (2x2 sub-pixels x RGB)
pub const TAIL_OUT_CHANNELS: usize = 12;

/// Number of color channels of the input image
pub const INPUT_CHANNELS: usize = 3;

/// A dense 4-D tensor in `[out, in, ky, kx]` row-major layout
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor4 {
    shape: [usize; 4],
    data: Vec<f32>,
}

impl Tensor4 {
    /// Creates a zero-filled tensor
    pub fn zeros(shape: [usize; 4]) -> Self {
        Self {
            shape,
            data: vec![0.0; shape.iter().product()],
        }
    }

    /// Wraps row-major data, checking that its length matches the shape
    pub fn from_vec(shape: [usize; 4], data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(Error::mismatch(format!("tensor of shape {shape:?} needs {expected} values, got {}", data.len())));
        }
        Ok(Self { shape, data })
    }

    /// Tensor dimensions
    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    /// Row-major values
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Consumes the tensor, returning its row-major values
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Flat offset of an index, or `None` when it lies outside the tensor
    pub(crate) fn offset(&self, index: [usize; 4]) -> Option<usize> {
        if index.iter().zip(self.shape).any(|(&i, dim)| i >= dim) {
            return None;
        }
        let [o, i, y, x] = index;
        let [_, n_in, n_y, n_x] = self.shape;
        Some(((o * n_in + i) * n_y + y) * n_x + x)
    }

    /// Reads a value, `None` when out of bounds
    pub fn get(&self, index: [usize; 4]) -> Option<f32> {
        self.offset(index).map(|offset| self.data[offset])
    }

    /// Writes a value; returns `false` and drops it when out of bounds
    pub fn set(&mut self, index: [usize; 4], value: f32) -> bool {
        match self.offset(index) {
            Some(offset) => {
                self.data[offset] = value;
                true
            }
            None => false,
        }
    }

    /// Reorders the output-channel dimension so that `result[o] = self[perm[o]]`
    pub fn permute_outputs(&self, perm: &[usize]) -> Result<Self> {
        if perm.len() != self.shape[0] || perm.iter().any(|&p| p >= self.shape[0]) {
            return Err(Error::mismatch(format!("permutation of length {} does not fit {} output channels", perm.len(), self.shape[0])));
        }
        let block = self.shape[1] * self.shape[2] * self.shape[3];
        let data = perm.iter().flat_map(|&p| self.data[p * block..(p + 1) * block].iter().copied()).collect();
        Ok(Self { shape: self.shape, data })
    }

    fn first_non_finite(&self) -> Option<f32> {
        self.data.iter().copied().find(|v| !v.is_finite())
    }
}

/// Reorders a bias vector so that `result[o] = bias[perm[o]]`
pub fn permute_bias(bias: &[f32], perm: &[usize]) -> Result<Vec<f32>> {
    if perm.len() != bias.len() || perm.iter().any(|&p| p >= bias.len()) {
        return Err(Error::mismatch(format!("permutation of length {} does not fit {} bias values", perm.len(), bias.len())));
    }
    Ok(perm.iter().map(|&p| bias[p]).collect())
}

/// Architecture hyperparameters of the fixed head/mid/tail topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Architecture {
    /// Feature channels per conv layer, a multiple of 4
    pub num_feat: usize,
    /// Conv layers including the head
    pub block_depth: usize,
    /// 2 for the CReLU activation (positive and negated copies), 1 for plain ReLU
    pub factor: usize,
    /// Trailing conv layers whose outputs feed the aggregation layer
    pub n_stack: usize,
    /// Spatial kernel size of the aggregation layer, 1 or 3
    pub tail_kernel: usize,
}

impl Architecture {
    /// Creates a validated architecture descriptor
    pub fn new(num_feat: usize, block_depth: usize, factor: usize, n_stack: usize, tail_kernel: usize) -> Result<Self> {
        let arch = Self {
            num_feat,
            block_depth,
            factor,
            n_stack,
            tail_kernel,
        };
        arch.validate()?;
        Ok(arch)
    }

    /// Checks every invariant of the topology
    pub fn validate(&self) -> Result<()> {
        if self.num_feat == 0 || self.num_feat % 4 != 0 {
            return Err(Error::mismatch(format!("num_feat must be a positive multiple of 4, got {}", self.num_feat)));
        }
        if self.block_depth == 0 {
            return Err(Error::mismatch("block_depth must be at least 1"));
        }
        if !matches!(self.factor, 1 | 2) {
            return Err(Error::mismatch(format!("factor must be 1 or 2, got {}", self.factor)));
        }
        if self.n_stack == 0 || self.n_stack > self.block_depth {
            return Err(Error::mismatch(format!("n_stack must be in 1..={}, got {}", self.block_depth, self.n_stack)));
        }
        if !matches!(self.tail_kernel, 1 | 3) {
            return Err(Error::mismatch(format!("tail_kernel must be 1 or 3, got {}", self.tail_kernel)));
        }
        Ok(())
    }

    /// Number of 4-channel textures holding one layer's output
    pub fn textures_per_layer(&self) -> usize {
        self.num_feat / 4
    }

    /// Input channels of every mid layer
    pub fn mid_in_channels(&self) -> usize {
        self.num_feat * self.factor
    }

    /// Input channels of the aggregation layer
    pub fn tail_in_channels(&self) -> usize {
        self.num_feat * self.factor * self.n_stack
    }

    /// Index of the first conv layer whose output feeds the aggregation
    pub fn stack_start_layer(&self) -> usize {
        self.block_depth - self.n_stack
    }

    /// Head, mid layers, aggregation and depth-to-space
    pub fn logical_pass_count(&self) -> usize {
        self.block_depth + 2
    }

    /// Shape of the head weight
    pub fn head_shape(&self) -> [usize; 4] {
        [self.num_feat, INPUT_CHANNELS, 3, 3]
    }

    /// Shape of every mid-layer weight
    pub fn mid_shape(&self) -> [usize; 4] {
        [self.num_feat, self.mid_in_channels(), 3, 3]
    }

    /// Shape of the aggregation weight
    pub fn tail_shape(&self) -> [usize; 4] {
        [TAIL_OUT_CHANNELS, self.tail_in_channels(), self.tail_kernel, self.tail_kernel]
    }

    /// Input channel where aggregation input `(layer, texture)` starts
    ///
    /// `layer` counts stacked layers from 0, `negative` selects the negated half of
    /// a CReLU output.
    pub fn tail_in_start(&self, layer: usize, texture: usize, negative: bool) -> usize {
        let polarity_offset = if negative { self.num_feat } else { 0 };
        layer * self.mid_in_channels() + polarity_offset + texture * 4
    }

    /// Input channel where mid-layer input texture `texture` starts
    pub fn mid_in_start(&self, texture: usize, negative: bool) -> usize {
        if negative { self.num_feat + texture * 4 } else { texture * 4 }
    }

    /// Canonical short name of this architecture
    pub fn variant_label(&self) -> String {
        utils::variant_label(self)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "num_feat={}, block_depth={}, factor={}, n_stack={}, tail_kernel={}",
            self.num_feat, self.block_depth, self.factor, self.n_stack, self.tail_kernel
        )
    }
}

/// An Anime4K x2 CNN: architecture plus every weight and bias
#[derive(Debug, Clone, PartialEq)]
pub struct Anime4kCnn {
    /// Architecture hyperparameters
    pub arch: Architecture,
    /// Head weight `[num_feat, 3, 3, 3]`
    pub head_weight: Tensor4,
    /// Head bias `[num_feat]`
    pub head_bias: Vec<f32>,
    /// Mid-layer weights, `block_depth - 1` of `[num_feat, num_feat * factor, 3, 3]`
    pub mid_weights: Vec<Tensor4>,
    /// Mid-layer biases, `block_depth - 1` of `[num_feat]`
    pub mid_biases: Vec<Vec<f32>>,
    /// Aggregation weight `[12, tail_in, k, k]` in shader channel order
    pub tail_weight: Tensor4,
    /// Aggregation bias `[12]` in shader channel order
    pub tail_bias: Vec<f32>,
}

impl Anime4kCnn {
    /// Assembles and validates a model
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        arch: Architecture,
        head_weight: Tensor4,
        head_bias: Vec<f32>,
        mid_weights: Vec<Tensor4>,
        mid_biases: Vec<Vec<f32>>,
        tail_weight: Tensor4,
        tail_bias: Vec<f32>,
    ) -> Result<Self> {
        let model = Self {
            arch,
            head_weight,
            head_bias,
            mid_weights,
            mid_biases,
            tail_weight,
            tail_bias,
        };
        model.validate()?;
        Ok(model)
    }

    /// Checks architecture invariants, tensor shapes and that every value is finite
    pub fn validate(&self) -> Result<()> {
        self.arch.validate()?;
        let arch = &self.arch;
        let mid_count = arch.block_depth - 1;

        check_shape("head.weight", &self.head_weight, arch.head_shape())?;
        check_bias("head.bias", &self.head_bias, arch.num_feat)?;

        if self.mid_weights.len() != mid_count || self.mid_biases.len() != mid_count {
            return Err(Error::mismatch(format!(
                "expected {mid_count} mid layers, got {} weights and {} biases",
                self.mid_weights.len(),
                self.mid_biases.len()
            )));
        }
        for (i, (weight, bias)) in self.mid_weights.iter().zip(&self.mid_biases).enumerate() {
            check_shape(&format!("mid[{i}].weight"), weight, arch.mid_shape())?;
            check_bias(&format!("mid[{i}].bias"), bias, arch.num_feat)?;
        }

        check_shape("tail.weight", &self.tail_weight, arch.tail_shape())?;
        check_bias("tail.bias", &self.tail_bias, TAIL_OUT_CHANNELS)?;
        Ok(())
    }

    /// Canonical short name of this model's architecture
    pub fn variant_label(&self) -> String {
        self.arch.variant_label()
    }
}

fn check_shape(name: &str, tensor: &Tensor4, expected: [usize; 4]) -> Result<()> {
    if tensor.shape() != expected {
        return Err(Error::mismatch(format!("{name} has shape {:?}, expected {expected:?}", tensor.shape())));
    }
    if tensor.first_non_finite().is_some() {
        return Err(Error::NonFinite(name.to_string()));
    }
    Ok(())
}

fn check_bias(name: &str, bias: &[f32], expected: usize) -> Result<()> {
    if bias.len() != expected {
        return Err(Error::mismatch(format!("{name} has {} values, expected {expected}", bias.len())));
    }
    if bias.iter().any(|v| !v.is_finite()) {
        return Err(Error::NonFinite(name.to_string()));
    }
    Ok(())
}

/// Assembles one layer's weight and bias from literal blocks, tracking coverage
///
/// Parsers feed every literal block they find; [`LayerFill::finish`] fails when
/// any in-range slot was never written instead of leaving it at zero.
#[derive(Debug)]
pub(crate) struct LayerFill {
    name: String,
    weight: Tensor4,
    written: Vec<bool>,
    bias: Vec<f32>,
    bias_written: Vec<bool>,
}

impl LayerFill {
    pub(crate) fn new(name: impl Into<String>, shape: [usize; 4]) -> Self {
        let weight = Tensor4::zeros(shape);
        let written = vec![false; weight.data().len()];
        Self {
            name: name.into(),
            weight,
            written,
            bias: vec![0.0; shape[0]],
            bias_written: vec![false; shape[0]],
        }
    }

    /// Output channels of the layer
    pub(crate) fn out_channels(&self) -> usize {
        self.weight.shape()[0]
    }

    /// Stores a literal block, see [`utils::pack_block`]
    pub(crate) fn pack(&mut self, values: &[f32], out_start: usize, in_start: usize, ky: usize, kx: usize) {
        utils::pack_block(values, &mut self.weight, out_start, in_start, ky, kx);
        mark_block(&mut self.written, &self.weight, values.len(), out_start, in_start, ky, kx);
    }

    /// Stores bias values starting at `out_start`; values past the end are dropped
    pub(crate) fn set_bias(&mut self, out_start: usize, values: &[f32]) {
        for (i, &value) in values.iter().enumerate() {
            if let Some(slot) = self.bias.get_mut(out_start + i) {
                *slot = value;
                self.bias_written[out_start + i] = true;
            }
        }
    }

    /// Returns the assembled tensors, or [`Error::MissingWeights`] for unwritten slots
    pub(crate) fn finish(self) -> Result<(Tensor4, Vec<f32>)> {
        let missing = self.written.iter().filter(|w| !**w).count();
        if missing > 0 {
            return Err(Error::MissingWeights {
                tensor: format!("{}.weight", self.name),
                missing,
            });
        }
        let missing = self.bias_written.iter().filter(|w| !**w).count();
        if missing > 0 {
            return Err(Error::MissingWeights {
                tensor: format!("{}.bias", self.name),
                missing,
            });
        }
        Ok((self.weight, self.bias))
    }
}

/// Per-layer fills for a whole model, in topology order
pub(crate) struct ModelFill {
    pub(crate) arch: Architecture,
    pub(crate) head: LayerFill,
    pub(crate) mids: Vec<LayerFill>,
    pub(crate) tail: LayerFill,
}

impl ModelFill {
    pub(crate) fn new(arch: Architecture) -> Self {
        Self {
            arch,
            head: LayerFill::new("head", arch.head_shape()),
            mids: (0..arch.block_depth - 1).map(|i| LayerFill::new(format!("mid[{i}]"), arch.mid_shape())).collect(),
            tail: LayerFill::new("tail", arch.tail_shape()),
        }
    }

    /// Finishes every layer and assembles the model
    pub(crate) fn finish(self) -> Result<Anime4kCnn> {
        let (head_weight, head_bias) = self.head.finish()?;
        let (mid_weights, mid_biases): (Vec<_>, Vec<_>) = self.mids.into_iter().map(LayerFill::finish).collect::<Result<Vec<_>>>()?.into_iter().unzip();
        let (tail_weight, tail_bias) = self.tail.finish()?;
        Anime4kCnn::new(self.arch, head_weight, head_bias, mid_weights, mid_biases, tail_weight, tail_bias)
    }
}
