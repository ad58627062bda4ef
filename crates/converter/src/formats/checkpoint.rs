//! Checkpoint containers
//!
//! Two containers carry a PyTorch-style state dict of the model:
//! - safetensors files, read and written
//! - JSON dumps of `{name: tensor.tolist()}`, read only
//!
//! `torch.save` archives live in [`super::pth`]. Every container is turned
//! into a [`StateDict`] first; architecture inference and the pixel-shuffle
//! permutation are shared.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::LazyLock;

use half::{bf16, f16};
use regex::Regex;
use safetensors::{Dtype, SafeTensors, tensor::TensorView};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ir::{Anime4kCnn, Architecture, PIXEL_SHUFFLE_PERM, Tensor4, permute_bias};

/// Container keys a state dict may be nested under, checked in order
const WRAPPER_KEYS: [&str; 4] = ["params_ema", "params", "model", "state_dict"];

const HEAD_WEIGHT: &str = "conv_head.weight";
const HEAD_BIAS: &str = "conv_head.bias";
const TAIL_WEIGHT: &str = "conv_tail.weight";
const TAIL_BIAS: &str = "conv_tail.bias";

fn mid_weight_key(index: usize) -> String {
    format!("conv_mid.{index}.weight")
}

fn mid_bias_key(index: usize) -> String {
    format!("conv_mid.{index}.bias")
}

static RE_MID_WEIGHT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?:^|\.)conv_mid\.(\d+)\.weight$").unwrap());

/// A named tensor of any rank, converted to f32
#[derive(Debug, Clone, PartialEq)]
pub struct RawTensor {
    /// Dimensions
    pub shape: Vec<usize>,
    /// Row-major values
    pub data: Vec<f32>,
}

impl RawTensor {
    fn from_tensor4(tensor: &Tensor4) -> Self {
        Self {
            shape: tensor.shape().to_vec(),
            data: tensor.data().to_vec(),
        }
    }

    fn from_bias(bias: &[f32]) -> Self {
        Self {
            shape: vec![bias.len()],
            data: bias.to_vec(),
        }
    }

    fn to_tensor4(&self, name: &str) -> Result<Tensor4> {
        let shape: [usize; 4] = self
            .shape
            .as_slice()
            .try_into()
            .map_err(|_| Error::mismatch(format!("tensor '{name}' has shape {:?}, expected 4 dimensions", self.shape)))?;
        Tensor4::from_vec(shape, self.data.clone())
    }

    fn to_bias(&self, name: &str) -> Result<Vec<f32>> {
        if self.shape.len() != 1 {
            return Err(Error::mismatch(format!("tensor '{name}' has shape {:?}, expected 1 dimension", self.shape)));
        }
        Ok(self.data.clone())
    }
}

/// An ordered mapping from tensor names to tensors
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDict {
    tensors: BTreeMap<String, RawTensor>,
}

impl StateDict {
    /// Creates an empty state dict
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a tensor
    pub fn insert(&mut self, name: impl Into<String>, tensor: RawTensor) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Looks up a tensor by its exact name
    pub fn get(&self, name: &str) -> Option<&RawTensor> {
        self.tensors.get(name)
    }

    /// Tensor names in order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Number of tensors
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the dict holds no tensors
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Strips the first wrapper prefix (`params_ema.`, `params.`, ...) found on any key
    ///
    /// Only the tensors under that wrapper are kept.
    pub fn unwrap_wrapper(self) -> Self {
        for wrapper in WRAPPER_KEYS {
            let prefix = format!("{wrapper}.");
            if self.tensors.keys().any(|k| k.starts_with(&prefix)) {
                debug!("Unwrapping state dict under '{wrapper}'");
                let tensors = self
                    .tensors
                    .into_iter()
                    .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|stripped| (stripped.to_string(), v)))
                    .collect();
                return Self { tensors };
            }
        }
        self
    }

    /// Resolves a fixed name fragment to exactly one tensor
    ///
    /// A key matches when it equals the fragment or ends with `.<fragment>`.
    fn resolve(&self, fragment: &str) -> Result<&RawTensor> {
        let suffix = format!(".{fragment}");
        let matches: Vec<(&String, &RawTensor)> = self.tensors.iter().filter(|(k, _)| *k == fragment || k.ends_with(&suffix)).collect();
        match matches.as_slice() {
            [] => Err(Error::MissingTensor(fragment.to_string())),
            [(key, tensor)] => {
                debug!("Resolved '{fragment}' to '{key}' with shape {:?}", tensor.shape);
                Ok(tensor)
            }
            _ => Err(Error::AmbiguousTensor {
                fragment: fragment.to_string(),
                keys: matches.iter().map(|(k, _)| k.to_string()).collect(),
            }),
        }
    }

    /// Distinct mid-layer indices, ascending
    fn mid_indices(&self) -> Vec<usize> {
        self.tensors
            .keys()
            .filter_map(|k| RE_MID_WEIGHT.captures(k).and_then(|caps| caps[1].parse().ok()))
            .collect::<BTreeSet<usize>>()
            .into_iter()
            .collect()
    }

    /// Infers the architecture and builds the model
    ///
    /// The tail tensors are permuted into shader channel order.
    pub fn to_model(&self) -> Result<Anime4kCnn> {
        let head_weight = self.resolve(HEAD_WEIGHT)?.to_tensor4(HEAD_WEIGHT)?;
        let head_bias = self.resolve(HEAD_BIAS)?.to_bias(HEAD_BIAS)?;
        let num_feat = head_weight.shape()[0];

        let mut mid_weights = Vec::new();
        let mut mid_biases = Vec::new();
        for index in self.mid_indices() {
            let (weight_key, bias_key) = (mid_weight_key(index), mid_bias_key(index));
            mid_weights.push(self.resolve(&weight_key)?.to_tensor4(&weight_key)?);
            mid_biases.push(self.resolve(&bias_key)?.to_bias(&bias_key)?);
        }
        let block_depth = mid_weights.len() + 1;

        let factor = match mid_weights.first() {
            Some(mid) => exact_ratio(mid.shape()[1], num_feat, "mid-layer input channels", "num_feat")?,
            None => 2,
        };

        let tail_weight = self.resolve(TAIL_WEIGHT)?.to_tensor4(TAIL_WEIGHT)?;
        let tail_bias = self.resolve(TAIL_BIAS)?.to_bias(TAIL_BIAS)?;
        let tail_kernel = tail_weight.shape()[2];
        let n_stack = exact_ratio(tail_weight.shape()[1], num_feat * factor, "tail input channels", "num_feat * factor")?;

        let arch = Architecture::new(num_feat, block_depth, factor, n_stack, tail_kernel)?;
        debug!("Inferred checkpoint architecture: {arch}");

        let tail_weight = tail_weight.permute_outputs(&PIXEL_SHUFFLE_PERM)?;
        let tail_bias = permute_bias(&tail_bias, &PIXEL_SHUFFLE_PERM)?;

        Anime4kCnn::new(arch, head_weight, head_bias, mid_weights, mid_biases, tail_weight, tail_bias)
    }

    /// Builds the state dict of a model, permuting the tail back to checkpoint order
    pub fn from_model(model: &Anime4kCnn) -> Result<Self> {
        model.validate()?;
        let mut dict = Self::new();
        dict.insert(HEAD_WEIGHT, RawTensor::from_tensor4(&model.head_weight));
        dict.insert(HEAD_BIAS, RawTensor::from_bias(&model.head_bias));
        for (i, (weight, bias)) in model.mid_weights.iter().zip(&model.mid_biases).enumerate() {
            dict.insert(mid_weight_key(i), RawTensor::from_tensor4(weight));
            dict.insert(mid_bias_key(i), RawTensor::from_bias(bias));
        }
        dict.insert(TAIL_WEIGHT, RawTensor::from_tensor4(&model.tail_weight.permute_outputs(&PIXEL_SHUFFLE_PERM)?));
        dict.insert(TAIL_BIAS, RawTensor::from_bias(&permute_bias(&model.tail_bias, &PIXEL_SHUFFLE_PERM)?));
        Ok(dict)
    }
}

fn exact_ratio(value: usize, divisor: usize, what: &str, by: &str) -> Result<usize> {
    if divisor == 0 || value % divisor != 0 {
        return Err(Error::mismatch(format!("{what} ({value}) is not a multiple of {by} ({divisor})")));
    }
    Ok(value / divisor)
}

/// Decodes a safetensors buffer into a state dict
pub fn read_safetensors_state_dict(bytes: &[u8]) -> Result<StateDict> {
    let tensors = SafeTensors::deserialize(bytes)?;
    let mut dict = StateDict::new();
    for (name, view) in tensors.tensors() {
        let data = view_to_f32(&name, &view)?;
        dict.insert(
            name,
            RawTensor {
                shape: view.shape().to_vec(),
                data,
            },
        );
    }
    Ok(dict)
}

fn view_to_f32(name: &str, view: &TensorView<'_>) -> Result<Vec<f32>> {
    let bytes = view.data();
    let data = match view.dtype() {
        Dtype::F32 => bytemuck::pod_collect_to_vec::<u8, f32>(bytes),
        Dtype::F16 => bytemuck::pod_collect_to_vec::<u8, f16>(bytes).into_iter().map(f16::to_f32).collect(),
        Dtype::BF16 => bytemuck::pod_collect_to_vec::<u8, bf16>(bytes).into_iter().map(bf16::to_f32).collect(),
        Dtype::F64 => bytemuck::pod_collect_to_vec::<u8, f64>(bytes).into_iter().map(|v| v as f32).collect(),
        other => {
            return Err(Error::UnsupportedDtype {
                name: name.to_string(),
                dtype: format!("{other:?}"),
            });
        }
    };
    Ok(data)
}

/// Reads a model from a safetensors buffer
pub fn read_safetensors(bytes: &[u8]) -> Result<Anime4kCnn> {
    let dict = read_safetensors_state_dict(bytes)?.unwrap_wrapper();
    let model = dict.to_model()?;

    // Files written by this crate record the architecture; a disagreement means the file was edited
    if let Ok((_, metadata)) = SafeTensors::read_metadata(bytes) {
        let recorded = metadata.metadata().as_ref().and_then(|m| m.get("architecture")).and_then(|a| serde_json::from_str::<Architecture>(a).ok());
        if let Some(recorded) = recorded.filter(|a| *a != model.arch) {
            warn!("Recorded architecture ({recorded}) differs from the tensors ({})", model.arch);
        }
    }
    Ok(model)
}

/// Serializes a model as a safetensors buffer of F32 tensors
///
/// # Arguments
/// * `model` - Model to serialize, with the tail in shader channel order
///
/// # Returns
/// The file contents, with `format`, `variant` and `architecture` metadata
///
/// # Errors
/// Returns [`Error::NonFinite`] or a shape error if the model does not validate,
/// and [`Error::SafeTensors`] if serialization fails.
pub fn write_safetensors(model: &Anime4kCnn) -> Result<Vec<u8>> {
    let dict = StateDict::from_model(model)?;
    let mut views = BTreeMap::new();
    for (name, tensor) in &dict.tensors {
        views.insert(name.as_str(), TensorView::new(Dtype::F32, tensor.shape.clone(), bytemuck::cast_slice(&tensor.data))?);
    }

    let mut metadata = HashMap::new();
    metadata.insert("format".to_string(), "pt".to_string());
    metadata.insert("variant".to_string(), model.variant_label());
    metadata.insert("architecture".to_string(), serde_json::to_string(&model.arch)?);

    Ok(safetensors::serialize(views.iter().map(|(k, v)| (*k, v)), Some(metadata))?)
}

/// Decodes a JSON state-dict dump
///
/// The top level is an object of tensor names to nested numeric arrays. A
/// wrapper key holding an object is descended into; other nested objects are
/// flattened with `.`-joined names. Non-numeric entries are ignored.
pub fn read_state_dict_json_dict(text: &str) -> Result<StateDict> {
    let root: Value = serde_json::from_str(text)?;
    let Value::Object(mut object) = root else {
        return Err(Error::mismatch("JSON state dict must be an object"));
    };

    for wrapper in WRAPPER_KEYS {
        if let Some(Value::Object(inner)) = object.get(wrapper) {
            debug!("Unwrapping JSON state dict under '{wrapper}'");
            object = inner.clone();
            break;
        }
    }

    let mut dict = StateDict::new();
    collect_json_tensors("", &object, &mut dict)?;
    Ok(dict)
}

fn collect_json_tensors(prefix: &str, object: &serde_json::Map<String, Value>, dict: &mut StateDict) -> Result<()> {
    for (key, value) in object {
        let name = if prefix.is_empty() { key.clone() } else { format!("{prefix}.{key}") };
        match value {
            Value::Object(inner) => collect_json_tensors(&name, inner, dict)?,
            Value::Array(_) | Value::Number(_) => {
                let shape = json_shape(value);
                let mut data = Vec::with_capacity(shape.iter().product());
                json_values(&name, value, &shape, &mut data)?;
                dict.insert(name, RawTensor { shape, data });
            }
            _ => debug!("Skipping non-tensor entry '{name}'"),
        }
    }
    Ok(())
}

/// Shape implied by following the first element at every nesting level
fn json_shape(value: &Value) -> Vec<usize> {
    let mut shape = Vec::new();
    let mut current = value;
    while let Value::Array(items) = current {
        shape.push(items.len());
        match items.first() {
            Some(first) => current = first,
            None => break,
        }
    }
    shape
}

fn json_values(name: &str, value: &Value, shape: &[usize], out: &mut Vec<f32>) -> Result<()> {
    match (value, shape.split_first()) {
        (Value::Number(number), None) => {
            let number = number.as_f64().ok_or_else(|| Error::mismatch(format!("tensor '{name}' holds a non-float number")))?;
            out.push(number as f32);
            Ok(())
        }
        (Value::Array(items), Some((&len, rest))) if items.len() == len => items.iter().try_for_each(|item| json_values(name, item, rest, out)),
        _ => Err(Error::mismatch(format!("tensor '{name}' is ragged or holds non-numeric values"))),
    }
}

/// Reads a model from a JSON state-dict dump
pub fn read_state_dict_json(text: &str) -> Result<Anime4kCnn> {
    read_state_dict_json_dict(text)?.unwrap_wrapper().to_model()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(shape: &[usize], seed: f32) -> RawTensor {
        let len = shape.iter().product();
        RawTensor {
            shape: shape.to_vec(),
            data: (0..len).map(|i| seed + i as f32 * 0.001).collect(),
        }
    }

    fn sample_dict(prefix: &str, num_feat: usize, mids: usize, factor: usize, n_stack: usize) -> StateDict {
        let mut dict = StateDict::new();
        dict.insert(format!("{prefix}conv_head.weight"), raw(&[num_feat, 3, 3, 3], 0.1));
        dict.insert(format!("{prefix}conv_head.bias"), raw(&[num_feat], 0.2));
        for i in 0..mids {
            dict.insert(format!("{prefix}conv_mid.{i}.weight"), raw(&[num_feat, num_feat * factor, 3, 3], i as f32));
            dict.insert(format!("{prefix}conv_mid.{i}.bias"), raw(&[num_feat], -(i as f32)));
        }
        dict.insert(format!("{prefix}conv_tail.weight"), raw(&[12, num_feat * factor * n_stack, 1, 1], 0.3));
        dict.insert(format!("{prefix}conv_tail.bias"), raw(&[12], 0.4));
        dict
    }

    #[test]
    fn test_infers_architecture() {
        let model = sample_dict("", 8, 4, 2, 3).to_model().unwrap();
        assert_eq!(model.arch, Architecture::new(8, 5, 2, 3, 1).unwrap());
        assert_eq!(model.variant_label(), "M");
    }

    #[test]
    fn test_unwraps_prefixed_keys() {
        let mut dict = sample_dict("params_ema.", 4, 1, 1, 2);
        // A sibling container must be dropped rather than matched ambiguously
        dict.insert("params.conv_head.weight", raw(&[4, 3, 3, 3], 9.0));
        let dict = dict.unwrap_wrapper();
        assert!(dict.keys().all(|k| k.starts_with("conv_")));
        let model = dict.to_model().unwrap();
        assert_eq!(model.arch.factor, 1);
        assert_eq!(model.arch.n_stack, 2);
    }

    #[test]
    fn test_tail_is_permuted_into_shader_order() {
        let dict = sample_dict("", 4, 1, 2, 1);
        let model = dict.to_model().unwrap();
        let original = dict.get("conv_tail.bias").unwrap();
        assert_eq!(model.tail_bias[1], original.data[2]);
        assert_eq!(model.tail_bias[2], original.data[1]);
        assert_eq!(StateDict::from_model(&model).unwrap(), dict);
    }

    #[test]
    fn test_missing_and_ambiguous_tensors() {
        let mut dict = sample_dict("", 4, 1, 2, 1);
        dict.tensors.remove("conv_tail.bias");
        assert!(matches!(dict.to_model(), Err(Error::MissingTensor(fragment)) if fragment == "conv_tail.bias"));

        let mut dict = sample_dict("", 4, 1, 2, 1);
        dict.insert("generator.conv_head.bias", raw(&[4], 0.0));
        assert!(matches!(dict.to_model(), Err(Error::AmbiguousTensor { keys, .. }) if keys.len() == 2));
    }

    #[test]
    fn test_mid_index_fragments_do_not_collide() {
        let dict = sample_dict("", 4, 12, 2, 1);
        let model = dict.to_model().unwrap();
        assert_eq!(model.arch.block_depth, 13);
        assert_eq!(model.mid_biases[11][0], -11.0);
    }

    #[test]
    fn test_sparse_mid_indices_are_renumbered() {
        let mut dict = sample_dict("", 4, 0, 2, 3);
        for index in [5, 0, 2] {
            dict.insert(format!("conv_mid.{index}.weight"), raw(&[4, 8, 3, 3], index as f32));
            dict.insert(format!("conv_mid.{index}.bias"), raw(&[4], -(index as f32)));
        }
        let model = dict.to_model().unwrap();
        assert_eq!(model.arch, Architecture::new(4, 4, 2, 3, 1).unwrap());
        let firsts: Vec<f32> = model.mid_biases.iter().map(|bias| bias[0]).collect();
        assert_eq!(firsts, [0.0, -2.0, -5.0]);

        let rewritten = StateDict::from_model(&model).unwrap();
        assert!(rewritten.tensors.contains_key("conv_mid.2.weight"));
        assert!(!rewritten.tensors.contains_key("conv_mid.5.weight"));
        assert_eq!(rewritten.tensors["conv_mid.2.bias"].data[0], -5.0);
    }

    #[test]
    fn test_non_integer_ratio_is_rejected() {
        let mut dict = sample_dict("", 8, 1, 2, 1);
        dict.insert("conv_tail.weight", raw(&[12, 20, 1, 1], 0.0));
        assert!(matches!(dict.to_model(), Err(Error::StructuralMismatch(_))));
    }

    #[test]
    fn test_safetensors_round_trip_is_bit_exact() {
        let dict = sample_dict("", 8, 2, 2, 3);
        let model = dict.to_model().unwrap();
        let bytes = write_safetensors(&model).unwrap();
        let reread = read_safetensors_state_dict(&bytes).unwrap();
        assert_eq!(reread, dict);
        assert_eq!(read_safetensors(&bytes).unwrap(), model);
    }

    #[test]
    fn test_json_state_dict() {
        let json = r#"{
            "params": {
                "conv_head.weight": [[[[0.5,0.5,0.5],[0.5,0.5,0.5],[0.5,0.5,0.5]],[[0.5,0.5,0.5],[0.5,0.5,0.5],[0.5,0.5,0.5]],[[0.5,0.5,0.5],[0.5,0.5,0.5],[0.5,0.5,0.5]]]],
                "conv_head.bias": [0.25],
                "conv_tail.weight": [[[[1.0]],[[1.0]]]],
                "conv_tail.bias": [0.0]
            },
            "step": "not a tensor"
        }"#;
        let dict = read_state_dict_json_dict(json).unwrap();
        assert_eq!(dict.get("conv_head.weight").unwrap().shape, vec![1, 3, 3, 3]);
        assert_eq!(dict.get("conv_tail.weight").unwrap().shape, vec![1, 2, 1, 1]);
        assert_eq!(dict.get("conv_head.bias").unwrap().data, vec![0.25]);
        // A single output channel is not a valid Anime4K head
        assert!(read_state_dict_json(json).is_err());
    }

    #[test]
    fn test_json_rejects_ragged_arrays() {
        let json = r#"{"conv_head.bias": [[1.0, 2.0], [3.0]]}"#;
        assert!(matches!(read_state_dict_json_dict(json), Err(Error::StructuralMismatch(_))));
        let json = r#"{"conv_head.bias": [[1.0], [[3.0]]]}"#;
        assert!(read_state_dict_json_dict(json).is_err());
    }
}
