//! Vulkan compute shader (`.comp`)
//!
//! A single shader holds every pass as an `if (PASS == k) { ... }` block
//! selected by a specialization constant. Pass `0` is the head, passes
//! `1..block_depth` the mid layers, pass `block_depth` the aggregation and the
//! final pass the depth-to-space step.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::{Activation, ConvRole, ShaderDialect};
use crate::error::{Error, Result};
use crate::ir::{Anime4kCnn, Architecture, LayerFill, ModelFill, TAIL_OUT_CHANNELS, Tensor4};
use crate::utils::{SPATIAL_OFFSETS_3X3, bias_block, join_floats, kernel_offsets, kernel_position, parse_float_list, unpack_block};

static RE_PASS_BEGIN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*if\s*\(\s*PASS\s*==\s*(\d+)\s*\)\s*\{\s*$").unwrap());
static RE_DECLARE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^vec4\s+result(\d+)\s*=\s*vec4\s*\(\s*0\.0\s*\)\s*;$").unwrap());
static RE_ACCUMULATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^result(?<result>\d+)\s*(?<op>\+?=)\s*mat4\s*\((?<weights>[^)]+)\)\s*\*\s*(?<sample>.+?)\s*;$").unwrap());
static RE_BIAS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^result(\d+)\s*\+=\s*vec4\s*\(([^)]+)\)\s*;$").unwrap());
static RE_STORE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^imageStore\s*\(\s*dst\d*\s*,\s*icoord\s*,\s*result\d+\s*\)\s*;$").unwrap());
static RE_RETURN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^return\s*;$").unwrap());
static RE_ACTIVATED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^max\s*\((?<inner>.+),\s*0\.0\s*\)$").unwrap());
static RE_SAMPLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?<sign>-?)\s*(?<func>sampleTexCurrent|sampleTex)\s*\(\s*(?<sampler>\d+)\s*,\s*icoord\s*(?:,\s*ivec2\s*\(\s*(?<dx>-?\d+)\s*,\s*(?<dy>-?\d+)\s*\)\s*)?\)$",
    )
    .unwrap()
});
static RE_SPATIAL_SAMPLE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"sampleTex\s*\(").unwrap());
static RE_SAMPLER_INDEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"sampleTex(?:Current)?\s*\(\s*(\d+)\s*,").unwrap());

/// CReLU negative half in mid and aggregation passes
static RE_NEGATED_SAMPLE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"max\s*\(\s*-\s*sampleTex").unwrap());

/// The compute shader dialect
pub struct CompShader;

/// Body of one `if (PASS == index)` block, without its braces
#[derive(Debug, Clone, PartialEq)]
pub struct CompPass {
    /// Value compared against `PASS`
    pub index: usize,
    /// Lines between the opening and the closing brace
    pub lines: Vec<String>,
}

impl CompPass {
    fn label(&self) -> String {
        format!("PASS {}", self.index)
    }
}

/// A texel fetch feeding a `mat4` product
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Sample {
    sampler: usize,
    /// `None` for `sampleTexCurrent`
    offset: Option<(i32, i32)>,
    activation: Activation,
}

impl Sample {
    fn parse(text: &str) -> Option<Self> {
        let (inner, activated) = match RE_ACTIVATED.captures(text) {
            Some(caps) => (caps.name("inner").map_or("", |m| m.as_str()).trim(), true),
            None => (text, false),
        };
        let caps = RE_SAMPLE.captures(inner)?;
        let negative = !caps["sign"].is_empty();
        let activation = match (activated, negative) {
            (false, false) => Activation::Identity,
            (false, true) => return None,
            (true, false) => Activation::Positive,
            (true, true) => Activation::Negative,
        };
        let offset = match (caps.name("dx"), caps.name("dy")) {
            (Some(dx), Some(dy)) => Some((dx.as_str().parse().ok()?, dy.as_str().parse().ok()?)),
            _ => None,
        };
        // sampleTexCurrent never takes an offset and sampleTex always does
        if (&caps["func"] == "sampleTexCurrent") != offset.is_none() {
            return None;
        }
        Some(Self {
            sampler: caps["sampler"].parse().ok()?,
            offset,
            activation,
        })
    }

    fn render(&self) -> String {
        let fetch = match self.offset {
            Some((dx, dy)) => format!("sampleTex({}, icoord, ivec2({dx}, {dy}))", self.sampler),
            None => format!("sampleTexCurrent({}, icoord)", self.sampler),
        };
        match self.activation {
            Activation::Identity => fetch,
            Activation::Positive => format!("max({fetch}, 0.0)"),
            Activation::Negative => format!("max(-{fetch}, 0.0)"),
        }
    }
}

/// Recognized statements of a conv pass body
#[derive(Debug, Clone, PartialEq)]
enum Statement {
    Declare(usize),
    Accumulate { result: usize, weights: Vec<f32>, sample: Sample },
    Bias { result: usize, values: Vec<f32> },
    Store,
    Return,
}

fn parse_statement(pass: &CompPass, line: &str) -> Result<Option<Statement>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with("//") {
        return Ok(None);
    }
    let statement = if let Some(caps) = RE_DECLARE.captures(line) {
        Statement::Declare(parse_index(pass, line, &caps[1])?)
    } else if let Some(caps) = RE_ACCUMULATE.captures(line) {
        let sample = Sample::parse(&caps["sample"]).ok_or_else(|| Error::unexpected_line(&pass.label(), line))?;
        Statement::Accumulate {
            result: parse_index(pass, line, &caps["result"])?,
            weights: parse_float_list(&caps["weights"], 16)?,
            sample,
        }
    } else if let Some(caps) = RE_BIAS.captures(line) {
        Statement::Bias {
            result: parse_index(pass, line, &caps[1])?,
            values: parse_float_list(&caps[2], 4)?,
        }
    } else if RE_STORE.is_match(line) {
        Statement::Store
    } else if RE_RETURN.is_match(line) {
        Statement::Return
    } else {
        return Err(Error::unexpected_line(&pass.label(), line));
    };
    Ok(Some(statement))
}

fn parse_index(pass: &CompPass, line: &str, digits: &str) -> Result<usize> {
    digits.parse().map_err(|_| Error::unexpected_line(&pass.label(), line))
}

/// Input channel and kernel position addressed by a sample, `None` when the sample is invalid for the role
fn sample_target(role: ConvRole, sample: &Sample, arch: &Architecture) -> Option<(usize, usize, usize)> {
    let tpl = arch.textures_per_layer();
    let negative = sample.activation.is_negative();
    if negative && arch.factor == 1 {
        return None;
    }
    let (in_start, kernel) = match role {
        ConvRole::Head => {
            if sample.activation != Activation::Identity || sample.sampler != 0 {
                return None;
            }
            (0, 3)
        }
        ConvRole::Mid => {
            if sample.activation == Activation::Identity || sample.sampler >= tpl {
                return None;
            }
            (arch.mid_in_start(sample.sampler, negative), 3)
        }
        ConvRole::Aggregation => {
            if sample.activation == Activation::Identity || sample.sampler >= tpl * arch.n_stack {
                return None;
            }
            (arch.tail_in_start(sample.sampler / tpl, sample.sampler % tpl, negative), arch.tail_kernel)
        }
    };
    let (ky, kx) = match (sample.offset, kernel) {
        (None, 1) => (0, 0),
        (Some((dx, dy)), 3) => kernel_position(dx, dy, 3)?,
        _ => return None,
    };
    Some((in_start, ky, kx))
}

fn fill_conv_pass(pass: &CompPass, role: ConvRole, arch: &Architecture, fill: &mut LayerFill) -> Result<()> {
    let groups = fill.out_channels() / 4;
    for line in &pass.lines {
        let Some(statement) = parse_statement(pass, line)? else {
            continue;
        };
        match statement {
            Statement::Declare(result) if result < groups => {}
            Statement::Accumulate { result, weights, sample } if result < groups => {
                let (in_start, ky, kx) = sample_target(role, &sample, arch).ok_or_else(|| Error::unexpected_line(&pass.label(), line))?;
                fill.pack(&weights, result * 4, in_start, ky, kx);
            }
            Statement::Bias { result, values } if result < groups => fill.set_bias(result * 4, &values),
            Statement::Store | Statement::Return => {}
            _ => return Err(Error::mismatch(format!("{} addresses more than {groups} output groups: {}", pass.label(), line.trim()))),
        }
    }
    Ok(())
}

impl ShaderDialect for CompShader {
    type Pass = CompPass;

    const NAME: &'static str = "compute shader";

    fn split_passes(source: &str) -> Result<Vec<CompPass>> {
        let mut passes = Vec::new();
        let mut lines = source.lines();

        while let Some(line) = lines.next() {
            let Some(caps) = RE_PASS_BEGIN.captures(line) else {
                continue;
            };
            let index = caps[1].parse().map_err(|_| Error::unexpected_line("PASS header", line))?;
            let mut body = Vec::new();
            let mut depth = 1i64;
            for line in lines.by_ref() {
                depth += line.matches('{').count() as i64 - line.matches('}').count() as i64;
                if depth <= 0 {
                    break;
                }
                body.push(line.to_string());
            }
            if depth > 0 {
                return Err(Error::mismatch(format!("PASS {index} block is not closed")));
            }
            passes.push(CompPass { index, lines: body });
        }

        if passes.is_empty() {
            return Err(Error::MissingDirective("if (PASS == 0) block".to_string()));
        }
        if let Some((position, pass)) = passes.iter().enumerate().find(|(position, pass)| pass.index != *position) {
            return Err(Error::mismatch(format!("PASS blocks must be numbered contiguously from 0, found PASS {} at position {position}", pass.index)));
        }
        if passes.len() < 3 {
            return Err(Error::MissingDirective(format!("at least 3 PASS blocks, found {}", passes.len())));
        }
        Ok(passes)
    }

    fn sniff_architecture(passes: &[CompPass]) -> Result<Architecture> {
        let [head, mids @ .., aggregation, _] = passes else {
            return Err(Error::MissingDirective(format!("at least 3 PASS blocks, found {}", passes.len())));
        };

        let outputs = head.lines.iter().filter(|line| RE_DECLARE.is_match(line.trim())).count();
        if outputs == 0 {
            return Err(Error::MissingDirective("vec4 result0 declaration in PASS 0".to_string()));
        }
        let num_feat = outputs * 4;
        let block_depth = passes.len() - 2;

        let negated = mids.iter().chain([aggregation]).flat_map(|pass| &pass.lines).any(|line| RE_NEGATED_SAMPLE.is_match(line));
        let factor = if negated { 2 } else { 1 };

        let tail_kernel = if aggregation.lines.iter().any(|line| RE_SPATIAL_SAMPLE.is_match(line)) { 3 } else { 1 };

        let samplers: BTreeSet<usize> = aggregation
            .lines
            .iter()
            .flat_map(|line| RE_SAMPLER_INDEX.captures_iter(line).filter_map(|caps| caps[1].parse().ok()))
            .collect();
        let tpl = num_feat / 4;
        if samplers.is_empty() || samplers.len() % tpl != 0 {
            return Err(Error::mismatch(format!(
                "aggregation pass reads {} samplers, not a positive multiple of {tpl} textures per layer",
                samplers.len()
            )));
        }
        let n_stack = samplers.len() / tpl;

        debug!("PASS 0 declares {outputs} results, aggregation reads {} samplers", samplers.len());
        Architecture::new(num_feat, block_depth, factor, n_stack, tail_kernel)
    }

    fn extract_weights(passes: &[CompPass], arch: Architecture) -> Result<Anime4kCnn> {
        let mut fill = ModelFill::new(arch);
        let aggregation = &passes[arch.block_depth];

        fill_conv_pass(&passes[0], ConvRole::Head, &arch, &mut fill.head)?;
        for (pass, layer) in passes[1..arch.block_depth].iter().zip(fill.mids.iter_mut()) {
            fill_conv_pass(pass, ConvRole::Mid, &arch, layer)?;
        }
        fill_conv_pass(aggregation, ConvRole::Aggregation, &arch, &mut fill.tail)?;

        fill.finish()
    }
}

/// A texel fetch together with the block of weights it is multiplied with
struct Term {
    sample: Sample,
    in_start: usize,
    ky: usize,
    kx: usize,
}

fn storage_image_name(index: usize) -> String {
    if index == 0 { "dst".to_string() } else { format!("dst{index}") }
}

fn push_conv_pass(code: &mut String, index: usize, title: &str, weight: &Tensor4, bias: &[f32], terms: &[Term]) {
    let groups = weight.shape()[0] / 4;
    code.push_str(&format!("    // ============ PASS {index}: {title} ============\n"));
    code.push_str(&format!("    if (PASS == {index}) {{\n"));
    for t in 0..groups {
        code.push_str(&format!("        vec4 result{t} = vec4(0.0);\n"));
    }
    code.push('\n');

    for t in 0..groups {
        for (i, term) in terms.iter().enumerate() {
            let op = if i == 0 { "=" } else { "+=" };
            let values = unpack_block(weight, t * 4, term.in_start, term.ky, term.kx, 4);
            code.push_str(&format!("        result{t} {op} mat4({}) * {};\n", join_floats(&values), term.sample.render()));
        }
        code.push_str(&format!("        result{t} += vec4({});\n", join_floats(&bias_block(bias, t * 4))));
        code.push('\n');
    }

    for t in 0..groups {
        code.push_str(&format!("        imageStore({}, icoord, result{t});\n", storage_image_name(t)));
    }
    code.push_str("        return;\n");
    code.push_str("    }\n");
    code.push('\n');
}

fn head_terms() -> Vec<Term> {
    SPATIAL_OFFSETS_3X3
        .iter()
        .map(|&(dx, dy)| Term {
            sample: Sample {
                sampler: 0,
                offset: Some((dx, dy)),
                activation: Activation::Identity,
            },
            in_start: 0,
            ky: (dx + 1) as usize,
            kx: (dy + 1) as usize,
        })
        .collect()
}

/// Terms over `inputs` of `(sampler, in_start)` pairs, one per kernel offset
fn activated_terms(inputs: impl IntoIterator<Item = (usize, usize)>, activation: Activation, kernel: usize) -> Vec<Term> {
    let mut terms = Vec::new();
    for (sampler, in_start) in inputs {
        for &(dx, dy) in kernel_offsets(kernel) {
            let (ky, kx) = kernel_position(dx, dy, kernel).unwrap_or((0, 0));
            terms.push(Term {
                sample: Sample {
                    sampler,
                    offset: (kernel > 1).then_some((dx, dy)),
                    activation,
                },
                in_start,
                ky,
                kx,
            });
        }
    }
    terms
}

fn header(descriptor_include: &str, dts_pass: usize) -> String {
    format!(
        r#"#version 450

#extension GL_GOOGLE_include_directive : require
#extension GL_EXT_scalar_block_layout : require

#include "{descriptor_include}"

layout(constant_id = 8) const int PASS = 0;

layout(local_size_x = 8, local_size_y = 8, local_size_z = 1) in;

layout(binding = 0, scalar)
uniform layers_t {{
    uvec2 u_inputSize;
    uvec2 u_outputSize;
}};

vec4 sampleTex(int samplerIdx, ivec2 coord, ivec2 offset) {{
    ivec2 sampleCoord = coord + offset;
    sampleCoord = clamp(sampleCoord, ivec2(0), ivec2(u_inputSize) - ivec2(1));
    return texelFetch(s_samplers[samplerIdx], sampleCoord, 0);
}}

vec4 sampleTexCurrent(int samplerIdx, ivec2 coord) {{
    return texelFetch(s_samplers[samplerIdx], coord, 0);
}}

void main() {{
    uvec2 coord = uvec2(gl_GlobalInvocationID.xy);
    ivec2 icoord = ivec2(coord);

    if (PASS < {dts_pass}) {{
        if (coord.x >= u_inputSize.x || coord.y >= u_inputSize.y)
            return;
    }}

"#
    )
}

fn depth_to_space_pass(index: usize) -> String {
    format!(
        r#"    // ============ PASS {index}: Depth-to-Space ============
    if (PASS == {index}) {{
        if (coord.x >= u_outputSize.x || coord.y >= u_outputSize.y)
            return;

        ivec2 subPixel = ivec2(coord) % 2;
        ivec2 inputCoord = ivec2(coord) / 2;
        int channelIdx = subPixel.y * 2 + subPixel.x;

        float c0 = texelFetch(s_samplers[0], inputCoord, 0)[channelIdx];
        float c1 = texelFetch(s_samplers[1], inputCoord, 0)[channelIdx];
        float c2 = texelFetch(s_samplers[2], inputCoord, 0)[channelIdx];

        vec2 originalUV = (vec2(coord) + 0.5) / vec2(u_outputSize);
        vec4 original = texture(s_samplers[3], originalUV);

        vec4 result = vec4(c0 + original.r, c1 + original.g, c2 + original.b, 1.0);
        result = clamp(result, 0.0, 1.0);

        imageStore(dst, ivec2(coord), result);
        return;
    }}

"#
    )
}

/// Renders a model as a Vulkan compute shader
///
/// # Arguments
/// * `model` - Model to render
/// * `descriptor_include` - Path written into the `#include` of the descriptor-set header
///
/// # Returns
/// One `if (PASS == k)` block per layer, followed by the depth-to-space pass
///
/// # Errors
/// Returns [`Error::NonFinite`] or a shape error if the model does not validate.
pub fn write_comp(model: &Anime4kCnn, descriptor_include: &str) -> Result<String> {
    model.validate()?;
    let arch = model.arch;
    let tpl = arch.textures_per_layer();
    let dts_pass = arch.block_depth + 1;

    let mut code = header(descriptor_include, dts_pass);

    push_conv_pass(
        &mut code,
        0,
        &format!("Merged Conv-4x3x3x3 (RGB -> {tpl} feature textures)"),
        &model.head_weight,
        &model.head_bias,
        &head_terms(),
    );

    for (i, (weight, bias)) in model.mid_weights.iter().zip(&model.mid_biases).enumerate() {
        let index = i + 1;
        let terms: Vec<Term> = Activation::for_factor(arch.factor)
            .iter()
            .flat_map(|&activation| {
                let inputs = (0..tpl).map(|s| (s, arch.mid_in_start(s, activation.is_negative())));
                activated_terms(inputs, activation, 3)
            })
            .collect();
        push_conv_pass(&mut code, index, &format!("Merged Conv-4x3x3x{} (layer {index})", arch.mid_in_channels()), weight, bias, &terms);
    }

    let samplers = tpl * arch.n_stack;
    let terms: Vec<Term> = Activation::for_factor(arch.factor)
        .iter()
        .flat_map(|&activation| {
            let inputs = (0..samplers).map(|s| (s, arch.tail_in_start(s / tpl, s % tpl, activation.is_negative())));
            activated_terms(inputs, activation, arch.tail_kernel)
        })
        .collect();
    let k = arch.tail_kernel;
    push_conv_pass(
        &mut code,
        arch.block_depth,
        &format!("Merged Conv-4x{k}x{k}x{} ({samplers} inputs -> {} outputs)", arch.tail_in_channels(), TAIL_OUT_CHANNELS / 4),
        &model.tail_weight,
        &model.tail_bias,
        &terms,
    );

    code.push_str(&depth_to_space_pass(dts_pass));
    code.push_str("}\n");
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{arch, sample_model};

    #[test]
    fn test_sample_parsing() {
        let sample = Sample::parse("max(-sampleTex(3, icoord, ivec2(-1, 0)), 0.0)").unwrap();
        assert_eq!(sample.sampler, 3);
        assert_eq!(sample.offset, Some((-1, 0)));
        assert_eq!(sample.activation, Activation::Negative);

        let sample = Sample::parse("max(sampleTexCurrent(5, icoord), 0.0)").unwrap();
        assert_eq!(sample.offset, None);
        assert_eq!(sample.activation, Activation::Positive);

        let sample = Sample::parse("sampleTex(0, icoord, ivec2(1, 1))").unwrap();
        assert_eq!(sample.activation, Activation::Identity);

        assert_eq!(Sample::parse("-sampleTex(0, icoord, ivec2(1, 1))"), None);
        assert_eq!(Sample::parse("sampleTexCurrent(0, icoord, ivec2(1, 1))"), None);
        assert_eq!(Sample::parse("max(sampleTex(0, icoord), 0.0)"), None);
    }

    #[test]
    fn test_written_shader_layout() {
        let model = sample_model(arch(8, 3, 2, 2, 1));
        let code = write_comp(&model, "inc/descriptor_set.h").unwrap();
        assert!(code.starts_with("#version 450\n"));
        assert!(code.contains("#include \"inc/descriptor_set.h\""));
        assert!(code.contains("if (PASS < 4) {"));
        for index in 0..5 {
            assert!(code.contains(&format!("    if (PASS == {index}) {{\n")), "PASS {index}");
        }
        assert!(code.contains("imageStore(dst1, icoord, result1);"));
        assert!(code.contains("max(-sampleTexCurrent(3, icoord), 0.0);"));
        assert!(code.ends_with("    }\n\n}\n"));
    }

    #[test]
    fn test_round_trip() {
        for arch in [arch(8, 5, 2, 3, 1), arch(4, 2, 1, 2, 3), arch(16, 1, 2, 1, 1), arch(12, 3, 1, 1, 1)] {
            let model = sample_model(arch);
            let code = write_comp(&model, "../../descriptor_set.h").unwrap();
            let parsed = CompShader::parse(&code).unwrap();
            assert_eq!(parsed.arch, arch);
            assert_eq!(parsed, model);
        }
    }

    #[test]
    fn test_compact_spacing_is_accepted() {
        let model = sample_model(arch(8, 2, 2, 2, 3));
        let code = write_comp(&model, "../../descriptor_set.h").unwrap();
        let compact: String = code
            .lines()
            .map(|line| {
                let body = line.trim_start();
                if body.starts_with("result") || body.starts_with("vec4 result") || body.starts_with("imageStore") {
                    body.replace(", ", ",").replace(" += ", "+=").replace(" = ", "=").replace(") * ", ")*").replace("max(-", "max( -").replace("sampleTex(", "sampleTex (")
                } else {
                    line.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        assert!(compact.contains("*max( -sampleTex (1,icoord,ivec2("));

        let parsed = CompShader::parse(&compact).unwrap();
        assert_eq!(parsed.arch, model.arch);
        assert_eq!(parsed, model);
    }

    #[test]
    fn test_split_requires_contiguous_blocks() {
        let source = "if (PASS == 0) {\n}\nif (PASS == 2) {\n}\nif (PASS == 3) {\n}\n";
        assert!(matches!(CompShader::split_passes(source), Err(Error::StructuralMismatch(_))));
        let source = "if (PASS == 0) {\n}\nif (PASS == 1) {\n}\n";
        assert!(matches!(CompShader::split_passes(source), Err(Error::MissingDirective(_))));
        assert!(matches!(CompShader::split_passes("void main() {}"), Err(Error::MissingDirective(_))));
        assert!(CompShader::split_passes("if (PASS == 0) {\n    vec4 result0 = vec4(0.0);\n").is_err());
    }

    #[test]
    fn test_missing_literal_is_reported() {
        let model = sample_model(arch(4, 2, 2, 1, 1));
        let code = write_comp(&model, "d.h").unwrap();
        let target = "        result0 += mat4(";
        let position = code.find(target).unwrap();
        let end = position + code[position..].find('\n').unwrap() + 1;
        let truncated = format!("{}{}", &code[..position], &code[end..]);
        assert!(matches!(CompShader::parse(&truncated), Err(Error::MissingWeights { missing: 12, .. })));
    }

    #[test]
    fn test_unexpected_line_is_reported() {
        let model = sample_model(arch(4, 2, 2, 1, 1));
        let store = "        imageStore(dst, icoord, result0);\n";
        let code = write_comp(&model, "d.h").unwrap().replacen(store, &format!("{store}        result0 *= 2.0;\n"), 1);
        match CompShader::parse(&code) {
            Err(Error::UnexpectedLine { pass, line }) => {
                assert_eq!(pass, "PASS 0");
                assert_eq!(line, "result0 *= 2.0;");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
