//! mpv GLSL shader hooks (`.glsl`)
//!
//! A `//!SAVE` texture holds four channels, so a conv layer with `N` output
//! channels is written as `N / 4` consecutive hooks that share their DESC and
//! binds. Consecutive hooks are grouped back into logical layers when parsing.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::{Activation, ConvRole, ShaderDialect};
use crate::error::{Error, Result};
use crate::ir::{Anime4kCnn, Architecture, INPUT_CHANNELS, LayerFill, ModelFill, TAIL_OUT_CHANNELS, Tensor4};
use crate::utils::{bias_block, conv_texture_name, join_floats, kernel_offsets, kernel_position, last_texture_name, parse_float_list, unpack_block};

/// Channels stored by one `//!SAVE` texture
const COMPONENTS_PER_SAVE: usize = 4;

/// Activation condition shared by every hook: only run when upscaling by more than 1.2x
const WHEN_CONDITION: &str = "OUTPUT.w MAIN.w 1.200 * > OUTPUT.h MAIN.h 1.200 * > *";

// GO macro: #define go_0(x_off, y_off) (max(-(conv2d_tf_texOff(vec2(x_off, y_off))), 0.0))
static RE_GO_MACRO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^#define\s+(?<name>\w+)\s*\(\s*x_off\s*,\s*y_off\s*\)\s*\(\s*(?<open>max\s*\(\s*(?<sign>-?)\s*\()?\s*(?<texture>\w+)_texOff\s*\(\s*vec2\s*\(\s*x_off\s*,\s*y_off\s*\)\s*\)\s*(?<close>\)\s*,\s*0\.0\s*\))?\s*\)$",
    )
    .unwrap()
});
// G macro: #define g_0 (max((conv2d_tf_tex(conv2d_tf_pos)), 0.0))
static RE_G_MACRO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#define\s+(?<name>\w+)\s+\(\s*max\s*\(\s*(?<sign>-?)\s*\(\s*(?<texture>\w+)_tex\s*\(\s*\w+\s*\)\s*\)\s*,\s*0\.0\s*\)\s*\)$").unwrap()
});
static RE_ENTRYPOINT_BEGIN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^vec4\s+hook\s*\(\s*\)\s*\{$").unwrap());
static RE_ENTRYPOINT_END: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\}$").unwrap());
static RE_RESULT_ADD_PROD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?<decl>vec4\s+)?result\s*\+?=\s*mat4\s*\((?<weights>[^)]+)\)\s*\*\s*(?<func>\w+)(?:\s*\(\s*(?<x_offset>1|0|-1)\.0\s*,\s*(?<y_offset>1|0|-1)\.0\s*\))?\s*;$",
    )
    .unwrap()
});
static RE_RESULT_ADD_VEC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^result\s*\+=\s*vec4\s*\((?<weights>[^)]+)\)\s*;$").unwrap());
static RE_RETURN_AS_IS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^return\s+result\s*;$").unwrap());
static RE_SCALE_FACTOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^//!(?:WIDTH|HEIGHT)\s+(\w+)\.[wh](?:\s+(\d+)\s+\*)?\s*$").unwrap());
static RE_CONV_DESC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-Conv-4x(\d+)x(\d+)x(\d+)$").unwrap());

/// Type of stage a hook implements, from its DESC suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvolutionStageType {
    /// Convolution over the bound textures
    Conv,
    /// Final rearrangement of the aggregation output into a 2x image
    DepthToSpace,
}

/// One parsed mpv hook
#[derive(Debug, Clone, PartialEq)]
pub struct MpvHook {
    /// Description from the DESC directive
    pub name: String,
    /// Scale factor relative to the source image, from WIDTH and HEIGHT
    pub scale_factor: u32,
    /// Texture names from BIND directives, in order
    pub inputs: Vec<String>,
    /// Texture name from the SAVE directive
    pub output: String,
    /// Stage type
    pub r#type: ConvolutionStageType,
    /// Shader code without the comment directives
    pub code: String,
}

impl MpvHook {
    /// Splits a shader into hook sections, each starting at a DESC directive
    ///
    /// Anything before the first DESC (license text, comments) is dropped.
    pub fn parse_mpv_hooks(source: &str) -> Vec<String> {
        let mut hooks = Vec::new();
        let mut current_hook = String::new();

        for line in source.lines() {
            if line.starts_with("//!DESC ") {
                if !current_hook.is_empty() {
                    hooks.push(current_hook);
                }
                current_hook = format!("{line}\n");
                continue;
            }

            if !current_hook.is_empty() {
                current_hook.push_str(&format!("{line}\n"));
            }
        }

        if !current_hook.is_empty() {
            hooks.push(current_hook);
        }

        hooks
    }

    /// Scale factors of the textures every shader starts with
    pub fn new_scale_factor_map() -> HashMap<String, u32> {
        let mut scale_factor_map = HashMap::new();
        scale_factor_map.insert("MAIN".to_string(), 1);
        scale_factor_map.insert("HOOKED".to_string(), 1);
        scale_factor_map
    }

    /// Parses one hook section
    ///
    /// The WIDTH and HEIGHT directives are resolved through `scale_factor_map`,
    /// which is updated with the saved texture.
    ///
    /// # Errors
    /// Returns an error if a required directive is missing, a directive is
    /// malformed, or the hook targets anything but `MAIN` with 4 components.
    pub fn new(source: &str, scale_factor_map: &mut HashMap<String, u32>) -> Result<Self> {
        let mut name = String::new();
        let mut scale_factor = 0;
        let mut inputs = Vec::new();
        let mut output = String::new();
        let mut code = String::new();

        for line in source.lines() {
            if let Some(content) = line.strip_prefix("//!DESC ").map(str::trim) {
                name = content.to_string();
            } else if line.starts_with("//!WIDTH ") || line.starts_with("//!HEIGHT ") {
                let current_match = RE_SCALE_FACTOR.captures(line).ok_or_else(|| Error::unexpected_line(&name, line))?;
                let base_texture_name = &current_match[1];
                let ratio = match current_match.get(2) {
                    Some(m) => m.as_str().parse::<u32>().map_err(|_| Error::unexpected_line(&name, line))?,
                    None => 1,
                };
                let base_texture_scale_factor = scale_factor_map
                    .get(base_texture_name)
                    .ok_or_else(|| Error::mismatch(format!("{name}: unknown base texture '{base_texture_name}'")))?;
                let current_scale_factor = base_texture_scale_factor * ratio;
                if scale_factor == 0 {
                    scale_factor = current_scale_factor;
                } else if scale_factor != current_scale_factor {
                    return Err(Error::mismatch(format!("{name}: WIDTH and HEIGHT scale factors differ")));
                }
            } else if let Some(content) = line.strip_prefix("//!BIND ").map(str::trim) {
                inputs.push(content.to_string());
            } else if let Some(content) = line.strip_prefix("//!SAVE ").map(str::trim) {
                output = content.to_string();
            } else if let Some(content) = line.strip_prefix("//!HOOK ").map(str::trim) {
                if content != "MAIN" {
                    return Err(Error::unexpected_line(&name, line));
                }
            } else if let Some(content) = line.strip_prefix("//!COMPONENTS ").map(str::trim) {
                if content != COMPONENTS_PER_SAVE.to_string() {
                    return Err(Error::unexpected_line(&name, line));
                }
            } else if line.starts_with("//!WHEN ") {
                // ignore
            } else if line.starts_with("//!") {
                return Err(Error::unexpected_line(&name, line));
            } else {
                code.push_str(&format!("{line}\n"));
            }
        }

        if name.is_empty() {
            return Err(Error::MissingDirective("//!DESC".to_string()));
        }

        let r#type = if name.contains("-Conv-") {
            ConvolutionStageType::Conv
        } else if name.ends_with("-Depth-to-Space") {
            ConvolutionStageType::DepthToSpace
        } else {
            return Err(Error::mismatch(format!("unknown hook type: {name}")));
        };

        if inputs.is_empty() {
            return Err(Error::MissingDirective(format!("//!BIND in '{name}'")));
        }
        if output.is_empty() {
            return Err(Error::MissingDirective(format!("//!SAVE in '{name}'")));
        }
        if scale_factor == 0 {
            return Err(Error::MissingDirective(format!("//!WIDTH in '{name}'")));
        }
        if let Some(input) = inputs.iter().find(|input| !scale_factor_map.contains_key(input.as_str())) {
            return Err(Error::mismatch(format!("{name}: unknown input texture '{input}'")));
        }

        scale_factor_map.insert(output.clone(), scale_factor);

        Ok(Self {
            name,
            scale_factor,
            inputs,
            output,
            r#type,
            code,
        })
    }

    /// Bound textures other than `MAIN`, in bind order
    fn feature_inputs(&self) -> Vec<&str> {
        self.inputs.iter().map(String::as_str).filter(|input| *input != "MAIN").collect()
    }
}

/// Consecutive hooks sharing DESC and binds: one logical layer
#[derive(Debug, Clone, PartialEq)]
pub struct MpvPassGroup {
    /// Hooks in order; hook `i` computes output channels `4i..4i + 4`
    pub hooks: Vec<MpvHook>,
}

impl MpvPassGroup {
    fn leader(&self) -> &MpvHook {
        &self.hooks[0]
    }

    /// Input channels named by a `-Conv-4xKxKxC` DESC, with the kernel size
    fn conv_desc(&self) -> Result<(usize, usize)> {
        let name = &self.leader().name;
        let caps = RE_CONV_DESC.captures(name).ok_or_else(|| Error::mismatch(format!("'{name}' does not name a Conv-4xKxKxC layer")))?;
        let (ky, kx, channels) = (caps[1].parse::<usize>(), caps[2].parse::<usize>(), caps[3].parse::<usize>());
        match (ky, kx, channels) {
            (Ok(ky), Ok(kx), Ok(channels)) if ky == kx => Ok((ky, channels)),
            _ => Err(Error::mismatch(format!("'{name}' has a non-square kernel"))),
        }
    }
}

/// A macro sampling a bound texture
#[derive(Debug, Clone, PartialEq, Eq)]
struct Macro {
    texture: String,
    activation: Activation,
    /// `go_N(x, y)` style, as opposed to `g_N`
    takes_offset: bool,
}

fn parse_macro(line: &str) -> Option<(String, Macro)> {
    if let Some(caps) = RE_GO_MACRO.captures(line) {
        let activation = match (caps.name("open"), caps.name("close")) {
            (None, None) => Activation::Identity,
            (Some(_), Some(_)) if &caps["sign"] == "-" => Activation::Negative,
            (Some(_), Some(_)) => Activation::Positive,
            _ => return None,
        };
        let m = Macro {
            texture: caps["texture"].to_string(),
            activation,
            takes_offset: true,
        };
        return Some((caps["name"].to_string(), m));
    }
    let caps = RE_G_MACRO.captures(line)?;
    let activation = if &caps["sign"] == "-" { Activation::Negative } else { Activation::Positive };
    let m = Macro {
        texture: caps["texture"].to_string(),
        activation,
        takes_offset: false,
    };
    Some((caps["name"].to_string(), m))
}

fn hook_macros(hook: &MpvHook) -> HashMap<String, Macro> {
    hook.code.lines().filter_map(|line| parse_macro(line.trim())).collect()
}

/// Input channel and kernel position addressed by a macro call, `None` when invalid for the role
fn macro_target(role: ConvRole, hook: &MpvHook, m: &Macro, offset: Option<(i32, i32)>, arch: &Architecture) -> Option<(usize, usize, usize)> {
    let tpl = arch.textures_per_layer();
    let negative = m.activation.is_negative();
    if negative && arch.factor == 1 {
        return None;
    }
    let (in_start, kernel) = match role {
        ConvRole::Head => {
            if m.activation != Activation::Identity || m.texture != "MAIN" {
                return None;
            }
            (0, 3)
        }
        ConvRole::Mid | ConvRole::Aggregation => {
            if m.activation == Activation::Identity {
                return None;
            }
            let index = hook.feature_inputs().iter().position(|input| *input == m.texture)?;
            if role == ConvRole::Mid {
                if index >= tpl {
                    return None;
                }
                (arch.mid_in_start(index, negative), 3)
            } else {
                if index >= tpl * arch.n_stack {
                    return None;
                }
                (arch.tail_in_start(index / tpl, index % tpl, negative), arch.tail_kernel)
            }
        }
    };
    let (ky, kx) = match (m.takes_offset, offset, kernel) {
        (false, None, 1) => (0, 0),
        (true, Some((dx, dy)), 3) => kernel_position(dx, dy, 3)?,
        _ => return None,
    };
    Some((in_start, ky, kx))
}

fn fill_hook(hook: &MpvHook, out_start: usize, role: ConvRole, arch: &Architecture, fill: &mut LayerFill) -> Result<()> {
    let macros = hook_macros(hook);

    for line in hook.code.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with("//") || parse_macro(line).is_some() {
            continue;
        } else if RE_ENTRYPOINT_BEGIN.is_match(line) || RE_ENTRYPOINT_END.is_match(line) || RE_RETURN_AS_IS.is_match(line) {
            continue;
        } else if let Some(caps) = RE_RESULT_ADD_PROD.captures(line) {
            let func = &caps["func"];
            let m = macros.get(func).ok_or_else(|| Error::mismatch(format!("{}: unknown macro '{func}'", hook.name)))?;
            let offset = match (caps.name("x_offset"), caps.name("y_offset")) {
                (Some(x), Some(y)) => Some((x.as_str().parse::<i32>().unwrap_or(0), y.as_str().parse::<i32>().unwrap_or(0))),
                _ => None,
            };
            let (in_start, ky, kx) = macro_target(role, hook, m, offset, arch).ok_or_else(|| Error::unexpected_line(&hook.name, line))?;
            let weights = parse_float_list(&caps["weights"], 16)?;
            fill.pack(&weights, out_start, in_start, ky, kx);
        } else if let Some(caps) = RE_RESULT_ADD_VEC.captures(line) {
            fill.set_bias(out_start, &parse_float_list(&caps["weights"], 4)?);
        } else {
            return Err(Error::unexpected_line(&hook.name, line));
        }
    }
    Ok(())
}

/// The mpv GLSL hook dialect
pub struct MpvShader;

impl ShaderDialect for MpvShader {
    type Pass = MpvPassGroup;

    const NAME: &'static str = "mpv GLSL";

    fn split_passes(source: &str) -> Result<Vec<MpvPassGroup>> {
        let sections = MpvHook::parse_mpv_hooks(source);
        if sections.is_empty() {
            return Err(Error::MissingDirective("//!DESC".to_string()));
        }

        let mut scale_factor_map = MpvHook::new_scale_factor_map();
        let mut groups: Vec<MpvPassGroup> = Vec::new();
        for section in &sections {
            let hook = MpvHook::new(section, &mut scale_factor_map)?;
            match groups.last_mut() {
                Some(group) if group.leader().name == hook.name && group.leader().inputs == hook.inputs => group.hooks.push(hook),
                _ => groups.push(MpvPassGroup { hooks: vec![hook] }),
            }
        }
        debug!("Grouped {} hooks into {} layers", sections.len(), groups.len());
        Ok(groups)
    }

    fn sniff_architecture(groups: &[MpvPassGroup]) -> Result<Architecture> {
        let [head, mids @ .., aggregation, depth_to_space] = groups else {
            return Err(Error::MissingDirective(format!("at least 3 hook groups, found {}", groups.len())));
        };

        if depth_to_space.leader().r#type != ConvolutionStageType::DepthToSpace || depth_to_space.leader().scale_factor != 2 {
            return Err(Error::MissingDirective("final x2 Depth-to-Space hook".to_string()));
        }
        if let Some(group) = groups[..groups.len() - 1].iter().find(|g| g.leader().r#type != ConvolutionStageType::Conv) {
            return Err(Error::mismatch(format!("expected a Conv hook, found '{}'", group.leader().name)));
        }

        let tpl = head.hooks.len();
        let num_feat = tpl * COMPONENTS_PER_SAVE;
        let block_depth = groups.len() - 2;

        let negated = mids
            .iter()
            .chain([aggregation])
            .flat_map(|group| &group.hooks)
            .any(|hook| hook_macros(hook).values().any(|m| m.activation.is_negative()));
        let factor = if negated { 2 } else { 1 };

        let (tail_kernel, tail_in) = aggregation.conv_desc()?;
        let binds = aggregation.leader().feature_inputs().len();
        if binds == 0 || binds % tpl != 0 {
            return Err(Error::mismatch(format!("aggregation binds {binds} textures, not a positive multiple of {tpl}")));
        }
        let n_stack = binds / tpl;

        let arch = Architecture::new(num_feat, block_depth, factor, n_stack, tail_kernel)?;

        let (head_kernel, head_in) = head.conv_desc()?;
        if (head_kernel, head_in) != (3, INPUT_CHANNELS) {
            return Err(Error::mismatch(format!("head DESC '{}' is not Conv-4x3x3x3", head.leader().name)));
        }
        for group in mids {
            let (kernel, channels) = group.conv_desc()?;
            if (kernel, channels) != (3, arch.mid_in_channels()) {
                return Err(Error::mismatch(format!("'{}' disagrees with {} mid-layer input channels", group.leader().name, arch.mid_in_channels())));
            }
        }
        if tail_in != arch.tail_in_channels() {
            return Err(Error::mismatch(format!("aggregation DESC names {tail_in} input channels, the binds imply {}", arch.tail_in_channels())));
        }
        Ok(arch)
    }

    fn extract_weights(groups: &[MpvPassGroup], arch: Architecture) -> Result<Anime4kCnn> {
        let mut fill = ModelFill::new(arch);
        let tpl = arch.textures_per_layer();

        let layers = std::iter::once((&groups[0], ConvRole::Head, &mut fill.head))
            .chain(groups[1..arch.block_depth].iter().zip(fill.mids.iter_mut()).map(|(group, layer)| (group, ConvRole::Mid, layer)))
            .chain(std::iter::once((&groups[arch.block_depth], ConvRole::Aggregation, &mut fill.tail)));

        for (group, role, layer) in layers {
            let expected = if role == ConvRole::Aggregation { TAIL_OUT_CHANNELS / COMPONENTS_PER_SAVE } else { tpl };
            if group.hooks.len() != expected {
                return Err(Error::mismatch(format!("'{}' has {} hooks, expected {expected}", group.leader().name, group.hooks.len())));
            }
            for (sub, hook) in group.hooks.iter().enumerate() {
                fill_hook(hook, sub * COMPONENTS_PER_SAVE, role, &arch, layer)?;
            }
        }

        fill.finish()
    }
}

/// A macro definition together with the input block it carries
struct MacroInput {
    texture: String,
    activation: Activation,
    in_start: usize,
}

impl MacroInput {
    fn define(&self, name: &str, offsets: bool) -> String {
        let sign = if self.activation.is_negative() { "-" } else { "" };
        let texture = &self.texture;
        match (offsets, self.activation) {
            (true, Activation::Identity) => format!("#define {name}(x_off, y_off) ({texture}_texOff(vec2(x_off, y_off)))"),
            (true, _) => format!("#define {name}(x_off, y_off) (max({sign}({texture}_texOff(vec2(x_off, y_off))), 0.0))"),
            (false, _) => format!("#define {name} (max({sign}({texture}_tex({texture}_pos)), 0.0))"),
        }
    }
}

fn desc_prefix(model: &Anime4kCnn) -> String {
    format!("Anime4K-v4.0-Upscale-CNN-(x2)-({})", model.variant_label())
}

/// Appends the hooks of one conv layer, one per 4-channel output texture
fn push_conv_group(code: &mut String, desc: &str, outputs: &[String], inputs: &[MacroInput], kernel: usize, weight: &Tensor4, bias: &[f32]) {
    let offsets = kernel > 1;
    let prefix = if offsets { "go" } else { "g" };
    let mut binds: Vec<&str> = Vec::new();
    for input in inputs {
        if !binds.contains(&input.texture.as_str()) {
            binds.push(&input.texture);
        }
    }

    for (sub, output) in outputs.iter().enumerate() {
        let out_start = sub * COMPONENTS_PER_SAVE;
        code.push_str(&format!("//!DESC {desc}\n"));
        code.push_str("//!HOOK MAIN\n");
        for bind in &binds {
            code.push_str(&format!("//!BIND {bind}\n"));
        }
        code.push_str(&format!("//!SAVE {output}\n"));
        code.push_str("//!WIDTH MAIN.w\n");
        code.push_str("//!HEIGHT MAIN.h\n");
        code.push_str(&format!("//!COMPONENTS {COMPONENTS_PER_SAVE}\n"));
        code.push_str(&format!("//!WHEN {WHEN_CONDITION}\n"));
        for (i, input) in inputs.iter().enumerate() {
            code.push_str(&input.define(&format!("{prefix}_{i}"), offsets));
            code.push('\n');
        }
        code.push_str("vec4 hook() {\n");

        let mut first = true;
        for (i, input) in inputs.iter().enumerate() {
            for &(dx, dy) in kernel_offsets(kernel) {
                let (ky, kx) = kernel_position(dx, dy, kernel).unwrap_or((0, 0));
                let values = unpack_block(weight, out_start, input.in_start, ky, kx, 4);
                let lhs = if first { "vec4 result =" } else { "result +=" };
                let call = if offsets { format!("{prefix}_{i}({:.1}, {:.1})", dx as f32, dy as f32) } else { format!("{prefix}_{i}") };
                code.push_str(&format!("    {lhs} mat4({}) * {call};\n", join_floats(&values)));
                first = false;
            }
        }
        code.push_str(&format!("    result += vec4({});\n", join_floats(&bias_block(bias, out_start))));
        code.push_str("    return result;\n");
        code.push_str("}\n");
        code.push('\n');
    }
}

fn push_depth_to_space(code: &mut String, desc: &str) {
    let textures: Vec<String> = (0..TAIL_OUT_CHANNELS / COMPONENTS_PER_SAVE).map(last_texture_name).collect();
    code.push_str(&format!("//!DESC {desc}\n"));
    code.push_str("//!HOOK MAIN\n");
    code.push_str("//!BIND MAIN\n");
    for texture in &textures {
        code.push_str(&format!("//!BIND {texture}\n"));
    }
    code.push_str("//!SAVE MAIN\n");
    code.push_str(&format!("//!WIDTH {}.w 2 *\n", textures[0]));
    code.push_str(&format!("//!HEIGHT {}.h 2 *\n", textures[0]));
    code.push_str(&format!("//!WHEN {WHEN_CONDITION}\n"));
    code.push_str("vec4 hook() {\n");
    for (i, texture) in textures.iter().enumerate() {
        code.push_str(&format!("    vec2 f{i} = fract({texture}_pos * {texture}_size);\n"));
        code.push_str(&format!("    ivec2 i{i} = ivec2(f{i} * vec2(2.0));\n"));
        code.push_str(&format!("    float c{i} = {texture}_tex((vec2(0.5) - f{i}) * {texture}_pt + {texture}_pos)[i{i}.y * 2 + i{i}.x];\n"));
    }
    code.push_str("    float c3 = c2;\n");
    code.push_str("    return vec4(c0, c1, c2, c3) + MAIN_tex(MAIN_pos);\n");
    code.push_str("}\n");
}

/// Inputs of a layer reading the textures of `layers`, positive halves first
fn activated_inputs(arch: &Architecture, layers: impl Iterator<Item = usize> + Clone) -> Vec<MacroInput> {
    let tpl = arch.textures_per_layer();
    let mut inputs = Vec::new();
    for &activation in Activation::for_factor(arch.factor) {
        for (stacked, layer) in layers.clone().enumerate() {
            for tex in 0..tpl {
                inputs.push(MacroInput {
                    texture: conv_texture_name(layer, tex),
                    activation,
                    in_start: arch.tail_in_start(stacked, tex, activation.is_negative()),
                });
            }
        }
    }
    inputs
}

/// Renders a model as an mpv GLSL hook shader
///
/// # Arguments
/// * `model` - Model to render
///
/// # Returns
/// The hook source, with layers wider than four channels split into one hook per saved texture
///
/// # Errors
/// Returns [`Error::NonFinite`] or a shape error if the model does not validate.
pub fn write_glsl(model: &Anime4kCnn) -> Result<String> {
    model.validate()?;
    let arch = model.arch;
    let tpl = arch.textures_per_layer();
    let prefix = desc_prefix(model);

    let mut code = format!("// {prefix}\n// Generated from a trained model\n\n");

    let head_inputs = [MacroInput {
        texture: "MAIN".to_string(),
        activation: Activation::Identity,
        in_start: 0,
    }];
    let outputs: Vec<String> = (0..tpl).map(|tex| conv_texture_name(0, tex)).collect();
    push_conv_group(&mut code, &format!("{prefix}-Conv-4x3x3x{INPUT_CHANNELS}"), &outputs, &head_inputs, 3, &model.head_weight, &model.head_bias);

    for (i, (weight, bias)) in model.mid_weights.iter().zip(&model.mid_biases).enumerate() {
        let layer = i + 1;
        // A single stacked layer gives the mid-layer channel layout
        let inputs = activated_inputs(&arch, std::iter::once(layer - 1));
        let outputs: Vec<String> = (0..tpl).map(|tex| conv_texture_name(layer, tex)).collect();
        push_conv_group(&mut code, &format!("{prefix}-Conv-4x3x3x{}", arch.mid_in_channels()), &outputs, &inputs, 3, weight, bias);
    }

    let inputs = activated_inputs(&arch, arch.stack_start_layer()..arch.block_depth);
    let outputs: Vec<String> = (0..TAIL_OUT_CHANNELS / COMPONENTS_PER_SAVE).map(last_texture_name).collect();
    let k = arch.tail_kernel;
    push_conv_group(
        &mut code,
        &format!("{prefix}-Conv-4x{k}x{k}x{}", arch.tail_in_channels()),
        &outputs,
        &inputs,
        k,
        &model.tail_weight,
        &model.tail_bias,
    );

    push_depth_to_space(&mut code, &format!("{prefix}-Depth-to-Space"));
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{arch, sample_model};

    #[test]
    fn test_parse_mpv_hooks_skips_preamble() {
        let source = "// MIT License\n\n//!DESC a\n//!HOOK MAIN\n//!DESC b\ncode\n";
        let hooks = MpvHook::parse_mpv_hooks(source);
        assert_eq!(hooks, vec!["//!DESC a\n//!HOOK MAIN\n".to_string(), "//!DESC b\ncode\n".to_string()]);
    }

    #[test]
    fn test_macro_parsing() {
        let (name, m) = parse_macro("#define go_1(x_off, y_off) (max(-(conv2d_2_tf1_texOff(vec2(x_off, y_off))), 0.0))").unwrap();
        assert_eq!(name, "go_1");
        assert_eq!(m.texture, "conv2d_2_tf1");
        assert_eq!(m.activation, Activation::Negative);
        assert!(m.takes_offset);

        let (_, m) = parse_macro("#define go_0(x_off, y_off) (MAIN_texOff(vec2(x_off, y_off)))").unwrap();
        assert_eq!(m.activation, Activation::Identity);

        let (name, m) = parse_macro("#define g_4 (max((conv2d_3_tf_tex(conv2d_3_tf_pos)), 0.0))").unwrap();
        assert_eq!(name, "g_4");
        assert_eq!(m.activation, Activation::Positive);
        assert!(!m.takes_offset);

        assert_eq!(parse_macro("#define go_0(x_off, y_off) (max((MAIN_texOff(vec2(x_off, y_off)))"), None);
    }

    #[test]
    fn test_hook_directives() {
        let mut map = MpvHook::new_scale_factor_map();
        let source = "//!DESC x-Conv-4x3x3x3\n//!HOOK MAIN\n//!BIND MAIN\n//!SAVE conv2d_tf\n//!WIDTH MAIN.w\n//!HEIGHT MAIN.h\n//!COMPONENTS 4\nvec4 hook() {\n}\n";
        let hook = MpvHook::new(source, &mut map).unwrap();
        assert_eq!(hook.inputs, vec!["MAIN"]);
        assert_eq!(hook.output, "conv2d_tf");
        assert_eq!(hook.scale_factor, 1);
        assert_eq!(hook.r#type, ConvolutionStageType::Conv);
        assert_eq!(map.get("conv2d_tf"), Some(&1));

        let doubled = "//!DESC x-Depth-to-Space\n//!BIND conv2d_tf\n//!SAVE MAIN\n//!WIDTH conv2d_tf.w 2 *\n//!HEIGHT conv2d_tf.h 2 *\n";
        assert_eq!(MpvHook::new(doubled, &mut map).unwrap().scale_factor, 2);

        let no_save = "//!DESC x-Conv-4x3x3x3\n//!BIND MAIN\n//!WIDTH MAIN.w\n";
        assert!(matches!(MpvHook::new(no_save, &mut map), Err(Error::MissingDirective(_))));
        let components = "//!DESC x-Conv-4x3x3x3\n//!COMPONENTS 3\n";
        assert!(matches!(MpvHook::new(components, &mut map), Err(Error::UnexpectedLine { .. })));
    }

    #[test]
    fn test_one_hook_per_save_texture() {
        let model = sample_model(arch(12, 3, 2, 2, 1));
        let code = write_glsl(&model).unwrap();
        // 3 head + 2 * 3 mid + 3 aggregation + 1 depth-to-space
        assert_eq!(code.matches("//!DESC ").count(), 13);
        assert!(code.contains("//!DESC Anime4K-v4.0-Upscale-CNN-(x2)-(d3_s2_f12)-Conv-4x1x1x48\n"));
        assert!(code.contains("//!SAVE conv2d_2_tf2\n"));
        assert!(code.contains("#define g_11 (max(-(conv2d_2_tf2_tex(conv2d_2_tf2_pos)), 0.0))\n"));
        assert!(code.contains("    vec4 result = mat4("));
        assert!(code.contains(") * go_0(-1.0, 1.0);\n"));
    }

    #[test]
    fn test_round_trip() {
        for arch in [arch(8, 5, 2, 3, 1), arch(4, 2, 1, 2, 3), arch(16, 1, 2, 1, 3), arch(12, 7, 1, 5, 1)] {
            let model = sample_model(arch);
            let code = write_glsl(&model).unwrap();
            let groups = MpvShader::split_passes(&code).unwrap();
            assert_eq!(groups.len(), arch.logical_pass_count());
            assert_eq!(MpvShader::parse(&code).unwrap(), model);
        }
    }

    #[test]
    fn test_compact_spacing_is_accepted() {
        let model = sample_model(arch(8, 2, 2, 2, 3));
        let code = write_glsl(&model).unwrap();
        let compact: String = code
            .lines()
            .map(|line| {
                let body = line.trim_start();
                if body.starts_with("#define") || body.starts_with("result") || body.starts_with("vec4 result") {
                    body.replace(", ", ",").replace(" += ", "+=").replace(" = ", "=").replace(") * ", ")*").replace("(max(-(", "(max( -(")
                } else {
                    line.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        assert!(compact.contains("(x_off,y_off) (max( -("));
        assert!(compact.contains("result+=mat4("));

        assert_eq!(MpvShader::parse(&compact).unwrap(), model);
    }

    #[test]
    fn test_desc_cross_check() {
        let model = sample_model(arch(8, 2, 2, 2, 1));
        let code = write_glsl(&model).unwrap().replace("-Conv-4x1x1x32", "-Conv-4x1x1x16");
        assert!(matches!(MpvShader::parse(&code), Err(Error::StructuralMismatch(_))));
    }

    #[test]
    fn test_unknown_body_line() {
        let model = sample_model(arch(4, 1, 2, 1, 1));
        let code = write_glsl(&model).unwrap().replacen("    return result;\n", "    result *= 0.5;\n    return result;\n", 1);
        assert!(matches!(MpvShader::parse(&code), Err(Error::UnexpectedLine { line, .. }) if line == "result *= 0.5;"));
    }
}
