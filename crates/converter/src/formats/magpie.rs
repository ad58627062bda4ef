//! MagPie HLSL effects (`.hlsl`)
//!
//! Pass 1 is the head, passes `2..=block_depth` the mid layers, and the last
//! pass fuses the aggregation with depth-to-space. Mid passes and the last
//! pass sample every input texture into named locals (`a1..i1`, `g0`, ...)
//! before the `MulAdd` chains.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::{Activation, ShaderDialect};
use crate::error::{Error, Result};
use crate::ir::{Anime4kCnn, Architecture, INPUT_CHANNELS, LayerFill, ModelFill, TAIL_OUT_CHANNELS};
use crate::utils::{LETTER_OFFSETS, bias_block, conv_texture_name, join_floats, kernel_offsets, kernel_position, letter_offset, offset_letter, parse_float_list, unpack_block};

static RE_PASS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^//!PASS\s+(\d+)$").unwrap());
static RE_PASS_FUNCTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^void\s+Pass(\d+)\s*\(\s*uint2\s+blockStart\s*,\s*uint3\s+threadId\s*\)\s*\{$").unwrap());
static RE_CONV_DESC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^Conv-4x(\d+)x(\d+)x(\d+)(, Depth-to-Space)?$").unwrap());
static RE_NEGATED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"max\s*\(\s*-").unwrap());

static RE_HEAD_BIAS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^MF4\s+target(\d+)\s*=\s*(?:\{([^}]+)\}|MF4\s*\(([^)]+)\))\s*;$").unwrap());
static RE_HEAD_MULADD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^target(?<t>\d+)\s*=\s*MulAdd\s*\(\s*src\s*\[\s*i\s*(?:(?<di>[+-])\s*1\s*)?\]\s*\[\s*j\s*(?:(?<dj>[+-])\s*1\s*)?\]\s*,\s*MF3x4\s*\((?<weights>[^)]+)\)\s*,\s*target(?<acc>\d+)\s*\)\s*;$",
    )
    .unwrap()
});
static RE_HEAD_STORE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\w+\s*\[\s*destPos\s*\]\s*=\s*target\d+\s*;$").unwrap());

static RE_HIDDEN_SAMPLE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^MF4\s+[a-i]\d+\s*=\s*(\w+)\s*\.\s*SampleLevel\s*\(\s*sam\s*,[^;]+,\s*0\s*\)\s*;$").unwrap());
static RE_HIDDEN_NEGATE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^MF4\s+n([a-i]\d+)\s*=\s*max\s*\(\s*-\s*([a-i]\d+)\s*,\s*0\s*\)\s*;$").unwrap());
static RE_HIDDEN_CLAMP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^([a-i]\d+)\s*=\s*max\s*\(\s*([a-i]\d+)\s*,\s*0\s*\)\s*;$").unwrap());
static RE_HIDDEN_BIAS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(?:MF4\s+)?target\s*=\s*MF4\s*\(([^)]+)\)\s*;$").unwrap());
static RE_HIDDEN_MULADD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^target\s*=\s*MulAdd\s*\(\s*(?<neg>n?)(?<letter>[a-i])(?<tex>\d+)\s*,\s*MF4x4\s*\((?<weights>[^)]+)\)\s*,\s*target\s*\)\s*;$").unwrap()
});
static RE_HIDDEN_STORE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\w+)\s*\[\s*gxy\s*\]\s*=\s*target\s*;$").unwrap());

static RE_AGG_SAMPLE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^MF4\s+g\d+[a-i]?\s*=\s*(\w+)\s*\.\s*SampleLevel\s*\(\s*sam\s*,[^;]+,\s*0\s*\)\s*;$").unwrap());
static RE_AGG_NEGATE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^MF4\s+ng(\d+[a-i]?)\s*=\s*max\s*\(\s*-\s*g(\d+[a-i]?)\s*,\s*0\s*\)\s*;$").unwrap());
static RE_AGG_CLAMP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^g(\d+[a-i]?)\s*=\s*max\s*\(\s*g(\d+[a-i]?)\s*,\s*0\s*\)\s*;$").unwrap());
static RE_AGG_BIAS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^MF4\s+target(\d+)\s*=\s*MF4\s*\(([^)]+)\)\s*;$").unwrap());
static RE_AGG_MULADD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^target(?<t>\d+)\s*=\s*MulAdd\s*\(\s*(?<neg>n?)g(?<input>\d+)(?<letter>[a-i]?)\s*,\s*MF4x4\s*\((?<weights>[^)]+)\)\s*,\s*target(?<acc>\d+)\s*\)\s*;$",
    )
    .unwrap()
});

/// Head body up to the `MulAdd` chains
const HEAD_PROLOGUE: &str = "\tuint2 gxy = (Rmp8x8(threadId.x) << 1) + blockStart;
\tuint2 inputSize = GetInputSize();
\tif (gxy.x >= inputSize.x || gxy.y >= inputSize.y) {
\t\treturn;
\t}

\tfloat2 inputPt = GetInputPt();

\tuint i, j;

\tMF3 src[4][4];
\t[unroll]
\tfor (i = 0; i <= 2; i += 2) {
\t\t[unroll]
\t\tfor (j = 0; j <= 2; j += 2) {
\t\t\tfloat2 tpos = (gxy + uint2(i, j)) * inputPt;
\t\t\tconst MF4 sr = INPUT.GatherRed(sam, tpos);
\t\t\tconst MF4 sg = INPUT.GatherGreen(sam, tpos);
\t\t\tconst MF4 sb = INPUT.GatherBlue(sam, tpos);

\t\t\t// w z
\t\t\t// x y
\t\t\tsrc[i][j] = MF3(sr.w, sg.w, sb.w);
\t\t\tsrc[i][j + 1] = MF3(sr.x, sg.x, sb.x);
\t\t\tsrc[i + 1][j] = MF3(sr.z, sg.z, sb.z);
\t\t\tsrc[i + 1][j + 1] = MF3(sr.y, sg.y, sb.y);
\t\t}
\t}

\t[unroll]
\tfor (i = 1; i <= 2; ++i) {
\t\t[unroll]
\t\tfor (j = 1; j <= 2; ++j) {
\t\t\tuint2 destPos = gxy + uint2(i - 1, j - 1);

\t\t\tif (i != 1 || j != 1) {
\t\t\t\tif (destPos.x >= inputSize.x || destPos.y >= inputSize.y) {
\t\t\t\t\tcontinue;
\t\t\t\t}
\t\t\t}

";

const HEAD_EPILOGUE: &str = "\t\t}
\t}
}
";

const HIDDEN_PROLOGUE: &str = "\tuint2 gxy = Rmp8x8(threadId.x) + blockStart;
\tuint2 inputSize = GetInputSize();
\tif (gxy.x >= inputSize.x || gxy.y >= inputSize.y) {
\t\treturn;
\t}

\tfloat2 inputPt = GetInputPt();
\tfloat2 pos = (gxy + 0.5f) * inputPt;

\t// [ a, d, g ]
\t// [ b, e, h ]
\t// [ c, f, i ]
";

const HIDDEN_EPILOGUE: &str = "}\n";

const LAST_PROLOGUE: &str = "\tuint2 gxy = (Rmp8x8(threadId.x) << 1) + blockStart;
\tuint2 outputSize = GetOutputSize();
\tif (gxy.x >= outputSize.x || gxy.y >= outputSize.y) {
\t\treturn;
\t}

\tfloat2 inputPt = GetInputPt();
\tfloat2 pos = ((gxy >> 1) + 0.5f) * inputPt;

";

/// Writes the 2x2 output block, adding the bilinearly sampled input
const DEPTH_TO_SPACE_EPILOGUE: &str = "\tfloat2 outputPt = GetOutputPt();

\tpos -= 0.5f * outputPt;
\tOUTPUT[gxy] = MF4(MF3(target1.x, target2.x, target3.x) + INPUT.SampleLevel(sam1, pos, 0).rgb, 1);

\t++gxy.x;
\tpos.x += outputPt.x;
\tOUTPUT[gxy] = MF4(MF3(target1.y, target2.y, target3.y) + INPUT.SampleLevel(sam1, pos, 0).rgb, 1);

\t++gxy.y;
\tpos.y += outputPt.y;
\tOUTPUT[gxy] = MF4(MF3(target1.w, target2.w, target3.w) + INPUT.SampleLevel(sam1, pos, 0).rgb, 1);

\t--gxy.x;
\tpos.x -= outputPt.x;
\tOUTPUT[gxy] = MF4(MF3(target1.z, target2.z, target3.z) + INPUT.SampleLevel(sam1, pos, 0).rgb, 1);
}
";

/// Whether `line` is one of the fixed lines of `template`, ignoring whitespace
fn is_template_line(template: &str, line: &str) -> bool {
    let significant = |text: &str| text.chars().filter(|c| !c.is_whitespace()).collect::<String>();
    let line = significant(line);
    template.lines().any(|t| significant(t) == line)
}

/// One `//!PASS n` block
#[derive(Debug, Clone, PartialEq)]
pub struct MagpiePass {
    /// Pass number, from 1
    pub index: usize,
    /// DESC directive
    pub desc: String,
    /// IN textures
    pub inputs: Vec<String>,
    /// OUT textures
    pub outputs: Vec<String>,
    /// Lines of the `PassN` function after its signature
    pub body: Vec<String>,
}

impl MagpiePass {
    fn new(index: usize) -> Self {
        Self {
            index,
            desc: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            body: Vec::new(),
        }
    }

    fn label(&self) -> String {
        format!("PASS {} ({})", self.index, self.desc)
    }

    /// Kernel size and input channels from a `Conv-4xKxKxC` DESC
    fn conv_desc(&self) -> Result<(usize, usize, bool)> {
        let caps = RE_CONV_DESC.captures(&self.desc).ok_or_else(|| Error::mismatch(format!("'{}' does not name a Conv-4xKxKxC layer", self.desc)))?;
        let ky: usize = caps[1].parse().map_err(|_| Error::mismatch(format!("invalid kernel in '{}'", self.desc)))?;
        let kx: usize = caps[2].parse().map_err(|_| Error::mismatch(format!("invalid kernel in '{}'", self.desc)))?;
        let channels: usize = caps[3].parse().map_err(|_| Error::mismatch(format!("invalid channel count in '{}'", self.desc)))?;
        if ky != kx {
            return Err(Error::mismatch(format!("'{}' has a non-square kernel", self.desc)));
        }
        Ok((ky, channels, caps.get(4).is_some()))
    }
}

fn split_list(content: &str) -> Vec<String> {
    content.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

fn fill_head(pass: &MagpiePass, fill: &mut LayerFill) -> Result<()> {
    let groups = fill.out_channels() / 4;
    for line in &pass.body {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") || is_template_line(HEAD_PROLOGUE, line) || is_template_line(HEAD_EPILOGUE, line) || RE_HEAD_STORE.is_match(line) {
            continue;
        }
        if let Some(caps) = RE_HEAD_BIAS.captures(line) {
            let group = target_group(pass, line, &caps[1], groups)?;
            let literals = caps.get(2).or_else(|| caps.get(3)).map_or("", |m| m.as_str());
            fill.set_bias(group * 4, &parse_float_list(literals, 4)?);
        } else if let Some(caps) = RE_HEAD_MULADD.captures(line) {
            if caps["t"] != caps["acc"] {
                return Err(Error::unexpected_line(&pass.label(), line));
            }
            let group = target_group(pass, line, &caps["t"], groups)?;
            let dx = signed_unit(caps.name("di").map(|m| m.as_str()));
            let dy = signed_unit(caps.name("dj").map(|m| m.as_str()));
            let (ky, kx) = kernel_position(dx, dy, 3).ok_or_else(|| Error::unexpected_line(&pass.label(), line))?;
            fill.pack(&parse_float_list(&caps["weights"], 4 * INPUT_CHANNELS)?, group * 4, 0, ky, kx);
        } else {
            return Err(Error::unexpected_line(&pass.label(), line));
        }
    }
    Ok(())
}

fn signed_unit(sign: Option<&str>) -> i32 {
    match sign {
        Some("-") => -1,
        Some(_) => 1,
        None => 0,
    }
}

/// Output group of a 1-based `targetN` name
fn target_group(pass: &MagpiePass, line: &str, digits: &str, groups: usize) -> Result<usize> {
    match digits.parse::<usize>() {
        Ok(t) if (1..=groups).contains(&t) => Ok(t - 1),
        _ => Err(Error::unexpected_line(&pass.label(), line)),
    }
}

fn fill_hidden(pass: &MagpiePass, arch: &Architecture, fill: &mut LayerFill) -> Result<()> {
    let groups = fill.out_channels() / 4;
    let tpl = arch.textures_per_layer();
    let mut current_out = 0;

    for line in &pass.body {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") || is_template_line(HIDDEN_PROLOGUE, line) || is_template_line(HIDDEN_EPILOGUE, line) {
            continue;
        }
        if let Some(caps) = RE_HIDDEN_SAMPLE.captures(line) {
            if !pass.inputs.iter().any(|input| *input == caps[1]) {
                return Err(Error::mismatch(format!("{} samples '{}' which is not an input", pass.label(), &caps[1])));
            }
        } else if RE_HIDDEN_NEGATE.is_match(line) || RE_HIDDEN_CLAMP.is_match(line) {
            // activations are implied by the n prefix of the MulAdd operands
        } else if let Some(caps) = RE_HIDDEN_BIAS.captures(line) {
            if current_out >= groups {
                return Err(Error::unexpected_line(&pass.label(), line));
            }
            fill.set_bias(current_out * 4, &parse_float_list(&caps[1], 4)?);
        } else if let Some(caps) = RE_HIDDEN_MULADD.captures(line) {
            let negative = !caps["neg"].is_empty();
            let texture = caps["tex"].parse::<usize>().ok().filter(|t| (1..=tpl).contains(t));
            let position = caps["letter"].chars().next().and_then(letter_offset).and_then(|(dx, dy)| kernel_position(dx, dy, 3));
            let (Some(texture), Some((ky, kx))) = (texture, position) else {
                return Err(Error::unexpected_line(&pass.label(), line));
            };
            if current_out >= groups || (negative && arch.factor == 1) {
                return Err(Error::unexpected_line(&pass.label(), line));
            }
            let weights = parse_float_list(&caps["weights"], 16)?;
            fill.pack(&weights, current_out * 4, arch.mid_in_start(texture - 1, negative), ky, kx);
        } else if let Some(caps) = RE_HIDDEN_STORE.captures(line) {
            if pass.outputs.get(current_out).map(String::as_str) != Some(&caps[1]) {
                return Err(Error::mismatch(format!("{} stores '{}' out of order", pass.label(), &caps[1])));
            }
            current_out += 1;
        } else {
            return Err(Error::unexpected_line(&pass.label(), line));
        }
    }
    Ok(())
}

fn fill_aggregation(pass: &MagpiePass, arch: &Architecture, fill: &mut LayerFill) -> Result<()> {
    let groups = fill.out_channels() / 4;
    let tpl = arch.textures_per_layer();
    let samplers = tpl * arch.n_stack;

    for line in &pass.body {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") || is_template_line(LAST_PROLOGUE, line) || is_template_line(DEPTH_TO_SPACE_EPILOGUE, line) {
            continue;
        }
        if let Some(caps) = RE_AGG_SAMPLE.captures(line) {
            if !pass.inputs.iter().any(|input| *input == caps[1]) {
                return Err(Error::mismatch(format!("{} samples '{}' which is not an input", pass.label(), &caps[1])));
            }
        } else if RE_AGG_NEGATE.is_match(line) || RE_AGG_CLAMP.is_match(line) {
            // activations are implied by the n prefix of the MulAdd operands
        } else if let Some(caps) = RE_AGG_BIAS.captures(line) {
            let group = target_group(pass, line, &caps[1], groups)?;
            fill.set_bias(group * 4, &parse_float_list(&caps[2], 4)?);
        } else if let Some(caps) = RE_AGG_MULADD.captures(line) {
            if caps["t"] != caps["acc"] {
                return Err(Error::unexpected_line(&pass.label(), line));
            }
            let group = target_group(pass, line, &caps["t"], groups)?;
            let negative = !caps["neg"].is_empty();
            let input = caps["input"].parse::<usize>().ok().filter(|i| *i < samplers);
            let position = match (caps["letter"].chars().next(), arch.tail_kernel) {
                (None, 1) => Some((0, 0)),
                (Some(letter), 3) => letter_offset(letter).and_then(|(dx, dy)| kernel_position(dx, dy, 3)),
                _ => None,
            };
            let (Some(input), Some((ky, kx))) = (input, position) else {
                return Err(Error::unexpected_line(&pass.label(), line));
            };
            if negative && arch.factor == 1 {
                return Err(Error::unexpected_line(&pass.label(), line));
            }
            let weights = parse_float_list(&caps["weights"], 16)?;
            fill.pack(&weights, group * 4, arch.tail_in_start(input / tpl, input % tpl, negative), ky, kx);
        } else {
            return Err(Error::unexpected_line(&pass.label(), line));
        }
    }
    Ok(())
}

/// The MagPie effect dialect
pub struct MagpieShader;

impl ShaderDialect for MagpieShader {
    type Pass = MagpiePass;

    const NAME: &'static str = "MagPie HLSL";

    fn split_passes(source: &str) -> Result<Vec<MagpiePass>> {
        let mut passes: Vec<MagpiePass> = Vec::new();
        let mut in_body = false;

        for line in source.lines() {
            let trimmed = line.trim();
            if let Some(caps) = RE_PASS.captures(trimmed) {
                let index = caps[1].parse().map_err(|_| Error::unexpected_line("PASS header", trimmed))?;
                passes.push(MagpiePass::new(index));
                in_body = false;
                continue;
            }
            let Some(pass) = passes.last_mut() else {
                continue;
            };

            if in_body {
                pass.body.push(line.to_string());
            } else if let Some(content) = trimmed.strip_prefix("//!DESC ") {
                pass.desc = content.trim().to_string();
            } else if let Some(content) = trimmed.strip_prefix("//!IN ") {
                pass.inputs = split_list(content);
            } else if let Some(content) = trimmed.strip_prefix("//!OUT ") {
                pass.outputs = split_list(content);
            } else if trimmed.starts_with("//!BLOCK_SIZE ") || trimmed.starts_with("//!NUM_THREADS ") || trimmed.starts_with("//!STYLE ") {
                // dispatch shape only
            } else if let Some(caps) = RE_PASS_FUNCTION.captures(trimmed) {
                if caps[1].parse::<usize>().ok() != Some(pass.index) {
                    return Err(Error::mismatch(format!("PASS {} defines '{trimmed}'", pass.index)));
                }
                in_body = true;
            } else if (!trimmed.is_empty() && !trimmed.starts_with("//")) || trimmed.starts_with("//!") {
                return Err(Error::unexpected_line(&format!("PASS {}", pass.index), trimmed));
            }
        }

        if passes.is_empty() {
            return Err(Error::MissingDirective("//!PASS 1".to_string()));
        }
        for (position, pass) in passes.iter().enumerate() {
            if pass.index != position + 1 {
                return Err(Error::mismatch(format!("passes must be numbered contiguously from 1, found PASS {} at position {}", pass.index, position + 1)));
            }
            if pass.desc.is_empty() {
                return Err(Error::MissingDirective(format!("//!DESC in PASS {}", pass.index)));
            }
            if pass.outputs.is_empty() {
                return Err(Error::MissingDirective(format!("//!OUT in PASS {}", pass.index)));
            }
            if pass.body.is_empty() {
                return Err(Error::MissingDirective(format!("void Pass{}(...) in PASS {}", pass.index, pass.index)));
            }
        }
        if passes.len() < 2 {
            return Err(Error::MissingDirective(format!("at least 2 passes, found {}", passes.len())));
        }
        Ok(passes)
    }

    fn sniff_architecture(passes: &[MagpiePass]) -> Result<Architecture> {
        let [head, mids @ .., last] = passes else {
            return Err(Error::MissingDirective(format!("at least 2 passes, found {}", passes.len())));
        };

        let tpl = head.outputs.len();
        let num_feat = tpl * 4;
        let block_depth = passes.len() - 1;

        let negated = passes[1..].iter().flat_map(|pass| &pass.body).any(|line| RE_NEGATED.is_match(line));
        let factor = if negated { 2 } else { 1 };

        let (tail_kernel, tail_in, fused) = last.conv_desc()?;
        if !fused {
            return Err(Error::MissingDirective(format!("Depth-to-Space in the DESC of PASS {}", last.index)));
        }
        let stacked = last.inputs.iter().filter(|input| *input != "INPUT").count();
        if stacked == 0 || stacked % tpl != 0 {
            return Err(Error::mismatch(format!("last pass reads {stacked} textures, not a positive multiple of {tpl}")));
        }
        let n_stack = stacked / tpl;
        debug!("Pass 1 writes {tpl} textures, last pass reads {stacked}");

        let arch = Architecture::new(num_feat, block_depth, factor, n_stack, tail_kernel)?;

        if head.conv_desc()? != (3, INPUT_CHANNELS, false) {
            return Err(Error::mismatch(format!("PASS 1 DESC '{}' is not Conv-4x3x3x3", head.desc)));
        }
        for pass in mids {
            if pass.conv_desc()? != (3, arch.mid_in_channels(), false) || pass.outputs.len() != tpl {
                return Err(Error::mismatch(format!("{} disagrees with {} mid-layer input channels", pass.label(), arch.mid_in_channels())));
            }
        }
        if tail_in != arch.tail_in_channels() {
            return Err(Error::mismatch(format!("last DESC names {tail_in} input channels, the inputs imply {}", arch.tail_in_channels())));
        }
        Ok(arch)
    }

    fn extract_weights(passes: &[MagpiePass], arch: Architecture) -> Result<Anime4kCnn> {
        let mut fill = ModelFill::new(arch);

        fill_head(&passes[0], &mut fill.head)?;
        for (pass, layer) in passes[1..arch.block_depth].iter().zip(fill.mids.iter_mut()) {
            fill_hidden(pass, &arch, layer)?;
        }
        fill_aggregation(&passes[arch.block_depth], &arch, &mut fill.tail)?;

        fill.finish()
    }
}

fn axis_offset(delta: i32, pt: &str) -> String {
    match delta {
        -1 => format!("-{pt}"),
        0 => "0".to_string(),
        _ => pt.to_string(),
    }
}

/// Sample position of a spatial offset relative to `pos`
fn offset_position(dx: i32, dy: i32) -> String {
    if (dx, dy) == (0, 0) {
        "pos".to_string()
    } else {
        format!("pos + float2({}, {})", axis_offset(dx, "inputPt.x"), axis_offset(dy, "inputPt.y"))
    }
}

fn src_index(delta: i32, axis: &str) -> String {
    match delta {
        -1 => format!("{axis} - 1"),
        0 => axis.to_string(),
        _ => format!("{axis} + 1"),
    }
}

fn push_texture(code: &mut String, name: &str, size: Option<(&str, &str)>, format: Option<&str>) {
    code.push_str("//!TEXTURE\n");
    if let Some((width, height)) = size {
        code.push_str(&format!("//!WIDTH {width}\n"));
        code.push_str(&format!("//!HEIGHT {height}\n"));
    }
    if let Some(format) = format {
        code.push_str(&format!("//!FORMAT {format}\n"));
    }
    code.push_str(&format!("Texture2D {name};\n"));
    code.push('\n');
}

fn push_pass_header(code: &mut String, index: usize, desc: &str, inputs: &[String], outputs: &[String], block_size: usize) {
    code.push_str(&format!("//!PASS {index}\n"));
    code.push_str(&format!("//!DESC {desc}\n"));
    code.push_str(&format!("//!IN {}\n", inputs.join(", ")));
    code.push_str(&format!("//!OUT {}\n", outputs.join(", ")));
    code.push_str(&format!("//!BLOCK_SIZE {block_size}\n"));
    code.push_str("//!NUM_THREADS 64\n");
    code.push('\n');
    code.push_str(&format!("void Pass{index}(uint2 blockStart, uint3 threadId) {{\n"));
}

fn push_head(code: &mut String, model: &Anime4kCnn) {
    let tpl = model.arch.textures_per_layer();
    let outputs: Vec<String> = (0..tpl).map(|t| conv_texture_name(0, t)).collect();
    push_pass_header(code, 1, &format!("Conv-4x3x3x{INPUT_CHANNELS}"), &["INPUT".to_string()], &outputs, 16);
    code.push_str(HEAD_PROLOGUE);

    for t in 0..tpl {
        let target = t + 1;
        code.push_str(&format!("\t\t\tMF4 target{target} = {{ {} }};\n", join_floats(&bias_block(&model.head_bias, t * 4))));
        for &(dx, dy) in kernel_offsets(3) {
            let (ky, kx) = ((dx + 1) as usize, (dy + 1) as usize);
            let values = unpack_block(&model.head_weight, t * 4, 0, ky, kx, INPUT_CHANNELS);
            code.push_str(&format!(
                "\t\t\ttarget{target} = MulAdd(src[{}][{}], MF3x4({}), target{target});\n",
                src_index(dx, "i"),
                src_index(dy, "j"),
                join_floats(&values)
            ));
        }
        code.push('\n');
    }
    for (t, output) in outputs.iter().enumerate() {
        code.push_str(&format!("\t\t\t{output}[destPos] = target{};\n", t + 1));
    }
    code.push_str(HEAD_EPILOGUE);
    code.push('\n');
}

/// Declares the samples of one input, then its CReLU halves
fn push_samples(code: &mut String, arch: &Architecture, texture: &str, names: &[(String, (i32, i32))]) {
    for (name, (dx, dy)) in names {
        code.push_str(&format!("\tMF4 {name} = {texture}.SampleLevel(sam, {}, 0);\n", offset_position(*dx, *dy)));
    }
    code.push('\n');
    if arch.factor == 2 {
        for (name, _) in names {
            code.push_str(&format!("\tMF4 n{name} = max(-{name}, 0);\n"));
        }
        code.push('\n');
    }
    for (name, _) in names {
        code.push_str(&format!("\t{name} = max({name}, 0);\n"));
    }
    code.push('\n');
}

fn push_hidden(code: &mut String, model: &Anime4kCnn, mid: usize) {
    let arch = model.arch;
    let tpl = arch.textures_per_layer();
    let (weight, bias) = (&model.mid_weights[mid], &model.mid_biases[mid]);
    let layer = mid + 1;
    let inputs: Vec<String> = (0..tpl).map(|t| conv_texture_name(layer - 1, t)).collect();
    let outputs: Vec<String> = (0..tpl).map(|t| conv_texture_name(layer, t)).collect();

    push_pass_header(code, layer + 1, &format!("Conv-4x3x3x{}", arch.mid_in_channels()), &inputs, &outputs, 8);
    code.push_str(HIDDEN_PROLOGUE);

    for (s, texture) in inputs.iter().enumerate() {
        let names: Vec<(String, (i32, i32))> = LETTER_OFFSETS.iter().map(|(letter, offset)| (format!("{letter}{}", s + 1), *offset)).collect();
        push_samples(code, &arch, texture, &names);
    }

    for (t, output) in outputs.iter().enumerate() {
        let declare = if t == 0 { "MF4 " } else { "" };
        code.push_str(&format!("\t{declare}target = MF4({});\n", join_floats(&bias_block(bias, t * 4))));
        for &activation in Activation::for_factor(arch.factor) {
            let prefix = if activation.is_negative() { "n" } else { "" };
            for s in 0..tpl {
                for (letter, (dx, dy)) in LETTER_OFFSETS {
                    let (ky, kx) = ((dx + 1) as usize, (dy + 1) as usize);
                    let values = unpack_block(weight, t * 4, arch.mid_in_start(s, activation.is_negative()), ky, kx, 4);
                    code.push_str(&format!("\ttarget = MulAdd({prefix}{letter}{}, MF4x4({}), target);\n", s + 1, join_floats(&values)));
                }
            }
        }
        code.push_str(&format!("\t{output}[gxy] = target;\n"));
        if t + 1 < tpl {
            code.push('\n');
        }
    }
    code.push_str(HIDDEN_EPILOGUE);
    code.push('\n');
}

fn push_last(code: &mut String, model: &Anime4kCnn) {
    let arch = model.arch;
    let tpl = arch.textures_per_layer();
    let k = arch.tail_kernel;
    let stacked: Vec<String> = (arch.stack_start_layer()..arch.block_depth).flat_map(|layer| (0..tpl).map(move |t| conv_texture_name(layer, t))).collect();
    let inputs: Vec<String> = std::iter::once("INPUT".to_string()).chain(stacked.iter().cloned()).collect();

    push_pass_header(
        code,
        arch.block_depth + 1,
        &format!("Conv-4x{k}x{k}x{}, Depth-to-Space", arch.tail_in_channels()),
        &inputs,
        &["OUTPUT".to_string()],
        16,
    );
    code.push_str(LAST_PROLOGUE);

    let sample_name = |input: usize, dx: i32, dy: i32| match (k, offset_letter((dx, dy))) {
        (3, Some(letter)) => format!("g{input}{letter}"),
        _ => format!("g{input}"),
    };

    for (input, texture) in stacked.iter().enumerate() {
        let names: Vec<(String, (i32, i32))> = kernel_offsets(k).iter().map(|&(dx, dy)| (sample_name(input, dx, dy), (dx, dy))).collect();
        push_samples(code, &arch, texture, &names);
    }

    for t in 0..TAIL_OUT_CHANNELS / 4 {
        let target = t + 1;
        code.push_str(&format!("\tMF4 target{target} = MF4({});\n", join_floats(&bias_block(&model.tail_bias, t * 4))));
        for &activation in Activation::for_factor(arch.factor) {
            let prefix = if activation.is_negative() { "n" } else { "" };
            for input in 0..stacked.len() {
                let in_start = arch.tail_in_start(input / tpl, input % tpl, activation.is_negative());
                for &(dx, dy) in kernel_offsets(k) {
                    let (ky, kx) = kernel_position(dx, dy, k).unwrap_or((0, 0));
                    let values = unpack_block(&model.tail_weight, t * 4, in_start, ky, kx, 4);
                    code.push_str(&format!(
                        "\ttarget{target} = MulAdd({prefix}{}, MF4x4({}), target{target});\n",
                        sample_name(input, dx, dy),
                        join_floats(&values)
                    ));
                }
            }
        }
        code.push('\n');
    }
    code.push_str(DEPTH_TO_SPACE_EPILOGUE);
}

/// Renders a model as a MagPie effect
///
/// # Arguments
/// * `model` - Model to render
///
/// # Returns
/// The effect source with its parameter header and one `//!PASS` per layer
///
/// # Errors
/// Returns [`Error::NonFinite`] or a shape error if the model does not validate.
pub fn write_hlsl(model: &Anime4kCnn) -> Result<String> {
    model.validate()?;
    let arch = model.arch;
    let mut code = String::new();

    code.push_str(&format!("// Anime4K_Upscale_CNN_x2_{}\n", model.variant_label()));
    code.push('\n');
    code.push_str("//!MAGPIE EFFECT\n");
    code.push_str("//!VERSION 4\n");
    code.push_str("//!SORT_NAME Anime4K_Upscale\n");
    code.push_str("//!USE MulAdd\n");
    code.push_str("//!CAPABILITY FP16\n");
    code.push('\n');

    push_texture(&mut code, "INPUT", None, None);
    push_texture(&mut code, "OUTPUT", Some(("INPUT_WIDTH * 2", "INPUT_HEIGHT * 2")), None);
    for layer in 0..arch.block_depth {
        for t in 0..arch.textures_per_layer() {
            push_texture(&mut code, &conv_texture_name(layer, t), Some(("INPUT_WIDTH", "INPUT_HEIGHT")), Some("R16G16B16A16_FLOAT"));
        }
    }

    code.push_str("//!SAMPLER\n//!FILTER POINT\nSamplerState sam;\n\n");
    code.push_str("//!SAMPLER\n//!FILTER LINEAR\nSamplerState sam1;\n\n");

    push_head(&mut code, model);
    for mid in 0..model.mid_weights.len() {
        push_hidden(&mut code, model, mid);
    }
    push_last(&mut code, model);

    Ok(code)
}
