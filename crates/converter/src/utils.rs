//! Numeric and naming helpers shared by every format
//!
//! This module fixes the conventions all readers and writers agree on:
//! how a float literal is printed, how a 4xN literal block maps onto a weight
//! tensor, the enumeration order of the nine 3x3 kernel offsets, and the
//! intermediate texture names used by the shader-hook formats.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::ir::{Architecture, Tensor4};

/// Significant digits tried before giving up on a short representation
const MAX_SHORT_DIGITS: usize = 12;
/// Significant digits of the fallback representation (always round-trips for f32)
const FALLBACK_DIGITS: usize = 9;

/// The nine 3x3 kernel offsets `(dx, dy)` in emission order
///
/// An offset `(dx, dy)` addresses kernel position `ky = dx + 1`, `kx = dy + 1`
/// in every format. The order also determines the letter names of the MagPie
/// samples, so it must never change.
pub const SPATIAL_OFFSETS_3X3: [(i32, i32); 9] = [(-1, -1), (-1, 0), (-1, 1), (0, -1), (0, 0), (0, 1), (1, -1), (1, 0), (1, 1)];

/// Letter names of the nine spatial samples in MagPie effects, with their offsets
pub const LETTER_OFFSETS: [(char, (i32, i32)); 9] = [
    ('a', (-1, -1)),
    ('b', (-1, 0)),
    ('c', (-1, 1)),
    ('d', (0, -1)),
    ('e', (0, 0)),
    ('f', (0, 1)),
    ('g', (1, -1)),
    ('h', (1, 0)),
    ('i', (1, 1)),
];

/// Known architecture presets keyed by `(block_depth, n_stack, num_feat)`
const KNOWN_VARIANTS: [((usize, usize, usize), &str); 5] = [((7, 5, 12), "UL"), ((7, 5, 8), "VL"), ((5, 5, 8), "L"), ((5, 3, 8), "M"), ((3, 3, 8), "S")];

static RE_LITERAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?$").unwrap());

/// Formats a float as the shortest decimal literal that reparses to the same f32
///
/// Significant-digit counts are tried in increasing order using `%g` style
/// formatting. The result always contains a `.` or an exponent so that it is a
/// valid floating literal in GLSL and HLSL.
///
/// Non-finite values have no literal form in any target language and are
/// returned as Rust prints them; writers reject them before formatting.
pub fn format_float(value: f32) -> String {
    if !value.is_finite() {
        return value.to_string();
    }

    for digits in 1..=MAX_SHORT_DIGITS {
        let candidate = format_general(value, digits);
        if candidate.parse::<f32>().is_ok_and(|parsed| parsed.to_bits() == value.to_bits()) {
            return with_float_marker(candidate);
        }
    }

    with_float_marker(format_general(value, FALLBACK_DIGITS))
}

/// `%g`-style formatting with `digits` significant digits
fn format_general(value: f32, digits: usize) -> String {
    let scientific = format!("{:.*e}", digits - 1, value);
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return scientific;
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= digits as i32 {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{sign}{:02}", strip_trailing_zeros(mantissa), exponent.unsigned_abs())
    } else {
        let decimals = (digits as i32 - 1 - exponent) as usize;
        strip_trailing_zeros(&format!("{value:.decimals$}")).to_string()
    }
}

fn strip_trailing_zeros(text: &str) -> &str {
    if text.contains('.') { text.trim_end_matches('0').trim_end_matches('.') } else { text }
}

fn with_float_marker(mut text: String) -> String {
    if !text.contains('.') && !text.contains('e') {
        text.push_str(".0");
    }
    text
}

/// Parses a comma-separated list of float literals
///
/// Every element must be a signed decimal with optional exponent, and the
/// list must contain exactly `expected` values.
pub fn parse_float_list(text: &str, expected: usize) -> Result<Vec<f32>> {
    let values = text
        .split(',')
        .map(str::trim)
        .map(|literal| {
            if !RE_LITERAL.is_match(literal) {
                return Err(Error::InvalidLiteral(format!("'{literal}' is not a float literal")));
            }
            literal.parse::<f32>().map_err(|e| Error::InvalidLiteral(format!("'{literal}': {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    if values.len() != expected {
        return Err(Error::InvalidLiteral(format!("expected {expected} values, found {}", values.len())));
    }
    Ok(values)
}

/// Yields `(value_index, out_channel, in_channel)` for a 4xN literal block
///
/// `values[col * 4 + row]` belongs to `weight[out_start + row, in_start + col]`.
fn block_positions(out_start: usize, in_start: usize, n_in: usize) -> impl Iterator<Item = (usize, usize, usize)> {
    (0..n_in).flat_map(move |col| (0..4).map(move |row| (col * 4 + row, out_start + row, in_start + col)))
}

/// Writes a flat literal block into `weight` at kernel position `(ky, kx)`
///
/// `values` holds 16 values for `mat4`/`MF4x4` blocks or 12 for `MF3x4` blocks;
/// the layout is `values[col * 4 + row] = weight[out_start + row, in_start + col, ky, kx]`
/// for column-major GLSL and row-major HLSL alike. Slots outside the tensor are
/// dropped. Returns the number of slots written.
pub fn pack_block(values: &[f32], weight: &mut Tensor4, out_start: usize, in_start: usize, ky: usize, kx: usize) -> usize {
    let n_in = values.len() / 4;
    block_positions(out_start, in_start, n_in)
        .filter(|&(index, out_ch, in_ch)| weight.set([out_ch, in_ch, ky, kx], values[index]))
        .count()
}

/// Reads a flat literal block out of `weight`, the inverse of [`pack_block`]
///
/// Slots outside the tensor read as zero.
pub fn unpack_block(weight: &Tensor4, out_start: usize, in_start: usize, ky: usize, kx: usize, n_in: usize) -> Vec<f32> {
    block_positions(out_start, in_start, n_in)
        .map(|(_, out_ch, in_ch)| weight.get([out_ch, in_ch, ky, kx]).unwrap_or(0.0))
        .collect()
}

/// Marks the slots a [`pack_block`] call with the same arguments writes
pub(crate) fn mark_block(written: &mut [bool], weight: &Tensor4, n_values: usize, out_start: usize, in_start: usize, ky: usize, kx: usize) {
    for (_, out_ch, in_ch) in block_positions(out_start, in_start, n_values / 4) {
        if let Some(offset) = weight.offset([out_ch, in_ch, ky, kx]) {
            written[offset] = true;
        }
    }
}

/// Four bias values starting at `out_start`, zero past the end
pub fn bias_block(bias: &[f32], out_start: usize) -> [f32; 4] {
    std::array::from_fn(|i| bias.get(out_start + i).copied().unwrap_or(0.0))
}

/// Joins values with `", "` using [`format_float`]
pub fn join_floats(values: &[f32]) -> String {
    values.iter().map(|&v| format_float(v)).collect::<Vec<_>>().join(", ")
}

/// Maps a spatial offset to its kernel position for a kernel of `size`
///
/// Pointwise kernels only accept the zero offset.
pub fn kernel_position(dx: i32, dy: i32, size: usize) -> Option<(usize, usize)> {
    let half = (size / 2) as i32;
    if dx.abs() > half || dy.abs() > half {
        return None;
    }
    Some(((dx + half) as usize, (dy + half) as usize))
}

/// Spatial offsets covered by a kernel of `size` (1 or 3), in emission order
pub fn kernel_offsets(size: usize) -> &'static [(i32, i32)] {
    if size == 1 { &[(0, 0)] } else { &SPATIAL_OFFSETS_3X3 }
}

/// Looks up the offset of a MagPie sample letter
pub fn letter_offset(letter: char) -> Option<(i32, i32)> {
    LETTER_OFFSETS.iter().find(|(l, _)| *l == letter).map(|(_, offset)| *offset)
}

/// Looks up the letter of a spatial offset
pub fn offset_letter(offset: (i32, i32)) -> Option<char> {
    LETTER_OFFSETS.iter().find(|(_, o)| *o == offset).map(|(l, _)| *l)
}

fn texture_suffix(sub: usize) -> String {
    if sub == 0 { "_tf".to_string() } else { format!("_tf{sub}") }
}

/// Name of the `sub`-th output texture of conv layer `layer`
///
/// Layer 0 yields `conv2d_tf`, `conv2d_tf1`, ...; layer 2 yields `conv2d_2_tf`, ...
pub fn conv_texture_name(layer: usize, sub: usize) -> String {
    if layer == 0 {
        format!("conv2d{}", texture_suffix(sub))
    } else {
        format!("conv2d_{layer}{}", texture_suffix(sub))
    }
}

/// Name of the `sub`-th aggregation output texture (`conv2d_last_tf`, ...)
pub fn last_texture_name(sub: usize) -> String {
    format!("conv2d_last{}", texture_suffix(sub))
}

/// Returns the canonical short name of a known architecture preset
///
/// Unknown combinations produce `d{block_depth}_s{n_stack}_f{num_feat}`.
pub fn variant_label(arch: &Architecture) -> String {
    let key = (arch.block_depth, arch.n_stack, arch.num_feat);
    KNOWN_VARIANTS
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, label)| label.to_string())
        .unwrap_or_else(|| format!("d{}_s{}_f{}", arch.block_depth, arch.n_stack, arch.num_feat))
}
