//! Model file formats and the dispatcher between them
//!
//! Checkpoints ([`checkpoint`], [`pth`]) store named tensors. The shader
//! formats ([`comp`], [`mpv`], [`magpie`]) carry no architecture
//! metadata, so each one implements [`ShaderDialect`]: the split into pass
//! records, the inference of hyperparameters, and the weight extraction are
//! separate steps.

pub mod checkpoint;
pub mod comp;
pub mod magpie;
pub mod mpv;
pub mod pth;

use std::fmt;
use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::ir::{Anime4kCnn, Architecture};

/// Include path written into compute shaders when none is configured
pub const DEFAULT_DESCRIPTOR_INCLUDE: &str = "../../descriptor_set.h";

/// A generated shader format that can be parsed back into a model
///
/// Parsing runs in three steps so that each can fail with its own error:
/// [`split_passes`](Self::split_passes) reads directives and body lines,
/// [`sniff_architecture`](Self::sniff_architecture) infers the topology from
/// the pass structure alone, and [`extract_weights`](Self::extract_weights)
/// fills every tensor slot from the literals.
pub trait ShaderDialect {
    /// Structured record of one pass (or pass group)
    type Pass;

    /// Format name used in log messages
    const NAME: &'static str;

    /// Splits the source into pass records, reading directives and body lines
    fn split_passes(source: &str) -> Result<Vec<Self::Pass>>;

    /// Infers the hyperparameters from the pass structure alone
    fn sniff_architecture(passes: &[Self::Pass]) -> Result<Architecture>;

    /// Fills every weight and bias of a model with the given architecture
    fn extract_weights(passes: &[Self::Pass], arch: Architecture) -> Result<Anime4kCnn>;

    /// Parses a complete shader
    ///
    /// # Arguments
    /// * `source` - Full shader text, including any preamble before the first pass
    ///
    /// # Returns
    /// The model with the sniffed architecture and every weight filled
    ///
    /// # Errors
    /// Returns [`Error::MissingDirective`] or [`Error::StructuralMismatch`] when the
    /// pass structure is not an Anime4K CNN, [`Error::UnexpectedLine`] for a body
    /// line that matches no construct, and [`Error::MissingWeights`] when a
    /// tensor slot has no literal.
    fn parse(source: &str) -> Result<Anime4kCnn> {
        let passes = Self::split_passes(source)?;
        debug!("{}: {} pass records", Self::NAME, passes.len());
        let arch = Self::sniff_architecture(&passes)?;
        debug!("{}: sniffed architecture {arch}", Self::NAME);
        Self::extract_weights(&passes, arch)
    }
}

/// How a sampled texture value is activated before a weight block is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Activation {
    /// Raw input, used by the head
    Identity,
    /// `max(x, 0)`
    Positive,
    /// `max(-x, 0)`, the second CReLU half
    Negative,
}

impl Activation {
    /// Activations applied to a conv output by the next layer
    pub(crate) fn for_factor(factor: usize) -> &'static [Activation] {
        if factor == 2 { &[Activation::Positive, Activation::Negative] } else { &[Activation::Positive] }
    }

    pub(crate) fn is_negative(self) -> bool {
        self == Activation::Negative
    }
}

/// Role of a conv pass, deciding how its inputs map onto weight channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConvRole {
    /// Reads the RGB input
    Head,
    /// Reads the previous layer
    Mid,
    /// Reads the stacked layer outputs
    Aggregation,
}

/// Options that affect writers only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOptions {
    /// Path of the descriptor-set header included by compute shaders
    pub descriptor_include: String,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            descriptor_include: DEFAULT_DESCRIPTOR_INCLUDE.to_string(),
        }
    }
}

/// A supported model file format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// PyTorch `torch.save` checkpoint
    Pth,
    /// safetensors checkpoint
    Safetensors,
    /// JSON dump of a state dict (read only)
    StateDictJson,
    /// Vulkan compute shader
    Comp,
    /// mpv GLSL shader hook
    Glsl,
    /// MagPie HLSL effect
    Hlsl,
}

impl Format {
    /// Every format, in detection order
    pub const ALL: [Format; 6] = [Format::Pth, Format::Safetensors, Format::StateDictJson, Format::Comp, Format::Glsl, Format::Hlsl];

    /// Picks the format from a path's extension, ignoring case
    pub fn detect(path: &Path) -> Result<Self> {
        let extension = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
        extension
            .and_then(|ext| Self::ALL.into_iter().find(|format| format.extension().trim_start_matches('.') == ext))
            .ok_or_else(|| Error::UnknownFormat(path.to_path_buf()))
    }

    /// Canonical extension including the dot
    pub fn extension(self) -> &'static str {
        match self {
            Format::Pth => ".pth",
            Format::Safetensors => ".safetensors",
            Format::StateDictJson => ".json",
            Format::Comp => ".comp",
            Format::Glsl => ".glsl",
            Format::Hlsl => ".hlsl",
        }
    }

    /// Short human-readable name
    pub fn name(self) -> &'static str {
        match self {
            Format::Pth => "PyTorch checkpoint",
            Format::Safetensors => "safetensors checkpoint",
            Format::StateDictJson => "JSON state dict",
            Format::Comp => "Vulkan compute shader",
            Format::Glsl => "mpv GLSL hook",
            Format::Hlsl => "MagPie HLSL effect",
        }
    }

    /// Whether a writer exists for this format
    pub fn is_writable(self) -> bool {
        !matches!(self, Format::StateDictJson)
    }

    /// Fails with [`Error::ReadOnlyFormat`] unless the format can be written
    pub fn ensure_writable(self) -> Result<()> {
        if self.is_writable() { Ok(()) } else { Err(Error::ReadOnlyFormat(self.extension())) }
    }

    /// Decodes a model from file contents
    ///
    /// # Errors
    /// Returns the container error of a checkpoint format, or any
    /// [`ShaderDialect::parse`] error of a shader format. Shader bytes that
    /// are not UTF-8 are a [`Error::StructuralMismatch`].
    pub fn decode(self, bytes: &[u8]) -> Result<Anime4kCnn> {
        match self {
            Format::Pth => pth::read_pth(bytes),
            Format::Safetensors => checkpoint::read_safetensors(bytes),
            Format::StateDictJson => checkpoint::read_state_dict_json(text(bytes)?),
            Format::Comp => comp::CompShader::parse(text(bytes)?),
            Format::Glsl => mpv::MpvShader::parse(text(bytes)?),
            Format::Hlsl => magpie::MagpieShader::parse(text(bytes)?),
        }
    }

    /// Renders a model into file contents
    ///
    /// # Errors
    /// Returns [`Error::ReadOnlyFormat`] for `.json` and [`Error::NonFinite`]
    /// when the model holds a NaN or infinity.
    pub fn encode(self, model: &Anime4kCnn, options: &WriteOptions) -> Result<Vec<u8>> {
        self.ensure_writable()?;
        let bytes = match self {
            Format::Pth => pth::write_pth(model)?,
            Format::Safetensors => checkpoint::write_safetensors(model)?,
            Format::Comp => comp::write_comp(model, &options.descriptor_include)?.into_bytes(),
            Format::Glsl => mpv::write_glsl(model)?.into_bytes(),
            Format::Hlsl => magpie::write_hlsl(model)?.into_bytes(),
            Format::StateDictJson => return Err(Error::ReadOnlyFormat(self.extension())),
        };
        Ok(bytes)
    }

    /// Reads and decodes a model file
    ///
    /// # Arguments
    /// * `path` - File to read, in this format
    ///
    /// # Returns
    /// The decoded model
    ///
    /// # Errors
    /// Returns [`Error::Read`] if the file cannot be read, otherwise any
    /// error of [`Format::decode`].
    pub fn read(self, path: &Path) -> Result<Anime4kCnn> {
        let bytes = fs::read(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let model = self.decode(&bytes)?;
        info!("Read {} from {} ({})", self.name(), path.display(), model.variant_label());
        Ok(model)
    }

    /// Renders a model fully in memory, then writes it with a single call
    ///
    /// # Arguments
    /// * `model` - Model to write
    /// * `path` - Destination file, created or truncated
    /// * `options` - Writer settings such as the compute-shader include path
    ///
    /// # Errors
    /// Returns any error of [`Format::encode`], in which case nothing is
    /// written, or [`Error::Write`] if the file cannot be written.
    pub fn write(self, model: &Anime4kCnn, path: &Path, options: &WriteOptions) -> Result<()> {
        let bytes = self.encode(model, options)?;
        fs::write(path, &bytes).map_err(|source| Error::Write {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Wrote {} to {} ({} bytes)", self.name(), path.display(), bytes.len());
        Ok(())
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

fn text(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|e| Error::mismatch(format!("shader source is not valid UTF-8: {e}")))
}

/// A model read from its input, with the output format already validated
#[derive(Debug, Clone)]
pub struct Conversion {
    /// Detected input format
    pub input_format: Format,
    /// Detected output format
    pub output_format: Format,
    /// The model that was read
    pub model: Anime4kCnn,
}

impl Conversion {
    /// Detects both formats and reads the input
    ///
    /// Both formats are checked before any file is read, so an unsupported
    /// output fails without touching the file system.
    ///
    /// # Arguments
    /// * `input` - Model to read, format chosen by extension
    /// * `output` - Destination path, only its extension is inspected here
    ///
    /// # Errors
    /// Returns [`Error::UnknownFormat`] for an unrecognized extension,
    /// [`Error::ReadOnlyFormat`] for a `.json` output, and any error of
    /// [`Format::read`].
    pub fn read(input: &Path, output: &Path) -> Result<Self> {
        let input_format = Format::detect(input)?;
        let output_format = Format::detect(output)?;
        output_format.ensure_writable()?;

        let model = input_format.read(input)?;
        debug!("Read {input_format} model, writing {output_format}");
        Ok(Self {
            input_format,
            output_format,
            model,
        })
    }

    /// Writes the model in the output format
    ///
    /// # Errors
    /// Returns any error of [`Format::write`].
    pub fn write(&self, output: &Path, options: &WriteOptions) -> Result<()> {
        self.output_format.write(&self.model, output, options)
    }
}

/// Converts `input` into `output`, choosing both formats from their extensions
///
/// Equivalent to [`Conversion::read`] followed by [`Conversion::write`].
///
/// # Arguments
/// * `input` - Model to read
/// * `output` - File to write
/// * `options` - Writer settings
///
/// # Returns
/// The detected formats and the converted model
///
/// # Errors
/// Returns any error of [`Conversion::read`] or [`Conversion::write`]. An
/// unsupported output is reported before the input is read.
pub fn convert_file(input: &Path, output: &Path, options: &WriteOptions) -> Result<Conversion> {
    let conversion = Conversion::read(input, output)?;
    conversion.write(output, options)?;
    Ok(conversion)
}
