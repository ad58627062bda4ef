//! Anime4K CNN model converter
//!
//! Converts Anime4K x2 upscaling CNNs between training checkpoints
//! (`.pth`, `.safetensors`, JSON state dicts) and the generated shader formats:
//! Vulkan compute shaders (`.comp`), mpv hooks (`.glsl`) and MagPie effects
//! (`.hlsl`). Every format is read into an [`Anime4kCnn`] and written back
//! out from it.

pub mod error;
pub mod formats;
pub mod ir;
pub mod utils;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use formats::{Conversion, Format, WriteOptions, convert_file};
pub use ir::{Anime4kCnn, Architecture, Tensor4};
