//! Error types shared by every reader and writer

use std::path::PathBuf;

/// Errors produced while reading, converting or writing a model
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The file extension does not name a supported format
    #[error("Unknown format for '{}'", .0.display())]
    UnknownFormat(PathBuf),
    /// The format can be read but has no writer
    #[error("Format '{0}' is read-only and cannot be used as an output")]
    ReadOnlyFormat(&'static str),
    /// No checkpoint tensor matched a required name fragment
    #[error("No tensor matching '{0}'")]
    MissingTensor(String),
    /// More than one checkpoint tensor matched a name fragment
    #[error("Tensor fragment '{fragment}' matches {} keys: {}", .keys.len(), .keys.join(", "))]
    AmbiguousTensor {
        /// The fragment that was looked up
        fragment: String,
        /// Every key that matched it
        keys: Vec<String>,
    },
    /// A shader lacks a directive or pass the format requires
    #[error("Missing directive: {0}")]
    MissingDirective(String),
    /// Inferred hyperparameters or tensor shapes are inconsistent
    #[error("Structural mismatch: {0}")]
    StructuralMismatch(String),
    /// Parsing finished without a literal for some weight or bias slots
    #[error("{tensor}: {missing} expected weight literals were not found")]
    MissingWeights {
        /// Tensor label, e.g. `mid[2].weight`
        tensor: String,
        /// Number of slots that were never written
        missing: usize,
    },
    /// A pass body contains a line that matches no known construct
    #[error("Unexpected line in {pass}: {line}")]
    UnexpectedLine {
        /// Pass description
        pass: String,
        /// The offending line, trimmed
        line: String,
    },
    /// A weight literal list is malformed or has the wrong length
    #[error("Invalid literal list: {0}")]
    InvalidLiteral(String),
    /// A tensor holds NaN or infinity, which no shader format can express
    #[error("Non-finite value in {0}")]
    NonFinite(String),
    /// A checkpoint tensor has a dtype that cannot be converted to f32
    #[error("Unsupported dtype {dtype} for tensor '{name}'")]
    UnsupportedDtype {
        /// Tensor name
        name: String,
        /// Dtype as reported by the container
        dtype: String,
    },
    /// Reading the input failed
    #[error("Failed to read '{}': {source}", .path.display())]
    Read {
        /// Input path
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },
    /// Writing the output failed
    #[error("Failed to write '{}': {source}", .path.display())]
    Write {
        /// Output path
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },
    /// The safetensors container is malformed
    #[error(transparent)]
    SafeTensors(#[from] safetensors::SafeTensorError),
    /// The JSON state dict is malformed
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// The `.pth` zip archive is malformed
    #[error("Invalid checkpoint archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    /// The pickle inside a `.pth` archive cannot be loaded
    #[error("Unsupported pickle: {0}")]
    Pickle(String),
}

/// Result alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn mismatch(message: impl Into<String>) -> Self {
        Self::StructuralMismatch(message.into())
    }

    pub(crate) fn unexpected_line(pass: &str, line: &str) -> Self {
        Self::UnexpectedLine {
            pass: pass.to_string(),
            line: line.trim().to_string(),
        }
    }
}
