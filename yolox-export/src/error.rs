//! Error types for yolox-export.

use ml_models::ModelError;
use ml_onnx::OnnxError;
use thiserror::Error;

/// Errors that can occur while exporting a model.
#[derive(Debug, Error)]
pub enum ExportError {
    /// A required input file does not exist.
    #[error("Invalid {kind} file: {path}")]
    InvalidInput {
        /// Which input: `weights` or `exp`.
        kind: &'static str,
        /// Path as given.
        path: String,
    },

    /// The weights path has no usable base name.
    #[error("cannot derive an output name from {0}")]
    InvalidFileName(String),

    /// Model construction, checkpoint loading or output adaptation failed.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Tracing or writing the graph failed.
    #[error(transparent)]
    Export(#[from] OnnxError),

    /// The simplifier or its validity check failed.
    #[error(transparent)]
    Simplification(OnnxError),
}

impl ExportError {
    /// Creates an invalid weights file error.
    #[must_use]
    pub fn invalid_weights(path: impl Into<String>) -> Self {
        Self::InvalidInput {
            kind: "weights",
            path: path.into(),
        }
    }

    /// Creates an invalid exp file error.
    #[must_use]
    pub fn invalid_exp(path: impl Into<String>) -> Self {
        Self::InvalidInput {
            kind: "exp",
            path: path.into(),
        }
    }

    /// Creates an invalid file name error.
    #[must_use]
    pub fn invalid_file_name(path: impl Into<String>) -> Self {
        Self::InvalidFileName(path.into())
    }
}

/// Result type for yolox-export operations.
pub type Result<T> = std::result::Result<T, ExportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_input_messages() {
        assert_eq!(
            ExportError::invalid_weights("model.pt").to_string(),
            "Invalid weights file: model.pt"
        );
        assert_eq!(
            ExportError::invalid_exp("exp.json").to_string(),
            "Invalid exp file: exp.json"
        );
    }

    #[test]
    fn model_errors_pass_through() {
        let err: ExportError = ModelError::invalid_config("bad width").into();
        assert_eq!(err.to_string(), "invalid model configuration: bad width");
    }

    #[test]
    fn simplification_keeps_message() {
        let err = ExportError::Simplification(OnnxError::simplification("signature changed"));
        assert_eq!(
            err.to_string(),
            OnnxError::simplification("signature changed").to_string()
        );
    }
}
