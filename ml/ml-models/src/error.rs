//! Error types for ml-models crate.

use thiserror::Error;

/// Errors that can occur in ml-models operations.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Failed to load checkpoint.
    #[error("failed to load checkpoint from {path}: {reason}")]
    LoadCheckpoint {
        /// Path to the checkpoint file.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to save checkpoint.
    #[error("failed to save checkpoint to {path}: {reason}")]
    SaveCheckpoint {
        /// Path to the checkpoint file.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// Invalid model configuration.
    #[error("invalid model configuration: {0}")]
    InvalidConfig(String),

    /// Checkpoint file not found.
    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// Unsupported checkpoint format.
    #[error("unsupported checkpoint format: {0}")]
    UnsupportedFormat(String),

    /// Shape mismatch during inference.
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Expected shape.
        expected: String,
        /// Actual shape.
        actual: String,
    },

    /// Checkpoint parameters do not align with the model.
    #[error("state dict mismatch: {}", summarize(.missing, .unexpected, .mismatched))]
    StateMismatch {
        /// Parameters the model declares but the checkpoint lacks.
        missing: Vec<String>,
        /// Checkpoint entries the model does not declare.
        unexpected: Vec<String>,
        /// Entries present on both sides with different shape or dtype.
        mismatched: Vec<String>,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Number of names listed per category in a state mismatch message.
const LISTED_NAMES: usize = 5;

fn summarize(missing: &[String], unexpected: &[String], mismatched: &[String]) -> String {
    let mut parts = Vec::new();
    for (label, names) in [
        ("missing", missing),
        ("unexpected", unexpected),
        ("mismatched", mismatched),
    ] {
        if names.is_empty() {
            continue;
        }
        let mut listed = names
            .iter()
            .take(LISTED_NAMES)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        if names.len() > LISTED_NAMES {
            listed.push_str(&format!(", ... ({} more)", names.len() - LISTED_NAMES));
        }
        parts.push(format!("{} {label} [{listed}]", names.len()));
    }
    parts.join("; ")
}

impl ModelError {
    /// Creates a load checkpoint error.
    #[must_use]
    pub fn load_checkpoint(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LoadCheckpoint {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a save checkpoint error.
    #[must_use]
    pub fn save_checkpoint(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SaveCheckpoint {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid config error.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }

    /// Creates a checkpoint not found error.
    #[must_use]
    pub fn checkpoint_not_found(path: impl Into<String>) -> Self {
        Self::CheckpointNotFound(path.into())
    }

    /// Creates an unsupported format error.
    #[must_use]
    pub fn unsupported_format(format: impl Into<String>) -> Self {
        Self::UnsupportedFormat(format.into())
    }

    /// Creates a shape mismatch error.
    #[must_use]
    pub fn shape_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates a state mismatch error.
    #[must_use]
    pub const fn state_mismatch(
        missing: Vec<String>,
        unexpected: Vec<String>,
        mismatched: Vec<String>,
    ) -> Self {
        Self::StateMismatch {
            missing,
            unexpected,
            mismatched,
        }
    }

    /// Creates an IO error.
    #[must_use]
    pub fn io(reason: impl Into<String>) -> Self {
        Self::Io(reason.into())
    }

    /// Creates a serialization error.
    #[must_use]
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization(reason.into())
    }
}

impl From<std::io::Error> for ModelError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for ml-models operations.
pub type Result<T> = std::result::Result<T, ModelError>;
