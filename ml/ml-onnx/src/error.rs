//! Error types for ml-onnx crate.

use thiserror::Error;

/// Errors that can occur while tracing, reading, checking or simplifying ONNX graphs.
#[derive(Debug, Error)]
pub enum OnnxError {
    /// Requested opset is outside the supported range.
    #[error("unsupported opset {version}: supported range is {min}..={max}")]
    UnsupportedOpset {
        /// Requested opset version.
        version: u32,
        /// Lowest supported version.
        min: u32,
        /// Highest supported version.
        max: u32,
    },

    /// An operation has no ONNX equivalent.
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),

    /// Operand shapes are incompatible with the operator.
    #[error("shape mismatch in {op}: {detail}")]
    ShapeMismatch {
        /// Operator being traced.
        op: String,
        /// Description of the incompatibility.
        detail: String,
    },

    /// Initializer payload does not match its declared dimensions or type.
    #[error("invalid initializer {name}: {reason}")]
    InvalidInitializer {
        /// Initializer name.
        name: String,
        /// Reason for rejection.
        reason: String,
    },

    /// Two values share one name.
    #[error("duplicate value name: {0}")]
    DuplicateName(String),

    /// Graph violates a structural rule.
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    /// Simplifier failed or produced an invalid graph.
    #[error("simplification failed: {0}")]
    Simplification(String),

    /// Tracer was used incorrectly.
    #[error("trace failed: {0}")]
    Trace(String),

    /// Protobuf payload could not be decoded.
    #[error("failed to decode ONNX model: {0}")]
    Decode(#[from] prost::DecodeError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OnnxError {
    /// Creates an unsupported operator error.
    #[must_use]
    pub fn unsupported_operator(op: impl Into<String>) -> Self {
        Self::UnsupportedOperator(op.into())
    }

    /// Creates a shape mismatch error.
    #[must_use]
    pub fn shape_mismatch(op: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            op: op.into(),
            detail: detail.into(),
        }
    }

    /// Creates an invalid initializer error.
    #[must_use]
    pub fn invalid_initializer(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInitializer {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a duplicate name error.
    #[must_use]
    pub fn duplicate_name(name: impl Into<String>) -> Self {
        Self::DuplicateName(name.into())
    }

    /// Creates an invalid graph error.
    #[must_use]
    pub fn invalid_graph(reason: impl Into<String>) -> Self {
        Self::InvalidGraph(reason.into())
    }

    /// Creates a simplification error.
    #[must_use]
    pub fn simplification(reason: impl Into<String>) -> Self {
        Self::Simplification(reason.into())
    }

    /// Creates a trace error.
    #[must_use]
    pub fn trace(reason: impl Into<String>) -> Self {
        Self::Trace(reason.into())
    }
}

/// Result type for ml-onnx operations.
pub type Result<T> = std::result::Result<T, OnnxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_unsupported_opset() {
        let err = OnnxError::UnsupportedOpset {
            version: 7,
            min: 11,
            max: 19,
        };
        let msg = err.to_string();
        assert!(msg.contains('7'));
        assert!(msg.contains("11..=19"));
    }

    #[test]
    fn error_unsupported_operator() {
        let err = OnnxError::unsupported_operator("SiLU");
        assert!(err.to_string().contains("SiLU"));
    }

    #[test]
    fn error_shape_mismatch() {
        let err = OnnxError::shape_mismatch("Conv", "expected rank 4, got 3");
        assert!(err.to_string().contains("Conv"));
        assert!(err.to_string().contains("rank 4"));
    }

    #[test]
    fn error_invalid_initializer() {
        let err = OnnxError::invalid_initializer("conv.weight", "12 values for 16 elements");
        assert!(err.to_string().contains("conv.weight"));
    }

    #[test]
    fn error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err: OnnxError = io_err.into();
        assert!(matches!(err, OnnxError::Io(_)));
    }

    #[test]
    fn error_from_decode_error() {
        let bytes = [0xff_u8, 0xff, 0xff];
        let decoded = <crate::proto::ModelProto as prost::Message>::decode(&bytes[..]);
        let err: OnnxError = match decoded {
            Err(e) => e.into(),
            Ok(_) => return,
        };
        assert!(err.to_string().contains("decode"));
    }
}
