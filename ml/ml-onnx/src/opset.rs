//! Operator set versions.

use crate::error::{OnnxError, Result};

/// Lowest opset the tracer emits.
pub const MIN_OPSET: u32 = 11;

/// Highest opset the tracer emits.
pub const MAX_OPSET: u32 = 19;

/// Opset used when none is requested.
pub const DEFAULT_OPSET: u32 = 11;

/// A validated default-domain opset version.
///
/// # Example
///
/// ```
/// use ml_onnx::Opset;
///
/// let opset = Opset::new(13).unwrap_or_default();
/// assert_eq!(opset.ir_version(), 7);
/// assert!(Opset::new(9).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Opset(u32);

impl Opset {
    /// Validates an opset version.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::UnsupportedOpset` outside `MIN_OPSET..=MAX_OPSET`.
    pub fn new(version: u32) -> Result<Self> {
        if version < MIN_OPSET || version > MAX_OPSET {
            return Err(OnnxError::UnsupportedOpset {
                version,
                min: MIN_OPSET,
                max: MAX_OPSET,
            });
        }
        Ok(Self(version))
    }

    /// Returns the version number.
    #[must_use]
    pub const fn version(self) -> u32 {
        self.0
    }

    /// Returns the IR version written alongside this opset.
    #[must_use]
    pub const fn ir_version(self) -> i64 {
        match self.0 {
            0..=11 => 6,
            12..=14 => 7,
            15..=18 => 8,
            _ => 9,
        }
    }

    /// `ReduceMax` takes `axes` as an input instead of an attribute.
    #[must_use]
    pub const fn reduce_axes_as_input(self) -> bool {
        self.0 >= 18
    }

    /// `ArgMax` accepts the `select_last_index` attribute.
    #[must_use]
    pub const fn has_select_last_index(self) -> bool {
        self.0 >= 12
    }
}

impl Default for Opset {
    fn default() -> Self {
        Self(DEFAULT_OPSET)
    }
}

impl std::fmt::Display for Opset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "opset {}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_range() {
        for v in MIN_OPSET..=MAX_OPSET {
            assert!(Opset::new(v).is_ok(), "opset {v} should be supported");
        }
        assert!(Opset::new(10).is_err());
        assert!(Opset::new(20).is_err());
    }

    #[test]
    fn default_is_eleven() {
        assert_eq!(Opset::default().version(), 11);
    }

    #[test]
    fn ir_versions() {
        let ir = |v| Opset::new(v).map(Opset::ir_version).unwrap_or_default();
        assert_eq!(ir(11), 6);
        assert_eq!(ir(12), 7);
        assert_eq!(ir(14), 7);
        assert_eq!(ir(15), 8);
        assert_eq!(ir(18), 8);
        assert_eq!(ir(19), 9);
    }

    #[test]
    fn reduce_axes_switch() {
        assert!(!Opset::new(17).unwrap_or_default().reduce_axes_as_input());
        assert!(Opset::new(18).unwrap_or_default().reduce_axes_as_input());
    }

    #[test]
    fn display() {
        assert_eq!(Opset::default().to_string(), "opset 11");
    }
}
