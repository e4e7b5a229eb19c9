//! Experiment definitions.
//!
//! An experiment names a YOLOX variant and its dataset-specific settings. It is
//! read from a small JSON document; every field is optional and explicit
//! fields override the selected preset:
//!
//! ```json
//! { "preset": "yolox-s", "num_classes": 3, "input_size": [640, 384] }
//! ```

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::activation::Activation;
use crate::blocks::scale_channels;
use crate::error::{ModelError, Result};
use crate::yolox::{PRIOR_PROB, Yolox};

/// Required divisor of both input dimensions.
pub const INPUT_ALIGNMENT: usize = 32;

/// Published YOLOX model sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Preset {
    /// 0.33 depth, 0.25 width, depthwise convolutions, 416 input.
    YoloxNano,
    /// 0.33 depth, 0.375 width, 416 input.
    YoloxTiny,
    /// 0.33 depth, 0.50 width.
    YoloxS,
    /// 0.67 depth, 0.75 width.
    YoloxM,
    /// 1.0 depth, 1.0 width.
    YoloxL,
    /// 1.33 depth, 1.25 width.
    YoloxX,
}

impl Preset {
    /// All presets, smallest first.
    pub const ALL: [Self; 6] = [
        Self::YoloxNano,
        Self::YoloxTiny,
        Self::YoloxS,
        Self::YoloxM,
        Self::YoloxL,
        Self::YoloxX,
    ];

    /// Experiment name used by the reference training code.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::YoloxNano => "yolox-nano",
            Self::YoloxTiny => "yolox-tiny",
            Self::YoloxS => "yolox-s",
            Self::YoloxM => "yolox-m",
            Self::YoloxL => "yolox-l",
            Self::YoloxX => "yolox-x",
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Network input size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputResolution {
    /// Image width.
    pub width: usize,
    /// Image height.
    pub height: usize,
}

impl InputResolution {
    /// NCHW shape of a single-image batch.
    #[must_use]
    pub const fn batch_shape(&self) -> [usize; 4] {
        [1, 3, self.height, self.width]
    }
}

/// Fields as written in an experiment file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExperimentFile {
    preset: Option<Preset>,
    exp_name: Option<String>,
    depth: Option<f64>,
    width: Option<f64>,
    num_classes: Option<usize>,
    input_size: Option<[usize; 2]>,
    depthwise: Option<bool>,
    act: Option<String>,
}

/// Resolved experiment: everything needed to build the model.
///
/// # Example
///
/// ```
/// use ml_models::{Experiment, Preset};
///
/// let exp = Experiment::preset(Preset::YoloxS);
/// assert_eq!(exp.width, 0.5);
/// assert_eq!(exp.input_resolution().batch_shape(), [1, 3, 640, 640]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    /// Experiment name.
    pub exp_name: String,

    /// Depth multiplier.
    pub depth: f64,

    /// Width multiplier.
    pub width: f64,

    /// Number of object classes.
    pub num_classes: usize,

    /// Input size as `[width, height]`.
    pub input_size: [usize; 2],

    /// Use depthwise-separable convolutions.
    pub depthwise: bool,

    /// Activation name: `silu`, `relu` or `lrelu`.
    pub act: String,
}

impl Default for Experiment {
    fn default() -> Self {
        Self {
            exp_name: "yolox".to_string(),
            depth: 1.0,
            width: 1.0,
            num_classes: 80,
            input_size: [640, 640],
            depthwise: false,
            act: "silu".to_string(),
        }
    }
}

impl Experiment {
    /// Settings of a published model size.
    #[must_use]
    pub fn preset(preset: Preset) -> Self {
        let (depth, width) = match preset {
            Preset::YoloxNano => (0.33, 0.25),
            Preset::YoloxTiny => (0.33, 0.375),
            Preset::YoloxS => (0.33, 0.50),
            Preset::YoloxM => (0.67, 0.75),
            Preset::YoloxL => (1.0, 1.0),
            Preset::YoloxX => (1.33, 1.25),
        };
        let input_size = match preset {
            Preset::YoloxNano | Preset::YoloxTiny => [416, 416],
            _ => [640, 640],
        };
        Self {
            exp_name: preset.name().to_string(),
            depth,
            width,
            input_size,
            depthwise: preset == Preset::YoloxNano,
            ..Self::default()
        }
    }

    /// Parses an experiment document.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::Serialization` for malformed JSON or unknown
    /// fields, and `ModelError::InvalidConfig` if the result fails
    /// [`validate`](Self::validate).
    pub fn from_json(json: &str) -> Result<Self> {
        let file: ExperimentFile = serde_json::from_str(json)?;
        let base = file.preset.map_or_else(Self::default, Self::preset);
        let exp = Self {
            exp_name: file.exp_name.unwrap_or(base.exp_name),
            depth: file.depth.unwrap_or(base.depth),
            width: file.width.unwrap_or(base.width),
            num_classes: file.num_classes.unwrap_or(base.num_classes),
            input_size: file.input_size.unwrap_or(base.input_size),
            depthwise: file.depthwise.unwrap_or(base.depthwise),
            act: file.act.unwrap_or(base.act),
        };
        exp.validate()?;
        Ok(exp)
    }

    /// Reads and parses an experiment file.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::Io` if the file cannot be read, otherwise as
    /// [`from_json`](Self::from_json).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ModelError::io(format!("{}: {e}", path.display())))?;
        let exp = Self::from_json(&json)?;
        debug!(path = %path.display(), name = %exp.exp_name, "loaded experiment");
        Ok(exp)
    }

    /// Checks that the experiment describes a buildable model.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::InvalidConfig` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if !(self.depth > 0.0 && self.depth.is_finite()) {
            return Err(ModelError::invalid_config(format!(
                "depth must be positive, got {}",
                self.depth
            )));
        }
        if !(self.width > 0.0 && self.width.is_finite()) || scale_channels(64, self.width) == 0 {
            return Err(ModelError::invalid_config(format!(
                "width {} leaves no backbone channels",
                self.width
            )));
        }
        if self.num_classes == 0 {
            return Err(ModelError::invalid_config("num_classes must be at least 1"));
        }
        for (axis, size) in ["width", "height"].iter().zip(self.input_size) {
            if size == 0 || size % INPUT_ALIGNMENT != 0 {
                return Err(ModelError::invalid_config(format!(
                    "input {axis} {size} is not a positive multiple of {INPUT_ALIGNMENT}"
                )));
            }
        }
        Activation::from_name(&self.act)?;
        Ok(())
    }

    /// Expected input resolution.
    ///
    /// `input_size` is read as `[width, height]`.
    #[must_use]
    pub const fn input_resolution(&self) -> InputResolution {
        InputResolution {
            width: self.input_size[0],
            height: self.input_size[1],
        }
    }

    /// Builds an untrained model: YOLOX batch-norm settings, head bias prior,
    /// training mode.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::InvalidConfig` if the experiment is invalid.
    pub fn get_model(&self) -> Result<Yolox> {
        self.validate()?;
        let act = Activation::from_name(&self.act)?;
        let mut model = Yolox::new(
            self.depth,
            self.width,
            self.num_classes,
            self.depthwise,
            act,
        );
        model.head_mut().initialize_biases(PRIOR_PROB);
        model.train();
        Ok(model)
    }
}
