//! Checkpoint to ONNX export.

use std::path::{Path, PathBuf};

use burn::tensor::TensorData;
use ml_models::{
    Activation, ActivationKind, Experiment, Module, OutputAdapter, Yolox, load_checkpoint,
};
use ml_onnx::{
    Chain, DEFAULT_OPSET, TraceOptions, graph_signature, load_model, save_model, simplify,
    trace_model,
};
use tracing::{debug, info};

use crate::error::{ExportError, Result};

/// Extension of the written artifact.
pub const ONNX_EXTENSION: &str = "onnx";

/// What to export and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    /// Checkpoint to load.
    pub weights: PathBuf,

    /// Experiment file describing the model.
    pub exp: PathBuf,

    /// ONNX opset to emit.
    pub opset: u32,

    /// Run the graph simplifier after export.
    pub simplify: bool,

    /// Directory the artifact is written to.
    pub output_dir: PathBuf,
}

impl ExportOptions {
    /// Creates options with opset 11, no simplification and the current
    /// directory as output.
    #[must_use]
    pub fn new(weights: impl Into<PathBuf>, exp: impl Into<PathBuf>) -> Self {
        Self {
            weights: weights.into(),
            exp: exp.into(),
            opset: DEFAULT_OPSET,
            simplify: false,
            output_dir: PathBuf::from("."),
        }
    }

    /// Sets the opset.
    #[must_use]
    pub const fn with_opset(mut self, opset: u32) -> Self {
        self.opset = opset;
        self
    }

    /// Enables or disables simplification.
    #[must_use]
    pub const fn with_simplify(mut self, simplify: bool) -> Self {
        self.simplify = simplify;
        self
    }

    /// Sets the output directory.
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Checks that both input files exist, weights first.
    ///
    /// # Errors
    ///
    /// Returns `ExportError::InvalidInput` naming the first missing file.
    pub fn validate_inputs(&self) -> Result<()> {
        if !self.weights.is_file() {
            return Err(ExportError::invalid_weights(self.weights.display().to_string()));
        }
        if !self.exp.is_file() {
            return Err(ExportError::invalid_exp(self.exp.display().to_string()));
        }
        Ok(())
    }

    /// Where the artifact will be written.
    ///
    /// # Errors
    ///
    /// Returns `ExportError::InvalidFileName` if no name can be derived from
    /// the weights path.
    pub fn output_path(&self) -> Result<PathBuf> {
        Ok(self.output_dir.join(onnx_file_name(&self.weights)?))
    }
}

/// Artifact name for a checkpoint: its base name up to the first `.pt`, plus `.onnx`.
///
/// `runs/yolox_s.pth` becomes `yolox_s.onnx`.
///
/// # Errors
///
/// Returns `ExportError::InvalidFileName` for paths without a base name or
/// whose base name starts with `.pt`.
pub fn onnx_file_name(weights: &Path) -> Result<String> {
    let base = weights
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ExportError::invalid_file_name(weights.display().to_string()))?;
    match base.split(".pt").next() {
        Some(stem) if !stem.is_empty() => Ok(format!("{stem}.{ONNX_EXTENSION}")),
        _ => Err(ExportError::invalid_file_name(weights.display().to_string())),
    }
}

/// A model ready to be traced.
#[derive(Debug, Clone)]
pub struct PreparedModel {
    /// Model with checkpoint weights, in inference mode, with exportable activations.
    pub model: Yolox,

    /// Experiment the model was built from.
    pub experiment: Experiment,

    /// Number of SiLU activations rewritten to the exportable form.
    pub replaced_activations: usize,
}

/// Builds the model from `exp`, loads `weights` into it and prepares it for
/// tracing.
///
/// Checkpoints wrapping their weights under `"model"` are unwrapped. The model
/// is put in inference mode, every SiLU is replaced by `x * sigmoid(x)` and the
/// head decodes boxes.
///
/// # Errors
///
/// Returns `ExportError::Model` if the experiment is invalid, the checkpoint
/// cannot be read or its parameters do not match the model.
pub fn prepare_model(weights: &Path, exp: &Path) -> Result<PreparedModel> {
    let experiment = Experiment::from_file(exp)?;
    let mut model = experiment.get_model()?;

    let state = load_checkpoint(weights)?;
    model.load_state_dict(&state)?;
    info!(entries = state.len(), "loading checkpoint done");

    model.eval();
    let replaced_activations =
        model.replace_activation(ActivationKind::Silu, Activation::ExportSilu);
    debug!(replaced_activations, "replaced SiLU activations");
    model.head_mut().set_decode_in_inference(true);

    Ok(PreparedModel {
        model,
        experiment,
        replaced_activations,
    })
}

/// Outcome of an [`export`] run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    /// Written artifact.
    pub output_path: PathBuf,

    /// Graph input shape `[1, 3, H, W]`.
    pub input_shape: Vec<usize>,

    /// Graph output shape `[1, N, 7]`.
    pub output_shape: Vec<usize>,

    /// Node count of the final artifact.
    pub node_count: usize,

    /// Whether the artifact was simplified.
    pub simplified: bool,

    /// Number of SiLU activations rewritten to the exportable form.
    pub replaced_activations: usize,
}

/// Exports a checkpoint to ONNX.
///
/// Writes `<output_dir>/<weights base name>.onnx`, overwriting any existing
/// file. With simplification enabled the written file is reloaded, simplified
/// and overwritten; a simplifier failure leaves the unsimplified artifact.
///
/// # Errors
///
/// Returns `ExportError::InvalidInput` if an input file is missing (checked
/// before any other work), `ExportError::Model` for model or checkpoint
/// problems, `ExportError::Export` if tracing or writing fails and
/// `ExportError::Simplification` if the simplifier fails.
pub fn export(options: &ExportOptions) -> Result<ExportReport> {
    options.validate_inputs()?;
    let output_path = options.output_path()?;

    let prepared = prepare_model(&options.weights, &options.exp)?;
    let resolution = prepared.experiment.input_resolution();
    let dummy = TensorData::zeros::<f32, _>(resolution.batch_shape());
    let input_shape = dummy.shape.clone();

    let trace_options = TraceOptions::default()
        .with_opset(options.opset)
        .with_io_names("input", "output")
        .with_metadata("exp_name", prepared.experiment.exp_name.as_str())
        .with_metadata("num_classes", prepared.experiment.num_classes.to_string());
    let pipeline = Chain::new(prepared.model, OutputAdapter::new());
    let mut model = trace_model(&pipeline, &input_shape, &trace_options)?;
    save_model(&model, &output_path)?;
    info!(path = %output_path.display(), "generated onnx model");

    if options.simplify {
        let loaded = load_model(&output_path)?;
        let (simplified, report) = simplify(loaded).map_err(ExportError::Simplification)?;
        save_model(&simplified, &output_path)?;
        debug!(?report, "simplify report");
        info!(path = %output_path.display(), "generated simplified onnx model");
        model = simplified;
    }

    let signature = graph_signature(&model)?;
    let output_shape = signature
        .outputs
        .first()
        .map(|o| {
            o.dims
                .iter()
                .map(|d| d.and_then(|d| usize::try_from(d).ok()).unwrap_or(0))
                .collect()
        })
        .unwrap_or_default();

    Ok(ExportReport {
        output_path,
        input_shape,
        output_shape,
        node_count: model.graph.as_ref().map_or(0, |g| g.node.len()),
        simplified: options.simplify,
        replaced_activations: prepared.replaced_activations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_from_base_name() {
        assert_eq!(onnx_file_name(Path::new("model.pt")).unwrap(), "model.onnx");
        assert_eq!(
            onnx_file_name(Path::new("a/b/yolox_s.pth")).unwrap(),
            "yolox_s.onnx"
        );
        assert_eq!(
            onnx_file_name(Path::new("/ckpt/best_ckpt.pth.tar")).unwrap(),
            "best_ckpt.onnx"
        );
    }

    #[test]
    fn file_name_splits_on_first_pt() {
        assert_eq!(
            onnx_file_name(Path::new("yolox.ptq.pt")).unwrap(),
            "yolox.onnx"
        );
        assert_eq!(
            onnx_file_name(Path::new("weights.safetensors")).unwrap(),
            "weights.safetensors.onnx"
        );
    }

    #[test]
    fn file_name_rejects_empty_stem() {
        assert!(matches!(
            onnx_file_name(Path::new("dir/.pt")),
            Err(ExportError::InvalidFileName(_))
        ));
        assert!(onnx_file_name(Path::new("/")).is_err());
    }

    #[test]
    fn options_defaults() {
        let options = ExportOptions::new("m.pt", "exp.json");
        assert_eq!(options.opset, 11);
        assert!(!options.simplify);
        assert_eq!(options.output_path().unwrap(), PathBuf::from("./m.onnx"));
        let options = options.with_opset(13).with_simplify(true).with_output_dir("out");
        assert_eq!(options.opset, 13);
        assert!(options.simplify);
        assert_eq!(options.output_path().unwrap(), PathBuf::from("out/m.onnx"));
    }

    #[test]
    fn weights_are_checked_first() {
        let options = ExportOptions::new("/missing/model.pt", "/missing/exp.json");
        match options.validate_inputs() {
            Err(ExportError::InvalidInput { kind, .. }) => assert_eq!(kind, "weights"),
            other => panic!("expected invalid weights, got {other:?}"),
        }
    }

    #[test]
    fn missing_exp_is_reported() {
        let weights = tempfile::Builder::new().suffix(".pt").tempfile().unwrap();
        let options = ExportOptions::new(weights.path(), "/missing/exp.json");
        match options.validate_inputs() {
            Err(ExportError::InvalidInput { kind, path }) => {
                assert_eq!(kind, "exp");
                assert_eq!(path, "/missing/exp.json");
            }
            other => panic!("expected invalid exp, got {other:?}"),
        }
    }
}
