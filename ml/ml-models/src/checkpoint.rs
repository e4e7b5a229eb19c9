//! Checkpoint persistence for model weights.
//!
//! Checkpoints are read into a [`StateDict`] keyed by PyTorch parameter names.
//! Training checkpoints that wrap the weights in an outer dict under
//! [`NESTED_STATE_KEY`] are unwrapped on load; any other wrapper yields an
//! empty or foreign state dict that the model will reject.

use std::collections::HashMap;
use std::path::Path;

use burn::tensor::DType;
use candle_core::{DType as CandleDType, Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ModelError, Result};
use crate::param::Param;
use crate::pickle::{self, Node};
use crate::state::StateDict;

/// Outer key under which YOLOX training checkpoints store model weights.
pub const NESTED_STATE_KEY: &str = "model";

/// Supported checkpoint file formats.
///
/// # Example
///
/// ```
/// use ml_models::CheckpointFormat;
///
/// let format = CheckpointFormat::from_extension("pth");
/// assert_eq!(format, Some(CheckpointFormat::PyTorch));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CheckpointFormat {
    /// PyTorch zip archive, as written by `torch.save`.
    ///
    /// Read through `candle_core::pickle`. This is the format of released
    /// YOLOX weights.
    #[default]
    PyTorch,

    /// Hugging Face safetensors.
    SafeTensors,
}

impl CheckpointFormat {
    /// Determines format from file extension.
    ///
    /// - `.pt`, `.pth`, `.tar`, `.bin`, `.ckpt` -> PyTorch
    /// - `.safetensors` -> SafeTensors
    /// - Other -> None
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "pt" | "pth" | "tar" | "bin" | "ckpt" => Some(Self::PyTorch),
            "safetensors" => Some(Self::SafeTensors),
            _ => None,
        }
    }

    /// Determines format from file path.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    /// Returns the default file extension for this format.
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::PyTorch => "pth",
            Self::SafeTensors => "safetensors",
        }
    }

    /// Returns the format name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PyTorch => "pytorch",
            Self::SafeTensors => "safetensors",
        }
    }
}

impl std::fmt::Display for CheckpointFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Loads a checkpoint into a state dict.
///
/// Float tensors of other precisions are converted to float32 and integer
/// tensors to int64.
///
/// # Errors
///
/// Returns `ModelError::CheckpointNotFound` if the file doesn't exist,
/// `ModelError::UnsupportedFormat` if the format can't be determined and
/// `ModelError::LoadCheckpoint` if the file cannot be decoded.
///
/// # Example
///
/// ```ignore
/// use ml_models::{load_checkpoint, Module};
///
/// let state = load_checkpoint("yolox_s.pth")?;
/// model.load_state_dict(&state)?;
/// ```
pub fn load_checkpoint(path: impl AsRef<Path>) -> Result<StateDict> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ModelError::checkpoint_not_found(path.display().to_string()));
    }
    let format = CheckpointFormat::from_path(path)
        .ok_or_else(|| ModelError::unsupported_format(path.display().to_string()))?;
    let fail = |e: candle_core::Error| {
        ModelError::load_checkpoint(path.display().to_string(), e.to_string())
    };

    let tensors: Vec<(String, Tensor)> = match format {
        CheckpointFormat::PyTorch => read_pytorch(path).map_err(fail)?,
        CheckpointFormat::SafeTensors => candle_core::safetensors::load(path, &Device::Cpu)
            .map_err(fail)?
            .into_iter()
            .collect(),
    };

    let mut state = StateDict::new();
    for (name, tensor) in tensors {
        let param = to_param(&name, &tensor).map_err(|e| {
            ModelError::load_checkpoint(path.display().to_string(), format!("{name}: {e}"))
        })?;
        state.insert(name, param);
    }
    debug!(
        path = %path.display(),
        %format,
        entries = state.len(),
        "loaded checkpoint"
    );
    Ok(state)
}

fn read_pytorch(path: &Path) -> candle_core::Result<Vec<(String, Tensor)>> {
    let pth = match candle_core::pickle::PthTensors::new(path, Some(NESTED_STATE_KEY)) {
        Ok(pth) => {
            debug!(key = NESTED_STATE_KEY, "unwrapping nested state dict");
            pth
        }
        Err(e) => {
            debug!(
                key = NESTED_STATE_KEY,
                error = %e,
                "no nested state dict, reading the top-level dict"
            );
            candle_core::pickle::PthTensors::new(path, None)?
        }
    };
    let mut names: Vec<&String> = pth.tensor_infos().keys().collect();
    names.sort();
    let mut tensors = Vec::with_capacity(names.len());
    for name in names {
        if let Some(tensor) = pth.get(name)? {
            tensors.push((name.clone(), tensor));
        }
    }
    Ok(tensors)
}

fn to_param(name: &str, tensor: &Tensor) -> candle_core::Result<Param> {
    let shape = tensor.dims().to_vec();
    let dtype = tensor.dtype();
    let param = match dtype {
        CandleDType::F32 => Param::from_f32(&shape, tensor.flatten_all()?.to_vec1::<f32>()?),
        CandleDType::I64 => Param::from_i64(&shape, tensor.flatten_all()?.to_vec1::<i64>()?),
        d if d.is_float() => {
            warn!(name, dtype = ?d, "converting checkpoint tensor to float32");
            let values = tensor.to_dtype(CandleDType::F32)?.flatten_all()?.to_vec1::<f32>()?;
            Param::from_f32(&shape, values)
        }
        d => {
            debug!(name, dtype = ?d, "widening checkpoint tensor to int64");
            let values = tensor.to_dtype(CandleDType::I64)?.flatten_all()?.to_vec1::<i64>()?;
            Param::from_i64(&shape, values)
        }
    };
    param.map_err(|e| candle_core::Error::Msg(e.to_string()))
}

fn to_tensor(name: &str, param: &Param) -> Result<Tensor> {
    let shape = param.shape().to_vec();
    let tensor = match param.dtype() {
        DType::F32 => Tensor::from_vec(param.as_f32()?.to_vec(), shape, &Device::Cpu),
        DType::I64 => Tensor::from_vec(param.as_i64()?.to_vec(), shape, &Device::Cpu),
        other => {
            return Err(ModelError::unsupported_format(format!(
                "{name}: cannot store {other:?} tensors"
            )));
        }
    };
    tensor.map_err(|e| ModelError::save_checkpoint(name, e.to_string()))
}

/// Saves a state dict to `path`.
///
/// # Errors
///
/// Returns `ModelError::SaveCheckpoint` if writing fails.
pub fn save_checkpoint(
    state: &StateDict,
    path: impl AsRef<Path>,
    format: CheckpointFormat,
) -> Result<()> {
    let path = path.as_ref();
    match format {
        CheckpointFormat::PyTorch => pickle::write_archive(path, &state_node(state))?,
        CheckpointFormat::SafeTensors => {
            let tensors = state
                .iter()
                .map(|(name, param)| Ok((name.to_string(), to_tensor(name, param)?)))
                .collect::<Result<HashMap<String, Tensor>>>()?;
            candle_core::safetensors::save(&tensors, path).map_err(|e| {
                ModelError::save_checkpoint(path.display().to_string(), e.to_string())
            })?;
        }
    }
    debug!(path = %path.display(), %format, entries = state.len(), "saved checkpoint");
    Ok(())
}

/// Saves a PyTorch training checkpoint: `{key: state, "start_epoch": epoch}`.
///
/// With `key` set to [`NESTED_STATE_KEY`] this matches the layout YOLOX
/// training writes.
///
/// # Errors
///
/// Returns `ModelError::SaveCheckpoint` if writing fails.
pub fn save_training_checkpoint(
    state: &StateDict,
    path: impl AsRef<Path>,
    key: &str,
    epoch: i64,
) -> Result<()> {
    let root = Node::Dict(vec![
        (key.to_string(), state_node(state)),
        ("start_epoch".to_string(), Node::Int(epoch)),
    ]);
    pickle::write_archive(path.as_ref(), &root)
}

fn state_node(state: &StateDict) -> Node<'_> {
    Node::Dict(
        state
            .iter()
            .map(|(name, param)| (name.to_string(), Node::Tensor(param)))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    fn sample_state() -> StateDict {
        let mut state = StateDict::new();
        state.insert(
            "conv.weight",
            Param::from_f32(&[2, 1, 1, 1], vec![0.5, -1.25]).unwrap(),
        );
        state.insert("bn.running_var", Param::filled(&[2], 2.0));
        state.insert("bn.num_batches_tracked", Param::scalar_i64(1234));
        state
    }

    fn assert_same(a: &StateDict, b: &StateDict) {
        assert_eq!(a.names().collect::<Vec<_>>(), b.names().collect::<Vec<_>>());
        for (name, param) in a.iter() {
            let other = b.get(name).unwrap();
            assert_eq!(param.shape(), other.shape(), "{name}");
            assert_eq!(param.dtype(), other.dtype(), "{name}");
            assert_eq!(param.data().as_bytes(), other.data().as_bytes(), "{name}");
        }
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(
            CheckpointFormat::from_extension("pth"),
            Some(CheckpointFormat::PyTorch)
        );
        assert_eq!(
            CheckpointFormat::from_extension("PT"),
            Some(CheckpointFormat::PyTorch)
        );
        assert_eq!(
            CheckpointFormat::from_extension("safetensors"),
            Some(CheckpointFormat::SafeTensors)
        );
        assert_eq!(CheckpointFormat::from_extension("onnx"), None);
    }

    #[test]
    fn format_from_path() {
        assert_eq!(
            CheckpointFormat::from_path(Path::new("/weights/yolox_s.pth.tar")),
            Some(CheckpointFormat::PyTorch)
        );
        assert_eq!(
            CheckpointFormat::from_path(Path::new("model.safetensors")),
            Some(CheckpointFormat::SafeTensors)
        );
        assert_eq!(CheckpointFormat::from_path(Path::new("model")), None);
    }

    #[test]
    fn format_display() {
        assert_eq!(format!("{}", CheckpointFormat::PyTorch), "pytorch");
        assert_eq!(CheckpointFormat::SafeTensors.extension(), "safetensors");
        assert_eq!(CheckpointFormat::default(), CheckpointFormat::PyTorch);
    }

    #[test]
    fn missing_file() {
        assert!(matches!(
            load_checkpoint("/nonexistent/yolox.pth"),
            Err(ModelError::CheckpointNotFound(_))
        ));
    }

    #[test]
    fn unknown_extension() {
        let file = tempfile::Builder::new().suffix(".onnx").tempfile().unwrap();
        assert!(matches!(
            load_checkpoint(file.path()),
            Err(ModelError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn corrupt_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.pt");
        std::fs::write(&path, b"not a zip").unwrap();
        assert!(matches!(
            load_checkpoint(&path),
            Err(ModelError::LoadCheckpoint { .. })
        ));
    }

    #[test]
    fn pytorch_flat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.pth");
        let state = sample_state();
        save_checkpoint(&state, &path, CheckpointFormat::PyTorch).unwrap();
        assert_same(&state, &load_checkpoint(&path).unwrap());
    }

    #[test]
    fn pytorch_nested_under_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.pth");
        let state = sample_state();
        save_training_checkpoint(&state, &path, NESTED_STATE_KEY, 300).unwrap();
        assert_same(&state, &load_checkpoint(&path).unwrap());
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn flat_fallback_logs_nested_key_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.pth");
        save_checkpoint(&sample_state(), &path, CheckpointFormat::PyTorch).unwrap();

        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(logs.clone())
            .finish();
        let loaded = tracing::subscriber::with_default(subscriber, || load_checkpoint(&path));

        assert!(loaded.unwrap().contains("conv.weight"));
        let text = logs.text();
        assert!(text.contains("no nested state dict"), "{text}");
        assert!(text.contains("error="), "{text}");
        assert!(text.contains("key=\"model\""), "{text}");
    }

    #[test]
    fn pytorch_nested_under_other_key_is_not_unwrapped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.pth");
        save_training_checkpoint(&sample_state(), &path, "state_dict", 1).unwrap();
        let loaded = load_checkpoint(&path).unwrap();
        assert!(!loaded.contains("conv.weight"));
    }

    #[test]
    fn safetensors_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.safetensors");
        let state = sample_state();
        save_checkpoint(&state, &path, CheckpointFormat::SafeTensors).unwrap();
        assert_same(&state, &load_checkpoint(&path).unwrap());
    }

    #[test]
    fn half_precision_is_widened() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("half.safetensors");
        let tensor = Tensor::from_vec(vec![1.0_f32, 2.5], 2, &Device::Cpu)
            .and_then(|t| t.to_dtype(CandleDType::F16))
            .unwrap();
        let tensors = HashMap::from([("w".to_string(), tensor)]);
        candle_core::safetensors::save(&tensors, &path).unwrap();
        let state = load_checkpoint(&path).unwrap();
        let w = state.get("w").unwrap();
        assert_eq!(w.dtype(), DType::F32);
        assert_eq!(w.as_f32().unwrap(), [1.0, 2.5]);
    }
}
