//! Reading and writing `.onnx` files.

use std::path::Path;

use prost::Message;
use tracing::debug;

use crate::error::Result;
use crate::proto::ModelProto;

/// Serializes a model to protobuf bytes.
#[must_use]
pub fn encode(model: &ModelProto) -> Vec<u8> {
    model.encode_to_vec()
}

/// Parses a model from protobuf bytes.
///
/// # Errors
///
/// Returns `OnnxError::Decode` if the bytes are not a valid `ModelProto`.
pub fn decode(bytes: &[u8]) -> Result<ModelProto> {
    Ok(ModelProto::decode(bytes)?)
}

/// Writes a model to `path`, replacing any existing file.
///
/// # Errors
///
/// Returns `OnnxError::Io` if the file cannot be written.
pub fn save_model(model: &ModelProto, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let bytes = encode(model);
    std::fs::write(path, &bytes)?;
    debug!(path = %path.display(), bytes = bytes.len(), "wrote ONNX model");
    Ok(())
}

/// Reads a model from `path`.
///
/// # Errors
///
/// Returns `OnnxError::Io` if the file cannot be read, or
/// `OnnxError::Decode` if its contents are not a `ModelProto`.
pub fn load_model(path: impl AsRef<Path>) -> Result<ModelProto> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    debug!(path = %path.display(), bytes = bytes.len(), "read ONNX model");
    decode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::GraphBuilder;
    use crate::error::OnnxError;
    use crate::proto::data_type;

    fn sample() -> ModelProto {
        let mut b = GraphBuilder::new(11).unwrap();
        let x = b.input("input", data_type::FLOAT, &[1, 4]).unwrap();
        let y = b.sigmoid(&x).unwrap();
        b.finish(&[(&y, "output")]).unwrap()
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        let model = sample();
        save_model(&model, &path).unwrap();
        let loaded = load_model(&path).unwrap();
        assert_eq!(loaded, model);
    }

    #[test]
    fn save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        std::fs::write(&path, vec![0_u8; 4096]).unwrap();
        save_model(&sample(), &path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), encode(&sample()));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_model(dir.path().join("absent.onnx"));
        assert!(matches!(result, Err(OnnxError::Io(_))));
    }

    #[test]
    fn garbage_is_decode_error() {
        assert!(matches!(
            decode(&[0x0a, 0xff, 0xff, 0xff]),
            Err(OnnxError::Decode(_))
        ));
    }
}
