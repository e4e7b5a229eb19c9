//! Parameter storage.

use burn::tensor::{DType, TensorData};

use crate::error::{ModelError, Result};

/// A named tensor owned by a module: a learnable weight or a buffer.
///
/// Payloads are float32 or int64 [`TensorData`]; the shape always matches
/// the payload length.
#[derive(Debug, Clone)]
pub struct Param {
    data: TensorData,
    buffer: bool,
}

impl Param {
    /// Zero-filled float32 weight.
    #[must_use]
    pub fn zeros(shape: &[usize]) -> Self {
        Self::filled(shape, 0.0)
    }

    /// Float32 weight with every element set to `value`.
    #[must_use]
    pub fn filled(shape: &[usize], value: f32) -> Self {
        let numel = shape.iter().product();
        Self {
            data: TensorData::new(vec![value; numel], shape.to_vec()),
            buffer: false,
        }
    }

    /// Float32 parameter from values.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::ShapeMismatch` if `values` does not fill `shape`.
    pub fn from_f32(shape: &[usize], values: Vec<f32>) -> Result<Self> {
        check_len(shape, values.len())?;
        Ok(Self {
            data: TensorData::new(values, shape.to_vec()),
            buffer: false,
        })
    }

    /// Int64 parameter from values.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::ShapeMismatch` if `values` does not fill `shape`.
    pub fn from_i64(shape: &[usize], values: Vec<i64>) -> Result<Self> {
        check_len(shape, values.len())?;
        Ok(Self {
            data: TensorData::new(values, shape.to_vec()),
            buffer: false,
        })
    }

    /// Int64 scalar buffer, as used for `num_batches_tracked`.
    #[must_use]
    pub fn scalar_i64(value: i64) -> Self {
        Self {
            data: TensorData::new(vec![value], Vec::<usize>::new()),
            buffer: true,
        }
    }

    /// Marks this parameter as a non-learnable buffer.
    #[must_use]
    pub const fn into_buffer(mut self) -> Self {
        self.buffer = true;
        self
    }

    /// Returns `true` for buffers such as running statistics.
    #[must_use]
    pub const fn is_buffer(&self) -> bool {
        self.buffer
    }

    /// Tensor shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.data.shape
    }

    /// Element type.
    #[must_use]
    pub const fn dtype(&self) -> DType {
        self.data.dtype
    }

    /// Number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.shape.iter().product()
    }

    /// Underlying tensor data.
    #[must_use]
    pub const fn data(&self) -> &TensorData {
        &self.data
    }

    /// Float32 view of the payload.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::ShapeMismatch` if the payload is not float32.
    pub fn as_f32(&self) -> Result<&[f32]> {
        self.data
            .as_slice::<f32>()
            .map_err(|e| ModelError::shape_mismatch("float32 payload", format!("{e:?}")))
    }

    /// Int64 view of the payload.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::ShapeMismatch` if the payload is not int64.
    pub fn as_i64(&self) -> Result<&[i64]> {
        self.data
            .as_slice::<i64>()
            .map_err(|e| ModelError::shape_mismatch("int64 payload", format!("{e:?}")))
    }

    /// Replaces the payload, keeping the buffer flag.
    pub(crate) fn assign(&mut self, other: &Self) {
        self.data = other.data.clone();
    }

    /// Short `[dims] dtype` description for diagnostics.
    #[must_use]
    pub fn describe(&self) -> String {
        format!("{:?} {:?}", self.data.shape, self.data.dtype)
    }
}

fn check_len(shape: &[usize], len: usize) -> Result<()> {
    let expected: usize = shape.iter().product();
    if expected != len {
        return Err(ModelError::shape_mismatch(
            format!("{expected} values for {shape:?}"),
            format!("{len} values"),
        ));
    }
    Ok(())
}
