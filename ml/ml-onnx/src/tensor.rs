//! Helpers for building and reading `TensorProto` payloads.
//!
//! Tensors written by this crate always use little-endian `raw_data`. Readers
//! accept both `raw_data` and the typed repeated fields.

use crate::error::{OnnxError, Result};
use crate::proto::{TensorProto, data_type};

/// Static description of a traced value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    /// Element type, one of [`data_type`].
    pub elem_type: i32,
    /// Static dimensions.
    pub dims: Vec<usize>,
}

impl TensorInfo {
    /// Creates a new tensor description.
    #[must_use]
    pub fn new(elem_type: i32, dims: impl Into<Vec<usize>>) -> Self {
        Self {
            elem_type,
            dims: dims.into(),
        }
    }

    /// Float32 tensor description.
    #[must_use]
    pub fn float(dims: impl Into<Vec<usize>>) -> Self {
        Self::new(data_type::FLOAT, dims)
    }

    /// Returns the tensor rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Returns the number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }
}

/// Size in bytes of one element of `data_type`, if it is a fixed-width type.
#[must_use]
pub const fn element_size(data_type: i32) -> Option<usize> {
    match data_type {
        data_type::UINT8 | data_type::INT8 | data_type::BOOL => Some(1),
        data_type::FLOAT16 => Some(2),
        data_type::FLOAT | data_type::INT32 => Some(4),
        data_type::INT64 | data_type::DOUBLE => Some(8),
        _ => None,
    }
}

/// Number of elements declared by `dims`; `None` for negative dimensions.
#[must_use]
pub fn element_count(dims: &[i64]) -> Option<usize> {
    dims.iter()
        .try_fold(1_usize, |acc, &d| usize::try_from(d).ok().map(|d| acc * d))
}

/// Builds a float32 tensor.
#[must_use]
pub fn float_tensor(name: impl Into<String>, dims: &[usize], values: &[f32]) -> TensorProto {
    TensorProto {
        name: name.into(),
        dims: dims.iter().map(|&d| crate::proto::to_i64(d)).collect(),
        data_type: data_type::FLOAT,
        raw_data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        ..TensorProto::default()
    }
}

/// Builds an int64 tensor.
#[must_use]
pub fn int64_tensor(name: impl Into<String>, dims: &[usize], values: &[i64]) -> TensorProto {
    TensorProto {
        name: name.into(),
        dims: dims.iter().map(|&d| crate::proto::to_i64(d)).collect(),
        data_type: data_type::INT64,
        raw_data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        ..TensorProto::default()
    }
}

/// Number of elements actually carried by the payload.
#[must_use]
pub fn payload_len(tensor: &TensorProto) -> usize {
    if !tensor.raw_data.is_empty() {
        return element_size(tensor.data_type).map_or(0, |w| tensor.raw_data.len() / w);
    }
    match tensor.data_type {
        data_type::FLOAT => tensor.float_data.len(),
        data_type::INT64 => tensor.int64_data.len(),
        data_type::DOUBLE => tensor.double_data.len(),
        _ => tensor.int32_data.len(),
    }
}

/// Validates that the payload matches the declared dimensions.
///
/// # Errors
///
/// Returns `OnnxError::InvalidInitializer` on negative dims, a ragged
/// `raw_data` buffer or an element count mismatch.
pub fn validate_payload(tensor: &TensorProto) -> Result<()> {
    let expected = element_count(&tensor.dims)
        .ok_or_else(|| OnnxError::invalid_initializer(&tensor.name, "negative dimension"))?;
    if !tensor.raw_data.is_empty() {
        let width = element_size(tensor.data_type).ok_or_else(|| {
            OnnxError::invalid_initializer(
                &tensor.name,
                format!("unsupported data type {}", tensor.data_type),
            )
        })?;
        if tensor.raw_data.len() % width != 0 {
            return Err(OnnxError::invalid_initializer(
                &tensor.name,
                format!("raw_data length {} is not a multiple of {width}", tensor.raw_data.len()),
            ));
        }
    }
    let actual = payload_len(tensor);
    if actual != expected {
        return Err(OnnxError::invalid_initializer(
            &tensor.name,
            format!("{actual} values for {expected} elements"),
        ));
    }
    Ok(())
}

/// Reads a float32 tensor.
///
/// # Errors
///
/// Returns `OnnxError::InvalidInitializer` if the tensor is not float32.
pub fn to_f32_vec(tensor: &TensorProto) -> Result<Vec<f32>> {
    if tensor.data_type != data_type::FLOAT {
        return Err(OnnxError::invalid_initializer(
            &tensor.name,
            format!("expected float32, found data type {}", tensor.data_type),
        ));
    }
    if tensor.raw_data.is_empty() {
        return Ok(tensor.float_data.clone());
    }
    Ok(tensor
        .raw_data
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Reads an int64 tensor.
///
/// # Errors
///
/// Returns `OnnxError::InvalidInitializer` if the tensor is not int64.
pub fn to_i64_vec(tensor: &TensorProto) -> Result<Vec<i64>> {
    if tensor.data_type != data_type::INT64 {
        return Err(OnnxError::invalid_initializer(
            &tensor.name,
            format!("expected int64, found data type {}", tensor.data_type),
        ));
    }
    if tensor.raw_data.is_empty() {
        return Ok(tensor.int64_data.clone());
    }
    Ok(tensor
        .raw_data
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

/// Canonical little-endian bytes of the payload, regardless of storage field.
#[must_use]
pub fn payload_bytes(tensor: &TensorProto) -> Vec<u8> {
    if !tensor.raw_data.is_empty() {
        return tensor.raw_data.clone();
    }
    match tensor.data_type {
        data_type::FLOAT => tensor.float_data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        data_type::INT64 => tensor.int64_data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        data_type::DOUBLE => tensor.double_data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        _ => tensor.int32_data.iter().flat_map(|v| v.to_le_bytes()).collect(),
    }
}
