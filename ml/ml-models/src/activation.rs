//! Activation leaves.

use burn::prelude::Backend;
use burn::tensor::Tensor;
use burn::tensor::activation::{leaky_relu, relu, sigmoid, silu};
use ml_onnx::{GraphBuilder, OnnxError, Trace, Value};

use crate::error::{ModelError, Result};
use crate::module::{Module, ModuleMapper, ModuleVisitor};

/// Negative slope of the YOLOX `lrelu` activation.
pub const LEAKY_RELU_SLOPE: f32 = 0.1;

/// Activation function placed after a normalization layer.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Activation {
    /// Standard SiLU. Has no ONNX operator and cannot be traced.
    #[default]
    Silu,
    /// SiLU written as `x * sigmoid(x)`, traceable at every supported opset.
    ExportSilu,
    /// Rectified linear unit.
    Relu,
    /// Leaky rectifier with the given negative slope.
    LeakyRelu(f32),
}

/// Activation variant without its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationKind {
    /// [`Activation::Silu`].
    Silu,
    /// [`Activation::ExportSilu`].
    ExportSilu,
    /// [`Activation::Relu`].
    Relu,
    /// [`Activation::LeakyRelu`].
    LeakyRelu,
}

impl Activation {
    /// Resolves a YOLOX activation name (`silu`, `relu`, `lrelu`).
    ///
    /// # Errors
    ///
    /// Returns `ModelError::InvalidConfig` for unknown names.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "silu" => Ok(Self::Silu),
            "relu" => Ok(Self::Relu),
            "lrelu" => Ok(Self::LeakyRelu(LEAKY_RELU_SLOPE)),
            other => Err(ModelError::invalid_config(format!(
                "unsupported activation type: {other}"
            ))),
        }
    }

    /// Returns the variant without parameters.
    #[must_use]
    pub const fn kind(&self) -> ActivationKind {
        match self {
            Self::Silu => ActivationKind::Silu,
            Self::ExportSilu => ActivationKind::ExportSilu,
            Self::Relu => ActivationKind::Relu,
            Self::LeakyRelu(_) => ActivationKind::LeakyRelu,
        }
    }

    /// Applies the activation to a tensor.
    pub fn forward<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Self::Silu => silu(x),
            Self::ExportSilu => x.clone() * sigmoid(x),
            Self::Relu => relu(x),
            Self::LeakyRelu(slope) => leaky_relu(x, f64::from(*slope)),
        }
    }
}

impl Module for Activation {
    fn visit(&self, prefix: &str, visitor: &mut dyn ModuleVisitor) {
        visitor.visit_activation(prefix, self);
    }

    fn map(&mut self, prefix: &str, mapper: &mut dyn ModuleMapper) {
        mapper.map_activation(prefix, self);
    }
}

impl Trace for Activation {
    fn trace(&self, graph: &mut GraphBuilder, input: Value) -> ml_onnx::Result<Value> {
        match self {
            Self::Silu => Err(OnnxError::unsupported_operator(
                "SiLU has no ONNX operator; replace it with ExportSilu before export",
            )),
            Self::ExportSilu => {
                let gate = graph.sigmoid(&input)?;
                graph.mul(&input, &gate)
            }
            Self::Relu => graph.relu(&input),
            Self::LeakyRelu(slope) => graph.leaky_relu(&input, *slope),
        }
    }
}
