//! Convolution building blocks.
//!
//! Parameters are created zero-filled (BatchNorm scale and variance at one)
//! and are expected to be overwritten from a checkpoint.

use burn::tensor::DType;
use ml_onnx::{ConvAttrs, GraphBuilder, OnnxError, Trace, Value};

use crate::activation::Activation;
use crate::module::{Module, ModuleMapper, ModuleVisitor, child};
use crate::param::Param;

/// BatchNorm epsilon set by YOLOX's `init_yolo`.
pub const BN_EPS: f32 = 1e-3;

/// BatchNorm momentum set by YOLOX's `init_yolo`.
pub const BN_MOMENTUM: f32 = 0.03;

/// Records `param` as an initializer named `local` under the current scope.
pub(crate) fn emit(graph: &mut GraphBuilder, local: &str, param: &Param) -> ml_onnx::Result<Value> {
    let invalid = |e: crate::error::ModelError| OnnxError::invalid_initializer(local, e.to_string());
    match param.dtype() {
        DType::F32 => graph.initializer_f32(local, param.shape(), param.as_f32().map_err(invalid)?),
        DType::I64 => graph.initializer_i64(local, param.shape(), param.as_i64().map_err(invalid)?),
        other => Err(OnnxError::invalid_initializer(
            local,
            format!("unsupported dtype {other:?}"),
        )),
    }
}

/// Traces `module` inside the named child scope.
pub(crate) fn trace_child<T: Trace + ?Sized>(
    graph: &mut GraphBuilder,
    name: &str,
    module: &T,
    input: Value,
) -> ml_onnx::Result<Value> {
    graph.scope(name, |g| module.trace(g, input))
}

/// 2-D convolution, `torch.nn.Conv2d`.
#[derive(Debug, Clone)]
pub struct Conv2d {
    weight: Param,
    bias: Option<Param>,
    stride: usize,
    padding: usize,
    groups: usize,
}

impl Conv2d {
    /// Creates a bias-free convolution with stride 1 and no padding.
    #[must_use]
    pub fn new(in_channels: usize, out_channels: usize, kernel: usize, groups: usize) -> Self {
        let groups = groups.max(1);
        Self {
            weight: Param::zeros(&[out_channels, in_channels / groups, kernel, kernel]),
            bias: None,
            stride: 1,
            padding: 0,
            groups,
        }
    }

    /// Sets the stride.
    #[must_use]
    pub const fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    /// Sets symmetric zero padding.
    #[must_use]
    pub const fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    /// Adds a zero-initialized bias.
    #[must_use]
    pub fn with_bias(mut self) -> Self {
        self.bias = Some(Param::zeros(&[self.out_channels()]));
        self
    }

    /// Number of output channels.
    #[must_use]
    pub fn out_channels(&self) -> usize {
        self.weight.shape()[0]
    }

    /// Convolution weight `[out, in / groups, k, k]`.
    #[must_use]
    pub const fn weight(&self) -> &Param {
        &self.weight
    }

    /// Optional bias `[out]`.
    #[must_use]
    pub const fn bias(&self) -> Option<&Param> {
        self.bias.as_ref()
    }

    /// Sets every bias element to `value`.
    pub fn fill_bias(&mut self, value: f32) {
        if let Some(bias) = self.bias.as_mut() {
            *bias = Param::filled(bias.shape(), value);
        }
    }
}

impl Module for Conv2d {
    fn visit(&self, prefix: &str, visitor: &mut dyn ModuleVisitor) {
        visitor.visit_param(&child(prefix, "weight"), &self.weight);
        if let Some(bias) = &self.bias {
            visitor.visit_param(&child(prefix, "bias"), bias);
        }
    }

    fn map(&mut self, prefix: &str, mapper: &mut dyn ModuleMapper) {
        mapper.map_param(&child(prefix, "weight"), &mut self.weight);
        if let Some(bias) = &mut self.bias {
            mapper.map_param(&child(prefix, "bias"), bias);
        }
    }
}

impl Trace for Conv2d {
    fn trace(&self, graph: &mut GraphBuilder, input: Value) -> ml_onnx::Result<Value> {
        let weight = emit(graph, "weight", &self.weight)?;
        let bias = self
            .bias
            .as_ref()
            .map(|b| emit(graph, "bias", b))
            .transpose()?;
        let attrs = ConvAttrs {
            stride: self.stride,
            padding: self.padding,
            groups: self.groups,
        };
        graph.conv(&input, &weight, bias.as_ref(), attrs)
    }
}

/// Batch normalization over channels, `torch.nn.BatchNorm2d`.
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    weight: Param,
    bias: Param,
    running_mean: Param,
    running_var: Param,
    num_batches_tracked: Param,
    eps: f32,
    momentum: f32,
}

impl BatchNorm2d {
    /// Creates an identity-initialized normalization with YOLOX eps/momentum.
    #[must_use]
    pub fn new(channels: usize) -> Self {
        Self {
            weight: Param::filled(&[channels], 1.0),
            bias: Param::zeros(&[channels]),
            running_mean: Param::zeros(&[channels]).into_buffer(),
            running_var: Param::filled(&[channels], 1.0).into_buffer(),
            num_batches_tracked: Param::scalar_i64(0),
            eps: BN_EPS,
            momentum: BN_MOMENTUM,
        }
    }
}

impl Module for BatchNorm2d {
    fn visit(&self, prefix: &str, visitor: &mut dyn ModuleVisitor) {
        visitor.visit_param(&child(prefix, "weight"), &self.weight);
        visitor.visit_param(&child(prefix, "bias"), &self.bias);
        visitor.visit_param(&child(prefix, "running_mean"), &self.running_mean);
        visitor.visit_param(&child(prefix, "running_var"), &self.running_var);
        visitor.visit_param(
            &child(prefix, "num_batches_tracked"),
            &self.num_batches_tracked,
        );
    }

    fn map(&mut self, prefix: &str, mapper: &mut dyn ModuleMapper) {
        mapper.map_param(&child(prefix, "weight"), &mut self.weight);
        mapper.map_param(&child(prefix, "bias"), &mut self.bias);
        mapper.map_param(&child(prefix, "running_mean"), &mut self.running_mean);
        mapper.map_param(&child(prefix, "running_var"), &mut self.running_var);
        mapper.map_param(
            &child(prefix, "num_batches_tracked"),
            &mut self.num_batches_tracked,
        );
    }
}

impl Trace for BatchNorm2d {
    fn trace(&self, graph: &mut GraphBuilder, input: Value) -> ml_onnx::Result<Value> {
        let weight = emit(graph, "weight", &self.weight)?;
        let bias = emit(graph, "bias", &self.bias)?;
        let mean = emit(graph, "running_mean", &self.running_mean)?;
        let var = emit(graph, "running_var", &self.running_var)?;
        // ONNX momentum weighs the running statistic, PyTorch the new batch.
        graph.batch_norm(
            &input,
            [&weight, &bias, &mean, &var],
            self.eps,
            1.0 - self.momentum,
        )
    }
}

/// Conv2d, BatchNorm and activation block.
#[derive(Debug, Clone)]
pub struct BaseConv {
    conv: Conv2d,
    bn: BatchNorm2d,
    act: Activation,
}

impl BaseConv {
    /// Creates a same-padded block.
    #[must_use]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        groups: usize,
        act: Activation,
    ) -> Self {
        let conv = Conv2d::new(in_channels, out_channels, kernel, groups)
            .with_stride(stride)
            .with_padding((kernel.saturating_sub(1)) / 2);
        Self {
            conv,
            bn: BatchNorm2d::new(out_channels),
            act,
        }
    }

    /// Number of output channels.
    #[must_use]
    pub fn out_channels(&self) -> usize {
        self.conv.out_channels()
    }
}

impl Module for BaseConv {
    fn visit(&self, prefix: &str, visitor: &mut dyn ModuleVisitor) {
        self.conv.visit(&child(prefix, "conv"), visitor);
        self.bn.visit(&child(prefix, "bn"), visitor);
        self.act.visit(&child(prefix, "act"), visitor);
    }

    fn map(&mut self, prefix: &str, mapper: &mut dyn ModuleMapper) {
        self.conv.map(&child(prefix, "conv"), mapper);
        self.bn.map(&child(prefix, "bn"), mapper);
        self.act.map(&child(prefix, "act"), mapper);
    }
}

impl Trace for BaseConv {
    fn trace(&self, graph: &mut GraphBuilder, input: Value) -> ml_onnx::Result<Value> {
        let x = trace_child(graph, "conv", &self.conv, input)?;
        let x = trace_child(graph, "bn", &self.bn, x)?;
        trace_child(graph, "act", &self.act, x)
    }
}

/// Depthwise convolution followed by a pointwise projection.
#[derive(Debug, Clone)]
pub struct DwConv {
    dconv: BaseConv,
    pconv: BaseConv,
}

impl DwConv {
    /// Creates a depthwise-separable block.
    #[must_use]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        act: Activation,
    ) -> Self {
        Self {
            dconv: BaseConv::new(in_channels, in_channels, kernel, stride, in_channels, act),
            pconv: BaseConv::new(in_channels, out_channels, 1, 1, 1, act),
        }
    }
}

impl Module for DwConv {
    fn visit(&self, prefix: &str, visitor: &mut dyn ModuleVisitor) {
        self.dconv.visit(&child(prefix, "dconv"), visitor);
        self.pconv.visit(&child(prefix, "pconv"), visitor);
    }

    fn map(&mut self, prefix: &str, mapper: &mut dyn ModuleMapper) {
        self.dconv.map(&child(prefix, "dconv"), mapper);
        self.pconv.map(&child(prefix, "pconv"), mapper);
    }
}

impl Trace for DwConv {
    fn trace(&self, graph: &mut GraphBuilder, input: Value) -> ml_onnx::Result<Value> {
        let x = trace_child(graph, "dconv", &self.dconv, input)?;
        trace_child(graph, "pconv", &self.pconv, x)
    }
}

/// Either a [`BaseConv`] or, for depthwise models, a [`DwConv`].
#[derive(Debug, Clone)]
pub enum Conv {
    /// Dense convolution block.
    Base(BaseConv),
    /// Depthwise-separable convolution block.
    Depthwise(DwConv),
}

impl Conv {
    /// Creates the block variant selected by `depthwise`.
    #[must_use]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        act: Activation,
        depthwise: bool,
    ) -> Self {
        if depthwise {
            Self::Depthwise(DwConv::new(in_channels, out_channels, kernel, stride, act))
        } else {
            Self::Base(BaseConv::new(in_channels, out_channels, kernel, stride, 1, act))
        }
    }
}

impl Module for Conv {
    fn visit(&self, prefix: &str, visitor: &mut dyn ModuleVisitor) {
        match self {
            Self::Base(m) => m.visit(prefix, visitor),
            Self::Depthwise(m) => m.visit(prefix, visitor),
        }
    }

    fn map(&mut self, prefix: &str, mapper: &mut dyn ModuleMapper) {
        match self {
            Self::Base(m) => m.map(prefix, mapper),
            Self::Depthwise(m) => m.map(prefix, mapper),
        }
    }
}

impl Trace for Conv {
    fn trace(&self, graph: &mut GraphBuilder, input: Value) -> ml_onnx::Result<Value> {
        match self {
            Self::Base(m) => m.trace(graph, input),
            Self::Depthwise(m) => m.trace(graph, input),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ml_onnx::proto::data_type;

    fn names<M: Module>(m: &M) -> Vec<String> {
        m.named_parameters().into_iter().map(|(n, _)| n).collect()
    }

    #[test]
    fn base_conv_names() {
        let m = BaseConv::new(3, 8, 3, 1, 1, Activation::Silu);
        assert_eq!(
            names(&m),
            vec![
                "conv.weight",
                "bn.weight",
                "bn.bias",
                "bn.running_mean",
                "bn.running_var",
                "bn.num_batches_tracked",
            ]
        );
        assert_eq!(m.num_params(), 8 * 3 * 9 + 16);
    }

    #[test]
    fn depthwise_names_and_shapes() {
        let m = Conv::new(16, 32, 3, 2, Activation::Silu, true);
        let params = m.named_parameters();
        let shape = |name: &str| {
            params
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, p)| p.shape().to_vec())
        };
        assert_eq!(shape("dconv.conv.weight"), Some(vec![16, 1, 3, 3]));
        assert_eq!(shape("pconv.conv.weight"), Some(vec![32, 16, 1, 1]));
    }

    #[test]
    fn conv_bias_is_optional() {
        let plain = Conv2d::new(4, 2, 1, 1);
        assert!(plain.bias().is_none());
        let mut biased = Conv2d::new(4, 2, 1, 1).with_bias();
        biased.fill_bias(-4.5);
        assert_eq!(
            biased.bias().map(|b| b.as_f32().unwrap_or_default().to_vec()),
            Some(vec![-4.5, -4.5])
        );
    }

    #[test]
    fn base_conv_traces() {
        let mut graph = GraphBuilder::new(11).unwrap();
        let x = graph.input("input", data_type::FLOAT, &[1, 3, 32, 32]).unwrap();
        let m = BaseConv::new(3, 8, 3, 2, 1, Activation::ExportSilu);
        let y = trace_child(&mut graph, "stem", &m, x).unwrap();
        assert_eq!(graph.shape(&y).unwrap(), [1, 8, 16, 16]);
        let model = graph.finish(&[(&y, "output")]).unwrap();
        let graph = model.graph.unwrap();
        let ops: Vec<_> = graph.node.iter().map(|n| n.op_type.as_str()).collect();
        assert_eq!(ops, vec!["Conv", "BatchNormalization", "Sigmoid", "Mul"]);
        assert_eq!(graph.node[0].name, "/stem/conv/Conv");
        let inits: Vec<_> = graph.initializer.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            inits,
            vec![
                "stem.conv.weight",
                "stem.bn.weight",
                "stem.bn.bias",
                "stem.bn.running_mean",
                "stem.bn.running_var",
            ]
        );
        let bn = &graph.node[1];
        let momentum = bn.attr("momentum").map(|a| a.f).unwrap_or_default();
        assert!((momentum - 0.97).abs() < 1e-6);
    }
}
