//! Composite blocks of the CSPDarknet backbone and PAFPN neck.

use ml_onnx::{GraphBuilder, OnnxError, Trace, Value};

use crate::activation::Activation;
use crate::layers::{BaseConv, Conv, trace_child};
use crate::module::{Module, ModuleMapper, ModuleVisitor, child};

/// Traces a sequence of modules named `0`, `1`, ... under the current scope.
pub(crate) fn trace_sequence<T: Trace>(
    graph: &mut GraphBuilder,
    modules: &[T],
    input: Value,
) -> ml_onnx::Result<Value> {
    modules
        .iter()
        .enumerate()
        .try_fold(input, |x, (i, m)| trace_child(graph, &i.to_string(), m, x))
}

/// Space-to-depth stem: folds each 2x2 pixel patch into channels, then convolves.
#[derive(Debug, Clone)]
pub struct Focus {
    conv: BaseConv,
}

impl Focus {
    /// Creates a stem taking `in_channels` image channels.
    #[must_use]
    pub fn new(in_channels: usize, out_channels: usize, kernel: usize, act: Activation) -> Self {
        Self {
            conv: BaseConv::new(in_channels * 4, out_channels, kernel, 1, 1, act),
        }
    }
}

impl Module for Focus {
    fn visit(&self, prefix: &str, visitor: &mut dyn ModuleVisitor) {
        self.conv.visit(&child(prefix, "conv"), visitor);
    }

    fn map(&mut self, prefix: &str, mapper: &mut dyn ModuleMapper) {
        self.conv.map(&child(prefix, "conv"), mapper);
    }
}

impl Trace for Focus {
    fn trace(&self, graph: &mut GraphBuilder, input: Value) -> ml_onnx::Result<Value> {
        let dims = graph.shape(&input)?.to_vec();
        if dims.len() != 4 || dims[2] % 2 != 0 || dims[3] % 2 != 0 {
            return Err(OnnxError::shape_mismatch(
                "Focus",
                format!("expected [N, C, H, W] with even H and W, got {dims:?}"),
            ));
        }
        let mut patch = |row: i64, col: i64| {
            graph.slice(&input, &[row, col], &[i64::MAX, i64::MAX], &[2, 3], &[2, 2])
        };
        let top_left = patch(0, 0)?;
        let top_right = patch(0, 1)?;
        let bot_left = patch(1, 0)?;
        let bot_right = patch(1, 1)?;
        let x = graph.concat(&[&top_left, &bot_left, &top_right, &bot_right], 1)?;
        trace_child(graph, "conv", &self.conv, x)
    }
}

/// Residual bottleneck: 1x1 reduction then 3x3 convolution.
#[derive(Debug, Clone)]
pub struct Bottleneck {
    conv1: BaseConv,
    conv2: Conv,
    use_add: bool,
}

impl Bottleneck {
    /// Creates a bottleneck; the residual is only added when `shortcut` is set
    /// and the channel counts agree.
    #[must_use]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        shortcut: bool,
        expansion: f64,
        depthwise: bool,
        act: Activation,
    ) -> Self {
        let hidden = scale_channels(out_channels, expansion);
        Self {
            conv1: BaseConv::new(in_channels, hidden, 1, 1, 1, act),
            conv2: Conv::new(hidden, out_channels, 3, 1, act, depthwise),
            use_add: shortcut && in_channels == out_channels,
        }
    }

    /// Whether the input is added back to the output.
    #[must_use]
    pub const fn use_add(&self) -> bool {
        self.use_add
    }
}

impl Module for Bottleneck {
    fn visit(&self, prefix: &str, visitor: &mut dyn ModuleVisitor) {
        self.conv1.visit(&child(prefix, "conv1"), visitor);
        self.conv2.visit(&child(prefix, "conv2"), visitor);
    }

    fn map(&mut self, prefix: &str, mapper: &mut dyn ModuleMapper) {
        self.conv1.map(&child(prefix, "conv1"), mapper);
        self.conv2.map(&child(prefix, "conv2"), mapper);
    }
}

impl Trace for Bottleneck {
    fn trace(&self, graph: &mut GraphBuilder, input: Value) -> ml_onnx::Result<Value> {
        let y = trace_child(graph, "conv1", &self.conv1, input.clone())?;
        let y = trace_child(graph, "conv2", &self.conv2, y)?;
        if self.use_add {
            graph.add(&y, &input)
        } else {
            Ok(y)
        }
    }
}

/// Cross-stage partial layer: a bottleneck stack on half of the channels.
#[derive(Debug, Clone)]
pub struct CspLayer {
    conv1: BaseConv,
    conv2: BaseConv,
    conv3: BaseConv,
    m: Vec<Bottleneck>,
}

impl CspLayer {
    /// Creates a layer with `n` bottlenecks and the default 0.5 expansion.
    #[must_use]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        n: usize,
        shortcut: bool,
        depthwise: bool,
        act: Activation,
    ) -> Self {
        let hidden = scale_channels(out_channels, 0.5);
        Self {
            conv1: BaseConv::new(in_channels, hidden, 1, 1, 1, act),
            conv2: BaseConv::new(in_channels, hidden, 1, 1, 1, act),
            conv3: BaseConv::new(2 * hidden, out_channels, 1, 1, 1, act),
            m: (0..n)
                .map(|_| Bottleneck::new(hidden, hidden, shortcut, 1.0, depthwise, act))
                .collect(),
        }
    }
}

impl Module for CspLayer {
    fn visit(&self, prefix: &str, visitor: &mut dyn ModuleVisitor) {
        self.conv1.visit(&child(prefix, "conv1"), visitor);
        self.conv2.visit(&child(prefix, "conv2"), visitor);
        self.conv3.visit(&child(prefix, "conv3"), visitor);
        self.m.visit(&child(prefix, "m"), visitor);
    }

    fn map(&mut self, prefix: &str, mapper: &mut dyn ModuleMapper) {
        self.conv1.map(&child(prefix, "conv1"), mapper);
        self.conv2.map(&child(prefix, "conv2"), mapper);
        self.conv3.map(&child(prefix, "conv3"), mapper);
        self.m.map(&child(prefix, "m"), mapper);
    }
}

impl Trace for CspLayer {
    fn trace(&self, graph: &mut GraphBuilder, input: Value) -> ml_onnx::Result<Value> {
        let x1 = trace_child(graph, "conv1", &self.conv1, input.clone())?;
        let x2 = trace_child(graph, "conv2", &self.conv2, input)?;
        let x1 = graph.scope("m", |g| trace_sequence(g, &self.m, x1))?;
        let x = graph.concat(&[&x1, &x2], 1)?;
        trace_child(graph, "conv3", &self.conv3, x)
    }
}

/// Kernel sizes of the spatial pyramid pooling branches.
pub const SPP_KERNELS: [usize; 3] = [5, 9, 13];

/// Spatial pyramid pooling as used in YOLOv3-SPP.
#[derive(Debug, Clone)]
pub struct SppBottleneck {
    conv1: BaseConv,
    conv2: BaseConv,
    kernels: Vec<usize>,
}

impl SppBottleneck {
    /// Creates a block pooling with [`SPP_KERNELS`].
    #[must_use]
    pub fn new(in_channels: usize, out_channels: usize, act: Activation) -> Self {
        let hidden = in_channels / 2;
        let kernels = SPP_KERNELS.to_vec();
        Self {
            conv1: BaseConv::new(in_channels, hidden, 1, 1, 1, act),
            conv2: BaseConv::new(hidden * (kernels.len() + 1), out_channels, 1, 1, 1, act),
            kernels,
        }
    }
}

impl Module for SppBottleneck {
    fn visit(&self, prefix: &str, visitor: &mut dyn ModuleVisitor) {
        self.conv1.visit(&child(prefix, "conv1"), visitor);
        self.conv2.visit(&child(prefix, "conv2"), visitor);
    }

    fn map(&mut self, prefix: &str, mapper: &mut dyn ModuleMapper) {
        self.conv1.map(&child(prefix, "conv1"), mapper);
        self.conv2.map(&child(prefix, "conv2"), mapper);
    }
}

impl Trace for SppBottleneck {
    fn trace(&self, graph: &mut GraphBuilder, input: Value) -> ml_onnx::Result<Value> {
        let x = trace_child(graph, "conv1", &self.conv1, input)?;
        let mut branches = vec![x.clone()];
        for (i, &k) in self.kernels.iter().enumerate() {
            let pooled = graph.scope(&format!("m.{i}"), |g| g.max_pool(&x, k, 1, k / 2))?;
            branches.push(pooled);
        }
        let refs: Vec<&Value> = branches.iter().collect();
        let x = graph.concat(&refs, 1)?;
        trace_child(graph, "conv2", &self.conv2, x)
    }
}

/// `int(channels * factor)` as written in the YOLOX model definitions.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub(crate) fn scale_channels(channels: usize, factor: f64) -> usize {
    (channels as f64 * factor) as usize
}
