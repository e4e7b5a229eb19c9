//! YOLOX detector: CSPDarknet backbone, PAFPN neck and decoupled head.
//!
//! Channel and depth arithmetic follows the reference model definitions so
//! that parameter names and shapes line up with released checkpoints.

use ml_onnx::{GraphBuilder, OnnxError, Trace, Value};
use tracing::debug;

use crate::activation::Activation;
use crate::blocks::{CspLayer, Focus, SppBottleneck, scale_channels, trace_sequence};
use crate::layers::{BaseConv, Conv, Conv2d, trace_child};
use crate::module::{Module, ModuleMapper, ModuleVisitor, child};

/// Output strides of the three detection levels.
pub const STRIDES: [usize; 3] = [8, 16, 32];

/// Neck input channels at width multiplier 1.0.
pub const IN_CHANNELS: [usize; 3] = [256, 512, 1024];

/// Default objectness and class prior used for bias initialization.
pub const PRIOR_PROB: f32 = 0.01;

/// Python's `round()` on a float: halves go to the even neighbour.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
#[must_use]
pub fn round_half_even(value: f64) -> usize {
    value.round_ties_even().max(0.0) as usize
}

/// One backbone stage: a strided convolution followed by its blocks.
#[derive(Debug, Clone)]
enum Stage {
    Conv(Conv),
    Csp(CspLayer),
    Spp(SppBottleneck),
}

impl Module for Stage {
    fn visit(&self, prefix: &str, visitor: &mut dyn ModuleVisitor) {
        match self {
            Self::Conv(m) => m.visit(prefix, visitor),
            Self::Csp(m) => m.visit(prefix, visitor),
            Self::Spp(m) => m.visit(prefix, visitor),
        }
    }

    fn map(&mut self, prefix: &str, mapper: &mut dyn ModuleMapper) {
        match self {
            Self::Conv(m) => m.map(prefix, mapper),
            Self::Csp(m) => m.map(prefix, mapper),
            Self::Spp(m) => m.map(prefix, mapper),
        }
    }
}

impl Trace for Stage {
    fn trace(&self, graph: &mut GraphBuilder, input: Value) -> ml_onnx::Result<Value> {
        match self {
            Self::Conv(m) => m.trace(graph, input),
            Self::Csp(m) => m.trace(graph, input),
            Self::Spp(m) => m.trace(graph, input),
        }
    }
}

/// CSPDarknet backbone producing `dark3`, `dark4` and `dark5` features.
#[derive(Debug, Clone)]
pub struct CspDarknet {
    stem: Focus,
    dark2: Vec<Stage>,
    dark3: Vec<Stage>,
    dark4: Vec<Stage>,
    dark5: Vec<Stage>,
}

impl CspDarknet {
    /// Builds the backbone for the given depth and width multipliers.
    #[must_use]
    pub fn new(depth: f64, width: f64, depthwise: bool, act: Activation) -> Self {
        let base = scale_channels(64, width);
        let base_depth = round_half_even(depth * 3.0).max(1);
        let down = |cin: usize, cout: usize| Stage::Conv(Conv::new(cin, cout, 3, 2, act, depthwise));
        let csp = |c: usize, n: usize, shortcut: bool| {
            Stage::Csp(CspLayer::new(c, c, n, shortcut, depthwise, act))
        };
        Self {
            stem: Focus::new(3, base, 3, act),
            dark2: vec![down(base, base * 2), csp(base * 2, base_depth, true)],
            dark3: vec![down(base * 2, base * 4), csp(base * 4, base_depth * 3, true)],
            dark4: vec![down(base * 4, base * 8), csp(base * 8, base_depth * 3, true)],
            dark5: vec![
                down(base * 8, base * 16),
                Stage::Spp(SppBottleneck::new(base * 16, base * 16, act)),
                csp(base * 16, base_depth, false),
            ],
        }
    }

    /// Traces the backbone and returns the `dark3`, `dark4`, `dark5` features.
    ///
    /// # Errors
    ///
    /// Propagates tracing errors from any stage.
    pub fn trace_features(
        &self,
        graph: &mut GraphBuilder,
        input: Value,
    ) -> ml_onnx::Result<[Value; 3]> {
        let x = trace_child(graph, "stem", &self.stem, input)?;
        let x = graph.scope("dark2", |g| trace_sequence(g, &self.dark2, x))?;
        let dark3 = graph.scope("dark3", |g| trace_sequence(g, &self.dark3, x))?;
        let dark4 = graph.scope("dark4", |g| trace_sequence(g, &self.dark4, dark3.clone()))?;
        let dark5 = graph.scope("dark5", |g| trace_sequence(g, &self.dark5, dark4.clone()))?;
        Ok([dark3, dark4, dark5])
    }
}

impl Module for CspDarknet {
    fn visit(&self, prefix: &str, visitor: &mut dyn ModuleVisitor) {
        self.stem.visit(&child(prefix, "stem"), visitor);
        self.dark2.visit(&child(prefix, "dark2"), visitor);
        self.dark3.visit(&child(prefix, "dark3"), visitor);
        self.dark4.visit(&child(prefix, "dark4"), visitor);
        self.dark5.visit(&child(prefix, "dark5"), visitor);
    }

    fn map(&mut self, prefix: &str, mapper: &mut dyn ModuleMapper) {
        self.stem.map(&child(prefix, "stem"), mapper);
        self.dark2.map(&child(prefix, "dark2"), mapper);
        self.dark3.map(&child(prefix, "dark3"), mapper);
        self.dark4.map(&child(prefix, "dark4"), mapper);
        self.dark5.map(&child(prefix, "dark5"), mapper);
    }
}

/// Path aggregation feature pyramid on top of [`CspDarknet`].
#[derive(Debug, Clone)]
pub struct YoloPafpn {
    backbone: CspDarknet,
    lateral_conv0: BaseConv,
    c3_p4: CspLayer,
    reduce_conv1: BaseConv,
    c3_p3: CspLayer,
    bu_conv2: Conv,
    c3_n3: CspLayer,
    bu_conv1: Conv,
    c3_n4: CspLayer,
}

impl YoloPafpn {
    /// Builds the neck and its backbone.
    #[must_use]
    pub fn new(depth: f64, width: f64, depthwise: bool, act: Activation) -> Self {
        let [c0, c1, c2] = IN_CHANNELS.map(|c| scale_channels(c, width));
        let n = round_half_even(3.0 * depth);
        let csp = |cin: usize, cout: usize| CspLayer::new(cin, cout, n, false, depthwise, act);
        Self {
            backbone: CspDarknet::new(depth, width, depthwise, act),
            lateral_conv0: BaseConv::new(c2, c1, 1, 1, 1, act),
            c3_p4: csp(scale_channels(2 * IN_CHANNELS[1], width), c1),
            reduce_conv1: BaseConv::new(c1, c0, 1, 1, 1, act),
            c3_p3: csp(scale_channels(2 * IN_CHANNELS[0], width), c0),
            bu_conv2: Conv::new(c0, c0, 3, 2, act, depthwise),
            c3_n3: csp(scale_channels(2 * IN_CHANNELS[0], width), c1),
            bu_conv1: Conv::new(c1, c1, 3, 2, act, depthwise),
            c3_n4: csp(scale_channels(2 * IN_CHANNELS[1], width), c2),
        }
    }

    /// Traces the pyramid and returns the stride 8, 16 and 32 outputs.
    ///
    /// # Errors
    ///
    /// Propagates tracing errors from the backbone or any neck layer.
    pub fn trace_features(
        &self,
        graph: &mut GraphBuilder,
        input: Value,
    ) -> ml_onnx::Result<[Value; 3]> {
        let [x2, x1, x0] = graph.scope("backbone", |g| self.backbone.trace_features(g, input))?;

        let fpn_out0 = trace_child(graph, "lateral_conv0", &self.lateral_conv0, x0)?;
        let f_out0 = graph.scope("upsample", |g| g.resize_nearest(&fpn_out0, 2))?;
        let f_out0 = graph.concat(&[&f_out0, &x1], 1)?;
        let f_out0 = trace_child(graph, "C3_p4", &self.c3_p4, f_out0)?;

        let fpn_out1 = trace_child(graph, "reduce_conv1", &self.reduce_conv1, f_out0)?;
        let f_out1 = graph.scope("upsample", |g| g.resize_nearest(&fpn_out1, 2))?;
        let f_out1 = graph.concat(&[&f_out1, &x2], 1)?;
        let pan_out2 = trace_child(graph, "C3_p3", &self.c3_p3, f_out1)?;

        let p_out1 = trace_child(graph, "bu_conv2", &self.bu_conv2, pan_out2.clone())?;
        let p_out1 = graph.concat(&[&p_out1, &fpn_out1], 1)?;
        let pan_out1 = trace_child(graph, "C3_n3", &self.c3_n3, p_out1)?;

        let p_out0 = trace_child(graph, "bu_conv1", &self.bu_conv1, pan_out1.clone())?;
        let p_out0 = graph.concat(&[&p_out0, &fpn_out0], 1)?;
        let pan_out0 = trace_child(graph, "C3_n4", &self.c3_n4, p_out0)?;

        Ok([pan_out2, pan_out1, pan_out0])
    }
}

impl Module for YoloPafpn {
    fn visit(&self, prefix: &str, visitor: &mut dyn ModuleVisitor) {
        self.backbone.visit(&child(prefix, "backbone"), visitor);
        self.lateral_conv0.visit(&child(prefix, "lateral_conv0"), visitor);
        self.c3_p4.visit(&child(prefix, "C3_p4"), visitor);
        self.reduce_conv1.visit(&child(prefix, "reduce_conv1"), visitor);
        self.c3_p3.visit(&child(prefix, "C3_p3"), visitor);
        self.bu_conv2.visit(&child(prefix, "bu_conv2"), visitor);
        self.c3_n3.visit(&child(prefix, "C3_n3"), visitor);
        self.bu_conv1.visit(&child(prefix, "bu_conv1"), visitor);
        self.c3_n4.visit(&child(prefix, "C3_n4"), visitor);
    }

    fn map(&mut self, prefix: &str, mapper: &mut dyn ModuleMapper) {
        self.backbone.map(&child(prefix, "backbone"), mapper);
        self.lateral_conv0.map(&child(prefix, "lateral_conv0"), mapper);
        self.c3_p4.map(&child(prefix, "C3_p4"), mapper);
        self.reduce_conv1.map(&child(prefix, "reduce_conv1"), mapper);
        self.c3_p3.map(&child(prefix, "C3_p3"), mapper);
        self.bu_conv2.map(&child(prefix, "bu_conv2"), mapper);
        self.c3_n3.map(&child(prefix, "C3_n3"), mapper);
        self.bu_conv1.map(&child(prefix, "bu_conv1"), mapper);
        self.c3_n4.map(&child(prefix, "C3_n4"), mapper);
    }
}

/// Decoupled anchor-free head with separate classification and regression branches.
#[derive(Debug, Clone)]
pub struct YoloxHead {
    num_classes: usize,
    decode_in_inference: bool,
    stems: Vec<BaseConv>,
    cls_convs: Vec<Vec<Conv>>,
    reg_convs: Vec<Vec<Conv>>,
    cls_preds: Vec<Conv2d>,
    reg_preds: Vec<Conv2d>,
    obj_preds: Vec<Conv2d>,
}

impl YoloxHead {
    /// Builds a head for `num_classes` classes.
    #[must_use]
    pub fn new(num_classes: usize, width: f64, depthwise: bool, act: Activation) -> Self {
        let hidden = scale_channels(256, width);
        let branch = || {
            vec![
                Conv::new(hidden, hidden, 3, 1, act, depthwise),
                Conv::new(hidden, hidden, 3, 1, act, depthwise),
            ]
        };
        let pred = |out: usize| Conv2d::new(hidden, out, 1, 1).with_bias();
        Self {
            num_classes,
            decode_in_inference: true,
            stems: IN_CHANNELS
                .iter()
                .map(|&c| BaseConv::new(scale_channels(c, width), hidden, 1, 1, 1, act))
                .collect(),
            cls_convs: STRIDES.iter().map(|_| branch()).collect(),
            reg_convs: STRIDES.iter().map(|_| branch()).collect(),
            cls_preds: STRIDES.iter().map(|_| pred(num_classes)).collect(),
            reg_preds: STRIDES.iter().map(|_| pred(4)).collect(),
            obj_preds: STRIDES.iter().map(|_| pred(1)).collect(),
        }
    }

    /// Number of object classes.
    #[must_use]
    pub const fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Whether inference output is decoded to input-pixel boxes.
    #[must_use]
    pub const fn decode_in_inference(&self) -> bool {
        self.decode_in_inference
    }

    /// Enables or disables box decoding during inference.
    pub fn set_decode_in_inference(&mut self, decode: bool) {
        self.decode_in_inference = decode;
    }

    /// Sets class and objectness biases so that initial scores equal `prior_prob`.
    pub fn initialize_biases(&mut self, prior_prob: f32) {
        let bias = -((1.0 - prior_prob) / prior_prob).ln();
        for conv in self.cls_preds.iter_mut().chain(self.obj_preds.iter_mut()) {
            conv.fill_bias(bias);
        }
    }

    fn trace_level(
        &self,
        graph: &mut GraphBuilder,
        level: usize,
        input: Value,
    ) -> ml_onnx::Result<Value> {
        let idx = level.to_string();
        let x = graph.scope("stems", |g| trace_child(g, &idx, &self.stems[level], input))?;
        let cls_feat = graph.scope("cls_convs", |g| {
            g.scope(&idx, |g| trace_sequence(g, &self.cls_convs[level], x.clone()))
        })?;
        let cls_output =
            graph.scope("cls_preds", |g| trace_child(g, &idx, &self.cls_preds[level], cls_feat))?;
        let reg_feat = graph.scope("reg_convs", |g| {
            g.scope(&idx, |g| trace_sequence(g, &self.reg_convs[level], x))
        })?;
        let reg_output = graph.scope("reg_preds", |g| {
            trace_child(g, &idx, &self.reg_preds[level], reg_feat.clone())
        })?;
        let obj_output =
            graph.scope("obj_preds", |g| trace_child(g, &idx, &self.obj_preds[level], reg_feat))?;
        let obj = graph.sigmoid(&obj_output)?;
        let cls = graph.sigmoid(&cls_output)?;
        graph.concat(&[&reg_output, &obj, &cls], 1)
    }

    /// Traces all levels into `[B, N, 5 + num_classes]`.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::ShapeMismatch` if the number of feature maps differs
    /// from the number of strides.
    pub fn trace_head(
        &self,
        graph: &mut GraphBuilder,
        features: [Value; 3],
    ) -> ml_onnx::Result<Value> {
        let channels = i64::try_from(5 + self.num_classes)
            .map_err(|_| OnnxError::trace("class count does not fit in i64"))?;
        let mut flat = Vec::with_capacity(STRIDES.len());
        let mut grid_sizes = Vec::with_capacity(STRIDES.len());
        for (level, feature) in features.into_iter().enumerate() {
            let out = self.trace_level(graph, level, feature)?;
            let dims = graph.shape(&out)?.to_vec();
            grid_sizes.push((dims[2], dims[3]));
            flat.push(graph.reshape(&out, &[0, channels, -1])?);
        }
        let refs: Vec<&Value> = flat.iter().collect();
        let outputs = graph.concat(&refs, 2)?;
        let outputs = graph.transpose(&outputs, &[0, 2, 1])?;
        if self.decode_in_inference {
            self.trace_decode(graph, &outputs, &grid_sizes)
        } else {
            Ok(outputs)
        }
    }

    fn trace_decode(
        &self,
        graph: &mut GraphBuilder,
        outputs: &Value,
        grid_sizes: &[(usize, usize)],
    ) -> ml_onnx::Result<Value> {
        let (grids, strides) = decode_tables(grid_sizes);
        let n = strides.len();
        let grids = graph.initializer_f32("grids", &[1, n, 2], &grids)?;
        let strides = graph.initializer_f32("strides", &[1, n, 1], &strides)?;

        let xy = graph.slice(outputs, &[0], &[2], &[2], &[1])?;
        let xy = graph.add(&xy, &grids)?;
        let xy = graph.mul(&xy, &strides)?;
        let wh = graph.slice(outputs, &[2], &[4], &[2], &[1])?;
        let wh = graph.exp(&wh)?;
        let wh = graph.mul(&wh, &strides)?;
        let rest = graph.slice(outputs, &[4], &[i64::MAX], &[2], &[1])?;
        graph.concat(&[&xy, &wh, &rest], 2)
    }
}

/// Grid offsets `(x, y)` and per-row strides for the given feature map sizes.
#[allow(clippy::cast_precision_loss)]
fn decode_tables(grid_sizes: &[(usize, usize)]) -> (Vec<f32>, Vec<f32>) {
    let mut grids = Vec::new();
    let mut strides = Vec::new();
    for (&(h, w), &stride) in grid_sizes.iter().zip(STRIDES.iter()) {
        for y in 0..h {
            for x in 0..w {
                grids.push(x as f32);
                grids.push(y as f32);
                strides.push(stride as f32);
            }
        }
    }
    (grids, strides)
}

impl Module for YoloxHead {
    fn visit(&self, prefix: &str, visitor: &mut dyn ModuleVisitor) {
        self.cls_convs.visit(&child(prefix, "cls_convs"), visitor);
        self.reg_convs.visit(&child(prefix, "reg_convs"), visitor);
        self.cls_preds.visit(&child(prefix, "cls_preds"), visitor);
        self.reg_preds.visit(&child(prefix, "reg_preds"), visitor);
        self.obj_preds.visit(&child(prefix, "obj_preds"), visitor);
        self.stems.visit(&child(prefix, "stems"), visitor);
    }

    fn map(&mut self, prefix: &str, mapper: &mut dyn ModuleMapper) {
        self.cls_convs.map(&child(prefix, "cls_convs"), mapper);
        self.reg_convs.map(&child(prefix, "reg_convs"), mapper);
        self.cls_preds.map(&child(prefix, "cls_preds"), mapper);
        self.reg_preds.map(&child(prefix, "reg_preds"), mapper);
        self.obj_preds.map(&child(prefix, "obj_preds"), mapper);
        self.stems.map(&child(prefix, "stems"), mapper);
    }
}

/// Complete YOLOX detector.
#[derive(Debug, Clone)]
pub struct Yolox {
    backbone: YoloPafpn,
    head: YoloxHead,
    training: bool,
}

impl Yolox {
    /// Builds a detector in training mode, as a freshly constructed
    /// PyTorch module would be.
    #[must_use]
    pub fn new(
        depth: f64,
        width: f64,
        num_classes: usize,
        depthwise: bool,
        act: Activation,
    ) -> Self {
        debug!(depth, width, num_classes, depthwise, "building YOLOX");
        Self {
            backbone: YoloPafpn::new(depth, width, depthwise, act),
            head: YoloxHead::new(num_classes, width, depthwise, act),
            training: true,
        }
    }

    /// Switches to inference mode.
    pub fn eval(&mut self) -> &mut Self {
        self.training = false;
        self
    }

    /// Switches to training mode.
    pub fn train(&mut self) -> &mut Self {
        self.training = true;
        self
    }

    /// Returns `true` in training mode.
    #[must_use]
    pub const fn is_training(&self) -> bool {
        self.training
    }

    /// The detection head.
    #[must_use]
    pub const fn head(&self) -> &YoloxHead {
        &self.head
    }

    /// Mutable access to the detection head.
    pub fn head_mut(&mut self) -> &mut YoloxHead {
        &mut self.head
    }

    /// Number of predictions for an input of `height x width` pixels.
    #[must_use]
    pub fn num_predictions(height: usize, width: usize) -> usize {
        STRIDES.iter().map(|s| (height / s) * (width / s)).sum()
    }
}

impl Module for Yolox {
    fn visit(&self, prefix: &str, visitor: &mut dyn ModuleVisitor) {
        self.backbone.visit(&child(prefix, "backbone"), visitor);
        self.head.visit(&child(prefix, "head"), visitor);
    }

    fn map(&mut self, prefix: &str, mapper: &mut dyn ModuleMapper) {
        self.backbone.map(&child(prefix, "backbone"), mapper);
        self.head.map(&child(prefix, "head"), mapper);
    }
}

impl Trace for Yolox {
    fn trace(&self, graph: &mut GraphBuilder, input: Value) -> ml_onnx::Result<Value> {
        if self.training {
            return Err(OnnxError::trace(
                "model is in training mode; call eval() before export",
            ));
        }
        let dims = graph.shape(&input)?.to_vec();
        if dims.len() != 4 || dims[1] != 3 || dims[2] % 32 != 0 || dims[3] % 32 != 0 {
            return Err(OnnxError::shape_mismatch(
                "Yolox",
                format!("expected [N, 3, H, W] with H and W multiples of 32, got {dims:?}"),
            ));
        }
        let features = graph.scope("backbone", |g| self.backbone.trace_features(g, input))?;
        graph.scope("head", |g| self.head.trace_head(g, features))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ActivationKind;
    use ml_onnx::proto::data_type;

    fn tiny() -> Yolox {
        let mut model = Yolox::new(0.33, 0.125, 3, false, Activation::Silu);
        model.replace_activation(ActivationKind::Silu, Activation::ExportSilu);
        model.eval();
        model
    }

    fn shape_of(model: &Yolox, name: &str) -> Option<Vec<usize>> {
        model
            .named_parameters()
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p.shape().to_vec())
    }

    #[test]
    fn banker_rounding() {
        assert_eq!(round_half_even(0.99), 1);
        assert_eq!(round_half_even(2.5), 2);
        assert_eq!(round_half_even(3.5), 4);
        assert_eq!(round_half_even(3.99), 4);
    }

    #[test]
    fn parameter_names_match_pytorch() {
        let model = Yolox::new(0.33, 0.5, 80, false, Activation::Silu);
        assert_eq!(
            shape_of(&model, "backbone.backbone.stem.conv.conv.weight"),
            Some(vec![32, 12, 3, 3])
        );
        assert_eq!(
            shape_of(&model, "backbone.backbone.dark5.1.conv2.conv.weight"),
            Some(vec![512, 1024, 1, 1])
        );
        assert_eq!(
            shape_of(&model, "backbone.C3_n4.conv3.conv.weight"),
            Some(vec![512, 512, 1, 1])
        );
        assert_eq!(shape_of(&model, "head.cls_preds.2.bias"), Some(vec![80]));
        assert_eq!(
            shape_of(&model, "head.reg_convs.1.1.bn.num_batches_tracked"),
            Some(vec![])
        );
    }

    #[test]
    fn published_parameter_counts() {
        let s = Yolox::new(0.33, 0.5, 80, false, Activation::Silu);
        assert_eq!(s.num_params(), 8_968_255);
        let nano = Yolox::new(0.33, 0.25, 80, true, Activation::Silu);
        assert_eq!(nano.num_params(), 912_159);
    }

    #[test]
    fn depthwise_uses_dwconv() {
        let model = Yolox::new(0.33, 0.25, 80, true, Activation::Silu);
        assert_eq!(
            shape_of(&model, "backbone.backbone.dark2.0.dconv.conv.weight"),
            Some(vec![16, 1, 3, 3])
        );
        assert_eq!(
            shape_of(&model, "head.cls_convs.0.0.pconv.conv.weight"),
            Some(vec![64, 64, 1, 1])
        );
    }

    #[test]
    fn bias_prior() {
        let mut model = Yolox::new(0.33, 0.125, 3, false, Activation::Silu);
        model.head_mut().initialize_biases(PRIOR_PROB);
        let state = model.state_dict();
        let expected = -(0.99_f32 / 0.01).ln();
        let cls = state
            .get("head.cls_preds.0.bias")
            .map(|p| p.as_f32().unwrap_or_default().to_vec())
            .unwrap_or_default();
        assert_eq!(cls.len(), 3);
        assert!(cls.iter().all(|v| (v - expected).abs() < 1e-6));
        let reg = state
            .get("head.reg_preds.0.bias")
            .map(|p| p.as_f32().unwrap_or_default().to_vec())
            .unwrap_or_default();
        assert_eq!(reg, vec![0.0; 4]);
    }

    #[test]
    fn training_model_refuses_trace() {
        let mut model = tiny();
        model.train();
        let mut graph = GraphBuilder::new(11).unwrap();
        let x = graph.input("input", data_type::FLOAT, &[1, 3, 64, 64]).unwrap();
        assert!(matches!(model.trace(&mut graph, x), Err(OnnxError::Trace(_))));
    }

    #[test]
    fn standard_silu_refuses_trace() {
        let mut model = Yolox::new(0.33, 0.125, 3, false, Activation::Silu);
        model.eval();
        let mut graph = GraphBuilder::new(11).unwrap();
        let x = graph.input("input", data_type::FLOAT, &[1, 3, 64, 64]).unwrap();
        assert!(matches!(
            model.trace(&mut graph, x),
            Err(OnnxError::UnsupportedOperator(_))
        ));
    }

    #[test]
    fn traced_output_shape() {
        let model = tiny();
        let mut graph = GraphBuilder::new(11).unwrap();
        let x = graph.input("input", data_type::FLOAT, &[1, 3, 96, 64]).unwrap();
        let y = model.trace(&mut graph, x).unwrap();
        assert_eq!(Yolox::num_predictions(96, 64), 126);
        assert_eq!(graph.shape(&y).unwrap(), [1, 126, 8]);
    }

    #[test]
    fn trace_emits_every_parameter() {
        let model = tiny();
        let mut graph = GraphBuilder::new(11).unwrap();
        let x = graph.input("input", data_type::FLOAT, &[1, 3, 64, 64]).unwrap();
        let y = model.trace(&mut graph, x).unwrap();
        let onnx = graph.finish(&[(&y, "output")]).unwrap();
        let inits: Vec<String> = onnx
            .graph
            .unwrap()
            .initializer
            .into_iter()
            .map(|t| t.name)
            .collect();
        for (name, _) in model.named_parameters() {
            if name.ends_with("num_batches_tracked") {
                continue;
            }
            assert!(inits.contains(&name), "{name} missing");
        }
        assert!(inits.iter().any(|n| n == "head.grids"));
    }

    #[test]
    fn decode_tables_are_row_major() {
        let (grids, strides) = decode_tables(&[(2, 3), (1, 1)]);
        assert_eq!(grids, vec![0., 0., 1., 0., 2., 0., 0., 1., 1., 1., 2., 1., 0., 0.]);
        assert_eq!(strides, vec![8., 8., 8., 8., 8., 8., 16.]);
    }

    #[test]
    fn raw_head_output_skips_decode() {
        let mut model = tiny();
        model.head_mut().set_decode_in_inference(false);
        let mut graph = GraphBuilder::new(11).unwrap();
        let x = graph.input("input", data_type::FLOAT, &[1, 3, 64, 64]).unwrap();
        let y = model.trace(&mut graph, x).unwrap();
        let onnx = graph.finish(&[(&y, "output")]).unwrap();
        let graph = onnx.graph.unwrap();
        assert!(graph.node.iter().all(|n| n.op_type != "Exp"));
    }
}
