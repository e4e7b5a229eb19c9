//! Graph tracer.
//!
//! [`GraphBuilder`] records ONNX nodes while a module tree runs once on a
//! symbolic input. Every operation checks its operand shapes and infers the
//! static output shape, so a traced graph carries complete `value_info` and
//! no dynamic dimensions.
//!
//! Naming follows the PyTorch exporter: nodes are named after the module
//! scope (`/backbone/stem/conv/Conv`), outputs append `_output_<i>`, and
//! initializers use the dotted parameter path (`backbone.stem.conv.weight`).

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::error::{OnnxError, Result};
use crate::opset::Opset;
use crate::proto::{
    AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto,
    StringStringEntryProto, TensorProto, ValueInfoProto, attribute_type, data_type,
};
use crate::tensor::{TensorInfo, float_tensor, int64_tensor};

/// Handle to a value recorded in a [`GraphBuilder`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Value {
    name: String,
}

impl Value {
    /// Returns the graph-level value name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// 2-D convolution attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvAttrs {
    /// Stride along both spatial axes.
    pub stride: usize,
    /// Symmetric zero padding along both spatial axes.
    pub padding: usize,
    /// Number of channel groups.
    pub groups: usize,
}

impl Default for ConvAttrs {
    fn default() -> Self {
        Self {
            stride: 1,
            padding: 0,
            groups: 1,
        }
    }
}

/// Records an ONNX graph with static shape inference.
#[derive(Debug)]
pub struct GraphBuilder {
    opset: Opset,
    graph_name: String,
    producer_name: String,
    producer_version: String,
    metadata: Vec<(String, String)>,
    nodes: Vec<NodeProto>,
    initializers: Vec<TensorProto>,
    inputs: Vec<ValueInfoProto>,
    values: HashMap<String, TensorInfo>,
    intermediates: Vec<String>,
    scope: Vec<String>,
    node_names: HashMap<String, usize>,
}

impl GraphBuilder {
    /// Creates an empty builder for the given opset version.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::UnsupportedOpset` for versions outside the supported range.
    pub fn new(opset: u32) -> Result<Self> {
        Ok(Self::with_opset(Opset::new(opset)?))
    }

    /// Creates an empty builder for a validated opset.
    #[must_use]
    pub fn with_opset(opset: Opset) -> Self {
        Self {
            opset,
            graph_name: "main_graph".to_string(),
            producer_name: env!("CARGO_PKG_NAME").to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            metadata: Vec::new(),
            nodes: Vec::new(),
            initializers: Vec::new(),
            inputs: Vec::new(),
            values: HashMap::new(),
            intermediates: Vec::new(),
            scope: Vec::new(),
            node_names: HashMap::new(),
        }
    }

    /// Sets the graph name.
    #[must_use]
    pub fn with_graph_name(mut self, name: impl Into<String>) -> Self {
        self.graph_name = name.into();
        self
    }

    /// Sets the producer name and version.
    #[must_use]
    pub fn with_producer(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.producer_name = name.into();
        self.producer_version = version.into();
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }

    /// Returns the opset being traced.
    #[must_use]
    pub const fn opset(&self) -> Opset {
        self.opset
    }

    /// Number of nodes recorded so far.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Runs `f` inside a named module scope.
    ///
    /// The scope is popped even if `f` fails.
    ///
    /// # Errors
    ///
    /// Propagates the error returned by `f`.
    pub fn scope<T>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.scope.push(name.to_string());
        let result = f(self);
        self.scope.pop();
        result
    }

    /// Static description of a value.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::Trace` if the value was not recorded by this builder.
    pub fn info(&self, value: &Value) -> Result<&TensorInfo> {
        self.values
            .get(&value.name)
            .ok_or_else(|| OnnxError::trace(format!("unknown value {}", value.name)))
    }

    /// Static dimensions of a value.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::Trace` if the value was not recorded by this builder.
    pub fn shape(&self, value: &Value) -> Result<&[usize]> {
        Ok(&self.info(value)?.dims)
    }

    /// Element type of a value.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::Trace` if the value was not recorded by this builder.
    pub fn elem_type(&self, value: &Value) -> Result<i32> {
        Ok(self.info(value)?.elem_type)
    }

    /// Declares a graph input.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::DuplicateName` if the name is taken.
    pub fn input(&mut self, name: &str, elem_type: i32, dims: &[usize]) -> Result<Value> {
        self.claim(name)?;
        self.inputs
            .push(ValueInfoProto::tensor(name, elem_type, dims));
        self.values
            .insert(name.to_string(), TensorInfo::new(elem_type, dims));
        Ok(Value {
            name: name.to_string(),
        })
    }

    /// Records a float32 initializer under the current scope.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::InvalidInitializer` if `values` does not fill `dims`,
    /// or `OnnxError::DuplicateName` if the scoped name is taken.
    pub fn initializer_f32(&mut self, local: &str, dims: &[usize], values: &[f32]) -> Result<Value> {
        let name = self.param_name(local);
        check_len(&name, dims, values.len())?;
        self.push_initializer(float_tensor(&name, dims, values), TensorInfo::float(dims))
    }

    /// Records an int64 initializer under the current scope.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::InvalidInitializer` if `values` does not fill `dims`,
    /// or `OnnxError::DuplicateName` if the scoped name is taken.
    pub fn initializer_i64(&mut self, local: &str, dims: &[usize], values: &[i64]) -> Result<Value> {
        let name = self.param_name(local);
        check_len(&name, dims, values.len())?;
        self.push_initializer(
            int64_tensor(&name, dims, values),
            TensorInfo::new(data_type::INT64, dims),
        )
    }

    /// Emits a `Constant` node holding a 1-D int64 tensor.
    pub fn constant_i64(&mut self, values: &[i64]) -> Value {
        let dims = [values.len()];
        self.constant(int64_tensor("", &dims, values), TensorInfo::new(data_type::INT64, dims))
    }

    /// Emits a `Constant` node holding a float32 tensor.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::InvalidInitializer` if `values` does not fill `dims`.
    pub fn constant_f32(&mut self, dims: &[usize], values: &[f32]) -> Result<Value> {
        check_len("Constant", dims, values.len())?;
        Ok(self.constant(float_tensor("", dims, values), TensorInfo::float(dims)))
    }

    /// 2-D convolution.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::ShapeMismatch` if input, weight and bias do not agree.
    pub fn conv(
        &mut self,
        x: &Value,
        weight: &Value,
        bias: Option<&Value>,
        attrs: ConvAttrs,
    ) -> Result<Value> {
        let x_dims = self.float_rank("Conv", x, 4)?.to_vec();
        let w_dims = self.float_rank("Conv", weight, 4)?.to_vec();
        let groups = attrs.groups.max(1);
        if w_dims[1] * groups != x_dims[1] || w_dims[0] % groups != 0 {
            return Err(OnnxError::shape_mismatch(
                "Conv",
                format!("weight {w_dims:?} with {groups} groups cannot consume input {x_dims:?}"),
            ));
        }
        if let Some(bias) = bias {
            let b_dims = self.shape(bias)?;
            if b_dims != [w_dims[0]] {
                return Err(OnnxError::shape_mismatch(
                    "Conv",
                    format!("bias {b_dims:?} for {} output channels", w_dims[0]),
                ));
            }
        }
        let stride = attrs.stride.max(1);
        let out_h = window_output("Conv", x_dims[2], w_dims[2], stride, attrs.padding)?;
        let out_w = window_output("Conv", x_dims[3], w_dims[3], stride, attrs.padding)?;

        let mut inputs = vec![x.name.clone(), weight.name.clone()];
        if let Some(bias) = bias {
            inputs.push(bias.name.clone());
        }
        let pad = to_i64(attrs.padding);
        let attributes = vec![
            AttributeProto::ints("dilations", &[1, 1]),
            AttributeProto::int("group", to_i64(groups)),
            AttributeProto::ints("kernel_shape", &[to_i64(w_dims[2]), to_i64(w_dims[3])]),
            AttributeProto::ints("pads", &[pad, pad, pad, pad]),
            AttributeProto::ints("strides", &[to_i64(stride), to_i64(stride)]),
        ];
        Ok(self.node(
            "Conv",
            inputs,
            attributes,
            TensorInfo::float([x_dims[0], w_dims[0], out_h, out_w]),
        ))
    }

    /// Inference-mode batch normalization over the channel axis.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::ShapeMismatch` if a statistic is not `[C]`.
    pub fn batch_norm(
        &mut self,
        x: &Value,
        params: [&Value; 4],
        epsilon: f32,
        momentum: f32,
    ) -> Result<Value> {
        let x_dims = self.float_rank("BatchNormalization", x, 4)?.to_vec();
        for p in params {
            let p_dims = self.shape(p)?;
            if p_dims != [x_dims[1]] {
                return Err(OnnxError::shape_mismatch(
                    "BatchNormalization",
                    format!("parameter {} has shape {p_dims:?}, expected [{}]", p.name, x_dims[1]),
                ));
            }
        }
        let mut inputs = vec![x.name.clone()];
        inputs.extend(params.iter().map(|p| p.name.clone()));
        Ok(self.node(
            "BatchNormalization",
            inputs,
            vec![
                AttributeProto::float("epsilon", epsilon),
                AttributeProto::float("momentum", momentum),
            ],
            TensorInfo::float(x_dims),
        ))
    }

    /// Element-wise `max(x, 0)`.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::Trace` for an unknown value.
    pub fn relu(&mut self, x: &Value) -> Result<Value> {
        self.unary("Relu", x, Vec::new())
    }

    /// Element-wise leaky rectifier.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::Trace` for an unknown value.
    pub fn leaky_relu(&mut self, x: &Value, alpha: f32) -> Result<Value> {
        self.unary("LeakyRelu", x, vec![AttributeProto::float("alpha", alpha)])
    }

    /// Element-wise logistic function.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::Trace` for an unknown value.
    pub fn sigmoid(&mut self, x: &Value) -> Result<Value> {
        self.unary("Sigmoid", x, Vec::new())
    }

    /// Element-wise natural exponential.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::Trace` for an unknown value.
    pub fn exp(&mut self, x: &Value) -> Result<Value> {
        self.unary("Exp", x, Vec::new())
    }

    /// Pass-through copy.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::Trace` for an unknown value.
    pub fn identity(&mut self, x: &Value) -> Result<Value> {
        self.unary("Identity", x, Vec::new())
    }

    /// Broadcasting addition.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::ShapeMismatch` if the shapes do not broadcast.
    pub fn add(&mut self, a: &Value, b: &Value) -> Result<Value> {
        self.binary("Add", a, b)
    }

    /// Broadcasting multiplication.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::ShapeMismatch` if the shapes do not broadcast.
    pub fn mul(&mut self, a: &Value, b: &Value) -> Result<Value> {
        self.binary("Mul", a, b)
    }

    /// Concatenation along `axis` (negative counts from the end).
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::ShapeMismatch` if the operands differ in type, rank
    /// or any non-concatenated dimension.
    pub fn concat(&mut self, values: &[&Value], axis: i64) -> Result<Value> {
        let Some(first) = values.first() else {
            return Err(OnnxError::shape_mismatch("Concat", "no operands"));
        };
        let first = self.info(first)?.clone();
        let axis_idx = normalize_axis("Concat", axis, first.rank())?;
        let mut dims = first.dims.clone();
        dims[axis_idx] = 0;
        for v in values {
            let info = self.info(v)?;
            let compatible = info.elem_type == first.elem_type
                && info.rank() == first.rank()
                && info
                    .dims
                    .iter()
                    .zip(&first.dims)
                    .enumerate()
                    .all(|(i, (a, b))| i == axis_idx || a == b);
            if !compatible {
                return Err(OnnxError::shape_mismatch(
                    "Concat",
                    format!("{:?} does not concatenate with {:?} on axis {axis}", info.dims, first.dims),
                ));
            }
            dims[axis_idx] += info.dims[axis_idx];
        }
        let inputs = values.iter().map(|v| v.name.clone()).collect();
        Ok(self.node(
            "Concat",
            inputs,
            vec![AttributeProto::int("axis", axis)],
            TensorInfo::new(first.elem_type, dims),
        ))
    }

    /// Strided slice. `ends` may use `i64::MAX` for "to the end".
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::ShapeMismatch` for inconsistent argument lengths or
    /// axes, and `OnnxError::UnsupportedOperator` for non-positive steps.
    pub fn slice(
        &mut self,
        x: &Value,
        starts: &[i64],
        ends: &[i64],
        axes: &[i64],
        steps: &[i64],
    ) -> Result<Value> {
        let info = self.info(x)?.clone();
        if starts.len() != axes.len() || ends.len() != axes.len() || steps.len() != axes.len() {
            return Err(OnnxError::shape_mismatch(
                "Slice",
                "starts, ends, axes and steps must have equal length",
            ));
        }
        let mut dims = info.dims.clone();
        for (i, &axis) in axes.iter().enumerate() {
            let axis = normalize_axis("Slice", axis, info.rank())?;
            if steps[i] <= 0 {
                return Err(OnnxError::unsupported_operator(format!(
                    "Slice with step {}",
                    steps[i]
                )));
            }
            let dim = to_i64(info.dims[axis]);
            let clamp = |v: i64| (if v < 0 { v + dim } else { v }).clamp(0, dim);
            let (start, end) = (clamp(starts[i]), clamp(ends[i]));
            let len = if end > start {
                (end - start + steps[i] - 1) / steps[i]
            } else {
                0
            };
            dims[axis] = usize::try_from(len).unwrap_or(0);
        }
        let starts = self.constant_i64(starts);
        let ends = self.constant_i64(ends);
        let axes = self.constant_i64(axes);
        let steps = self.constant_i64(steps);
        Ok(self.node(
            "Slice",
            vec![x.name.clone(), starts.name, ends.name, axes.name, steps.name],
            Vec::new(),
            TensorInfo::new(info.elem_type, dims),
        ))
    }

    /// 2-D max pooling with a square window.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::ShapeMismatch` if the window does not fit the input.
    pub fn max_pool(
        &mut self,
        x: &Value,
        kernel: usize,
        stride: usize,
        padding: usize,
    ) -> Result<Value> {
        let dims = self.float_rank("MaxPool", x, 4)?.to_vec();
        let stride = stride.max(1);
        let out_h = window_output("MaxPool", dims[2], kernel, stride, padding)?;
        let out_w = window_output("MaxPool", dims[3], kernel, stride, padding)?;
        let (k, s, p) = (to_i64(kernel), to_i64(stride), to_i64(padding));
        Ok(self.node(
            "MaxPool",
            vec![x.name.clone()],
            vec![
                AttributeProto::int("ceil_mode", 0),
                AttributeProto::ints("kernel_shape", &[k, k]),
                AttributeProto::ints("pads", &[p, p, p, p]),
                AttributeProto::ints("strides", &[s, s]),
            ],
            TensorInfo::float([dims[0], dims[1], out_h, out_w]),
        ))
    }

    /// Nearest-neighbour spatial upsampling by an integer factor.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::ShapeMismatch` if `x` is not a 4-D float tensor.
    pub fn resize_nearest(&mut self, x: &Value, scale: usize) -> Result<Value> {
        let dims = self.float_rank("Resize", x, 4)?.to_vec();
        let roi = self.constant_f32(&[0], &[])?;
        #[allow(clippy::cast_precision_loss)]
        let factor = scale as f32;
        let scales = self.constant_f32(&[4], &[1.0, 1.0, factor, factor])?;
        Ok(self.node(
            "Resize",
            vec![x.name.clone(), roi.name, scales.name],
            vec![
                AttributeProto::string("coordinate_transformation_mode", "asymmetric"),
                AttributeProto::float("cubic_coeff_a", -0.75),
                AttributeProto::string("mode", "nearest"),
                AttributeProto::string("nearest_mode", "floor"),
            ],
            TensorInfo::float([dims[0], dims[1], dims[2] * scale, dims[3] * scale]),
        ))
    }

    /// Reshape; one target dimension may be `-1` and `0` copies the input dimension.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::ShapeMismatch` if the element counts disagree.
    pub fn reshape(&mut self, x: &Value, shape: &[i64]) -> Result<Value> {
        let info = self.info(x)?.clone();
        let mut dims = Vec::with_capacity(shape.len());
        let mut inferred = None;
        for (i, &d) in shape.iter().enumerate() {
            match d {
                -1 if inferred.is_none() => {
                    inferred = Some(i);
                    dims.push(1);
                }
                0 => dims.push(info.dims.get(i).copied().ok_or_else(|| {
                    OnnxError::shape_mismatch("Reshape", format!("no input dimension {i} to copy"))
                })?),
                d if d > 0 => dims.push(usize::try_from(d).unwrap_or(0)),
                _ => {
                    return Err(OnnxError::shape_mismatch(
                        "Reshape",
                        format!("invalid target shape {shape:?}"),
                    ));
                }
            }
        }
        let known: usize = dims.iter().product();
        if let Some(i) = inferred {
            if known == 0 || info.numel() % known != 0 {
                return Err(OnnxError::shape_mismatch(
                    "Reshape",
                    format!("cannot infer {shape:?} from {:?}", info.dims),
                ));
            }
            dims[i] = info.numel() / known;
        }
        if dims.iter().product::<usize>() != info.numel() {
            return Err(OnnxError::shape_mismatch(
                "Reshape",
                format!("{:?} cannot be reshaped to {shape:?}", info.dims),
            ));
        }
        let target = self.constant_i64(shape);
        Ok(self.node(
            "Reshape",
            vec![x.name.clone(), target.name],
            Vec::new(),
            TensorInfo::new(info.elem_type, dims),
        ))
    }

    /// Axis permutation.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::ShapeMismatch` if `perm` is not a permutation of the input axes.
    pub fn transpose(&mut self, x: &Value, perm: &[usize]) -> Result<Value> {
        let info = self.info(x)?.clone();
        let mut seen = vec![false; info.rank()];
        for &p in perm {
            match seen.get_mut(p) {
                Some(s) if !*s => *s = true,
                _ => {
                    return Err(OnnxError::shape_mismatch(
                        "Transpose",
                        format!("{perm:?} is not a permutation of rank {}", info.rank()),
                    ));
                }
            }
        }
        if perm.len() != info.rank() {
            return Err(OnnxError::shape_mismatch(
                "Transpose",
                format!("{perm:?} is not a permutation of rank {}", info.rank()),
            ));
        }
        let dims = perm.iter().map(|&p| info.dims[p]).collect::<Vec<_>>();
        let perm = perm.iter().map(|&p| to_i64(p)).collect::<Vec<_>>();
        Ok(self.node(
            "Transpose",
            vec![x.name.clone()],
            vec![AttributeProto::ints("perm", &perm)],
            TensorInfo::new(info.elem_type, dims),
        ))
    }

    /// Maximum over `axes`.
    ///
    /// Axes are an attribute below opset 18 and an input from 18 on.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::ShapeMismatch` for out-of-range axes.
    pub fn reduce_max(&mut self, x: &Value, axes: &[i64], keepdims: bool) -> Result<Value> {
        let info = self.info(x)?.clone();
        let mut reduced = HashSet::new();
        for &axis in axes {
            reduced.insert(normalize_axis("ReduceMax", axis, info.rank())?);
        }
        let dims = reduced_dims(&info.dims, &reduced, keepdims);
        let keep = AttributeProto::int("keepdims", i64::from(keepdims));
        let (inputs, attributes) = if self.opset.reduce_axes_as_input() {
            let axes = self.constant_i64(axes);
            (vec![x.name.clone(), axes.name], vec![keep])
        } else {
            (vec![x.name.clone()], vec![AttributeProto::ints("axes", axes), keep])
        };
        Ok(self.node(
            "ReduceMax",
            inputs,
            attributes,
            TensorInfo::new(info.elem_type, dims),
        ))
    }

    /// Index of the maximum along `axis`, first occurrence on ties.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::ShapeMismatch` for an out-of-range axis.
    pub fn arg_max(&mut self, x: &Value, axis: i64, keepdims: bool) -> Result<Value> {
        let info = self.info(x)?.clone();
        let axis_idx = normalize_axis("ArgMax", axis, info.rank())?;
        let dims = reduced_dims(&info.dims, &HashSet::from([axis_idx]), keepdims);
        let mut attributes = vec![
            AttributeProto::int("axis", axis),
            AttributeProto::int("keepdims", i64::from(keepdims)),
        ];
        if self.opset.has_select_last_index() {
            attributes.push(AttributeProto::int("select_last_index", 0));
        }
        Ok(self.node(
            "ArgMax",
            vec![x.name.clone()],
            attributes,
            TensorInfo::new(data_type::INT64, dims),
        ))
    }

    /// Element type conversion.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::Trace` for an unknown value.
    pub fn cast(&mut self, x: &Value, to: i32) -> Result<Value> {
        let info = self.info(x)?.clone();
        Ok(self.node(
            "Cast",
            vec![x.name.clone()],
            vec![AttributeProto::int("to", i64::from(to))],
            TensorInfo::new(to, info.dims),
        ))
    }

    /// Finalizes the graph, naming each `(value, name)` pair as a graph output.
    ///
    /// A value produced by a node is renamed in place; graph inputs and
    /// initializers are routed through an `Identity` node instead.
    ///
    /// # Errors
    ///
    /// Returns `OnnxError::DuplicateName` if an output name collides with an
    /// existing value, or `OnnxError::Trace` for unknown values.
    pub fn finish(mut self, outputs: &[(&Value, &str)]) -> Result<ModelProto> {
        let mut graph_outputs: Vec<ValueInfoProto> = Vec::with_capacity(outputs.len());
        let mut renamed: HashMap<String, String> = HashMap::new();
        for &(value, name) in outputs {
            let info = self.info(value)?.clone();
            if value.name != name {
                self.claim(name)?;
                let produced = self
                    .nodes
                    .iter()
                    .any(|n| n.output.iter().any(|o| *o == value.name));
                if produced && !renamed.contains_key(&value.name) {
                    self.rename(&value.name, name);
                    renamed.insert(value.name.clone(), name.to_string());
                } else {
                    let source = Value {
                        name: renamed.get(&value.name).unwrap_or(&value.name).clone(),
                    };
                    self.values.insert(source.name.clone(), info.clone());
                    let copy = self.identity(&source)?;
                    self.rename(&copy.name, name);
                }
                self.values.insert(name.to_string(), info.clone());
            }
            graph_outputs.push(ValueInfoProto::tensor(name, info.elem_type, &info.dims));
        }

        let output_names = graph_outputs
            .iter()
            .map(|o| o.name.clone())
            .collect::<HashSet<_>>();
        let value_info = self
            .intermediates
            .iter()
            .filter(|name| !output_names.contains(*name))
            .filter_map(|name| {
                self.values
                    .get(name)
                    .map(|info| ValueInfoProto::tensor(name.as_str(), info.elem_type, &info.dims))
            })
            .collect();

        debug!(
            nodes = self.nodes.len(),
            initializers = self.initializers.len(),
            opset = self.opset.version(),
            "finished graph trace"
        );

        let graph = GraphProto {
            node: self.nodes,
            name: self.graph_name,
            initializer: self.initializers,
            doc_string: String::new(),
            input: self.inputs,
            output: graph_outputs,
            value_info,
        };
        Ok(ModelProto {
            ir_version: self.opset.ir_version(),
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: i64::from(self.opset.version()),
            }],
            producer_name: self.producer_name,
            producer_version: self.producer_version,
            domain: String::new(),
            model_version: 0,
            doc_string: String::new(),
            graph: Some(graph),
            metadata_props: self
                .metadata
                .into_iter()
                .map(|(key, value)| StringStringEntryProto { key, value })
                .collect(),
        })
    }

    fn param_name(&self, local: &str) -> String {
        if self.scope.is_empty() {
            local.to_string()
        } else {
            format!("{}.{local}", self.scope.join("."))
        }
    }

    fn claim(&self, name: &str) -> Result<()> {
        if self.values.contains_key(name) {
            return Err(OnnxError::duplicate_name(name));
        }
        Ok(())
    }

    fn push_initializer(&mut self, tensor: TensorProto, info: TensorInfo) -> Result<Value> {
        self.claim(&tensor.name)?;
        let name = tensor.name.clone();
        self.initializers.push(tensor);
        self.values.insert(name.clone(), info);
        Ok(Value { name })
    }

    fn constant(&mut self, tensor: TensorProto, info: TensorInfo) -> Value {
        let attr = AttributeProto {
            name: "value".to_string(),
            r#type: attribute_type::TENSOR,
            t: Some(tensor),
            ..AttributeProto::default()
        };
        self.node("Constant", Vec::new(), vec![attr], info)
    }

    fn unary(&mut self, op: &str, x: &Value, attributes: Vec<AttributeProto>) -> Result<Value> {
        let info = self.info(x)?.clone();
        Ok(self.node(op, vec![x.name.clone()], attributes, info))
    }

    fn binary(&mut self, op: &str, a: &Value, b: &Value) -> Result<Value> {
        let a_info = self.info(a)?.clone();
        let b_info = self.info(b)?;
        if a_info.elem_type != b_info.elem_type {
            return Err(OnnxError::shape_mismatch(
                op,
                format!(
                    "element types {} and {} differ",
                    a_info.elem_type, b_info.elem_type
                ),
            ));
        }
        let dims = broadcast(op, &a_info.dims, &b_info.dims)?;
        Ok(self.node(
            op,
            vec![a.name.clone(), b.name.clone()],
            Vec::new(),
            TensorInfo::new(a_info.elem_type, dims),
        ))
    }

    fn float_rank(&self, op: &str, x: &Value, rank: usize) -> Result<&[usize]> {
        let info = self.info(x)?;
        if info.rank() != rank || info.elem_type != data_type::FLOAT {
            return Err(OnnxError::shape_mismatch(
                op,
                format!(
                    "{} must be a rank-{rank} float tensor, got {:?} of type {}",
                    x.name, info.dims, info.elem_type
                ),
            ));
        }
        Ok(&info.dims)
    }

    fn node(
        &mut self,
        op_type: &str,
        inputs: Vec<String>,
        attributes: Vec<AttributeProto>,
        output: TensorInfo,
    ) -> Value {
        let base = if self.scope.is_empty() {
            format!("/{op_type}")
        } else {
            format!("/{}/{op_type}", self.scope.join("/"))
        };
        let count = self.node_names.entry(base.clone()).or_insert(0);
        let name = if *count == 0 {
            base
        } else {
            format!("{base}_{count}")
        };
        *count += 1;

        let output_name = format!("{name}_output_0");
        self.nodes.push(NodeProto {
            input: inputs,
            output: vec![output_name.clone()],
            name,
            op_type: op_type.to_string(),
            domain: String::new(),
            attribute: attributes,
            doc_string: String::new(),
        });
        self.values.insert(output_name.clone(), output);
        self.intermediates.push(output_name.clone());
        Value { name: output_name }
    }

    fn rename(&mut self, from: &str, to: &str) {
        for node in &mut self.nodes {
            for name in node.input.iter_mut().chain(node.output.iter_mut()) {
                if name == from {
                    *name = to.to_string();
                }
            }
        }
        self.intermediates.retain(|n| n != from);
    }
}

fn check_len(name: &str, dims: &[usize], len: usize) -> Result<()> {
    let expected: usize = dims.iter().product();
    if expected != len {
        return Err(OnnxError::invalid_initializer(
            name,
            format!("{len} values for shape {dims:?}"),
        ));
    }
    Ok(())
}

fn window_output(op: &str, size: usize, kernel: usize, stride: usize, padding: usize) -> Result<usize> {
    (size + 2 * padding)
        .checked_sub(kernel)
        .map(|span| span / stride + 1)
        .ok_or_else(|| {
            OnnxError::shape_mismatch(
                op,
                format!("window {kernel} exceeds padded extent {}", size + 2 * padding),
            )
        })
}

fn normalize_axis(op: &str, axis: i64, rank: usize) -> Result<usize> {
    let rank_i = to_i64(rank);
    let idx = if axis < 0 { axis + rank_i } else { axis };
    if (0..rank_i).contains(&idx) {
        Ok(usize::try_from(idx).unwrap_or(0))
    } else {
        Err(OnnxError::shape_mismatch(
            op,
            format!("axis {axis} out of range for rank {rank}"),
        ))
    }
}

fn reduced_dims(dims: &[usize], axes: &HashSet<usize>, keepdims: bool) -> Vec<usize> {
    dims.iter()
        .enumerate()
        .filter_map(|(i, &d)| match (axes.contains(&i), keepdims) {
            (false, _) => Some(d),
            (true, true) => Some(1),
            (true, false) => None,
        })
        .collect()
}

/// Numpy-style broadcast of two shapes.
fn broadcast(op: &str, a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let dim_at = |dims: &[usize], i: usize| {
        let offset = rank - dims.len();
        if i < offset { 1 } else { dims[i - offset] }
    };
    (0..rank)
        .map(|i| match (dim_at(a, i), dim_at(b, i)) {
            (x, y) if x == y => Ok(x),
            (1, y) => Ok(y),
            (x, 1) => Ok(x),
            _ => Err(OnnxError::shape_mismatch(
                op,
                format!("{a:?} and {b:?} do not broadcast"),
            )),
        })
        .collect()
}

fn to_i64(value: usize) -> i64 {
    crate::proto::to_i64(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> GraphBuilder {
        GraphBuilder::new(11).unwrap_or_else(|_| GraphBuilder::with_opset(Opset::default()))
    }

    #[test]
    fn rejects_unsupported_opset() {
        assert!(matches!(
            GraphBuilder::new(10),
            Err(OnnxError::UnsupportedOpset { version: 10, .. })
        ));
    }

    #[test]
    fn conv_infers_output_shape() {
        let mut b = builder();
        let x = b.input("input", data_type::FLOAT, &[1, 3, 64, 64]).unwrap();
        let w = b.initializer_f32("w", &[8, 3, 3, 3], &[0.0; 8 * 27]).unwrap();
        let attrs = ConvAttrs {
            stride: 2,
            padding: 1,
            groups: 1,
        };
        let y = b.conv(&x, &w, None, attrs).unwrap();
        assert_eq!(b.shape(&y).unwrap(), [1, 8, 32, 32]);
    }

    #[test]
    fn depthwise_conv_checks_groups() {
        let mut b = builder();
        let x = b.input("input", data_type::FLOAT, &[1, 4, 8, 8]).unwrap();
        let w = b.initializer_f32("w", &[4, 1, 3, 3], &[0.0; 36]).unwrap();
        let grouped = ConvAttrs {
            stride: 1,
            padding: 1,
            groups: 4,
        };
        assert!(b.conv(&x, &w, None, grouped).is_ok());
        assert!(matches!(
            b.conv(&x, &w, None, ConvAttrs::default()),
            Err(OnnxError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn scoped_names() {
        let mut b = builder();
        let x = b.input("input", data_type::FLOAT, &[1, 2, 4, 4]).unwrap();
        let y = b
            .scope("backbone", |b| {
                b.scope("stem", |b| {
                    b.initializer_f32("weight", &[2], &[1.0, 2.0])?;
                    b.sigmoid(&x)
                })
            })
            .unwrap();
        assert_eq!(y.name(), "/backbone/stem/Sigmoid_output_0");
        let model = b.finish(&[(&y, "output")]).unwrap();
        let graph = model.graph.unwrap();
        assert_eq!(graph.initializer[0].name, "backbone.stem.weight");
        assert_eq!(graph.node[0].name, "/backbone/stem/Sigmoid");
        assert_eq!(graph.node[0].output, vec!["output".to_string()]);
    }

    #[test]
    fn node_names_are_unique() {
        let mut b = builder();
        let x = b.input("input", data_type::FLOAT, &[2]).unwrap();
        let a = b.sigmoid(&x).unwrap();
        let c = b.sigmoid(&a).unwrap();
        assert_ne!(a.name(), c.name());
        assert_eq!(c.name(), "/Sigmoid_1_output_0");
    }

    #[test]
    fn duplicate_initializer_is_rejected() {
        let mut b = builder();
        b.initializer_f32("w", &[1], &[1.0]).unwrap();
        assert!(matches!(
            b.initializer_f32("w", &[1], &[1.0]),
            Err(OnnxError::DuplicateName(_))
        ));
    }

    #[test]
    fn initializer_length_is_checked() {
        let mut b = builder();
        assert!(matches!(
            b.initializer_f32("w", &[2, 2], &[1.0; 3]),
            Err(OnnxError::InvalidInitializer { .. })
        ));
    }

    #[test]
    fn broadcast_rules() {
        assert_eq!(broadcast("Add", &[1, 8, 2], &[2]).unwrap(), vec![1, 8, 2]);
        assert_eq!(broadcast("Add", &[4, 1], &[1, 5]).unwrap(), vec![4, 5]);
        assert!(broadcast("Add", &[3], &[4]).is_err());
    }

    #[test]
    fn slice_with_steps() {
        let mut b = builder();
        let x = b.input("input", data_type::FLOAT, &[1, 3, 7, 6]).unwrap();
        let y = b
            .slice(&x, &[1, 0], &[i64::MAX, i64::MAX], &[2, 3], &[2, 2])
            .unwrap();
        assert_eq!(b.shape(&y).unwrap(), [1, 3, 3, 3]);
        let z = b.slice(&x, &[-2], &[i64::MAX], &[-1], &[1]).unwrap();
        assert_eq!(b.shape(&z).unwrap(), [1, 3, 7, 2]);
    }

    #[test]
    fn reshape_infers_minus_one() {
        let mut b = builder();
        let x = b.input("input", data_type::FLOAT, &[2, 6, 4, 4]).unwrap();
        let y = b.reshape(&x, &[2, 6, -1]).unwrap();
        assert_eq!(b.shape(&y).unwrap(), [2, 6, 16]);
        assert!(b.reshape(&x, &[5, -1]).is_err());
    }

    #[test]
    fn transpose_permutes() {
        let mut b = builder();
        let x = b.input("input", data_type::FLOAT, &[2, 6, 16]).unwrap();
        let y = b.transpose(&x, &[0, 2, 1]).unwrap();
        assert_eq!(b.shape(&y).unwrap(), [2, 16, 6]);
        assert!(b.transpose(&x, &[0, 0, 1]).is_err());
    }

    #[test]
    fn reduce_max_axes_follow_opset() {
        for (opset, inputs) in [(11, 1), (18, 2)] {
            let mut b = GraphBuilder::new(opset).unwrap();
            let x = b.input("input", data_type::FLOAT, &[1, 5, 3]).unwrap();
            let y = b.reduce_max(&x, &[2], true).unwrap();
            assert_eq!(b.shape(&y).unwrap(), [1, 5, 1]);
            let model = b.finish(&[(&y, "output")]).unwrap();
            let graph = model.graph.unwrap();
            let node = graph.node.iter().find(|n| n.op_type == "ReduceMax").unwrap();
            assert_eq!(node.input.len(), inputs);
            assert_eq!(node.attr("axes").is_some(), inputs == 1);
        }
    }

    #[test]
    fn arg_max_is_int64() {
        let mut b = builder();
        let x = b.input("input", data_type::FLOAT, &[1, 5, 3]).unwrap();
        let y = b.arg_max(&x, 2, true).unwrap();
        assert_eq!(b.elem_type(&y).unwrap(), data_type::INT64);
        assert_eq!(b.shape(&y).unwrap(), [1, 5, 1]);
        let z = b.cast(&y, data_type::FLOAT).unwrap();
        assert_eq!(b.elem_type(&z).unwrap(), data_type::FLOAT);
    }

    #[test]
    fn concat_checks_dims() {
        let mut b = builder();
        let x = b.input("a", data_type::FLOAT, &[1, 5, 4]).unwrap();
        let y = b.input("b", data_type::FLOAT, &[1, 5, 1]).unwrap();
        let z = b.input("c", data_type::FLOAT, &[1, 4, 1]).unwrap();
        let out = b.concat(&[&x, &y], 2).unwrap();
        assert_eq!(b.shape(&out).unwrap(), [1, 5, 5]);
        assert!(b.concat(&[&x, &z], 2).is_err());
    }

    #[test]
    fn resize_and_pool_shapes() {
        let mut b = builder();
        let x = b.input("input", data_type::FLOAT, &[1, 4, 5, 5]).unwrap();
        let up = b.resize_nearest(&x, 2).unwrap();
        assert_eq!(b.shape(&up).unwrap(), [1, 4, 10, 10]);
        let pooled = b.max_pool(&x, 5, 1, 2).unwrap();
        assert_eq!(b.shape(&pooled).unwrap(), [1, 4, 5, 5]);
    }

    #[test]
    fn finish_routes_input_through_identity() {
        let mut b = builder();
        let x = b.input("input", data_type::FLOAT, &[1, 2]).unwrap();
        let model = b.finish(&[(&x, "output")]).unwrap();
        let graph = model.graph.unwrap();
        assert_eq!(graph.node.len(), 1);
        assert_eq!(graph.node[0].op_type, "Identity");
        assert_eq!(graph.output[0].name, "output");
    }

    #[test]
    fn finish_emits_value_info_and_metadata() {
        let mut b = builder().with_metadata("stride", "8");
        let x = b.input("input", data_type::FLOAT, &[1, 2]).unwrap();
        let s = b.sigmoid(&x).unwrap();
        let e = b.exp(&s).unwrap();
        let model = b.finish(&[(&e, "output")]).unwrap();
        assert_eq!(model.ir_version, 6);
        assert_eq!(model.opset_import[0].version, 11);
        assert_eq!(model.metadata_props[0].key, "stride");
        let graph = model.graph.unwrap();
        assert_eq!(graph.value_info.len(), 1);
        assert_eq!(graph.value_info[0].name, s.name());
    }
}
