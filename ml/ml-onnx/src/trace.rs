//! Tracing modules into ONNX models.

use tracing::{debug, info};

use crate::builder::{GraphBuilder, Value};
use crate::error::Result;
use crate::opset::{DEFAULT_OPSET, Opset};
use crate::proto::{ModelProto, data_type};
use crate::simplify::fold_constants;

/// A computation that can record itself into a [`GraphBuilder`].
pub trait Trace {
    /// Records the computation applied to `input` and returns its output value.
    ///
    /// # Errors
    ///
    /// Returns an error if an operation has no ONNX equivalent or shapes do not agree.
    fn trace(&self, graph: &mut GraphBuilder, input: Value) -> Result<Value>;
}

impl<T: Trace + ?Sized> Trace for &T {
    fn trace(&self, graph: &mut GraphBuilder, input: Value) -> Result<Value> {
        (**self).trace(graph, input)
    }
}

/// Two-stage pipeline: the output of `first` is the sole input of `second`.
///
/// # Example
///
/// ```ignore
/// let pipeline = Chain::new(model, OutputAdapter::new());
/// let onnx = trace_model(&pipeline, &[1, 3, 640, 640], &TraceOptions::default())?;
/// ```
#[derive(Debug, Clone)]
pub struct Chain<A, B> {
    first: A,
    second: B,
}

impl<A, B> Chain<A, B> {
    /// Composes two stages.
    #[must_use]
    pub const fn new(first: A, second: B) -> Self {
        Self { first, second }
    }

    /// Returns the first stage.
    #[must_use]
    pub const fn first(&self) -> &A {
        &self.first
    }

    /// Returns the second stage.
    #[must_use]
    pub const fn second(&self) -> &B {
        &self.second
    }
}

impl<A: Trace, B: Trace> Trace for Chain<A, B> {
    fn trace(&self, graph: &mut GraphBuilder, input: Value) -> Result<Value> {
        let hidden = self.first.trace(graph, input)?;
        self.second.trace(graph, hidden)
    }
}

/// Options for [`trace_model`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceOptions {
    /// Opset version to emit.
    pub opset: u32,
    /// Graph input name.
    pub input_name: String,
    /// Graph output name.
    pub output_name: String,
    /// Graph name.
    pub graph_name: String,
    /// Producer name recorded in the model.
    pub producer_name: String,
    /// Producer version recorded in the model.
    pub producer_version: String,
    /// Turn `Constant` nodes into initializers before returning.
    pub constant_folding: bool,
    /// Model metadata entries.
    pub metadata: Vec<(String, String)>,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            opset: DEFAULT_OPSET,
            input_name: "input".to_string(),
            output_name: "output".to_string(),
            graph_name: "main_graph".to_string(),
            producer_name: env!("CARGO_PKG_NAME").to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            constant_folding: true,
            metadata: Vec::new(),
        }
    }
}

impl TraceOptions {
    /// Sets the opset version.
    #[must_use]
    pub fn with_opset(mut self, opset: u32) -> Self {
        self.opset = opset;
        self
    }

    /// Sets the graph input and output names.
    #[must_use]
    pub fn with_io_names(mut self, input: impl Into<String>, output: impl Into<String>) -> Self {
        self.input_name = input.into();
        self.output_name = output.into();
        self
    }

    /// Sets the producer name and version.
    #[must_use]
    pub fn with_producer(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.producer_name = name.into();
        self.producer_version = version.into();
        self
    }

    /// Enables or disables constant folding.
    #[must_use]
    pub fn with_constant_folding(mut self, enabled: bool) -> Self {
        self.constant_folding = enabled;
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }
}

/// Traces `module` on a float32 input of `input_shape` into a complete model.
///
/// # Errors
///
/// Returns `OnnxError::UnsupportedOpset` for an unsupported opset, or any
/// error raised while the module records itself.
pub fn trace_model<M: Trace + ?Sized>(
    module: &M,
    input_shape: &[usize],
    options: &TraceOptions,
) -> Result<ModelProto> {
    let opset = Opset::new(options.opset)?;
    let mut graph = options.metadata.iter().fold(
        GraphBuilder::with_opset(opset)
            .with_graph_name(&options.graph_name)
            .with_producer(&options.producer_name, &options.producer_version),
        |b, (k, v)| b.with_metadata(k, v),
    );

    let input = graph.input(&options.input_name, data_type::FLOAT, input_shape)?;
    let output = module.trace(&mut graph, input)?;
    debug!(nodes = graph.node_count(), "module trace complete");
    let mut model = graph.finish(&[(&output, options.output_name.as_str())])?;

    if options.constant_folding {
        if let Some(graph) = model.graph.as_mut() {
            let folded = fold_constants(graph);
            debug!(folded, "folded constants");
        }
    }

    info!(
        %opset,
        nodes = model.graph.as_ref().map_or(0, |g| g.node.len()),
        "traced model"
    );
    Ok(model)
}
