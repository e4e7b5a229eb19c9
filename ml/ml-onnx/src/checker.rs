//! Structural validation of ONNX models.

use std::collections::HashSet;

use crate::error::{OnnxError, Result};
use crate::proto::{ModelProto, ValueInfoProto};
use crate::tensor::validate_payload;

/// Name, element type and dimensions of a graph input or output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueSignature {
    /// Value name.
    pub name: String,
    /// Element type code.
    pub elem_type: i32,
    /// Dimensions; `None` marks a symbolic dimension.
    pub dims: Vec<Option<i64>>,
}

impl ValueSignature {
    /// Returns `true` if every dimension is static.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.dims.iter().all(Option::is_some)
    }
}

/// Input/output signature of a graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphSignature {
    /// Graph inputs that are not initializers.
    pub inputs: Vec<ValueSignature>,
    /// Graph outputs.
    pub outputs: Vec<ValueSignature>,
}

/// Extracts the input/output signature of a model.
///
/// # Errors
///
/// Returns `OnnxError::InvalidGraph` if the model has no graph or an
/// input/output is not a dense tensor.
pub fn graph_signature(model: &ModelProto) -> Result<GraphSignature> {
    let graph = model
        .graph
        .as_ref()
        .ok_or_else(|| OnnxError::invalid_graph("model has no graph"))?;
    let initializers: HashSet<&str> = graph.initializer.iter().map(|t| t.name.as_str()).collect();
    let inputs = graph
        .input
        .iter()
        .filter(|i| !initializers.contains(i.name.as_str()))
        .map(signature_of)
        .collect::<Result<_>>()?;
    let outputs = graph.output.iter().map(signature_of).collect::<Result<_>>()?;
    Ok(GraphSignature { inputs, outputs })
}

fn signature_of(info: &ValueInfoProto) -> Result<ValueSignature> {
    let (elem_type, dims) = info.tensor_type().ok_or_else(|| {
        OnnxError::invalid_graph(format!("{} is not a dense tensor value", info.name))
    })?;
    Ok(ValueSignature {
        name: info.name.clone(),
        elem_type,
        dims,
    })
}

/// Checks that a model is structurally sound.
///
/// Verified:
/// - a default-domain opset import is present
/// - initializer payloads match their declared dimensions
/// - every value has exactly one producer
/// - nodes are topologically sorted and only consume defined values
/// - every graph output is produced
///
/// # Errors
///
/// Returns `OnnxError::InvalidGraph` or `OnnxError::InvalidInitializer`
/// describing the first violation found.
pub fn check_model(model: &ModelProto) -> Result<()> {
    if model.ir_version <= 0 {
        return Err(OnnxError::invalid_graph("missing IR version"));
    }
    let has_default_opset = model
        .opset_import
        .iter()
        .any(|o| (o.domain.is_empty() || o.domain == "ai.onnx") && o.version > 0);
    if !has_default_opset {
        return Err(OnnxError::invalid_graph("missing default-domain opset import"));
    }
    let graph = model
        .graph
        .as_ref()
        .ok_or_else(|| OnnxError::invalid_graph("model has no graph"))?;

    let mut defined: HashSet<&str> = HashSet::new();
    for input in &graph.input {
        if input.name.is_empty() || !defined.insert(input.name.as_str()) {
            return Err(OnnxError::invalid_graph(format!(
                "graph input {:?} is empty or duplicated",
                input.name
            )));
        }
    }
    let inputs = defined.clone();
    let mut initializers = HashSet::new();
    for init in &graph.initializer {
        validate_payload(init)?;
        if !initializers.insert(init.name.as_str()) {
            return Err(OnnxError::duplicate_name(&init.name));
        }
        // An initializer may double as a graph input.
        if !inputs.contains(init.name.as_str()) {
            defined.insert(init.name.as_str());
        }
    }

    for node in &graph.node {
        if node.op_type.is_empty() {
            return Err(OnnxError::invalid_graph(format!(
                "node {:?} has no operator type",
                node.name
            )));
        }
        for input in node.input.iter().filter(|i| !i.is_empty()) {
            if !defined.contains(input.as_str()) {
                return Err(OnnxError::invalid_graph(format!(
                    "node {:?} ({}) consumes undefined value {input:?}",
                    node.name, node.op_type
                )));
            }
        }
        for output in node.output.iter().filter(|o| !o.is_empty()) {
            if !defined.insert(output.as_str()) {
                return Err(OnnxError::invalid_graph(format!(
                    "value {output:?} has more than one producer"
                )));
            }
        }
    }

    for output in &graph.output {
        if !defined.contains(output.name.as_str()) {
            return Err(OnnxError::invalid_graph(format!(
                "graph output {:?} is never produced",
                output.name
            )));
        }
    }
    Ok(())
}
