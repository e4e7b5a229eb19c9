//! Graph simplification passes.
//!
//! Each pass rewrites a [`GraphProto`] in place and returns the number of
//! rewrites it made. [`simplify`] runs all of them to a fixpoint and refuses
//! to return a graph whose signature changed or that no longer checks.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::checker::{check_model, graph_signature};
use crate::error::{OnnxError, Result};
use crate::proto::{GraphProto, ModelProto, NodeProto, TensorProto};
use crate::tensor::{float_tensor, payload_bytes, to_f32_vec};

/// Upper bound on pass rounds before giving up on reaching a fixpoint.
const MAX_ROUNDS: usize = 16;

/// Default `BatchNormalization` epsilon when the attribute is absent.
const DEFAULT_BN_EPSILON: f32 = 1e-5;

/// Summary of a [`simplify`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimplifyReport {
    /// Node count before simplification.
    pub nodes_before: usize,
    /// Node count after simplification.
    pub nodes_after: usize,
    /// Initializer count before simplification.
    pub initializers_before: usize,
    /// Initializer count after simplification.
    pub initializers_after: usize,
    /// `BatchNormalization` nodes folded into convolutions.
    pub fused_batch_norms: usize,
    /// Constants folded, identities removed and initializers merged.
    pub folded: usize,
    /// Dead nodes and unused initializers removed.
    pub eliminated: usize,
    /// Pass rounds run.
    pub rounds: usize,
}

/// Simplifies a model without changing its input/output signature.
///
/// # Errors
///
/// Returns `OnnxError::Simplification` if the input model does not check,
/// a pass fails, or the result is invalid or has a different signature.
pub fn simplify(mut model: ModelProto) -> Result<(ModelProto, SimplifyReport)> {
    check_model(&model)
        .map_err(|e| OnnxError::simplification(format!("input model is invalid: {e}")))?;
    let signature = graph_signature(&model).map_err(|e| OnnxError::simplification(e.to_string()))?;

    let graph = model
        .graph
        .as_mut()
        .ok_or_else(|| OnnxError::simplification("model has no graph"))?;
    let mut report = SimplifyReport {
        nodes_before: graph.node.len(),
        initializers_before: graph.initializer.len(),
        ..SimplifyReport::default()
    };

    while report.rounds < MAX_ROUNDS {
        report.rounds += 1;
        let folded = fold_constants(graph);
        let fused = fuse_conv_bn(graph).map_err(|e| OnnxError::simplification(e.to_string()))?;
        let eliminated = eliminate_dead_nodes(graph);
        debug!(round = report.rounds, folded, fused, eliminated, "simplify round");
        report.folded += folded;
        report.fused_batch_norms += fused;
        report.eliminated += eliminated;
        if folded + fused + eliminated == 0 {
            break;
        }
    }
    report.nodes_after = graph.node.len();
    report.initializers_after = graph.initializer.len();

    check_model(&model)
        .map_err(|e| OnnxError::simplification(format!("simplified model is invalid: {e}")))?;
    let simplified = graph_signature(&model).map_err(|e| OnnxError::simplification(e.to_string()))?;
    if simplified != signature {
        return Err(OnnxError::simplification(
            "graph input/output signature changed",
        ));
    }

    info!(
        nodes_before = report.nodes_before,
        nodes_after = report.nodes_after,
        fused = report.fused_batch_norms,
        "simplified model"
    );
    Ok((model, report))
}

/// Moves `Constant` nodes into initializers, removes `Identity` nodes and
/// merges initializers with identical contents.
pub fn fold_constants(graph: &mut GraphProto) -> usize {
    let mut changes = 0;

    let mut kept = Vec::with_capacity(graph.node.len());
    for mut node in std::mem::take(&mut graph.node) {
        let tensor = (node.op_type == "Constant" && node.output.len() == 1)
            .then(|| node.attribute.iter_mut().find(|a| a.name == "value"))
            .flatten()
            .and_then(|a| a.t.take());
        match tensor {
            Some(mut tensor) => {
                tensor.name = node.output[0].clone();
                graph.initializer.push(tensor);
                changes += 1;
            }
            None => kept.push(node),
        }
    }
    graph.node = kept;

    changes += remove_identities(graph);
    changes += merge_duplicate_initializers(graph);
    changes
}

fn remove_identities(graph: &mut GraphProto) -> usize {
    let outputs: HashSet<String> = graph.output.iter().map(|o| o.name.clone()).collect();
    let external: HashSet<String> = graph
        .input
        .iter()
        .map(|i| i.name.clone())
        .chain(graph.initializer.iter().map(|t| t.name.clone()))
        .collect();

    let mut removed = 0;
    let mut i = 0;
    while i < graph.node.len() {
        let node = &graph.node[i];
        if node.op_type != "Identity" || node.input.len() != 1 || node.output.len() != 1 {
            i += 1;
            continue;
        }
        let (source, target) = (node.input[0].clone(), node.output[0].clone());
        if !outputs.contains(&target) {
            rename_uses(&mut graph.node, &target, &source);
        } else if !external.contains(&source) && !outputs.contains(&source) {
            for n in &mut graph.node {
                for name in n.input.iter_mut().chain(n.output.iter_mut()) {
                    if *name == source {
                        name.clone_from(&target);
                    }
                }
            }
        } else {
            i += 1;
            continue;
        }
        graph.node.remove(i);
        removed += 1;
    }
    removed
}

fn rename_uses(nodes: &mut [NodeProto], from: &str, to: &str) {
    for node in nodes {
        for input in &mut node.input {
            if *input == from {
                *input = to.to_string();
            }
        }
    }
}

fn merge_duplicate_initializers(graph: &mut GraphProto) -> usize {
    let pinned: HashSet<String> = graph
        .input
        .iter()
        .chain(&graph.output)
        .map(|v| v.name.clone())
        .collect();
    let mut canonical: HashMap<(i32, Vec<i64>, Vec<u8>), String> = HashMap::new();
    let mut replace: HashMap<String, String> = HashMap::new();
    for tensor in &graph.initializer {
        let key = (tensor.data_type, tensor.dims.clone(), payload_bytes(tensor));
        match canonical.get(&key) {
            Some(first) if !pinned.contains(&tensor.name) => {
                replace.insert(tensor.name.clone(), first.clone());
            }
            Some(_) => {}
            None => {
                canonical.insert(key, tensor.name.clone());
            }
        }
    }
    if replace.is_empty() {
        return 0;
    }
    for node in &mut graph.node {
        for input in &mut node.input {
            if let Some(first) = replace.get(input) {
                input.clone_from(first);
            }
        }
    }
    graph.initializer.retain(|t| !replace.contains_key(&t.name));
    replace.len()
}

/// Folds inference-mode `BatchNormalization` into the preceding `Conv`.
///
/// Applies when the convolution output feeds only the normalization and all
/// weights and statistics are float32 initializers.
///
/// # Errors
///
/// Returns `OnnxError::InvalidInitializer` if a referenced initializer has an
/// unreadable payload.
pub fn fuse_conv_bn(graph: &mut GraphProto) -> Result<usize> {
    let outputs: HashSet<&str> = graph.output.iter().map(|o| o.name.as_str()).collect();
    let mut uses: HashMap<&str, usize> = HashMap::new();
    for node in &graph.node {
        for input in &node.input {
            *uses.entry(input.as_str()).or_insert(0) += 1;
        }
    }
    let producer: HashMap<&str, usize> = graph
        .node
        .iter()
        .enumerate()
        .filter(|(_, n)| n.op_type == "Conv")
        .filter_map(|(i, n)| n.output.first().map(|o| (o.as_str(), i)))
        .collect();
    let inits: HashMap<&str, &TensorProto> = graph
        .initializer
        .iter()
        .map(|t| (t.name.as_str(), t))
        .collect();
    let mut taken: HashSet<String> = graph.initializer.iter().map(|t| t.name.clone()).collect();

    let mut plans = Vec::new();
    for (bn_idx, bn) in graph.node.iter().enumerate() {
        if bn.op_type != "BatchNormalization" || bn.input.len() != 5 || bn.output.len() != 1 {
            continue;
        }
        let x = bn.input[0].as_str();
        let Some(&conv_idx) = producer.get(x) else {
            continue;
        };
        if uses.get(x).copied() != Some(1) || outputs.contains(x) {
            continue;
        }
        let conv = &graph.node[conv_idx];
        if let Some(plan) = plan_fusion(conv, bn, &inits, &mut taken)? {
            plans.push((conv_idx, bn_idx, plan));
        }
    }

    let fused = plans.len();
    let mut dropped = HashSet::new();
    for (conv_idx, bn_idx, (weight, bias)) in plans {
        let bn_output = graph.node[bn_idx].output[0].clone();
        let conv = &mut graph.node[conv_idx];
        conv.input.truncate(1);
        conv.input.push(weight.name.clone());
        conv.input.push(bias.name.clone());
        conv.output[0] = bn_output;
        graph.initializer.push(weight);
        graph.initializer.push(bias);
        dropped.insert(bn_idx);
    }
    let mut idx = 0;
    graph.node.retain(|_| {
        idx += 1;
        !dropped.contains(&(idx - 1))
    });
    if fused > 0 {
        debug!(fused, "fused BatchNormalization into Conv");
    }
    Ok(fused)
}

fn plan_fusion(
    conv: &NodeProto,
    bn: &NodeProto,
    inits: &HashMap<&str, &TensorProto>,
    taken: &mut HashSet<String>,
) -> Result<Option<(TensorProto, TensorProto)>> {
    let Some(weight) = conv.input.get(1).and_then(|n| inits.get(n.as_str())) else {
        return Ok(None);
    };
    let Some(channels) = weight.dims.first().and_then(|&d| usize::try_from(d).ok()) else {
        return Ok(None);
    };
    let mut stats = Vec::with_capacity(4);
    for name in &bn.input[1..5] {
        let Some(t) = inits.get(name.as_str()) else {
            return Ok(None);
        };
        let values = to_f32_vec(t)?;
        if values.len() != channels {
            return Ok(None);
        }
        stats.push(values);
    }
    let bias_name = conv.input.get(2).filter(|n| !n.is_empty());
    let mut bias = match bias_name {
        Some(name) => match inits.get(name.as_str()) {
            Some(t) => to_f32_vec(t)?,
            None => return Ok(None),
        },
        None => vec![0.0; channels],
    };
    let mut w = to_f32_vec(weight)?;
    if channels == 0 || w.len() % channels != 0 || bias.len() != channels {
        return Ok(None);
    }

    let epsilon = bn.attr("epsilon").map_or(DEFAULT_BN_EPSILON, |a| a.f);
    let (gamma, beta, mean, var) = (&stats[0], &stats[1], &stats[2], &stats[3]);
    let per_channel = w.len() / channels;
    for c in 0..channels {
        let scale = gamma[c] / (var[c] + epsilon).sqrt();
        for v in &mut w[c * per_channel..(c + 1) * per_channel] {
            *v *= scale;
        }
        bias[c] = (bias[c] - mean[c]) * scale + beta[c];
    }

    let dims: Vec<usize> = weight
        .dims
        .iter()
        .map(|&d| usize::try_from(d).unwrap_or(0))
        .collect();
    let weight_name = fresh_name(taken, &format!("{}_fused", weight.name));
    let bias_name = fresh_name(taken, &format!("{}_fused_bias", weight.name));
    Ok(Some((
        float_tensor(weight_name, &dims, &w),
        float_tensor(bias_name, &[channels], &bias),
    )))
}

fn fresh_name(taken: &mut HashSet<String>, base: &str) -> String {
    let mut name = base.to_string();
    let mut n = 1;
    while taken.contains(&name) {
        name = format!("{base}_{n}");
        n += 1;
    }
    taken.insert(name.clone());
    name
}

/// Removes nodes that do not contribute to a graph output, then unused
/// initializers and stale `value_info` entries.
pub fn eliminate_dead_nodes(graph: &mut GraphProto) -> usize {
    let mut live: HashSet<String> = graph.output.iter().map(|o| o.name.clone()).collect();
    let mut keep = vec![false; graph.node.len()];
    for (i, node) in graph.node.iter().enumerate().rev() {
        if node.output.iter().any(|o| live.contains(o)) {
            keep[i] = true;
            live.extend(node.input.iter().filter(|n| !n.is_empty()).cloned());
        }
    }
    let nodes_before = graph.node.len();
    let mut keep = keep.into_iter();
    graph.node.retain(|_| keep.next().unwrap_or(true));

    let declared: HashSet<&str> = graph.input.iter().map(|i| i.name.as_str()).collect();
    let inits_before = graph.initializer.len();
    graph
        .initializer
        .retain(|t| live.contains(&t.name) || declared.contains(t.name.as_str()));

    let produced: HashSet<&str> = graph
        .node
        .iter()
        .flat_map(|n| n.output.iter().map(String::as_str))
        .collect();
    graph.value_info.retain(|v| produced.contains(v.name.as_str()));

    (nodes_before - graph.node.len()) + (inits_before - graph.initializer.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{ConvAttrs, GraphBuilder};
    use crate::proto::data_type;
    use crate::tensor::to_f32_vec;
    use approx::assert_relative_eq;

    fn conv_bn_model() -> ModelProto {
        conv_bn_model_with_eps(0.0)
    }

    fn conv_bn_model_with_eps(eps: f32) -> ModelProto {
        let mut b = GraphBuilder::new(11).unwrap();
        let x = b.input("input", data_type::FLOAT, &[1, 1, 4, 4]).unwrap();
        let y = b
            .scope("stem", |b| {
                let w = b.initializer_f32("conv.weight", &[2, 1, 1, 1], &[1.0, 2.0])?;
                let y = b.conv(&x, &w, None, ConvAttrs::default())?;
                let gamma = b.initializer_f32("bn.weight", &[2], &[2.0, 1.0])?;
                let beta = b.initializer_f32("bn.bias", &[2], &[0.5, -1.0])?;
                let mean = b.initializer_f32("bn.running_mean", &[2], &[1.0, 0.0])?;
                let var = b.initializer_f32("bn.running_var", &[2], &[4.0, 1.0])?;
                b.batch_norm(&y, [&gamma, &beta, &mean, &var], eps, 0.97)
            })
            .unwrap();
        let y = b.sigmoid(&y).unwrap();
        b.finish(&[(&y, "output")]).unwrap()
    }

    #[test]
    fn conv_bn_is_fused() {
        let mut model = conv_bn_model();
        let graph = model.graph.as_mut().unwrap();
        assert_eq!(fuse_conv_bn(graph).unwrap(), 1);
        assert!(graph.node.iter().all(|n| n.op_type != "BatchNormalization"));

        let conv = graph.node.iter().find(|n| n.op_type == "Conv").unwrap();
        assert_eq!(conv.input.len(), 3);
        let find = |name: &str| graph.initializer.iter().find(|t| t.name == name).unwrap();
        let w = to_f32_vec(find(&conv.input[1])).unwrap();
        let b = to_f32_vec(find(&conv.input[2])).unwrap();
        // channel 0: scale = 2 / sqrt(4) = 1, bias = (0 - 1) * 1 + 0.5
        // channel 1: scale = 1 / sqrt(1) = 1, bias = 0 * 1 - 1
        assert_relative_eq!(w[0], 1.0);
        assert_relative_eq!(w[1], 2.0);
        assert_relative_eq!(b[0], -0.5);
        assert_relative_eq!(b[1], -1.0);
    }

    #[test]
    fn conv_bn_fusion_applies_epsilon() {
        let mut model = conv_bn_model_with_eps(1e-3);
        let graph = model.graph.as_mut().unwrap();
        assert_eq!(fuse_conv_bn(graph).unwrap(), 1);

        let conv = graph.node.iter().find(|n| n.op_type == "Conv").unwrap();
        let find = |name: &str| graph.initializer.iter().find(|t| t.name == name).unwrap();
        let w = to_f32_vec(find(&conv.input[1])).unwrap();
        let b = to_f32_vec(find(&conv.input[2])).unwrap();
        let scale0 = 2.0 / 4.001_f32.sqrt();
        let scale1 = 1.0 / 1.001_f32.sqrt();
        assert_relative_eq!(w[0], scale0, max_relative = 1e-6);
        assert_relative_eq!(w[1], 2.0 * scale1, max_relative = 1e-6);
        assert_relative_eq!(b[0], 0.5 - scale0, max_relative = 1e-6);
        assert_relative_eq!(b[1], -1.0, max_relative = 1e-6);
        assert!(w[0] < 1.0);
    }

    #[test]
    fn shared_conv_output_is_not_fused() {
        let mut model = conv_bn_model();
        let graph = model.graph.as_mut().unwrap();
        let conv_out = graph.node[0].output[0].clone();
        graph.node.push(NodeProto {
            input: vec![conv_out],
            output: vec!["side".to_string()],
            name: "side".to_string(),
            op_type: "Relu".to_string(),
            ..NodeProto::default()
        });
        assert_eq!(fuse_conv_bn(graph).unwrap(), 0);
    }

    #[test]
    fn constants_become_initializers() {
        let mut b = GraphBuilder::new(11).unwrap();
        let x = b.input("input", data_type::FLOAT, &[2, 3]).unwrap();
        let y = b.reshape(&x, &[3, 2]).unwrap();
        let mut model = b.finish(&[(&y, "output")]).unwrap();
        let graph = model.graph.as_mut().unwrap();
        assert_eq!(fold_constants(graph), 1);
        assert_eq!(graph.node.len(), 1);
        assert_eq!(graph.initializer[0].name, graph.node[0].input[1]);
    }

    #[test]
    fn identities_are_removed() {
        let mut b = GraphBuilder::new(11).unwrap();
        let x = b.input("input", data_type::FLOAT, &[2]).unwrap();
        let s = b.sigmoid(&x).unwrap();
        let i = b.identity(&s).unwrap();
        let j = b.identity(&i).unwrap();
        let mut model = b.finish(&[(&j, "output")]).unwrap();
        let graph = model.graph.as_mut().unwrap();
        assert_eq!(fold_constants(graph), 2);
        assert_eq!(graph.node.len(), 1);
        assert_eq!(graph.node[0].output[0], "output");
    }

    #[test]
    fn duplicate_initializers_are_merged() {
        let mut b = GraphBuilder::new(11).unwrap();
        let x = b.input("input", data_type::FLOAT, &[2]).unwrap();
        let a = b.initializer_f32("a", &[2], &[1.0, 2.0]).unwrap();
        let c = b.initializer_f32("c", &[2], &[1.0, 2.0]).unwrap();
        let y = b.mul(&x, &a).unwrap();
        let y = b.add(&y, &c).unwrap();
        let mut model = b.finish(&[(&y, "output")]).unwrap();
        let graph = model.graph.as_mut().unwrap();
        assert_eq!(fold_constants(graph), 1);
        assert_eq!(graph.initializer.len(), 1);
        assert_eq!(graph.node[1].input[1], "a");
    }

    #[test]
    fn dead_nodes_are_eliminated() {
        let mut b = GraphBuilder::new(11).unwrap();
        let x = b.input("input", data_type::FLOAT, &[2]).unwrap();
        let unused = b.initializer_f32("unused", &[1], &[0.0]).unwrap();
        let _dead = b.mul(&x, &unused).unwrap();
        let y = b.sigmoid(&x).unwrap();
        let mut model = b.finish(&[(&y, "output")]).unwrap();
        let graph = model.graph.as_mut().unwrap();
        assert_eq!(eliminate_dead_nodes(graph), 2);
        assert_eq!(graph.node.len(), 1);
        assert!(graph.initializer.is_empty());
        assert!(graph.value_info.is_empty());
    }

    #[test]
    fn simplify_keeps_signature() {
        let model = conv_bn_model();
        let before = graph_signature(&model).unwrap();
        let (simplified, report) = simplify(model).unwrap();
        assert!(check_model(&simplified).is_ok());
        assert_eq!(graph_signature(&simplified).unwrap(), before);
        assert_eq!(report.fused_batch_norms, 1);
        assert_eq!(report.nodes_after, 2);
        assert_eq!(report.initializers_after, 2);
        assert!(report.rounds >= 2);
    }

    #[test]
    fn simplify_rejects_invalid_input() {
        let mut model = conv_bn_model();
        model.opset_import.clear();
        assert!(matches!(simplify(model), Err(OnnxError::Simplification(_))));
    }
}
