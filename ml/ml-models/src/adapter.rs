//! DeepStream output adapter.
//!
//! Reduces the raw YOLOX output `[B, N, 5 + C]` (box, objectness, class
//! scores) to a fixed `[B, N, 7]` layout:
//!
//! | column | value |
//! |---|---|
//! | 0..4 | box `cx, cy, w, h` |
//! | 4 | best class score |
//! | 5 | best class index, as float |
//! | 6 | objectness |
//!
//! Rows are never reordered or dropped. Ties between class scores resolve to
//! the lowest class index.

use burn::prelude::Backend;
use burn::tensor::Tensor;
use ml_onnx::proto::data_type;
use ml_onnx::{GraphBuilder, OnnxError, Trace, Value};

use crate::error::{ModelError, Result};

/// Number of columns in the adapted output.
pub const ADAPTED_WIDTH: usize = 7;

/// Channels before the class scores: four box coordinates and objectness.
const BOX_AND_OBJ: usize = 5;

/// Stateless post-processing stage appended to the detector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputAdapter;

impl OutputAdapter {
    /// Creates the adapter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Output shape for a raw `[B, N, 5 + C]` input.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::ShapeMismatch` unless the input is rank 3 with at
    /// least one class channel.
    pub fn output_shape(&self, raw: &[usize]) -> Result<[usize; 3]> {
        match raw {
            &[b, n, c] if c > BOX_AND_OBJ => Ok([b, n, ADAPTED_WIDTH]),
            _ => Err(ModelError::shape_mismatch(
                "[batch, predictions, 5 + classes] with at least one class",
                format!("{raw:?}"),
            )),
        }
    }

    /// Applies the adapter to a raw prediction tensor.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::ShapeMismatch` if the last axis has fewer than six
    /// channels.
    pub fn forward<B: Backend>(&self, raw: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        let [b, n, c] = raw.dims();
        self.output_shape(&[b, n, c])?;
        if b == 0 || n == 0 {
            return Ok(Tensor::zeros([b, n, ADAPTED_WIDTH], &raw.device()));
        }
        let boxes = raw.clone().slice([0..b, 0..n, 0..4]);
        let objectness = raw.clone().slice([0..b, 0..n, 4..BOX_AND_OBJ]);
        let class_scores = raw.slice([0..b, 0..n, BOX_AND_OBJ..c]);
        let (best_score, best_class) = class_scores.max_dim_with_indices(2);
        Ok(Tensor::cat(
            vec![boxes, best_score, best_class.float(), objectness],
            2,
        ))
    }
}

impl Trace for OutputAdapter {
    fn trace(&self, graph: &mut GraphBuilder, input: Value) -> ml_onnx::Result<Value> {
        let dims = graph.shape(&input)?.to_vec();
        self.output_shape(&dims)
            .map_err(|e| OnnxError::shape_mismatch("OutputAdapter", e.to_string()))?;
        let boxes = graph.slice(&input, &[0], &[4], &[2], &[1])?;
        let objectness = graph.slice(&input, &[4], &[5], &[2], &[1])?;
        let class_scores = graph.slice(&input, &[5], &[i64::MAX], &[2], &[1])?;
        let best_score = graph.reduce_max(&class_scores, &[2], true)?;
        let best_class = graph.arg_max(&class_scores, 2, true)?;
        let best_class = graph.cast(&best_class, data_type::FLOAT)?;
        graph.concat(&[&boxes, &best_score, &best_class, &objectness], 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn raw(values: Vec<f32>, shape: [usize; 3]) -> Tensor<TestBackend, 3> {
        let device = <TestBackend as Backend>::Device::default();
        Tensor::from_data(TensorData::new(values, shape), &device)
    }

    fn values(t: Tensor<TestBackend, 3>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap_or_default()
    }

    #[test]
    fn single_row() {
        let input = raw(vec![10., 20., 30., 40., 0.9, 0.1, 0.7, 0.2], [1, 1, 8]);
        let out = OutputAdapter::new().forward(input).unwrap();
        assert_eq!(out.dims(), [1, 1, 7]);
        assert_eq!(values(out), vec![10., 20., 30., 40., 0.7, 1., 0.9]);
    }

    #[test]
    fn ties_pick_lowest_class() {
        let input = raw(vec![0., 0., 1., 1., 0.5, 0.3, 0.8, 0.8], [1, 1, 8]);
        let out = values(OutputAdapter::new().forward(input).unwrap());
        assert_eq!(out[4], 0.8);
        assert_eq!(out[5], 1.0);
    }

    #[test]
    fn single_class() {
        let input = raw(vec![1., 2., 3., 4., 0.25, 0.6], [1, 1, 6]);
        let out = values(OutputAdapter::new().forward(input).unwrap());
        assert_eq!(out, vec![1., 2., 3., 4., 0.6, 0., 0.25]);
    }

    #[test]
    fn rows_keep_order() {
        let input = raw(
            vec![
                1., 1., 1., 1., 0.1, 0.9, 0.0, //
                2., 2., 2., 2., 0.2, 0.0, 0.9, //
            ],
            [1, 2, 7],
        );
        let out = values(OutputAdapter::new().forward(input).unwrap());
        assert_eq!(&out[..7], &[1., 1., 1., 1., 0.9, 0., 0.1]);
        assert_eq!(&out[7..], &[2., 2., 2., 2., 0.9, 1., 0.2]);
    }

    #[test]
    fn empty_batch() {
        let input = raw(Vec::new(), [2, 0, 9]);
        let out = OutputAdapter::new().forward(input).unwrap();
        assert_eq!(out.dims(), [2, 0, 7]);
    }

    #[test]
    fn rejects_missing_classes() {
        let input = raw(vec![0.; 5], [1, 1, 5]);
        assert!(matches!(
            OutputAdapter::new().forward(input),
            Err(ModelError::ShapeMismatch { .. })
        ));
        assert!(OutputAdapter::new().output_shape(&[1, 85]).is_err());
    }

    #[test]
    fn trace_emits_shape_stable_ops() {
        let mut graph = GraphBuilder::new(11).unwrap();
        let x = graph.input("input", data_type::FLOAT, &[1, 10, 85]).unwrap();
        let y = OutputAdapter::new().trace(&mut graph, x).unwrap();
        assert_eq!(graph.shape(&y).unwrap(), [1, 10, 7]);
        assert_eq!(graph.elem_type(&y).unwrap(), data_type::FLOAT);
        let model = graph.finish(&[(&y, "output")]).unwrap();
        let ops: Vec<_> = model
            .graph
            .unwrap()
            .node
            .iter()
            .map(|n| n.op_type.clone())
            .filter(|op| op != "Constant")
            .collect();
        assert_eq!(
            ops,
            vec!["Slice", "Slice", "Slice", "ReduceMax", "ArgMax", "Cast", "Concat"]
        );
    }

    #[test]
    fn trace_rejects_rank_two() {
        let mut graph = GraphBuilder::new(11).unwrap();
        let x = graph.input("input", data_type::FLOAT, &[10, 85]).unwrap();
        assert!(matches!(
            OutputAdapter::new().trace(&mut graph, x),
            Err(OnnxError::ShapeMismatch { .. })
        ));
    }
}
