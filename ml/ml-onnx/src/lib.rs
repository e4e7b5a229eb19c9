//! ONNX graph tracing, serialization, validation and simplification.
//!
//! This crate records computations as ONNX graphs without a Python runtime.
//! Modules implement [`Trace`] and emit nodes into a [`GraphBuilder`], which
//! checks operand shapes and infers static output shapes as it goes.
//!
//! # Pieces
//!
//! - [`proto`] - `prost` messages for the ONNX subset this crate reads and writes
//! - [`GraphBuilder`] - tracer with static shape inference and torch-style naming
//! - [`Trace`], [`Chain`], [`trace_model`] - module tracing and two-stage pipelines
//! - [`save_model`], [`load_model`] - `.onnx` file IO
//! - [`check_model`], [`graph_signature`] - structural validation
//! - [`simplify`] - Conv/BatchNorm fusion, constant folding, dead node elimination
//!
//! # Opsets
//!
//! Default-domain opsets 11 through 19 are supported; 11 is the default.
//!
//! # Example
//!
//! ```
//! use ml_onnx::{GraphBuilder, check_model, proto::data_type};
//!
//! let mut graph = GraphBuilder::new(11)?;
//! let x = graph.input("input", data_type::FLOAT, &[1, 4])?;
//! let y = graph.sigmoid(&x)?;
//! let model = graph.finish(&[(&y, "output")])?;
//! check_model(&model)?;
//! # Ok::<(), ml_onnx::OnnxError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![allow(clippy::module_name_repetitions)]

mod builder;
mod checker;
mod error;
mod io;
mod opset;
pub mod proto;
mod simplify;
mod tensor;
mod trace;

pub use builder::{ConvAttrs, GraphBuilder, Value};
pub use checker::{GraphSignature, ValueSignature, check_model, graph_signature};
pub use error::{OnnxError, Result};
pub use io::{decode, encode, load_model, save_model};
pub use opset::{DEFAULT_OPSET, MAX_OPSET, MIN_OPSET, Opset};
pub use simplify::{SimplifyReport, eliminate_dead_nodes, fold_constants, fuse_conv_bn, simplify};
pub use tensor::{TensorInfo, float_tensor, int64_tensor, to_f32_vec, to_i64_vec};
pub use trace::{Chain, Trace, TraceOptions, trace_model};

/// Prelude for convenient imports.
pub mod prelude {
    pub use super::{
        Chain, GraphBuilder, ModelProto, OnnxError, Opset, Trace, TraceOptions, Value,
        check_model, load_model, save_model, simplify, trace_model,
    };
}

pub use proto::ModelProto;
