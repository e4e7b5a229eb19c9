//! YOLOX model tree, checkpoint loading and output adaptation.
//!
//! This crate mirrors the YOLOX detector as a native module tree whose
//! parameter names match PyTorch `state_dict` keys, so released checkpoints
//! load without renaming. Every module can trace itself into an ONNX graph
//! through [`ml_onnx::Trace`].
//!
//! # Pieces
//!
//! - [`Module`] - parameter and activation traversal, strict state dict loading,
//!   activation substitution
//! - Layers: [`Conv2d`], [`BatchNorm2d`], [`BaseConv`], [`DwConv`], [`Focus`],
//!   [`Bottleneck`], [`CspLayer`], [`SppBottleneck`]
//! - Architecture: [`CspDarknet`], [`YoloPafpn`], [`YoloxHead`], [`Yolox`]
//! - [`Experiment`] - model definition read from JSON, with the published presets
//! - [`load_checkpoint`] - PyTorch and safetensors checkpoints into a [`StateDict`]
//! - [`OutputAdapter`] - fixed seven-column output layout for DeepStream parsers
//!
//! # Example
//!
//! ```
//! use ml_models::{Activation, ActivationKind, Experiment, Module, Preset};
//!
//! let exp = Experiment::preset(Preset::YoloxNano);
//! let mut model = exp.get_model()?;
//! let replaced = model.replace_activation(ActivationKind::Silu, Activation::ExportSilu);
//! assert!(replaced > 0);
//! model.eval();
//! # Ok::<(), ml_models::ModelError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![allow(clippy::module_name_repetitions)]

mod activation;
mod adapter;
mod blocks;
mod checkpoint;
mod error;
mod exp;
mod layers;
mod module;
mod param;
mod pickle;
mod state;
mod yolox;

// Re-export model types
pub use activation::{Activation, ActivationKind, LEAKY_RELU_SLOPE};
pub use blocks::{Bottleneck, CspLayer, Focus, SPP_KERNELS, SppBottleneck};
pub use layers::{BN_EPS, BN_MOMENTUM, BaseConv, BatchNorm2d, Conv, Conv2d, DwConv};
pub use yolox::{
    CspDarknet, IN_CHANNELS, PRIOR_PROB, STRIDES, YoloPafpn, Yolox, YoloxHead, round_half_even,
};

// Re-export module tree
pub use module::{Module, ModuleMapper, ModuleVisitor, child};
pub use param::Param;
pub use state::StateDict;

// Re-export experiment definitions
pub use exp::{Experiment, INPUT_ALIGNMENT, InputResolution, Preset};

// Re-export checkpoint utilities
pub use checkpoint::{
    CheckpointFormat, NESTED_STATE_KEY, load_checkpoint, save_checkpoint,
    save_training_checkpoint,
};

// Re-export output adaptation
pub use adapter::{ADAPTED_WIDTH, OutputAdapter};

// Re-export error types
pub use error::{ModelError, Result};

/// Prelude for convenient imports.
pub mod prelude {
    pub use super::{
        Activation, ActivationKind, CheckpointFormat, Experiment, ModelError, Module,
        OutputAdapter, Preset, StateDict, Yolox, load_checkpoint, save_checkpoint,
    };
}
