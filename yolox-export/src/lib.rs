//! Export YOLOX checkpoints to ONNX for DeepStream.
//!
//! The exported graph takes a `[1, 3, H, W]` float image and produces
//! `[1, N, 7]` rows of `(x, y, w, h, best class score, best class index,
//! objectness)` with boxes already decoded to input pixels.
//!
//! # Example
//!
//! ```no_run
//! use yolox_export::{ExportOptions, export};
//!
//! let options = ExportOptions::new("yolox_s.pth", "yolox_s.json").with_simplify(true);
//! let report = export(&options)?;
//! println!("wrote {}", report.output_path.display());
//! # Ok::<(), yolox_export::ExportError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![allow(clippy::module_name_repetitions)]

mod error;
mod export;

// Re-export export pipeline
pub use export::{
    ExportOptions, ExportReport, ONNX_EXTENSION, PreparedModel, export, onnx_file_name,
    prepare_model,
};

// Re-export error types
pub use error::{ExportError, Result};
