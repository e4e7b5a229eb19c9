//! YOLOX to ONNX exporter.
//!
//! # Usage
//!
//! ```text
//! yolox-export -w yolox_s.pth -c yolox_s.json
//! yolox-export --weights best_ckpt.pth --exp custom.json --opset 13 --simplify
//! ```
//!
//! Writes `<weights base name>.onnx` to the current directory. Log verbosity
//! follows `RUST_LOG` and defaults to `info`.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use ml_onnx::DEFAULT_OPSET;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};
use yolox_export::{ExportOptions, export};

/// Export a YOLOX checkpoint to ONNX with a DeepStream output layout
#[derive(Parser, Debug)]
#[command(name = "yolox-export")]
#[command(about = "Export YOLOX checkpoints to ONNX", long_about = None)]
#[command(version)]
struct Cli {
    /// Checkpoint file (.pth, .pt or .safetensors)
    #[arg(short = 'w', long)]
    weights: PathBuf,

    /// Experiment file (JSON)
    #[arg(short = 'c', long)]
    exp: PathBuf,

    /// ONNX opset version
    #[arg(long, default_value_t = DEFAULT_OPSET)]
    opset: u32,

    /// Simplify the exported graph
    #[arg(long)]
    simplify: bool,
}

impl Cli {
    fn options(&self) -> ExportOptions {
        ExportOptions::new(&self.weights, &self.exp)
            .with_opset(self.opset)
            .with_simplify(self.simplify)
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let report = export(&cli.options())?;
    info!(
        path = %report.output_path.display(),
        input = ?report.input_shape,
        output = ?report.output_shape,
        nodes = report.node_count,
        "export complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_flags() {
        let cli = Cli::try_parse_from(["yolox-export", "-w", "m.pth", "-c", "exp.json"]).unwrap();
        assert_eq!(cli.weights, PathBuf::from("m.pth"));
        assert_eq!(cli.exp, PathBuf::from("exp.json"));
        assert_eq!(cli.opset, 11);
        assert!(!cli.simplify);
    }

    #[test]
    fn long_flags() {
        let cli = Cli::try_parse_from([
            "yolox-export",
            "--weights",
            "m.pth",
            "--exp",
            "exp.json",
            "--opset",
            "13",
            "--simplify",
        ])
        .unwrap();
        let options = cli.options();
        assert_eq!(options.opset, 13);
        assert!(options.simplify);
        assert_eq!(options.output_path().unwrap(), PathBuf::from("./m.onnx"));
    }

    #[test]
    fn weights_and_exp_are_required() {
        assert!(Cli::try_parse_from(["yolox-export", "-w", "m.pth"]).is_err());
        assert!(Cli::try_parse_from(["yolox-export", "-c", "exp.json"]).is_err());
    }

    #[test]
    fn opset_must_be_a_number() {
        assert!(
            Cli::try_parse_from(["yolox-export", "-w", "m", "-c", "e", "--opset", "eleven"])
                .is_err()
        );
    }
}
