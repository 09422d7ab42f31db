use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "dermanet", version, about = "Skin-lesion classifier checkpoint converter")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Convert a checkpoint to an ONNX model
    Convert {
        /// Path to the checkpoint (.pth/.pt/.safetensors)
        source: Option<PathBuf>,

        /// JSON settings file; command-line flags win over it
        #[arg(long)]
        settings: Option<PathBuf>,

        /// Device to convert on (cpu, auto, cuda or cuda:N)
        #[arg(long)]
        device: Option<String>,

        /// Output path for the ONNX model
        #[arg(long)]
        output: Option<PathBuf>,

        /// Also write a traced module to this path
        #[arg(long)]
        traced_output: Option<PathBuf>,

        /// Write a traced module next to the ONNX output
        #[arg(long)]
        traced: bool,

        /// ONNX operator-set version
        #[arg(long)]
        opset: Option<i64>,

        /// Disable constant folding
        #[arg(long)]
        no_fold: bool,

        /// Store weights in this side file instead of embedding them
        #[arg(long)]
        weights_file: Option<PathBuf>,

        /// Architecture hint (resnet or vgg)
        #[arg(long)]
        arch: Option<String>,
    },

    /// Print structure and metadata of an exported model
    Inspect {
        /// Path to the ONNX model
        model: PathBuf,

        /// Also list every node
        #[arg(long)]
        nodes: bool,
    },

    /// Reload an exported model, run it, and check trace agreement
    Verify {
        /// Path to the ONNX model
        model: PathBuf,

        /// Traced module to replay against direct execution
        #[arg(long)]
        traced: Option<PathBuf>,

        /// Device to run on (cpu, auto, cuda or cuda:N)
        #[arg(long, default_value = "cpu")]
        device: String,

        /// Largest tolerated deviation between trace and direct run
        #[arg(long, default_value_t = dermanet::verify::DEFAULT_TOLERANCE)]
        tolerance: f32,

        /// How many top classes to print
        #[arg(long, default_value_t = 3)]
        top_k: usize,
    },
}
