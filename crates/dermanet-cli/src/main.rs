mod cli;

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;

use cli::{Cli, Command};
use dermanet::convert::DEFAULT_TRACED_OUTPUT;
use dermanet::graph::RunGraph;
use dermanet::settings::ConvertSettings;
use dermanet::verify::{verify, VerifyOptions};
use dermanet::DevicePreference;
use dermanet_import::ArchHint;
use dermanet_onnx::export::WeightStorage;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Convert {
            source,
            settings,
            device,
            output,
            traced_output,
            traced,
            opset,
            no_fold,
            weights_file,
            arch,
        } => run_convert(
            source,
            settings,
            device,
            output,
            traced_output,
            traced,
            opset,
            no_fold,
            weights_file,
            arch,
        ),
        Command::Inspect { model, nodes } => run_inspect(model, nodes),
        Command::Verify {
            model,
            traced,
            device,
            tolerance,
            top_k,
        } => run_verify(model, traced, device, tolerance, top_k),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_convert(
    source: Option<PathBuf>,
    settings: Option<PathBuf>,
    device: Option<String>,
    output: Option<PathBuf>,
    traced_output: Option<PathBuf>,
    traced: bool,
    opset: Option<i64>,
    no_fold: bool,
    weights_file: Option<PathBuf>,
    arch: Option<String>,
) -> Result<()> {
    let settings = match settings {
        Some(path) => ConvertSettings::from_file(&path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => ConvertSettings::default(),
    };
    let mut options = settings.into_options(source)?;

    if let Some(device) = device {
        options.device = DevicePreference::from_str(&device)?;
    }
    if let Some(output) = output {
        options.onnx_output = output;
    }
    if let Some(path) = traced_output {
        options.traced_output = Some(path);
    } else if traced && options.traced_output.is_none() {
        options.traced_output = Some(
            options
                .onnx_output
                .parent()
                .map(|dir| dir.join(DEFAULT_TRACED_OUTPUT))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TRACED_OUTPUT)),
        );
    }
    if let Some(opset) = opset {
        options.opset_version = opset;
    }
    if no_fold {
        options.constant_folding = false;
    }
    if let Some(path) = weights_file {
        options.weight_storage = WeightStorage::BinFile(path);
    }
    if let Some(arch) = arch {
        options.architecture =
            Some(ArchHint::from_str(&arch).map_err(|_| {
                anyhow::anyhow!("unknown architecture hint {arch} (expected resnet or vgg)")
            })?);
    }

    let report = dermanet::convert(&options)?;
    println!(
        "converted {} ({} classes) on {}",
        report.architecture, report.num_classes, report.device
    );
    println!(
        "  {} ({} nodes, {} initializers)",
        report.onnx_output.display(),
        report.node_count,
        report.initializer_count
    );
    if let Some(traced) = &report.traced_output {
        println!("  {}", traced.display());
    }
    Ok(())
}

fn run_inspect(model: PathBuf, nodes: bool) -> Result<()> {
    let graph = RunGraph::from_onnx_file(&model)
        .with_context(|| format!("decoding {}", model.display()))?;
    println!("opset: {}", graph.opset_version);
    for input in &graph.inputs {
        println!("input: {} {:?}", input.name, input.dims);
    }
    for output in &graph.outputs {
        println!("output: {output}");
    }
    println!(
        "{} nodes, {} initializers",
        graph.ops.len(),
        graph.initializers.len()
    );
    if let Some(metadata) = &graph.metadata {
        println!("metadata: {}", serde_json::to_string_pretty(metadata)?);
    }
    if nodes {
        for op in &graph.ops {
            println!("  {} -> {} ({:?})", op.name, op.output, op.kind);
        }
    }
    Ok(())
}

fn run_verify(
    model: PathBuf,
    traced: Option<PathBuf>,
    device: String,
    tolerance: f32,
    top_k: usize,
) -> Result<()> {
    let mut options = VerifyOptions::new(model);
    options.traced_path = traced;
    options.device = DevicePreference::from_str(&device)?;
    options.tolerance = tolerance;
    options.top_k = top_k;

    let report = verify(&options)?;
    println!(
        "opset {} model, input {:?}, {} nodes",
        report.opset_version, report.input_dims, report.node_count
    );
    if let Some(metadata) = &report.metadata {
        println!("architecture: {}", metadata.architecture);
    }
    for score in &report.top {
        println!("  {:<8} {:.4}", score.label, score.probability);
    }
    match report.max_abs_diff {
        Some(diff) => println!("trace agrees with direct execution (max |diff| {diff:e})"),
        None => println!("no traced module checked"),
    }
    Ok(())
}
