//! The conversion pipeline: load a checkpoint, switch it to inference
//! form, build the export graph, write the ONNX file and optionally a
//! traced module of the same computation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::Tensor as CandleTensor;

use dermanet_import::{load_checkpoint, ArchHint, LoadError};
use dermanet_onnx::export::{
    export_to_file, ConverterMetadata, ExportError, ExportOptions, InputNormalization,
    WeightStorage, DEFAULT_OPSET_VERSION,
};
use dermanet_onnx::tensor::{DType, InputTensor, Shape};

use crate::device::{DeviceError, DevicePreference};
use crate::graph::RunGraph;
use crate::trace::{self, TraceError};

pub const INPUT_NAME: &str = "input";
pub const OUTPUT_NAME: &str = "logits";

/// The conversion always validates against a single RGB image at the
/// training resolution.
pub const DUMMY_INPUT_DIMS: [usize; 4] = [1, 3, 224, 224];

pub const DEFAULT_ONNX_OUTPUT: &str = "skin_cancer_detector.onnx";
pub const DEFAULT_TRACED_OUTPUT: &str = "skin_cancer_detector.pth";

/// HAM10000 lesion categories, in the class-index order the classifier
/// was trained with.
pub const DEFAULT_CLASS_LABELS: [&str; 7] = ["akiec", "bcc", "bkl", "df", "mel", "nv", "vasc"];

/// ImageNet channel statistics used by the torchvision-style training
/// pipeline.
pub fn default_normalization() -> InputNormalization {
    InputNormalization {
        mean: vec![0.485, 0.456, 0.406],
        std: vec![0.229, 0.224, 0.225],
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("checkpoint load failed: {0}")]
    Load(#[from] LoadError),
    #[error("device selection failed: {0}")]
    Device(#[from] DeviceError),
    #[error("export failed: {0}")]
    Export(#[from] ExportError),
    #[error("trace failed: {0}")]
    Trace(#[from] TraceError),
}

#[derive(Clone, Debug)]
pub struct ConvertOptions {
    pub source: PathBuf,
    pub device: DevicePreference,
    pub onnx_output: PathBuf,
    /// `None` skips the traced module entirely.
    pub traced_output: Option<PathBuf>,
    pub opset_version: i64,
    pub constant_folding: bool,
    pub weight_storage: WeightStorage,
    pub architecture: Option<ArchHint>,
    pub class_labels: Option<Vec<String>>,
    pub normalization: Option<InputNormalization>,
}

impl ConvertOptions {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            device: DevicePreference::Cpu,
            onnx_output: PathBuf::from(DEFAULT_ONNX_OUTPUT),
            traced_output: None,
            opset_version: DEFAULT_OPSET_VERSION,
            constant_folding: true,
            weight_storage: WeightStorage::Embedded,
            architecture: None,
            class_labels: None,
            normalization: Some(default_normalization()),
        }
    }

    pub fn with_traced_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.traced_output = Some(path.into());
        self
    }
}

/// What a finished conversion produced.
#[derive(Clone, Debug)]
pub struct ConvertReport {
    pub architecture: String,
    pub num_classes: usize,
    pub class_labels: Vec<String>,
    pub device: String,
    pub onnx_output: PathBuf,
    pub traced_output: Option<PathBuf>,
    pub node_count: usize,
    pub initializer_count: usize,
}

pub fn convert(options: &ConvertOptions) -> Result<ConvertReport, ConvertError> {
    let mut checkpoint = load_checkpoint(&options.source, options.architecture)?;
    checkpoint.set_eval()?;

    let architecture = checkpoint.config().architecture_name();
    let num_classes = checkpoint.config().num_classes();
    let class_labels = resolve_labels(options.class_labels.as_deref(), num_classes);
    log::info!("converting {architecture} checkpoint with {num_classes} classes");

    let device = options.device.resolve()?;
    let dummy = dummy_input(&device)?;

    let input = InputTensor::new(
        INPUT_NAME.to_string(),
        DType::F32,
        Shape::new(DUMMY_INPUT_DIMS.to_vec()),
    );
    let logits = checkpoint
        .build_graph(input.clone())
        .map_err(ExportError::Graph)?;

    let export_options = ExportOptions {
        opset_version: options.opset_version,
        constant_folding: options.constant_folding,
        weight_storage: options.weight_storage.clone(),
        metadata: Some(ConverterMetadata {
            architecture: architecture.clone(),
            class_names: class_labels.clone(),
            normalization: options.normalization.clone(),
        }),
    };
    let proto = export_to_file(
        &options.onnx_output,
        &[input.clone()],
        &[(OUTPUT_NAME, logits)],
        &export_options,
    )?;
    let node_count = proto.graph.as_ref().map(|g| g.node.len()).unwrap_or(0);
    let initializer_count = proto
        .graph
        .as_ref()
        .map(|g| g.initializer.len())
        .unwrap_or(0);

    let traced_output = match &options.traced_output {
        Some(path) => {
            write_trace(&proto, options.onnx_output.parent(), path, &dummy, &device)?;
            Some(path.clone())
        }
        None => None,
    };

    Ok(ConvertReport {
        architecture,
        num_classes,
        class_labels,
        device: format!("{device:?}"),
        onnx_output: options.onnx_output.clone(),
        traced_output,
        node_count,
        initializer_count,
    })
}

fn write_trace(
    proto: &dermanet_onnx::onnx::ModelProto,
    external_dir: Option<&Path>,
    path: &Path,
    dummy: &CandleTensor,
    device: &candle_core::Device,
) -> Result<(), TraceError> {
    let graph = RunGraph::from_model_proto(proto, external_dir)?;
    let inputs = HashMap::from([(INPUT_NAME.to_string(), dummy.clone())]);
    let (module, _) = trace::capture(&graph, &inputs, device)?;
    module.save(path)
}

fn resolve_labels(labels: Option<&[String]>, num_classes: usize) -> Vec<String> {
    match labels {
        Some(labels) if labels.len() == num_classes => labels.to_vec(),
        Some(labels) => {
            log::warn!(
                "{} labels given for {} classes, falling back to generated names",
                labels.len(),
                num_classes
            );
            generated_labels(num_classes)
        }
        None if num_classes == DEFAULT_CLASS_LABELS.len() => DEFAULT_CLASS_LABELS
            .iter()
            .map(|s| s.to_string())
            .collect(),
        None => generated_labels(num_classes),
    }
}

fn generated_labels(num_classes: usize) -> Vec<String> {
    (0..num_classes).map(|i| format!("class_{i}")).collect()
}

/// Dummy input used for tracing and verification.
pub fn dummy_input(device: &candle_core::Device) -> Result<CandleTensor, DeviceError> {
    CandleTensor::ones(&DUMMY_INPUT_DIMS, candle_core::DType::F32, device).map_err(|source| {
        DeviceError::Allocation {
            device: format!("{device:?}"),
            source,
        }
    })
}
