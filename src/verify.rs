//! Post-export validation: reload the written model, run it on the
//! fixed dummy input, and when a traced module exists check that replay
//! agrees with direct execution.

use std::collections::HashMap;
use std::path::PathBuf;

use candle_core::Tensor;
use num_traits::Float;

use dermanet_onnx::export::ConverterMetadata;

use crate::convert::{dummy_input, DUMMY_INPUT_DIMS, INPUT_NAME};
use crate::device::{DeviceError, DevicePreference};
use crate::exec::{self, ExecError, NoObserver};
use crate::graph::{DecodeError, RunGraph};
use crate::report::{class_probabilities, ClassScore, ReportError};
use crate::trace::{TraceError, TracedModule};

pub const DEFAULT_TOLERANCE: f32 = 1e-5;

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("model decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("model execution failed: {0}")]
    Exec(#[from] ExecError),
    #[error("trace check failed: {0}")]
    Trace(#[from] TraceError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error("model problem: {0}")]
    BadModel(String),
    #[error("trace output diverges from direct execution: max |diff| {max} > tolerance {tolerance}")]
    ToleranceExceeded { max: f32, tolerance: f32 },
}

#[derive(Clone, Debug)]
pub struct VerifyOptions {
    pub onnx_path: PathBuf,
    pub traced_path: Option<PathBuf>,
    pub device: DevicePreference,
    pub tolerance: f32,
    pub top_k: usize,
}

impl VerifyOptions {
    pub fn new(onnx_path: impl Into<PathBuf>) -> Self {
        Self {
            onnx_path: onnx_path.into(),
            traced_path: None,
            device: DevicePreference::Cpu,
            tolerance: DEFAULT_TOLERANCE,
            top_k: 3,
        }
    }
}

#[derive(Clone, Debug)]
pub struct VerifyReport {
    pub opset_version: i64,
    pub input_dims: Vec<usize>,
    pub metadata: Option<ConverterMetadata>,
    pub node_count: usize,
    pub top: Vec<ClassScore>,
    /// Largest deviation between trace replay and direct execution,
    /// present when a traced module was checked.
    pub max_abs_diff: Option<f32>,
}

pub fn verify(options: &VerifyOptions) -> Result<VerifyReport, VerifyError> {
    let graph = RunGraph::from_onnx_file(&options.onnx_path)?;
    let input_spec = graph
        .inputs
        .first()
        .ok_or_else(|| VerifyError::BadModel("model has no inputs".to_string()))?;
    if input_spec.dims != DUMMY_INPUT_DIMS {
        return Err(VerifyError::BadModel(format!(
            "input dims {:?} do not match the expected {:?}",
            input_spec.dims, DUMMY_INPUT_DIMS
        )));
    }

    let device = options.device.resolve()?;
    let dummy = dummy_input(&device)?;
    let inputs = HashMap::from([(INPUT_NAME.to_string(), dummy)]);
    let outputs = exec::run(&graph, &inputs, &device, &mut NoObserver)?;
    let logits = first_output(&graph.outputs, &outputs)?;

    let labels = graph
        .metadata
        .as_ref()
        .map(|m| m.class_names.clone())
        .unwrap_or_default();
    let top = class_probabilities(logits, &labels, options.top_k)?;

    let max_abs_diff = match &options.traced_path {
        Some(path) => {
            let module = TracedModule::load(path)?;
            let replayed = module.replay(&inputs, &device)?;
            let mut max = 0.0f32;
            for name in &graph.outputs {
                let direct = outputs
                    .get(name)
                    .ok_or_else(|| ExecError::MissingTensor(name.clone()))?;
                let traced = replayed
                    .get(name)
                    .ok_or_else(|| ExecError::MissingTensor(name.clone()))?;
                max = max.max(max_abs_diff_of(
                    &direct.flatten_all()?.to_vec1::<f32>()?,
                    &traced.flatten_all()?.to_vec1::<f32>()?,
                ));
            }
            if max > options.tolerance {
                return Err(VerifyError::ToleranceExceeded {
                    max,
                    tolerance: options.tolerance,
                });
            }
            Some(max)
        }
        None => None,
    };

    Ok(VerifyReport {
        opset_version: graph.opset_version,
        input_dims: input_spec.dims.clone(),
        metadata: graph.metadata.clone(),
        node_count: graph.ops.len(),
        top,
        max_abs_diff,
    })
}

fn first_output<'a>(
    names: &[String],
    outputs: &'a HashMap<String, Tensor>,
) -> Result<&'a Tensor, VerifyError> {
    let name = names
        .first()
        .ok_or_else(|| VerifyError::BadModel("model has no outputs".to_string()))?;
    outputs
        .get(name)
        .ok_or_else(|| VerifyError::Exec(ExecError::MissingTensor(name.clone())))
}

/// Elementwise worst-case deviation. Length mismatch counts as infinite
/// divergence rather than a silent truncation.
pub fn max_abs_diff_of<T: Float>(a: &[T], b: &[T]) -> T {
    if a.len() != b.len() {
        return T::infinity();
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (*x - *y).abs())
        .fold(T::zero(), T::max)
}
