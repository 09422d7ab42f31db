use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};

use dermanet::convert::{
    convert, ConvertError, ConvertOptions, DEFAULT_CLASS_LABELS, DUMMY_INPUT_DIMS, INPUT_NAME,
};
use dermanet::device::DevicePreference;
use dermanet::exec::{self, NoObserver};
use dermanet::graph::RunGraph;
use dermanet::trace::TracedModule;
use dermanet::verify::{max_abs_diff_of, verify, VerifyOptions};
use dermanet_import::LoadError;
use dermanet_onnx::export::ExportError;

fn rand_tensor(dims: &[usize]) -> Tensor {
    Tensor::rand(-0.2f32, 0.2, dims, &Device::Cpu).unwrap()
}

fn zeros(dims: &[usize]) -> Tensor {
    Tensor::zeros(dims, DType::F32, &Device::Cpu).unwrap()
}

fn ones(dims: &[usize]) -> Tensor {
    Tensor::ones(dims, DType::F32, &Device::Cpu).unwrap()
}

fn bn_params(tensors: &mut HashMap<String, Tensor>, prefix: &str, channels: usize) {
    tensors.insert(format!("{prefix}.weight"), ones(&[channels]));
    tensors.insert(format!("{prefix}.bias"), zeros(&[channels]));
    tensors.insert(format!("{prefix}.running_mean"), zeros(&[channels]));
    tensors.insert(format!("{prefix}.running_var"), ones(&[channels]));
}

/// Executable width-4 ResNet-18 with 7 classes and random conv weights.
fn resnet18_fixture(path: &Path) {
    let width = 4;
    let mut tensors = HashMap::new();
    tensors.insert("conv1.weight".to_string(), rand_tensor(&[width, 3, 7, 7]));
    bn_params(&mut tensors, "bn1", width);
    for stage in 1..=4 {
        for block in 0..2 {
            let prefix = format!("layer{stage}.{block}");
            tensors.insert(
                format!("{prefix}.conv1.weight"),
                rand_tensor(&[width, width, 3, 3]),
            );
            tensors.insert(
                format!("{prefix}.conv2.weight"),
                rand_tensor(&[width, width, 3, 3]),
            );
            bn_params(&mut tensors, &format!("{prefix}.bn1"), width);
            bn_params(&mut tensors, &format!("{prefix}.bn2"), width);
            if stage > 1 && block == 0 {
                tensors.insert(
                    format!("{prefix}.downsample.0.weight"),
                    rand_tensor(&[width, width, 1, 1]),
                );
                bn_params(&mut tensors, &format!("{prefix}.downsample.1"), width);
            }
        }
    }
    tensors.insert("fc.weight".to_string(), rand_tensor(&[7, width]));
    tensors.insert("fc.bias".to_string(), rand_tensor(&[7]));
    candle_core::safetensors::save(&tensors, path).unwrap();
}

#[test]
fn convert_writes_model_validated_against_fixed_input() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("checkpoint.safetensors");
    resnet18_fixture(&source);

    let mut options = ConvertOptions::new(&source);
    options.onnx_output = dir.path().join("skin_cancer_detector.onnx");
    let report = convert(&options).unwrap();

    assert_eq!(report.architecture, "resnet18");
    assert_eq!(report.num_classes, 7);
    assert_eq!(report.class_labels, DEFAULT_CLASS_LABELS.to_vec());
    assert!(report.onnx_output.exists());
    assert!(report.traced_output.is_none());

    let graph = RunGraph::from_onnx_file(&report.onnx_output).unwrap();
    assert_eq!(graph.opset_version, 9);
    assert_eq!(graph.inputs.len(), 1);
    assert_eq!(graph.inputs[0].name, INPUT_NAME);
    assert_eq!(graph.inputs[0].dims, DUMMY_INPUT_DIMS.to_vec());

    let metadata = graph.metadata.as_ref().expect("metadata embedded");
    assert_eq!(metadata.architecture, "resnet18");
    assert_eq!(metadata.class_names, DEFAULT_CLASS_LABELS.to_vec());

    // The exported graph actually runs, and produces one logit per class.
    let device = Device::Cpu;
    let input = ones(&DUMMY_INPUT_DIMS);
    let inputs = HashMap::from([(INPUT_NAME.to_string(), input)]);
    let outputs = exec::run(&graph, &inputs, &device, &mut NoObserver).unwrap();
    let logits = outputs.get("logits").expect("logits output");
    assert_eq!(logits.dims(), [1, 7]);
}

#[test]
fn missing_checkpoint_is_a_load_error_and_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = ConvertOptions::new(dir.path().join("absent.pth"));
    options.onnx_output = dir.path().join("out.onnx");
    options.traced_output = Some(dir.path().join("out.trace"));

    let err = convert(&options).unwrap_err();
    assert!(matches!(
        err,
        ConvertError::Load(LoadError::MissingSource(_))
    ));
    assert!(!options.onnx_output.exists());
    assert!(!options.traced_output.as_ref().unwrap().exists());
}

#[test]
fn first_conv_channel_mismatch_is_an_export_error() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("checkpoint.safetensors");

    // conv1 expects 4 input channels; the dummy image carries 3.
    let width = 4;
    let mut tensors = HashMap::new();
    tensors.insert("conv1.weight".to_string(), rand_tensor(&[width, 4, 7, 7]));
    bn_params(&mut tensors, "bn1", width);
    for stage in 1..=4 {
        for block in 0..2 {
            let prefix = format!("layer{stage}.{block}");
            tensors.insert(
                format!("{prefix}.conv1.weight"),
                rand_tensor(&[width, width, 3, 3]),
            );
            tensors.insert(
                format!("{prefix}.conv2.weight"),
                rand_tensor(&[width, width, 3, 3]),
            );
            bn_params(&mut tensors, &format!("{prefix}.bn1"), width);
            bn_params(&mut tensors, &format!("{prefix}.bn2"), width);
            if stage > 1 && block == 0 {
                tensors.insert(
                    format!("{prefix}.downsample.0.weight"),
                    rand_tensor(&[width, width, 1, 1]),
                );
                bn_params(&mut tensors, &format!("{prefix}.downsample.1"), width);
            }
        }
    }
    tensors.insert("fc.weight".to_string(), rand_tensor(&[7, width]));
    candle_core::safetensors::save(&tensors, &source).unwrap();

    let mut options = ConvertOptions::new(&source);
    options.onnx_output = dir.path().join("out.onnx");
    let err = convert(&options).unwrap_err();
    assert!(matches!(
        err,
        ConvertError::Export(ExportError::Graph(_))
    ));
}

#[test]
fn trace_replay_matches_direct_execution() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("checkpoint.safetensors");
    resnet18_fixture(&source);

    let mut options = ConvertOptions::new(&source);
    options.onnx_output = dir.path().join("skin_cancer_detector.onnx");
    options.traced_output = Some(dir.path().join("skin_cancer_detector.pth"));
    let report = convert(&options).unwrap();
    let traced_path = report.traced_output.expect("traced module written");
    assert!(traced_path.exists());

    let device = Device::Cpu;
    let graph = RunGraph::from_onnx_file(&report.onnx_output).unwrap();
    let inputs = HashMap::from([(INPUT_NAME.to_string(), ones(&DUMMY_INPUT_DIMS))]);
    let direct = exec::run(&graph, &inputs, &device, &mut NoObserver).unwrap();

    let module = TracedModule::load(&traced_path).unwrap();
    let replayed = module.replay(&inputs, &device).unwrap();

    let a: Vec<f32> = direct["logits"].flatten_all().unwrap().to_vec1().unwrap();
    let b: Vec<f32> = replayed["logits"].flatten_all().unwrap().to_vec1().unwrap();
    assert!(max_abs_diff_of(&a, &b) <= 1e-5);

    // And the built-in verifier agrees.
    let mut verify_options = VerifyOptions::new(&report.onnx_output);
    verify_options.traced_path = Some(traced_path);
    let verify_report = verify(&verify_options).unwrap();
    assert_eq!(verify_report.opset_version, 9);
    assert_eq!(verify_report.top.len(), 3);
    assert!(verify_report.max_abs_diff.unwrap() <= 1e-5);
    let probability_sum: f32 = verify_report.top.iter().map(|s| s.probability).sum();
    assert!(probability_sum <= 1.0 + 1e-5);
}

#[test]
fn auto_device_preference_always_resolves() {
    // Without a CUDA device the preference degrades to CPU instead of
    // failing the conversion.
    let device = DevicePreference::CudaIfAvailable.resolve().unwrap();
    let probe = Tensor::zeros((2, 2), DType::F32, &device);
    assert!(probe.is_ok());

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("checkpoint.safetensors");
    resnet18_fixture(&source);

    let mut options = ConvertOptions::new(&source);
    options.device = DevicePreference::CudaIfAvailable;
    options.onnx_output = dir.path().join("out.onnx");
    let report = convert(&options).unwrap();
    assert!(report.onnx_output.exists());
}

#[test]
fn requested_opset_is_honored_and_validated() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("checkpoint.safetensors");
    resnet18_fixture(&source);

    let mut options = ConvertOptions::new(&source);
    options.onnx_output = dir.path().join("out.onnx");
    options.opset_version = 13;
    let report = convert(&options).unwrap();
    let graph = RunGraph::from_onnx_file(&report.onnx_output).unwrap();
    assert_eq!(graph.opset_version, 13);

    // Batch norm pins the floor to 9.
    options.opset_version = 8;
    let err = convert(&options).unwrap_err();
    assert!(matches!(
        err,
        ConvertError::Export(ExportError::UnsupportedOperator { .. })
    ));
}

#[test]
fn bin_file_weights_reload_and_execute() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("checkpoint.safetensors");
    resnet18_fixture(&source);

    let mut options = ConvertOptions::new(&source);
    options.onnx_output = dir.path().join("out.onnx");
    options.weight_storage =
        dermanet_onnx::export::WeightStorage::BinFile(dir.path().join("out.onnx.bin"));
    let report = convert(&options).unwrap();

    let sidecar = dir.path().join("out.onnx.bin");
    assert!(sidecar.exists());
    assert!(std::fs::metadata(&sidecar).unwrap().len() > 0);

    // External-data initializers resolve relative to the model directory.
    let graph = RunGraph::from_onnx_file(&report.onnx_output).unwrap();
    let inputs = HashMap::from([(INPUT_NAME.to_string(), ones(&DUMMY_INPUT_DIMS))]);
    let outputs = exec::run(&graph, &inputs, &Device::Cpu, &mut NoObserver).unwrap();
    assert_eq!(outputs["logits"].dims(), [1, 7]);
}
