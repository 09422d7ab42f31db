use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};

use dermanet_import::{
    identify_checkpoint, load_checkpoint, ArchHint, CheckpointFormat, LoadError, Mode,
    NetworkConfig,
};

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

/// A width-4 basic-block ResNet-18 with 7 output classes. Small enough
/// to execute in tests, but with the full torchvision name layout.
fn resnet18_tensors() -> HashMap<String, Tensor> {
    let width = 4;
    let mut tensors = HashMap::new();
    tensors.insert("conv1.weight".to_string(), zeros(&[width, 3, 7, 7]));
    bn_params(&mut tensors, "bn1", width);
    for stage in 1..=4 {
        for block in 0..2 {
            let prefix = format!("layer{stage}.{block}");
            tensors.insert(
                format!("{prefix}.conv1.weight"),
                zeros(&[width, width, 3, 3]),
            );
            tensors.insert(
                format!("{prefix}.conv2.weight"),
                zeros(&[width, width, 3, 3]),
            );
            bn_params(&mut tensors, &format!("{prefix}.bn1"), width);
            bn_params(&mut tensors, &format!("{prefix}.bn2"), width);
            if stage > 1 && block == 0 {
                tensors.insert(
                    format!("{prefix}.downsample.0.weight"),
                    zeros(&[width, width, 1, 1]),
                );
                bn_params(&mut tensors, &format!("{prefix}.downsample.1"), width);
            }
        }
    }
    tensors.insert("fc.weight".to_string(), zeros(&[7, width]));
    tensors.insert("fc.bias".to_string(), zeros(&[7]));
    tensors
}

/// A width-4 VGG-11 (no batch norm), torchvision `features` numbering.
fn vgg11_tensors() -> HashMap<String, Tensor> {
    let width = 4;
    let mut tensors = HashMap::new();
    for (i, &idx) in [0usize, 3, 6, 8, 11, 13, 16, 18].iter().enumerate() {
        let in_channels = if i == 0 { 3 } else { width };
        tensors.insert(
            format!("features.{idx}.weight"),
            zeros(&[width, in_channels, 3, 3]),
        );
        tensors.insert(format!("features.{idx}.bias"), zeros(&[width]));
    }
    tensors.insert("classifier.0.weight".to_string(), zeros(&[8, width * 7 * 7]));
    tensors.insert("classifier.0.bias".to_string(), zeros(&[8]));
    tensors.insert("classifier.3.weight".to_string(), zeros(&[8, 8]));
    tensors.insert("classifier.3.bias".to_string(), zeros(&[8]));
    tensors.insert("classifier.6.weight".to_string(), zeros(&[7, 8]));
    tensors.insert("classifier.6.bias".to_string(), zeros(&[7]));
    tensors
}

fn write_safetensors(tensors: &HashMap<String, Tensor>, path: &Path) {
    candle_core::safetensors::save(tensors, path).unwrap();
}

#[test]
fn resnet18_is_detected_from_tensor_names() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.safetensors");
    write_safetensors(&resnet18_tensors(), &path);

    let model = load_checkpoint(&path, None).unwrap();
    assert_eq!(model.config().architecture_name(), "resnet18");
    assert_eq!(model.config().num_classes(), 7);
    assert_eq!(model.mode(), Mode::Train);
    match model.config() {
        NetworkConfig::ResNet(config) => assert_eq!(config.stage_blocks, [2, 2, 2, 2]),
        other => panic!("expected ResNet config, got {other:?}"),
    }
}

#[test]
fn bottleneck_census_names_resnet50() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.safetensors");

    // Name-census fixture only; not executable.
    let mut tensors = HashMap::new();
    tensors.insert("conv1.weight".to_string(), zeros(&[4, 3, 7, 7]));
    bn_params(&mut tensors, "bn1", 4);
    for (stage, blocks) in [(1usize, 3usize), (2, 4), (3, 6), (4, 3)] {
        for block in 0..blocks {
            for conv in 1..=3 {
                tensors.insert(
                    format!("layer{stage}.{block}.conv{conv}.weight"),
                    zeros(&[4, 4, 1, 1]),
                );
            }
        }
    }
    tensors.insert("fc.weight".to_string(), zeros(&[7, 4]));
    write_safetensors(&tensors, &path);

    let model = load_checkpoint(&path, None).unwrap();
    assert_eq!(model.config().architecture_name(), "resnet50");
}

#[test]
fn vgg11_is_detected_from_features_layout() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.safetensors");
    write_safetensors(&vgg11_tensors(), &path);

    let model = load_checkpoint(&path, None).unwrap();
    assert_eq!(model.config().architecture_name(), "vgg11");
    assert_eq!(model.config().num_classes(), 7);
}

#[test]
fn shifted_features_layout_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.safetensors");

    // Eight convolutions but at non-torchvision indices.
    let mut tensors = vgg11_tensors();
    let moved = tensors.remove("features.3.weight").unwrap();
    tensors.insert("features.4.weight".to_string(), moved);
    write_safetensors(&tensors, &path);

    let err = load_checkpoint(&path, None).unwrap_err();
    assert!(matches!(err, LoadError::UnknownArchitecture(_)));
}

#[test]
fn set_eval_requires_running_statistics() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.safetensors");

    let mut tensors = resnet18_tensors();
    tensors.remove("layer3.0.bn2.running_var").unwrap();
    write_safetensors(&tensors, &path);

    let mut model = load_checkpoint(&path, None).unwrap();
    let err = model.set_eval().unwrap_err();
    match err {
        LoadError::MissingRunningStats(prefix) => assert_eq!(prefix, "layer3.0.bn2"),
        other => panic!("expected MissingRunningStats, got {other}"),
    }
}

#[test]
fn unrecognized_names_are_not_an_architecture() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.safetensors");

    let mut tensors = HashMap::new();
    tensors.insert("encoder.weight".to_string(), zeros(&[2, 2]));
    write_safetensors(&tensors, &path);

    let err = load_checkpoint(&path, None).unwrap_err();
    assert!(matches!(err, LoadError::UnknownArchitecture(_)));
}

#[test]
fn hint_overrides_detection() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.safetensors");
    write_safetensors(&resnet18_tensors(), &path);

    // Forcing the VGG survey on a ResNet checkpoint fails on the first
    // required tensor rather than misdetecting.
    let err = load_checkpoint(&path, Some(ArchHint::Vgg)).unwrap_err();
    match err {
        LoadError::MissingTensor(name) => assert_eq!(name, "features.0.weight"),
        other => panic!("expected MissingTensor, got {other}"),
    }
}

#[test]
fn checkpoint_format_is_sniffed_from_extension_and_magic() {
    let dir = tempfile::tempdir().unwrap();

    for ext in ["pth", "pt", "uu", "bin"] {
        let path = dir.path().join(format!("model.{ext}"));
        std::fs::write(&path, b"irrelevant").unwrap();
        assert_eq!(
            identify_checkpoint(&path).unwrap(),
            CheckpointFormat::PickleZip
        );
    }

    let st_path = dir.path().join("model.safetensors");
    std::fs::write(&st_path, b"irrelevant").unwrap();
    assert_eq!(
        identify_checkpoint(&st_path).unwrap(),
        CheckpointFormat::Safetensors
    );

    // Unknown extension falls back to the zip magic.
    let zip_path = dir.path().join("model.ckpt");
    std::fs::write(&zip_path, [b'P', b'K', 0x03, 0x04, 0x00]).unwrap();
    assert_eq!(
        identify_checkpoint(&zip_path).unwrap(),
        CheckpointFormat::PickleZip
    );

    let garbage_path = dir.path().join("model.ckpt2");
    std::fs::write(&garbage_path, b"not a checkpoint").unwrap();
    assert!(matches!(
        identify_checkpoint(&garbage_path).unwrap_err(),
        LoadError::CannotIdentify(_)
    ));

    assert!(matches!(
        identify_checkpoint(Path::new("missing.pth")).unwrap_err(),
        LoadError::MissingSource(_)
    ));
}

// Pickle checkpoints cannot be synthesized here; drop a real .pth under
// test_models/ to exercise the zip/pickle path end to end.
#[test]
fn local_pickle_checkpoint_loads_when_present() {
    let dir = Path::new("test_models");
    let Ok(entries) = std::fs::read_dir(dir) else {
        eprintln!("no test_models/ directory, skipping pickle checkpoint test");
        return;
    };
    let mut found = false;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_none_or(|e| e != "pth" && e != "pt") {
            continue;
        }
        found = true;
        let model = load_checkpoint(&path, None).unwrap();
        assert_eq!(model.mode(), Mode::Train);
        assert!(model.config().num_classes() > 0);
    }
    if !found {
        eprintln!("no .pth files under test_models/, skipping pickle checkpoint test");
    }
}
