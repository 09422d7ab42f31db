use std::sync::Arc;

use dermanet_onnx::export::{
    build_model_proto, export_to_file, ExportError, ExportOptions, ConverterMetadata,
    InputNormalization, WeightStorage, METADATA_KEY,
};
use dermanet_onnx::onnx;
use dermanet_onnx::ops::{Add, BatchNormalization, Constant, Conv, Relu, Reshape};
use dermanet_onnx::GraphError;
use dermanet_onnx::tensor::{DType, InputTensor, Shape, Tensor, TensorData};

fn image_input(dims: &[usize]) -> Arc<InputTensor> {
    InputTensor::new("input".to_string(), DType::F32, Shape::new(dims.to_vec()))
}

fn constant(name: &str, dims: &[usize], value: f32) -> Arc<Constant> {
    Constant::new(
        Some(name.to_string()),
        TensorData::fill(Shape::new(dims.to_vec()), value).unwrap(),
    )
}

fn small_conv_graph() -> (Arc<InputTensor>, Arc<dyn Tensor>) {
    let input = image_input(&[1, 3, 8, 8]);
    let weight = constant("conv.weight", &[4, 3, 3, 3], 0.1);
    let conv = Conv::new(
        Some("conv".to_string()),
        input.clone(),
        weight,
        None,
        [1, 1],
        [1, 1],
        [1, 1],
        1,
    )
    .unwrap();
    let relu: Arc<dyn Tensor> = Relu::new(Some("relu".to_string()), conv).unwrap();
    (input, relu)
}

fn graph_of(proto: &onnx::ModelProto) -> &onnx::GraphProto {
    proto.graph.as_ref().expect("model has a graph")
}

#[test]
fn model_carries_requested_opset_and_static_input_shape() {
    let (input, output) = small_conv_graph();
    let proto = build_model_proto(
        &[input],
        &[("logits", output)],
        &ExportOptions::default(),
    )
    .unwrap();

    assert_eq!(proto.opset_import.len(), 1);
    assert_eq!(proto.opset_import[0].version, 9);
    assert_eq!(proto.ir_version, 7);

    let graph = graph_of(&proto);
    assert_eq!(graph.input.len(), 1);
    assert_eq!(graph.input[0].name, "input");
    let Some(onnx::type_proto::Value::TensorType(tensor_type)) =
        graph.input[0].r#type.as_ref().and_then(|t| t.value.as_ref())
    else {
        panic!("input has no tensor type");
    };
    let dims: Vec<i64> = tensor_type
        .shape
        .as_ref()
        .unwrap()
        .dim
        .iter()
        .map(|d| match d.value.as_ref().unwrap() {
            onnx::tensor_shape_proto::dimension::Value::DimValue(v) => *v,
            other => panic!("symbolic dim {other:?}"),
        })
        .collect();
    assert_eq!(dims, vec![1, 3, 8, 8]);

    let ops: Vec<&str> = graph.node.iter().map(|n| n.op_type.as_str()).collect();
    assert_eq!(ops, vec!["Conv", "Relu"]);
    assert_eq!(graph.output.len(), 1);
    assert_eq!(graph.output[0].name, "logits");
    // The conv weight folds into an initializer.
    assert_eq!(graph.initializer.len(), 1);
    assert_eq!(graph.initializer[0].dims, vec![4, 3, 3, 3]);
}

#[test]
fn constant_folding_collapses_static_subgraphs() {
    let build = |fold: bool| {
        let input = image_input(&[2, 2]);
        let a = constant("a", &[2, 2], 2.0);
        let b = constant("b", &[2, 2], 3.0);
        let sum = Add::new(Some("static_sum".to_string()), a, b).unwrap();
        let out = Add::new(Some("dynamic_sum".to_string()), input.clone(), sum).unwrap();
        let options = ExportOptions {
            constant_folding: fold,
            ..Default::default()
        };
        build_model_proto(&[input], &[("out", out)], &options).unwrap()
    };

    let folded = build(true);
    let unfolded = build(false);
    let folded_graph = graph_of(&folded);
    let unfolded_graph = graph_of(&unfolded);

    assert!(folded_graph.node.len() < unfolded_graph.node.len());
    assert_eq!(folded_graph.node.len(), 1);
    assert_eq!(folded_graph.node[0].op_type, "Add");

    // The static subgraph collapsed into a single precomputed value.
    assert_eq!(folded_graph.initializer.len(), 1);
    let values: Vec<f32> = folded_graph.initializer[0]
        .raw_data
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    assert_eq!(values, vec![5.0; 4]);
}

#[test]
fn batch_norm_rejects_opset_below_nine() {
    let input = image_input(&[1, 2, 4, 4]);
    let bn = BatchNormalization::new(
        Some("bn".to_string()),
        input.clone(),
        constant("bn.weight", &[2], 1.0),
        constant("bn.bias", &[2], 0.0),
        constant("bn.running_mean", &[2], 0.0),
        constant("bn.running_var", &[2], 1.0),
        1e-5,
    )
    .unwrap();

    let options = ExportOptions {
        opset_version: 8,
        ..Default::default()
    };
    let err = build_model_proto(&[input], &[("out", bn)], &options).unwrap_err();
    match err {
        ExportError::UnsupportedOperator {
            op,
            required,
            requested,
        } => {
            assert_eq!(op, "BatchNormalization");
            assert_eq!(required, 9);
            assert_eq!(requested, 8);
        }
        other => panic!("expected UnsupportedOperator, got {other}"),
    }
}

#[test]
fn opset_outside_window_is_rejected() {
    let (input, output) = small_conv_graph();
    for opset in [6, 14] {
        let options = ExportOptions {
            opset_version: opset,
            ..Default::default()
        };
        let err = build_model_proto(&[input.clone()], &[("logits", output.clone())], &options)
            .unwrap_err();
        assert!(matches!(err, ExportError::UnsupportedOpset(v) if v == opset));
        assert_eq!(
            err.to_string(),
            format!("opset version {opset} is outside the supported window 7..=13")
        );
    }
}

#[test]
fn duplicate_output_names_conflict() {
    let input = image_input(&[2, 2]);
    let a: Arc<dyn Tensor> = Add::new(None, input.clone(), constant("a", &[2, 2], 1.0)).unwrap();
    let b: Arc<dyn Tensor> = Add::new(None, input.clone(), constant("b", &[2, 2], 2.0)).unwrap();
    let err = build_model_proto(
        &[input],
        &[("out", a), ("out", b)],
        &ExportOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, ExportError::NameConflict(name) if name == "out"));
}

#[test]
fn bin_file_storage_writes_weights_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let model_path = dir.path().join("model.onnx");
    let weights_path = dir.path().join("model.bin");

    let (input, output) = small_conv_graph();
    let options = ExportOptions {
        weight_storage: WeightStorage::BinFile(weights_path.clone()),
        ..Default::default()
    };
    let proto = export_to_file(&model_path, &[input], &[("logits", output)], &options).unwrap();

    let graph = graph_of(&proto);
    assert_eq!(graph.initializer.len(), 1);
    let initializer = &graph.initializer[0];
    assert!(initializer.raw_data.is_empty());
    assert_eq!(
        initializer.data_location,
        onnx::tensor_proto::DataLocation::External as i32
    );
    let entry = |key: &str| {
        initializer
            .external_data
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.clone())
            .unwrap()
    };
    assert_eq!(entry("location"), "model.bin");
    assert_eq!(entry("offset"), "0");
    assert_eq!(entry("length"), (4 * 4 * 3 * 3 * 3).to_string());

    let written = std::fs::metadata(&weights_path).unwrap().len();
    assert_eq!(written, 4 * 4 * 3 * 3 * 3);
    assert!(model_path.exists());
}

#[test]
fn metadata_round_trips_through_metadata_props() {
    let (input, output) = small_conv_graph();
    let metadata = ConverterMetadata {
        architecture: "resnet18".to_string(),
        class_names: vec!["mel".to_string(), "nv".to_string()],
        normalization: Some(InputNormalization {
            mean: vec![0.485, 0.456, 0.406],
            std: vec![0.229, 0.224, 0.225],
        }),
    };
    let options = ExportOptions {
        metadata: Some(metadata.clone()),
        ..Default::default()
    };
    let proto = build_model_proto(&[input], &[("logits", output)], &options).unwrap();

    let entry = proto
        .metadata_props
        .iter()
        .find(|p| p.key == METADATA_KEY)
        .expect("metadata entry present");
    let decoded: ConverterMetadata = serde_json::from_str(&entry.value).unwrap();
    assert_eq!(decoded, metadata);
}

#[test]
fn reshape_zero_dim_must_have_an_input_counterpart() {
    let input = image_input(&[2, 3]);
    // A trailing 0 at position 2 has no input dim to copy.
    let err = Reshape::new(None, input.clone(), vec![2, 3, 0]).unwrap_err();
    assert!(matches!(err, GraphError::InvalidInput(_)));

    let reshaped = Reshape::new(None, input, vec![0, -1]).unwrap();
    assert_eq!(reshaped.shape().dims(), [2, 3]);
}
