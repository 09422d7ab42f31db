use std::collections::HashMap;
use std::sync::Arc;

use crate::proto::onnx;
use crate::tensor::{DType, Shape, Tensor, TensorData, TensorKey};

/// An operator in the export graph.
pub trait Node {
    fn input_tensors(&self) -> Vec<Arc<dyn Tensor>>;

    fn name(&self) -> Option<&str> {
        None
    }

    fn op_type(&self) -> &str;

    /// Lowest operator-set version this node's emitted form is valid for.
    fn min_opset(&self) -> i64 {
        1
    }

    fn attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![]
    }

    fn to_node_proto(
        &self,
        name: Option<String>,
        output_name: &str,
        tensor_names: &HashMap<TensorKey, String>,
    ) -> onnx::NodeProto {
        onnx::NodeProto {
            name: name.unwrap_or_default(),
            input: self
                .input_tensors()
                .into_iter()
                .map(|t| tensor_names[&TensorKey(t)].clone())
                .collect(),
            output: vec![output_name.to_string()],
            op_type: self.op_type().to_string(),
            attribute: self.attributes(),
            ..Default::default()
        }
    }
}

/// Operators with exactly one output tensor. Every operator the converter
/// emits is of this kind, so the blanket impl below is the only bridge
/// from nodes to tensors.
pub trait SingleOutputNode: Node {
    fn output_shape(&self) -> &Shape;

    fn output_dtype(&self) -> DType;

    /// Fold hook: compute the output value when all inputs are constant.
    fn fold_output_data(&self) -> Result<Option<TensorData>, crate::GraphError> {
        Ok(None)
    }
}

impl<T: SingleOutputNode> Tensor for T {
    fn dtype(&self) -> DType {
        self.output_dtype()
    }

    fn shape(&self) -> &Shape {
        self.output_shape()
    }

    fn inputs(&self) -> Vec<Arc<dyn Tensor>> {
        self.input_tensors()
    }

    fn op(&self) -> Option<&dyn Node> {
        Some(self)
    }

    fn try_resolve_data(&self) -> Result<Option<TensorData>, crate::GraphError> {
        self.fold_output_data()
    }
}

pub(crate) fn attr_int(name: &str, value: i64) -> onnx::AttributeProto {
    onnx::AttributeProto {
        name: name.to_string(),
        i: value,
        r#type: onnx::attribute_proto::AttributeType::Int as i32,
        ..Default::default()
    }
}

pub(crate) fn attr_ints(name: &str, values: &[i64]) -> onnx::AttributeProto {
    onnx::AttributeProto {
        name: name.to_string(),
        ints: values.to_vec(),
        r#type: onnx::attribute_proto::AttributeType::Ints as i32,
        ..Default::default()
    }
}

pub(crate) fn attr_float(name: &str, value: f32) -> onnx::AttributeProto {
    onnx::AttributeProto {
        name: name.to_string(),
        f: value,
        r#type: onnx::attribute_proto::AttributeType::Float as i32,
        ..Default::default()
    }
}

pub(crate) fn attr_tensor(name: &str, value: onnx::TensorProto) -> onnx::AttributeProto {
    onnx::AttributeProto {
        name: name.to_string(),
        t: Some(value),
        r#type: onnx::attribute_proto::AttributeType::Tensor as i32,
        ..Default::default()
    }
}
