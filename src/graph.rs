//! Decoded, runnable view of an exported model. The protobuf graph is
//! lowered into a flat op list plus an initializer map so the executor
//! and the trace recorder work off the same structure.

use std::collections::HashMap;
use std::path::Path;

use candle_core::Device;
use prost::Message;

use dermanet_onnx::export::{ConverterMetadata, METADATA_KEY};
use dermanet_onnx::onnx;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("i/o error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("protobuf decode failed: {0}")]
    Proto(#[from] prost::DecodeError),
    #[error("model has no graph")]
    MissingGraph,
    #[error("unsupported operator {0}")]
    UnsupportedOp(String),
    #[error("node {node}: bad attribute {attribute}")]
    BadAttribute { node: String, attribute: String },
    #[error("initializer {name}: {reason}")]
    BadInitializer { name: String, reason: String },
    #[error("external weight data for {name} but no weights file next to the model")]
    NoExternalData { name: String },
    #[error("bad converter metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Name and static dims of a graph input or output.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub dims: Vec<usize>,
}

/// Lowered operator forms. Only attributes the executor consumes are
/// kept; everything else is validated away at decode time.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum OpKind {
    Conv {
        strides: [usize; 2],
        pads: [usize; 2],
        dilations: [usize; 2],
        group: usize,
    },
    BatchNormalization {
        epsilon: f32,
    },
    Relu,
    MaxPool {
        kernel: [usize; 2],
        strides: [usize; 2],
        pads: [usize; 2],
    },
    GlobalAveragePool,
    MatMul,
    Transpose {
        perm: Vec<usize>,
    },
    Add,
    Sub,
    Mul,
    Div,
    Sqrt,
    Flatten {
        axis: i64,
    },
    Reshape,
    Softmax {
        axis: i64,
    },
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RunOp {
    pub name: String,
    pub kind: OpKind,
    pub inputs: Vec<String>,
    pub output: String,
}

/// Executable form of a decoded model.
pub struct RunGraph {
    pub opset_version: i64,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<String>,
    pub ops: Vec<RunOp>,
    pub initializers: HashMap<String, candle_core::Tensor>,
    pub metadata: Option<ConverterMetadata>,
}

impl RunGraph {
    pub fn from_onnx_file(path: &Path) -> Result<Self, DecodeError> {
        let bytes = std::fs::read(path).map_err(|source| DecodeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let proto = onnx::ModelProto::decode(bytes.as_slice())?;
        Self::from_model_proto(&proto, path.parent())
    }

    /// `external_dir` is where `external_data` locations are resolved,
    /// normally the directory holding the model file.
    pub fn from_model_proto(
        proto: &onnx::ModelProto,
        external_dir: Option<&Path>,
    ) -> Result<Self, DecodeError> {
        let graph = proto.graph.as_ref().ok_or(DecodeError::MissingGraph)?;
        let opset_version = proto
            .opset_import
            .iter()
            .find(|o| o.domain.is_empty())
            .map(|o| o.version)
            .unwrap_or(1);
        let metadata = proto
            .metadata_props
            .iter()
            .find(|p| p.key == METADATA_KEY)
            .map(|p| serde_json::from_str(&p.value))
            .transpose()?;

        let mut initializers = HashMap::new();
        for tensor in &graph.initializer {
            initializers.insert(tensor.name.clone(), decode_tensor(tensor, external_dir)?);
        }

        let mut ops = vec![];
        for node in &graph.node {
            // Constant nodes carry their payload in an attribute; fold
            // them straight into the initializer map.
            if node.op_type == "Constant" {
                let value = get_tensor_attr(node, "value")?;
                let output = node
                    .output
                    .first()
                    .cloned()
                    .ok_or_else(|| bad_attr(node, "output"))?;
                initializers.insert(output, decode_tensor(value, external_dir)?);
                continue;
            }
            ops.push(decode_node(node)?);
        }

        Ok(Self {
            opset_version,
            inputs: graph
                .input
                .iter()
                .map(value_info_spec)
                .collect::<Result<_, _>>()?,
            outputs: graph.output.iter().map(|o| o.name.clone()).collect(),
            ops,
            initializers,
            metadata,
        })
    }
}

fn value_info_spec(info: &onnx::ValueInfoProto) -> Result<TensorSpec, DecodeError> {
    let bad = || DecodeError::BadInitializer {
        name: info.name.clone(),
        reason: "missing or non-static tensor shape".to_string(),
    };
    let onnx::type_proto::Value::TensorType(tensor_type) = info
        .r#type
        .as_ref()
        .and_then(|t| t.value.as_ref())
        .ok_or_else(bad)?;
    let shape = tensor_type.shape.as_ref().ok_or_else(bad)?;
    let mut dims = vec![];
    for dim in &shape.dim {
        match &dim.value {
            Some(onnx::tensor_shape_proto::dimension::Value::DimValue(v)) if *v >= 0 => {
                dims.push(*v as usize)
            }
            _ => return Err(bad()),
        }
    }
    Ok(TensorSpec {
        name: info.name.clone(),
        dims,
    })
}

fn decode_tensor(
    tensor: &onnx::TensorProto,
    external_dir: Option<&Path>,
) -> Result<candle_core::Tensor, DecodeError> {
    let name = tensor.name.clone();
    let dims: Vec<usize> = tensor.dims.iter().map(|d| *d as usize).collect();
    let elements: usize = dims.iter().product();
    let bad = |reason: &str| DecodeError::BadInitializer {
        name: name.clone(),
        reason: reason.to_string(),
    };

    let raw = if tensor.data_location == onnx::tensor_proto::DataLocation::External as i32 {
        read_external(tensor, external_dir)?
    } else {
        tensor.raw_data.clone()
    };

    let data_type = onnx::tensor_proto::DataType::try_from(tensor.data_type)
        .map_err(|_| bad("unknown data type"))?;
    let decoded = match data_type {
        onnx::tensor_proto::DataType::Float => {
            let values = if raw.is_empty() {
                tensor.float_data.clone()
            } else {
                decode_le::<f32, 4>(&raw, f32::from_le_bytes)
            };
            if values.len() != elements {
                return Err(bad("element count does not match dims"));
            }
            candle_core::Tensor::from_vec(values, dims, &Device::Cpu)?
        }
        onnx::tensor_proto::DataType::Float16 => {
            let values = decode_le::<half::f16, 2>(&raw, half::f16::from_le_bytes);
            if values.len() != elements {
                return Err(bad("element count does not match dims"));
            }
            candle_core::Tensor::from_vec(values, dims, &Device::Cpu)?
        }
        onnx::tensor_proto::DataType::Bfloat16 => {
            let values = decode_le::<half::bf16, 2>(&raw, half::bf16::from_le_bytes);
            if values.len() != elements {
                return Err(bad("element count does not match dims"));
            }
            candle_core::Tensor::from_vec(values, dims, &Device::Cpu)?
        }
        onnx::tensor_proto::DataType::Int64 => {
            let values = if raw.is_empty() {
                tensor.int64_data.clone()
            } else {
                decode_le::<i64, 8>(&raw, i64::from_le_bytes)
            };
            if values.len() != elements {
                return Err(bad("element count does not match dims"));
            }
            candle_core::Tensor::from_vec(values, dims, &Device::Cpu)?
        }
        onnx::tensor_proto::DataType::Int32 => {
            let values = if raw.is_empty() {
                tensor.int32_data.clone()
            } else {
                decode_le::<i32, 4>(&raw, i32::from_le_bytes)
            };
            if values.len() != elements {
                return Err(bad("element count does not match dims"));
            }
            // candle has no i32 dtype, widen to i64.
            let widened: Vec<i64> = values.into_iter().map(i64::from).collect();
            candle_core::Tensor::from_vec(widened, dims, &Device::Cpu)?
        }
        other => return Err(bad(&format!("unsupported data type {other:?}"))),
    };
    Ok(decoded)
}

fn decode_le<T, const N: usize>(raw: &[u8], from_le: fn([u8; N]) -> T) -> Vec<T> {
    raw.chunks_exact(N)
        .map(|chunk| from_le(chunk.try_into().expect("chunk size")))
        .collect()
}

fn read_external(
    tensor: &onnx::TensorProto,
    external_dir: Option<&Path>,
) -> Result<Vec<u8>, DecodeError> {
    let name = tensor.name.clone();
    let entry = |key: &str| {
        tensor
            .external_data
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    };
    let location = entry("location").ok_or_else(|| DecodeError::NoExternalData {
        name: name.clone(),
    })?;
    let dir = external_dir.ok_or_else(|| DecodeError::NoExternalData { name: name.clone() })?;
    let path = dir.join(location);
    let bytes = std::fs::read(&path).map_err(|source| DecodeError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let offset: usize =
        entry("offset")
            .unwrap_or("0")
            .parse()
            .map_err(|_| DecodeError::BadInitializer {
                name: name.clone(),
                reason: "bad external offset".to_string(),
            })?;
    let length: usize = match entry("length") {
        Some(v) => v.parse().map_err(|_| DecodeError::BadInitializer {
            name: name.clone(),
            reason: "bad external length".to_string(),
        })?,
        None => bytes.len().saturating_sub(offset),
    };
    bytes
        .get(offset..offset + length)
        .map(|slice| slice.to_vec())
        .ok_or(DecodeError::BadInitializer {
            name,
            reason: "external range outside weights file".to_string(),
        })
}

fn decode_node(node: &onnx::NodeProto) -> Result<RunOp, DecodeError> {
    let kind = match node.op_type.as_str() {
        "Conv" => OpKind::Conv {
            strides: get_int_pair(node, "strides", [1, 1])?,
            pads: get_pads(node)?,
            dilations: get_int_pair(node, "dilations", [1, 1])?,
            group: get_int(node, "group", 1) as usize,
        },
        "BatchNormalization" => OpKind::BatchNormalization {
            epsilon: get_float(node, "epsilon", 1e-5),
        },
        "Relu" => OpKind::Relu,
        "MaxPool" => OpKind::MaxPool {
            kernel: get_int_pair(node, "kernel_shape", [1, 1])?,
            strides: get_int_pair(node, "strides", [1, 1])?,
            pads: get_pads(node)?,
        },
        "GlobalAveragePool" => OpKind::GlobalAveragePool,
        "MatMul" => OpKind::MatMul,
        "Transpose" => OpKind::Transpose {
            perm: get_ints(node, "perm")
                .ok_or_else(|| bad_attr(node, "perm"))?
                .iter()
                .map(|v| *v as usize)
                .collect(),
        },
        "Add" => OpKind::Add,
        "Sub" => OpKind::Sub,
        "Mul" => OpKind::Mul,
        "Div" => OpKind::Div,
        "Sqrt" => OpKind::Sqrt,
        "Flatten" => OpKind::Flatten {
            axis: get_int(node, "axis", 1),
        },
        "Reshape" => OpKind::Reshape,
        "Softmax" => OpKind::Softmax {
            axis: get_int(node, "axis", 1),
        },
        other => return Err(DecodeError::UnsupportedOp(other.to_string())),
    };
    Ok(RunOp {
        name: node.name.clone(),
        kind,
        inputs: node.input.clone(),
        output: node
            .output
            .first()
            .cloned()
            .ok_or_else(|| bad_attr(node, "output"))?,
    })
}

fn bad_attr(node: &onnx::NodeProto, attribute: &str) -> DecodeError {
    DecodeError::BadAttribute {
        node: if node.name.is_empty() {
            node.op_type.clone()
        } else {
            node.name.clone()
        },
        attribute: attribute.to_string(),
    }
}

fn find_attr<'a>(node: &'a onnx::NodeProto, name: &str) -> Option<&'a onnx::AttributeProto> {
    node.attribute.iter().find(|a| a.name == name)
}

fn get_int(node: &onnx::NodeProto, name: &str, default: i64) -> i64 {
    find_attr(node, name).map(|a| a.i).unwrap_or(default)
}

fn get_float(node: &onnx::NodeProto, name: &str, default: f32) -> f32 {
    find_attr(node, name).map(|a| a.f).unwrap_or(default)
}

fn get_ints<'a>(node: &'a onnx::NodeProto, name: &str) -> Option<&'a [i64]> {
    find_attr(node, name).map(|a| a.ints.as_slice())
}

fn get_int_pair(
    node: &onnx::NodeProto,
    name: &str,
    default: [usize; 2],
) -> Result<[usize; 2], DecodeError> {
    match get_ints(node, name) {
        None => Ok(default),
        Some([h, w]) if *h >= 0 && *w >= 0 => Ok([*h as usize, *w as usize]),
        Some(_) => Err(bad_attr(node, name)),
    }
}

/// Pads come in `[top, left, bottom, right]` form; the executor only
/// supports the symmetric case.
fn get_pads(node: &onnx::NodeProto) -> Result<[usize; 2], DecodeError> {
    match get_ints(node, "pads") {
        None => Ok([0, 0]),
        Some([t, l, b, r]) if t == b && l == r && *t >= 0 && *l >= 0 => {
            Ok([*t as usize, *l as usize])
        }
        Some(_) => Err(bad_attr(node, "pads")),
    }
}

fn get_tensor_attr<'a>(
    node: &'a onnx::NodeProto,
    name: &str,
) -> Result<&'a onnx::TensorProto, DecodeError> {
    find_attr(node, name)
        .and_then(|a| a.t.as_ref())
        .ok_or_else(|| bad_attr(node, name))
}
