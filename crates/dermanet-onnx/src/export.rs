use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use prost::Message;

use crate::proto::onnx;
use crate::tensor::{Tensor, TensorData, TensorKey};
use crate::GraphError;

/// Operator-set window the emitted attribute forms have been checked
/// against. BatchNormalization pins the effective floor to 9 for any
/// graph that contains it.
pub const SUPPORTED_OPSETS: RangeInclusive<i64> = 7..=13;

pub const DEFAULT_OPSET_VERSION: i64 = 9;

/// `metadata_props` key under which converter metadata is stored.
pub const METADATA_KEY: &str = "dermanet_metadata";

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error(
        "opset version {0} is outside the supported window {min}..={max}",
        min = SUPPORTED_OPSETS.start(),
        max = SUPPORTED_OPSETS.end()
    )]
    UnsupportedOpset(i64),
    #[error("operator {op} requires opset >= {required}, requested {requested}")]
    UnsupportedOperator {
        op: String,
        required: i64,
        requested: i64,
    },
    #[error("duplicate tensor name: {0}")]
    NameConflict(String),
    #[error("no data available for initializer {0}")]
    CannotResolveData(String),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata serialization error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Where initializer payloads go: inline `raw_data`, or a side-channel
/// binary file referenced through `external_data` entries.
#[derive(Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum WeightStorage {
    Embedded,
    BinFile(PathBuf),
}

/// Per-channel input normalization, recorded so the serving side can
/// preprocess images the same way the classifier was trained.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InputNormalization {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

/// Converter-produced metadata embedded into the exported model.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConverterMetadata {
    pub architecture: String,
    pub class_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalization: Option<InputNormalization>,
}

pub struct ExportOptions {
    pub opset_version: i64,
    pub constant_folding: bool,
    pub weight_storage: WeightStorage,
    pub metadata: Option<ConverterMetadata>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            opset_version: DEFAULT_OPSET_VERSION,
            constant_folding: true,
            weight_storage: WeightStorage::Embedded,
            metadata: None,
        }
    }
}

struct BinWriter {
    file: File,
    location: String,
    written: usize,
}

impl BinWriter {
    fn create(path: &Path) -> Result<Self, ExportError> {
        let location = path
            .file_name()
            .and_then(|x| x.to_str())
            .map(|x| x.to_string())
            .ok_or_else(|| {
                ExportError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("bad weight file path {}", path.display()),
                ))
            })?;
        Ok(Self {
            file: File::create(path)?,
            location,
            written: 0,
        })
    }

    fn append(&mut self, name: String, data: &TensorData) -> Result<onnx::TensorProto, ExportError> {
        let raw = data.to_raw_encoding();
        let offset = self.written;
        self.file.write_all(&raw)?;
        self.written += raw.len();
        Ok(onnx::TensorProto {
            name,
            data_type: onnx::tensor_proto::DataType::from(data.dtype()) as i32,
            dims: data.shape().dims().iter().map(|x| *x as i64).collect(),
            data_location: onnx::tensor_proto::DataLocation::External as i32,
            external_data: vec![
                onnx::StringStringEntryProto {
                    key: "location".to_string(),
                    value: self.location.clone(),
                },
                onnx::StringStringEntryProto {
                    key: "offset".to_string(),
                    value: offset.to_string(),
                },
                onnx::StringStringEntryProto {
                    key: "length".to_string(),
                    value: raw.len().to_string(),
                },
            ],
            ..Default::default()
        })
    }

    fn finish(mut self) -> Result<(), ExportError> {
        self.file.flush()?;
        Ok(())
    }
}

/// Post-order walk from the graph outputs. With folding enabled, any
/// tensor whose value resolves statically is cut off here: its subgraph
/// is not visited and the tensor becomes an initializer.
struct GraphWalk {
    order: Vec<Arc<dyn Tensor>>,
    folded: HashMap<TensorKey, TensorData>,
    visited: HashSet<TensorKey>,
}

impl GraphWalk {
    fn run(
        outputs: &[(&str, Arc<dyn Tensor>)],
        fold: bool,
    ) -> Result<Self, ExportError> {
        let mut walk = Self {
            order: vec![],
            folded: HashMap::new(),
            visited: HashSet::new(),
        };
        let output_keys: HashSet<TensorKey> = outputs
            .iter()
            .map(|(_, tensor)| TensorKey(tensor.clone()))
            .collect();
        for (_, tensor) in outputs {
            walk.visit(tensor.clone(), fold, &output_keys)?;
        }
        Ok(walk)
    }

    fn visit(
        &mut self,
        tensor: Arc<dyn Tensor>,
        fold: bool,
        output_keys: &HashSet<TensorKey>,
    ) -> Result<(), ExportError> {
        let key = TensorKey(tensor.clone());
        if self.visited.contains(&key) {
            return Ok(());
        }
        self.visited.insert(key.clone());
        if fold && !tensor.is_graph_input() && !output_keys.contains(&key) {
            if let Some(data) = tensor.try_resolve_data()? {
                self.folded.insert(key, data);
                self.order.push(tensor);
                return Ok(());
            }
        }
        for input in tensor.inputs() {
            self.visit(input, fold, output_keys)?;
        }
        self.order.push(tensor);
        Ok(())
    }
}

fn assign_names(
    walk: &GraphWalk,
    outputs: &[(&str, Arc<dyn Tensor>)],
) -> Result<HashMap<TensorKey, String>, ExportError> {
    let mut names: HashMap<TensorKey, String> = HashMap::new();
    let mut chosen: HashSet<String> = HashSet::new();

    for (name, tensor) in outputs {
        if !chosen.insert(name.to_string()) {
            return Err(ExportError::NameConflict(name.to_string()));
        }
        names.insert(TensorKey(tensor.clone()), name.to_string());
    }
    for tensor in &walk.order {
        let key = TensorKey(tensor.clone());
        if names.contains_key(&key) {
            continue;
        }
        if let Some(hint) = tensor.name_hint() {
            if !chosen.insert(hint.to_string()) {
                return Err(ExportError::NameConflict(hint.to_string()));
            }
            names.insert(key, hint.to_string());
        }
    }
    let mut next_id = 0usize;
    for tensor in &walk.order {
        let key = TensorKey(tensor.clone());
        if names.contains_key(&key) {
            continue;
        }
        let name = loop {
            let candidate = format!("tensor_{next_id}");
            next_id += 1;
            if chosen.insert(candidate.clone()) {
                break candidate;
            }
        };
        names.insert(key, name);
    }
    Ok(names)
}

/// Serialize the graph reachable from `outputs` into a `ModelProto`.
pub fn build_model_proto(
    inputs: &[Arc<dyn Tensor>],
    outputs: &[(&str, Arc<dyn Tensor>)],
    options: &ExportOptions,
) -> Result<onnx::ModelProto, ExportError> {
    if !SUPPORTED_OPSETS.contains(&options.opset_version) {
        return Err(ExportError::UnsupportedOpset(options.opset_version));
    }

    let walk = GraphWalk::run(outputs, options.constant_folding)?;
    let names = assign_names(&walk, outputs)?;

    let mut bin_writer = match &options.weight_storage {
        WeightStorage::Embedded => None,
        WeightStorage::BinFile(path) => Some(BinWriter::create(path)?),
    };

    let input_keys: HashSet<TensorKey> =
        inputs.iter().map(|t| TensorKey(t.clone())).collect();
    let output_keys: HashSet<TensorKey> = outputs
        .iter()
        .map(|(_, t)| TensorKey(t.clone()))
        .collect();

    let mut nodes = vec![];
    let mut initializers = vec![];
    let mut value_infos = vec![];

    for tensor in &walk.order {
        let key = TensorKey(tensor.clone());
        let name = names[&key].clone();

        if tensor.is_graph_input() {
            if !input_keys.contains(&key) {
                return Err(ExportError::CannotResolveData(name));
            }
            continue;
        }

        let initializer_data = if let Some(data) = walk.folded.get(&key) {
            Some(data.clone())
        } else if tensor.op().is_none() {
            // Weight leaf with folding disabled still needs its payload.
            Some(
                tensor
                    .try_resolve_data()?
                    .ok_or_else(|| ExportError::CannotResolveData(name.clone()))?,
            )
        } else {
            None
        };

        if let Some(data) = initializer_data {
            let proto = match &mut bin_writer {
                Some(writer) => writer.append(name, &data)?,
                None => data.to_tensor_proto(Some(name)),
            };
            initializers.push(proto);
            continue;
        }

        let op = tensor.op().expect("non-leaf tensor has an operator");
        if op.min_opset() > options.opset_version {
            return Err(ExportError::UnsupportedOperator {
                op: op.op_type().to_string(),
                required: op.min_opset(),
                requested: options.opset_version,
            });
        }
        nodes.push(op.to_node_proto(op.name().map(|x| x.to_string()), &name, &names));
        if !output_keys.contains(&key) {
            value_infos.push(tensor.to_value_info_proto(name));
        }
    }

    if let Some(writer) = bin_writer {
        writer.finish()?;
    }

    let graph = onnx::GraphProto {
        name: "dermanet".to_string(),
        node: nodes,
        initializer: initializers,
        input: inputs
            .iter()
            .map(|t| t.to_value_info_proto(names[&TensorKey(t.clone())].clone()))
            .collect(),
        output: outputs
            .iter()
            .map(|(name, t)| t.to_value_info_proto(name.to_string()))
            .collect(),
        value_info: value_infos,
        ..Default::default()
    };

    let mut metadata_props = vec![];
    if let Some(metadata) = &options.metadata {
        metadata_props.push(onnx::StringStringEntryProto {
            key: METADATA_KEY.to_string(),
            value: serde_json::to_string(metadata)?,
        });
    }

    Ok(onnx::ModelProto {
        ir_version: 7,
        producer_name: "dermanet".to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        opset_import: vec![onnx::OperatorSetIdProto {
            domain: String::new(),
            version: options.opset_version,
        }],
        graph: Some(graph),
        metadata_props,
        ..Default::default()
    })
}

/// Build and write the model file in one step.
pub fn export_to_file(
    path: &Path,
    inputs: &[Arc<dyn Tensor>],
    outputs: &[(&str, Arc<dyn Tensor>)],
    options: &ExportOptions,
) -> Result<onnx::ModelProto, ExportError> {
    let proto = build_model_proto(inputs, outputs, options)?;
    std::fs::write(path, proto.encode_to_vec())?;
    log::info!(
        "wrote {} ({} nodes, {} initializers)",
        path.display(),
        proto.graph.as_ref().map(|g| g.node.len()).unwrap_or(0),
        proto
            .graph
            .as_ref()
            .map(|g| g.initializer.len())
            .unwrap_or(0)
    );
    Ok(proto)
}
