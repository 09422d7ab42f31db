//! Traced-module capture and replay. A trace is the exported graph
//! executed once on the fixed dummy input, with every op recorded in
//! execution order together with the constants it touched. The record
//! is self-contained: replay needs the trace file and nothing else.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use candle_core::{Device, Tensor};

use crate::exec::{self, ExecError, ExecObserver};
use crate::graph::{OpKind, RunGraph, RunOp, TensorSpec};

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("trace serialization failed: {0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),
    #[error("trace deserialization failed: {0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),
    #[error("cannot decode model for tracing: {0}")]
    Model(#[from] crate::graph::DecodeError),
    #[error("constant {0} referenced by the trace is missing")]
    MissingConstant(String),
    #[error("unsupported constant dtype {0}")]
    UnsupportedDType(String),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BlobDType {
    F32,
    F16,
    BF16,
    I64,
}

/// Raw little-endian payload of a constant tensor.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConstBlob {
    pub dims: Vec<usize>,
    pub dtype: BlobDType,
    pub data: Vec<u8>,
}

impl ConstBlob {
    fn from_tensor(tensor: &Tensor) -> Result<Self, TraceError> {
        let dims = tensor.dims().to_vec();
        let flat = tensor.flatten_all()?;
        let (dtype, data) = match tensor.dtype() {
            candle_core::DType::F32 => (
                BlobDType::F32,
                flat.to_vec1::<f32>()?
                    .iter()
                    .flat_map(|v| v.to_le_bytes())
                    .collect(),
            ),
            candle_core::DType::F16 => (
                BlobDType::F16,
                flat.to_vec1::<half::f16>()?
                    .iter()
                    .flat_map(|v| v.to_le_bytes())
                    .collect(),
            ),
            candle_core::DType::BF16 => (
                BlobDType::BF16,
                flat.to_vec1::<half::bf16>()?
                    .iter()
                    .flat_map(|v| v.to_le_bytes())
                    .collect(),
            ),
            candle_core::DType::I64 => (
                BlobDType::I64,
                flat.to_vec1::<i64>()?
                    .iter()
                    .flat_map(|v| v.to_le_bytes())
                    .collect(),
            ),
            other => return Err(TraceError::UnsupportedDType(format!("{other:?}"))),
        };
        Ok(Self { dims, dtype, data })
    }

    fn to_tensor(&self, device: &Device) -> Result<Tensor, TraceError> {
        let tensor = match self.dtype {
            BlobDType::F32 => Tensor::from_vec(
                chunks::<f32, 4>(&self.data, f32::from_le_bytes),
                self.dims.clone(),
                device,
            )?,
            BlobDType::F16 => Tensor::from_vec(
                chunks::<half::f16, 2>(&self.data, half::f16::from_le_bytes),
                self.dims.clone(),
                device,
            )?,
            BlobDType::BF16 => Tensor::from_vec(
                chunks::<half::bf16, 2>(&self.data, half::bf16::from_le_bytes),
                self.dims.clone(),
                device,
            )?,
            BlobDType::I64 => Tensor::from_vec(
                chunks::<i64, 8>(&self.data, i64::from_le_bytes),
                self.dims.clone(),
                device,
            )?,
        };
        Ok(tensor)
    }
}

fn chunks<T, const N: usize>(raw: &[u8], from_le: fn([u8; N]) -> T) -> Vec<T> {
    raw.chunks_exact(N)
        .map(|chunk| from_le(chunk.try_into().expect("chunk size")))
        .collect()
}

/// One executed op as seen during capture.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TraceRecord {
    pub name: String,
    pub kind: OpKind,
    pub inputs: Vec<String>,
    pub output: String,
    pub output_dims: Vec<usize>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TracedModule {
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<String>,
    pub records: Vec<TraceRecord>,
    pub constants: HashMap<String, ConstBlob>,
}

struct Recorder {
    records: Vec<TraceRecord>,
}

impl ExecObserver for Recorder {
    fn on_op(&mut self, op: &RunOp, output: &Tensor) {
        self.records.push(TraceRecord {
            name: op.name.clone(),
            kind: op.kind.clone(),
            inputs: op.inputs.clone(),
            output: op.output.clone(),
            output_dims: output.dims().to_vec(),
        });
    }
}

/// Execute `graph` once, recording every op, and return the trace along
/// with the run's outputs.
pub fn capture(
    graph: &RunGraph,
    inputs: &HashMap<String, Tensor>,
    device: &Device,
) -> Result<(TracedModule, HashMap<String, Tensor>), TraceError> {
    let mut recorder = Recorder { records: vec![] };
    let outputs = exec::run(graph, inputs, device, &mut recorder)?;

    // Only constants the recorded ops actually read get embedded.
    let produced: HashSet<&str> = recorder
        .records
        .iter()
        .map(|r| r.output.as_str())
        .collect();
    let input_names: HashSet<&str> = graph.inputs.iter().map(|s| s.name.as_str()).collect();
    let mut constants = HashMap::new();
    for record in &recorder.records {
        for input in &record.inputs {
            let name = input.as_str();
            if produced.contains(name) || input_names.contains(name) {
                continue;
            }
            if constants.contains_key(name) {
                continue;
            }
            let tensor = graph
                .initializers
                .get(name)
                .ok_or_else(|| TraceError::MissingConstant(name.to_string()))?;
            constants.insert(name.to_string(), ConstBlob::from_tensor(tensor)?);
        }
    }

    let module = TracedModule {
        inputs: graph.inputs.clone(),
        outputs: graph.outputs.clone(),
        records: recorder.records,
        constants,
    };
    Ok((module, outputs))
}

impl TracedModule {
    pub fn save(&self, path: &Path) -> Result<(), TraceError> {
        let file = File::create(path).map_err(|source| TraceError::Io {
            path: path.display().to_string(),
            source,
        })?;
        ciborium::into_writer(self, BufWriter::new(file))?;
        log::info!(
            "wrote trace {} ({} ops, {} constants)",
            path.display(),
            self.records.len(),
            self.constants.len()
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, TraceError> {
        let file = File::open(path).map_err(|source| TraceError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(ciborium::from_reader(BufReader::new(file))?)
    }

    /// Re-run the recorded ops on fresh inputs.
    pub fn replay(
        &self,
        inputs: &HashMap<String, Tensor>,
        device: &Device,
    ) -> Result<HashMap<String, Tensor>, TraceError> {
        let mut env: HashMap<String, Tensor> = HashMap::new();
        for (name, blob) in &self.constants {
            env.insert(name.clone(), blob.to_tensor(device)?);
        }
        for spec in &self.inputs {
            let tensor = inputs
                .get(&spec.name)
                .ok_or_else(|| ExecError::MissingTensor(spec.name.clone()))?;
            if tensor.dims() != spec.dims.as_slice() {
                return Err(TraceError::Exec(ExecError::InputShape {
                    name: spec.name.clone(),
                    expected: spec.dims.clone(),
                    got: tensor.dims().to_vec(),
                }));
            }
            env.insert(spec.name.clone(), tensor.to_device(device)?);
        }

        for record in &self.records {
            let mut args = Vec::with_capacity(record.inputs.len());
            for input in &record.inputs {
                args.push(
                    env.get(input)
                        .ok_or_else(|| TraceError::MissingConstant(input.clone()))?
                        .clone(),
                );
            }
            let output = exec::apply_op(&record.kind, &args)?;
            env.insert(record.output.clone(), output);
        }

        let mut outputs = HashMap::new();
        for name in &self.outputs {
            let tensor = env
                .get(name)
                .ok_or_else(|| ExecError::MissingTensor(name.clone()))?;
            outputs.insert(name.clone(), tensor.clone());
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_graph(device: &Device) -> RunGraph {
        let weight = Tensor::from_vec(vec![2.0f32, 3.0], (2,), device).unwrap();
        RunGraph {
            opset_version: 9,
            inputs: vec![TensorSpec {
                name: "x".to_string(),
                dims: vec![2],
            }],
            outputs: vec!["y".to_string()],
            ops: vec![RunOp {
                name: "scale".to_string(),
                kind: OpKind::Mul,
                inputs: vec!["x".to_string(), "w".to_string()],
                output: "y".to_string(),
            }],
            initializers: HashMap::from([("w".to_string(), weight)]),
            metadata: None,
        }
    }

    #[test]
    fn const_blob_round_trips_f32_and_i64() {
        let device = Device::Cpu;
        let f = Tensor::from_vec(vec![1.5f32, -2.0, 0.25], (3,), &device).unwrap();
        let blob = ConstBlob::from_tensor(&f).unwrap();
        assert_eq!(blob.dtype, BlobDType::F32);
        assert_eq!(blob.data.len(), 12);
        let back = blob.to_tensor(&device).unwrap();
        assert_eq!(back.to_vec1::<f32>().unwrap(), vec![1.5, -2.0, 0.25]);

        let i = Tensor::from_vec(vec![-1i64, 1 << 40], (2,), &device).unwrap();
        let back = ConstBlob::from_tensor(&i)
            .unwrap()
            .to_tensor(&device)
            .unwrap();
        assert_eq!(back.to_vec1::<i64>().unwrap(), vec![-1, 1 << 40]);
    }

    #[test]
    fn capture_embeds_only_read_constants() {
        let device = Device::Cpu;
        let mut graph = tiny_graph(&device);
        // An initializer no op reads must not end up in the trace.
        graph.initializers.insert(
            "orphan".to_string(),
            Tensor::zeros((1,), candle_core::DType::F32, &device).unwrap(),
        );
        let inputs = HashMap::from([(
            "x".to_string(),
            Tensor::from_vec(vec![1.0f32, 2.0], (2,), &device).unwrap(),
        )]);
        let (module, outputs) = capture(&graph, &inputs, &device).unwrap();
        assert_eq!(module.records.len(), 1);
        assert!(module.constants.contains_key("w"));
        assert!(!module.constants.contains_key("orphan"));
        let y = outputs["y"].to_vec1::<f32>().unwrap();
        assert_eq!(y, vec![2.0, 6.0]);
    }

    #[test]
    fn saved_trace_replays_identically() {
        let device = Device::Cpu;
        let graph = tiny_graph(&device);
        let inputs = HashMap::from([(
            "x".to_string(),
            Tensor::from_vec(vec![4.0f32, 5.0], (2,), &device).unwrap(),
        )]);
        let (module, outputs) = capture(&graph, &inputs, &device).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.pth");
        module.save(&path).unwrap();
        let loaded = TracedModule::load(&path).unwrap();
        assert_eq!(loaded, module);

        let replayed = loaded.replay(&inputs, &device).unwrap();
        assert_eq!(
            replayed["y"].to_vec1::<f32>().unwrap(),
            outputs["y"].to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn replay_rejects_wrong_input_shape() {
        let device = Device::Cpu;
        let graph = tiny_graph(&device);
        let inputs = HashMap::from([(
            "x".to_string(),
            Tensor::from_vec(vec![1.0f32, 2.0], (2,), &device).unwrap(),
        )]);
        let (module, _) = capture(&graph, &inputs, &device).unwrap();
        let bad = HashMap::from([(
            "x".to_string(),
            Tensor::zeros((3,), candle_core::DType::F32, &device).unwrap(),
        )]);
        assert!(matches!(
            module.replay(&bad, &device),
            Err(TraceError::Exec(ExecError::InputShape { .. }))
        ));
    }
}
