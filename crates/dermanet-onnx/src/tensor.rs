use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::node::Node;
use crate::proto::onnx;
use crate::proto::onnx::{TensorProto, ValueInfoProto};
use crate::GraphError;

/// Static tensor shape. The converter only ever deals in fully resolved
/// shapes; symbolic dimensions are rejected at the import boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dim(&self, index: usize) -> usize {
        self.dims[index]
    }

    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn transpose(&self) -> Self {
        Self {
            dims: self.dims.iter().rev().copied().collect(),
        }
    }

    /// NumPy-style broadcast of two shapes. Needed by the bias add in
    /// linear heads and by residual merges.
    pub fn broadcast(&self, other: &Shape) -> Result<Shape, GraphError> {
        let rank = self.rank().max(other.rank());
        let mut dims = vec![0usize; rank];
        for i in 0..rank {
            let a = if i < rank - self.rank() {
                1
            } else {
                self.dims[i - (rank - self.rank())]
            };
            let b = if i < rank - other.rank() {
                1
            } else {
                other.dims[i - (rank - other.rank())]
            };
            dims[i] = match (a, b) {
                (a, b) if a == b => a,
                (1, b) => b,
                (a, 1) => a,
                _ => {
                    return Err(GraphError::ShapeMismatch(self.clone(), other.clone()));
                }
            };
        }
        Ok(Shape::new(dims))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.dims
                .iter()
                .map(|x| x.to_string())
                .collect::<Vec<_>>()
                .join("x")
        )
    }
}

impl From<&[usize]> for Shape {
    fn from(value: &[usize]) -> Self {
        Shape::new(value.to_vec())
    }
}

impl From<Vec<usize>> for Shape {
    fn from(value: Vec<usize>) -> Self {
        Shape::new(value)
    }
}

impl From<&candle_core::Shape> for Shape {
    fn from(value: &candle_core::Shape) -> Self {
        Shape::new(value.dims().to_vec())
    }
}

impl From<&Shape> for onnx::TensorShapeProto {
    fn from(value: &Shape) -> Self {
        Self {
            dim: value
                .dims
                .iter()
                .map(|x| onnx::tensor_shape_proto::Dimension {
                    value: Some(onnx::tensor_shape_proto::dimension::Value::DimValue(
                        *x as i64,
                    )),
                    denotation: String::new(),
                })
                .collect(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DType {
    F32,
    F16,
    BF16,
    I32,
    I64,
}

impl DType {
    pub fn from_safetensors(dtype: safetensors::Dtype) -> Result<Self, GraphError> {
        match dtype {
            safetensors::Dtype::F32 => Ok(DType::F32),
            safetensors::Dtype::F16 => Ok(DType::F16),
            safetensors::Dtype::BF16 => Ok(DType::BF16),
            safetensors::Dtype::I32 => Ok(DType::I32),
            safetensors::Dtype::I64 => Ok(DType::I64),
            _ => Err(GraphError::UnsupportedDType),
        }
    }

    pub fn from_candle(dtype: candle_core::DType) -> Result<Self, GraphError> {
        match dtype {
            candle_core::DType::F32 => Ok(DType::F32),
            candle_core::DType::F16 => Ok(DType::F16),
            candle_core::DType::BF16 => Ok(DType::BF16),
            candle_core::DType::I64 => Ok(DType::I64),
            _ => Err(GraphError::UnsupportedDType),
        }
    }
}

impl From<DType> for onnx::tensor_proto::DataType {
    fn from(value: DType) -> Self {
        match value {
            DType::F32 => onnx::tensor_proto::DataType::Float,
            DType::F16 => onnx::tensor_proto::DataType::Float16,
            DType::BF16 => onnx::tensor_proto::DataType::Bfloat16,
            DType::I32 => onnx::tensor_proto::DataType::Int32,
            DType::I64 => onnx::tensor_proto::DataType::Int64,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone)]
pub enum TensorDataValue {
    F32(Vec<f32>),
    F16(Vec<half::f16>),
    BF16(Vec<half::bf16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl TensorDataValue {
    pub fn len(&self) -> usize {
        match self {
            TensorDataValue::F32(v) => v.len(),
            TensorDataValue::F16(v) => v.len(),
            TensorDataValue::BF16(v) => v.len(),
            TensorDataValue::I32(v) => v.len(),
            TensorDataValue::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorDataValue::F32(_) => DType::F32,
            TensorDataValue::F16(_) => DType::F16,
            TensorDataValue::BF16(_) => DType::BF16,
            TensorDataValue::I32(_) => DType::I32,
            TensorDataValue::I64(_) => DType::I64,
        }
    }

    pub fn to_raw_encoding(&self) -> Vec<u8> {
        match self {
            TensorDataValue::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::F16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::BF16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::I32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::I64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }

    pub fn from_raw_encoding(dtype: DType, data: &[u8]) -> Result<Self, GraphError> {
        Ok(match dtype {
            DType::F32 => TensorDataValue::F32(
                data.chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DType::F16 => TensorDataValue::F16(
                data.chunks_exact(2)
                    .map(|c| half::f16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
            DType::BF16 => TensorDataValue::BF16(
                data.chunks_exact(2)
                    .map(|c| half::bf16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
            DType::I32 => TensorDataValue::I32(
                data.chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DType::I64 => TensorDataValue::I64(
                data.chunks_exact(8)
                    .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            ),
        })
    }

    /// Lossy view as f32, used by the constant folder.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>, GraphError> {
        match self {
            TensorDataValue::F32(v) => Ok(v.clone()),
            TensorDataValue::F16(v) => Ok(v.iter().map(|x| x.to_f32()).collect()),
            TensorDataValue::BF16(v) => Ok(v.iter().map(|x| x.to_f32()).collect()),
            _ => Err(GraphError::UnsupportedDType),
        }
    }
}

impl From<Vec<f32>> for TensorDataValue {
    fn from(value: Vec<f32>) -> Self {
        TensorDataValue::F32(value)
    }
}

impl From<Vec<i64>> for TensorDataValue {
    fn from(value: Vec<i64>) -> Self {
        TensorDataValue::I64(value)
    }
}

/// A fully materialized tensor value: shape plus host data.
#[derive(Debug, Clone)]
pub struct TensorData {
    value: TensorDataValue,
    shape: Shape,
}

impl TensorData {
    pub fn new(value: TensorDataValue, shape: Shape) -> Result<Self, GraphError> {
        if shape.num_elements() != value.len() {
            return Err(GraphError::DataShapeMismatch {
                shape,
                elements: value.len(),
            });
        }
        Ok(Self { value, shape })
    }

    pub fn fill<T>(shape: Shape, value: T) -> Result<Self, GraphError>
    where
        T: Copy,
        TensorDataValue: From<Vec<T>>,
    {
        let data = vec![value; shape.num_elements()];
        Self::new(TensorDataValue::from(data), shape)
    }

    pub fn dtype(&self) -> DType {
        self.value.dtype()
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn value(&self) -> &TensorDataValue {
        &self.value
    }

    pub fn to_raw_encoding(&self) -> Vec<u8> {
        self.value.to_raw_encoding()
    }

    pub fn to_int_vec(&self) -> Result<Vec<i64>, GraphError> {
        match &self.value {
            TensorDataValue::I32(x) => Ok(x.iter().map(|x| *x as i64).collect()),
            TensorDataValue::I64(x) => Ok(x.clone()),
            _ => Err(GraphError::UnsupportedDType),
        }
    }

    pub fn to_tensor_proto(&self, name: Option<String>) -> TensorProto {
        TensorProto {
            name: name.unwrap_or_default(),
            data_type: onnx::tensor_proto::DataType::from(self.value.dtype()) as i32,
            dims: self.shape.dims().iter().map(|x| *x as i64).collect(),
            raw_data: self.value.to_raw_encoding(),
            ..Default::default()
        }
    }

    pub fn from_candle_tensor(tensor: &candle_core::Tensor) -> Result<Self, GraphError> {
        let shape = Shape::from(tensor.shape());
        let flat = tensor
            .flatten_all()
            .map_err(GraphError::CandleCore)?;
        let value = match tensor.dtype() {
            candle_core::DType::F32 => {
                TensorDataValue::F32(flat.to_vec1().map_err(GraphError::CandleCore)?)
            }
            candle_core::DType::F16 => {
                TensorDataValue::F16(flat.to_vec1().map_err(GraphError::CandleCore)?)
            }
            candle_core::DType::BF16 => {
                TensorDataValue::BF16(flat.to_vec1().map_err(GraphError::CandleCore)?)
            }
            candle_core::DType::I64 => {
                TensorDataValue::I64(flat.to_vec1().map_err(GraphError::CandleCore)?)
            }
            _ => return Err(GraphError::UnsupportedDType),
        };
        Self::new(value, shape)
    }

    pub fn from_safetensors_view(view: safetensors::tensor::TensorView) -> Result<Self, GraphError> {
        let dtype = DType::from_safetensors(view.dtype())?;
        let shape = Shape::from(view.shape());
        let value = TensorDataValue::from_raw_encoding(dtype, view.data())?;
        Self::new(value, shape)
    }
}

/// A tensor edge in the export graph. Implemented by graph inputs, by
/// checkpoint weights, and (through [`SingleOutputNode`](crate::node::SingleOutputNode))
/// by every operator's output.
pub trait Tensor {
    fn dtype(&self) -> DType;
    fn shape(&self) -> &Shape;

    fn rank(&self) -> usize {
        self.shape().rank()
    }

    /// Upstream edges, empty for leaves.
    fn inputs(&self) -> Vec<Arc<dyn Tensor>> {
        vec![]
    }

    /// The producing operator, if this tensor is a node output.
    fn op(&self) -> Option<&dyn Node> {
        None
    }

    /// Preferred graph name (weight tensors keep their checkpoint name).
    fn name_hint(&self) -> Option<&str> {
        None
    }

    fn is_graph_input(&self) -> bool {
        false
    }

    /// Materialize this tensor's value if it is derivable without running
    /// the network: constants, checkpoint weights, and foldable ops over
    /// them. `Ok(None)` means runtime-dependent.
    fn try_resolve_data(&self) -> Result<Option<TensorData>, GraphError> {
        Ok(None)
    }

    fn to_value_info_proto(&self, name: String) -> ValueInfoProto {
        ValueInfoProto {
            name,
            r#type: Some(onnx::TypeProto {
                value: Some(onnx::type_proto::Value::TensorType(
                    onnx::type_proto::Tensor {
                        elem_type: onnx::tensor_proto::DataType::from(self.dtype()) as i32,
                        shape: Some(self.shape().into()),
                    },
                )),
                denotation: "TENSOR".to_string(),
            }),
            ..Default::default()
        }
    }
}

/// Identity key for `Arc<dyn Tensor>` graph edges: two keys are equal iff
/// they point at the same allocation.
#[derive(Clone)]
pub struct TensorKey(pub Arc<dyn Tensor>);

impl TensorKey {
    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl PartialEq for TensorKey {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(self.addr(), other.addr())
    }
}

impl Eq for TensorKey {}

impl Hash for TensorKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.addr() as usize);
    }
}

/// An externally supplied graph input (the dummy image tensor).
pub struct InputTensor {
    name: String,
    dtype: DType,
    shape: Shape,
}

impl InputTensor {
    pub fn new(name: String, dtype: DType, shape: Shape) -> Arc<Self> {
        Arc::new(Self { name, dtype, shape })
    }
}

impl Tensor for InputTensor {
    fn dtype(&self) -> DType {
        self.dtype
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn name_hint(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn is_graph_input(&self) -> bool {
        true
    }
}
