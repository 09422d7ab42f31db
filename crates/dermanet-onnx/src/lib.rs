//! Interchange-graph construction for the skin-lesion classifier
//! converter: a typed operator graph over checkpoint weights, constant
//! folding, and ONNX protobuf serialization.

pub mod export;
mod node;
pub mod ops;
mod proto;
pub mod tensor;
pub mod weights;

pub use node::{Node, SingleOutputNode};
pub use proto::onnx;

use tensor::{DType, Shape};

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("incompatible shapes {0} and {1}")]
    ShapeMismatch(Shape, Shape),
    #[error("incompatible dtypes {0} and {1}")]
    DTypeMismatch(DType, DType),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{elements} data elements do not fill shape {shape}")]
    DataShapeMismatch { shape: Shape, elements: usize },
    #[error("unsupported dtype")]
    UnsupportedDType,
    #[error("no such tensor: {0}")]
    NoSuchTensor(String),
    #[error(transparent)]
    CandleCore(candle_core::Error),
    #[error("safetensors error: {0}")]
    SafeTensors(safetensors::SafeTensorError),
}
