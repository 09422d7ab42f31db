use std::sync::Arc;

use memmap2::Mmap;
use safetensors::tensor::TensorInfo;
use safetensors::SafeTensors;

use crate::tensor::{DType, Shape, Tensor, TensorData};
use crate::GraphError;

/// Read access to a checkpoint's tensor table, with dotted-prefix
/// chaining so builders can descend into submodules.
pub trait WeightManager {
    fn prefix(&self, name: &str) -> Self
    where
        Self: Sized;

    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, GraphError>;

    fn has_tensor(&self, name: &str) -> bool;

    fn get_prefix(&self) -> Option<&str>;

    /// Fully qualified names of every tensor in the checkpoint, ignoring
    /// the current prefix.
    fn tensor_names(&self) -> Vec<String>;
}

fn join_prefix(prefix: &Option<String>, name: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}.{name}"),
        None => name.to_string(),
    }
}

/// Weights read from a PyTorch-style zip/pickle checkpoint.
pub struct PthWeightManager {
    prefix: Option<String>,
    pth_tensors: Arc<candle_core::pickle::PthTensors>,
}

impl PthWeightManager {
    pub fn new(pth_tensors: Arc<candle_core::pickle::PthTensors>) -> Self {
        Self {
            prefix: None,
            pth_tensors,
        }
    }
}

impl WeightManager for PthWeightManager {
    fn prefix(&self, name: &str) -> Self {
        Self {
            prefix: Some(join_prefix(&self.prefix, name)),
            pth_tensors: self.pth_tensors.clone(),
        }
    }

    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, GraphError> {
        let name = join_prefix(&self.prefix, name);
        let tensor_infos = self.pth_tensors.tensor_infos();
        let tensor_info = tensor_infos
            .get(&name)
            .ok_or_else(|| GraphError::NoSuchTensor(name.clone()))?;
        Ok(PthTensor::new(
            name,
            tensor_info.dtype,
            Shape::from(tensor_info.layout.shape()),
            self.pth_tensors.clone(),
        )?)
    }

    fn has_tensor(&self, name: &str) -> bool {
        let name = join_prefix(&self.prefix, name);
        self.pth_tensors.tensor_infos().contains_key(&name)
    }

    fn get_prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    fn tensor_names(&self) -> Vec<String> {
        self.pth_tensors
            .tensor_infos()
            .keys()
            .map(|x| x.to_string())
            .collect()
    }
}

pub struct PthTensor {
    name: String,
    dtype: DType,
    shape: Shape,
    tensors: Arc<candle_core::pickle::PthTensors>,
}

impl PthTensor {
    fn new(
        name: String,
        dtype: candle_core::DType,
        shape: Shape,
        tensors: Arc<candle_core::pickle::PthTensors>,
    ) -> Result<Arc<Self>, GraphError> {
        Ok(Arc::new(Self {
            name,
            dtype: DType::from_candle(dtype)?,
            shape,
            tensors,
        }))
    }
}

impl Tensor for PthTensor {
    fn dtype(&self) -> DType {
        self.dtype
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn name_hint(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn try_resolve_data(&self) -> Result<Option<TensorData>, GraphError> {
        let tensor = self
            .tensors
            .get(&self.name)
            .map_err(GraphError::CandleCore)?
            .ok_or_else(|| GraphError::NoSuchTensor(self.name.clone()))?;
        Ok(Some(TensorData::from_candle_tensor(&tensor)?))
    }
}

struct SafetensorsInner {
    mmap: Arc<Mmap>,
    metadata: safetensors::tensor::Metadata,
}

impl SafetensorsInner {
    fn tensor_info(&self, name: &str) -> Option<&TensorInfo> {
        self.metadata.info(name)
    }
}

/// Weights read from a memory-mapped safetensors file.
pub struct SafetensorsWeightManager {
    prefix: Option<String>,
    inner: Arc<SafetensorsInner>,
}

impl SafetensorsWeightManager {
    pub fn new(mmap: Arc<Mmap>) -> Result<Self, GraphError> {
        let (_, metadata) =
            SafeTensors::read_metadata(&mmap).map_err(GraphError::SafeTensors)?;
        Ok(Self {
            prefix: None,
            inner: Arc::new(SafetensorsInner { mmap, metadata }),
        })
    }
}

impl WeightManager for SafetensorsWeightManager {
    fn prefix(&self, name: &str) -> Self {
        Self {
            prefix: Some(join_prefix(&self.prefix, name)),
            inner: self.inner.clone(),
        }
    }

    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, GraphError> {
        let name = join_prefix(&self.prefix, name);
        let info = self
            .inner
            .tensor_info(&name)
            .ok_or_else(|| GraphError::NoSuchTensor(name.clone()))?;
        Ok(Arc::new(SafetensorsTensor {
            dtype: DType::from_safetensors(info.dtype)?,
            shape: Shape::new(info.shape.clone()),
            name,
            inner: self.inner.clone(),
        }))
    }

    fn has_tensor(&self, name: &str) -> bool {
        let name = join_prefix(&self.prefix, name);
        self.inner.tensor_info(&name).is_some()
    }

    fn get_prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    fn tensor_names(&self) -> Vec<String> {
        self.inner.metadata.tensors().keys().cloned().collect()
    }
}

pub struct SafetensorsTensor {
    name: String,
    dtype: DType,
    shape: Shape,
    inner: Arc<SafetensorsInner>,
}

impl Tensor for SafetensorsTensor {
    fn dtype(&self) -> DType {
        self.dtype
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn name_hint(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn try_resolve_data(&self) -> Result<Option<TensorData>, GraphError> {
        let st =
            SafeTensors::deserialize(&self.inner.mmap).map_err(GraphError::SafeTensors)?;
        let view = st.tensor(&self.name).map_err(GraphError::SafeTensors)?;
        Ok(Some(TensorData::from_safetensors_view(view)?))
    }
}
