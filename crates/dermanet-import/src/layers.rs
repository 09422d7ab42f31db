use std::sync::Arc;

use dermanet_onnx::ops::{Add, BatchNormalization, Conv, MatMul, Relu, Transpose};
use dermanet_onnx::tensor::Tensor;
use dermanet_onnx::weights::WeightManager;
use dermanet_onnx::GraphError;

pub(crate) const BN_EPSILON: f32 = 1e-5;

pub(crate) fn conv2d(
    wm: &impl WeightManager,
    input: Arc<dyn Tensor>,
    strides: [usize; 2],
    pads: [usize; 2],
) -> Result<Arc<dyn Tensor>, GraphError> {
    let weight = wm.get_tensor("weight")?;
    let bias = if wm.has_tensor("bias") {
        Some(wm.get_tensor("bias")?)
    } else {
        None
    };
    Ok(Conv::new(
        wm.get_prefix().map(|x| x.to_string()),
        input,
        weight,
        bias,
        strides,
        pads,
        [1, 1],
        1,
    )?)
}

pub(crate) fn batch_norm(
    wm: &impl WeightManager,
    input: Arc<dyn Tensor>,
) -> Result<Arc<dyn Tensor>, GraphError> {
    Ok(BatchNormalization::new(
        wm.get_prefix().map(|x| x.to_string()),
        input,
        wm.get_tensor("weight")?,
        wm.get_tensor("bias")?,
        wm.get_tensor("running_mean")?,
        wm.get_tensor("running_var")?,
        BN_EPSILON,
    )?)
}

/// Linear layer as Transpose + MatMul + bias Add; constant folding
/// collapses the weight transpose into a pre-transposed initializer.
pub(crate) fn linear(
    wm: &impl WeightManager,
    input: Arc<dyn Tensor>,
) -> Result<Arc<dyn Tensor>, GraphError> {
    let weight = Transpose::new(None, wm.get_tensor("weight")?, None)?;
    let mat_out = MatMul::new(
        wm.get_prefix().map(|x| x.to_string()),
        input,
        weight,
    )?;
    if wm.has_tensor("bias") {
        let name = wm.get_prefix().map(|x| format!("{x}.bias_add"));
        Ok(Add::new(name, mat_out, wm.get_tensor("bias")?)?)
    } else {
        Ok(mat_out)
    }
}

pub(crate) fn relu(input: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, GraphError> {
    Ok(Relu::new(None, input)?)
}
