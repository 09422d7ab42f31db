//! Eager candle execution of a [`RunGraph`]. The same lowering is used
//! for trace replay, so every op form here must stay expressible from a
//! recorded [`OpKind`] plus its input tensors alone.

use std::collections::HashMap;

use candle_core::{Device, Tensor};

use crate::graph::{OpKind, RunGraph, RunOp};

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("tensor {0} is not available")]
    MissingTensor(String),
    #[error("op {op}: expected {expected} inputs, got {got}")]
    Arity {
        op: String,
        expected: usize,
        got: usize,
    },
    #[error("input {name}: expected dims {expected:?}, got {got:?}")]
    InputShape {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("op {op}: {reason}")]
    Unsupported { op: String, reason: String },
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Callback invoked once per executed op, in execution order.
pub trait ExecObserver {
    fn on_op(&mut self, op: &RunOp, output: &Tensor);
}

pub struct NoObserver;

impl ExecObserver for NoObserver {
    fn on_op(&mut self, _op: &RunOp, _output: &Tensor) {}
}

/// Run the graph on `device` and return the tensors named by
/// `graph.outputs`.
pub fn run(
    graph: &RunGraph,
    inputs: &HashMap<String, Tensor>,
    device: &Device,
    observer: &mut dyn ExecObserver,
) -> Result<HashMap<String, Tensor>, ExecError> {
    let mut env: HashMap<String, Tensor> = HashMap::new();
    for (name, tensor) in &graph.initializers {
        env.insert(name.clone(), tensor.to_device(device)?);
    }
    for spec in &graph.inputs {
        let tensor = inputs
            .get(&spec.name)
            .ok_or_else(|| ExecError::MissingTensor(spec.name.clone()))?;
        if tensor.dims() != spec.dims.as_slice() {
            return Err(ExecError::InputShape {
                name: spec.name.clone(),
                expected: spec.dims.clone(),
                got: tensor.dims().to_vec(),
            });
        }
        env.insert(spec.name.clone(), tensor.to_device(device)?);
    }

    for op in &graph.ops {
        let mut args = Vec::with_capacity(op.inputs.len());
        for input in &op.inputs {
            args.push(
                env.get(input)
                    .ok_or_else(|| ExecError::MissingTensor(input.clone()))?
                    .clone(),
            );
        }
        let output = apply_op(&op.kind, &args)?;
        observer.on_op(op, &output);
        env.insert(op.output.clone(), output);
    }

    let mut outputs = HashMap::new();
    for name in &graph.outputs {
        let tensor = env
            .get(name)
            .ok_or_else(|| ExecError::MissingTensor(name.clone()))?;
        outputs.insert(name.clone(), tensor.clone());
    }
    Ok(outputs)
}

/// Apply one lowered op to already-fetched input tensors.
pub fn apply_op(kind: &OpKind, inputs: &[Tensor]) -> Result<Tensor, ExecError> {
    match kind {
        OpKind::Conv {
            strides,
            pads,
            dilations,
            group,
        } => {
            let (x, weight) = binary("Conv", inputs)?;
            require_square("Conv", "strides", strides)?;
            require_square("Conv", "pads", pads)?;
            require_square("Conv", "dilations", dilations)?;
            let mut out = x.conv2d(weight, pads[0], strides[0], dilations[0], *group)?;
            if let Some(bias) = inputs.get(2) {
                let channels = bias.dims1()?;
                out = out.broadcast_add(&bias.reshape((1, channels, 1, 1))?)?;
            }
            Ok(out)
        }
        OpKind::BatchNormalization { epsilon } => {
            if inputs.len() != 5 {
                return Err(ExecError::Arity {
                    op: "BatchNormalization".to_string(),
                    expected: 5,
                    got: inputs.len(),
                });
            }
            let (x, scale, bias, mean, var) =
                (&inputs[0], &inputs[1], &inputs[2], &inputs[3], &inputs[4]);
            let channels = scale.dims1()?;
            let shape = (1, channels, 1, 1);
            let std = var.affine(1.0, *epsilon as f64)?.sqrt()?.reshape(shape)?;
            x.broadcast_sub(&mean.reshape(shape)?)?
                .broadcast_div(&std)?
                .broadcast_mul(&scale.reshape(shape)?)?
                .broadcast_add(&bias.reshape(shape)?)
                .map_err(ExecError::from)
        }
        OpKind::Relu => Ok(unary("Relu", inputs)?.relu()?),
        OpKind::MaxPool {
            kernel,
            strides,
            pads,
        } => {
            let x = unary("MaxPool", inputs)?;
            // candle pools have no padding parameter. Zero-padding is
            // equivalent here because every pooled activation in these
            // networks is post-ReLU, hence non-negative.
            let mut x = x.clone();
            if pads[0] > 0 {
                x = x.pad_with_zeros(2, pads[0], pads[0])?;
            }
            if pads[1] > 0 {
                x = x.pad_with_zeros(3, pads[1], pads[1])?;
            }
            Ok(x.max_pool2d_with_stride((kernel[0], kernel[1]), (strides[0], strides[1]))?)
        }
        OpKind::GlobalAveragePool => {
            let x = unary("GlobalAveragePool", inputs)?;
            Ok(x.mean_keepdim(3)?.mean_keepdim(2)?)
        }
        OpKind::MatMul => {
            let (a, b) = binary("MatMul", inputs)?;
            Ok(a.matmul(b)?)
        }
        OpKind::Transpose { perm } => {
            let x = unary("Transpose", inputs)?;
            Ok(x.permute(perm.clone())?)
        }
        OpKind::Add => {
            let (a, b) = binary("Add", inputs)?;
            Ok(a.broadcast_add(b)?)
        }
        OpKind::Sub => {
            let (a, b) = binary("Sub", inputs)?;
            Ok(a.broadcast_sub(b)?)
        }
        OpKind::Mul => {
            let (a, b) = binary("Mul", inputs)?;
            Ok(a.broadcast_mul(b)?)
        }
        OpKind::Div => {
            let (a, b) = binary("Div", inputs)?;
            Ok(a.broadcast_div(b)?)
        }
        OpKind::Sqrt => Ok(unary("Sqrt", inputs)?.sqrt()?),
        OpKind::Flatten { axis } => {
            let x = unary("Flatten", inputs)?;
            let rank = x.rank();
            // Flatten allows axis == rank: everything goes into the
            // outer dimension.
            let resolved = if *axis < 0 { *axis + rank as i64 } else { *axis };
            if !(0..=rank as i64).contains(&resolved) {
                return Err(ExecError::Unsupported {
                    op: "Flatten".to_string(),
                    reason: format!("axis {axis} out of range for rank {rank}"),
                });
            }
            let axis = resolved as usize;
            let dims = x.dims();
            let outer: usize = dims[..axis].iter().product();
            let inner: usize = dims[axis..].iter().product();
            Ok(x.reshape((outer, inner))?)
        }
        OpKind::Reshape => {
            let (x, shape) = binary("Reshape", inputs)?;
            let target = shape.to_dtype(candle_core::DType::I64)?.to_vec1::<i64>()?;
            let dims = resolve_reshape("Reshape", x.dims(), &target)?;
            Ok(x.reshape(dims)?)
        }
        OpKind::Softmax { axis } => {
            let x = unary("Softmax", inputs)?;
            let axis = normalize_axis("Softmax", *axis, x.rank())?;
            let shifted = x.broadcast_sub(&x.max_keepdim(axis)?)?;
            let exp = shifted.exp()?;
            Ok(exp.broadcast_div(&exp.sum_keepdim(axis)?)?)
        }
    }
}

fn unary<'a>(op: &str, inputs: &'a [Tensor]) -> Result<&'a Tensor, ExecError> {
    match inputs {
        [x] => Ok(x),
        _ => Err(ExecError::Arity {
            op: op.to_string(),
            expected: 1,
            got: inputs.len(),
        }),
    }
}

fn binary<'a>(op: &str, inputs: &'a [Tensor]) -> Result<(&'a Tensor, &'a Tensor), ExecError> {
    match inputs {
        [a, b] => Ok((a, b)),
        // Conv carries an optional trailing bias.
        [a, b, _] if op == "Conv" => Ok((a, b)),
        _ => Err(ExecError::Arity {
            op: op.to_string(),
            expected: 2,
            got: inputs.len(),
        }),
    }
}

fn require_square(op: &str, what: &str, pair: &[usize; 2]) -> Result<(), ExecError> {
    if pair[0] == pair[1] {
        Ok(())
    } else {
        Err(ExecError::Unsupported {
            op: op.to_string(),
            reason: format!("asymmetric {what} {pair:?}"),
        })
    }
}

fn normalize_axis(op: &str, axis: i64, rank: usize) -> Result<usize, ExecError> {
    let resolved = if axis < 0 { axis + rank as i64 } else { axis };
    if (0..rank as i64).contains(&resolved) {
        Ok(resolved as usize)
    } else {
        Err(ExecError::Unsupported {
            op: op.to_string(),
            reason: format!("axis {axis} out of range for rank {rank}"),
        })
    }
}

fn resolve_reshape(op: &str, input: &[usize], target: &[i64]) -> Result<Vec<usize>, ExecError> {
    let elements: usize = input.iter().product();
    let mut dims = Vec::with_capacity(target.len());
    let mut hole = None;
    for (i, &d) in target.iter().enumerate() {
        match d {
            -1 if hole.is_none() => {
                hole = Some(i);
                dims.push(1);
            }
            // A zero keeps the corresponding input dimension.
            0 => dims.push(*input.get(i).ok_or_else(|| ExecError::Unsupported {
                op: op.to_string(),
                reason: format!("zero target dim {i} has no input counterpart"),
            })?),
            d if d > 0 => dims.push(d as usize),
            _ => {
                return Err(ExecError::Unsupported {
                    op: op.to_string(),
                    reason: format!("bad reshape target {target:?}"),
                })
            }
        }
    }
    if let Some(i) = hole {
        let known: usize = dims.iter().product();
        if known == 0 || elements % known != 0 {
            return Err(ExecError::Unsupported {
                op: op.to_string(),
                reason: format!("cannot infer dim for reshape target {target:?}"),
            });
        }
        dims[i] = elements / known;
    }
    Ok(dims)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(values: Vec<f32>, dims: &[usize]) -> Tensor {
        Tensor::from_vec(values, dims, &Device::Cpu).unwrap()
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let x = t(vec![1.0, 2.0, 3.0, -1.0, 0.0, 1.0], &[2, 3]);
        let y = apply_op(&OpKind::Softmax { axis: 1 }, &[x]).unwrap();
        let rows: Vec<Vec<f32>> = y.to_vec2().unwrap();
        for row in rows {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
            assert!(row.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn reshape_resolves_zero_and_hole_dims() {
        let x = t((0..24).map(|v| v as f32).collect(), &[2, 3, 4]);
        let shape = Tensor::from_vec(vec![0i64, -1], (2,), &Device::Cpu).unwrap();
        let y = apply_op(&OpKind::Reshape, &[x, shape]).unwrap();
        assert_eq!(y.dims(), [2, 12]);
    }

    #[test]
    fn flatten_keeps_leading_axes() {
        let x = t(vec![0.0; 2 * 3 * 4], &[2, 3, 4]);
        let y = apply_op(&OpKind::Flatten { axis: 1 }, &[x]).unwrap();
        assert_eq!(y.dims(), [2, 12]);
    }

    #[test]
    fn flatten_resolves_negative_axis() {
        let x = t(vec![0.0; 2 * 3 * 4], &[2, 3, 4]);
        let y = apply_op(&OpKind::Flatten { axis: -1 }, &[x]).unwrap();
        assert_eq!(y.dims(), [6, 4]);
    }

    #[test]
    fn flatten_axis_out_of_range_is_an_error() {
        let x = t(vec![0.0; 4], &[2, 2]);
        for axis in [5, -3] {
            assert!(matches!(
                apply_op(&OpKind::Flatten { axis }, &[x.clone()]),
                Err(ExecError::Unsupported { .. })
            ));
        }
    }

    #[test]
    fn batch_norm_matches_inference_form() {
        let x = t(vec![1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]);
        let scale = t(vec![2.0], &[1]);
        let bias = t(vec![0.5], &[1]);
        let mean = t(vec![1.0], &[1]);
        let var = t(vec![4.0], &[1]);
        let y = apply_op(
            &OpKind::BatchNormalization { epsilon: 0.0 },
            &[x, scale, bias, mean, var],
        )
        .unwrap();
        let values: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        // (x - 1) / 2 * 2 + 0.5
        let expected = [0.5, 1.5, 2.5, 3.5];
        for (got, want) in values.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6);
        }
    }

    #[test]
    fn global_average_pool_reduces_spatial_dims() {
        let x = t(vec![1.0, 3.0, 5.0, 7.0], &[1, 1, 2, 2]);
        let y = apply_op(&OpKind::GlobalAveragePool, &[x]).unwrap();
        assert_eq!(y.dims(), [1, 1, 1, 1]);
        let values: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert!((values[0] - 4.0).abs() < 1e-6);
    }

    #[test]
    fn padded_max_pool_matches_torch_geometry() {
        let x = t((0..16).map(|v| v as f32).collect(), &[1, 1, 4, 4]);
        let y = apply_op(
            &OpKind::MaxPool {
                kernel: [3, 3],
                strides: [2, 2],
                pads: [1, 1],
            },
            &[x],
        )
        .unwrap();
        assert_eq!(y.dims(), [1, 1, 2, 2]);
        let values: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![5.0, 7.0, 13.0, 15.0]);
    }

    #[test]
    fn wrong_arity_is_reported() {
        let x = t(vec![1.0], &[1]);
        assert!(matches!(
            apply_op(&OpKind::Relu, &[x.clone(), x]),
            Err(ExecError::Arity { .. })
        ));
    }
}
