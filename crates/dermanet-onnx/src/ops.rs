use std::sync::Arc;

use crate::node::{attr_float, attr_int, attr_ints, attr_tensor, Node, SingleOutputNode};
use crate::proto::onnx;
use crate::tensor::{DType, Shape, Tensor, TensorData, TensorDataValue};
use crate::GraphError;

fn validate_float_dtype(dtype: DType) -> Result<(), GraphError> {
    match dtype {
        DType::F32 | DType::F16 | DType::BF16 => Ok(()),
        _ => Err(GraphError::InvalidInput(format!(
            "expected float tensor, got {dtype}"
        ))),
    }
}

fn conv_spatial_dim(
    input: usize,
    kernel: usize,
    stride: usize,
    pad: usize,
    dilation: usize,
) -> Result<usize, GraphError> {
    let effective = dilation * (kernel - 1) + 1;
    let padded = input + 2 * pad;
    if padded < effective {
        return Err(GraphError::InvalidInput(format!(
            "kernel extent {effective} exceeds padded input {padded}"
        )));
    }
    Ok((padded - effective) / stride + 1)
}

/// 2-D convolution, NCHW input against an OIHW weight.
pub struct Conv {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    weight: Arc<dyn Tensor>,
    bias: Option<Arc<dyn Tensor>>,
    strides: [usize; 2],
    pads: [usize; 2],
    dilations: [usize; 2],
    group: usize,
    output_shape: Shape,
}

impl Conv {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: Option<String>,
        input: Arc<dyn Tensor>,
        weight: Arc<dyn Tensor>,
        bias: Option<Arc<dyn Tensor>>,
        strides: [usize; 2],
        pads: [usize; 2],
        dilations: [usize; 2],
        group: usize,
    ) -> Result<Arc<Self>, GraphError> {
        validate_float_dtype(input.dtype())?;
        if input.dtype() != weight.dtype() {
            return Err(GraphError::DTypeMismatch(input.dtype(), weight.dtype()));
        }
        if input.rank() != 4 || weight.rank() != 4 {
            return Err(GraphError::InvalidInput(format!(
                "Conv expects rank-4 input and weight, got {} and {}",
                input.shape(),
                weight.shape()
            )));
        }
        let in_channels = input.shape().dim(1);
        let weight_in = weight.shape().dim(1);
        if in_channels != weight_in * group {
            return Err(GraphError::ShapeMismatch(
                input.shape().clone(),
                weight.shape().clone(),
            ));
        }
        let out_channels = weight.shape().dim(0);
        if let Some(bias) = &bias {
            if bias.shape().dims() != [out_channels] {
                return Err(GraphError::ShapeMismatch(
                    weight.shape().clone(),
                    bias.shape().clone(),
                ));
            }
        }
        let out_h = conv_spatial_dim(
            input.shape().dim(2),
            weight.shape().dim(2),
            strides[0],
            pads[0],
            dilations[0],
        )?;
        let out_w = conv_spatial_dim(
            input.shape().dim(3),
            weight.shape().dim(3),
            strides[1],
            pads[1],
            dilations[1],
        )?;
        let output_shape = Shape::new(vec![input.shape().dim(0), out_channels, out_h, out_w]);
        Ok(Arc::new(Self {
            name,
            input,
            weight,
            bias,
            strides,
            pads,
            dilations,
            group,
            output_shape,
        }))
    }
}

impl Node for Conv {
    fn input_tensors(&self) -> Vec<Arc<dyn Tensor>> {
        let mut inputs = vec![self.input.clone(), self.weight.clone()];
        if let Some(bias) = &self.bias {
            inputs.push(bias.clone());
        }
        inputs
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn op_type(&self) -> &str {
        "Conv"
    }

    fn attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![
            attr_ints(
                "dilations",
                &[self.dilations[0] as i64, self.dilations[1] as i64],
            ),
            attr_int("group", self.group as i64),
            attr_ints(
                "kernel_shape",
                &[
                    self.weight.shape().dim(2) as i64,
                    self.weight.shape().dim(3) as i64,
                ],
            ),
            attr_ints(
                "pads",
                &[
                    self.pads[0] as i64,
                    self.pads[1] as i64,
                    self.pads[0] as i64,
                    self.pads[1] as i64,
                ],
            ),
            attr_ints("strides", &[self.strides[0] as i64, self.strides[1] as i64]),
        ]
    }
}

impl SingleOutputNode for Conv {
    fn output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

/// Inference-form batch normalization (single output, opset >= 9).
pub struct BatchNormalization {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    scale: Arc<dyn Tensor>,
    bias: Arc<dyn Tensor>,
    mean: Arc<dyn Tensor>,
    var: Arc<dyn Tensor>,
    epsilon: f32,
}

impl BatchNormalization {
    pub fn new(
        name: Option<String>,
        input: Arc<dyn Tensor>,
        scale: Arc<dyn Tensor>,
        bias: Arc<dyn Tensor>,
        mean: Arc<dyn Tensor>,
        var: Arc<dyn Tensor>,
        epsilon: f32,
    ) -> Result<Arc<Self>, GraphError> {
        validate_float_dtype(input.dtype())?;
        if input.rank() != 4 {
            return Err(GraphError::InvalidInput(format!(
                "BatchNormalization expects rank-4 input, got {}",
                input.shape()
            )));
        }
        let channels = input.shape().dim(1);
        for param in [&scale, &bias, &mean, &var] {
            if param.shape().dims() != [channels] {
                return Err(GraphError::ShapeMismatch(
                    input.shape().clone(),
                    param.shape().clone(),
                ));
            }
            if param.dtype() != input.dtype() {
                return Err(GraphError::DTypeMismatch(input.dtype(), param.dtype()));
            }
        }
        Ok(Arc::new(Self {
            name,
            input,
            scale,
            bias,
            mean,
            var,
            epsilon,
        }))
    }
}

impl Node for BatchNormalization {
    fn input_tensors(&self) -> Vec<Arc<dyn Tensor>> {
        vec![
            self.input.clone(),
            self.scale.clone(),
            self.bias.clone(),
            self.mean.clone(),
            self.var.clone(),
        ]
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn op_type(&self) -> &str {
        "BatchNormalization"
    }

    fn min_opset(&self) -> i64 {
        9
    }

    fn attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![attr_float("epsilon", self.epsilon)]
    }
}

impl SingleOutputNode for BatchNormalization {
    fn output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Relu {
    name: Option<String>,
    input: Arc<dyn Tensor>,
}

impl Relu {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>) -> Result<Arc<Self>, GraphError> {
        validate_float_dtype(input.dtype())?;
        Ok(Arc::new(Self { name, input }))
    }
}

impl Node for Relu {
    fn input_tensors(&self) -> Vec<Arc<dyn Tensor>> {
        vec![self.input.clone()]
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn op_type(&self) -> &str {
        "Relu"
    }
}

impl SingleOutputNode for Relu {
    fn output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct MaxPool {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    kernel: [usize; 2],
    strides: [usize; 2],
    pads: [usize; 2],
    output_shape: Shape,
}

impl MaxPool {
    pub fn new(
        name: Option<String>,
        input: Arc<dyn Tensor>,
        kernel: [usize; 2],
        strides: [usize; 2],
        pads: [usize; 2],
    ) -> Result<Arc<Self>, GraphError> {
        validate_float_dtype(input.dtype())?;
        if input.rank() != 4 {
            return Err(GraphError::InvalidInput(format!(
                "MaxPool expects rank-4 input, got {}",
                input.shape()
            )));
        }
        let out_h = conv_spatial_dim(input.shape().dim(2), kernel[0], strides[0], pads[0], 1)?;
        let out_w = conv_spatial_dim(input.shape().dim(3), kernel[1], strides[1], pads[1], 1)?;
        let output_shape = Shape::new(vec![
            input.shape().dim(0),
            input.shape().dim(1),
            out_h,
            out_w,
        ]);
        Ok(Arc::new(Self {
            name,
            input,
            kernel,
            strides,
            pads,
            output_shape,
        }))
    }
}

impl Node for MaxPool {
    fn input_tensors(&self) -> Vec<Arc<dyn Tensor>> {
        vec![self.input.clone()]
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn op_type(&self) -> &str {
        "MaxPool"
    }

    fn attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![
            attr_ints(
                "kernel_shape",
                &[self.kernel[0] as i64, self.kernel[1] as i64],
            ),
            attr_ints(
                "pads",
                &[
                    self.pads[0] as i64,
                    self.pads[1] as i64,
                    self.pads[0] as i64,
                    self.pads[1] as i64,
                ],
            ),
            attr_ints("strides", &[self.strides[0] as i64, self.strides[1] as i64]),
        ]
    }
}

impl SingleOutputNode for MaxPool {
    fn output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct GlobalAveragePool {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    output_shape: Shape,
}

impl GlobalAveragePool {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>) -> Result<Arc<Self>, GraphError> {
        validate_float_dtype(input.dtype())?;
        if input.rank() != 4 {
            return Err(GraphError::InvalidInput(format!(
                "GlobalAveragePool expects rank-4 input, got {}",
                input.shape()
            )));
        }
        let output_shape = Shape::new(vec![input.shape().dim(0), input.shape().dim(1), 1, 1]);
        Ok(Arc::new(Self {
            name,
            input,
            output_shape,
        }))
    }
}

impl Node for GlobalAveragePool {
    fn input_tensors(&self) -> Vec<Arc<dyn Tensor>> {
        vec![self.input.clone()]
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn op_type(&self) -> &str {
        "GlobalAveragePool"
    }
}

impl SingleOutputNode for GlobalAveragePool {
    fn output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct MatMul {
    name: Option<String>,
    a: Arc<dyn Tensor>,
    b: Arc<dyn Tensor>,
    output_shape: Shape,
}

impl MatMul {
    pub fn new(
        name: Option<String>,
        a: Arc<dyn Tensor>,
        b: Arc<dyn Tensor>,
    ) -> Result<Arc<Self>, GraphError> {
        if a.dtype() != b.dtype() {
            return Err(GraphError::DTypeMismatch(a.dtype(), b.dtype()));
        }
        if a.rank() != 2 || b.rank() != 2 {
            return Err(GraphError::InvalidInput(format!(
                "MatMul expects rank-2 operands, got {} and {}",
                a.shape(),
                b.shape()
            )));
        }
        if a.shape().dim(1) != b.shape().dim(0) {
            return Err(GraphError::ShapeMismatch(
                a.shape().clone(),
                b.shape().clone(),
            ));
        }
        let output_shape = Shape::new(vec![a.shape().dim(0), b.shape().dim(1)]);
        Ok(Arc::new(Self {
            name,
            a,
            b,
            output_shape,
        }))
    }
}

impl Node for MatMul {
    fn input_tensors(&self) -> Vec<Arc<dyn Tensor>> {
        vec![self.a.clone(), self.b.clone()]
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn op_type(&self) -> &str {
        "MatMul"
    }
}

impl SingleOutputNode for MatMul {
    fn output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn output_dtype(&self) -> DType {
        self.a.dtype()
    }
}

pub struct Transpose {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    perm: Vec<usize>,
    output_shape: Shape,
}

impl Transpose {
    /// `perm = None` reverses the axes, matching the ONNX default.
    pub fn new(
        name: Option<String>,
        input: Arc<dyn Tensor>,
        perm: Option<Vec<usize>>,
    ) -> Result<Arc<Self>, GraphError> {
        let rank = input.rank();
        let perm = perm.unwrap_or_else(|| (0..rank).rev().collect());
        if perm.len() != rank {
            return Err(GraphError::InvalidInput(format!(
                "Transpose perm has {} entries for rank-{rank} input",
                perm.len()
            )));
        }
        let mut seen = vec![false; rank];
        for &axis in &perm {
            if axis >= rank || seen[axis] {
                return Err(GraphError::InvalidInput(format!(
                    "invalid Transpose perm {perm:?}"
                )));
            }
            seen[axis] = true;
        }
        let output_shape = Shape::new(perm.iter().map(|&axis| input.shape().dim(axis)).collect());
        Ok(Arc::new(Self {
            name,
            input,
            perm,
            output_shape,
        }))
    }
}

impl Node for Transpose {
    fn input_tensors(&self) -> Vec<Arc<dyn Tensor>> {
        vec![self.input.clone()]
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn op_type(&self) -> &str {
        "Transpose"
    }

    fn attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![attr_ints(
            "perm",
            &self.perm.iter().map(|x| *x as i64).collect::<Vec<_>>(),
        )]
    }
}

impl SingleOutputNode for Transpose {
    fn output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn output_dtype(&self) -> DType {
        self.input.dtype()
    }

    fn fold_output_data(&self) -> Result<Option<TensorData>, GraphError> {
        // Only the rank-2 case appears in folded graphs (pre-transposed
        // linear weights).
        if self.input.rank() != 2 {
            return Ok(None);
        }
        let Some(data) = self.input.try_resolve_data()? else {
            return Ok(None);
        };
        let (rows, cols) = (data.shape().dim(0), data.shape().dim(1));
        let values = data.value().to_f32_vec()?;
        let mut transposed = vec![0f32; values.len()];
        for r in 0..rows {
            for c in 0..cols {
                transposed[c * rows + r] = values[r * cols + c];
            }
        }
        Ok(Some(TensorData::new(
            TensorDataValue::F32(transposed),
            self.output_shape.clone(),
        )?))
    }
}

macro_rules! elementwise_op {
    ($name:ident, $op_type:literal, $fold:expr) => {
        pub struct $name {
            name: Option<String>,
            a: Arc<dyn Tensor>,
            b: Arc<dyn Tensor>,
            output_shape: Shape,
        }

        impl $name {
            pub fn new(
                name: Option<String>,
                a: Arc<dyn Tensor>,
                b: Arc<dyn Tensor>,
            ) -> Result<Arc<Self>, GraphError> {
                if a.dtype() != b.dtype() {
                    return Err(GraphError::DTypeMismatch(a.dtype(), b.dtype()));
                }
                let output_shape = a.shape().broadcast(b.shape())?;
                Ok(Arc::new(Self {
                    name,
                    a,
                    b,
                    output_shape,
                }))
            }
        }

        impl Node for $name {
            fn input_tensors(&self) -> Vec<Arc<dyn Tensor>> {
                vec![self.a.clone(), self.b.clone()]
            }

            fn name(&self) -> Option<&str> {
                self.name.as_deref()
            }

            fn op_type(&self) -> &str {
                $op_type
            }
        }

        impl SingleOutputNode for $name {
            fn output_shape(&self) -> &Shape {
                &self.output_shape
            }

            fn output_dtype(&self) -> DType {
                self.a.dtype()
            }

            fn fold_output_data(&self) -> Result<Option<TensorData>, GraphError> {
                // Broadcast folding never arises in these graphs; fold
                // equal-shape constant pairs only.
                if self.a.shape() != self.b.shape() || self.a.dtype() != DType::F32 {
                    return Ok(None);
                }
                let (Some(a), Some(b)) =
                    (self.a.try_resolve_data()?, self.b.try_resolve_data()?)
                else {
                    return Ok(None);
                };
                let a = a.value().to_f32_vec()?;
                let b = b.value().to_f32_vec()?;
                let f: fn(f32, f32) -> f32 = $fold;
                let out: Vec<f32> = a.iter().zip(b.iter()).map(|(x, y)| f(*x, *y)).collect();
                Ok(Some(TensorData::new(
                    TensorDataValue::F32(out),
                    self.output_shape.clone(),
                )?))
            }
        }
    };
}

elementwise_op!(Add, "Add", |a, b| a + b);
elementwise_op!(Sub, "Sub", |a, b| a - b);
elementwise_op!(Mul, "Mul", |a, b| a * b);
elementwise_op!(Div, "Div", |a, b| a / b);

pub struct Sqrt {
    name: Option<String>,
    input: Arc<dyn Tensor>,
}

impl Sqrt {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>) -> Result<Arc<Self>, GraphError> {
        validate_float_dtype(input.dtype())?;
        Ok(Arc::new(Self { name, input }))
    }
}

impl Node for Sqrt {
    fn input_tensors(&self) -> Vec<Arc<dyn Tensor>> {
        vec![self.input.clone()]
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn op_type(&self) -> &str {
        "Sqrt"
    }
}

impl SingleOutputNode for Sqrt {
    fn output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn output_dtype(&self) -> DType {
        self.input.dtype()
    }

    fn fold_output_data(&self) -> Result<Option<TensorData>, GraphError> {
        let Some(data) = self.input.try_resolve_data()? else {
            return Ok(None);
        };
        let values = data.value().to_f32_vec()?;
        Ok(Some(TensorData::new(
            TensorDataValue::F32(values.iter().map(|x| x.sqrt()).collect()),
            data.shape().clone(),
        )?))
    }
}

pub struct Flatten {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    axis: usize,
    output_shape: Shape,
}

impl Flatten {
    pub fn new(
        name: Option<String>,
        input: Arc<dyn Tensor>,
        axis: usize,
    ) -> Result<Arc<Self>, GraphError> {
        if axis > input.rank() {
            return Err(GraphError::InvalidInput(format!(
                "Flatten axis {axis} out of range for {}",
                input.shape()
            )));
        }
        let outer: usize = input.shape().dims()[..axis].iter().product();
        let inner: usize = input.shape().dims()[axis..].iter().product();
        let output_shape = Shape::new(vec![outer, inner]);
        Ok(Arc::new(Self {
            name,
            input,
            axis,
            output_shape,
        }))
    }
}

impl Node for Flatten {
    fn input_tensors(&self) -> Vec<Arc<dyn Tensor>> {
        vec![self.input.clone()]
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn op_type(&self) -> &str {
        "Flatten"
    }

    fn attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![attr_int("axis", self.axis as i64)]
    }
}

impl SingleOutputNode for Flatten {
    fn output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Reshape {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    shape_input: Arc<dyn Tensor>,
    output_shape: Shape,
}

impl std::fmt::Debug for Reshape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reshape")
            .field("name", &self.name)
            .field("output_shape", &self.output_shape)
            .finish_non_exhaustive()
    }
}

impl Reshape {
    /// Target dims follow the ONNX convention: `-1` is inferred, `0`
    /// copies the input dim at that position.
    pub fn new(
        name: Option<String>,
        input: Arc<dyn Tensor>,
        target: Vec<i64>,
    ) -> Result<Arc<Self>, GraphError> {
        let mut dims = vec![];
        let mut infer_at = None;
        for (i, &d) in target.iter().enumerate() {
            match d {
                -1 => {
                    if infer_at.is_some() {
                        return Err(GraphError::InvalidInput(
                            "Reshape target has more than one -1".to_string(),
                        ));
                    }
                    infer_at = Some(i);
                    dims.push(1);
                }
                0 => match input.shape().dims().get(i) {
                    Some(&dim) => dims.push(dim),
                    None => {
                        return Err(GraphError::InvalidInput(format!(
                            "Reshape target dim {i} copies past the input rank"
                        )));
                    }
                },
                d if d > 0 => dims.push(d as usize),
                _ => {
                    return Err(GraphError::InvalidInput(format!(
                        "invalid Reshape target dim {d}"
                    )));
                }
            }
        }
        let total = input.shape().num_elements();
        let known: usize = dims.iter().product();
        if let Some(i) = infer_at {
            if known == 0 || total % known != 0 {
                return Err(GraphError::ShapeMismatch(
                    input.shape().clone(),
                    Shape::new(dims),
                ));
            }
            dims[i] = total / known;
        } else if known != total {
            return Err(GraphError::ShapeMismatch(
                input.shape().clone(),
                Shape::new(dims),
            ));
        }
        let shape_data = TensorData::new(
            TensorDataValue::I64(target.clone()),
            Shape::new(vec![target.len()]),
        )?;
        let shape_input = Constant::new(None, shape_data);
        Ok(Arc::new(Self {
            name,
            input,
            shape_input,
            output_shape: Shape::new(dims),
        }))
    }
}

impl Node for Reshape {
    fn input_tensors(&self) -> Vec<Arc<dyn Tensor>> {
        vec![self.input.clone(), self.shape_input.clone()]
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn op_type(&self) -> &str {
        "Reshape"
    }
}

impl SingleOutputNode for Reshape {
    fn output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn output_dtype(&self) -> DType {
        self.input.dtype()
    }

    fn fold_output_data(&self) -> Result<Option<TensorData>, GraphError> {
        let Some(data) = self.input.try_resolve_data()? else {
            return Ok(None);
        };
        Ok(Some(TensorData::new(
            data.value().clone(),
            self.output_shape.clone(),
        )?))
    }
}

pub struct Constant {
    name: Option<String>,
    data: TensorData,
}

impl Constant {
    pub fn new(name: Option<String>, data: TensorData) -> Arc<Self> {
        Arc::new(Self { name, data })
    }
}

impl Node for Constant {
    fn input_tensors(&self) -> Vec<Arc<dyn Tensor>> {
        vec![]
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn op_type(&self) -> &str {
        "Constant"
    }

    fn attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![attr_tensor("value", self.data.to_tensor_proto(None))]
    }
}

impl SingleOutputNode for Constant {
    fn output_shape(&self) -> &Shape {
        self.data.shape()
    }

    fn output_dtype(&self) -> DType {
        self.data.dtype()
    }

    fn fold_output_data(&self) -> Result<Option<TensorData>, GraphError> {
        Ok(Some(self.data.clone()))
    }
}

pub struct Softmax {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    axis: i64,
}

impl Softmax {
    pub fn new(
        name: Option<String>,
        input: Arc<dyn Tensor>,
        axis: i64,
    ) -> Result<Arc<Self>, GraphError> {
        validate_float_dtype(input.dtype())?;
        let rank = input.rank() as i64;
        if axis < -rank || axis >= rank {
            return Err(GraphError::InvalidInput(format!(
                "Softmax axis {axis} out of range for rank {rank}"
            )));
        }
        Ok(Arc::new(Self { name, input, axis }))
    }
}

impl Node for Softmax {
    fn input_tensors(&self) -> Vec<Arc<dyn Tensor>> {
        vec![self.input.clone()]
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn op_type(&self) -> &str {
        "Softmax"
    }

    fn attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![attr_int("axis", self.axis)]
    }
}

impl SingleOutputNode for Softmax {
    fn output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn output_dtype(&self) -> DType {
        self.input.dtype()
    }
}
