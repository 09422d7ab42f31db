//! ResNet-family survey and graph builder.
//!
//! The block census reads `layerS.B.convN.weight` names: the per-stage
//! block counts give the depth, `conv3` marks bottleneck blocks, and the
//! widths come from the weight shapes at build time.

use std::collections::HashSet;
use std::sync::Arc;

use dermanet_onnx::ops::{Add, Flatten, GlobalAveragePool, MaxPool};
use dermanet_onnx::tensor::{InputTensor, Tensor};
use dermanet_onnx::weights::WeightManager;
use dermanet_onnx::GraphError;

use crate::layers::{batch_norm, conv2d, linear, relu};
use crate::LoadError;

pub const STAGES: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum BlockKind {
    Basic,
    Bottleneck,
}

impl BlockKind {
    fn convs_per_block(&self) -> usize {
        match self {
            BlockKind::Basic => 2,
            BlockKind::Bottleneck => 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResNetConfig {
    pub block: BlockKind,
    pub stage_blocks: [usize; STAGES],
    pub num_classes: usize,
}

impl ResNetConfig {
    /// Conventional depth name: stem conv + block convs + classifier.
    pub fn architecture_name(&self) -> String {
        let convs: usize = self.stage_blocks.iter().sum::<usize>() * self.block.convs_per_block();
        format!("resnet{}", convs + 2)
    }

    /// Batch-norm prefixes present in this checkpoint, including the
    /// downsample projections.
    pub fn bn_prefixes(&self, wm: &impl WeightManager) -> Vec<String> {
        let mut out = vec!["bn1".to_string()];
        for (stage, &blocks) in self.stage_blocks.iter().enumerate() {
            for block in 0..blocks {
                let prefix = format!("layer{}.{}", stage + 1, block);
                out.push(format!("{prefix}.bn1"));
                out.push(format!("{prefix}.bn2"));
                if self.block == BlockKind::Bottleneck {
                    out.push(format!("{prefix}.bn3"));
                }
                if wm.has_tensor(&format!("{prefix}.downsample.0.weight")) {
                    out.push(format!("{prefix}.downsample.1"));
                }
            }
        }
        out
    }
}

pub fn survey(wm: &impl WeightManager, names: &HashSet<String>) -> Result<ResNetConfig, LoadError> {
    for required in ["conv1.weight", "bn1.weight", "fc.weight"] {
        if !names.contains(required) {
            return Err(LoadError::MissingTensor(required.to_string()));
        }
    }

    let mut stage_blocks = [0usize; STAGES];
    for name in names {
        let parts: Vec<&str> = name.split('.').collect();
        if parts.len() == 4 && parts[2] == "conv1" && parts[3] == "weight" {
            if let Some(stage) = parts[0].strip_prefix("layer") {
                if let (Ok(stage), Ok(block)) = (stage.parse::<usize>(), parts[1].parse::<usize>())
                {
                    if (1..=STAGES).contains(&stage) {
                        stage_blocks[stage - 1] = stage_blocks[stage - 1].max(block + 1);
                    }
                }
            }
        }
    }
    if stage_blocks.iter().any(|&x| x == 0) {
        return Err(LoadError::UnknownArchitecture(format!(
            "incomplete ResNet stage census {stage_blocks:?}"
        )));
    }

    let block = if names.contains("layer1.0.conv3.weight") {
        BlockKind::Bottleneck
    } else {
        BlockKind::Basic
    };

    let num_classes = wm.get_tensor("fc.weight")?.shape().dim(0);

    Ok(ResNetConfig {
        block,
        stage_blocks,
        num_classes,
    })
}

fn basic_block(
    wm: &impl WeightManager,
    input: Arc<dyn Tensor>,
    stride: usize,
) -> Result<Arc<dyn Tensor>, GraphError> {
    let identity = downsample(wm, input.clone(), stride)?;
    let x = conv2d(&wm.prefix("conv1"), input, [stride, stride], [1, 1])?;
    let x = batch_norm(&wm.prefix("bn1"), x)?;
    let x = relu(x)?;
    let x = conv2d(&wm.prefix("conv2"), x, [1, 1], [1, 1])?;
    let x = batch_norm(&wm.prefix("bn2"), x)?;
    let x = Add::new(wm.get_prefix().map(|p| format!("{p}.residual")), x, identity)?;
    relu(x)
}

fn bottleneck_block(
    wm: &impl WeightManager,
    input: Arc<dyn Tensor>,
    stride: usize,
) -> Result<Arc<dyn Tensor>, GraphError> {
    let identity = downsample(wm, input.clone(), stride)?;
    let x = conv2d(&wm.prefix("conv1"), input, [1, 1], [0, 0])?;
    let x = batch_norm(&wm.prefix("bn1"), x)?;
    let x = relu(x)?;
    // Stride lives on the 3x3 conv (the torchvision v1.5 placement the
    // training side used).
    let x = conv2d(&wm.prefix("conv2"), x, [stride, stride], [1, 1])?;
    let x = batch_norm(&wm.prefix("bn2"), x)?;
    let x = relu(x)?;
    let x = conv2d(&wm.prefix("conv3"), x, [1, 1], [0, 0])?;
    let x = batch_norm(&wm.prefix("bn3"), x)?;
    let x = Add::new(wm.get_prefix().map(|p| format!("{p}.residual")), x, identity)?;
    relu(x)
}

/// 1x1 projection on the identity path when the checkpoint carries one,
/// otherwise the plain identity.
fn downsample(
    wm: &impl WeightManager,
    input: Arc<dyn Tensor>,
    stride: usize,
) -> Result<Arc<dyn Tensor>, GraphError> {
    if wm.has_tensor("downsample.0.weight") {
        let x = conv2d(&wm.prefix("downsample.0"), input, [stride, stride], [0, 0])?;
        batch_norm(&wm.prefix("downsample.1"), x)
    } else {
        Ok(input)
    }
}

pub fn build(
    wm: &impl WeightManager,
    config: &ResNetConfig,
    input: Arc<InputTensor>,
) -> Result<Arc<dyn Tensor>, GraphError> {
    let mut x = conv2d(&wm.prefix("conv1"), input, [2, 2], [3, 3])?;
    x = batch_norm(&wm.prefix("bn1"), x)?;
    x = relu(x)?;
    x = MaxPool::new(Some("maxpool".to_string()), x, [3, 3], [2, 2], [1, 1])?;

    for (stage, &blocks) in config.stage_blocks.iter().enumerate() {
        let stage_wm = wm.prefix(&format!("layer{}", stage + 1));
        for block in 0..blocks {
            let stride = if stage > 0 && block == 0 { 2 } else { 1 };
            let block_wm = stage_wm.prefix(&block.to_string());
            x = match config.block {
                BlockKind::Basic => basic_block(&block_wm, x, stride)?,
                BlockKind::Bottleneck => bottleneck_block(&block_wm, x, stride)?,
            };
        }
    }

    let x = GlobalAveragePool::new(Some("avgpool".to_string()), x)?;
    let x = Flatten::new(Some("flatten".to_string()), x, 1)?;
    linear(&wm.prefix("fc"), x)
}
