//! VGG-family survey and graph builder.
//!
//! The census counts rank-4 `features.N.weight` convolutions and matches
//! them against the standard 11/13/16/19 stage tables, with or without
//! batch norm; the `features` index layout is then re-derived the same
//! way during building, so a checkpoint with a shifted layout is
//! rejected at survey time.

use std::collections::HashSet;
use std::sync::Arc;

use dermanet_onnx::ops::{Flatten, MaxPool};
use dermanet_onnx::tensor::{InputTensor, Tensor};
use dermanet_onnx::weights::WeightManager;
use dermanet_onnx::GraphError;

use crate::layers::{batch_norm, conv2d, linear, relu};
use crate::LoadError;

/// Per-stage convolution counts; a max pool follows each stage.
fn stage_table(conv_count: usize) -> Option<[usize; 5]> {
    match conv_count {
        8 => Some([1, 1, 2, 2, 2]),
        10 => Some([2, 2, 2, 2, 2]),
        13 => Some([2, 2, 3, 3, 3]),
        16 => Some([2, 2, 4, 4, 4]),
        _ => None,
    }
}

/// Sequential indices of the convolution modules under `features`, for
/// the torchvision numbering (ReLU and pool modules occupy indices too).
fn conv_indices(stages: &[usize; 5], batch_norm: bool) -> Vec<usize> {
    let mut indices = vec![];
    let mut idx = 0;
    for &convs in stages {
        for _ in 0..convs {
            indices.push(idx);
            idx += if batch_norm { 3 } else { 2 };
        }
        idx += 1; // pool
    }
    indices
}

#[derive(Clone, Debug, PartialEq)]
pub struct VggConfig {
    pub stages: [usize; 5],
    pub batch_norm: bool,
    pub num_classes: usize,
}

impl VggConfig {
    pub fn architecture_name(&self) -> String {
        let depth = self.stages.iter().sum::<usize>() + 3;
        if self.batch_norm {
            format!("vgg{depth}_bn")
        } else {
            format!("vgg{depth}")
        }
    }

    pub fn bn_prefixes(&self) -> Vec<String> {
        if !self.batch_norm {
            return vec![];
        }
        conv_indices(&self.stages, true)
            .iter()
            .map(|idx| format!("features.{}", idx + 1))
            .collect()
    }
}

pub fn survey(wm: &impl WeightManager, names: &HashSet<String>) -> Result<VggConfig, LoadError> {
    for required in ["features.0.weight", "classifier.0.weight", "classifier.6.weight"] {
        if !names.contains(required) {
            return Err(LoadError::MissingTensor(required.to_string()));
        }
    }

    let mut conv_count = 0usize;
    for name in names {
        let parts: Vec<&str> = name.split('.').collect();
        if parts.len() == 3
            && parts[0] == "features"
            && parts[2] == "weight"
            && parts[1].parse::<usize>().is_ok()
            && wm.get_tensor(name)?.rank() == 4
        {
            conv_count += 1;
        }
    }
    let stages = stage_table(conv_count).ok_or_else(|| {
        LoadError::UnknownArchitecture(format!(
            "{conv_count} convolutions match no known VGG variant"
        ))
    })?;

    let batch_norm = names
        .iter()
        .any(|name| name.starts_with("features.") && name.ends_with(".running_mean"));

    for idx in conv_indices(&stages, batch_norm) {
        if !names.contains(&format!("features.{idx}.weight")) {
            return Err(LoadError::UnknownArchitecture(format!(
                "features index layout mismatch at module {idx}"
            )));
        }
    }

    let num_classes = wm.get_tensor("classifier.6.weight")?.shape().dim(0);

    Ok(VggConfig {
        stages,
        batch_norm,
        num_classes,
    })
}

pub fn build(
    wm: &impl WeightManager,
    config: &VggConfig,
    input: Arc<InputTensor>,
) -> Result<Arc<dyn Tensor>, GraphError> {
    let features = wm.prefix("features");
    let mut x: Arc<dyn Tensor> = input;
    let mut idx = 0;
    for &convs in &config.stages {
        for _ in 0..convs {
            x = conv2d(&features.prefix(&idx.to_string()), x, [1, 1], [1, 1])?;
            idx += 1;
            if config.batch_norm {
                x = batch_norm(&features.prefix(&idx.to_string()), x)?;
                idx += 1;
            }
            x = relu(x)?;
            idx += 1;
        }
        x = MaxPool::new(None, x, [2, 2], [2, 2], [0, 0])?;
        idx += 1;
    }

    // Classifier head; dropout modules at indices 2 and 5 vanish in
    // eval mode and hold no tensors.
    let classifier = wm.prefix("classifier");
    let x = Flatten::new(Some("flatten".to_string()), x, 1)?;
    let x = relu(linear(&classifier.prefix("0"), x)?)?;
    let x = relu(linear(&classifier.prefix("3"), x)?)?;
    linear(&classifier.prefix("6"), x)
}
