//! Checkpoint identification and network reconstruction.
//!
//! A checkpoint is an opaque tensor table; the architecture is recovered
//! by surveying tensor names (block census for the ResNet family, the
//! `features`/`classifier` index layout for the VGG family) and the
//! layer widths come from the weight shapes themselves.

mod layers;
pub mod resnet;
pub mod vgg;

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;

use dermanet_onnx::tensor::{InputTensor, Tensor};
use dermanet_onnx::weights::{PthWeightManager, SafetensorsWeightManager, WeightManager};
use dermanet_onnx::GraphError;

pub use resnet::{BlockKind, ResNetConfig};
pub use vgg::VggConfig;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("model source not found: {0}")]
    MissingSource(PathBuf),
    #[error("cannot identify checkpoint format: {0}")]
    CannotIdentify(PathBuf),
    #[error("malformed checkpoint archive: {0}")]
    MalformedArchive(#[source] anyhow::Error),
    #[error("unrecognized network architecture: {0}")]
    UnknownArchitecture(String),
    #[error("checkpoint is missing tensor {0}")]
    MissingTensor(String),
    #[error("batch-norm layer {0} carries no running statistics")]
    MissingRunningStats(String),
}

impl From<GraphError> for LoadError {
    fn from(value: GraphError) -> Self {
        match value {
            GraphError::NoSuchTensor(name) => LoadError::MissingTensor(name),
            other => LoadError::MalformedArchive(anyhow::Error::from(other)),
        }
    }
}

/// Optional architecture-family hint, narrowing the survey.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize,
    strum_macros::Display, strum_macros::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ArchHint {
    ResNet,
    Vgg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum CheckpointFormat {
    PickleZip,
    Safetensors,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// Sniff the on-disk encoding by extension, falling back to magic bytes.
pub fn identify_checkpoint(path: &Path) -> Result<CheckpointFormat, LoadError> {
    if !path.exists() {
        return Err(LoadError::MissingSource(path.to_path_buf()));
    }
    if let Some(ext) = path.extension().and_then(|x| x.to_str()) {
        match ext {
            "pth" | "pt" | "uu" | "bin" => return Ok(CheckpointFormat::PickleZip),
            "safetensors" => return Ok(CheckpointFormat::Safetensors),
            _ => {}
        }
    }
    let mut magic = [0u8; 4];
    let mut file = File::open(path).map_err(|e| LoadError::MalformedArchive(e.into()))?;
    file.read_exact(&mut magic)
        .map_err(|e| LoadError::MalformedArchive(e.into()))?;
    if magic == [b'P', b'K', 0x03, 0x04] {
        Ok(CheckpointFormat::PickleZip)
    } else {
        Err(LoadError::CannotIdentify(path.to_path_buf()))
    }
}

pub enum CheckpointWeights {
    Pickle(PthWeightManager),
    Safetensors(SafetensorsWeightManager),
}

#[derive(Clone, Debug, PartialEq)]
pub enum NetworkConfig {
    ResNet(ResNetConfig),
    Vgg(VggConfig),
}

impl NetworkConfig {
    pub fn architecture_name(&self) -> String {
        match self {
            NetworkConfig::ResNet(config) => config.architecture_name(),
            NetworkConfig::Vgg(config) => config.architecture_name(),
        }
    }

    pub fn num_classes(&self) -> usize {
        match self {
            NetworkConfig::ResNet(config) => config.num_classes,
            NetworkConfig::Vgg(config) => config.num_classes,
        }
    }
}

/// A loaded checkpoint: weight table, detected architecture, mode flag.
pub struct CheckpointModel {
    weights: CheckpointWeights,
    config: NetworkConfig,
    mode: Mode,
}

impl std::fmt::Debug for CheckpointModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointModel")
            .field("config", &self.config)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl CheckpointModel {
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Transition to evaluation mode. Dropout positions are elided by the
    /// builders; batch norm switches to stored running statistics, so
    /// every batch-norm layer must actually carry them.
    pub fn set_eval(&mut self) -> Result<(), LoadError> {
        let bn_prefixes = match &self.config {
            NetworkConfig::ResNet(config) => match &self.weights {
                CheckpointWeights::Pickle(wm) => config.bn_prefixes(wm),
                CheckpointWeights::Safetensors(wm) => config.bn_prefixes(wm),
            },
            NetworkConfig::Vgg(config) => config.bn_prefixes(),
        };
        let check = |wm: &dyn Fn(&str) -> bool| -> Result<(), LoadError> {
            for prefix in &bn_prefixes {
                if !wm(&format!("{prefix}.running_mean")) || !wm(&format!("{prefix}.running_var"))
                {
                    return Err(LoadError::MissingRunningStats(prefix.clone()));
                }
            }
            Ok(())
        };
        match &self.weights {
            CheckpointWeights::Pickle(wm) => check(&|name| wm.has_tensor(name))?,
            CheckpointWeights::Safetensors(wm) => check(&|name| wm.has_tensor(name))?,
        }
        self.mode = Mode::Eval;
        log::debug!("checkpoint transitioned to eval mode");
        Ok(())
    }

    /// Reconstruct the network as an export graph over `input`.
    pub fn build_graph(
        &self,
        input: Arc<InputTensor>,
    ) -> Result<Arc<dyn Tensor>, GraphError> {
        match (&self.weights, &self.config) {
            (CheckpointWeights::Pickle(wm), NetworkConfig::ResNet(config)) => {
                resnet::build(wm, config, input)
            }
            (CheckpointWeights::Pickle(wm), NetworkConfig::Vgg(config)) => {
                vgg::build(wm, config, input)
            }
            (CheckpointWeights::Safetensors(wm), NetworkConfig::ResNet(config)) => {
                resnet::build(wm, config, input)
            }
            (CheckpointWeights::Safetensors(wm), NetworkConfig::Vgg(config)) => {
                vgg::build(wm, config, input)
            }
        }
    }
}

/// Identify, open, and survey a checkpoint.
pub fn load_checkpoint(path: &Path, hint: Option<ArchHint>) -> Result<CheckpointModel, LoadError> {
    let format = identify_checkpoint(path)?;
    log::info!("loading {} checkpoint from {}", format, path.display());
    let weights = match format {
        CheckpointFormat::PickleZip => {
            let tensors = candle_core::pickle::PthTensors::new(path, None)
                .map_err(|e| LoadError::MalformedArchive(e.into()))?;
            CheckpointWeights::Pickle(PthWeightManager::new(Arc::new(tensors)))
        }
        CheckpointFormat::Safetensors => {
            let file = File::open(path).map_err(|e| LoadError::MalformedArchive(e.into()))?;
            let mmap = unsafe { Mmap::map(&file) }
                .map_err(|e| LoadError::MalformedArchive(e.into()))?;
            CheckpointWeights::Safetensors(
                SafetensorsWeightManager::new(Arc::new(mmap))
                    .map_err(|e| LoadError::MalformedArchive(anyhow::Error::from(e)))?,
            )
        }
    };
    let config = match &weights {
        CheckpointWeights::Pickle(wm) => detect_config(wm, hint)?,
        CheckpointWeights::Safetensors(wm) => detect_config(wm, hint)?,
    };
    log::info!(
        "detected {} with {} classes",
        config.architecture_name(),
        config.num_classes()
    );
    Ok(CheckpointModel {
        weights,
        config,
        mode: Mode::Train,
    })
}

fn detect_config(
    wm: &impl WeightManager,
    hint: Option<ArchHint>,
) -> Result<NetworkConfig, LoadError> {
    let names: HashSet<String> = wm.tensor_names().into_iter().collect();
    let looks_resnet = names.contains("conv1.weight") && names.contains("fc.weight");
    let looks_vgg = names.contains("features.0.weight") && names.contains("classifier.6.weight");
    match hint {
        Some(ArchHint::ResNet) => Ok(NetworkConfig::ResNet(resnet::survey(wm, &names)?)),
        Some(ArchHint::Vgg) => Ok(NetworkConfig::Vgg(vgg::survey(wm, &names)?)),
        None if looks_resnet => Ok(NetworkConfig::ResNet(resnet::survey(wm, &names)?)),
        None if looks_vgg => Ok(NetworkConfig::Vgg(vgg::survey(wm, &names)?)),
        None => Err(LoadError::UnknownArchitecture(
            "tensor names match neither the ResNet nor the VGG family".to_string(),
        )),
    }
}
