//! JSON-file configuration for the converter. Every field has a
//! default, so a settings file only states what it changes.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use dermanet_import::ArchHint;
use dermanet_onnx::export::WeightStorage;

use crate::convert::{ConvertOptions, DEFAULT_CLASS_LABELS, DEFAULT_ONNX_OUTPUT};
use crate::device::DeviceError;
use crate::preprocess::PreprocessSettings;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("cannot read settings file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("settings parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("no checkpoint source given (settings `source` or command line)")]
    MissingSource,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ConvertSettings {
    pub source: Option<PathBuf>,
    pub device: String,
    pub onnx_output: PathBuf,
    pub traced_output: Option<PathBuf>,
    pub opset_version: i64,
    pub constant_folding: bool,
    /// When set, initializer payloads go to this side file instead of
    /// being embedded in the model.
    pub weights_file: Option<PathBuf>,
    pub architecture: Option<ArchHint>,
    pub class_labels: Vec<String>,
    pub input: PreprocessSettings,
}

impl Default for ConvertSettings {
    fn default() -> Self {
        Self {
            source: None,
            device: "cpu".to_string(),
            onnx_output: PathBuf::from(DEFAULT_ONNX_OUTPUT),
            traced_output: None,
            opset_version: dermanet_onnx::export::DEFAULT_OPSET_VERSION,
            constant_folding: true,
            weights_file: None,
            architecture: None,
            class_labels: DEFAULT_CLASS_LABELS.iter().map(|s| s.to_string()).collect(),
            input: PreprocessSettings::default(),
        }
    }
}

impl ConvertSettings {
    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Resolve into pipeline options; `source_override` wins over the
    /// file's own `source` entry.
    pub fn into_options(
        self,
        source_override: Option<PathBuf>,
    ) -> Result<ConvertOptions, SettingsError> {
        let source = source_override
            .or(self.source)
            .ok_or(SettingsError::MissingSource)?;
        let device = crate::device::DevicePreference::from_str(&self.device)?;
        Ok(ConvertOptions {
            source,
            device,
            onnx_output: self.onnx_output,
            traced_output: self.traced_output,
            opset_version: self.opset_version,
            constant_folding: self.constant_folding,
            weight_storage: match self.weights_file {
                Some(path) => WeightStorage::BinFile(path),
                None => WeightStorage::Embedded,
            },
            architecture: self.architecture,
            class_labels: Some(self.class_labels),
            normalization: Some(dermanet_onnx::export::InputNormalization {
                mean: self.input.mean.clone(),
                std: self.input.std.clone(),
            }),
        })
    }
}
