//! Checkpoint-to-ONNX conversion for skin-lesion classifiers.
//!
//! The pipeline loads a trained PyTorch-style checkpoint, recovers the
//! network architecture from its tensor names, rebuilds the forward
//! pass as an export graph, and writes an ONNX model (opset 9 by
//! default, weights embedded, constant folding on) validated against a
//! fixed `(1, 3, 224, 224)` input of ones. A traced module of the same
//! computation can be written alongside and replayed later.

pub mod convert;
pub mod device;
pub mod exec;
pub mod graph;
pub mod preprocess;
pub mod report;
pub mod settings;
pub mod trace;
pub mod verify;

pub use convert::{convert, ConvertError, ConvertOptions, ConvertReport};
pub use device::{DeviceError, DevicePreference};
pub use verify::{verify, VerifyError, VerifyOptions, VerifyReport};

pub use dermanet_import;
pub use dermanet_onnx;
