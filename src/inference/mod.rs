//! Inference backends for the denoiser model.
//!
//! A backend knows whether its provider can run on this machine and how to
//! open a session for a model file. The [`ProviderRegistry`] walks the
//! provider fallback order and the model candidate list and keeps the first
//! session that opens.

mod model;
mod onnx;
mod provider;
mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use model::{
    bundle_parent, resolve_input_shape, ModelLocator, DEFAULT_MODEL_BASE, DML_DEVICE_ENV,
    MODEL_DIR_ENV, QNN_BACKEND_ENV,
};
pub use onnx::{runtime_available, OnnxBackend};
pub use provider::{Provider, AUTO_ORDER};
pub use registry::{OpenedSession, ProviderRegistry};

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Samples per model frame
pub const MODEL_FRAME_SIZE: usize = 480;

/// Sample rate the model runs at
pub const MODEL_SAMPLE_RATE: f64 = 48000.0;

/// Errors raised while opening or running an inference session
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Provider not available: {0}")]
    ProviderUnavailable(Provider),

    #[error("Model not found at {0:?}")]
    ModelNotFound(PathBuf),

    #[error("Failed to create session: {0}")]
    SessionCreation(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Unsupported tensor shape: {0}")]
    Shape(String),

    #[error("ONNX support not enabled")]
    FeatureNotEnabled,
}

/// Graph optimization applied when a session is built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizationLevel {
    #[default]
    Basic,
    Extended,
}

/// Options passed to [`InferenceBackend::create_session`]
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Samples per inference frame
    pub frame_size: usize,
    /// Accelerator index for DirectML, CUDA and ROCm. Negative means default.
    pub device_id: i32,
    /// QNN backend library
    pub backend_path: Option<PathBuf>,
    pub optimization: OptimizationLevel,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            frame_size: MODEL_FRAME_SIZE,
            device_id: -1,
            backend_path: None,
            optimization: OptimizationLevel::Basic,
        }
    }
}

/// A loaded model bound to one provider
pub trait InferenceSession: Send {
    /// Shape fed to the model for every frame
    fn input_shape(&self) -> &[i64];

    /// Run one frame.
    ///
    /// `output` receives as many samples as the model produced, up to its
    /// length; the remainder is zeroed.
    fn run(&mut self, input: &[f32], output: &mut [f32]) -> Result<(), InferenceError>;
}

/// Factory for sessions on one provider
pub trait InferenceBackend: Send + Sync {
    fn provider(&self) -> Provider;

    /// Whether this provider can be used in the current build and platform
    fn probe(&self) -> bool;

    fn create_session(
        &self,
        path: &Path,
        options: &SessionOptions,
    ) -> Result<Box<dyn InferenceSession>, InferenceError>;
}
