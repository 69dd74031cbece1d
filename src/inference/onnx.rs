//! ONNX Runtime backends.
//!
//! One [`OnnxBackend`] per provider. CPU is available whenever the `onnx`
//! feature is on; accelerators also need their own cargo feature (and, for
//! DirectML and CoreML, the matching platform).

#[cfg(feature = "onnx")]
use ort::{
    execution_providers::{
        CUDAExecutionProvider, CoreMLExecutionProvider, DirectMLExecutionProvider,
        ExecutionProviderDispatch, QNNExecutionProvider, ROCmExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
    value::Value,
};
#[cfg(feature = "onnx")]
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
#[cfg(feature = "onnx")]
use std::sync::OnceLock;
#[cfg(feature = "onnx")]
use tracing::{debug, info, warn};

#[cfg(feature = "onnx")]
use super::model::resolve_input_shape;
use super::model::{DML_DEVICE_ENV, QNN_BACKEND_ENV};
#[cfg(feature = "onnx")]
use super::OptimizationLevel;
use super::{InferenceBackend, InferenceError, InferenceSession, Provider, SessionOptions};

/// ONNX Runtime session factory for one provider
#[derive(Debug, Clone, Copy)]
pub struct OnnxBackend {
    provider: Provider,
}

impl OnnxBackend {
    pub fn new(provider: Provider) -> Self {
        Self { provider }
    }
}

/// Whether the ONNX Runtime library loads in this process. Checked once.
///
/// With dynamic loading a missing library panics inside `ort`, so the first
/// load is isolated and every later call reuses its outcome.
#[cfg(feature = "onnx")]
pub fn runtime_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        let loaded = catch_unwind(AssertUnwindSafe(|| {
            let _ = ort::init().with_name("vinyl-restore").commit();
        }));
        match loaded {
            Ok(()) => {
                debug!("ONNX Runtime loaded");
                true
            }
            Err(_) => {
                warn!("ONNX Runtime library could not be loaded, ONNX providers disabled");
                false
            }
        }
    })
}

#[cfg(not(feature = "onnx"))]
pub fn runtime_available() -> bool {
    false
}

/// DirectML adapter to use: the configured one, or the environment's when negative
#[cfg_attr(not(feature = "onnx"), allow(dead_code))]
pub(crate) fn resolve_dml_device(configured: i32) -> i32 {
    if configured >= 0 {
        return configured;
    }
    std::env::var(DML_DEVICE_ENV)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

/// QNN backend library: the configured one, or the environment's
#[cfg_attr(not(feature = "onnx"), allow(dead_code))]
pub(crate) fn resolve_qnn_backend(configured: Option<&Path>) -> Option<PathBuf> {
    configured
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(QNN_BACKEND_ENV).map(PathBuf::from))
        .filter(|p| !p.as_os_str().is_empty())
}

impl InferenceBackend for OnnxBackend {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn probe(&self) -> bool {
        let compiled = match self.provider {
            Provider::Auto => false,
            Provider::Cpu => cfg!(feature = "onnx"),
            Provider::Qnn => cfg!(feature = "qnn"),
            Provider::DirectMl => cfg!(all(feature = "directml", windows)),
            Provider::Cuda => cfg!(feature = "cuda"),
            Provider::Rocm => cfg!(feature = "rocm"),
            Provider::CoreMl => cfg!(all(feature = "coreml", target_vendor = "apple")),
        };
        compiled && runtime_available()
    }

    #[cfg(feature = "onnx")]
    fn create_session(
        &self,
        path: &Path,
        options: &SessionOptions,
    ) -> Result<Box<dyn InferenceSession>, InferenceError> {
        if !path.is_file() {
            return Err(InferenceError::ModelNotFound(path.to_path_buf()));
        }
        if !self.probe() {
            return Err(InferenceError::ProviderUnavailable(self.provider));
        }

        let level = match options.optimization {
            OptimizationLevel::Basic => GraphOptimizationLevel::Level1,
            OptimizationLevel::Extended => GraphOptimizationLevel::Level2,
        };
        let ep = execution_provider(self.provider, options)?;

        let built = catch_unwind(AssertUnwindSafe(|| {
            let mut builder = Session::builder()
                .map_err(session_error)?
                .with_optimization_level(level)
                .map_err(session_error)?
                .with_intra_threads(1)
                .map_err(session_error)?
                .with_inter_threads(1)
                .map_err(session_error)?;

            if let Some(ep) = ep {
                debug!("Registering {} execution provider", self.provider);
                builder = builder
                    .with_execution_providers([ep])
                    .map_err(session_error)?;
            }

            builder.commit_from_file(path).map_err(session_error)
        }));
        let session = match built {
            Ok(result) => result?,
            Err(_) => {
                warn!("ONNX Runtime panicked while building a {} session", self.provider);
                return Err(InferenceError::ProviderUnavailable(self.provider));
            }
        };
        let session = OnnxSession::new(session, options.frame_size)?;

        info!(
            "ONNX session created: {:?} on {} (input shape {:?})",
            path, self.provider, session.input_shape
        );
        Ok(Box::new(session))
    }

    #[cfg(not(feature = "onnx"))]
    fn create_session(
        &self,
        _path: &Path,
        _options: &SessionOptions,
    ) -> Result<Box<dyn InferenceSession>, InferenceError> {
        Err(InferenceError::FeatureNotEnabled)
    }
}

#[cfg(feature = "onnx")]
fn session_error(e: impl std::fmt::Display) -> InferenceError {
    InferenceError::SessionCreation(e.to_string())
}

#[cfg(feature = "onnx")]
fn inference_error(e: impl std::fmt::Display) -> InferenceError {
    InferenceError::Inference(e.to_string())
}

#[cfg(feature = "onnx")]
fn execution_provider(
    provider: Provider,
    options: &SessionOptions,
) -> Result<Option<ExecutionProviderDispatch>, InferenceError> {
    let ep = match provider {
        Provider::Auto | Provider::Cpu => return Ok(None),
        Provider::Cuda => CUDAExecutionProvider::default()
            .with_device_id(options.device_id.max(0))
            .build(),
        Provider::Rocm => ROCmExecutionProvider::default()
            .with_device_id(options.device_id.max(0))
            .build(),
        Provider::DirectMl => DirectMLExecutionProvider::default()
            .with_device_id(resolve_dml_device(options.device_id))
            .build(),
        Provider::Qnn => {
            let backend = resolve_qnn_backend(options.backend_path.as_deref())
                .ok_or_else(|| session_error("QNN backend path not set"))?;
            if !backend.is_file() {
                return Err(session_error(format!(
                    "QNN backend not found at {:?}",
                    backend
                )));
            }
            QNNExecutionProvider::default()
                .with_backend_path(backend.to_string_lossy())
                .build()
        }
        Provider::CoreMl => CoreMLExecutionProvider::default().build(),
    };
    Ok(Some(ep.error_on_failure()))
}

/// A committed ONNX Runtime session with one f32 input and one f32 output
#[cfg(feature = "onnx")]
struct OnnxSession {
    session: Session,
    input_name: String,
    output_name: String,
    input_shape: Vec<i64>,
}

#[cfg(feature = "onnx")]
impl OnnxSession {
    fn new(session: Session, frame_size: usize) -> Result<Self, InferenceError> {
        let input = session
            .inputs
            .first()
            .ok_or_else(|| InferenceError::Shape("model has no inputs".to_string()))?;
        let output = session
            .outputs
            .first()
            .ok_or_else(|| InferenceError::Shape("model has no outputs".to_string()))?;

        let declared: Vec<i64> = input
            .input_type
            .tensor_shape()
            .map(|shape| shape.to_vec())
            .unwrap_or_default();

        Ok(Self {
            input_name: input.name.clone(),
            output_name: output.name.clone(),
            input_shape: resolve_input_shape(&declared, frame_size),
            session,
        })
    }
}

#[cfg(feature = "onnx")]
impl InferenceSession for OnnxSession {
    fn input_shape(&self) -> &[i64] {
        &self.input_shape
    }

    fn run(&mut self, input: &[f32], output: &mut [f32]) -> Result<(), InferenceError> {
        let tensor =
            Value::from_array((self.input_shape.clone(), input.to_vec())).map_err(inference_error)?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .map_err(inference_error)?;

        let value = outputs.get(self.output_name.as_str()).ok_or_else(|| {
            InferenceError::Inference(format!("Missing '{}' output", self.output_name))
        })?;
        let (_, data) = value.try_extract_tensor::<f32>().map_err(inference_error)?;

        let copied = data.len().min(output.len());
        output[..copied].copy_from_slice(&data[..copied]);
        output[copied..].fill(0.0);
        Ok(())
    }
}
