//! Real-time neural denoising.
//!
//! [`StreamingDenoiser`] adapts host audio callbacks of any block size and
//! sample rate to a model that consumes 480-sample frames at 48 kHz.

mod channel;
mod denoiser;
mod offline;

pub use denoiser::StreamingDenoiser;
pub use offline::render_offline;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::inference::Provider;

/// Errors raised while preparing the denoiser
#[derive(Debug, Error)]
pub enum DenoiseError {
    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(f64),

    #[error("Failed to create resampler: {0}")]
    Resampler(String),
}

/// User-facing denoiser configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DenoiseSettings {
    /// Preferred inference provider
    pub provider: Provider,
    /// Try other providers when the preferred one fails
    pub allow_fallback: bool,
    /// Accelerator index; negative picks the default
    pub device_id: i32,
    /// QNN backend library
    pub backend_path: Option<PathBuf>,
    /// Model file tried before the search path
    pub model_path: Option<PathBuf>,
}

impl Default for DenoiseSettings {
    fn default() -> Self {
        Self {
            provider: Provider::Auto,
            allow_fallback: true,
            device_id: -1,
            backend_path: None,
            model_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = DenoiseSettings::default();
        assert_eq!(settings.provider, Provider::Auto);
        assert!(settings.allow_fallback);
        assert_eq!(settings.device_id, -1);
        assert!(settings.model_path.is_none());
    }

    #[test]
    fn test_settings_fill_missing_fields() {
        let settings: DenoiseSettings = serde_json::from_str(r#"{"provider": "cuda"}"#).unwrap();
        assert_eq!(settings.provider, Provider::Cuda);
        assert!(settings.allow_fallback);
        assert_eq!(settings.device_id, -1);
    }
}
