//! Restoration core for vinyl and tape transfers.
//!
//! - [`denoise`]: streaming neural denoiser bridging host callbacks to a
//!   480-sample, 48 kHz model
//! - [`inference`]: execution provider selection and model sessions
//! - [`clicks`]: click detection, repair and decrackling
//! - [`audio`]: buffers, resampling, WAV I/O and playback

pub mod audio;
pub mod clicks;
pub mod config;
pub mod denoise;
pub mod inference;

pub use audio::{AudioBuffer, RingBuffer, StreamResampler};
pub use clicks::{ClickInfo, ClickProcessor, ClickRemover, ClickSettings, RepairMethod};
pub use config::Config;
pub use denoise::{DenoiseSettings, StreamingDenoiser};
pub use inference::{InferenceError, Provider, ProviderRegistry};
