use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::onnx::OnnxBackend;
use super::{InferenceBackend, InferenceSession, Provider, SessionOptions};

/// A session together with where it came from
pub struct OpenedSession {
    pub session: Box<dyn InferenceSession>,
    pub provider: Provider,
    pub model_path: PathBuf,
}

/// Table of inference backends, one per provider
pub struct ProviderRegistry {
    backends: Vec<Box<dyn InferenceBackend>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::onnx()
    }
}

impl ProviderRegistry {
    /// ONNX Runtime backends for every provider
    pub fn onnx() -> Self {
        Self::with_backends(
            Provider::all()
                .iter()
                .map(|&p| Box::new(OnnxBackend::new(p)) as Box<dyn InferenceBackend>)
                .collect(),
        )
    }

    pub fn with_backends(backends: Vec<Box<dyn InferenceBackend>>) -> Self {
        Self { backends }
    }

    pub fn backend(&self, provider: Provider) -> Option<&dyn InferenceBackend> {
        self.backends
            .iter()
            .find(|b| b.provider() == provider)
            .map(|b| b.as_ref())
    }

    /// Registered providers whose probe succeeds, in auto order
    pub fn available(&self) -> Vec<Provider> {
        Provider::all()
            .iter()
            .copied()
            .filter(|&p| self.backend(p).is_some_and(|b| b.probe()))
            .collect()
    }

    /// Providers to try for a preference, skipping unregistered and unavailable ones
    pub fn candidates(&self, preferred: Provider, allow_fallback: bool) -> Vec<Provider> {
        Provider::fallback_order(preferred, allow_fallback)
            .into_iter()
            .filter(|&p| match self.backend(p) {
                Some(backend) if backend.probe() => true,
                Some(_) => {
                    debug!("Provider {} not available, skipping", p);
                    false
                }
                None => false,
            })
            .collect()
    }

    /// Open the first session that works.
    ///
    /// Model files are tried in order; for each existing file every
    /// candidate provider is tried in fallback order.
    pub fn open(
        &self,
        models: &[PathBuf],
        preferred: Provider,
        allow_fallback: bool,
        options: &SessionOptions,
    ) -> Option<OpenedSession> {
        let providers = self.candidates(preferred, allow_fallback);
        if providers.is_empty() {
            warn!(
                "No usable inference provider for preference {} (fallback: {})",
                preferred, allow_fallback
            );
            return None;
        }

        for model in models.iter().filter(|p| p.is_file()) {
            if let Some(opened) = self.open_model(model, &providers, options) {
                return Some(opened);
            }
        }

        warn!("No inference session could be created, running in passthrough");
        None
    }

    fn open_model(
        &self,
        model: &Path,
        providers: &[Provider],
        options: &SessionOptions,
    ) -> Option<OpenedSession> {
        for &provider in providers {
            let Some(backend) = self.backend(provider) else {
                continue;
            };

            debug!("Trying {} with {:?}", provider, model);
            match backend.create_session(model, options) {
                Ok(session) => {
                    info!("Using inference provider {} for {:?}", provider, model);
                    return Some(OpenedSession {
                        session,
                        provider,
                        model_path: model.to_path_buf(),
                    });
                }
                Err(e) => warn!("Provider {} failed for {:?}: {}", provider, model, e),
            }
        }
        None
    }
}
