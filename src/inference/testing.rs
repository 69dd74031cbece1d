//! In-memory inference backend for tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{InferenceBackend, InferenceError, InferenceSession, Provider, SessionOptions};

/// Shared record of what stub backends and sessions were asked to do
#[derive(Clone, Default)]
pub struct StubLog {
    attempts: Arc<Mutex<Vec<(Provider, PathBuf)>>>,
    runs: Arc<AtomicUsize>,
    fail_runs: Arc<AtomicBool>,
}

impl StubLog {
    pub fn attempts(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn attempted_providers(&self) -> Vec<Provider> {
        self.attempts.lock().unwrap().iter().map(|(p, _)| *p).collect()
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Make every subsequent `run` fail
    pub fn set_fail_runs(&self, fail: bool) {
        self.fail_runs.store(fail, Ordering::SeqCst);
    }
}

pub struct StubBackend {
    provider: Provider,
    log: StubLog,
    available: bool,
    fail_create: bool,
    fail_for: Option<PathBuf>,
    gain: f32,
}

impl StubBackend {
    pub fn new(provider: Provider, log: StubLog) -> Self {
        Self {
            provider,
            log,
            available: true,
            fail_create: false,
            fail_for: None,
            gain: 1.0,
        }
    }

    pub fn available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    pub fn failing_create(mut self, fail: bool) -> Self {
        self.fail_create = fail;
        self
    }

    /// Fail session creation only for this model file
    pub fn failing_for(mut self, path: PathBuf) -> Self {
        self.fail_for = Some(path);
        self
    }

    /// Scale every sample the session outputs
    pub fn gain(mut self, gain: f32) -> Self {
        self.gain = gain;
        self
    }
}

impl InferenceBackend for StubBackend {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn probe(&self) -> bool {
        self.available
    }

    fn create_session(
        &self,
        path: &Path,
        options: &SessionOptions,
    ) -> Result<Box<dyn InferenceSession>, InferenceError> {
        self.log
            .attempts
            .lock()
            .unwrap()
            .push((self.provider, path.to_path_buf()));

        if self.fail_create || self.fail_for.as_deref() == Some(path) {
            return Err(InferenceError::SessionCreation("stub failure".to_string()));
        }

        Ok(Box::new(StubSession {
            shape: vec![1, options.frame_size as i64],
            gain: self.gain,
            log: self.log.clone(),
        }))
    }
}

struct StubSession {
    shape: Vec<i64>,
    gain: f32,
    log: StubLog,
}

impl InferenceSession for StubSession {
    fn input_shape(&self) -> &[i64] {
        &self.shape
    }

    fn run(&mut self, input: &[f32], output: &mut [f32]) -> Result<(), InferenceError> {
        self.log.runs.fetch_add(1, Ordering::SeqCst);
        if self.log.fail_runs.load(Ordering::SeqCst) {
            return Err(InferenceError::Inference("stub failure".to_string()));
        }
        for (out, sample) in output.iter_mut().zip(input) {
            *out = sample * self.gain;
        }
        Ok(())
    }
}
