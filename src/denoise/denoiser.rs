use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::channel::{ChannelState, PRIMING_FRAMES};
use super::{DenoiseError, DenoiseSettings};
use crate::audio::AudioBuffer;
use crate::inference::{
    InferenceSession, ModelLocator, OptimizationLevel, Provider, ProviderRegistry, SessionOptions,
    MODEL_FRAME_SIZE, MODEL_SAMPLE_RATE,
};

/// Streaming denoiser for host audio callbacks.
///
/// Each channel is resampled to 48 kHz, split into 480-sample frames, run
/// through the model, resampled back and blended with the dry input. The
/// pipeline adds a fixed latency of [`StreamingDenoiser::latency_samples`].
///
/// The model session is opened lazily: once after `prepare` and once after
/// each change to the model path or provider settings. Until a session
/// exists, blocks pass through unchanged.
pub struct StreamingDenoiser {
    registry: ProviderRegistry,
    locator: ModelLocator,
    settings: DenoiseSettings,
    enabled: bool,

    session: Option<Box<dyn InferenceSession>>,
    active_provider: Option<Provider>,
    active_model: Option<PathBuf>,
    load_attempted: bool,

    sample_rate: f64,
    max_block_size: usize,
    channels: Vec<ChannelState>,

    failed_frames: u64,
    resampler_failed: bool,
}

impl StreamingDenoiser {
    /// Denoiser backed by ONNX Runtime
    pub fn new(settings: DenoiseSettings) -> Self {
        Self::with_registry(ProviderRegistry::onnx(), settings)
    }

    pub fn with_registry(registry: ProviderRegistry, settings: DenoiseSettings) -> Self {
        Self {
            registry,
            locator: ModelLocator::new(),
            settings,
            enabled: true,
            session: None,
            active_provider: None,
            active_model: None,
            load_attempted: false,
            sample_rate: 0.0,
            max_block_size: 0,
            channels: Vec::new(),
            failed_frames: 0,
            resampler_failed: false,
        }
    }

    /// Replace where default models are searched for
    pub fn with_locator(mut self, locator: ModelLocator) -> Self {
        self.locator = locator;
        self.invalidate_session();
        self
    }

    /// Allocate per-channel state for a host configuration and try to open
    /// the model.
    pub fn prepare(
        &mut self,
        sample_rate: f64,
        num_channels: usize,
        max_block_size: usize,
    ) -> Result<(), DenoiseError> {
        if !sample_rate.is_finite() || sample_rate <= 0.0 {
            return Err(DenoiseError::InvalidSampleRate(sample_rate));
        }

        debug!(
            "Preparing denoiser: {} Hz, {} channels, max block {}",
            sample_rate, num_channels, max_block_size
        );

        self.sample_rate = sample_rate;
        self.max_block_size = max_block_size;
        self.rebuild_channels(num_channels)?;

        self.load_attempted = false;
        self.load_default_model_if_needed();
        Ok(())
    }

    fn rebuild_channels(&mut self, num_channels: usize) -> Result<(), DenoiseError> {
        self.channels = (0..num_channels)
            .map(|_| ChannelState::new(self.sample_rate, self.max_block_size))
            .collect::<Result<_, _>>()
            .map_err(|e| DenoiseError::Resampler(e.to_string()))?;
        Ok(())
    }

    /// Drop buffered audio and resampler history
    pub fn reset(&mut self) {
        for channel in &mut self.channels {
            channel.reset();
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Denoise `buffer` in place.
    ///
    /// `mix` is the wet proportion, clamped to 1; zero or below bypasses all
    /// processing.
    pub fn process_block(&mut self, buffer: &mut AudioBuffer, mix: f32) {
        if !self.enabled || mix.is_nan() || mix <= 0.0 {
            return;
        }
        if self.sample_rate <= 0.0 || buffer.is_empty() {
            return;
        }

        if buffer.num_channels() != self.channels.len() {
            debug!(
                "Channel count changed ({} -> {}), re-preparing",
                self.channels.len(),
                buffer.num_channels()
            );
            self.max_block_size = self.max_block_size.max(buffer.num_samples());
            if self.rebuild_channels(buffer.num_channels()).is_err() {
                self.channels.clear();
                return;
            }
        }

        if !self.load_default_model_if_needed() {
            return;
        }
        let Some(session) = self.session.as_deref_mut() else {
            return;
        };

        let mix = mix.min(1.0);
        self.max_block_size = self.max_block_size.max(buffer.num_samples());

        for (state, data) in self.channels.iter_mut().zip(buffer.channels_mut()) {
            match state.process(data, mix, session) {
                Ok(0) => {}
                Ok(failed) => {
                    if self.failed_frames == 0 {
                        warn!("Inference failed, passing frames through unprocessed");
                    }
                    self.failed_frames += failed as u64;
                }
                Err(e) => {
                    if !self.resampler_failed {
                        warn!("Resampler error, passing block through: {}", e);
                        self.resampler_failed = true;
                    }
                }
            }
        }
    }

    /// Open a session if none exists and no attempt has been made since the
    /// last reload trigger. Returns whether a session is ready.
    pub fn load_default_model_if_needed(&mut self) -> bool {
        if self.session.is_some() {
            return true;
        }
        if self.load_attempted {
            return false;
        }
        self.load_attempted = true;

        let candidates = self
            .locator
            .candidates(self.settings.model_path.as_deref(), self.settings.provider);
        let options = SessionOptions {
            frame_size: MODEL_FRAME_SIZE,
            device_id: self.settings.device_id,
            backend_path: self.settings.backend_path.clone(),
            optimization: OptimizationLevel::Extended,
        };

        match self.registry.open(
            &candidates,
            self.settings.provider,
            self.settings.allow_fallback,
            &options,
        ) {
            Some(opened) => {
                info!(
                    "Denoiser ready: {:?} on {}",
                    opened.model_path, opened.provider
                );
                self.session = Some(opened.session);
                self.active_provider = Some(opened.provider);
                self.active_model = Some(opened.model_path);
                true
            }
            None => {
                warn!("Denoiser has no model session, audio will pass through");
                false
            }
        }
    }

    fn invalidate_session(&mut self) {
        self.session = None;
        self.active_provider = None;
        self.active_model = None;
        self.load_attempted = false;
    }

    pub fn set_model_path(&mut self, path: impl Into<PathBuf>) {
        self.settings.model_path = Some(path.into());
        self.invalidate_session();
    }

    pub fn clear_model_path(&mut self) {
        self.settings.model_path = None;
        self.invalidate_session();
    }

    pub fn set_preferred_provider(&mut self, provider: Provider) {
        self.settings.provider = provider;
        self.invalidate_session();
    }

    pub fn set_allow_fallback(&mut self, allow: bool) {
        self.settings.allow_fallback = allow;
        self.invalidate_session();
    }

    pub fn set_device_id(&mut self, device_id: i32) {
        self.settings.device_id = device_id;
        self.invalidate_session();
    }

    pub fn set_backend_path(&mut self, path: Option<PathBuf>) {
        self.settings.backend_path = path;
        self.invalidate_session();
    }

    /// Replace all settings, reopening the session only if they changed
    pub fn apply_settings(&mut self, settings: DenoiseSettings) {
        if settings != self.settings {
            self.settings = settings;
            self.invalidate_session();
        }
    }

    /// Provider of the live session
    pub fn active_provider(&self) -> Option<Provider> {
        self.active_provider
    }

    pub fn preferred_provider(&self) -> Provider {
        self.settings.provider
    }

    pub fn is_ready(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn allow_fallback(&self) -> bool {
        self.settings.allow_fallback
    }

    pub fn device_id(&self) -> i32 {
        self.settings.device_id
    }

    pub fn backend_path(&self) -> Option<&Path> {
        self.settings.backend_path.as_deref()
    }

    /// Configured model path
    pub fn model_path(&self) -> Option<&Path> {
        self.settings.model_path.as_deref()
    }

    /// Model file the live session was opened from
    pub fn active_model_path(&self) -> Option<&Path> {
        self.active_model.as_deref()
    }

    pub fn settings(&self) -> &DenoiseSettings {
        &self.settings
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Frames passed through because inference failed
    pub fn failed_frames(&self) -> u64 {
        self.failed_frames
    }

    /// Delay the pipeline adds, in host samples
    pub fn latency_samples(&self) -> usize {
        if self.sample_rate <= 0.0 {
            return 0;
        }
        let model_latency = (PRIMING_FRAMES * MODEL_FRAME_SIZE) as f64;
        (model_latency * self.sample_rate / MODEL_SAMPLE_RATE).round() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::testing::{StubBackend, StubLog};
    use crate::inference::InferenceBackend;
    use proptest::prelude::*;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        log: StubLog,
        denoiser: StreamingDenoiser,
    }

    fn fixture(gain: f32) -> Fixture {
        let dir = TempDir::new().unwrap();
        let model = dir.path().join("rnnoise_48k.onnx");
        std::fs::write(&model, b"model").unwrap();

        let log = StubLog::default();
        let backend: Box<dyn InferenceBackend> =
            Box::new(StubBackend::new(Provider::Cpu, log.clone()).gain(gain));
        let settings = DenoiseSettings {
            model_path: Some(model),
            ..DenoiseSettings::default()
        };
        let denoiser = StreamingDenoiser::with_registry(
            ProviderRegistry::with_backends(vec![backend]),
            settings,
        )
        .with_locator(ModelLocator::with_roots(Vec::new()));

        Fixture {
            _dir: dir,
            log,
            denoiser,
        }
    }

    fn dc_buffer(channels: usize, len: usize, level: f32) -> AudioBuffer {
        AudioBuffer::from_channels(vec![vec![level; len]; channels]).unwrap()
    }

    fn assert_all_near(samples: &[f32], expected: f32, tolerance: f32) {
        for (i, s) in samples.iter().enumerate() {
            assert!(
                (s - expected).abs() <= tolerance,
                "sample {} is {}, expected {}",
                i,
                s,
                expected
            );
        }
    }

    #[test]
    fn test_denoiser_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<StreamingDenoiser>();
    }

    #[test]
    fn test_silence_stays_silent() {
        let mut f = fixture(1.0);
        f.denoiser.prepare(44100.0, 2, 512).unwrap();
        assert!(f.denoiser.is_ready());
        assert_eq!(f.denoiser.active_provider(), Some(Provider::Cpu));

        for _ in 0..50 {
            let mut buffer = AudioBuffer::new(2, 512);
            f.denoiser.process_block(&mut buffer, 1.0);
            assert_eq!(buffer.num_samples(), 512);
            assert!(buffer.channels().all(|c| c.iter().all(|s| *s == 0.0)));
        }
        assert!(f.log.runs() > 0);
    }

    #[test]
    fn test_identity_model_passes_dc_after_latency() {
        let mut f = fixture(1.0);
        f.denoiser.prepare(44100.0, 2, 512).unwrap();

        let mut last = AudioBuffer::default();
        for _ in 0..100 {
            let mut buffer = dc_buffer(2, 512, 0.25);
            f.denoiser.process_block(&mut buffer, 1.0);
            last = buffer;
        }
        assert_all_near(last.channel(0), 0.25, 1e-3);
        assert_all_near(last.channel(1), 0.25, 1e-3);
    }

    #[test]
    fn test_mix_blends_dry_and_wet() {
        let mut f = fixture(0.0);
        f.denoiser.prepare(48000.0, 1, 256).unwrap();

        for _ in 0..20 {
            let mut buffer = dc_buffer(1, 256, 0.5);
            f.denoiser.process_block(&mut buffer, 0.5);
            assert_all_near(buffer.channel(0), 0.25, 1e-6);
        }
    }

    #[test]
    fn test_mix_above_one_is_clamped() {
        let mut f = fixture(0.0);
        f.denoiser.prepare(48000.0, 1, 256).unwrap();

        let mut buffer = dc_buffer(1, 256, 0.5);
        f.denoiser.process_block(&mut buffer, 3.0);
        assert_all_near(buffer.channel(0), 0.0, 0.0);
    }

    #[test]
    fn test_zero_mix_bypasses() {
        let mut f = fixture(0.0);
        f.denoiser.prepare(44100.0, 2, 512).unwrap();

        let original = dc_buffer(2, 512, 0.3);
        for mix in [0.0, -1.0, f32::NAN] {
            let mut buffer = original.clone();
            f.denoiser.process_block(&mut buffer, mix);
            assert_eq!(buffer, original);
        }
        assert_eq!(f.log.runs(), 0);
    }

    #[test]
    fn test_disabled_is_noop() {
        let mut f = fixture(0.0);
        f.denoiser.prepare(44100.0, 1, 512).unwrap();
        f.denoiser.set_enabled(false);
        assert!(!f.denoiser.is_enabled());

        let original = dc_buffer(1, 512, 0.3);
        let mut buffer = original.clone();
        f.denoiser.process_block(&mut buffer, 1.0);
        assert_eq!(buffer, original);
        assert_eq!(f.log.runs(), 0);
    }

    #[test]
    fn test_failed_inference_passes_audio_through() {
        let mut f = fixture(0.0);
        f.denoiser.prepare(44100.0, 1, 512).unwrap();
        f.log.set_fail_runs(true);

        let mut last = AudioBuffer::default();
        for _ in 0..100 {
            let mut buffer = dc_buffer(1, 512, 0.25);
            f.denoiser.process_block(&mut buffer, 1.0);
            last = buffer;
        }
        assert!(f.denoiser.failed_frames() > 0);
        assert_eq!(f.denoiser.failed_frames(), f.log.runs() as u64);
        assert_all_near(last.channel(0), 0.25, 1e-3);
    }

    #[test]
    fn test_without_session_buffer_unchanged() {
        let log = StubLog::default();
        let backend: Box<dyn InferenceBackend> = Box::new(StubBackend::new(Provider::Cpu, log.clone()));
        let mut denoiser = StreamingDenoiser::with_registry(
            ProviderRegistry::with_backends(vec![backend]),
            DenoiseSettings::default(),
        )
        .with_locator(ModelLocator::with_roots(Vec::new()));

        denoiser.prepare(44100.0, 1, 128).unwrap();
        assert!(!denoiser.is_ready());
        assert_eq!(denoiser.active_provider(), None);

        let original = dc_buffer(1, 128, 0.7);
        let mut buffer = original.clone();
        denoiser.process_block(&mut buffer, 1.0);
        assert_eq!(buffer, original);
        assert_eq!(log.attempts(), 0);
    }

    #[test]
    fn test_load_attempted_once_per_trigger() {
        let dir = TempDir::new().unwrap();
        let model = dir.path().join("m.onnx");
        std::fs::write(&model, b"model").unwrap();

        let log = StubLog::default();
        let backend: Box<dyn InferenceBackend> =
            Box::new(StubBackend::new(Provider::Cpu, log.clone()).failing_create(true));
        let mut denoiser = StreamingDenoiser::with_registry(
            ProviderRegistry::with_backends(vec![backend]),
            DenoiseSettings::default(),
        )
        .with_locator(ModelLocator::with_roots(Vec::new()));
        denoiser.set_model_path(&model);

        denoiser.prepare(48000.0, 1, 256).unwrap();
        assert_eq!(log.attempts(), 1);

        for _ in 0..5 {
            let mut buffer = dc_buffer(1, 256, 0.1);
            denoiser.process_block(&mut buffer, 1.0);
        }
        assert!(!denoiser.load_default_model_if_needed());
        assert_eq!(log.attempts(), 1);

        denoiser.set_preferred_provider(Provider::Cpu);
        let mut buffer = dc_buffer(1, 256, 0.1);
        denoiser.process_block(&mut buffer, 1.0);
        assert_eq!(log.attempts(), 2);

        denoiser.set_allow_fallback(false);
        denoiser.set_device_id(1);
        assert!(!denoiser.load_default_model_if_needed());
        assert_eq!(log.attempts(), 3);

        denoiser.prepare(48000.0, 1, 256).unwrap();
        assert_eq!(log.attempts(), 4);
    }

    #[test]
    fn test_setters_drop_session() {
        let mut f = fixture(1.0);
        f.denoiser.prepare(48000.0, 1, 256).unwrap();
        assert!(f.denoiser.is_ready());

        f.denoiser.set_backend_path(Some(PathBuf::from("/opt/qnn/QnnHtp.dll")));
        assert!(!f.denoiser.is_ready());
        assert_eq!(f.denoiser.active_provider(), None);
        assert_eq!(
            f.denoiser.backend_path(),
            Some(Path::new("/opt/qnn/QnnHtp.dll"))
        );

        assert!(f.denoiser.load_default_model_if_needed());
        assert_eq!(f.log.attempts(), 2);

        f.denoiser.clear_model_path();
        assert!(f.denoiser.model_path().is_none());
        assert!(!f.denoiser.load_default_model_if_needed());
    }

    #[test]
    fn test_apply_unchanged_settings_keeps_session() {
        let mut f = fixture(1.0);
        f.denoiser.prepare(48000.0, 1, 256).unwrap();
        let settings = f.denoiser.settings().clone();
        f.denoiser.apply_settings(settings);
        assert!(f.denoiser.is_ready());
        assert_eq!(f.log.attempts(), 1);
    }

    #[test]
    fn test_channel_count_change_reprepares() {
        let mut f = fixture(0.0);
        f.denoiser.prepare(48000.0, 1, 256).unwrap();
        assert_eq!(f.denoiser.num_channels(), 1);

        let mut buffer = dc_buffer(2, 256, 0.5);
        f.denoiser.process_block(&mut buffer, 1.0);
        assert_eq!(f.denoiser.num_channels(), 2);
        assert_all_near(buffer.channel(0), 0.0, 0.0);
        assert_all_near(buffer.channel(1), 0.0, 0.0);
    }

    #[test]
    fn test_oversized_block_grows_scratch() {
        let mut f = fixture(1.0);
        f.denoiser.prepare(44100.0, 1, 64).unwrap();

        let mut last = AudioBuffer::default();
        for _ in 0..30 {
            let mut buffer = dc_buffer(1, 4096, 0.25);
            f.denoiser.process_block(&mut buffer, 1.0);
            assert_eq!(buffer.num_samples(), 4096);
            last = buffer;
        }
        assert_all_near(last.channel(0), 0.25, 1e-3);
    }

    #[test]
    fn test_blocks_beyond_fifo_capacity_have_no_gaps() {
        // Each block carries more than 15360 model-rate samples
        for (rate, block) in [(8000.0, 4096), (44100.0, 16384), (48000.0, 20000)] {
            let mut f = fixture(1.0);
            f.denoiser.prepare(rate, 1, block).unwrap();

            let mut last = AudioBuffer::default();
            for _ in 0..6 {
                let mut buffer = dc_buffer(1, block, 0.25);
                f.denoiser.process_block(&mut buffer, 1.0);
                assert_eq!(buffer.num_samples(), block);
                last = buffer;
            }
            assert_all_near(last.channel(0), 0.25, 1e-3);
        }
    }

    #[test]
    fn test_invalid_sample_rate_rejected() {
        let mut f = fixture(1.0);
        assert!(matches!(
            f.denoiser.prepare(0.0, 2, 512),
            Err(DenoiseError::InvalidSampleRate(_))
        ));
        assert!(f.denoiser.prepare(f64::NAN, 2, 512).is_err());
    }

    #[test]
    fn test_latency_samples() {
        let mut f = fixture(1.0);
        assert_eq!(f.denoiser.latency_samples(), 0);
        f.denoiser.prepare(48000.0, 1, 256).unwrap();
        assert_eq!(f.denoiser.latency_samples(), 960);
        f.denoiser.prepare(96000.0, 1, 256).unwrap();
        assert_eq!(f.denoiser.latency_samples(), 1920);
    }

    #[test]
    fn test_reset_restores_priming() {
        let mut f = fixture(1.0);
        f.denoiser.prepare(48000.0, 1, 480).unwrap();

        for _ in 0..10 {
            let mut buffer = dc_buffer(1, 480, 0.25);
            f.denoiser.process_block(&mut buffer, 1.0);
        }
        f.denoiser.reset();

        let mut buffer = dc_buffer(1, 480, 0.25);
        f.denoiser.process_block(&mut buffer, 1.0);
        assert_all_near(buffer.channel(0), 0.0, 0.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_steady_state_has_no_underrun(
            rate in prop::sample::select(vec![8000.0, 22050.0, 44100.0, 48000.0, 88200.0, 96000.0]),
            channels in 1usize..3,
            blocks in proptest::collection::vec(1usize..1500, 10..40),
        ) {
            let mut f = fixture(1.0);
            f.denoiser.prepare(rate, channels, 512).unwrap();

            for len in blocks {
                let mut buffer = dc_buffer(channels, len, 0.25);
                f.denoiser.process_block(&mut buffer, 1.0);
                prop_assert_eq!(buffer.num_samples(), len);
            }

            let mut last = AudioBuffer::default();
            for _ in 0..30 {
                let mut buffer = dc_buffer(channels, 256, 0.25);
                f.denoiser.process_block(&mut buffer, 1.0);
                last = buffer;
            }
            for channel in last.channels() {
                for s in channel {
                    prop_assert!((s - 0.25).abs() < 2e-3, "sample {} at {} Hz", s, rate);
                }
            }
        }
    }
}
