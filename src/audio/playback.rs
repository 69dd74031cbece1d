//! Real-time denoised playback through an output device.

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, SampleFormat, SampleRate, Stream, StreamConfig};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use super::buffer::AudioBuffer;
use crate::denoise::StreamingDenoiser;

/// Block size the denoiser is prepared for; larger callbacks grow it
const EXPECTED_BLOCK_SIZE: usize = 4096;

/// Output device information
#[derive(Debug, Clone)]
pub struct OutputDevice {
    pub name: String,
    pub is_default: bool,
}

/// List available output devices
pub fn list_output_devices() -> Result<Vec<OutputDevice>> {
    let host = cpal::default_host();
    let default_name = host
        .default_output_device()
        .and_then(|d| d.name().ok())
        .unwrap_or_default();

    let mut devices = Vec::new();
    for device in host
        .output_devices()
        .context("Failed to enumerate output devices")?
    {
        if let Ok(name) = device.name() {
            devices.push(OutputDevice {
                is_default: name == default_name,
                name,
            });
        }
    }
    Ok(devices)
}

/// Get an output device by name, or the default one
pub fn get_output_device(name: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();
    match name {
        Some(name) if name != "default" => {
            for device in host
                .output_devices()
                .context("Failed to enumerate output devices")?
            {
                if device.name().is_ok_and(|n| n == name) {
                    return Ok(device);
                }
            }
            anyhow::bail!("Output device not found: {}", name);
        }
        _ => host
            .default_output_device()
            .context("No default output device available"),
    }
}

/// Find an output configuration matching the source channel count and rate
pub fn select_output_config(
    device: &Device,
    channels: u16,
    sample_rate: u32,
) -> Result<(StreamConfig, SampleFormat)> {
    let supported = device
        .supported_output_configs()
        .context("Failed to query output configs")?;

    let mut fallback = None;
    for range in supported {
        if range.channels() != channels
            || range.min_sample_rate().0 > sample_rate
            || range.max_sample_rate().0 < sample_rate
        {
            continue;
        }
        let format = range.sample_format();
        let config = range.with_sample_rate(SampleRate(sample_rate));
        match format {
            SampleFormat::F32 => return Ok((config.into(), format)),
            SampleFormat::I16 => fallback = Some((config.into(), format)),
            _ => {}
        }
    }

    fallback.with_context(|| {
        format!(
            "Device has no f32/i16 output config for {} channels at {} Hz",
            channels, sample_rate
        )
    })
}

/// Feeds a source buffer through the denoiser one callback at a time.
///
/// Callbacks are rendered in pieces of at most `max_frames`, so nothing is
/// allocated on the audio thread once the engine is built.
pub struct PlaybackEngine {
    source: AudioBuffer,
    scratch: AudioBuffer,
    /// Interleaved f32 staging for integer output formats
    staging: Vec<f32>,
    denoiser: StreamingDenoiser,
    mix: f32,
    max_frames: usize,
    position: Arc<AtomicUsize>,
    /// Source length plus the denoiser latency
    end: usize,
}

impl PlaybackEngine {
    pub fn new(source: AudioBuffer, denoiser: StreamingDenoiser, mix: f32) -> Self {
        Self::with_block_size(source, denoiser, mix, EXPECTED_BLOCK_SIZE)
    }

    pub fn with_block_size(
        source: AudioBuffer,
        denoiser: StreamingDenoiser,
        mix: f32,
        max_frames: usize,
    ) -> Self {
        let max_frames = max_frames.max(1);
        let channels = source.num_channels();
        let end = source.num_samples() + denoiser.latency_samples();
        Self {
            scratch: AudioBuffer::with_capacity(channels, 0, max_frames),
            staging: vec![0.0; max_frames * channels],
            source,
            denoiser,
            mix,
            max_frames,
            position: Arc::new(AtomicUsize::new(0)),
            end,
        }
    }

    /// Shared playback position in frames
    pub fn position(&self) -> Arc<AtomicUsize> {
        self.position.clone()
    }

    fn is_done(&self) -> bool {
        self.position.load(Ordering::Relaxed) >= self.end
    }

    /// Fill an interleaved output block. Returns `true` once the source and
    /// the denoiser tail have been played.
    pub fn render(&mut self, out: &mut [f32]) -> bool {
        let channels = self.source.num_channels();
        if channels == 0 {
            out.fill(0.0);
            return true;
        }

        for piece in out.chunks_mut(self.max_frames * channels) {
            self.render_piece(piece);
        }
        self.is_done()
    }

    /// Integer-format counterpart of [`render`](Self::render)
    pub fn render_i16(&mut self, out: &mut [i16]) -> bool {
        if self.staging.is_empty() {
            out.fill(0);
            return true;
        }

        let mut staging = std::mem::take(&mut self.staging);
        for piece in out.chunks_mut(staging.len()) {
            let staged = &mut staging[..piece.len()];
            self.render_piece(staged);
            for (out, sample) in piece.iter_mut().zip(staged.iter()) {
                *out = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            }
        }
        self.staging = staging;
        self.is_done()
    }

    /// Render at most `max_frames` interleaved frames
    fn render_piece(&mut self, out: &mut [f32]) {
        let channels = self.source.num_channels();
        let frames = out.len() / channels;
        let start = self.position.load(Ordering::Relaxed);
        self.scratch.set_num_samples(frames);

        let available = self.source.num_samples().saturating_sub(start).min(frames);
        for ch in 0..channels {
            let dest = self.scratch.channel_mut(ch);
            dest[..available].copy_from_slice(&self.source.channel(ch)[start..start + available]);
            dest[available..].fill(0.0);
        }

        self.denoiser.process_block(&mut self.scratch, self.mix);

        for (i, frame) in out.chunks_exact_mut(channels).enumerate() {
            for (ch, sample) in frame.iter_mut().enumerate() {
                *sample = self.scratch.channel(ch)[i];
            }
        }

        self.position.store(start + frames, Ordering::Relaxed);
    }
}

/// Playback stream handle
pub struct Playback {
    stream: Stream,
    sample_rate: u32,
    channels: u16,
    total_frames: usize,
    position: Arc<AtomicUsize>,
    finished: Arc<AtomicBool>,
}

impl Playback {
    /// Build a paused output stream that plays `source` through `denoiser`.
    ///
    /// The denoiser is prepared for the stream configuration here.
    pub fn new(
        device: &Device,
        source: AudioBuffer,
        sample_rate: u32,
        mut denoiser: StreamingDenoiser,
        mix: f32,
    ) -> Result<Self> {
        let channels = source.num_channels() as u16;
        let (config, sample_format) = select_output_config(device, channels, sample_rate)?;

        let max_frames = match config.buffer_size {
            BufferSize::Fixed(frames) => (frames as usize).max(EXPECTED_BLOCK_SIZE),
            BufferSize::Default => EXPECTED_BLOCK_SIZE,
        };
        denoiser
            .prepare(sample_rate as f64, source.num_channels(), max_frames)
            .context("Failed to prepare denoiser")?;

        info!(
            "Building output stream: {} Hz, {} channels, format {:?}, provider {:?}",
            sample_rate,
            channels,
            sample_format,
            denoiser.active_provider()
        );

        let total_frames = source.num_samples();
        let mut engine = PlaybackEngine::with_block_size(source, denoiser, mix, max_frames);
        let position = engine.position();
        let finished = Arc::new(AtomicBool::new(false));
        let finished_flag = finished.clone();

        let error_callback = |err| {
            error!("Audio stream error: {}", err);
        };

        let stream = match sample_format {
            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _| {
                    if engine.render(data) {
                        finished_flag.store(true, Ordering::Relaxed);
                    }
                },
                error_callback,
                None,
            ),
            SampleFormat::I16 => device.build_output_stream(
                &config,
                move |data: &mut [i16], _| {
                    if engine.render_i16(data) {
                        finished_flag.store(true, Ordering::Relaxed);
                    }
                },
                error_callback,
                None,
            ),
            _ => anyhow::bail!("Unsupported sample format: {:?}", sample_format),
        }
        .context("Failed to build output stream")?;

        Ok(Self {
            stream,
            sample_rate,
            channels,
            total_frames,
            position,
            finished,
        })
    }

    pub fn start(&self) -> Result<()> {
        self.stream.play().context("Failed to start audio stream")?;
        info!("Playback started");
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.stream.pause().context("Failed to stop audio stream")?;
        debug!("Playback stopped");
        Ok(())
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Fraction of the source played, 0 to 1
    pub fn progress(&self) -> f64 {
        if self.total_frames == 0 {
            return 1.0;
        }
        (self.position.load(Ordering::Relaxed) as f64 / self.total_frames as f64).min(1.0)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }
}
