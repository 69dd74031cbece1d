use anyhow::{Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;
use tracing::debug;

use super::buffer::AudioBuffer;

/// Read a WAV file into a planar buffer, returning it with its sample rate
pub fn read_wav(path: &Path) -> Result<(AudioBuffer, u32)> {
    let reader =
        WavReader::open(path).with_context(|| format!("Failed to open WAV file {:?}", path))?;
    let spec = reader.spec();
    let channels = spec.channels as usize;

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .context("Failed to read float samples")?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .context("Failed to read integer samples")?
        }
    };

    let buffer = AudioBuffer::from_interleaved(&samples, channels);
    debug!(
        "Read {:?}: {} Hz, {} channels, {} samples",
        path,
        spec.sample_rate,
        buffer.num_channels(),
        buffer.num_samples()
    );
    Ok((buffer, spec.sample_rate))
}

/// Write a buffer as 32-bit float WAV
pub fn write_wav(path: &Path, buffer: &AudioBuffer, sample_rate: u32) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let spec = WavSpec {
        channels: buffer.num_channels() as u16,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer =
        WavWriter::create(path, spec).with_context(|| format!("Failed to create {:?}", path))?;

    for sample in buffer.to_interleaved() {
        writer.write_sample(sample).context("Failed to write sample")?;
    }
    writer.finalize().context("Failed to finalize WAV file")?;
    Ok(())
}
