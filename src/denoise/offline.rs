use tracing::debug;

use super::StreamingDenoiser;
use crate::audio::AudioBuffer;

/// Run a whole buffer through a prepared denoiser in host-sized blocks.
///
/// The output has the input's length. When a model session is active the
/// pipeline delay is removed by feeding trailing silence and dropping the
/// first `latency_samples()` output samples.
pub fn render_offline(
    denoiser: &mut StreamingDenoiser,
    input: &AudioBuffer,
    block_size: usize,
    mix: f32,
) -> AudioBuffer {
    let channels = input.num_channels();
    let len = input.num_samples();
    let block_size = block_size.max(1);
    let latency = if denoiser.is_ready() {
        denoiser.latency_samples()
    } else {
        0
    };
    debug!(
        "Offline render: {} samples, block {}, latency {}",
        len, block_size, latency
    );

    let mut output = AudioBuffer::new(channels, len);
    let mut block = AudioBuffer::with_capacity(channels, 0, block_size);
    let total = len + latency;
    let mut position = 0;

    while position < total {
        let frames = block_size.min(total - position);
        block.set_num_samples(frames);

        let available = len.saturating_sub(position).min(frames);
        for ch in 0..channels {
            let dest = block.channel_mut(ch);
            dest[..available].copy_from_slice(&input.channel(ch)[position..position + available]);
            dest[available..].fill(0.0);
        }

        denoiser.process_block(&mut block, mix);

        // Block sample i lands at output index position + i - latency
        if position + frames <= latency {
            position += frames;
            continue;
        }
        let skip = latency.saturating_sub(position);
        let out_start = position + skip - latency;
        let count = (frames - skip).min(len.saturating_sub(out_start));
        for ch in 0..channels {
            output.channel_mut(ch)[out_start..out_start + count]
                .copy_from_slice(&block.channel(ch)[skip..skip + count]);
        }

        position += frames;
    }

    output
}
