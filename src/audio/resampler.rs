use rubato::{
    FastFixedIn, PolynomialDegree, ResampleError, Resampler, ResamplerConstructionError,
};
use tracing::debug;

use super::ring_buffer::RingBuffer;

/// Output-side frames produced per interpolator call, at most
pub const RESAMPLER_CHUNK: usize = 64;

const MIN_CHUNK: usize = 8;

/// Streaming sample-rate converter for one channel and one direction.
///
/// Accepts blocks of any length, stages them into fixed chunks for the
/// interpolator and appends converted samples to a [`RingBuffer`]. The ratio
/// is fixed at construction; a host rate change needs a new resampler.
pub struct StreamResampler {
    from_rate: f64,
    to_rate: f64,
    /// `None` when both rates match
    resampler: Option<FastFixedIn<f32>>,
    chunk: usize,
    input_buffer: Vec<Vec<f32>>,
    output_buffer: Vec<Vec<f32>>,
    staged: usize,
}

impl StreamResampler {
    /// Create a resampler converting `from_rate` Hz to `to_rate` Hz.
    ///
    /// Upsampling uses a shorter input chunk so that neither direction
    /// produces more than about [`RESAMPLER_CHUNK`] samples per call.
    pub fn new(from_rate: f64, to_rate: f64) -> Result<Self, ResamplerConstructionError> {
        let chunk = ((RESAMPLER_CHUNK as f64 * (from_rate / to_rate).min(1.0)).round() as usize)
            .clamp(MIN_CHUNK, RESAMPLER_CHUNK);

        let resampler = if from_rate == to_rate {
            None
        } else {
            debug!(
                "Creating resampler: {} Hz -> {} Hz (ratio: {:.4})",
                from_rate,
                to_rate,
                from_rate / to_rate
            );
            Some(FastFixedIn::new(
                to_rate / from_rate,
                1.0,
                PolynomialDegree::Septic,
                chunk,
                1, // one resampler per channel
            )?)
        };

        let input_buffer = vec![vec![0.0f32; chunk]; 1];
        let output_buffer = match &resampler {
            Some(r) => r.output_buffer_allocate(true),
            None => vec![Vec::new()],
        };

        Ok(Self {
            from_rate,
            to_rate,
            resampler,
            chunk,
            input_buffer,
            output_buffer,
            staged: 0,
        })
    }

    /// Source rate divided by destination rate
    pub fn ratio(&self) -> f64 {
        self.from_rate / self.to_rate
    }

    /// Number of input samples converted per interpolator call
    pub fn input_chunk(&self) -> usize {
        if self.resampler.is_some() {
            self.chunk
        } else {
            1
        }
    }

    /// Input samples waiting for a complete chunk
    pub fn staged(&self) -> usize {
        self.staged
    }

    /// Convert `input` and append the result to `sink`.
    ///
    /// Returns the number of input samples the interpolator consumed. Samples
    /// left over after the last complete chunk stay staged for the next call
    /// and are not counted.
    pub fn process(&mut self, input: &[f32], sink: &mut RingBuffer) -> Result<usize, ResampleError> {
        let Some(resampler) = self.resampler.as_mut() else {
            sink.push(input);
            return Ok(input.len());
        };

        let mut consumed = 0;
        let mut remaining = input;
        while !remaining.is_empty() {
            let take = (self.chunk - self.staged).min(remaining.len());
            self.input_buffer[0][self.staged..self.staged + take].copy_from_slice(&remaining[..take]);
            self.staged += take;
            remaining = &remaining[take..];

            if self.staged == self.chunk {
                let (used, written) =
                    resampler.process_into_buffer(&self.input_buffer, &mut self.output_buffer, None)?;
                sink.push(&self.output_buffer[0][..written]);
                consumed += used;
                self.staged = 0;
            }
        }

        Ok(consumed)
    }

    /// Clear interpolator history and staged input
    pub fn reset(&mut self) {
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
        self.staged = 0;
    }
}
