use rubato::{ResampleError, ResamplerConstructionError};

use crate::audio::{RingBuffer, StreamResampler};
use crate::inference::{InferenceSession, MODEL_FRAME_SIZE, MODEL_SAMPLE_RATE};

/// Frames of silence queued ahead of the model output
pub(crate) const PRIMING_FRAMES: usize = 2;

/// Model-rate FIFO capacity per direction
const FIFO_CAPACITY: usize = MODEL_FRAME_SIZE * 32;

/// Upper bound on output chunk pulls per block
const MAX_PULLS_PER_BLOCK: usize = 256;

/// Per-channel streaming state
pub(crate) struct ChannelState {
    resampler_in: StreamResampler,
    resampler_out: StreamResampler,
    input_fifo: RingBuffer,
    output_fifo: RingBuffer,
    /// Resampled-back samples waiting to be handed to the host
    host_fifo: RingBuffer,
    dry: Vec<f32>,
    model_scratch: Vec<f32>,
    frame_in: Vec<f32>,
    frame_out: Vec<f32>,
}

impl ChannelState {
    pub fn new(host_rate: f64, max_block_size: usize) -> Result<Self, ResamplerConstructionError> {
        let mut state = Self {
            resampler_in: StreamResampler::new(host_rate, MODEL_SAMPLE_RATE)?,
            resampler_out: StreamResampler::new(MODEL_SAMPLE_RATE, host_rate)?,
            input_fifo: RingBuffer::new(FIFO_CAPACITY),
            output_fifo: RingBuffer::new(FIFO_CAPACITY),
            host_fifo: RingBuffer::new(1),
            dry: Vec::new(),
            model_scratch: Vec::new(),
            frame_in: vec![0.0; MODEL_FRAME_SIZE],
            frame_out: vec![0.0; MODEL_FRAME_SIZE],
        };
        state.ensure_block_size(max_block_size);
        state.prime();
        Ok(state)
    }

    /// Grow scratch space for blocks of up to `block_size` samples
    pub fn ensure_block_size(&mut self, block_size: usize) {
        if self.dry.len() >= block_size && !self.model_scratch.is_empty() {
            return;
        }

        let block_size = block_size.max(self.dry.len());
        let chunk = self.resampler_out.input_chunk();
        let model_block = (block_size as f64 * self.resampler_out.ratio()).ceil() as usize;

        self.dry.resize(block_size, 0.0);
        self.model_scratch.resize(model_block + 2 * chunk, 0.0);

        // A block can carry more than a FIFO's worth of model-rate audio at
        // low host rates or large block sizes
        let model_capacity =
            (2 * model_block + MODEL_FRAME_SIZE * (PRIMING_FRAMES + 1)).max(FIFO_CAPACITY);
        grow(&mut self.input_fifo, model_capacity);
        grow(&mut self.output_fifo, model_capacity);
        grow(&mut self.host_fifo, 2 * block_size + 4 * chunk + FIFO_CAPACITY);
    }

    /// Clear history and buffered audio without reallocating
    pub fn reset(&mut self) {
        self.resampler_in.reset();
        self.resampler_out.reset();
        self.input_fifo.clear();
        self.output_fifo.clear();
        self.host_fifo.clear();
        self.prime();
    }

    fn prime(&mut self) {
        self.output_fifo.push_silence(PRIMING_FRAMES * MODEL_FRAME_SIZE);
    }

    /// Denoise `data` in place and blend it with the dry signal.
    ///
    /// Returns the number of frames whose inference failed and were passed
    /// through. On a resampler error the block is restored to its dry input.
    pub fn process(
        &mut self,
        data: &mut [f32],
        mix: f32,
        session: &mut dyn InferenceSession,
    ) -> Result<usize, ResampleError> {
        let n = data.len();
        self.ensure_block_size(n);
        self.dry[..n].copy_from_slice(data);

        let failed = match self.run(data, session) {
            Ok(failed) => failed,
            Err(e) => {
                data.copy_from_slice(&self.dry[..n]);
                return Err(e);
            }
        };

        if mix < 1.0 {
            let dry_mix = 1.0 - mix;
            for (out, dry) in data.iter_mut().zip(&self.dry[..n]) {
                *out = dry * dry_mix + *out * mix;
            }
        }

        Ok(failed)
    }

    fn run(
        &mut self,
        data: &mut [f32],
        session: &mut dyn InferenceSession,
    ) -> Result<usize, ResampleError> {
        self.resampler_in.process(data, &mut self.input_fifo)?;

        let mut failed = 0;
        while self.input_fifo.available() >= MODEL_FRAME_SIZE {
            self.input_fifo.pop(&mut self.frame_in, false);
            match session.run(&self.frame_in, &mut self.frame_out) {
                Ok(()) => self.output_fifo.push(&self.frame_out),
                Err(_) => {
                    self.output_fifo.push(&self.frame_in);
                    failed += 1;
                }
            }
        }

        let n = data.len();
        let ratio = self.resampler_out.ratio();
        let chunk = self.resampler_out.input_chunk();
        let mut pulls = 0;
        while self.host_fifo.available() < n && pulls < MAX_PULLS_PER_BLOCK {
            let missing = n - self.host_fifo.available();
            let wanted = ((missing as f64 * ratio).ceil() as usize)
                .saturating_sub(self.resampler_out.staged())
                .max(1);
            let required = wanted
                .div_ceil(chunk)
                .saturating_mul(chunk)
                .min(self.model_scratch.len());

            let scratch = &mut self.model_scratch[..required];
            self.output_fifo.pop(scratch, true);
            self.resampler_out.process(scratch, &mut self.host_fifo)?;
            pulls += 1;
        }

        self.host_fifo.pop(data, true);
        Ok(failed)
    }
}

/// Reallocate `fifo` to at least `capacity`, keeping queued samples
fn grow(fifo: &mut RingBuffer, capacity: usize) {
    if fifo.capacity() >= capacity {
        return;
    }
    let mut grown = RingBuffer::new(capacity);
    let mut pending = vec![0.0; fifo.available()];
    fifo.pop(&mut pending, false);
    grown.push(&pending);
    *fifo = grown;
}
