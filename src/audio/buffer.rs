/// Planar multi-channel f32 audio buffer.
///
/// Every channel has the same length. The active length can be changed with
/// [`AudioBuffer::set_num_samples`] without reallocating as long as it stays
/// within the reserved capacity, which is what the real-time paths rely on.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AudioBuffer {
    channels: Vec<Vec<f32>>,
    num_samples: usize,
}

impl AudioBuffer {
    /// Create a zeroed buffer
    pub fn new(num_channels: usize, num_samples: usize) -> Self {
        Self {
            channels: vec![vec![0.0; num_samples]; num_channels],
            num_samples,
        }
    }

    /// Create a zeroed buffer with room for `capacity` samples per channel
    pub fn with_capacity(num_channels: usize, num_samples: usize, capacity: usize) -> Self {
        let channels = (0..num_channels)
            .map(|_| {
                let mut data = Vec::with_capacity(capacity.max(num_samples));
                data.resize(num_samples, 0.0);
                data
            })
            .collect();
        Self {
            channels,
            num_samples,
        }
    }

    /// Build from per-channel sample vectors.
    ///
    /// Returns `None` if the channels have different lengths.
    pub fn from_channels(channels: Vec<Vec<f32>>) -> Option<Self> {
        let num_samples = channels.first().map_or(0, Vec::len);
        if channels.iter().any(|c| c.len() != num_samples) {
            return None;
        }
        Some(Self {
            channels,
            num_samples,
        })
    }

    /// Deinterleave frames of `num_channels` samples
    pub fn from_interleaved(data: &[f32], num_channels: usize) -> Self {
        if num_channels == 0 {
            return Self::default();
        }
        let num_samples = data.len() / num_channels;
        let mut buffer = Self::new(num_channels, num_samples);
        for (i, frame) in data.chunks_exact(num_channels).enumerate() {
            for (ch, sample) in frame.iter().enumerate() {
                buffer.channels[ch][i] = *sample;
            }
        }
        buffer
    }

    /// Interleave into a single vector
    pub fn to_interleaved(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.num_samples * self.channels.len());
        for i in 0..self.num_samples {
            for channel in &self.channels {
                out.push(channel[i]);
            }
        }
        out
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples == 0 || self.channels.is_empty()
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        &mut self.channels[index]
    }

    pub fn channels(&self) -> impl Iterator<Item = &[f32]> {
        self.channels.iter().map(Vec::as_slice)
    }

    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut [f32]> {
        self.channels.iter_mut().map(Vec::as_mut_slice)
    }

    /// Change the active length of every channel, zero-filling new samples
    pub fn set_num_samples(&mut self, num_samples: usize) {
        for channel in &mut self.channels {
            channel.resize(num_samples, 0.0);
        }
        self.num_samples = num_samples;
    }

    /// Zero every sample
    pub fn clear(&mut self) {
        for channel in &mut self.channels {
            channel.fill(0.0);
        }
    }
}
