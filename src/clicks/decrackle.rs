//! Whole-buffer crackle smoothing.
//!
//! Crackle is dense low-level impulse noise that the click detector's
//! region logic handles poorly. Every sample whose second difference exceeds
//! `factor` times the channel's mean absolute first difference is replaced
//! by a running local average, and its neighbours are pulled halfway toward
//! theirs.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audio::AudioBuffer;

pub const MIN_FACTOR: f32 = 0.01;
pub const MAX_FACTOR: f32 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Decrackler {
    /// Detection threshold relative to the mean absolute difference (0.01 to 1)
    pub factor: f32,
    /// Averaging half-width in samples (1 to 10)
    pub average_width: usize,
}

impl Default for Decrackler {
    fn default() -> Self {
        Self {
            factor: 0.2,
            average_width: 3,
        }
    }
}

impl Decrackler {
    pub fn new(factor: f32, average_width: usize) -> Self {
        let factor = if factor.is_finite() {
            factor.clamp(MIN_FACTOR, MAX_FACTOR)
        } else {
            Self::default().factor
        };
        Self {
            factor,
            average_width: average_width.clamp(1, 10),
        }
    }

    /// Smooth every channel in place. Returns the number of flagged samples.
    pub fn process(&self, buffer: &mut AudioBuffer) -> usize {
        let len = buffer.num_samples();
        if len < 3 || buffer.num_channels() == 0 {
            return 0;
        }

        let width = self.average_width.clamp(1, 10).min(len / 2);
        let mut flags = vec![false; len];
        let mut flagged_total = 0;

        for data in buffer.channels_mut() {
            let mean_delta = data
                .windows(2)
                .map(|w| (w[1] - w[0]).abs() as f64)
                .sum::<f64>()
                / (len - 1) as f64;
            let threshold = self.factor * mean_delta as f32;

            flags.fill(false);
            for i in 1..len - 1 {
                let second = data[i + 1] - 2.0 * data[i] + data[i - 1];
                if second.abs() > threshold {
                    flags[i] = true;
                    flagged_total += 1;
                }
            }

            // Averages read already-smoothed samples to the left
            for i in 0..len {
                let near = flags[i]
                    || (i > 0 && flags[i - 1])
                    || (i + 1 < len && flags[i + 1]);
                if !near {
                    continue;
                }
                let lo = i.saturating_sub(width);
                let hi = (i + width).min(len - 1);
                let mean = data[lo..=hi].iter().sum::<f32>() / (hi - lo + 1) as f32;
                data[i] = if flags[i] { mean } else { 0.5 * (data[i] + mean) };
            }
        }

        debug!(
            "Decrackle flagged {} samples (factor {}, width {})",
            flagged_total, self.factor, width
        );
        flagged_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_clamps_parameters() {
        let decrackler = Decrackler::new(5.0, 0);
        assert_eq!(decrackler.factor, MAX_FACTOR);
        assert_eq!(decrackler.average_width, 1);

        let decrackler = Decrackler::new(f32::NAN, 40);
        assert_eq!(decrackler.factor, 0.2);
        assert_eq!(decrackler.average_width, 10);
    }

    #[test]
    fn test_linear_ramp_is_untouched() {
        let ramp: Vec<f32> = (0..256).map(|i| i as f32 / 256.0).collect();
        let mut buffer = AudioBuffer::from_channels(vec![ramp.clone()]).unwrap();
        assert_eq!(Decrackler::default().process(&mut buffer), 0);
        assert_eq!(buffer.channel(0), ramp.as_slice());
    }

    #[test]
    fn test_impulse_is_smoothed() {
        let mut data = vec![0.0f32; 64];
        data[32] = 1.0;
        let mut buffer = AudioBuffer::from_channels(vec![data]).unwrap();

        let flagged = Decrackler::new(1.0, 3).process(&mut buffer);
        assert!(flagged > 0);
        assert!(buffer.channel(0)[32] < 0.5);
        // far from the impulse nothing moves
        assert_eq!(buffer.channel(0)[0], 0.0);
        assert_eq!(buffer.channel(0)[63], 0.0);
    }

    #[test]
    fn test_short_buffer_is_ignored() {
        let mut buffer = AudioBuffer::from_channels(vec![vec![1.0, -1.0]]).unwrap();
        assert_eq!(Decrackler::default().process(&mut buffer), 0);
        assert_eq!(buffer.channel(0), &[1.0, -1.0]);
    }
}
