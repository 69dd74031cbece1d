//! Click region repair.
//!
//! All functions take a channel slice and a region `start..start + width`
//! inside it. Samples outside the slice are never read or written.

use super::RepairMethod;

/// Repair a region with the given (non-automatic) method
pub(crate) fn repair_region(
    data: &mut [f32],
    start: usize,
    width: usize,
    method: RepairMethod,
    averaging_width: usize,
) {
    match method {
        RepairMethod::Crossfade => crossfade(data, start, width, averaging_width),
        RepairMethod::Interpolation | RepairMethod::Automatic => interpolate(data, start, width),
    }
}

/// Replace the region with a cubic Hermite curve anchored on the samples
/// just outside it.
///
/// Tangents come from the slope beyond each anchor, or the secant between
/// the anchors where that sample is missing. A region touching one end of
/// the slice is held at the remaining anchor.
pub(crate) fn interpolate(data: &mut [f32], start: usize, width: usize) {
    let len = data.len();
    let end = (start + width).min(len);
    if start >= end {
        return;
    }

    let left = start.checked_sub(1);
    let right = (end < len).then_some(end);

    match (left, right) {
        (Some(l), Some(r)) => {
            let p0 = data[l];
            let p1 = data[r];
            let span = (r - l) as f32;
            let secant = (p1 - p0) / span;
            let m0 = if l >= 1 { p0 - data[l - 1] } else { secant };
            let m1 = if r + 1 < len { data[r + 1] - p1 } else { secant };

            for i in start..end {
                let t = (i - l) as f32 / span;
                let t2 = t * t;
                let t3 = t2 * t;
                let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
                let h10 = t3 - 2.0 * t2 + t;
                let h01 = -2.0 * t3 + 3.0 * t2;
                let h11 = t3 - t2;
                data[i] = h00 * p0 + h10 * span * m0 + h01 * p1 + h11 * span * m1;
            }
        }
        (Some(l), None) => {
            let hold = data[l];
            data[start..end].fill(hold);
        }
        (None, Some(r)) => {
            let hold = data[r];
            data[start..end].fill(hold);
        }
        (None, None) => data[start..end].fill(0.0),
    }
}

/// Mean of `data[center - half..=center + half]`, skipping the region
/// `skip` when any other sample remains in the window.
fn window_mean(data: &[f32], center: usize, half: usize, skip: (usize, usize)) -> f32 {
    let lo = center.saturating_sub(half);
    let hi = (center + half).min(data.len() - 1);

    let (mut sum, mut count) = (0.0f32, 0usize);
    for (i, sample) in data[lo..=hi].iter().enumerate() {
        let idx = lo + i;
        if idx < skip.0 || idx >= skip.1 {
            sum += sample;
            count += 1;
        }
    }
    if count == 0 {
        sum = data[lo..=hi].iter().sum();
        count = hi - lo + 1;
    }
    sum / count as f32
}

/// Replace the region with local windowed averages and pull the samples
/// bordering it halfway toward their own average.
pub(crate) fn crossfade(data: &mut [f32], start: usize, width: usize, half_width: usize) {
    let len = data.len();
    let end = (start + width).min(len);
    if start >= end {
        return;
    }

    let half = half_width.max(1);
    let first = start.saturating_sub(1);
    let last = if end < len { end } else { end - 1 };

    let means: Vec<f32> = (first..=last)
        .map(|i| window_mean(data, i, half, (start, end)))
        .collect();

    for (i, mean) in (first..=last).zip(means) {
        if (start..end).contains(&i) {
            data[i] = mean;
        } else {
            data[i] = 0.5 * (data[i] + mean);
        }
    }
}
