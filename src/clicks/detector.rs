use std::ops::Range;
use tracing::debug;

use super::repair::repair_region;
use super::{ClickInfo, ClickSettings};
use crate::audio::AudioBuffer;

/// Lowest threshold used on silent or near-silent blocks
const ABSOLUTE_THRESHOLD_FLOOR: f32 = 1e-4;

/// A flagged run inside one channel block
#[derive(Debug, Clone, Copy, PartialEq)]
struct Region {
    start: usize,
    width: usize,
    magnitude: f32,
}

/// Mean absolute first difference of a block
fn noise_floor(data: &[f32]) -> f32 {
    if data.len() < 2 {
        return 0.0;
    }
    let sum: f64 = data
        .windows(2)
        .map(|w| (w[1] - w[0]).abs() as f64)
        .sum();
    (sum / (data.len() - 1) as f64) as f32
}

/// Find click regions in one channel block.
///
/// Runs longer than `max_width` are reported at `max_width` and the rest of
/// the run is skipped.
fn find_regions(data: &[f32], multiplier: f32, max_width: usize) -> Vec<Region> {
    let mut regions = Vec::new();
    if data.len() < 3 {
        return regions;
    }

    let threshold = (noise_floor(data) * multiplier).max(ABSOLUTE_THRESHOLD_FLOOR);

    let mut run: Option<(usize, f32)> = None;
    for i in 1..data.len() - 1 {
        let second = (data[i + 1] - 2.0 * data[i] + data[i - 1]).abs();
        if second > threshold {
            run = match run {
                Some((start, peak)) => Some((start, peak.max(second))),
                None => Some((i, second)),
            };
        } else if let Some((start, peak)) = run.take() {
            regions.push(region(start, i - start, peak, threshold, max_width));
        }
    }
    if let Some((start, peak)) = run {
        regions.push(region(start, data.len() - 1 - start, peak, threshold, max_width));
    }
    regions
}

fn region(start: usize, run: usize, peak: f32, threshold: f32, max_width: usize) -> Region {
    Region {
        start,
        width: run.min(max_width),
        magnitude: (peak - threshold) / peak,
    }
}

/// Block-wise click detector with optional in-place repair
#[derive(Debug)]
pub struct ClickProcessor {
    settings: ClickSettings,
    store_detected_clicks: bool,
    apply_removal: bool,
    sample_offset: usize,
    sample_position: usize,
    detected: Vec<ClickInfo>,
    clicks_last_block: usize,
}

impl ClickProcessor {
    pub fn new(settings: &ClickSettings) -> Self {
        Self {
            settings: settings.clamped(),
            store_detected_clicks: false,
            apply_removal: true,
            sample_offset: 0,
            sample_position: 0,
            detected: Vec::new(),
            clicks_last_block: 0,
        }
    }

    pub fn settings(&self) -> &ClickSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: &ClickSettings) {
        self.settings = settings.clamped();
    }

    /// Keep every detected click for [`detected_clicks`](Self::detected_clicks)
    pub fn set_store_detected_clicks(&mut self, store: bool) {
        self.store_detected_clicks = store;
    }

    /// Repair regions as they are found; detection-only when false
    pub fn set_apply_removal(&mut self, apply: bool) {
        self.apply_removal = apply;
    }

    /// Absolute index of the first sample of the scan
    pub fn set_sample_offset(&mut self, offset: usize) {
        self.sample_offset = offset;
    }

    /// Restart position tracking and drop stored clicks
    pub fn reset_sample_position(&mut self) {
        self.sample_position = 0;
        self.detected.clear();
        self.clicks_last_block = 0;
    }

    pub fn sample_position(&self) -> usize {
        self.sample_position
    }

    pub fn detected_clicks(&self) -> &[ClickInfo] {
        &self.detected
    }

    pub fn take_detected_clicks(&mut self) -> Vec<ClickInfo> {
        std::mem::take(&mut self.detected)
    }

    pub fn clicks_last_block(&self) -> usize {
        self.clicks_last_block
    }

    /// Detect clicks in `range` of every channel, repairing them when
    /// removal is enabled. Returns the number of regions found.
    pub fn process_block(&mut self, buffer: &mut AudioBuffer, range: Range<usize>) -> usize {
        self.process_block_in(buffer, range.clone(), range)
    }

    /// Like [`process_block`](Self::process_block), but scans `window`, a
    /// superset of `block`, so clicks on the block edges see their
    /// neighbours. Only regions starting inside `block` are kept; their
    /// repair may run past the end of `block`.
    pub fn process_block_in(
        &mut self,
        buffer: &mut AudioBuffer,
        block: Range<usize>,
        window: Range<usize>,
    ) -> usize {
        let (block, window) = clamp_window(block, window, buffer.num_samples());
        let multiplier = self.settings.threshold_multiplier();
        let mut found = Vec::new();

        for (ch, data) in buffer.channels_mut().enumerate() {
            let scan = &mut data[window.clone()];
            let regions = owned_regions(scan, &block, &window, multiplier, self.settings.max_width);
            if self.apply_removal {
                for r in &regions {
                    let method = self.settings.method_for_width(r.width);
                    let start = r.start + block.start - window.start;
                    repair_region(scan, start, r.width, method, self.settings.averaging_width);
                }
            }
            found.extend(regions.into_iter().map(|r| (ch, r)));
        }

        self.finish_block(found, block.len())
    }

    /// Detection without touching the buffer
    pub fn analyze_block(&mut self, buffer: &AudioBuffer, range: Range<usize>) -> usize {
        self.analyze_block_in(buffer, range.clone(), range)
    }

    /// Detection-only counterpart of [`process_block_in`](Self::process_block_in)
    pub fn analyze_block_in(
        &mut self,
        buffer: &AudioBuffer,
        block: Range<usize>,
        window: Range<usize>,
    ) -> usize {
        let (block, window) = clamp_window(block, window, buffer.num_samples());
        let multiplier = self.settings.threshold_multiplier();
        let mut found = Vec::new();

        for (ch, data) in buffer.channels().enumerate() {
            let regions = owned_regions(
                &data[window.clone()],
                &block,
                &window,
                multiplier,
                self.settings.max_width,
            );
            found.extend(regions.into_iter().map(|r| (ch, r)));
        }

        self.finish_block(found, block.len())
    }

    fn finish_block(&mut self, mut found: Vec<(usize, Region)>, block_len: usize) -> usize {
        let count = found.len();
        if self.store_detected_clicks && count > 0 {
            found.sort_by_key(|(ch, r)| (r.start, *ch));
            let base = self.sample_offset + self.sample_position;
            self.detected
                .extend(found.into_iter().map(|(ch, r)| ClickInfo {
                    position: base + r.start,
                    magnitude: r.magnitude,
                    width: r.width,
                    is_manual: false,
                    channel: Some(ch),
                }));
        }
        self.sample_position += block_len;
        self.clicks_last_block = count;
        count
    }
}

fn clamp_range(range: Range<usize>, len: usize) -> Range<usize> {
    let end = range.end.min(len);
    range.start.min(end)..end
}

/// Clamp `block` to the buffer and widen `window` to contain it
fn clamp_window(
    block: Range<usize>,
    window: Range<usize>,
    len: usize,
) -> (Range<usize>, Range<usize>) {
    let block = clamp_range(block, len);
    let window = clamp_range(window.start.min(block.start)..window.end.max(block.end), len);
    (block, window)
}

/// Regions of `scan` (the samples of `window`) that start inside `block`,
/// with starts made relative to `block`
fn owned_regions(
    scan: &[f32],
    block: &Range<usize>,
    window: &Range<usize>,
    multiplier: f32,
    max_width: usize,
) -> Vec<Region> {
    find_regions(scan, multiplier, max_width)
        .into_iter()
        .filter_map(|r| {
            let start = window.start + r.start;
            block.contains(&start).then(|| Region {
                start: start - block.start,
                ..r
            })
        })
        .collect()
}

/// Repairs a reviewed click list without re-running detection
pub struct ClickRemover;

impl ClickRemover {
    /// Repair each click on its channel, or on every channel when it has
    /// none. Clicks outside the buffer are skipped. Returns the number
    /// repaired.
    pub fn apply(buffer: &mut AudioBuffer, clicks: &[ClickInfo], settings: &ClickSettings) -> usize {
        let settings = settings.clamped();
        let len = buffer.num_samples();
        let channels = buffer.num_channels();
        let mut repaired = 0;

        for click in clicks {
            if click.width == 0 || click.position >= len {
                continue;
            }
            let method = settings.method_for_width(click.width);
            let targets = match click.channel {
                Some(ch) if ch < channels => ch..ch + 1,
                Some(_) => continue,
                None => 0..channels,
            };
            for ch in targets {
                repair_region(
                    buffer.channel_mut(ch),
                    click.position,
                    click.width,
                    method,
                    settings.averaging_width,
                );
            }
            repaired += 1;
        }

        debug!("Repaired {} of {} clicks", repaired, clicks.len());
        repaired
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clicks::RepairMethod;
    use std::f32::consts::PI;

    pub(crate) fn sine(len: usize, freq: f32, rate: f32) -> Vec<f32> {
        (0..len)
            .map(|i| 0.5 * (2.0 * PI * freq * i as f32 / rate).sin())
            .collect()
    }

    fn detector() -> ClickProcessor {
        let mut processor = ClickProcessor::new(&ClickSettings::default());
        processor.set_store_detected_clicks(true);
        processor
    }

    #[test]
    fn test_pure_sine_has_no_clicks() {
        let mut buffer = AudioBuffer::from_channels(vec![sine(4096, 1000.0, 48000.0)]).unwrap();
        let original = buffer.clone();
        let mut processor = detector();

        assert_eq!(processor.process_block(&mut buffer, 0..4096), 0);
        assert!(processor.detected_clicks().is_empty());
        assert_eq!(buffer, original);
    }

    #[test]
    fn test_spike_is_flagged_and_repaired() {
        let mut signal = sine(2048, 1000.0, 48000.0);
        let clean = signal.clone();
        signal[1000] += 0.8;
        let mut buffer = AudioBuffer::from_channels(vec![signal]).unwrap();
        let mut processor = detector();

        assert_eq!(processor.process_block(&mut buffer, 0..2048), 1);
        let click = &processor.detected_clicks()[0];
        assert!(click.position <= 1000 && 1000 < click.position + click.width);
        assert!(click.magnitude > 0.0 && click.magnitude < 1.0);
        assert_eq!(click.channel, Some(0));
        assert!(!click.is_manual);

        assert!((buffer.channel(0)[1000] - clean[1000]).abs() < 0.01);

        // A second pass over repaired audio finds nothing
        let mut second = detector();
        assert_eq!(second.process_block(&mut buffer, 0..2048), 0);
    }

    #[test]
    fn test_positions_include_offset_and_running_position() {
        let mut signal = sine(4096, 440.0, 44100.0);
        signal[3000] -= 0.9;
        let spiked = signal[3000];
        let mut buffer = AudioBuffer::from_channels(vec![signal]).unwrap();
        let mut processor = detector();
        processor.set_apply_removal(false);
        processor.set_sample_offset(1024);

        processor.analyze_block(&buffer, 1024..2048);
        assert_eq!(processor.sample_position(), 1024);
        processor.process_block(&mut buffer, 2048..4096);

        let clicks = processor.detected_clicks();
        assert_eq!(clicks.len(), 1);
        assert!(clicks[0].position <= 3000 && 3000 < clicks[0].position + clicks[0].width);
        // detection-only leaves the spike in place
        assert_eq!(buffer.channel(0)[3000], spiked);
    }

    #[test]
    fn test_clicks_are_reported_per_channel() {
        let mut left = sine(2048, 500.0, 48000.0);
        let mut right = sine(2048, 500.0, 48000.0);
        left[700] += 0.7;
        right[300] -= 0.7;
        let mut buffer = AudioBuffer::from_channels(vec![left, right]).unwrap();
        let mut processor = detector();

        assert_eq!(processor.process_block(&mut buffer, 0..2048), 2);
        let clicks = processor.detected_clicks();
        assert_eq!(clicks[0].channel, Some(1));
        assert_eq!(clicks[1].channel, Some(0));
        assert!(clicks[0].position < clicks[1].position);
        assert_eq!(processor.clicks_last_block(), 2);
    }

    #[test]
    fn test_width_is_capped() {
        let mut data = vec![0.0f32; 200];
        for (i, s) in data.iter_mut().enumerate().skip(50).take(40) {
            *s = if i % 2 == 0 { 1.0 } else { -1.0 };
        }
        let regions = find_regions(&data, 1.0, 10);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].width, 10);
    }

    #[test]
    fn test_silence_uses_absolute_floor() {
        let data = vec![0.0f32; 512];
        assert!(find_regions(&data, 5.0, 500).is_empty());

        let mut tiny = vec![0.0f32; 512];
        tiny[100] = 1e-6;
        assert!(find_regions(&tiny, 5.0, 500).is_empty());
    }

    #[test]
    fn test_reset_clears_stored_clicks() {
        let mut signal = sine(1024, 1000.0, 48000.0);
        signal[500] += 1.0;
        let mut buffer = AudioBuffer::from_channels(vec![signal]).unwrap();
        let mut processor = detector();
        processor.process_block(&mut buffer, 0..1024);
        assert!(!processor.detected_clicks().is_empty());

        processor.reset_sample_position();
        assert!(processor.detected_clicks().is_empty());
        assert_eq!(processor.sample_position(), 0);
    }

    #[test]
    fn test_range_is_clamped() {
        let mut buffer = AudioBuffer::new(1, 100);
        let mut processor = detector();
        processor.process_block(&mut buffer, 50..1000);
        assert_eq!(processor.sample_position(), 50);
    }

    #[test]
    fn test_window_keeps_only_regions_starting_in_block() {
        let mut signal = sine(2048, 1000.0, 48000.0);
        let clean = signal.clone();
        for p in [1000, 1100, 1500] {
            signal[p] += 0.8;
        }
        let mut buffer = AudioBuffer::from_channels(vec![signal.clone()]).unwrap();
        let mut processor = detector();
        processor.set_sample_offset(1000);

        assert_eq!(processor.process_block_in(&mut buffer, 1000..1400, 500..2048), 1);
        assert_eq!(processor.sample_position(), 400);
        let click = &processor.detected_clicks()[0];
        assert!(click.position <= 1100 && 1100 < click.position + click.width);

        // The region around 1000 starts at 999 and belongs to the previous block
        assert_eq!(buffer.channel(0)[1000], signal[1000]);
        assert_eq!(buffer.channel(0)[1500], signal[1500]);
        assert!((buffer.channel(0)[1100] - clean[1100]).abs() < 0.01);
    }

    #[test]
    fn test_remover_applies_manual_click_to_all_channels() {
        let base: Vec<f32> = (0..64).map(|i| i as f32 * 0.01).collect();
        let mut left = base.clone();
        let mut right = base.clone();
        left[30] = 2.0;
        right[30] = -2.0;
        let mut buffer = AudioBuffer::from_channels(vec![left, right]).unwrap();
        let settings = ClickSettings {
            method: RepairMethod::Interpolation,
            ..ClickSettings::default()
        };

        let clicks = vec![ClickInfo::manual(30, 1), ClickInfo::manual(500, 4)];
        assert_eq!(ClickRemover::apply(&mut buffer, &clicks, &settings), 1);
        assert!((buffer.channel(0)[30] - 0.30).abs() < 1e-4);
        assert!((buffer.channel(1)[30] - 0.30).abs() < 1e-4);
    }

    #[test]
    fn test_remover_respects_click_channel() {
        let mut buffer =
            AudioBuffer::from_channels(vec![vec![0.0, 0.0, 1.0, 0.0, 0.0]; 2]).unwrap();
        let click = ClickInfo {
            position: 2,
            magnitude: 0.9,
            width: 1,
            is_manual: false,
            channel: Some(1),
        };
        ClickRemover::apply(&mut buffer, &[click], &ClickSettings::default());
        assert_eq!(buffer.channel(0)[2], 1.0);
        assert!(buffer.channel(1)[2].abs() < 1e-6);
    }
}
