//! Background click detection and removal
//!
//! Long scans run on a worker thread in fixed-size chunks. Each chunk is
//! scanned with some context from its neighbours so clicks on a seam are
//! found once. Cancellation is polled between chunks, so a cancelled removal
//! has repaired the chunks it finished and left the rest of the range
//! untouched, except where a repaired click straddles the last seam. Progress and
//! the final result are delivered over an unbounded channel that can be
//! polled, blocked on or awaited.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::detector::ClickProcessor;
use super::{ClickError, ClickInfo, ClickSettings};
use crate::audio::AudioBuffer;

/// Samples processed between cancellation checks
pub const TASK_CHUNK_SIZE: usize = 2048;

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Message from a running task
#[derive(Debug)]
pub enum TaskEvent<T> {
    /// Fraction of the range processed, 0 to 1
    Progress(f64),
    Finished(T),
}

#[derive(Debug, Clone)]
pub struct DetectionResult {
    /// Detected clicks in scan order
    pub clicks: Vec<ClickInfo>,
    /// The clamped range that was requested
    pub range: Range<usize>,
    pub samples_scanned: usize,
    pub cancelled: bool,
}

#[derive(Debug)]
pub struct RemovalResult {
    pub buffer: AudioBuffer,
    /// Clicks repaired, in scan order
    pub clicks: Vec<ClickInfo>,
    pub range: Range<usize>,
    /// Samples of the range, from its start, that were processed
    pub samples_committed: usize,
    pub cancelled: bool,
}

impl RemovalResult {
    pub fn removed(&self) -> usize {
        self.clicks.len()
    }
}

/// Clamp `range` to the buffer and reject it if nothing is left
fn validate_range(range: Range<usize>, len: usize) -> Result<Range<usize>, ClickError> {
    let end = range.end.min(len);
    if range.start >= end {
        return Err(ClickError::EmptyRange {
            start: range.start,
            end: range.end,
        });
    }
    Ok(range.start..end)
}

fn chunks(range: &Range<usize>) -> impl Iterator<Item = Range<usize>> + '_ {
    range
        .clone()
        .step_by(TASK_CHUNK_SIZE)
        .map(move |start| start..(start + TASK_CHUNK_SIZE).min(range.end))
}

/// Scan window around `chunk`: enough context on each side that a click on
/// the seam is seen whole, clamped to `range`
fn window(chunk: &Range<usize>, range: &Range<usize>, context: usize) -> Range<usize> {
    chunk.start.saturating_sub(context).max(range.start)..(chunk.end + context).min(range.end)
}

fn processor_for(settings: &ClickSettings, range: &Range<usize>, apply_removal: bool) -> ClickProcessor {
    let mut processor = ClickProcessor::new(settings);
    processor.set_store_detected_clicks(true);
    processor.set_apply_removal(apply_removal);
    processor.set_sample_offset(range.start);
    processor.reset_sample_position();
    processor
}

fn run_detection(
    buffer: &AudioBuffer,
    range: Range<usize>,
    settings: &ClickSettings,
    token: &CancellationToken,
    mut progress: impl FnMut(f64),
) -> DetectionResult {
    let mut processor = processor_for(settings, &range, false);
    let context = processor.settings().max_width + 2;
    let total = range.len();
    let mut cancelled = false;

    for chunk in chunks(&range) {
        if token.is_cancelled() {
            cancelled = true;
            break;
        }
        let scan = window(&chunk, &range, context);
        processor.analyze_block_in(buffer, chunk, scan);
        progress(processor.sample_position() as f64 / total as f64);
    }

    let samples_scanned = processor.sample_position();
    let clicks = processor.take_detected_clicks();
    info!(
        "Click detection {}: {} clicks in {} of {} samples",
        if cancelled { "cancelled" } else { "finished" },
        clicks.len(),
        samples_scanned,
        total
    );
    DetectionResult {
        clicks,
        range,
        samples_scanned,
        cancelled,
    }
}

fn run_removal(
    mut buffer: AudioBuffer,
    range: Range<usize>,
    settings: &ClickSettings,
    token: &CancellationToken,
    mut progress: impl FnMut(f64),
) -> RemovalResult {
    let mut processor = processor_for(settings, &range, true);
    let context = processor.settings().max_width + 2;
    let total = range.len();
    let mut cancelled = false;

    for chunk in chunks(&range) {
        if token.is_cancelled() {
            cancelled = true;
            break;
        }
        let scan = window(&chunk, &range, context);
        processor.process_block_in(&mut buffer, chunk, scan);
        progress(processor.sample_position() as f64 / total as f64);
    }

    let samples_committed = processor.sample_position();
    let clicks = processor.take_detected_clicks();
    info!(
        "Click removal {}: {} clicks repaired in {} of {} samples",
        if cancelled { "cancelled" } else { "finished" },
        clicks.len(),
        samples_committed,
        total
    );
    RemovalResult {
        buffer,
        clicks,
        range,
        samples_committed,
        cancelled,
    }
}

/// Detect clicks in `range` on the calling thread
pub fn detect_clicks(
    buffer: &AudioBuffer,
    range: Range<usize>,
    settings: &ClickSettings,
    token: &CancellationToken,
    progress: impl FnMut(f64),
) -> Result<DetectionResult, ClickError> {
    settings.validate()?;
    let range = validate_range(range, buffer.num_samples())?;
    Ok(run_detection(buffer, range, settings, token, progress))
}

/// Detect and repair clicks in `range` on the calling thread
pub fn remove_clicks(
    buffer: AudioBuffer,
    range: Range<usize>,
    settings: &ClickSettings,
    token: &CancellationToken,
    progress: impl FnMut(f64),
) -> Result<RemovalResult, ClickError> {
    settings.validate()?;
    let range = validate_range(range, buffer.num_samples())?;
    Ok(run_removal(buffer, range, settings, token, progress))
}

/// Handle to a click task running on a worker thread
pub struct TaskHandle<T> {
    events: mpsc::UnboundedReceiver<TaskEvent<T>>,
    token: CancellationToken,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl<T> TaskHandle<T> {
    /// Request cancellation; observed before the next chunk
    pub fn cancel(&self) {
        debug!("Requesting click task cancellation");
        self.token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv(&mut self) -> Option<TaskEvent<T>> {
        self.events.try_recv().ok()
    }

    /// Block until the next event. Must not be called from async code.
    pub fn blocking_recv(&mut self) -> Option<TaskEvent<T>> {
        self.events.blocking_recv()
    }

    pub async fn recv(&mut self) -> Option<TaskEvent<T>> {
        self.events.recv().await
    }

    /// Block until the result arrives, discarding progress, then join
    pub fn wait(mut self) -> Option<T> {
        let mut result = None;
        while let Some(event) = self.events.blocking_recv() {
            if let TaskEvent::Finished(value) = event {
                result = Some(value);
                break;
            }
        }
        self.join();
        result
    }

    /// Wait for the worker thread to exit. Returns false if it panicked.
    pub fn join(mut self) -> bool {
        match self.thread_handle.take().map(thread::JoinHandle::join) {
            Some(Err(_)) => {
                warn!("Click task worker panicked");
                false
            }
            _ => true,
        }
    }
}

fn spawn_task<T, F>(token: CancellationToken, name: &str, work: F) -> TaskHandle<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn Fn(f64)) -> T + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let name = name.to_string();

    let thread_handle = thread::spawn(move || {
        info!("Starting {} task", name);
        let progress_tx = tx.clone();
        let report = move |fraction: f64| {
            let _ = progress_tx.send(TaskEvent::Progress(fraction));
        };
        let result = work(&report);
        let _ = tx.send(TaskEvent::Finished(result));
    });

    TaskHandle {
        events: rx,
        token,
        thread_handle: Some(thread_handle),
    }
}

/// Start detection on a worker thread. Invalid ranges are rejected before
/// the thread starts.
pub fn spawn_detection(
    buffer: Arc<AudioBuffer>,
    range: Range<usize>,
    settings: ClickSettings,
    token: CancellationToken,
) -> Result<TaskHandle<DetectionResult>, ClickError> {
    settings.validate()?;
    let range = validate_range(range, buffer.num_samples())?;
    let worker_token = token.clone();

    Ok(spawn_task(token, "click detection", move |report| {
        run_detection(&buffer, range, &settings, &worker_token, report)
    }))
}

/// Start removal on a worker thread. The buffer is handed back in the
/// result, repaired up to `samples_committed`.
pub fn spawn_removal(
    buffer: AudioBuffer,
    range: Range<usize>,
    settings: ClickSettings,
    token: CancellationToken,
) -> Result<TaskHandle<RemovalResult>, ClickError> {
    settings.validate()?;
    let range = validate_range(range, buffer.num_samples())?;
    let worker_token = token.clone();

    Ok(spawn_task(token, "click removal", move |report| {
        run_removal(buffer, range, &settings, &worker_token, report)
    }))
}
