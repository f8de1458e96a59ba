//! Animated GIF export of a time range.
//!
//! [`export_gif`] streams frames from a [`MediaSource`] into the encoder one
//! at a time, so memory use depends on the output frame size only, never on
//! the length of the source. [`ExportPipeline`] runs jobs one after another on
//! a dedicated worker thread, each with its own decode context.
//!
//! Output frames are picked by nearest timestamp: output frame `k` shows the
//! source frame closest to `start + k / fps`, duplicating source frames when
//! the target rate is higher and skipping them when it is lower.
//!
//! # Example
//!
//! ```no_run
//! use framestep::{ExportJob, ExportOptions, ExportSize, export_gif, open_source};
//!
//! let mut source = open_source("input.mp4")?;
//! let job = ExportJob::new(2.0, 5.0, "clip.gif")
//!     .with_fps(12.0)
//!     .with_export_size(ExportSize::Small);
//! let outcome = export_gif(source.as_mut(), &job, &ExportOptions::new())?;
//! println!("wrote {} frames", outcome.frames_written);
//! # Ok::<(), framestep::FramestepError>(())
//! ```

use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use gif::{Encoder, EncodingError, Frame, Repeat};
use image::{
    RgbImage,
    imageops::{self, FilterType},
};
use parking_lot::{Condvar, Mutex};

use crate::configuration::{ExportOptions, PlayerConfig};
use crate::conversion::{frame_index_at, frame_timestamp, resolve_dimensions};
use crate::error::{ErrorKind, FramestepError};
use crate::event::{EventSink, SessionEvent};
use crate::frame::FrameRef;
use crate::metadata::MediaMetadata;
use crate::progress::{CancellationToken, OperationType, ProgressCallback, ProgressInfo, ProgressTracker};
use crate::source::SourceOpener;

/// GIF delays are whole centiseconds.
pub const MAX_EXPORT_FPS: f64 = 100.0;
/// Largest GIF logical screen edge.
const MAX_GIF_DIMENSION: u32 = u16::MAX as u32;
/// Default span of a new export range, in seconds.
pub const DEFAULT_EXPORT_SPAN: f64 = 10.0;
const RANGE_EPSILON: f64 = 1e-6;

/// Output size presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExportSize {
    /// 320x180.
    Small,
    /// 480x270.
    #[default]
    Medium,
    /// 640x360.
    Large,
    /// 960x540.
    Hd,
    /// Source resolution.
    Original,
}

impl ExportSize {
    /// Bounding box of the preset, or `None` for the source size.
    pub fn dimensions(self) -> Option<(u32, u32)> {
        match self {
            ExportSize::Small => Some((320, 180)),
            ExportSize::Medium => Some((480, 270)),
            ExportSize::Large => Some((640, 360)),
            ExportSize::Hd => Some((960, 540)),
            ExportSize::Original => None,
        }
    }
}

/// Quality presets on the 1 to 100 scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExportQuality {
    Low,
    #[default]
    Medium,
    High,
}

impl ExportQuality {
    pub fn level(self) -> u8 {
        match self {
            ExportQuality::Low => 70,
            ExportQuality::Medium => 85,
            ExportQuality::High => 95,
        }
    }
}

/// Life cycle of an export job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExportStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExportStatus::Completed | ExportStatus::Failed | ExportStatus::Cancelled
        )
    }
}

/// How long a range is, relative to what GIF handles comfortably.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationAdvisory {
    Normal,
    /// Over 15 seconds.
    Large,
    /// Over 30 seconds.
    VeryLarge,
}

/// Classify an export span.
pub fn duration_advisory(span_seconds: f64) -> DurationAdvisory {
    if span_seconds > 30.0 {
        DurationAdvisory::VeryLarge
    } else if span_seconds > 15.0 {
        DurationAdvisory::Large
    } else {
        DurationAdvisory::Normal
    }
}

/// Description of one export.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub struct ExportJob {
    /// Range start in seconds (inclusive).
    pub start_time: f64,
    /// Range end in seconds (exclusive).
    pub end_time: f64,
    /// Output frames per second.
    pub target_fps: f64,
    /// Output width; `None` follows the source or the other edge.
    pub target_width: Option<u32>,
    /// Output height; `None` follows the source or the other edge.
    pub target_height: Option<u32>,
    /// Fit inside the target box instead of stretching to it.
    pub preserve_aspect: bool,
    /// 1 (smallest, fastest) to 100 (best palette).
    pub quality: u8,
    pub output_path: PathBuf,
    /// Loop count; `None` loops forever.
    pub repeat: Option<u16>,
}

impl ExportJob {
    /// A job with the default settings: 10 fps, 480x270 box, quality 85.
    pub fn new<P: Into<PathBuf>>(start_time: f64, end_time: f64, output_path: P) -> Self {
        let (width, height) = ExportSize::Medium.dimensions().unwrap_or((480, 270));
        Self {
            start_time,
            end_time,
            target_fps: crate::configuration::DEFAULT_EXPORT_FPS,
            target_width: Some(width),
            target_height: Some(height),
            preserve_aspect: true,
            quality: crate::configuration::DEFAULT_EXPORT_QUALITY,
            output_path: output_path.into(),
            repeat: None,
        }
    }

    /// A job pre-filled from `config` covering the default range after
    /// `position_seconds`.
    pub fn from_config<P: Into<PathBuf>>(
        config: &PlayerConfig,
        position_seconds: f64,
        duration_seconds: f64,
        output_path: P,
    ) -> Self {
        let (start, end) = default_export_range(position_seconds, duration_seconds);
        Self::new(start, end, output_path)
            .with_fps(config.default_export_fps)
            .with_quality(config.default_export_quality)
            .with_export_size(config.default_export_size)
    }

    pub fn with_range(mut self, start_time: f64, end_time: f64) -> Self {
        self.start_time = start_time;
        self.end_time = end_time;
        self
    }

    pub fn with_fps(mut self, fps: f64) -> Self {
        self.target_fps = fps;
        self
    }

    /// Set an explicit output size. `None` on either edge follows the source
    /// aspect ratio.
    pub fn with_dimensions(mut self, width: Option<u32>, height: Option<u32>) -> Self {
        self.target_width = width;
        self.target_height = height;
        self
    }

    pub fn with_export_size(mut self, size: ExportSize) -> Self {
        match size.dimensions() {
            Some((width, height)) => {
                self.target_width = Some(width);
                self.target_height = Some(height);
            }
            None => {
                self.target_width = None;
                self.target_height = None;
            }
        }
        self
    }

    pub fn with_preserve_aspect(mut self, preserve: bool) -> Self {
        self.preserve_aspect = preserve;
        self
    }

    /// Clamped to 1..=100.
    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality.clamp(1, 100);
        self
    }

    pub fn with_repeat(mut self, repeat: Option<u16>) -> Self {
        self.repeat = repeat;
        self
    }

    /// Range length in seconds.
    pub fn span(&self) -> f64 {
        self.end_time - self.start_time
    }

    /// Check the job against `metadata` without touching the filesystem.
    ///
    /// # Errors
    ///
    /// [`FramestepError::InvalidRange`] unless `0 <= start < end <= duration`,
    /// [`FramestepError::InvalidParameter`] for an unusable fps, size or
    /// quality.
    pub fn validate(&self, metadata: &MediaMetadata) -> Result<(), FramestepError> {
        let duration = metadata.duration_seconds;
        let range_ok = self.start_time.is_finite()
            && self.end_time.is_finite()
            && self.start_time >= 0.0
            && self.start_time < self.end_time
            && self.end_time <= duration + RANGE_EPSILON;
        if !range_ok {
            return Err(FramestepError::InvalidRange {
                start: self.start_time,
                end: self.end_time,
                duration,
            });
        }
        if !(self.target_fps.is_finite() && self.target_fps > 0.0 && self.target_fps <= MAX_EXPORT_FPS)
        {
            return Err(FramestepError::InvalidParameter(format!(
                "export fps {} must be in (0, {MAX_EXPORT_FPS}]",
                self.target_fps
            )));
        }
        for edge in [self.target_width, self.target_height].into_iter().flatten() {
            if edge == 0 || edge > MAX_GIF_DIMENSION {
                return Err(FramestepError::InvalidParameter(format!(
                    "export dimension {edge} must be in 1..={MAX_GIF_DIMENSION}"
                )));
            }
        }
        if !(1..=100).contains(&self.quality) {
            return Err(FramestepError::InvalidParameter(format!(
                "quality {} must be in 1..=100",
                self.quality
            )));
        }
        let (width, height) = self.output_dimensions(metadata);
        if width > MAX_GIF_DIMENSION || height > MAX_GIF_DIMENSION {
            return Err(FramestepError::InvalidParameter(format!(
                "output size {width}x{height} exceeds the GIF limit"
            )));
        }
        Ok(())
    }

    /// Final output size for a source of `metadata`'s dimensions.
    pub fn output_dimensions(&self, metadata: &MediaMetadata) -> (u32, u32) {
        resolve_dimensions(
            metadata.width,
            metadata.height,
            self.target_width,
            self.target_height,
            self.preserve_aspect,
        )
    }
}

/// Range starting at `position_seconds` and lasting up to ten seconds.
///
/// Near the end of the media the start moves back so the range is at least
/// one second long (or the whole media if shorter).
pub fn default_export_range(position_seconds: f64, duration_seconds: f64) -> (f64, f64) {
    let duration = duration_seconds.max(0.0);
    let start = position_seconds.clamp(0.0, duration);
    let end = (start + DEFAULT_EXPORT_SPAN).min(duration);
    if end - start < 1.0 {
        ((end - 1.0).max(0.0), end)
    } else {
        (start, end)
    }
}

/// Source frame indices for every output frame of `[start, end)`.
///
/// Always returns at least one index. Indices are non-decreasing.
pub fn sample_frame_indices(
    start: f64,
    end: f64,
    target_fps: f64,
    source_fps: f64,
    frame_count: u64,
) -> Vec<u64> {
    let last_frame = frame_count.saturating_sub(1);
    // First frame at or after `start`, last frame strictly before `end`.
    let first_in_range = ((start * source_fps - RANGE_EPSILON).ceil().max(0.0) as u64).min(last_frame);
    let last_in_range = ((end * source_fps - RANGE_EPSILON).ceil() as u64)
        .saturating_sub(1)
        .min(last_frame);

    if last_in_range < first_in_range {
        return vec![frame_index_at(start, source_fps, frame_count)];
    }

    let output_count = ((end - start) * target_fps).round();
    if !(output_count >= 1.0) {
        let mut fallback = vec![first_in_range];
        if last_in_range != first_in_range {
            fallback.push(last_in_range);
        }
        return fallback;
    }

    (0..output_count as u64)
        .map(|k| {
            let timestamp = start + k as f64 / target_fps;
            let nearest = (timestamp * source_fps).round().max(0.0) as u64;
            nearest.clamp(first_in_range, last_in_range)
        })
        .collect()
}

/// Rough output size in bytes, for UI hints.
pub fn estimate_export_size(job: &ExportJob, metadata: &MediaMetadata) -> u64 {
    let (width, height) = job.output_dimensions(metadata);
    let frames = (job.span().max(0.0) * job.target_fps).round().max(1.0) as u64;
    frames * (u64::from(width) * u64::from(height) * 3 / 100)
}

/// Human readable byte count (`B`, `KB`, `MB`).
pub fn format_file_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    if bytes < KIB {
        format!("{bytes} B")
    } else if bytes < KIB * KIB {
        format!("{:.1} KB", bytes as f64 / KIB as f64)
    } else {
        format!("{:.1} MB", bytes as f64 / (KIB * KIB) as f64)
    }
}

/// Map quality onto the `gif` quantizer speed (1 best, 30 fastest).
fn quantizer_speed(quality: u8) -> i32 {
    let quality = i32::from(quality.clamp(1, 100));
    1 + (100 - quality) * 29 / 99
}

/// Delay of output frame `k` so that the sum tracks `k / fps`.
fn frame_delay(k: u64, fps: f64) -> u16 {
    let at = |n: u64| (n as f64 * 100.0 / fps).round() as i64;
    (at(k + 1) - at(k)).clamp(1, i64::from(u16::MAX)) as u16
}

/// Result of a finished export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOutcome {
    pub frames_written: u64,
    pub width: u32,
    pub height: u32,
}

fn write_error(path: &Path, error: impl std::fmt::Display) -> FramestepError {
    FramestepError::DiskWriteError {
        path: path.to_path_buf(),
        reason: error.to_string(),
    }
}

fn encoding_error(path: &Path, error: EncodingError) -> FramestepError {
    match error {
        EncodingError::Io(io) => write_error(path, io),
        other => FramestepError::EncodeError(other.to_string()),
    }
}

fn rgba_pixels(image: &RgbImage) -> Result<Vec<u8>, FramestepError> {
    let bytes = image.width() as usize * image.height() as usize * 4;
    let mut pixels = Vec::new();
    pixels.try_reserve_exact(bytes).map_err(|error| {
        FramestepError::OutOfMemory(format!(
            "{}x{} frame buffer: {error}",
            image.width(),
            image.height()
        ))
    })?;
    for pixel in image.pixels() {
        pixels.extend_from_slice(&[pixel[0], pixel[1], pixel[2], 255]);
    }
    Ok(pixels)
}

/// Export `job` from `source` into an animated GIF.
///
/// The job is validated before any file is created. On failure or
/// cancellation the partially written file is removed.
///
/// # Errors
///
/// [`FramestepError::InvalidRange`] / [`FramestepError::InvalidParameter`]
/// for a bad job, [`FramestepError::Cancelled`] if the token fires, and
/// decode, encode, disk or allocation errors otherwise.
pub fn export_gif(
    source: &mut dyn crate::source::MediaSource,
    job: &ExportJob,
    options: &ExportOptions,
) -> Result<ExportOutcome, FramestepError> {
    let metadata = source.metadata().clone();
    job.validate(&metadata)?;
    if options.is_cancelled() {
        return Err(FramestepError::Cancelled);
    }

    let indices = sample_frame_indices(
        job.start_time,
        job.end_time,
        job.target_fps,
        metadata.frame_rate,
        metadata.frame_count,
    );
    let (width, height) = job.output_dimensions(&metadata);

    log::debug!(
        "Exporting [{:.3}s, {:.3}s) of {}x{} source as {} frames at {:.2} fps, {}x{} -> {:?}",
        job.start_time,
        job.end_time,
        metadata.width,
        metadata.height,
        indices.len(),
        job.target_fps,
        width,
        height,
        job.output_path,
    );

    let file = File::create(&job.output_path).map_err(|error| write_error(&job.output_path, error))?;
    let result = encode_frames(source, job, options, &indices, (width, height), file);

    match result {
        Ok(frames_written) => {
            log::info!("Exported {frames_written} frames to {:?}", job.output_path);
            Ok(ExportOutcome {
                frames_written,
                width,
                height,
            })
        }
        Err(error) => {
            match fs::remove_file(&job.output_path) {
                Ok(()) => {}
                Err(remove) if remove.kind() == IoErrorKind::NotFound => {}
                Err(remove) => {
                    log::warn!("Could not remove partial export {:?}: {remove}", job.output_path)
                }
            }
            Err(error)
        }
    }
}

fn encode_frames(
    source: &mut dyn crate::source::MediaSource,
    job: &ExportJob,
    options: &ExportOptions,
    indices: &[u64],
    (width, height): (u32, u32),
    file: File,
) -> Result<u64, FramestepError> {
    let path = job.output_path.as_path();
    let mut encoder = Encoder::new(BufWriter::new(file), width as u16, height as u16, &[])
        .map_err(|error| encoding_error(path, error))?;
    let repeat = match job.repeat {
        None => Repeat::Infinite,
        Some(count) => Repeat::Finite(count),
    };
    encoder
        .set_repeat(repeat)
        .map_err(|error| encoding_error(path, error))?;

    let mut tracker = ProgressTracker::new(
        Arc::clone(&options.progress),
        OperationType::GifExport,
        Some(indices.len() as u64),
        options.batch_size,
    );
    let speed = quantizer_speed(job.quality);
    let frame_rate = source.metadata().frame_rate;

    let first = indices.first().copied().unwrap_or(0);
    source.seek_near(frame_timestamp(first, frame_rate))?;
    let mut current: Option<FrameRef> = None;
    let mut scaled: Option<(u64, RgbImage)> = None;

    for (k, &index) in indices.iter().enumerate() {
        if options.is_cancelled() {
            log::debug!("Export to {path:?} cancelled after {k} frames");
            return Err(FramestepError::Cancelled);
        }

        while current.as_ref().is_none_or(|frame| frame.index() < index) {
            match source.decode_next() {
                Ok(frame) => current = Some(frame),
                Err(FramestepError::EndOfStream) if current.is_some() => break,
                Err(FramestepError::EndOfStream) => {
                    return Err(FramestepError::DecodeError(format!(
                        "stream ended before frame {index}"
                    )));
                }
                Err(error) => return Err(error),
            }
        }
        let Some(frame) = current.as_ref() else {
            return Err(FramestepError::DecodeError(format!("frame {index} unavailable")));
        };

        if scaled.as_ref().is_none_or(|(scaled_index, _)| *scaled_index != frame.index()) {
            let image = if frame.width() == width && frame.height() == height {
                frame.image().clone()
            } else {
                imageops::resize(frame.image(), width, height, FilterType::Triangle)
            };
            scaled = Some((frame.index(), image));
        }
        let Some((_, image)) = scaled.as_ref() else {
            return Err(FramestepError::EncodeError("scaled frame missing".to_string()));
        };

        let mut pixels = rgba_pixels(image)?;
        let mut gif_frame = Frame::from_rgba_speed(width as u16, height as u16, &mut pixels, speed);
        gif_frame.delay = frame_delay(k as u64, job.target_fps);
        encoder
            .write_frame(&gif_frame)
            .map_err(|error| encoding_error(path, error))?;

        tracker.advance(frame.index(), frame.timestamp());
    }
    tracker.finish();

    let mut writer = encoder.into_inner().map_err(|error| write_error(path, error))?;
    writer.flush().map_err(|error| write_error(path, error))?;
    Ok(tracker.current())
}

/// Final record of a pipeline job.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportReport {
    pub job_id: u64,
    pub status: ExportStatus,
    pub frames_written: u64,
    pub total_frames: u64,
    pub output_path: PathBuf,
    /// Kind and message of the failure, for `Failed` jobs.
    pub failure: Option<(ErrorKind, String)>,
}

struct JobControl {
    id: u64,
    status: Mutex<ExportStatus>,
    report: Mutex<Option<ExportReport>>,
    finished: Condvar,
    token: CancellationToken,
}

impl JobControl {
    fn set_status(&self, status: ExportStatus) {
        *self.status.lock() = status;
    }

    fn complete(&self, report: ExportReport) {
        let mut slot = self.report.lock();
        *self.status.lock() = report.status;
        *slot = Some(report);
        self.finished.notify_all();
    }
}

/// Handle to a queued or running export.
#[derive(Clone)]
pub struct ExportHandle {
    control: Arc<JobControl>,
}

impl std::fmt::Debug for ExportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportHandle")
            .field("id", &self.control.id)
            .field("status", &self.status())
            .finish()
    }
}

impl ExportHandle {
    pub fn id(&self) -> u64 {
        self.control.id
    }

    pub fn status(&self) -> ExportStatus {
        *self.control.status.lock()
    }

    /// Request cancellation. Takes effect before the next output frame.
    pub fn cancel(&self) {
        self.control.token.cancel();
    }

    /// The final report, once the job is terminal.
    pub fn report(&self) -> Option<ExportReport> {
        self.control.report.lock().clone()
    }

    /// Block until the job is terminal or `timeout` passes.
    pub fn wait(&self, timeout: Duration) -> Option<ExportReport> {
        let mut report = self.control.report.lock();
        if report.is_none() {
            let _ = self
                .control
                .finished
                .wait_while_for(&mut report, |report| report.is_none(), timeout);
        }
        report.clone()
    }
}

struct QueuedJob {
    source_path: PathBuf,
    job: ExportJob,
    total_frames: u64,
    control: Arc<JobControl>,
}

/// Forwards per-frame progress as [`SessionEvent::ExportProgress`].
struct EventProgress {
    job_id: u64,
    total_frames: u64,
    events: EventSink,
}

impl ProgressCallback for EventProgress {
    fn on_progress(&self, info: &ProgressInfo) {
        self.events.emit(SessionEvent::ExportProgress {
            job_id: self.job_id,
            frames_processed: info.current,
            total_frames: info.total.unwrap_or(self.total_frames),
        });
    }
}

/// Serialized export queue with one worker thread.
pub struct ExportPipeline {
    jobs: Option<Sender<QueuedJob>>,
    handle: Option<JoinHandle<()>>,
    next_id: AtomicU64,
    active: Mutex<Vec<ExportHandle>>,
}

impl ExportPipeline {
    /// Spawn the export worker. Sources are opened with `opener`.
    pub fn new(opener: Arc<dyn SourceOpener>, events: EventSink) -> Result<Self, FramestepError> {
        let (sender, receiver) = unbounded();
        let handle = thread::Builder::new()
            .name("framestep-export".to_string())
            .spawn(move || run_exports(receiver, opener, events))
            .map_err(|error| {
                FramestepError::InvalidState(format!("could not spawn export thread: {error}"))
            })?;
        Ok(Self {
            jobs: Some(sender),
            handle: Some(handle),
            next_id: AtomicU64::new(1),
            active: Mutex::new(Vec::new()),
        })
    }

    /// Validate and enqueue `job` against the file at `source_path`.
    ///
    /// # Errors
    ///
    /// Validation errors are returned here and nothing is queued.
    pub fn submit(
        &self,
        source_path: &Path,
        metadata: &MediaMetadata,
        job: ExportJob,
    ) -> Result<ExportHandle, FramestepError> {
        job.validate(metadata)?;
        let total_frames = sample_frame_indices(
            job.start_time,
            job.end_time,
            job.target_fps,
            metadata.frame_rate,
            metadata.frame_count,
        )
        .len() as u64;

        let control = Arc::new(JobControl {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            status: Mutex::new(ExportStatus::Pending),
            report: Mutex::new(None),
            finished: Condvar::new(),
            token: CancellationToken::new(),
        });
        let handle = ExportHandle {
            control: Arc::clone(&control),
        };

        let sender = self
            .jobs
            .as_ref()
            .ok_or_else(|| FramestepError::InvalidState("export pipeline is shut down".to_string()))?;
        sender
            .send(QueuedJob {
                source_path: source_path.to_path_buf(),
                job,
                total_frames,
                control,
            })
            .map_err(|_| FramestepError::InvalidState("export worker has exited".to_string()))?;

        let mut active = self.active.lock();
        active.retain(|handle| !handle.status().is_terminal());
        active.push(handle.clone());
        log::debug!("Queued export job {}", handle.id());
        Ok(handle)
    }

    /// Cancel job `job_id`. Returns `false` if it is unknown or finished.
    pub fn cancel(&self, job_id: u64) -> bool {
        let active = self.active.lock();
        match active
            .iter()
            .find(|handle| handle.id() == job_id && !handle.status().is_terminal())
        {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every job that has not finished.
    pub fn cancel_all(&self) {
        for handle in self.active.lock().iter() {
            handle.cancel();
        }
    }

    /// Handles of jobs that are queued or running.
    pub fn pending(&self) -> Vec<ExportHandle> {
        self.active
            .lock()
            .iter()
            .filter(|handle| !handle.status().is_terminal())
            .cloned()
            .collect()
    }
}

impl Drop for ExportPipeline {
    fn drop(&mut self) {
        self.cancel_all();
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_exports(receiver: Receiver<QueuedJob>, opener: Arc<dyn SourceOpener>, events: EventSink) {
    for queued in receiver {
        let report = run_one(&queued, opener.as_ref(), &events);
        if let Some((kind, message)) = &report.failure {
            events.emit(SessionEvent::Error {
                kind: *kind,
                message: message.clone(),
            });
        }
        // Events first, so a woken waiter finds them queued.
        events.emit(SessionEvent::ExportFinished(report.clone()));
        queued.control.complete(report);
    }
    log::debug!("Export worker exiting");
}

fn run_one(queued: &QueuedJob, opener: &dyn SourceOpener, events: &EventSink) -> ExportReport {
    let control = &queued.control;
    let mut report = ExportReport {
        job_id: control.id,
        status: ExportStatus::Cancelled,
        frames_written: 0,
        total_frames: queued.total_frames,
        output_path: queued.job.output_path.clone(),
        failure: None,
    };
    if control.token.is_cancelled() {
        return report;
    }

    control.set_status(ExportStatus::Running);
    let options = ExportOptions::new()
        .with_progress(Arc::new(EventProgress {
            job_id: control.id,
            total_frames: queued.total_frames,
            events: events.clone(),
        }))
        .with_cancellation(control.token.clone());

    let result = opener
        .open(&queued.source_path)
        .and_then(|mut source| export_gif(source.as_mut(), &queued.job, &options));

    match result {
        Ok(outcome) => {
            report.status = ExportStatus::Completed;
            report.frames_written = outcome.frames_written;
        }
        Err(FramestepError::Cancelled) => {
            log::info!("Export job {} cancelled", control.id);
        }
        Err(error) => {
            log::warn!("Export job {} failed: {error}", control.id);
            report.status = ExportStatus::Failed;
            report.failure = Some((error.kind(), error.to_string()));
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_downsamples_by_nearest_timestamp() {
        let indices = sample_frame_indices(2.0, 5.0, 10.0, 30.0, 300);
        assert_eq!(indices.len(), 30);
        assert_eq!(indices.first(), Some(&60));
        assert_eq!(indices[1], 63);
        assert_eq!(indices.last(), Some(&147));
    }

    #[test]
    fn sampling_duplicates_when_upsampling() {
        let indices = sample_frame_indices(0.0, 1.0, 20.0, 10.0, 100);
        assert_eq!(indices.len(), 20);
        assert!(indices.windows(2).all(|pair| pair[0] <= pair[1]));
        let mut distinct = indices.clone();
        distinct.dedup();
        assert_eq!(distinct, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn sampling_falls_back_to_range_endpoints() {
        // 0.04s at 10 fps rounds to zero output frames.
        let indices = sample_frame_indices(1.0, 1.04, 10.0, 100.0, 1000);
        assert_eq!(indices, vec![100, 103]);
    }

    #[test]
    fn sampling_never_returns_nothing() {
        let indices = sample_frame_indices(1.01, 1.02, 10.0, 30.0, 300);
        assert_eq!(indices, vec![30]);
    }

    #[test]
    fn delays_track_fractional_rates() {
        let total: u32 = (0..3).map(|k| u32::from(frame_delay(k, 30.0))).sum();
        assert_eq!(total, 10);
        assert_eq!(frame_delay(0, 10.0), 10);
    }

    #[test]
    fn quality_maps_onto_quantizer_speed() {
        assert_eq!(quantizer_speed(100), 1);
        assert_eq!(quantizer_speed(1), 30);
        assert!(quantizer_speed(85) < quantizer_speed(70));
    }

    #[test]
    fn default_range_follows_position() {
        assert_eq!(default_export_range(3.0, 60.0), (3.0, 13.0));
        assert_eq!(default_export_range(55.0, 60.0), (55.0, 60.0));
        assert_eq!(default_export_range(60.0, 60.0), (59.0, 60.0));
        assert_eq!(default_export_range(0.0, 0.5), (0.0, 0.5));
    }

    #[test]
    fn file_sizes_are_human_readable() {
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn advisories_follow_span() {
        assert_eq!(duration_advisory(10.0), DurationAdvisory::Normal);
        assert_eq!(duration_advisory(20.0), DurationAdvisory::Large);
        assert_eq!(duration_advisory(45.0), DurationAdvisory::VeryLarge);
    }
}
