//! Progress reporting and cancellation support.
//!
//! [`ProgressCallback`] observes long-running work (GIF export, thumbnail
//! index builds) and [`CancellationToken`] stops it cooperatively between
//! frames.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use framestep::{
//!     CancellationToken, ExportJob, ExportOptions, FramestepError, ProgressCallback,
//!     ProgressInfo, export_gif, open_source,
//! };
//!
//! struct PrintProgress;
//!
//! impl ProgressCallback for PrintProgress {
//!     fn on_progress(&self, info: &ProgressInfo) {
//!         if let Some(fraction) = info.fraction() {
//!             println!("[{:?}] {:.1}% complete", info.operation, fraction * 100.0);
//!         }
//!     }
//! }
//!
//! let mut source = open_source("input.mp4")?;
//! let job = ExportJob::new(2.0, 5.0, "clip.gif");
//! let options = ExportOptions::new()
//!     .with_progress(Arc::new(PrintProgress))
//!     .with_cancellation(CancellationToken::new());
//! export_gif(source.as_mut(), &job, &options)?;
//! # Ok::<(), FramestepError>(())
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Work that reports progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum OperationType {
    GifExport,
    ThumbnailIndex,
}

/// Progress of one operation, measured in output frames.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    pub operation: OperationType,
    /// Frames finished so far.
    pub current: u64,
    /// Frames the operation will produce, when known up front.
    pub total: Option<u64>,
    pub elapsed: Duration,
    /// Source frame behind the most recent output frame.
    pub last_frame_index: Option<u64>,
    /// Media time of `last_frame_index`, in seconds.
    pub last_timestamp: Option<f64>,
}

impl ProgressInfo {
    /// Completed share in `0.0..=1.0`, if the total is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some((self.current as f64 / total as f64).min(1.0)),
        }
    }

    /// Output frames per wall-clock second so far.
    pub fn frames_per_second(&self) -> f64 {
        let seconds = self.elapsed.as_secs_f64();
        if seconds > 0.0 {
            self.current as f64 / seconds
        } else {
            0.0
        }
    }

    /// Time left at the current throughput.
    pub fn remaining(&self) -> Option<Duration> {
        let total = self.total?;
        let rate = self.frames_per_second();
        if rate <= 0.0 {
            return None;
        }
        let left = total.saturating_sub(self.current) as f64;
        Some(Duration::from_secs_f64(left / rate))
    }
}

/// Observer for export and thumbnail progress.
///
/// Called from worker threads. A callback cannot stop the work; cancel
/// through a [`CancellationToken`] instead.
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, info: &ProgressInfo);
}

pub(crate) struct NoOpProgress;

impl ProgressCallback for NoOpProgress {
    fn on_progress(&self, _info: &ProgressInfo) {}
}

/// Shared cancellation flag. Clones observe the same flag.
///
/// ```
/// use framestep::CancellationToken;
///
/// let token = CancellationToken::new();
/// let worker_view = token.clone();
/// token.cancel();
/// assert!(worker_view.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Workers stop before their next frame.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Counts finished frames and notifies the callback every `every` frames.
pub(crate) struct ProgressTracker {
    callback: Arc<dyn ProgressCallback>,
    operation: OperationType,
    total: Option<u64>,
    every: u64,
    done: u64,
    reported: u64,
    started: Instant,
    last: Option<(u64, f64)>,
}

impl ProgressTracker {
    pub(crate) fn new(
        callback: Arc<dyn ProgressCallback>,
        operation: OperationType,
        total: Option<u64>,
        every: u64,
    ) -> Self {
        Self {
            callback,
            operation,
            total,
            every: every.max(1),
            done: 0,
            reported: 0,
            started: Instant::now(),
            last: None,
        }
    }

    /// One output frame finished, made from source frame `frame_index`.
    pub(crate) fn advance(&mut self, frame_index: u64, timestamp: f64) {
        self.done += 1;
        self.last = Some((frame_index, timestamp));
        if self.done - self.reported >= self.every {
            self.notify();
        }
    }

    /// Report frames not yet covered by a notification.
    pub(crate) fn finish(&mut self) {
        if self.done > self.reported {
            self.notify();
        }
    }

    pub(crate) fn current(&self) -> u64 {
        self.done
    }

    fn notify(&mut self) {
        self.reported = self.done;
        self.callback.on_progress(&ProgressInfo {
            operation: self.operation,
            current: self.done,
            total: self.total,
            elapsed: self.started.elapsed(),
            last_frame_index: self.last.map(|(index, _)| index),
            last_timestamp: self.last.map(|(_, timestamp)| timestamp),
        });
    }
}
