//! Sparse timeline thumbnail index.
//!
//! Thumbnails are sampled at a fixed stride chosen so the whole timeline
//! holds a bounded number of samples. The stride never drops below one frame
//! interval, so short clips get one thumbnail per frame at most.
//!
//! The index is filled by a background thread that owns its own decode
//! context, independent of playback. Lookups never wait for it: they return
//! the nearest sample built so far and restart the builder if it is not
//! running.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use image::imageops::{self, FilterType};
use parking_lot::{Mutex, RwLock};

use crate::conversion::{fit_dimensions, frame_index_at};
use crate::event::{EventSink, SessionEvent};
use crate::frame::Thumbnail;
use crate::metadata::MediaMetadata;
use crate::progress::{
    CancellationToken, OperationType, ProgressCallback, ProgressInfo, ProgressTracker,
};
use crate::source::SourceOpener;

/// Seconds between samples for `sample_count` samples over the media.
pub fn thumbnail_stride(duration_seconds: f64, frame_rate: f64, sample_count: usize) -> f64 {
    let frame_interval = if frame_rate > 0.0 { 1.0 / frame_rate } else { 0.0 };
    let even = duration_seconds / sample_count.max(1) as f64;
    even.max(frame_interval).max(f64::MIN_POSITIVE)
}

fn slot_count(metadata: &MediaMetadata, stride: f64) -> usize {
    let slots = (metadata.duration_seconds / stride).ceil();
    let slots = if slots.is_finite() && slots >= 1.0 { slots as usize } else { 1 };
    slots.min(metadata.frame_count.max(1) as usize)
}

#[derive(Debug, Clone)]
enum Slot {
    Pending,
    Ready(Thumbnail),
    Failed,
}

struct Layout {
    generation: u64,
    sample_count: usize,
    stride: f64,
    slots: Vec<Slot>,
    built: usize,
    failed: usize,
}

impl Layout {
    fn new(metadata: &MediaMetadata, sample_count: usize, generation: u64) -> Self {
        let stride = thumbnail_stride(metadata.duration_seconds, metadata.frame_rate, sample_count);
        Self {
            generation,
            sample_count,
            stride,
            slots: vec![Slot::Pending; slot_count(metadata, stride)],
            built: 0,
            failed: 0,
        }
    }

    fn is_settled(&self) -> bool {
        self.built + self.failed >= self.slots.len()
    }
}

struct Worker {
    handle: JoinHandle<()>,
    token: CancellationToken,
}

struct BuildContext {
    layout: Arc<RwLock<Layout>>,
    opener: Arc<dyn SourceOpener>,
    path: PathBuf,
    max_dimension: u32,
    events: EventSink,
    token: CancellationToken,
    generation: u64,
}

/// Forwards builder progress as [`SessionEvent::ThumbnailsUpdated`].
struct ThumbnailProgress {
    layout: Arc<RwLock<Layout>>,
    events: EventSink,
}

impl ProgressCallback for ThumbnailProgress {
    fn on_progress(&self, _info: &ProgressInfo) {
        let (available, total) = {
            let layout = self.layout.read();
            (layout.built, layout.slots.len())
        };
        self.events
            .emit(SessionEvent::ThumbnailsUpdated { available, total });
    }
}

/// Incrementally built timeline thumbnails for one media file.
pub struct ThumbnailIndex {
    layout: Arc<RwLock<Layout>>,
    worker: Mutex<Option<Worker>>,
    opener: Arc<dyn SourceOpener>,
    path: PathBuf,
    metadata: MediaMetadata,
    max_dimension: u32,
    events: EventSink,
}

impl ThumbnailIndex {
    /// Create an empty index. Nothing is decoded until
    /// [`start`](ThumbnailIndex::start) or the first lookup.
    pub fn new(
        opener: Arc<dyn SourceOpener>,
        path: PathBuf,
        metadata: MediaMetadata,
        sample_count: usize,
        max_dimension: u32,
        events: EventSink,
    ) -> Self {
        let layout = Layout::new(&metadata, sample_count, 0);
        Self {
            layout: Arc::new(RwLock::new(layout)),
            worker: Mutex::new(None),
            opener,
            path,
            metadata,
            max_dimension: max_dimension.max(1),
            events,
        }
    }

    /// Start (or resume) the background builder if work remains.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|running| !running.handle.is_finished()) {
            return;
        }
        if let Some(finished) = worker.take() {
            let _ = finished.handle.join();
        }

        let generation = {
            let layout = self.layout.read();
            if layout.is_settled() {
                return;
            }
            layout.generation
        };

        let token = CancellationToken::new();
        let context = BuildContext {
            layout: Arc::clone(&self.layout),
            opener: Arc::clone(&self.opener),
            path: self.path.clone(),
            max_dimension: self.max_dimension,
            events: self.events.clone(),
            token: token.clone(),
            generation,
        };

        match thread::Builder::new()
            .name("framestep-thumbnails".to_string())
            .spawn(move || build_slots(context))
        {
            Ok(handle) => *worker = Some(Worker { handle, token }),
            Err(error) => log::warn!("Could not spawn thumbnail builder: {error}"),
        }
    }

    /// Nearest available thumbnail to `timestamp`.
    ///
    /// Returns `None` only while no sample has been built yet. Restarts the
    /// builder when the index is incomplete and idle.
    pub fn get_thumbnail(&self, timestamp: f64) -> Option<Thumbnail> {
        let (found, settled) = {
            let layout = self.layout.read();
            (nearest_ready(&layout, timestamp), layout.is_settled())
        };
        if !settled {
            self.start();
        }
        found
    }

    /// Change the sample count, rebuilding only if the stride changes.
    ///
    /// Returns `true` if the index was reset.
    pub fn set_sample_count(&self, sample_count: usize) -> bool {
        let sample_count = sample_count.max(1);
        let new_stride = thumbnail_stride(
            self.metadata.duration_seconds,
            self.metadata.frame_rate,
            sample_count,
        );
        {
            let mut layout = self.layout.write();
            if (layout.stride - new_stride).abs() < 1e-9 {
                layout.sample_count = sample_count;
                return false;
            }
        }

        self.stop();
        {
            let mut layout = self.layout.write();
            let generation = layout.generation + 1;
            *layout = Layout::new(&self.metadata, sample_count, generation);
        }
        log::debug!("Thumbnail stride changed to {new_stride:.3}s; rebuilding");
        self.start();
        true
    }

    /// Samples built so far.
    pub fn available(&self) -> usize {
        self.layout.read().built
    }

    /// Samples in a complete index.
    pub fn total(&self) -> usize {
        self.layout.read().slots.len()
    }

    /// Seconds between samples.
    pub fn stride(&self) -> f64 {
        self.layout.read().stride
    }

    pub fn sample_count(&self) -> usize {
        self.layout.read().sample_count
    }

    /// `true` once every sample has been attempted.
    pub fn is_complete(&self) -> bool {
        self.layout.read().is_settled()
    }

    /// Block until the index settles or `timeout` passes.
    pub fn wait_until_complete(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_complete() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Cancel and join the builder. Built samples are kept.
    pub fn stop(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.token.cancel();
            let _ = worker.handle.join();
        }
    }
}

impl Drop for ThumbnailIndex {
    fn drop(&mut self) {
        self.stop();
    }
}

fn nearest_ready(layout: &Layout, timestamp: f64) -> Option<Thumbnail> {
    let last = layout.slots.len().checked_sub(1)?;
    let ideal = (timestamp.max(0.0) / layout.stride).round();
    let ideal = if ideal.is_finite() { (ideal as usize).min(last) } else { 0 };

    for distance in 0..=last {
        let below = ideal.checked_sub(distance);
        let above = ideal + distance;
        for candidate in [below, (above <= last).then_some(above)].into_iter().flatten() {
            if let Slot::Ready(thumbnail) = &layout.slots[candidate] {
                return Some(thumbnail.clone());
            }
        }
        if below.is_none() && above >= last {
            break;
        }
    }
    None
}

fn build_slots(context: BuildContext) {
    let mut source = match context.opener.open(&context.path) {
        Ok(source) => source,
        Err(error) => {
            log::warn!("Thumbnail builder could not open {:?}: {error}", context.path);
            let mut layout = context.layout.write();
            if layout.generation == context.generation {
                // Settle the index so lookups stop restarting the builder.
                let mut failed = 0;
                for slot in layout.slots.iter_mut().filter(|slot| matches!(slot, Slot::Pending)) {
                    *slot = Slot::Failed;
                    failed += 1;
                }
                layout.failed += failed;
            }
            drop(layout);
            context.events.emit_error(&error);
            return;
        }
    };
    let metadata = source.metadata().clone();
    let (thumb_width, thumb_height) =
        fit_dimensions(metadata.width, metadata.height, context.max_dimension);

    let (stride, pending, total) = {
        let layout = context.layout.read();
        if layout.generation != context.generation {
            return;
        }
        let pending: Vec<usize> = layout
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot, Slot::Pending))
            .map(|(index, _)| index)
            .collect();
        (layout.stride, pending, layout.slots.len())
    };

    log::debug!(
        "Building {} of {} thumbnails for {:?} (stride {:.3}s, {}x{})",
        pending.len(),
        total,
        context.path,
        stride,
        thumb_width,
        thumb_height,
    );

    let callback = Arc::new(ThumbnailProgress {
        layout: Arc::clone(&context.layout),
        events: context.events.clone(),
    });
    let batch_size = (total as u64 / 20).max(1);
    let mut tracker = ProgressTracker::new(
        callback,
        OperationType::ThumbnailIndex,
        Some(pending.len() as u64),
        batch_size,
    );

    for slot_index in pending {
        if context.token.is_cancelled() {
            log::debug!("Thumbnail build for {:?} cancelled", context.path);
            break;
        }

        let timestamp = slot_index as f64 * stride;
        let frame_index = frame_index_at(timestamp, metadata.frame_rate, metadata.frame_count);
        let slot = match source.decode_at(frame_index) {
            Ok(frame) => {
                let image = imageops::resize(
                    frame.image(),
                    thumb_width,
                    thumb_height,
                    FilterType::Triangle,
                );
                Slot::Ready(Thumbnail {
                    timestamp,
                    frame_index,
                    image: Arc::new(image),
                })
            }
            Err(error) => {
                log::warn!("Thumbnail at {timestamp:.2}s (frame {frame_index}) failed: {error}");
                Slot::Failed
            }
        };

        {
            let mut layout = context.layout.write();
            if layout.generation != context.generation {
                return;
            }
            if matches!(layout.slots[slot_index], Slot::Pending) {
                match slot {
                    Slot::Ready(_) => layout.built += 1,
                    _ => layout.failed += 1,
                }
                layout.slots[slot_index] = slot;
            }
        }
        tracker.advance(frame_index, timestamp);
    }
    tracker.finish();
}

#[cfg(test)]
mod tests {
    use image::RgbImage;

    use super::*;

    fn metadata(duration_seconds: f64, frame_rate: f64) -> MediaMetadata {
        MediaMetadata {
            duration_seconds,
            frame_rate,
            frame_count: (duration_seconds * frame_rate).round() as u64,
            width: 64,
            height: 36,
            has_audio: false,
            container: "test".to_string(),
            video_codec: "test".to_string(),
            audio_codec: None,
            variable_frame_rate: false,
        }
    }

    #[test]
    fn stride_scales_with_duration() {
        assert!((thumbnail_stride(3600.0, 30.0, 200) - 18.0).abs() < 1e-9);
        assert!((thumbnail_stride(10.0, 30.0, 200) - 0.05).abs() < 1e-9);
    }

    #[test]
    fn stride_never_drops_below_one_frame() {
        let stride = thumbnail_stride(2.0, 10.0, 200);
        assert!((stride - 0.1).abs() < 1e-9);
        assert_eq!(slot_count(&metadata(2.0, 10.0), stride), 20);
    }

    #[test]
    fn nearest_ready_prefers_closest_sample() {
        let meta = metadata(10.0, 10.0);
        let mut layout = Layout::new(&meta, 10, 0);
        let thumb = |timestamp: f64| Thumbnail {
            timestamp,
            frame_index: (timestamp * 10.0) as u64,
            image: Arc::new(RgbImage::new(1, 1)),
        };
        layout.slots[2] = Slot::Ready(thumb(2.0));
        layout.slots[7] = Slot::Ready(thumb(7.0));

        assert_eq!(nearest_ready(&layout, 3.2).map(|t| t.frame_index), Some(20));
        assert_eq!(nearest_ready(&layout, 5.9).map(|t| t.frame_index), Some(70));
        assert_eq!(nearest_ready(&layout, 99.0).map(|t| t.frame_index), Some(70));
    }

    #[test]
    fn empty_layout_has_no_thumbnail() {
        let layout = Layout::new(&metadata(4.0, 25.0), 50, 0);
        assert!(nearest_ready(&layout, 1.0).is_none());
    }
}
