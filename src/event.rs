//! Notifications from the session to the UI layer.
//!
//! Workers never call back into UI code. They push [`SessionEvent`]s onto an
//! unbounded channel that the UI drains on its own thread.
//!
//! Only frames produced by the playback clock may be dropped: when the UI
//! still holds `frame_backlog` undisplayed frames, further clock frames are
//! discarded so the queue never grows without bound during playback. Frames
//! requested by a seek, step, stop or refresh are always delivered.

use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::error::{ErrorKind, FramestepError};
use crate::export::ExportReport;
use crate::frame::FrameRef;
use crate::metadata::MediaMetadata;
use crate::playback::PlaybackState;

/// Outstanding frames above which playback clock frames are dropped.
pub const DEFAULT_FRAME_BACKLOG: usize = 8;

/// Everything the session reports asynchronously.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum SessionEvent {
    /// A file was opened and probed.
    MediaOpened {
        /// Path as passed to `open`.
        path: PathBuf,
        /// Probed properties.
        metadata: MediaMetadata,
    },
    /// The open file was closed.
    MediaClosed,
    /// A frame should be displayed.
    FrameReady(DisplayFrame),
    /// Playback status, position, volume or error flag changed.
    PlaybackStateChanged(PlaybackState),
    /// Playback reached the last frame.
    PlaybackFinished,
    /// More timeline thumbnails are available.
    ThumbnailsUpdated {
        /// Samples built so far.
        available: usize,
        /// Samples in a complete index.
        total: usize,
    },
    /// An export encoded another frame.
    ExportProgress {
        /// Job the progress belongs to.
        job_id: u64,
        /// Frames encoded so far.
        frames_processed: u64,
        /// Frames the job will encode.
        total_frames: u64,
    },
    /// An export reached a terminal status.
    ExportFinished(ExportReport),
    /// A failure the user should see.
    Error {
        /// Coarse classification.
        kind: ErrorKind,
        /// Readable cause.
        message: String,
    },
}

/// Decrements the sink's outstanding frame count when the last clone of a
/// delivered frame goes away.
#[derive(Debug)]
struct Outstanding(Arc<AtomicUsize>);

impl Drop for Outstanding {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A frame sent to the UI.
///
/// Dereferences to [`FrameRef`]. Until it is dropped it counts against the
/// frame backlog of the sink that sent it; keep the plain [`FrameRef`] from
/// [`into_frame`](DisplayFrame::into_frame) if the frame must outlive the
/// event.
#[derive(Debug, Clone)]
pub struct DisplayFrame {
    frame: FrameRef,
    _outstanding: Arc<Outstanding>,
}

impl DisplayFrame {
    pub fn frame(&self) -> &FrameRef {
        &self.frame
    }

    /// Release the backlog slot and keep the frame.
    pub fn into_frame(self) -> FrameRef {
        self.frame
    }
}

impl Deref for DisplayFrame {
    type Target = FrameRef;

    fn deref(&self) -> &FrameRef {
        &self.frame
    }
}

/// Cloneable sending half used by every worker.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: Sender<SessionEvent>,
    frame_backlog: usize,
    outstanding_frames: Arc<AtomicUsize>,
}

impl EventSink {
    /// Create a sink and the receiver the UI drains.
    pub fn channel(frame_backlog: usize) -> (Self, Receiver<SessionEvent>) {
        let (sender, receiver) = unbounded();
        (
            Self {
                sender,
                frame_backlog: frame_backlog.max(1),
                outstanding_frames: Arc::new(AtomicUsize::new(0)),
            },
            receiver,
        )
    }

    /// A sink whose events go nowhere.
    pub fn detached() -> Self {
        Self::channel(DEFAULT_FRAME_BACKLOG).0
    }

    /// Deliver `event`. Events sent after the receiver is gone are discarded.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }

    /// Deliver a frame the user asked for. Never dropped.
    pub fn emit_frame(&self, frame: FrameRef) {
        self.outstanding_frames.fetch_add(1, Ordering::AcqRel);
        let outstanding = Arc::new(Outstanding(Arc::clone(&self.outstanding_frames)));
        self.emit(SessionEvent::FrameReady(DisplayFrame {
            frame,
            _outstanding: outstanding,
        }));
    }

    /// Deliver a playback clock frame unless the UI still holds
    /// `frame_backlog` frames it has not released.
    ///
    /// Returns `false` if the frame was dropped.
    pub fn emit_clock_frame(&self, frame: FrameRef) -> bool {
        if self.outstanding_frames() >= self.frame_backlog {
            log::trace!("Dropping frame {} for a slow consumer", frame.index());
            return false;
        }
        self.emit_frame(frame);
        true
    }

    /// Frames sent and not yet dropped by the consumer.
    pub fn outstanding_frames(&self) -> usize {
        self.outstanding_frames.load(Ordering::Acquire)
    }

    pub fn emit_error(&self, error: &FramestepError) {
        self.emit(SessionEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use image::RgbImage;

    use super::*;

    fn frame(index: u64) -> FrameRef {
        FrameRef::new(index, index as f64, RgbImage::new(1, 1))
    }

    #[test]
    fn clock_frames_drop_when_backlogged_but_other_events_do_not() {
        let (sink, receiver) = EventSink::channel(2);
        assert!(sink.emit_clock_frame(frame(0)));
        assert!(sink.emit_clock_frame(frame(1)));
        assert!(!sink.emit_clock_frame(frame(2)));
        sink.emit(SessionEvent::PlaybackFinished);
        assert_eq!(receiver.len(), 3);
    }

    #[test]
    fn only_frames_count_against_the_backlog() {
        let (sink, receiver) = EventSink::channel(2);
        for _ in 0..10 {
            sink.emit(SessionEvent::MediaClosed);
        }
        assert!(sink.emit_clock_frame(frame(0)));
        assert_eq!(sink.outstanding_frames(), 1);
        assert_eq!(receiver.len(), 11);
    }

    #[test]
    fn requested_frames_ignore_the_backlog() {
        let (sink, receiver) = EventSink::channel(1);
        assert!(sink.emit_clock_frame(frame(0)));
        sink.emit_frame(frame(7));
        assert_eq!(sink.outstanding_frames(), 2);
        let indices: Vec<u64> = receiver
            .try_iter()
            .filter_map(|event| match event {
                SessionEvent::FrameReady(frame) => Some(frame.index()),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![0, 7]);
    }

    #[test]
    fn releasing_a_frame_frees_its_slot() {
        let (sink, receiver) = EventSink::channel(1);
        assert!(sink.emit_clock_frame(frame(0)));
        assert!(!sink.emit_clock_frame(frame(1)));

        let kept = match receiver.try_recv() {
            Ok(SessionEvent::FrameReady(shown)) => shown.into_frame(),
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(kept.index(), 0);
        assert_eq!(sink.outstanding_frames(), 0);
        assert!(sink.emit_clock_frame(frame(2)));
    }

    #[test]
    fn errors_carry_kind_and_message() {
        let (sink, receiver) = EventSink::channel(4);
        sink.emit_error(&FramestepError::Cancelled);
        match receiver.try_recv() {
            Ok(SessionEvent::Error { kind, message }) => {
                assert_eq!(kind, ErrorKind::Cancelled);
                assert_eq!(message, "Operation cancelled");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
