//! Session controller.
//!
//! A [`Session`] owns at most one open media file together with its frame
//! cache, thumbnail index and playback engine, plus the export queue that
//! outlives individual files. UI commands go through the session; results
//! come back as [`SessionEvent`]s on the channel returned by
//! [`Session::events`].
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use framestep::{PlayerConfig, Session, SessionEvent};
//!
//! let mut session = Session::new(PlayerConfig::new())?;
//! let events = session.events();
//! session.open("movie.mp4")?;
//! session.play()?;
//!
//! while let Ok(event) = events.recv_timeout(Duration::from_secs(1)) {
//!     if let SessionEvent::FrameReady(frame) = event {
//!         println!("frame {} at {:.3}s", frame.index(), frame.timestamp());
//!     }
//! }
//! # Ok::<(), framestep::FramestepError>(())
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::audio::{AudioOutput, SilentAudio};
use crate::cache::{CacheStats, FrameCache};
use crate::configuration::PlayerConfig;
use crate::conversion::frame_timestamp;
use crate::error::FramestepError;
use crate::event::{DEFAULT_FRAME_BACKLOG, EventSink, SessionEvent};
use crate::export::{ExportHandle, ExportJob, ExportPipeline};
use crate::frame::{FrameRef, Thumbnail};
use crate::metadata::MediaMetadata;
use crate::playback::{PlaybackEngine, PlaybackState, StepDirection};
use crate::source::{DefaultOpener, SourceOpener};
use crate::thumbnail::ThumbnailIndex;

/// Everything tied to the currently open file.
struct MediaHandle {
    path: PathBuf,
    metadata: MediaMetadata,
    cache: Arc<FrameCache>,
    thumbnails: ThumbnailIndex,
    engine: PlaybackEngine,
}

/// Consistent view of the session for rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    /// Open file, if any.
    pub path: Option<PathBuf>,
    pub metadata: Option<MediaMetadata>,
    pub playback: PlaybackState,
    /// Timestamp of the current frame in seconds.
    pub position_seconds: f64,
    pub thumbnails_available: usize,
    pub thumbnails_total: usize,
    /// Export jobs queued or running.
    pub pending_exports: usize,
}

/// One player window's worth of state.
pub struct Session {
    config: PlayerConfig,
    opener: Arc<dyn SourceOpener>,
    events: EventSink,
    receiver: Receiver<SessionEvent>,
    media: Option<MediaHandle>,
    exports: ExportPipeline,
}

impl Session {
    /// Create a session that opens files with the [`DefaultOpener`].
    pub fn new(config: PlayerConfig) -> Result<Self, FramestepError> {
        Self::with_opener(config, Arc::new(DefaultOpener))
    }

    /// Create a session with a custom source opener.
    pub fn with_opener(
        config: PlayerConfig,
        opener: Arc<dyn SourceOpener>,
    ) -> Result<Self, FramestepError> {
        let (events, receiver) = EventSink::channel(DEFAULT_FRAME_BACKLOG);
        let exports = ExportPipeline::new(Arc::clone(&opener), events.clone())?;
        Ok(Self {
            config,
            opener,
            events,
            receiver,
            media: None,
            exports,
        })
    }

    /// Receiver for session events. Clones share one queue.
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.receiver.clone()
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    /// Open `path`, replacing the current file.
    ///
    /// The new file is probed before anything else changes. On success the
    /// previous file is closed, [`SessionEvent::MediaOpened`] is emitted and
    /// frame 0 is shown with playback `Stopped`.
    ///
    /// # Errors
    ///
    /// Probe failures are returned as-is and leave the session untouched.
    pub fn open<P: AsRef<Path>>(&mut self, path: P) -> Result<MediaMetadata, FramestepError> {
        let path = path.as_ref();
        let source = self.opener.open(path)?;
        let metadata = source.metadata().clone();
        log::info!(
            "Opened {path:?}: {}x{} @ {:.3} fps, {} frames, {:.2}s",
            metadata.width,
            metadata.height,
            metadata.frame_rate,
            metadata.frame_count,
            metadata.duration_seconds,
        );

        self.close();

        let cache = Arc::new(FrameCache::new(source, self.config.cache_capacity));
        let audio = audio_output(path, &metadata);
        let engine = PlaybackEngine::new(
            Arc::clone(&cache),
            audio,
            self.events.clone(),
            self.config.frame_error_tolerance,
        )?;
        let thumbnails = ThumbnailIndex::new(
            Arc::clone(&self.opener),
            path.to_path_buf(),
            metadata.clone(),
            self.config.thumbnail_samples,
            self.config.thumbnail_max_dimension,
            self.events.clone(),
        );

        self.events.emit(SessionEvent::MediaOpened {
            path: path.to_path_buf(),
            metadata: metadata.clone(),
        });
        engine.refresh()?;
        if self.config.auto_build_thumbnails {
            thumbnails.start();
        }

        self.media = Some(MediaHandle {
            path: path.to_path_buf(),
            metadata: metadata.clone(),
            cache,
            thumbnails,
            engine,
        });
        Ok(metadata)
    }

    /// Stop playback and release the open file. Exports keep running.
    ///
    /// No frame or state events for the closed file follow; `MediaClosed` is
    /// the last thing it reports.
    pub fn close(&mut self) {
        if let Some(media) = self.media.take() {
            log::debug!("Closing {:?}", media.path);
            media.thumbnails.stop();
            // Dropping the engine shuts its worker down and silences audio.
            drop(media);
            self.events.emit(SessionEvent::MediaClosed);
        }
    }

    pub fn is_open(&self) -> bool {
        self.media.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.media.as_ref().map(|media| media.path.as_path())
    }

    pub fn metadata(&self) -> Option<&MediaMetadata> {
        self.media.as_ref().map(|media| &media.metadata)
    }

    fn media(&self) -> Result<&MediaHandle, FramestepError> {
        self.media.as_ref().ok_or(FramestepError::NoMediaLoaded)
    }

    pub fn play(&self) -> Result<(), FramestepError> {
        self.media()?.engine.play()
    }

    pub fn pause(&self) -> Result<(), FramestepError> {
        self.media()?.engine.pause()
    }

    pub fn stop(&self) -> Result<(), FramestepError> {
        self.media()?.engine.stop()
    }

    pub fn step_forward(&self) -> Result<(), FramestepError> {
        self.media()?.engine.step(StepDirection::Forward)
    }

    pub fn step_backward(&self) -> Result<(), FramestepError> {
        self.media()?.engine.step(StepDirection::Backward)
    }

    pub fn seek(&self, timestamp: f64) -> Result<(), FramestepError> {
        self.media()?.engine.seek(timestamp)
    }

    pub fn seek_to_frame(&self, frame_index: u64) -> Result<(), FramestepError> {
        self.media()?.engine.seek_to_frame(frame_index)
    }

    pub fn set_volume(&self, volume: f32) -> Result<(), FramestepError> {
        self.media()?.engine.set_volume(volume)
    }

    pub fn set_muted(&self, muted: bool) -> Result<(), FramestepError> {
        self.media()?.engine.set_muted(muted)
    }

    /// Block until the playback worker has applied every command sent so far.
    pub fn wait_idle(&self, timeout: Duration) -> Result<(), FramestepError> {
        self.media()?.engine.wait_idle(timeout)
    }

    /// Fetch a frame through the playback cache.
    pub fn frame(&self, frame_index: u64) -> Result<FrameRef, FramestepError> {
        self.media()?.cache.get_frame(frame_index)
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.media.as_ref().map(|media| media.cache.stats())
    }

    /// Nearest timeline thumbnail to `timestamp`. Never blocks.
    pub fn thumbnail(&self, timestamp: f64) -> Option<Thumbnail> {
        self.media.as_ref()?.thumbnails.get_thumbnail(timestamp)
    }

    /// Change the timeline sample count. Returns `true` if the index was reset.
    pub fn set_thumbnail_samples(&mut self, samples: usize) -> Result<bool, FramestepError> {
        let media = self.media()?;
        let reset = media.thumbnails.set_sample_count(samples);
        self.config.thumbnail_samples = samples.max(1);
        Ok(reset)
    }

    /// Thumbnail index of the open file.
    pub fn thumbnails(&self) -> Option<&ThumbnailIndex> {
        self.media.as_ref().map(|media| &media.thumbnails)
    }

    /// Export job pre-filled from the configuration, starting at the current
    /// position.
    pub fn default_export_job<P: Into<PathBuf>>(
        &self,
        output_path: P,
    ) -> Result<ExportJob, FramestepError> {
        let media = self.media()?;
        let position = frame_timestamp(
            media.engine.state().current_frame_index,
            media.metadata.frame_rate,
        );
        Ok(ExportJob::from_config(
            &self.config,
            position,
            media.metadata.duration_seconds,
            output_path,
        ))
    }

    /// Queue `job` against the open file.
    ///
    /// # Errors
    ///
    /// [`FramestepError::NoMediaLoaded`] without a file, or the job's
    /// validation error. Nothing is queued or written in either case.
    pub fn start_export(&self, job: ExportJob) -> Result<ExportHandle, FramestepError> {
        let media = self.media()?;
        self.exports.submit(&media.path, &media.metadata, job)
    }

    /// Cancel export `job_id`. Returns `false` if it is unknown or finished.
    pub fn cancel_export(&self, job_id: u64) -> bool {
        self.exports.cancel(job_id)
    }

    /// Export jobs queued or running.
    pub fn pending_exports(&self) -> Vec<ExportHandle> {
        self.exports.pending()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let pending_exports = self.exports.pending().len();
        match &self.media {
            Some(media) => {
                let playback = media.engine.state();
                SessionSnapshot {
                    path: Some(media.path.clone()),
                    metadata: Some(media.metadata.clone()),
                    position_seconds: frame_timestamp(
                        playback.current_frame_index,
                        media.metadata.frame_rate,
                    ),
                    playback,
                    thumbnails_available: media.thumbnails.available(),
                    thumbnails_total: media.thumbnails.total(),
                    pending_exports,
                }
            }
            None => SessionSnapshot {
                path: None,
                metadata: None,
                playback: PlaybackState::default(),
                position_seconds: 0.0,
                thumbnails_available: 0,
                thumbnails_total: 0,
                pending_exports,
            },
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(feature = "audio")]
fn audio_output(path: &Path, metadata: &MediaMetadata) -> Box<dyn AudioOutput> {
    if metadata.has_audio {
        match crate::audio::DeviceAudio::open(path) {
            Ok(device) => return Box::new(device),
            Err(error) => log::warn!("Audio disabled for {path:?}: {error}"),
        }
    }
    Box::new(SilentAudio)
}

#[cfg(not(feature = "audio"))]
fn audio_output(_path: &Path, metadata: &MediaMetadata) -> Box<dyn AudioOutput> {
    if metadata.has_audio {
        log::debug!("Built without the `audio` feature; playing video only");
    }
    Box::new(SilentAudio)
}
