//! # framestep
//!
//! Frame-accurate video playback core with animated GIF export.
//!
//! `framestep` provides everything below the widgets of a desktop video
//! player: opening and probing media files, decoding frames through a
//! bounded LRU cache, paced playback with single-frame stepping and seeking,
//! a sparse timeline thumbnail index, and a cancellable GIF export queue.
//! Containers are decoded with FFmpeg via
//! [`ffmpeg-next`](https://crates.io/crates/ffmpeg-next); animated GIFs are
//! decoded natively.
//!
//! ## Quick Start
//!
//! ### Drive a Session
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use framestep::{PlayerConfig, Session};
//!
//! let mut session = Session::new(PlayerConfig::new()).unwrap();
//! session.open("input.mp4").unwrap();
//! session.seek(12.5).unwrap();
//! session.step_forward().unwrap();
//! session.wait_idle(Duration::from_secs(1)).unwrap();
//! println!("now at frame {}", session.snapshot().playback.current_frame_index);
//! ```
//!
//! ### Export a Clip
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use framestep::{ExportStatus, PlayerConfig, Session};
//!
//! let mut session = Session::new(PlayerConfig::new()).unwrap();
//! session.open("input.mp4").unwrap();
//! let job = session.default_export_job("clip.gif").unwrap();
//! let handle = session.start_export(job).unwrap();
//! let report = handle.wait(Duration::from_secs(60)).unwrap();
//! assert_eq!(report.status, ExportStatus::Completed);
//! ```
//!
//! ### Decode Frames Directly
//!
//! ```no_run
//! use framestep::open_source;
//!
//! let mut source = open_source("input.mp4").unwrap();
//! let landed = source.seek_near(3.0).unwrap();
//! let frame = source.decode_next().unwrap();
//! assert_eq!(frame.index(), landed);
//! frame.image().save("frame.png").unwrap();
//! ```
//!
//! ## Features
//!
//! - **Frame-accurate access**: exact decode by index, keyframe seek with
//!   forward decode, nominal frame grid for variable frame rate files
//! - **Bounded cache**: LRU eviction by resident frame count, one decode per
//!   index under concurrent requests
//! - **Playback**: deadline-paced worker thread, audio-clock reconciliation,
//!   frame skipping when decode falls behind, error tolerance
//! - **Thumbnails**: adaptive stride, incremental background build, never
//!   blocks lookups
//! - **GIF export**: nearest-timestamp resampling, streaming encode,
//!   progress, cooperative cancellation, no partial files
//! - **Events**: all results flow to the UI over a channel
//!
//! ### Optional Features
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `ffmpeg` | Decode video containers with FFmpeg (default) |
//! | `audio` | Play audio tracks through the default output device via `rodio` |
//! | `full` | Enables all of the above |
//!
//! ## Requirements
//!
//! The `ffmpeg` feature needs FFmpeg development libraries installed on the
//! system.

pub mod audio;
pub mod cache;
pub mod configuration;
mod conversion;
pub mod error;
pub mod event;
pub mod export;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg_source;
pub mod frame;
pub mod gif_source;
pub mod metadata;
pub mod playback;
pub mod progress;
pub mod session;
pub mod source;
pub mod thumbnail;

#[cfg(feature = "audio")]
pub use audio::DeviceAudio;
pub use audio::{AudioOutput, SilentAudio};
pub use cache::{CacheStats, FrameCache};
pub use configuration::{ExportOptions, PlayerConfig};
pub use error::{ErrorKind, FramestepError};
pub use event::{DisplayFrame, EventSink, SessionEvent};
pub use export::{
    DurationAdvisory, ExportHandle, ExportJob, ExportOutcome, ExportPipeline, ExportQuality,
    ExportReport, ExportSize, ExportStatus, default_export_range, duration_advisory,
    estimate_export_size, export_gif, format_file_size, sample_frame_indices,
};
#[cfg(feature = "ffmpeg")]
pub use ffmpeg::set_ffmpeg_log_level;
#[cfg(feature = "ffmpeg")]
pub use ffmpeg_source::FfmpegSource;
pub use frame::{FrameRef, Thumbnail};
pub use gif_source::GifSource;
pub use metadata::MediaMetadata;
pub use playback::{PlaybackEngine, PlaybackState, PlaybackStatus, StepDirection};
pub use progress::{CancellationToken, OperationType, ProgressCallback, ProgressInfo};
pub use session::{Session, SessionSnapshot};
pub use source::{DefaultOpener, MediaSource, ProbedFormat, SourceOpener, open_source, probe_format};
pub use thumbnail::{ThumbnailIndex, thumbnail_stride};
