//! Media source capability interface.
//!
//! A [`MediaSource`] owns exactly one decode context for one file. The
//! implementation is picked by [`DefaultOpener`] from the file's leading
//! bytes, not from its extension: animated GIFs are decoded natively and
//! every other container goes through FFmpeg (feature `ffmpeg`).
//!
//! Dropping a source releases its decode context.

use std::fs::File;
use std::io::{ErrorKind as IoErrorKind, Read};
use std::path::Path;

use crate::error::FramestepError;
use crate::frame::FrameRef;
use crate::gif_source::GifSource;
use crate::metadata::MediaMetadata;

/// Decode primitives over one open media file.
///
/// Frame indices live on the nominal grid `index / frame_rate` described by
/// [`MediaMetadata`].
pub trait MediaSource: Send {
    /// Properties probed at open time.
    fn metadata(&self) -> &MediaMetadata;

    /// Decode the frame at `frame_index` exactly.
    ///
    /// May seek to an earlier keyframe and decode forward. Leaves the cursor
    /// just after the returned frame.
    ///
    /// # Errors
    ///
    /// [`FramestepError::FrameOutOfRange`] past the last frame, or a decode
    /// error.
    fn decode_at(&mut self, frame_index: u64) -> Result<FrameRef, FramestepError>;

    /// Decode the frame under the cursor and advance it.
    ///
    /// # Errors
    ///
    /// [`FramestepError::EndOfStream`] after the last frame.
    fn decode_next(&mut self) -> Result<FrameRef, FramestepError>;

    /// Position the cursor on the last frame whose timestamp is `<= timestamp`
    /// and return its index. The next [`decode_next`](MediaSource::decode_next)
    /// yields that frame.
    fn seek_near(&mut self, timestamp: f64) -> Result<u64, FramestepError>;
}

/// Opens sources for a path.
///
/// The session opens one source for playback, one for the thumbnail builder
/// and one per export, so each gets an independent decode context.
pub trait SourceOpener: Send + Sync {
    /// Open `path` and probe its metadata.
    fn open(&self, path: &Path) -> Result<Box<dyn MediaSource>, FramestepError>;
}

/// Container families recognised from leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbedFormat {
    /// `GIF87a` / `GIF89a`.
    Gif,
    /// ISO base media (MP4, MOV).
    IsoMedia,
    /// Matroska or WebM.
    Matroska,
    /// RIFF AVI.
    Avi,
    /// Flash video.
    Flv,
    /// ASF (WMV).
    Asf,
    /// Nothing we recognise; left to FFmpeg's own probing.
    Unknown,
}

/// Read the first bytes of `path` and classify them.
///
/// # Errors
///
/// [`FramestepError::FileNotReadable`] if the file cannot be read, and
/// [`FramestepError::UnsupportedFormat`] if it is empty.
pub fn probe_format(path: &Path) -> Result<ProbedFormat, FramestepError> {
    let not_readable = |reason: String| FramestepError::FileNotReadable {
        path: path.to_path_buf(),
        reason,
    };

    let mut file = File::open(path).map_err(|error| not_readable(error.to_string()))?;
    let mut header = [0_u8; 16];
    let mut filled = 0;
    while filled < header.len() {
        match file.read(&mut header[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(error) if error.kind() == IoErrorKind::Interrupted => continue,
            Err(error) => return Err(not_readable(error.to_string())),
        }
    }

    if filled == 0 {
        return Err(FramestepError::UnsupportedFormat {
            path: path.to_path_buf(),
            reason: "file is empty".to_string(),
        });
    }

    Ok(classify_header(&header[..filled]))
}

fn classify_header(header: &[u8]) -> ProbedFormat {
    if header.starts_with(b"GIF87a") || header.starts_with(b"GIF89a") {
        ProbedFormat::Gif
    } else if header.len() >= 8 && &header[4..8] == b"ftyp" {
        ProbedFormat::IsoMedia
    } else if header.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        ProbedFormat::Matroska
    } else if header.len() >= 12 && header.starts_with(b"RIFF") && &header[8..12] == b"AVI " {
        ProbedFormat::Avi
    } else if header.starts_with(b"FLV") {
        ProbedFormat::Flv
    } else if header.starts_with(&[0x30, 0x26, 0xB2, 0x75]) {
        ProbedFormat::Asf
    } else {
        ProbedFormat::Unknown
    }
}

/// Opener that picks the decoder from the file's leading bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultOpener;

impl SourceOpener for DefaultOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn MediaSource>, FramestepError> {
        let format = probe_format(path)?;
        log::debug!("Probed {path:?} as {format:?}");

        match format {
            ProbedFormat::Gif => Ok(Box::new(GifSource::open(path)?)),
            #[cfg(feature = "ffmpeg")]
            other => Ok(Box::new(
                crate::ffmpeg_source::FfmpegSource::open_with_hint(path, other)?,
            )),
            #[cfg(not(feature = "ffmpeg"))]
            other => Err(FramestepError::UnsupportedFormat {
                path: path.to_path_buf(),
                reason: format!("{other:?} input requires the `ffmpeg` feature"),
            }),
        }
    }
}

/// Open `path` with the [`DefaultOpener`].
///
/// # Example
///
/// ```no_run
/// use framestep::open_source;
///
/// let mut source = open_source("clip.gif")?;
/// let frame = source.decode_at(0)?;
/// assert_eq!(frame.index(), 0);
/// # Ok::<(), framestep::FramestepError>(())
/// ```
pub fn open_source<P: AsRef<Path>>(path: P) -> Result<Box<dyn MediaSource>, FramestepError> {
    DefaultOpener.open(path.as_ref())
}
