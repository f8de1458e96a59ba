//! Error types for the `framestep` crate.
//!
//! [`FramestepError`] is returned by every fallible operation. Each variant
//! maps onto a coarse [`ErrorKind`] through [`FramestepError::kind`], which is
//! what the session reports to the UI alongside the human-readable message.
//!
//! The error is [`Clone`] so that the same value can be returned to a caller
//! and forwarded inside a [`SessionEvent::Error`](crate::SessionEvent).

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::PathBuf;

use thiserror::Error;

/// Coarse classification of a [`FramestepError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The file is not a recognised media container.
    UnsupportedFormat,
    /// The file could not be read from disk.
    FileNotReadable,
    /// The container was recognised but its video stream is unusable.
    CorruptStream,
    /// A single frame failed to decode.
    DecodeError,
    /// Sequential decoding ran past the last frame.
    EndOfStream,
    /// A time range or frame index lies outside the media.
    InvalidRange,
    /// The GIF encoder rejected a frame or parameter.
    EncodeError,
    /// Export output could not be written.
    DiskWriteError,
    /// A frame buffer could not be allocated.
    OutOfMemory,
    /// The operation was cancelled on request.
    Cancelled,
    /// The command is not valid in the current state.
    InvalidState,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            ErrorKind::UnsupportedFormat => "unsupported format",
            ErrorKind::FileNotReadable => "file not readable",
            ErrorKind::CorruptStream => "corrupt stream",
            ErrorKind::DecodeError => "decode error",
            ErrorKind::EndOfStream => "end of stream",
            ErrorKind::InvalidRange => "invalid range",
            ErrorKind::EncodeError => "encode error",
            ErrorKind::DiskWriteError => "disk write error",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidState => "invalid state",
        };
        f.write_str(name)
    }
}

/// The unified error type for all `framestep` operations.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum FramestepError {
    /// The file was read but is not a container we can decode.
    #[error("Unsupported media format at {path}: {reason}")]
    UnsupportedFormat {
        /// Path that was passed to the opener.
        path: PathBuf,
        /// What the probe found.
        reason: String,
    },

    /// The file could not be opened or read.
    #[error("Failed to read {path}: {reason}")]
    FileNotReadable {
        /// Path that was passed to the opener.
        path: PathBuf,
        /// Underlying I/O failure.
        reason: String,
    },

    /// The container was recognised but its video data is damaged.
    #[error("Corrupt video stream in {path}: {reason}")]
    CorruptStream {
        /// Path of the damaged file.
        path: PathBuf,
        /// Description of the damage.
        reason: String,
    },

    /// The file has no decodable video stream.
    #[error("No video stream found in file")]
    NoVideoStream,

    /// A frame could not be decoded.
    #[error("Failed to decode video frame: {0}")]
    DecodeError(String),

    /// Sequential decoding reached the end of the stream.
    #[error("End of stream reached")]
    EndOfStream,

    /// A frame index beyond the end of the media was requested.
    #[error("Frame {frame_index} is out of range (media has {frame_count} frames)")]
    FrameOutOfRange {
        /// Requested index.
        frame_index: u64,
        /// Number of frames in the media.
        frame_count: u64,
    },

    /// An export range is empty or lies outside the media.
    #[error("Invalid range: [{start:.3}s, {end:.3}s) is not within [0, {duration:.3}s]")]
    InvalidRange {
        /// Requested start, in seconds.
        start: f64,
        /// Requested end, in seconds.
        end: f64,
        /// Media duration, in seconds.
        duration: f64,
    },

    /// A numeric parameter (fps, dimensions, quality) is out of bounds.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// GIF encoding failed.
    #[error("GIF encoding error: {0}")]
    EncodeError(String),

    /// Writing the output file failed.
    #[error("Failed to write {path}: {reason}")]
    DiskWriteError {
        /// Output path.
        path: PathBuf,
        /// Underlying I/O failure.
        reason: String,
    },

    /// A frame buffer allocation failed.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// The operation was cancelled via a [`CancellationToken`](crate::CancellationToken).
    #[error("Operation cancelled")]
    Cancelled,

    /// No media is open in the session.
    #[error("No media is loaded")]
    NoMediaLoaded,

    /// The command is not valid in the current playback state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// An error originating from the FFmpeg libraries.
    #[cfg(feature = "ffmpeg")]
    #[error("FFmpeg error: {0}")]
    FfmpegError(String),
}

impl FramestepError {
    /// Classify this error.
    ///
    /// # Example
    ///
    /// ```
    /// use framestep::{ErrorKind, FramestepError};
    ///
    /// assert_eq!(FramestepError::Cancelled.kind(), ErrorKind::Cancelled);
    /// assert_eq!(FramestepError::NoVideoStream.kind(), ErrorKind::UnsupportedFormat);
    /// ```
    pub fn kind(&self) -> ErrorKind {
        match self {
            FramestepError::UnsupportedFormat { .. } | FramestepError::NoVideoStream => {
                ErrorKind::UnsupportedFormat
            }
            FramestepError::FileNotReadable { .. } => ErrorKind::FileNotReadable,
            FramestepError::CorruptStream { .. } => ErrorKind::CorruptStream,
            FramestepError::DecodeError(_) => ErrorKind::DecodeError,
            #[cfg(feature = "ffmpeg")]
            FramestepError::FfmpegError(_) => ErrorKind::DecodeError,
            FramestepError::EndOfStream => ErrorKind::EndOfStream,
            FramestepError::FrameOutOfRange { .. }
            | FramestepError::InvalidRange { .. }
            | FramestepError::InvalidParameter(_) => ErrorKind::InvalidRange,
            FramestepError::EncodeError(_) => ErrorKind::EncodeError,
            FramestepError::DiskWriteError { .. } => ErrorKind::DiskWriteError,
            FramestepError::OutOfMemory(_) => ErrorKind::OutOfMemory,
            FramestepError::Cancelled => ErrorKind::Cancelled,
            FramestepError::NoMediaLoaded | FramestepError::InvalidState(_) => {
                ErrorKind::InvalidState
            }
        }
    }
}

#[cfg(feature = "ffmpeg")]
impl From<ffmpeg_next::Error> for FramestepError {
    fn from(error: ffmpeg_next::Error) -> Self {
        FramestepError::FfmpegError(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_like_errors_share_a_kind() {
        let range = FramestepError::InvalidRange {
            start: 5.0,
            end: 2.0,
            duration: 10.0,
        };
        let index = FramestepError::FrameOutOfRange {
            frame_index: 400,
            frame_count: 300,
        };
        assert_eq!(range.kind(), ErrorKind::InvalidRange);
        assert_eq!(index.kind(), ErrorKind::InvalidRange);
    }

    #[test]
    fn messages_carry_context() {
        let error = FramestepError::DiskWriteError {
            path: PathBuf::from("/tmp/out.gif"),
            reason: "disk full".to_string(),
        };
        let message = error.to_string();
        assert!(message.contains("/tmp/out.gif"));
        assert!(message.contains("disk full"));
        assert_eq!(error.kind().to_string(), "disk write error");
    }
}
