//! Media metadata types.
//!
//! [`MediaMetadata`] is probed once when a source is opened and stays
//! immutable for the lifetime of the handle.

/// Properties of an opened media file.
///
/// # Example
///
/// ```no_run
/// use framestep::open_source;
///
/// let source = open_source("input.mp4")?;
/// let metadata = source.metadata();
/// println!("{}x{} @ {:.2} fps", metadata.width, metadata.height, metadata.frame_rate);
/// # Ok::<(), framestep::FramestepError>(())
/// ```
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub struct MediaMetadata {
    /// Total duration in seconds.
    pub duration_seconds: f64,
    /// Nominal frames per second used for all index/timestamp conversions.
    pub frame_rate: f64,
    /// Number of addressable frames. Always at least 1.
    pub frame_count: u64,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Whether the file carries a decodable audio stream.
    pub has_audio: bool,
    /// Container format name (e.g. `"mp4"`, `"matroska"`, `"gif"`).
    pub container: String,
    /// Video codec name (e.g. `"h264"`, `"gif"`).
    pub video_codec: String,
    /// Audio codec name, if an audio stream is present.
    pub audio_codec: Option<String>,
    /// `true` when frame durations are known to vary.
    ///
    /// Frame indices are still assigned on the nominal `frame_rate` grid.
    pub variable_frame_rate: bool,
}

impl MediaMetadata {
    /// Index of the last frame.
    pub fn last_frame_index(&self) -> u64 {
        self.frame_count.saturating_sub(1)
    }

    /// Width divided by height, or `1.0` for degenerate sizes.
    pub fn aspect_ratio(&self) -> f64 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f64 / self.height as f64
        }
    }
}
