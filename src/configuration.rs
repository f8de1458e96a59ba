//! Player and export configuration.
//!
//! [`PlayerConfig`] carries the tunables of a [`Session`](crate::Session):
//! cache bound, thumbnail sampling, error tolerance and export defaults.
//! [`ExportOptions`] threads progress callbacks and cancellation through a
//! synchronous [`export_gif`](crate::export_gif) call.
//!
//! # Example
//!
//! ```
//! use framestep::{ExportQuality, ExportSize, PlayerConfig};
//!
//! let config = PlayerConfig::new()
//!     .with_cache_capacity(64)
//!     .with_thumbnail_samples(100)
//!     .with_default_export_size(ExportSize::Small)
//!     .with_default_export_quality(ExportQuality::High.level());
//! assert_eq!(config.cache_capacity, 64);
//! ```

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;

use crate::export::ExportSize;
use crate::progress::{CancellationToken, NoOpProgress, ProgressCallback};

/// Resident frames kept by the playback cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 120;
/// Timeline thumbnail samples across the whole duration.
pub const DEFAULT_THUMBNAIL_SAMPLES: usize = 200;
/// Longest edge of a timeline thumbnail, in pixels.
pub const DEFAULT_THUMBNAIL_MAX_DIMENSION: u32 = 160;
/// Consecutive playback decode failures before pausing.
pub const DEFAULT_FRAME_ERROR_TOLERANCE: u32 = 3;
/// Export frame rate.
pub const DEFAULT_EXPORT_FPS: f64 = 10.0;
/// Export quality on the 1 to 100 scale.
pub const DEFAULT_EXPORT_QUALITY: u8 = 85;

/// Tunables for a playback session.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub struct PlayerConfig {
    /// Maximum decoded frames resident in the playback cache.
    pub cache_capacity: usize,
    /// Number of timeline thumbnails to sample.
    pub thumbnail_samples: usize,
    /// Longest edge of each thumbnail.
    pub thumbnail_max_dimension: u32,
    /// Start building the thumbnail index as soon as media opens.
    pub auto_build_thumbnails: bool,
    /// Consecutive playback decode failures tolerated before pausing.
    pub frame_error_tolerance: u32,
    /// Frame rate pre-filled into new export jobs.
    pub default_export_fps: f64,
    /// Quality pre-filled into new export jobs.
    pub default_export_quality: u8,
    /// Output size pre-filled into new export jobs.
    pub default_export_size: ExportSize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayerConfig {
    /// Defaults: 120 cached frames, 200 thumbnails of 160 px, tolerance 3,
    /// exports at 10 fps, quality 85, 480x270.
    pub fn new() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            thumbnail_samples: DEFAULT_THUMBNAIL_SAMPLES,
            thumbnail_max_dimension: DEFAULT_THUMBNAIL_MAX_DIMENSION,
            auto_build_thumbnails: true,
            frame_error_tolerance: DEFAULT_FRAME_ERROR_TOLERANCE,
            default_export_fps: DEFAULT_EXPORT_FPS,
            default_export_quality: DEFAULT_EXPORT_QUALITY,
            default_export_size: ExportSize::Medium,
        }
    }

    /// Set the cache bound. Clamped to a minimum of 1.
    pub fn with_cache_capacity(mut self, frames: usize) -> Self {
        self.cache_capacity = frames.max(1);
        self
    }

    /// Set the thumbnail sample count. Clamped to a minimum of 1.
    pub fn with_thumbnail_samples(mut self, samples: usize) -> Self {
        self.thumbnail_samples = samples.max(1);
        self
    }

    /// Set the longest thumbnail edge. Clamped to a minimum of 1.
    pub fn with_thumbnail_max_dimension(mut self, pixels: u32) -> Self {
        self.thumbnail_max_dimension = pixels.max(1);
        self
    }

    pub fn with_auto_build_thumbnails(mut self, enabled: bool) -> Self {
        self.auto_build_thumbnails = enabled;
        self
    }

    /// Set how many consecutive decode failures playback absorbs.
    /// Clamped to a minimum of 1.
    pub fn with_frame_error_tolerance(mut self, failures: u32) -> Self {
        self.frame_error_tolerance = failures.max(1);
        self
    }

    pub fn with_default_export_fps(mut self, fps: f64) -> Self {
        self.default_export_fps = fps;
        self
    }

    /// Clamped to 1..=100.
    pub fn with_default_export_quality(mut self, quality: u8) -> Self {
        self.default_export_quality = quality.clamp(1, 100);
        self
    }

    pub fn with_default_export_size(mut self, size: ExportSize) -> Self {
        self.default_export_size = size;
        self
    }
}

/// Operational settings for a single export run.
///
/// All fields have defaults: no progress callback, no cancellation, a
/// progress report after every encoded frame.
#[derive(Clone)]
pub struct ExportOptions {
    pub(crate) progress: Arc<dyn ProgressCallback>,
    pub(crate) cancellation: Option<CancellationToken>,
    pub(crate) batch_size: u64,
}

impl Debug for ExportOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("ExportOptions")
            .field("has_cancellation", &self.cancellation.is_some())
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl ExportOptions {
    pub fn new() -> Self {
        Self {
            progress: Arc::new(NoOpProgress),
            cancellation: None,
            batch_size: 1,
        }
    }

    /// Attach a progress callback.
    #[must_use]
    pub fn with_progress(mut self, callback: Arc<dyn ProgressCallback>) -> Self {
        self.progress = callback;
        self
    }

    /// Attach a cancellation token, checked before every output frame.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Report progress every `size` frames instead of every frame.
    /// Clamped to a minimum of 1.
    #[must_use]
    pub fn with_batch_size(mut self, size: u64) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|token| token.is_cancelled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_clamp_degenerate_values() {
        let config = PlayerConfig::new()
            .with_cache_capacity(0)
            .with_thumbnail_samples(0)
            .with_frame_error_tolerance(0)
            .with_default_export_quality(0);
        assert_eq!(config.cache_capacity, 1);
        assert_eq!(config.thumbnail_samples, 1);
        assert_eq!(config.frame_error_tolerance, 1);
        assert_eq!(config.default_export_quality, 1);
    }

    #[test]
    fn export_options_track_cancellation() {
        let token = CancellationToken::new();
        let options = ExportOptions::new().with_cancellation(token.clone());
        assert!(!options.is_cancelled());
        token.cancel();
        assert!(options.is_cancelled());
        assert!(format!("{options:?}").contains("has_cancellation: true"));
    }
}
