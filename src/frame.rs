//! Decoded frame values.
//!
//! Frames are shared between the cache, the playback thread and the UI, so
//! the pixel buffer sits behind an [`Arc`] and a [`FrameRef`] is never mutated
//! after it is produced.

use std::sync::Arc;

use image::RgbImage;

/// A decoded video frame tagged with its position in the stream.
#[derive(Debug, Clone)]
pub struct FrameRef {
    index: u64,
    timestamp: f64,
    image: Arc<RgbImage>,
}

impl FrameRef {
    /// Wrap a decoded image.
    pub fn new(index: u64, timestamp: f64, image: RgbImage) -> Self {
        Self {
            index,
            timestamp,
            image: Arc::new(image),
        }
    }

    /// Zero-based frame index.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Presentation time in seconds.
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// RGB8 pixel data.
    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Shared handle to the pixel data.
    pub fn image_arc(&self) -> Arc<RgbImage> {
        Arc::clone(&self.image)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// `true` when both frames carry the same index and identical pixels.
    pub fn same_content(&self, other: &FrameRef) -> bool {
        self.index == other.index
            && (Arc::ptr_eq(&self.image, &other.image)
                || self.image.as_raw() == other.image.as_raw())
    }
}

/// A downscaled timeline preview.
#[derive(Debug, Clone)]
pub struct Thumbnail {
    /// Sample time in seconds.
    pub timestamp: f64,
    /// Frame the sample was taken from.
    pub frame_index: u64,
    /// Scaled RGB8 image.
    pub image: Arc<RgbImage>,
}
