//! Shared fixtures for integration tests.
//!
//! [`PatternSource`] is a synthetic constant-frame-rate source whose pixels
//! encode the frame index, so tests can check exactly which frame they got
//! without any media files. GIF fixtures are written on the fly with the
//! `gif` crate.

#![allow(dead_code)]

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use framestep::{
    FrameRef, FramestepError, MediaMetadata, MediaSource, SessionEvent, SourceOpener,
};
use image::RgbImage;

pub fn sample_video_path() -> &'static str {
    "tests/fixtures/sample_video.mp4"
}

pub fn pattern_metadata(frame_count: u64, frame_rate: f64, width: u32, height: u32) -> MediaMetadata {
    MediaMetadata {
        duration_seconds: frame_count as f64 / frame_rate,
        frame_rate,
        frame_count,
        width,
        height,
        has_audio: false,
        container: "pattern".to_string(),
        video_codec: "rawvideo".to_string(),
        audio_codec: None,
        variable_frame_rate: false,
    }
}

/// Pixels for frame `index`: red and green carry the index, blue a gradient.
pub fn pattern_image(index: u64, width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([
            (index & 0xFF) as u8,
            ((index >> 8) & 0xFF) as u8,
            ((x + y) & 0xFF) as u8,
        ])
    })
}

/// Recover the index a pattern frame was generated for.
pub fn pattern_index(frame: &FrameRef) -> u64 {
    let pixel = frame.image().get_pixel(0, 0);
    u64::from(pixel[0]) | (u64::from(pixel[1]) << 8)
}

/// Deterministic synthetic source.
pub struct PatternSource {
    metadata: MediaMetadata,
    cursor: u64,
    failing: Arc<HashSet<u64>>,
    decodes: Arc<AtomicUsize>,
    decode_delay: Duration,
}

impl PatternSource {
    pub fn new(frame_count: u64, frame_rate: f64) -> Self {
        Self::with_size(frame_count, frame_rate, 16, 9)
    }

    pub fn with_size(frame_count: u64, frame_rate: f64, width: u32, height: u32) -> Self {
        Self {
            metadata: pattern_metadata(frame_count, frame_rate, width, height),
            cursor: 0,
            failing: Arc::new(HashSet::new()),
            decodes: Arc::new(AtomicUsize::new(0)),
            decode_delay: Duration::ZERO,
        }
    }

    /// Make decoding of `indices` fail with a decode error.
    pub fn failing<I: IntoIterator<Item = u64>>(mut self, indices: I) -> Self {
        self.failing = Arc::new(indices.into_iter().collect());
        self
    }

    /// Sleep this long inside every decode.
    pub fn decode_delay(mut self, delay: Duration) -> Self {
        self.decode_delay = delay;
        self
    }

    /// Shared counter of decode calls.
    pub fn decode_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.decodes)
    }
}

impl MediaSource for PatternSource {
    fn metadata(&self) -> &MediaMetadata {
        &self.metadata
    }

    fn decode_at(&mut self, frame_index: u64) -> Result<FrameRef, FramestepError> {
        if frame_index >= self.metadata.frame_count {
            return Err(FramestepError::FrameOutOfRange {
                frame_index,
                frame_count: self.metadata.frame_count,
            });
        }
        self.decodes.fetch_add(1, Ordering::SeqCst);
        if !self.decode_delay.is_zero() {
            thread::sleep(self.decode_delay);
        }
        self.cursor = frame_index + 1;
        if self.failing.contains(&frame_index) {
            return Err(FramestepError::DecodeError(format!(
                "synthetic failure at frame {frame_index}"
            )));
        }
        Ok(FrameRef::new(
            frame_index,
            frame_index as f64 / self.metadata.frame_rate,
            pattern_image(frame_index, self.metadata.width, self.metadata.height),
        ))
    }

    fn decode_next(&mut self) -> Result<FrameRef, FramestepError> {
        if self.cursor >= self.metadata.frame_count {
            return Err(FramestepError::EndOfStream);
        }
        self.decode_at(self.cursor)
    }

    fn seek_near(&mut self, timestamp: f64) -> Result<u64, FramestepError> {
        let raw = (timestamp.max(0.0) * self.metadata.frame_rate + 1e-6).floor() as u64;
        let index = raw.min(self.metadata.frame_count - 1);
        self.cursor = index;
        Ok(index)
    }
}

/// Opener producing [`PatternSource`]s regardless of path.
#[derive(Clone)]
pub struct PatternOpener {
    pub frame_count: u64,
    pub frame_rate: f64,
    pub width: u32,
    pub height: u32,
    pub failing: Vec<u64>,
    pub decode_delay: Duration,
    pub opens: Arc<AtomicUsize>,
}

impl PatternOpener {
    pub fn new(frame_count: u64, frame_rate: f64) -> Self {
        Self {
            frame_count,
            frame_rate,
            width: 16,
            height: 9,
            failing: Vec::new(),
            decode_delay: Duration::ZERO,
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_decode_delay(mut self, delay: Duration) -> Self {
        self.decode_delay = delay;
        self
    }
}

impl SourceOpener for PatternOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn MediaSource>, FramestepError> {
        if path.to_string_lossy().contains("corrupt") {
            return Err(FramestepError::CorruptStream {
                path: path.to_path_buf(),
                reason: "synthetic corruption".to_string(),
            });
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(
            PatternSource::with_size(self.frame_count, self.frame_rate, self.width, self.height)
                .failing(self.failing.iter().copied())
                .decode_delay(self.decode_delay),
        ))
    }
}

/// Write an animated GIF with one solid-coloured frame per entry.
pub fn write_gif_fixture(
    path: &Path,
    colors: &[[u8; 3]],
    width: u16,
    height: u16,
    delay_centiseconds: u16,
) -> PathBuf {
    let file = File::create(path).unwrap();
    let mut encoder = gif::Encoder::new(file, width, height, &[]).unwrap();
    encoder.set_repeat(gif::Repeat::Infinite).unwrap();
    for color in colors {
        let pixels: Vec<u8> = (0..usize::from(width) * usize::from(height))
            .flat_map(|_| color.iter().copied())
            .collect();
        let mut frame = gif::Frame::from_rgb(width, height, &pixels);
        frame.delay = delay_centiseconds;
        encoder.write_frame(&frame).unwrap();
    }
    path.to_path_buf()
}

/// Count frames and read the delays of a GIF on disk.
pub fn read_gif(path: &Path) -> (u16, u16, Vec<u16>) {
    let mut options = gif::DecodeOptions::new();
    options.set_color_output(gif::ColorOutput::RGBA);
    let mut decoder = options.read_info(File::open(path).unwrap()).unwrap();
    let (width, height) = (decoder.width(), decoder.height());
    let mut delays = Vec::new();
    while let Some(frame) = decoder.read_next_frame().unwrap() {
        delays.push(frame.delay);
    }
    (width, height, delays)
}

/// Drain events until `accept` matches one or `timeout` passes.
pub fn wait_for<F>(events: &Receiver<SessionEvent>, timeout: Duration, mut accept: F) -> Option<SessionEvent>
where
    F: FnMut(&SessionEvent) -> bool,
{
    let deadline = Instant::now() + timeout;
    while let Ok(event) = events.recv_deadline(deadline) {
        if accept(&event) {
            return Some(event);
        }
    }
    None
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn eventually<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
