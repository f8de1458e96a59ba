//! Native animated GIF source.
//!
//! GIF frames are partial patches over a logical screen, so each decoded
//! frame is composited onto a persistent canvas honouring the disposal method
//! of the frame before it. Random access rewinds to the first frame and
//! composites forward.
//!
//! Frame delays vary freely in GIF. Indices are assigned in file order and
//! mapped onto the nominal grid `frame_count / total_duration`.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use gif::{ColorOutput, DecodeOptions, Decoder, DisposalMethod, Frame};
use image::RgbImage;

use crate::conversion::{frame_index_at, frame_timestamp};
use crate::error::FramestepError;
use crate::frame::FrameRef;
use crate::metadata::MediaMetadata;
use crate::source::MediaSource;

/// Delay browsers substitute for `0` and `1` centisecond frames.
const MIN_FRAME_DELAY_CS: u16 = 10;

/// Largest logical screen accepted, in pixels.
pub const MAX_CANVAS_PIXELS: u64 = 8192 * 8192;

type GifDecoder = Decoder<BufReader<File>>;

#[derive(Debug, Clone, Copy)]
struct Rect {
    left: usize,
    top: usize,
    width: usize,
    height: usize,
}

/// RGBA logical screen with disposal bookkeeping.
struct Compositor {
    width: usize,
    height: usize,
    canvas: Vec<u8>,
    saved: Option<Vec<u8>>,
    pending: Option<(DisposalMethod, Rect)>,
}

impl Compositor {
    fn new(width: usize, height: usize) -> Result<Self, FramestepError> {
        let mut canvas = buffer(width, height, 4)?;
        canvas.resize(width * height * 4, 0);
        Ok(Self {
            width,
            height,
            canvas,
            saved: None,
            pending: None,
        })
    }

    fn reset(&mut self) {
        self.canvas.fill(0);
        self.saved = None;
        self.pending = None;
    }

    fn draw(&mut self, frame: &Frame<'_>) {
        if let Some((method, rect)) = self.pending.take() {
            match method {
                DisposalMethod::Background => self.clear(rect),
                DisposalMethod::Previous => {
                    if let Some(saved) = self.saved.take() {
                        self.canvas = saved;
                    }
                }
                _ => {}
            }
        }

        let rect = Rect {
            left: frame.left as usize,
            top: frame.top as usize,
            width: frame.width as usize,
            height: frame.height as usize,
        };

        if frame.dispose == DisposalMethod::Previous {
            self.saved = Some(self.canvas.clone());
        }

        if rect.width > 0 && rect.height > 0 {
            for (row, line) in frame.buffer.chunks_exact(rect.width * 4).enumerate() {
                let y = rect.top + row;
                if y >= self.height {
                    break;
                }
                for (column, pixel) in line.chunks_exact(4).enumerate() {
                    let x = rect.left + column;
                    if x >= self.width {
                        break;
                    }
                    // Transparent pixels leave the canvas untouched.
                    if pixel[3] == 0 {
                        continue;
                    }
                    let offset = (y * self.width + x) * 4;
                    self.canvas[offset..offset + 4].copy_from_slice(pixel);
                }
            }
        }

        self.pending = Some((frame.dispose, rect));
    }

    fn clear(&mut self, rect: Rect) {
        let right = (rect.left + rect.width).min(self.width);
        let bottom = (rect.top + rect.height).min(self.height);
        for y in rect.top.min(bottom)..bottom {
            let start = (y * self.width + rect.left.min(right)) * 4;
            let end = (y * self.width + right) * 4;
            self.canvas[start..end].fill(0);
        }
    }

    fn snapshot(&self) -> Result<RgbImage, FramestepError> {
        let mut rgb = buffer(self.width, self.height, 3)?;
        for pixel in self.canvas.chunks_exact(4) {
            if pixel[3] == 0 {
                rgb.extend_from_slice(&[0, 0, 0]);
            } else {
                rgb.extend_from_slice(&pixel[..3]);
            }
        }
        RgbImage::from_raw(self.width as u32, self.height as u32, rgb).ok_or_else(|| {
            FramestepError::DecodeError("Composited GIF canvas has the wrong size".to_string())
        })
    }
}

/// Empty buffer with room for `width * height` pixels of `channels` bytes.
fn buffer(width: usize, height: usize, channels: usize) -> Result<Vec<u8>, FramestepError> {
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(width * height * channels)
        .map_err(|error| {
            FramestepError::OutOfMemory(format!("{width}x{height} GIF canvas: {error}"))
        })?;
    Ok(bytes)
}

/// Animated GIF decoded with the `gif` crate.
pub struct GifSource {
    path: PathBuf,
    metadata: MediaMetadata,
    decoder: GifDecoder,
    compositor: Compositor,
    /// Index the next `decode_next` call produces.
    next_index: u64,
    last: Option<FrameRef>,
    /// Set after a mid-stream decode failure; the decoder must be reopened.
    poisoned: bool,
}

impl GifSource {
    /// Open and fully validate an animated GIF.
    ///
    /// Every frame is decoded once to count frames and sum delays, so a
    /// truncated file is rejected here rather than during playback.
    ///
    /// # Errors
    ///
    /// [`FramestepError::FileNotReadable`] if the file cannot be opened,
    /// [`FramestepError::CorruptStream`] if any frame fails to decode or the
    /// file holds no frames.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FramestepError> {
        let path = path.as_ref().to_path_buf();
        let corrupt = |reason: String| FramestepError::CorruptStream {
            path: path.clone(),
            reason,
        };

        let mut probe = open_decoder(&path)?;
        let width = probe.width() as u32;
        let height = probe.height() as u32;
        if width == 0 || height == 0 {
            return Err(corrupt("logical screen has zero size".to_string()));
        }
        if u64::from(width) * u64::from(height) > MAX_CANVAS_PIXELS {
            return Err(corrupt(format!(
                "logical screen {width}x{height} exceeds {MAX_CANVAS_PIXELS} pixels"
            )));
        }

        let mut frame_count: u64 = 0;
        let mut total_centiseconds: u64 = 0;
        let mut first_delay: Option<u16> = None;
        let mut variable = false;
        loop {
            match probe.read_next_frame() {
                Ok(Some(frame)) => {
                    let delay = effective_delay(frame.delay);
                    match first_delay {
                        None => first_delay = Some(delay),
                        Some(first) if first != delay => variable = true,
                        Some(_) => {}
                    }
                    frame_count += 1;
                    total_centiseconds += delay as u64;
                }
                Ok(None) => break,
                Err(error) => {
                    return Err(corrupt(format!("frame {frame_count}: {error}")));
                }
            }
        }

        if frame_count == 0 {
            return Err(corrupt("no image frames".to_string()));
        }

        let duration_seconds = total_centiseconds as f64 / 100.0;
        let frame_rate = frame_count as f64 / duration_seconds;

        let metadata = MediaMetadata {
            duration_seconds,
            frame_rate,
            frame_count,
            width,
            height,
            has_audio: false,
            container: "gif".to_string(),
            video_codec: "gif".to_string(),
            audio_codec: None,
            variable_frame_rate: variable,
        };

        log::debug!(
            "Opened GIF {:?}: {} frames, {:.2}s, {:.2} fps{}",
            path,
            frame_count,
            duration_seconds,
            frame_rate,
            if variable { " (variable delays)" } else { "" },
        );

        let decoder = open_decoder(&path)?;
        Ok(Self {
            compositor: Compositor::new(width as usize, height as usize)?,
            path,
            metadata,
            decoder,
            next_index: 0,
            last: None,
            poisoned: false,
        })
    }

    fn rewind(&mut self) -> Result<(), FramestepError> {
        log::trace!("Rewinding GIF decoder for {:?}", self.path);
        self.decoder = open_decoder(&self.path)?;
        self.compositor.reset();
        self.next_index = 0;
        self.last = None;
        self.poisoned = false;
        Ok(())
    }

    /// Decode and composite one frame, optionally snapshotting it.
    fn advance(&mut self, snapshot: bool) -> Result<Option<FrameRef>, FramestepError> {
        if self.poisoned {
            return Err(FramestepError::DecodeError(format!(
                "GIF decoder for {:?} failed earlier and must be repositioned",
                self.path
            )));
        }
        if self.next_index >= self.metadata.frame_count {
            return Err(FramestepError::EndOfStream);
        }

        let frame = match self.decoder.read_next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(FramestepError::EndOfStream),
            Err(error) => {
                self.poisoned = true;
                return Err(FramestepError::DecodeError(format!(
                    "GIF frame {}: {error}",
                    self.next_index
                )));
            }
        };
        self.compositor.draw(frame);

        let index = self.next_index;
        self.next_index += 1;
        if !snapshot {
            self.last = None;
            return Ok(None);
        }

        let image = self.compositor.snapshot()?;
        let frame_ref = FrameRef::new(
            index,
            frame_timestamp(index, self.metadata.frame_rate),
            image,
        );
        self.last = Some(frame_ref.clone());
        Ok(Some(frame_ref))
    }

    fn position_at(&mut self, target: u64) -> Result<(), FramestepError> {
        if self.poisoned || target < self.next_index {
            self.rewind()?;
        }
        while self.next_index < target {
            self.advance(false)?;
        }
        Ok(())
    }
}

impl MediaSource for GifSource {
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
        if let Some(last) = &self.last {
            if last.index() == frame_index && !self.poisoned {
                return Ok(last.clone());
            }
        }

        self.position_at(frame_index)?;
        self.decode_next()
    }

    fn decode_next(&mut self) -> Result<FrameRef, FramestepError> {
        self.advance(true)?.ok_or_else(|| {
            FramestepError::DecodeError("GIF frame was decoded without a snapshot".to_string())
        })
    }

    fn seek_near(&mut self, timestamp: f64) -> Result<u64, FramestepError> {
        let target = frame_index_at(
            timestamp,
            self.metadata.frame_rate,
            self.metadata.frame_count,
        );
        self.position_at(target)?;
        Ok(target)
    }
}

fn effective_delay(delay: u16) -> u16 {
    if delay <= 1 { MIN_FRAME_DELAY_CS } else { delay }
}

fn open_decoder(path: &Path) -> Result<GifDecoder, FramestepError> {
    let file = File::open(path).map_err(|error| FramestepError::FileNotReadable {
        path: path.to_path_buf(),
        reason: error.to_string(),
    })?;

    let mut options = DecodeOptions::new();
    options.set_color_output(ColorOutput::RGBA);
    options
        .read_info(BufReader::new(file))
        .map_err(|error| FramestepError::CorruptStream {
            path: path.to_path_buf(),
            reason: error.to_string(),
        })
}
