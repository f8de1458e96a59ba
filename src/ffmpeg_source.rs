//! FFmpeg-backed media source for container formats.
//!
//! One demuxer and one video decoder per source. Random access seeks the
//! container to a keyframe before the target and decodes forward; requests a
//! short distance ahead of the cursor are served by decoding forward without a
//! seek.
//!
//! Decoded frames are mapped to indices by rounding their presentation time
//! onto the nominal `avg_frame_rate` grid. When a grid slot has no frame of
//! its own (variable frame rate, dropped frames) the last earlier frame is
//! shown for it.

use std::mem;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use ffmpeg_next::{
    Error as FfmpegError, Packet, Rational,
    codec::context::Context as CodecContext,
    decoder::Video as VideoDecoder,
    format::{Pixel, context::Input},
    frame::Video as VideoFrame,
    media::Type,
    software::scaling::{Context as ScalingContext, Flags as ScalingFlags},
};
use image::RgbImage;

use crate::conversion::{
    frame_index_at, frame_timestamp, frame_to_buffer, pts_to_seconds, seconds_to_seek_timestamp,
    usable_frame_rate,
};
use crate::error::FramestepError;
use crate::frame::FrameRef;
use crate::metadata::MediaMetadata;
use crate::source::{MediaSource, ProbedFormat, probe_format};

/// Forward distance (in frames) decoded sequentially instead of seeking.
const SEQUENTIAL_DECODE_LIMIT: u64 = 90;

/// Extra seconds to back off when a keyframe seek lands after the target.
const SEEK_BACKOFF_SECONDS: [f64; 3] = [1.0, 4.0, 15.0];

/// Consecutive demuxer read errors tolerated before giving up.
const MAX_READ_ERRORS: u32 = 32;

/// `SwsContext` is used from one thread at a time.
struct SendScaler(ScalingContext);

// SAFETY: the scaler is owned by a single `FfmpegSource` and never shared.
unsafe impl Send for SendScaler {}

impl Deref for SendScaler {
    type Target = ScalingContext;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SendScaler {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Media source decoding through FFmpeg.
pub struct FfmpegSource {
    path: PathBuf,
    metadata: MediaMetadata,
    input: Input,
    decoder: VideoDecoder,
    scaler: Option<(Pixel, u32, u32, SendScaler)>,
    stream_index: usize,
    time_base: Rational,
    stream_start: f64,
    decoded: VideoFrame,
    /// Previously decoded frame kept for gap filling.
    held: VideoFrame,
    held_index: Option<u64>,
    /// `decoded` holds a frame that has not been consumed yet.
    staged: Option<u64>,
    rgb: VideoFrame,
    eof_sent: bool,
    /// Index the next `decode_next` call produces.
    next_index: u64,
    lookahead: Option<FrameRef>,
    last: Option<FrameRef>,
}

impl FfmpegSource {
    /// Open a container and validate it by decoding its first frame.
    ///
    /// # Errors
    ///
    /// - [`FramestepError::FileNotReadable`] if the file cannot be read.
    /// - [`FramestepError::UnsupportedFormat`] if FFmpeg does not recognise
    ///   the container, or [`FramestepError::NoVideoStream`] if it has no video.
    /// - [`FramestepError::CorruptStream`] if the first frame cannot be decoded.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FramestepError> {
        let path = path.as_ref();
        let hint = probe_format(path)?;
        Self::open_with_hint(path, hint)
    }

    pub(crate) fn open_with_hint(path: &Path, hint: ProbedFormat) -> Result<Self, FramestepError> {
        let path_buf = path.to_path_buf();

        crate::ffmpeg::ensure_initialized().map_err(|reason| {
            FramestepError::UnsupportedFormat {
                path: path_buf.clone(),
                reason: format!("FFmpeg initialisation failed: {reason}"),
            }
        })?;

        let input = ffmpeg_next::format::input(&path).map_err(|error| {
            // A recognised container that FFmpeg rejects is damaged; anything
            // else is simply not a format we understand.
            if hint == ProbedFormat::Unknown {
                FramestepError::UnsupportedFormat {
                    path: path_buf.clone(),
                    reason: error.to_string(),
                }
            } else {
                FramestepError::CorruptStream {
                    path: path_buf.clone(),
                    reason: error.to_string(),
                }
            }
        })?;

        let stream = input
            .streams()
            .best(Type::Video)
            .ok_or(FramestepError::NoVideoStream)?;
        let stream_index = stream.index();
        let time_base = stream.time_base();
        let stream_start = match stream.start_time() {
            ffmpeg_next::ffi::AV_NOPTS_VALUE => 0.0,
            start => pts_to_seconds(start, time_base),
        };

        let decoder_context = CodecContext::from_parameters(stream.parameters()).map_err(
            |error| FramestepError::UnsupportedFormat {
                path: path_buf.clone(),
                reason: format!("Failed to read video codec parameters: {error}"),
            },
        )?;
        let decoder = decoder_context.decoder().video().map_err(|error| {
            FramestepError::UnsupportedFormat {
                path: path_buf.clone(),
                reason: format!("Failed to create video decoder: {error}"),
            }
        })?;

        let width = decoder.width();
        let height = decoder.height();
        if width == 0 || height == 0 {
            return Err(FramestepError::CorruptStream {
                path: path_buf,
                reason: "video stream reports zero dimensions".to_string(),
            });
        }

        let average_rate = rational_to_f64(stream.avg_frame_rate());
        let real_rate = rational_to_f64(stream.rate());
        let frame_rate = usable_frame_rate(if average_rate > 0.0 {
            average_rate
        } else {
            real_rate
        });
        let variable_frame_rate =
            average_rate > 0.0 && real_rate > 0.0 && (average_rate - real_rate).abs() > 0.01;

        let container_duration = if input.duration() > 0 {
            input.duration() as f64 / f64::from(ffmpeg_next::ffi::AV_TIME_BASE)
        } else {
            0.0
        };
        let stream_duration = if stream.duration() > 0 {
            pts_to_seconds(stream.duration(), time_base)
        } else {
            0.0
        };
        let declared_frames = stream.frames().max(0) as u64;

        let duration_seconds = if container_duration > 0.0 {
            container_duration
        } else if stream_duration > 0.0 {
            stream_duration
        } else {
            declared_frames as f64 / frame_rate
        };
        let frame_count = if declared_frames > 0 && !variable_frame_rate {
            declared_frames
        } else {
            (duration_seconds * frame_rate).round() as u64
        }
        .max(1);

        let video_codec = decoder
            .codec()
            .map(|codec| codec.name().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let audio_codec = input
            .streams()
            .best(Type::Audio)
            .map(|audio| audio.parameters().id().name().to_string());

        let metadata = MediaMetadata {
            duration_seconds,
            frame_rate,
            frame_count,
            width,
            height,
            has_audio: audio_codec.is_some(),
            container: input.format().name().to_string(),
            video_codec,
            audio_codec,
            variable_frame_rate,
        };

        log::debug!(
            "Opened {:?} ({}, {}): {}x{}, {:.3} fps, {} frames, {:.2}s",
            path,
            metadata.container,
            metadata.video_codec,
            width,
            height,
            frame_rate,
            frame_count,
            duration_seconds,
        );

        let mut source = Self {
            path: path_buf,
            metadata,
            input,
            decoder,
            scaler: None,
            stream_index,
            time_base,
            stream_start,
            decoded: VideoFrame::empty(),
            held: VideoFrame::empty(),
            held_index: None,
            staged: None,
            rgb: VideoFrame::empty(),
            eof_sent: false,
            next_index: 0,
            lookahead: None,
            last: None,
        };

        let first = source.decode_next().map_err(|error| FramestepError::CorruptStream {
            path: source.path.clone(),
            reason: format!("first frame failed to decode: {error}"),
        })?;
        source.next_index = first.index();
        source.lookahead = Some(first);

        Ok(source)
    }

    /// Pull the next decoded frame into `self.decoded`, returning its index.
    fn pull_raw(&mut self) -> Result<Option<u64>, FramestepError> {
        if let Some(index) = self.staged.take() {
            return Ok(Some(index));
        }

        let mut read_errors = 0;
        loop {
            if self.decoder.receive_frame(&mut self.decoded).is_ok() {
                return Ok(Some(self.index_of(&self.decoded)));
            }
            if self.eof_sent {
                return Ok(None);
            }

            let mut packet = Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {
                    read_errors = 0;
                    if packet.stream() == self.stream_index {
                        self.decoder.send_packet(&packet).map_err(|error| {
                            FramestepError::DecodeError(format!(
                                "{:?}: packet rejected by decoder: {error}",
                                self.path
                            ))
                        })?;
                    }
                }
                Err(FfmpegError::Eof) => {
                    self.decoder.send_eof()?;
                    self.eof_sent = true;
                }
                Err(error) => {
                    read_errors += 1;
                    if read_errors >= MAX_READ_ERRORS {
                        return Err(FramestepError::DecodeError(format!(
                            "{:?}: demuxer read failed: {error}",
                            self.path
                        )));
                    }
                }
            }
        }
    }

    fn index_of(&self, frame: &VideoFrame) -> u64 {
        let pts = frame.timestamp().or(frame.pts()).unwrap_or(0);
        let seconds = pts_to_seconds(pts, self.time_base) - self.stream_start;
        (seconds * self.metadata.frame_rate).round().max(0.0) as u64
    }

    /// Scale `frame` to RGB24 and wrap it as the frame for `index`.
    fn convert(&mut self, use_held: bool, index: u64) -> Result<FrameRef, FramestepError> {
        let frame = if use_held { &self.held } else { &self.decoded };
        let (format, width, height) = (frame.format(), frame.width(), frame.height());

        let reuse = matches!(&self.scaler, Some((f, w, h, _)) if *f == format && *w == width && *h == height);
        if !reuse {
            let context = ScalingContext::get(
                format,
                width,
                height,
                Pixel::RGB24,
                width,
                height,
                ScalingFlags::BILINEAR,
            )?;
            self.scaler = Some((format, width, height, SendScaler(context)));
        }

        let frame = if use_held { &self.held } else { &self.decoded };
        let Some((_, _, _, scaler)) = self.scaler.as_mut() else {
            return Err(FramestepError::DecodeError("scaler unavailable".to_string()));
        };
        scaler.run(frame, &mut self.rgb)?;

        let buffer = frame_to_buffer(&self.rgb, width, height, 3);
        let image = RgbImage::from_raw(width, height, buffer).ok_or_else(|| {
            FramestepError::DecodeError(
                "Failed to construct RGB image from decoded frame data".to_string(),
            )
        })?;
        Ok(FrameRef::new(
            index,
            frame_timestamp(index, self.metadata.frame_rate),
            image,
        ))
    }

    /// Keyframe seek to `seconds`, resetting all decode state.
    fn seek_container(&mut self, seconds: f64) -> Result<(), FramestepError> {
        let timestamp = seconds_to_seek_timestamp(seconds + self.stream_start);
        log::trace!("Seeking {:?} to {timestamp}us", self.path);
        if let Err(error) = self.input.seek(timestamp, ..timestamp) {
            log::warn!("Seek to {seconds:.3}s failed for {:?}: {error}; rewinding", self.path);
            self.input.seek(0, ..0)?;
        }
        self.decoder.flush();
        self.eof_sent = false;
        self.staged = None;
        self.held_index = None;
        self.lookahead = None;
        Ok(())
    }

    /// Decode forward until the frame shown at `target` is found.
    ///
    /// Returns `Ok(None)` when the first frame after the current position is
    /// already past `target`.
    fn decode_forward_to(&mut self, target: u64) -> Result<Option<FrameRef>, FramestepError> {
        loop {
            match self.pull_raw()? {
                Some(index) if index == target => {
                    let frame = self.convert(false, target)?;
                    mem::swap(&mut self.decoded, &mut self.held);
                    self.held_index = Some(index);
                    return Ok(Some(frame));
                }
                Some(index) if index < target => {
                    mem::swap(&mut self.decoded, &mut self.held);
                    self.held_index = Some(index);
                }
                Some(index) => {
                    self.staged = Some(index);
                    return match self.held_index {
                        Some(_) => self.convert(true, target).map(Some),
                        None => Ok(None),
                    };
                }
                None => {
                    // The nominal count can overshoot the real stream by a
                    // frame or two; the last real frame stands in.
                    return match self.held_index {
                        Some(_) => self.convert(true, target).map(Some),
                        None => Err(FramestepError::DecodeError(format!(
                            "{:?}: stream ended before frame {target}",
                            self.path
                        ))),
                    };
                }
            }
        }
    }

    fn locate(&mut self, target: u64) -> Result<FrameRef, FramestepError> {
        if target >= self.next_index && target - self.next_index <= SEQUENTIAL_DECODE_LIMIT {
            self.lookahead = None;
            if let Some(frame) = self.decode_forward_to(target)? {
                return Ok(frame);
            }
        }

        let target_seconds = frame_timestamp(target, self.metadata.frame_rate);
        for backoff in [0.0].into_iter().chain(SEEK_BACKOFF_SECONDS) {
            let seek_to = (target_seconds - backoff).max(0.0);
            self.seek_container(seek_to)?;
            if let Some(frame) = self.decode_forward_to(target)? {
                return Ok(frame);
            }
            if seek_to == 0.0 {
                break;
            }
        }

        // Even the very first frame sits after `target`: show it.
        self.seek_container(0.0)?;
        match self.pull_raw()? {
            Some(_) => self.convert(false, target),
            None => Err(FramestepError::DecodeError(format!(
                "{:?}: no frames decoded for index {target}",
                self.path
            ))),
        }
    }
}

impl MediaSource for FfmpegSource {
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
        if let Some(last) = self.last.as_ref().filter(|last| last.index() == frame_index) {
            return Ok(last.clone());
        }

        let frame = match self.lookahead.take() {
            Some(frame) if frame.index() == frame_index => frame,
            _ => self.locate(frame_index)?,
        };
        self.next_index = frame_index + 1;
        self.last = Some(frame.clone());
        Ok(frame)
    }

    fn decode_next(&mut self) -> Result<FrameRef, FramestepError> {
        if let Some(frame) = self.lookahead.take() {
            self.next_index = frame.index() + 1;
            self.last = Some(frame.clone());
            return Ok(frame);
        }
        if self.next_index >= self.metadata.frame_count {
            return Err(FramestepError::EndOfStream);
        }

        let target = self.next_index;
        let frame = match self.decode_forward_to(target) {
            Ok(Some(frame)) => frame,
            Ok(None) => self.locate(target)?,
            Err(FramestepError::DecodeError(_)) if self.eof_sent && self.held_index.is_none() => {
                return Err(FramestepError::EndOfStream);
            }
            Err(error) => return Err(error),
        };
        self.next_index = target + 1;
        self.last = Some(frame.clone());
        Ok(frame)
    }

    fn seek_near(&mut self, timestamp: f64) -> Result<u64, FramestepError> {
        let target = frame_index_at(
            timestamp,
            self.metadata.frame_rate,
            self.metadata.frame_count,
        );
        let frame = self.decode_at(target)?;
        self.next_index = target;
        self.lookahead = Some(frame);
        Ok(target)
    }
}

fn rational_to_f64(rational: Rational) -> f64 {
    if rational.denominator() == 0 {
        0.0
    } else {
        rational.numerator() as f64 / rational.denominator() as f64
    }
}
