//! Internal conversion helpers.
//!
//! Timestamp/frame-index arithmetic shared by every source, plus the pixel
//! copying used by the FFmpeg decoder.

/// Tolerance applied before flooring `seconds * fps`, so that timestamps
/// produced by [`frame_timestamp`] map back to the same index.
const INDEX_EPSILON: f64 = 1e-6;

/// Nominal frame rate used when a container reports none.
pub(crate) const FALLBACK_FRAME_RATE: f64 = 30.0;

/// Presentation time of a frame on the nominal grid.
pub(crate) fn frame_timestamp(frame_index: u64, frame_rate: f64) -> f64 {
    if frame_rate > 0.0 {
        frame_index as f64 / frame_rate
    } else {
        0.0
    }
}

/// The last frame whose timestamp is `<= seconds`, clamped to the stream.
pub(crate) fn frame_index_at(seconds: f64, frame_rate: f64, frame_count: u64) -> u64 {
    if !seconds.is_finite() || seconds <= 0.0 || frame_rate <= 0.0 {
        return 0;
    }
    let raw = (seconds * frame_rate + INDEX_EPSILON).floor();
    (raw as u64).min(frame_count.saturating_sub(1))
}

/// Sanitize a probed frame rate.
pub(crate) fn usable_frame_rate(frame_rate: f64) -> f64 {
    if frame_rate.is_finite() && frame_rate > 0.0 {
        frame_rate
    } else {
        FALLBACK_FRAME_RATE
    }
}

/// Scale `(width, height)` so the longest edge equals `max_dimension`.
pub(crate) fn fit_dimensions(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (max_dimension, max_dimension);
    }
    let scale = max_dimension as f64 / width.max(height) as f64;
    let new_width = ((width as f64) * scale).round() as u32;
    let new_height = ((height as f64) * scale).round() as u32;
    (new_width.max(1), new_height.max(1))
}

/// Resolve output dimensions for a resize request.
///
/// With both targets and `preserve_aspect` the source is fitted inside the
/// box. With a single target the other edge follows the source ratio.
pub(crate) fn resolve_dimensions(
    source_width: u32,
    source_height: u32,
    target_width: Option<u32>,
    target_height: Option<u32>,
    preserve_aspect: bool,
) -> (u32, u32) {
    let source_width = source_width.max(1);
    let source_height = source_height.max(1);
    match (target_width, target_height) {
        (Some(w), Some(h)) if preserve_aspect => {
            let scale = (w as f64 / source_width as f64).min(h as f64 / source_height as f64);
            let fitted_width = (source_width as f64 * scale).round() as u32;
            let fitted_height = (source_height as f64 * scale).round() as u32;
            (fitted_width.clamp(1, w.max(1)), fitted_height.clamp(1, h.max(1)))
        }
        (Some(w), Some(h)) => (w.max(1), h.max(1)),
        (Some(w), None) => {
            let ratio = w as f64 / source_width as f64;
            (w.max(1), ((source_height as f64 * ratio).round() as u32).max(1))
        }
        (None, Some(h)) => {
            let ratio = h as f64 / source_height as f64;
            (((source_width as f64 * ratio).round() as u32).max(1), h.max(1))
        }
        (None, None) => (source_width, source_height),
    }
}

/// Copy pixel data from an FFmpeg video frame into a tightly-packed buffer.
#[cfg(feature = "ffmpeg")]
pub(crate) fn frame_to_buffer(
    video_frame: &ffmpeg_next::frame::Video,
    width: u32,
    height: u32,
    bytes_per_pixel: usize,
) -> Vec<u8> {
    let stride = video_frame.stride(0);
    let expected_stride = (width as usize) * bytes_per_pixel;
    let data = video_frame.data(0);

    if stride == expected_stride {
        data[..expected_stride * (height as usize)].to_vec()
    } else {
        let mut buffer = Vec::with_capacity(expected_stride * (height as usize));
        for row in 0..(height as usize) {
            let row_start = row * stride;
            buffer.extend_from_slice(&data[row_start..row_start + expected_stride]);
        }
        buffer
    }
}

/// Rescale a PTS value from stream time base to seconds.
#[cfg(feature = "ffmpeg")]
pub(crate) fn pts_to_seconds(pts: i64, time_base: ffmpeg_next::Rational) -> f64 {
    if time_base.denominator() == 0 {
        return 0.0;
    }
    pts as f64 * time_base.numerator() as f64 / time_base.denominator() as f64
}

/// Seconds to AV_TIME_BASE (microseconds), as expected by container seeks.
#[cfg(feature = "ffmpeg")]
pub(crate) fn seconds_to_seek_timestamp(seconds: f64) -> i64 {
    (seconds.max(0.0) * 1_000_000.0) as i64
}
