//! Thumbnail index integration tests.

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::{PatternOpener, pattern_metadata};
use framestep::{EventSink, SessionEvent, ThumbnailIndex, thumbnail_stride};

const WAIT: Duration = Duration::from_secs(30);

fn index_for(
    opener: PatternOpener,
    path: &str,
    samples: usize,
) -> (ThumbnailIndex, crossbeam_channel::Receiver<SessionEvent>) {
    let metadata = pattern_metadata(opener.frame_count, opener.frame_rate, opener.width, opener.height);
    let (events, receiver) = EventSink::channel(4096);
    let index = ThumbnailIndex::new(
        Arc::new(opener),
        PathBuf::from(path),
        metadata,
        samples,
        160,
        events,
    );
    (index, receiver)
}

// ── Stride ─────────────────────────────────────────────────────────

#[test]
fn stride_scales_with_duration() {
    assert!((thumbnail_stride(10.0, 30.0, 200) - 0.05).abs() < 1e-12);
    assert!((thumbnail_stride(3600.0, 30.0, 200) - 18.0).abs() < 1e-12);
    // Never finer than one frame.
    assert!((thumbnail_stride(1.0, 10.0, 200) - 0.1).abs() < 1e-12);
}

#[test]
fn sample_count_is_bounded_by_frames() {
    let (index, _) = index_for(PatternOpener::new(10, 10.0), "short", 200);
    assert_eq!(index.total(), 10);
    assert_eq!(index.sample_count(), 200);
}

// ── Building ───────────────────────────────────────────────────────

#[test]
fn builds_every_sample_in_background() {
    let (index, receiver) = index_for(PatternOpener::new(300, 30.0).with_size(64, 36), "clip", 200);
    assert_eq!(index.total(), 200);
    index.start();
    assert!(index.wait_until_complete(WAIT));
    assert_eq!(index.available(), 200);

    let thumbnail = index.get_thumbnail(2.0).unwrap();
    assert_eq!(thumbnail.frame_index, 60);
    assert!((thumbnail.timestamp - 2.0).abs() < 1e-9);
    assert_eq!(thumbnail.image.dimensions(), (160, 90));
    let red = thumbnail.image.get_pixel(80, 45)[0];
    assert!(red.abs_diff(60) <= 1, "red channel {red}");

    let complete = common::wait_for(&receiver, WAIT, |event| {
        matches!(
            event,
            SessionEvent::ThumbnailsUpdated {
                available: 200,
                total: 200
            }
        )
    });
    assert!(complete.is_some());
}

#[test]
fn lookups_never_block_and_trigger_the_build() {
    let opener = PatternOpener::new(100, 10.0).with_decode_delay(Duration::from_millis(10));
    let opens = Arc::clone(&opener.opens);
    let (index, _) = index_for(opener, "lazy", 20);

    assert!(index.get_thumbnail(5.0).is_none());
    assert!(common::eventually(WAIT, || index.get_thumbnail(5.0).is_some()));
    assert!(index.wait_until_complete(WAIT));
    assert_eq!(opens.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn nearest_available_sample_is_returned() {
    let (index, _) = index_for(PatternOpener::new(100, 10.0), "near", 10);
    index.start();
    assert!(index.wait_until_complete(WAIT));
    // Stride is 1s; 3.4s is closest to the 3s sample.
    let thumbnail = index.get_thumbnail(3.4).unwrap();
    assert_eq!(thumbnail.frame_index, 30);
    let thumbnail = index.get_thumbnail(500.0).unwrap();
    assert_eq!(thumbnail.frame_index, 90);
}

#[test]
fn changing_stride_rebuilds() {
    let (index, _) = index_for(PatternOpener::new(100, 10.0), "rebuild", 10);
    index.start();
    assert!(index.wait_until_complete(WAIT));
    assert_eq!(index.total(), 10);

    assert!(index.set_sample_count(20));
    assert!((index.stride() - 0.5).abs() < 1e-12);
    assert_eq!(index.total(), 20);
    assert!(index.wait_until_complete(WAIT));
    assert_eq!(index.available(), 20);
}

#[test]
fn same_stride_keeps_existing_samples() {
    // Both counts clamp to one sample per frame.
    let (index, _) = index_for(PatternOpener::new(10, 10.0), "same", 50);
    index.start();
    assert!(index.wait_until_complete(WAIT));
    assert!(!index.set_sample_count(80));
    assert_eq!(index.available(), 10);
    assert_eq!(index.sample_count(), 80);
}

#[test]
fn unopenable_media_settles_without_samples() {
    let (index, receiver) = index_for(PatternOpener::new(100, 10.0), "corrupt.mp4", 10);
    index.start();
    assert!(index.wait_until_complete(WAIT));
    assert_eq!(index.available(), 0);
    assert!(index.get_thumbnail(1.0).is_none());
    let error = common::wait_for(&receiver, WAIT, |event| {
        matches!(event, SessionEvent::Error { .. })
    });
    assert!(error.is_some());
}
