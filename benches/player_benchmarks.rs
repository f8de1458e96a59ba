//! Benchmarks for cache access, export sampling and GIF encoding.
//!
//! Run with: cargo bench
//!
//! Uses a synthetic in-memory source; the fixture-backed group runs only
//! when `tests/fixtures/sample_video.mp4` exists.

use std::{path::Path, time::Duration};

use criterion::{BatchSize, Criterion};
use framestep::{
    ExportJob, ExportOptions, FrameCache, FrameRef, FramestepError, MediaMetadata, MediaSource,
    export_gif, open_source, sample_frame_indices,
};
use image::{Rgb, RgbImage};

const SAMPLE_VIDEO: &str = "tests/fixtures/sample_video.mp4";

/// Constant-rate source that renders a gradient per frame.
struct GradientSource {
    metadata: MediaMetadata,
    cursor: u64,
}

impl GradientSource {
    fn new(frame_count: u64, frame_rate: f64, width: u32, height: u32) -> Self {
        Self {
            metadata: MediaMetadata {
                duration_seconds: frame_count as f64 / frame_rate,
                frame_rate,
                frame_count,
                width,
                height,
                has_audio: false,
                container: "synthetic".to_string(),
                video_codec: "rawvideo".to_string(),
                audio_codec: None,
                variable_frame_rate: false,
            },
            cursor: 0,
        }
    }
}

impl MediaSource for GradientSource {
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
        let shade = (frame_index & 0xFF) as u8;
        let image = RgbImage::from_fn(self.metadata.width, self.metadata.height, |x, y| {
            Rgb([shade, (x & 0xFF) as u8, (y & 0xFF) as u8])
        });
        self.cursor = frame_index + 1;
        Ok(FrameRef::new(
            frame_index,
            frame_index as f64 / self.metadata.frame_rate,
            image,
        ))
    }

    fn decode_next(&mut self) -> Result<FrameRef, FramestepError> {
        if self.cursor >= self.metadata.frame_count {
            return Err(FramestepError::EndOfStream);
        }
        self.decode_at(self.cursor)
    }

    fn seek_near(&mut self, timestamp: f64) -> Result<u64, FramestepError> {
        let index = ((timestamp.max(0.0) * self.metadata.frame_rate) as u64)
            .min(self.metadata.frame_count.saturating_sub(1));
        self.cursor = index;
        Ok(index)
    }
}

fn benchmark_cache(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("frame cache");

    let cache = FrameCache::new(Box::new(GradientSource::new(3000, 30.0, 640, 360)), 120);
    cache.get_frame(42).unwrap();
    group.bench_function("hit", |bencher| {
        bencher.iter(|| cache.get_frame(42).unwrap());
    });

    let mut next = 0_u64;
    group.bench_function("miss (640x360)", |bencher| {
        bencher.iter(|| {
            next = (next + 121) % 3000;
            cache.get_frame(next).unwrap()
        });
    });

    group.finish();
}

fn benchmark_sampling(criterion: &mut Criterion) {
    criterion.bench_function("sample indices (60s @ 10 fps from 29.97)", |bencher| {
        bencher.iter(|| sample_frame_indices(0.0, 60.0, 10.0, 29.97, 1798));
    });
}

fn benchmark_export(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("gif export");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(10));

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("bench.gif");
    for (label, quality) in [("low", 70_u8), ("high", 95)] {
        let job = ExportJob::new(0.0, 2.0, &output)
            .with_dimensions(Some(320), None)
            .with_quality(quality);
        group.bench_function(format!("2s @ 10 fps, 320 wide, {label}"), |bencher| {
            bencher.iter_batched(
                || GradientSource::new(300, 30.0, 640, 360),
                |mut source| export_gif(&mut source, &job, &ExportOptions::new()).unwrap(),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn benchmark_fixture(criterion: &mut Criterion) {
    if !Path::new(SAMPLE_VIDEO).exists() {
        eprintln!("Skipping fixture benchmarks: {SAMPLE_VIDEO} not found");
        return;
    }

    criterion.bench_function("open and decode mid-video frame", |bencher| {
        bencher.iter(|| {
            let mut source = open_source(SAMPLE_VIDEO).unwrap();
            source.decode_at(75).unwrap()
        });
    });
}

criterion::criterion_group!(
    benches,
    benchmark_cache,
    benchmark_sampling,
    benchmark_export,
    benchmark_fixture,
);
criterion::criterion_main!(benches);
