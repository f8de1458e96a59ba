//! Playback engine integration tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{PatternSource, eventually, pattern_index, wait_for};
use crossbeam_channel::Receiver;
use framestep::{
    AudioOutput, ErrorKind, EventSink, FrameCache, FramestepError, PlaybackEngine, PlaybackStatus,
    SessionEvent, SilentAudio, StepDirection,
};
use parking_lot::Mutex;

const IDLE: Duration = Duration::from_secs(5);

fn engine_for(source: PatternSource) -> (PlaybackEngine, Receiver<SessionEvent>, Arc<FrameCache>) {
    engine_with_audio(source, Box::new(SilentAudio), 3)
}

fn engine_with_audio(
    source: PatternSource,
    audio: Box<dyn AudioOutput>,
    tolerance: u32,
) -> (PlaybackEngine, Receiver<SessionEvent>, Arc<FrameCache>) {
    let cache = Arc::new(FrameCache::new(Box::new(source), 32));
    let (events, receiver) = EventSink::channel(4096);
    let engine = PlaybackEngine::new(Arc::clone(&cache), audio, events, tolerance).unwrap();
    (engine, receiver, cache)
}

fn frame_indices(receiver: &Receiver<SessionEvent>) -> Vec<u64> {
    receiver
        .try_iter()
        .filter_map(|event| match event {
            SessionEvent::FrameReady(frame) => Some(frame.index()),
            _ => None,
        })
        .collect()
}

// ── Initial state ──────────────────────────────────────────────────

#[test]
fn engine_starts_stopped_on_first_frame() {
    let (engine, receiver, _) = engine_for(PatternSource::new(50, 25.0));
    let state = engine.state();
    assert_eq!(state.status, PlaybackStatus::Stopped);
    assert_eq!(state.current_frame_index, 0);
    assert_eq!(state.volume, 1.0);
    assert!(!state.muted);

    engine.refresh().unwrap();
    engine.wait_idle(IDLE).unwrap();
    assert_eq!(frame_indices(&receiver), vec![0]);
}

// ── Stepping ───────────────────────────────────────────────────────

#[test]
fn stepping_moves_exactly_one_frame() {
    let (engine, receiver, _) = engine_for(PatternSource::new(100, 25.0));
    engine.seek_to_frame(40).unwrap();
    engine.wait_idle(IDLE).unwrap();
    receiver.try_iter().for_each(drop);

    for _ in 0..10 {
        engine.step(StepDirection::Forward).unwrap();
    }
    engine.wait_idle(IDLE).unwrap();
    assert_eq!(engine.state().current_frame_index, 50);
    assert_eq!(frame_indices(&receiver), (41..=50).collect::<Vec<_>>());

    for _ in 0..10 {
        engine.step(StepDirection::Backward).unwrap();
    }
    engine.wait_idle(IDLE).unwrap();
    assert_eq!(engine.state().current_frame_index, 40);
    assert_eq!(frame_indices(&receiver), (40..=49).rev().collect::<Vec<_>>());
}

#[test]
fn stepping_clamps_at_both_ends() {
    let (engine, receiver, _) = engine_for(PatternSource::new(5, 10.0));
    engine.step(StepDirection::Backward).unwrap();
    engine.wait_idle(IDLE).unwrap();
    assert_eq!(engine.state().current_frame_index, 0);

    for _ in 0..10 {
        engine.step(StepDirection::Forward).unwrap();
    }
    engine.wait_idle(IDLE).unwrap();
    assert_eq!(engine.state().current_frame_index, 4);
    assert_eq!(frame_indices(&receiver), vec![1, 2, 3, 4]);
}

#[test]
fn stepping_from_stopped_pauses() {
    let (engine, _receiver, _) = engine_for(PatternSource::new(10, 10.0));
    engine.step(StepDirection::Forward).unwrap();
    engine.wait_idle(IDLE).unwrap();
    assert_eq!(engine.state().status, PlaybackStatus::Paused);
}

#[test]
fn step_failure_is_surfaced_and_keeps_position() {
    let (engine, receiver, _) = engine_for(PatternSource::new(10, 10.0).failing([3]));
    engine.seek_to_frame(2).unwrap();
    engine.step(StepDirection::Forward).unwrap();
    engine.wait_idle(IDLE).unwrap();

    assert_eq!(engine.state().current_frame_index, 2);
    let error = receiver.try_iter().find_map(|event| match event {
        SessionEvent::Error { kind, .. } => Some(kind),
        _ => None,
    });
    assert_eq!(error, Some(ErrorKind::DecodeError));
}

#[test]
fn step_while_playing_is_rejected() {
    let (engine, _receiver, _) = engine_for(PatternSource::new(1000, 10.0));
    engine.play().unwrap();
    engine.wait_idle(IDLE).unwrap();

    let error = engine.step(StepDirection::Forward).unwrap_err();
    assert!(matches!(error, FramestepError::InvalidState(_)));
    assert_eq!(error.kind(), ErrorKind::InvalidState);
    engine.pause().unwrap();
}

// ── Seeking ────────────────────────────────────────────────────────

#[test]
fn seek_lands_on_last_frame_not_after_target() {
    let (engine, receiver, _) = engine_for(PatternSource::new(250, 25.0));
    for target in [0.0, 0.039, 0.04, 1.23, 4.999, 9.96] {
        engine.seek(target).unwrap();
        engine.wait_idle(IDLE).unwrap();
        let index = engine.state().current_frame_index;
        let timestamp = index as f64 / 25.0;
        assert!(timestamp <= target + 1e-9, "{timestamp} overshoots {target}");
        assert!(target - timestamp < 1.0 / 25.0, "{timestamp} is not the closest to {target}");
    }
    let shown: Vec<u64> = receiver
        .try_iter()
        .filter_map(|event| match event {
            SessionEvent::FrameReady(frame) => Some(pattern_index(&frame)),
            _ => None,
        })
        .collect();
    assert_eq!(shown, vec![0, 0, 1, 30, 124, 249]);
}

#[test]
fn seek_clamps_past_the_end() {
    let (engine, _receiver, _) = engine_for(PatternSource::new(50, 25.0));
    engine.seek(1000.0).unwrap();
    engine.wait_idle(IDLE).unwrap();
    assert_eq!(engine.state().current_frame_index, 49);

    engine.seek(-3.0).unwrap();
    engine.wait_idle(IDLE).unwrap();
    assert_eq!(engine.state().current_frame_index, 0);
}

#[test]
fn seek_rejects_non_finite_time() {
    let (engine, _receiver, _) = engine_for(PatternSource::new(50, 25.0));
    let error = engine.seek(f64::NAN).unwrap_err();
    assert!(matches!(error, FramestepError::InvalidParameter(_)));
}

#[test]
fn seek_to_frame_is_clamped() {
    let (engine, _receiver, _) = engine_for(PatternSource::new(20, 10.0));
    engine.seek_to_frame(500).unwrap();
    engine.wait_idle(IDLE).unwrap();
    assert_eq!(engine.state().current_frame_index, 19);
    assert_eq!(engine.state().status, PlaybackStatus::Paused);
}

// ── Continuous play ────────────────────────────────────────────────

#[test]
fn play_advances_monotonically_to_the_end() {
    let (engine, receiver, _) = engine_for(PatternSource::new(40, 50.0));
    engine.play().unwrap();

    let mut shown = Vec::new();
    let finished = wait_for(&receiver, Duration::from_secs(10), |event| match event {
        SessionEvent::FrameReady(frame) => {
            shown.push(frame.index());
            false
        }
        SessionEvent::PlaybackFinished => true,
        _ => false,
    });
    assert!(finished.is_some(), "playback never finished");
    assert!(shown.windows(2).all(|pair| pair[0] < pair[1]), "{shown:?}");
    assert_eq!(shown.last(), Some(&39));

    engine.wait_idle(IDLE).unwrap();
    let state = engine.state();
    assert_eq!(state.status, PlaybackStatus::Paused);
    assert_eq!(state.current_frame_index, 39);
}

#[test]
fn play_from_the_end_restarts() {
    let (engine, receiver, _) = engine_for(PatternSource::new(400, 10.0));
    engine.seek_to_frame(399).unwrap();
    engine.wait_idle(IDLE).unwrap();
    receiver.try_iter().for_each(drop);

    engine.play().unwrap();
    engine.wait_idle(IDLE).unwrap();
    engine.pause().unwrap();
    engine.wait_idle(IDLE).unwrap();

    assert_eq!(frame_indices(&receiver).first(), Some(&0));
    assert!(engine.state().current_frame_index < 10);
}

#[test]
fn pause_halts_advance() {
    let (engine, _receiver, _) = engine_for(PatternSource::new(10_000, 100.0));
    engine.play().unwrap();
    assert!(eventually(Duration::from_secs(5), || {
        engine.state().current_frame_index > 0
    }));
    engine.pause().unwrap();
    engine.wait_idle(IDLE).unwrap();

    let paused_at = engine.state().current_frame_index;
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(engine.state().current_frame_index, paused_at);
    assert_eq!(engine.state().status, PlaybackStatus::Paused);
}

#[test]
fn stop_returns_to_first_frame() {
    let (engine, receiver, _) = engine_for(PatternSource::new(100, 25.0));
    engine.seek_to_frame(60).unwrap();
    engine.stop().unwrap();
    engine.wait_idle(IDLE).unwrap();

    let state = engine.state();
    assert_eq!(state.status, PlaybackStatus::Stopped);
    assert_eq!(state.current_frame_index, 0);
    assert_eq!(frame_indices(&receiver), vec![60, 0]);
}

#[test]
fn isolated_failures_are_skipped_during_play() {
    let (engine, receiver, _) = engine_for(PatternSource::new(30, 50.0).failing([10, 20]));
    engine.play().unwrap();

    let finished = wait_for(&receiver, Duration::from_secs(10), |event| {
        matches!(event, SessionEvent::PlaybackFinished)
    });
    assert!(finished.is_some());
    engine.wait_idle(IDLE).unwrap();
    let state = engine.state();
    assert_eq!(state.current_frame_index, 29);
    assert!(state.error.is_none());
}

#[test]
fn persistent_failures_pause_with_error() {
    let (engine, receiver, _) = engine_with_audio(
        PatternSource::new(200, 50.0).failing(5..200),
        Box::new(SilentAudio),
        3,
    );
    engine.play().unwrap();

    let mut shown = Vec::new();
    let error = wait_for(&receiver, Duration::from_secs(10), |event| match event {
        SessionEvent::FrameReady(frame) => {
            shown.push(frame.index());
            false
        }
        SessionEvent::Error { .. } => true,
        _ => false,
    });
    assert!(matches!(
        error,
        Some(SessionEvent::Error {
            kind: ErrorKind::DecodeError,
            ..
        })
    ));
    engine.wait_idle(IDLE).unwrap();
    let state = engine.state();
    assert_eq!(state.status, PlaybackStatus::Paused);
    assert!(state.error.is_some());

    // Still on the last frame that actually reached the display.
    assert!(state.current_frame_index < 5);
    assert_eq!(state.current_frame_index, shown.last().copied().unwrap_or(0));
}

#[test]
fn skipped_frame_does_not_become_current() {
    let (engine, receiver, _) = engine_with_audio(
        PatternSource::new(40, 50.0).failing([39]),
        Box::new(SilentAudio),
        3,
    );
    engine.play().unwrap();

    let finished = wait_for(&receiver, Duration::from_secs(10), |event| {
        matches!(event, SessionEvent::PlaybackFinished)
    });
    assert!(finished.is_some());
    engine.wait_idle(IDLE).unwrap();
    let state = engine.state();
    assert_eq!(state.status, PlaybackStatus::Paused);
    assert!(state.error.is_none());
    assert!(state.current_frame_index < 39);
}

// ── Audio ──────────────────────────────────────────────────────────

#[derive(Default)]
struct AudioLog {
    position: Option<f64>,
    starts: Vec<f64>,
    volume: Option<f32>,
    muted: Option<bool>,
}

struct ScriptedAudio(Arc<Mutex<AudioLog>>);

impl AudioOutput for ScriptedAudio {
    fn start(&mut self, position_seconds: f64) {
        self.0.lock().starts.push(position_seconds);
    }
    fn pause(&mut self) {}
    fn stop(&mut self) {}
    fn set_volume(&mut self, volume: f32) {
        self.0.lock().volume = Some(volume);
    }
    fn set_muted(&mut self, muted: bool) {
        self.0.lock().muted = Some(muted);
    }
    fn position(&self) -> Option<f64> {
        self.0.lock().position
    }
}

#[test]
fn video_follows_the_audio_clock() {
    let log = Arc::new(Mutex::new(AudioLog {
        position: Some(0.0),
        ..AudioLog::default()
    }));
    let (engine, _receiver, _) = engine_with_audio(
        PatternSource::new(100, 10.0),
        Box::new(ScriptedAudio(Arc::clone(&log))),
        3,
    );
    engine.play().unwrap();
    engine.wait_idle(IDLE).unwrap();
    assert_eq!(log.lock().starts, vec![0.0]);

    log.lock().position = Some(1.0);
    assert!(eventually(Duration::from_secs(5), || {
        engine.state().current_frame_index == 10
    }));
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(engine.state().current_frame_index, 10);

    log.lock().position = Some(2.5);
    assert!(eventually(Duration::from_secs(5), || {
        engine.state().current_frame_index == 25
    }));
    engine.pause().unwrap();
}

#[test]
fn volume_and_mute_reach_the_output() {
    let log = Arc::new(Mutex::new(AudioLog::default()));
    let (engine, _receiver, _) = engine_with_audio(
        PatternSource::new(10, 10.0),
        Box::new(ScriptedAudio(Arc::clone(&log))),
        3,
    );

    assert!(matches!(
        engine.set_volume(1.5),
        Err(FramestepError::InvalidParameter(_))
    ));
    engine.set_volume(0.25).unwrap();
    engine.set_muted(true).unwrap();
    engine.wait_idle(IDLE).unwrap();

    let state = engine.state();
    assert_eq!(state.volume, 0.25);
    assert!(state.muted);
    let log = log.lock();
    assert_eq!(log.volume, Some(0.25));
    assert_eq!(log.muted, Some(true));
}
