//! Playback engine.
//!
//! A single worker thread owns the playback state and is the only code that
//! mutates it. Callers send commands over a channel; the worker applies them
//! in order, paces continuous playback with a deadline-based tick, and reports
//! frames and state changes through the [`EventSink`].
//!
//! While playing, the frame to show is derived from elapsed media time: the
//! audio clock when the output provides one, otherwise the wall clock. Late
//! ticks skip straight to the frame for the current time, so the index only
//! ever moves forward during play.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use parking_lot::RwLock;

use crate::audio::AudioOutput;
use crate::cache::FrameCache;
use crate::conversion::{frame_index_at, frame_timestamp};
use crate::error::FramestepError;
use crate::event::{EventSink, SessionEvent};

/// Coarse playback status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// Direction of a single-frame step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDirection {
    Forward,
    Backward,
}

/// Snapshot of the engine's state.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackState {
    pub status: PlaybackStatus,
    /// Frame currently shown. Always `< frame_count`.
    pub current_frame_index: u64,
    /// Linear gain in `0.0..=1.0`.
    pub volume: f32,
    pub muted: bool,
    /// Set when playback paused itself after repeated decode failures.
    pub error: Option<String>,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            status: PlaybackStatus::Stopped,
            current_frame_index: 0,
            volume: 1.0,
            muted: false,
            error: None,
        }
    }
}

enum Command {
    Play,
    Pause,
    Stop,
    Step(StepDirection),
    Seek(f64),
    SeekFrame(u64),
    Volume(f32),
    Muted(bool),
    Refresh,
    Barrier(Sender<()>),
    Shutdown,
}

/// Handle to the playback worker.
pub struct PlaybackEngine {
    commands: Sender<Command>,
    state: Arc<RwLock<PlaybackState>>,
    handle: Option<JoinHandle<()>>,
    frame_count: u64,
    duration_seconds: f64,
}

impl PlaybackEngine {
    /// Spawn the worker. The engine starts `Stopped` on frame 0 without
    /// emitting anything; call [`refresh`](PlaybackEngine::refresh) to show
    /// the first frame.
    ///
    /// `error_tolerance` is the number of consecutive decode failures during
    /// play after which the engine pauses itself.
    pub fn new(
        cache: Arc<FrameCache>,
        audio: Box<dyn AudioOutput>,
        events: EventSink,
        error_tolerance: u32,
    ) -> Result<Self, FramestepError> {
        let metadata = cache.metadata().clone();
        let state = Arc::new(RwLock::new(PlaybackState::default()));
        let (commands, receiver) = unbounded();

        let worker = Worker {
            frame_rate: metadata.frame_rate,
            frame_count: metadata.frame_count,
            period: Duration::from_secs_f64(1.0 / metadata.frame_rate),
            cache,
            audio,
            events,
            state: Arc::clone(&state),
            tolerance: error_tolerance.max(1),
            clock: None,
            next_tick: Instant::now(),
            consecutive_failures: 0,
            failed_target: None,
        };

        let handle = thread::Builder::new()
            .name("framestep-playback".to_string())
            .spawn(move || worker.run(receiver))
            .map_err(|error| {
                FramestepError::InvalidState(format!("could not spawn playback thread: {error}"))
            })?;

        Ok(Self {
            commands,
            state,
            handle: Some(handle),
            frame_count: metadata.frame_count,
            duration_seconds: metadata.duration_seconds,
        })
    }

    fn send(&self, command: Command) -> Result<(), FramestepError> {
        self.commands
            .send(command)
            .map_err(|_| FramestepError::InvalidState("playback worker has exited".to_string()))
    }

    /// Start or resume playback. From the last frame, restarts at frame 0.
    pub fn play(&self) -> Result<(), FramestepError> {
        self.send(Command::Play)
    }

    pub fn pause(&self) -> Result<(), FramestepError> {
        self.send(Command::Pause)
    }

    /// Halt playback and return to frame 0.
    pub fn stop(&self) -> Result<(), FramestepError> {
        self.send(Command::Stop)
    }

    /// Move exactly one frame, clamped to the stream.
    ///
    /// # Errors
    ///
    /// [`FramestepError::InvalidState`] while playing. Decode failures are
    /// reported as [`SessionEvent::Error`] and leave the index unchanged.
    pub fn step(&self, direction: StepDirection) -> Result<(), FramestepError> {
        if self.state.read().status == PlaybackStatus::Playing {
            return Err(FramestepError::InvalidState(
                "cannot step while playing".to_string(),
            ));
        }
        self.send(Command::Step(direction))
    }

    /// Show the last frame at or before `timestamp` (clamped to the media).
    ///
    /// Playback continues from there if it was running.
    pub fn seek(&self, timestamp: f64) -> Result<(), FramestepError> {
        if !timestamp.is_finite() {
            return Err(FramestepError::InvalidParameter(format!(
                "seek target {timestamp} is not a finite time"
            )));
        }
        self.send(Command::Seek(timestamp.clamp(0.0, self.duration_seconds)))
    }

    /// Show frame `frame_index` (clamped to the stream).
    pub fn seek_to_frame(&self, frame_index: u64) -> Result<(), FramestepError> {
        self.send(Command::SeekFrame(
            frame_index.min(self.frame_count.saturating_sub(1)),
        ))
    }

    /// Set the audio gain.
    ///
    /// # Errors
    ///
    /// [`FramestepError::InvalidParameter`] outside `0.0..=1.0`.
    pub fn set_volume(&self, volume: f32) -> Result<(), FramestepError> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(FramestepError::InvalidParameter(format!(
                "volume {volume} is outside 0.0..=1.0"
            )));
        }
        self.send(Command::Volume(volume))
    }

    pub fn set_muted(&self, muted: bool) -> Result<(), FramestepError> {
        self.send(Command::Muted(muted))
    }

    /// Re-emit the current frame.
    pub fn refresh(&self) -> Result<(), FramestepError> {
        self.send(Command::Refresh)
    }

    /// Block until every command sent so far has been applied.
    pub fn wait_idle(&self, timeout: Duration) -> Result<(), FramestepError> {
        let (reply, done) = bounded(1);
        self.send(Command::Barrier(reply))?;
        done.recv_timeout(timeout).map_err(|_| {
            FramestepError::InvalidState("playback worker did not respond".to_string())
        })
    }

    /// Current state snapshot.
    pub fn state(&self) -> PlaybackState {
        self.state.read().clone()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Maps elapsed wall time onto media time while playing.
struct PlayClock {
    anchor_seconds: f64,
    started: Instant,
}

impl PlayClock {
    fn new(anchor_seconds: f64) -> Self {
        Self {
            anchor_seconds,
            started: Instant::now(),
        }
    }

    fn media_time(&self) -> f64 {
        self.anchor_seconds + self.started.elapsed().as_secs_f64()
    }
}

struct Worker {
    cache: Arc<FrameCache>,
    audio: Box<dyn AudioOutput>,
    events: EventSink,
    state: Arc<RwLock<PlaybackState>>,
    frame_rate: f64,
    frame_count: u64,
    period: Duration,
    tolerance: u32,
    clock: Option<PlayClock>,
    next_tick: Instant,
    consecutive_failures: u32,
    /// Last clock target that failed to decode, so a repeat tick does not
    /// count it twice.
    failed_target: Option<u64>,
}

impl Worker {
    fn run(mut self, commands: Receiver<Command>) {
        loop {
            let command = if self.clock.is_some() {
                match commands.recv_deadline(self.next_tick) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                match commands.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                }
            };

            match command {
                Some(Command::Shutdown) => break,
                Some(command) => self.handle(command),
                None => {
                    self.tick();
                    self.schedule_next_tick();
                }
            }
        }
        self.audio.stop();
        log::debug!("Playback worker exiting");
    }

    fn last_index(&self) -> u64 {
        self.frame_count.saturating_sub(1)
    }

    fn current(&self) -> u64 {
        self.state.read().current_frame_index
    }

    fn status(&self) -> PlaybackStatus {
        self.state.read().status
    }

    fn publish_state(&self) {
        let snapshot = self.state.read().clone();
        self.events.emit(SessionEvent::PlaybackStateChanged(snapshot));
    }

    fn set_status(&self, status: PlaybackStatus) {
        self.state.write().status = status;
    }

    fn schedule_next_tick(&mut self) {
        let now = Instant::now();
        self.next_tick += self.period;
        if self.next_tick <= now {
            // Fell behind; the next tick picks the frame for "now".
            self.next_tick = now + self.period;
        }
    }

    /// Fetch and show `frame_index`. On failure the index is left alone.
    fn show(&mut self, frame_index: u64) -> Result<(), FramestepError> {
        let frame = self.cache.get_frame(frame_index)?;
        self.state.write().current_frame_index = frame_index;
        self.failed_target = None;
        self.events.emit_frame(frame);
        Ok(())
    }

    fn surface(&self, error: &FramestepError) {
        log::warn!("Playback command failed: {error}");
        self.events.emit_error(error);
    }

    fn start_clock(&mut self, anchor_index: u64) {
        let anchor_seconds = frame_timestamp(anchor_index, self.frame_rate);
        self.clock = Some(PlayClock::new(anchor_seconds));
        self.next_tick = Instant::now() + self.period;
        self.audio.start(anchor_seconds);
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Play => self.play(),
            Command::Pause => {
                if self.status() == PlaybackStatus::Playing {
                    self.clock = None;
                    self.audio.pause();
                    self.set_status(PlaybackStatus::Paused);
                    self.publish_state();
                }
            }
            Command::Stop => {
                self.clock = None;
                self.audio.stop();
                {
                    let mut state = self.state.write();
                    state.status = PlaybackStatus::Stopped;
                    state.current_frame_index = 0;
                }
                if let Err(error) = self.show(0) {
                    self.surface(&error);
                }
                self.publish_state();
            }
            Command::Step(direction) => self.step(direction),
            Command::Seek(timestamp) => {
                let cached_landing = frame_index_at(timestamp, self.frame_rate, self.frame_count);
                let landing = if self.cache.contains(cached_landing) {
                    Ok(cached_landing)
                } else {
                    self.cache.seek_near(timestamp)
                };
                match landing {
                    Ok(index) => self.jump(index),
                    Err(error) => self.surface(&error),
                }
            }
            Command::SeekFrame(frame_index) => self.jump(frame_index),
            Command::Volume(volume) => {
                self.state.write().volume = volume;
                self.audio.set_volume(volume);
                self.publish_state();
            }
            Command::Muted(muted) => {
                self.state.write().muted = muted;
                self.audio.set_muted(muted);
                self.publish_state();
            }
            Command::Refresh => {
                let current = self.current();
                if let Err(error) = self.show(current) {
                    self.surface(&error);
                }
            }
            Command::Barrier(reply) => {
                let _ = reply.send(());
            }
            Command::Shutdown => {}
        }
    }

    fn play(&mut self) {
        if self.status() == PlaybackStatus::Playing {
            return;
        }
        if self.current() >= self.last_index() && self.frame_count > 1 {
            if let Err(error) = self.show(0) {
                self.surface(&error);
                return;
            }
        }

        self.consecutive_failures = 0;
        self.failed_target = None;
        {
            let mut state = self.state.write();
            state.status = PlaybackStatus::Playing;
            state.error = None;
        }
        let anchor = self.current();
        self.start_clock(anchor);
        log::debug!("Playing from frame {anchor}");
        self.publish_state();
    }

    fn step(&mut self, direction: StepDirection) {
        if self.status() == PlaybackStatus::Playing {
            self.surface(&FramestepError::InvalidState(
                "cannot step while playing".to_string(),
            ));
            return;
        }
        let current = self.current();
        let target = match direction {
            StepDirection::Forward => (current + 1).min(self.last_index()),
            StepDirection::Backward => current.saturating_sub(1),
        };
        if target == current {
            return;
        }
        match self.show(target) {
            Ok(()) => {
                if self.status() == PlaybackStatus::Stopped {
                    self.set_status(PlaybackStatus::Paused);
                    self.publish_state();
                }
            }
            Err(error) => self.surface(&error),
        }
    }

    fn jump(&mut self, frame_index: u64) {
        if let Err(error) = self.show(frame_index) {
            self.surface(&error);
            return;
        }
        match self.status() {
            PlaybackStatus::Playing => self.start_clock(frame_index),
            PlaybackStatus::Stopped => {
                self.set_status(PlaybackStatus::Paused);
                self.publish_state();
            }
            PlaybackStatus::Paused => {}
        }
    }

    fn finish(&mut self) {
        self.clock = None;
        self.audio.pause();
        self.set_status(PlaybackStatus::Paused);
        log::debug!("Playback reached the last frame");
        self.events.emit(SessionEvent::PlaybackFinished);
        self.publish_state();
    }

    fn tick(&mut self) {
        if self.clock.is_none() {
            return;
        }
        let current = self.current();
        let last = self.last_index();
        if current >= last {
            self.finish();
            return;
        }

        let media_time = if let Some(position) = self.audio.position() {
            // Re-anchor on the audio clock.
            self.clock = Some(PlayClock::new(position));
            position
        } else if let Some(clock) = &self.clock {
            clock.media_time()
        } else {
            return;
        };
        let target = ((media_time * self.frame_rate).round().max(0.0) as u64).min(last);
        if target <= current {
            return;
        }
        if target > current + 1 {
            log::trace!("Dropping frames {}..{target}", current + 1);
        }

        match self.cache.get_frame(target) {
            Ok(frame) => {
                self.consecutive_failures = 0;
                self.failed_target = None;
                self.state.write().current_frame_index = target;
                self.events.emit_clock_frame(frame);
            }
            Err(_) if self.failed_target == Some(target) => return,
            Err(error) => {
                // The displayed frame stays current; only the clock moves on.
                self.failed_target = Some(target);
                self.consecutive_failures += 1;
                log::warn!(
                    "Skipping frame {target} ({}/{}): {error}",
                    self.consecutive_failures,
                    self.tolerance
                );
                if self.consecutive_failures >= self.tolerance {
                    self.clock = None;
                    self.audio.pause();
                    {
                        let mut state = self.state.write();
                        state.status = PlaybackStatus::Paused;
                        state.error = Some(error.to_string());
                    }
                    self.events.emit_error(&error);
                    self.publish_state();
                    return;
                }
            }
        }

        if target >= last {
            self.finish();
        }
    }
}
