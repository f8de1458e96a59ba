//! Audio output and the audio clock.
//!
//! The playback engine drives an [`AudioOutput`] alongside its frame ticks.
//! When the output reports a [`position`](AudioOutput::position), the engine
//! picks frames from it instead of from the wall clock so that video follows
//! the sound card.
//!
//! [`SilentAudio`] is used for media without sound and when no device is
//! available. With the `audio` feature, [`DeviceAudio`] decodes the audio
//! track with FFmpeg and plays it through `rodio` on a dedicated thread.

/// Sink for a media file's audio track.
pub trait AudioOutput: Send {
    /// Start or resume playback from `position_seconds`.
    fn start(&mut self, position_seconds: f64);
    /// Pause, keeping the position.
    fn pause(&mut self);
    /// Stop and drop anything queued.
    fn stop(&mut self);
    /// Linear gain in `0.0..=1.0`.
    fn set_volume(&mut self, volume: f32);
    fn set_muted(&mut self, muted: bool);
    /// Seconds of media audibly played, or `None` when not clocking.
    fn position(&self) -> Option<f64>;
}

/// Output that plays nothing and never provides a clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentAudio;

impl AudioOutput for SilentAudio {
    fn start(&mut self, _position_seconds: f64) {}
    fn pause(&mut self) {}
    fn stop(&mut self) {}
    fn set_volume(&mut self, _volume: f32) {}
    fn set_muted(&mut self, _muted: bool) {}
    fn position(&self) -> Option<f64> {
        None
    }
}

#[cfg(feature = "audio")]
pub use device::DeviceAudio;

#[cfg(feature = "audio")]
mod device {
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
    use ffmpeg_next::{
        ChannelLayout, Error as FfmpegError, Packet,
        codec::context::Context as CodecContext,
        decoder::Audio as AudioDecoder,
        format::{
            Sample,
            context::Input,
            sample::Type as SampleType,
        },
        frame::Audio as AudioFrame,
        media::Type,
        software::resampling::Context as ResamplingContext,
    };
    use rodio::{OutputStream, OutputStreamBuilder, Sink, buffer::SamplesBuffer};

    use super::AudioOutput;
    use crate::conversion::{pts_to_seconds, seconds_to_seek_timestamp};
    use crate::error::FramestepError;

    /// Chunks kept queued in the sink.
    const QUEUED_CHUNKS: usize = 4;
    /// Minimum length of one queued chunk.
    const CHUNK_SECONDS: f64 = 0.1;
    const POLL_INTERVAL: Duration = Duration::from_millis(10);

    enum AudioCommand {
        Start(f64),
        Pause,
        Stop,
        Volume(f32),
        Muted(bool),
        Shutdown,
    }

    #[derive(Default)]
    struct AudioClock {
        position_bits: AtomicU64,
        active: AtomicBool,
    }

    impl AudioClock {
        fn publish(&self, seconds: f64) {
            self.position_bits.store(seconds.to_bits(), Ordering::Release);
            self.active.store(true, Ordering::Release);
        }

        fn deactivate(&self) {
            self.active.store(false, Ordering::Release);
        }

        fn read(&self) -> Option<f64> {
            self.active
                .load(Ordering::Acquire)
                .then(|| f64::from_bits(self.position_bits.load(Ordering::Acquire)))
        }
    }

    /// Audio played through the default output device.
    pub struct DeviceAudio {
        commands: Sender<AudioCommand>,
        clock: Arc<AudioClock>,
        handle: Option<JoinHandle<()>>,
    }

    impl DeviceAudio {
        /// Open the default device and the audio track of `path`.
        ///
        /// # Errors
        ///
        /// [`FramestepError::DecodeError`] if the device or the audio track
        /// cannot be opened.
        pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FramestepError> {
            let path = path.as_ref().to_path_buf();
            let (commands, receiver) = unbounded();
            let (ready_tx, ready_rx) = bounded(1);
            let clock = Arc::new(AudioClock::default());
            let thread_clock = Arc::clone(&clock);

            let handle = thread::Builder::new()
                .name("framestep-audio".to_string())
                .spawn(move || run_audio_thread(path, receiver, thread_clock, ready_tx))
                .map_err(|error| {
                    FramestepError::DecodeError(format!("Could not spawn audio thread: {error}"))
                })?;

            match ready_rx.recv() {
                Ok(Ok(())) => Ok(Self {
                    commands,
                    clock,
                    handle: Some(handle),
                }),
                Ok(Err(error)) => {
                    let _ = handle.join();
                    Err(error)
                }
                Err(_) => {
                    let _ = handle.join();
                    Err(FramestepError::DecodeError(
                        "Audio thread exited during startup".to_string(),
                    ))
                }
            }
        }

        fn send(&self, command: AudioCommand) {
            let _ = self.commands.send(command);
        }
    }

    impl AudioOutput for DeviceAudio {
        fn start(&mut self, position_seconds: f64) {
            self.send(AudioCommand::Start(position_seconds));
        }

        fn pause(&mut self) {
            self.clock.deactivate();
            self.send(AudioCommand::Pause);
        }

        fn stop(&mut self) {
            self.clock.deactivate();
            self.send(AudioCommand::Stop);
        }

        fn set_volume(&mut self, volume: f32) {
            self.send(AudioCommand::Volume(volume));
        }

        fn set_muted(&mut self, muted: bool) {
            self.send(AudioCommand::Muted(muted));
        }

        fn position(&self) -> Option<f64> {
            self.clock.read()
        }
    }

    impl Drop for DeviceAudio {
        fn drop(&mut self) {
            self.send(AudioCommand::Shutdown);
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    /// Sequential audio decoder producing interleaved stereo `f32`.
    struct TrackDecoder {
        input: Input,
        stream_index: usize,
        time_base: ffmpeg_next::Rational,
        decoder: AudioDecoder,
        resampler: ResamplingContext,
        decoded: AudioFrame,
        resampled: AudioFrame,
        sample_rate: u32,
        eof_sent: bool,
        /// Decoded audio before this point is discarded after a seek.
        discard_before: f64,
    }

    impl TrackDecoder {
        fn open(path: &Path) -> Result<Self, FramestepError> {
            crate::ffmpeg::ensure_initialized().map_err(FramestepError::DecodeError)?;
            let input = ffmpeg_next::format::input(&path).map_err(|error| {
                FramestepError::DecodeError(format!("Failed to open audio of {path:?}: {error}"))
            })?;
            let stream = input.streams().best(Type::Audio).ok_or_else(|| {
                FramestepError::DecodeError(format!("{path:?} has no audio stream"))
            })?;
            let stream_index = stream.index();
            let time_base = stream.time_base();
            let decoder = CodecContext::from_parameters(stream.parameters())?
                .decoder()
                .audio()
                .map_err(|error| {
                    FramestepError::DecodeError(format!("Failed to create audio decoder: {error}"))
                })?;
            let sample_rate = decoder.rate();
            let resampler = ResamplingContext::get(
                decoder.format(),
                decoder.channel_layout(),
                sample_rate,
                Sample::F32(SampleType::Packed),
                ChannelLayout::STEREO,
                sample_rate,
            )
            .map_err(|error| {
                FramestepError::DecodeError(format!("Failed to create resampler: {error}"))
            })?;

            Ok(Self {
                input,
                stream_index,
                time_base,
                decoder,
                resampler,
                decoded: AudioFrame::empty(),
                resampled: AudioFrame::empty(),
                sample_rate,
                eof_sent: false,
                discard_before: 0.0,
            })
        }

        fn seek(&mut self, seconds: f64) {
            let timestamp = seconds_to_seek_timestamp(seconds);
            if let Err(error) = self.input.seek(timestamp, ..timestamp) {
                log::warn!("Audio seek to {seconds:.3}s failed: {error}");
            }
            self.decoder.flush();
            self.eof_sent = false;
            self.discard_before = seconds;
        }

        /// Decode at least `min_frames` stereo frames, or whatever is left.
        fn next_chunk(&mut self, min_frames: usize) -> Option<Vec<f32>> {
            let mut samples: Vec<f32> = Vec::with_capacity(min_frames * 2);
            while samples.len() < min_frames * 2 {
                if self.decoder.receive_frame(&mut self.decoded).is_ok() {
                    let start = self
                        .decoded
                        .pts()
                        .map(|pts| pts_to_seconds(pts, self.time_base))
                        .unwrap_or(self.discard_before);
                    let length = self.decoded.samples() as f64 / self.sample_rate.max(1) as f64;
                    if start + length < self.discard_before {
                        continue;
                    }
                    if let Err(error) = self.resampler.run(&self.decoded, &mut self.resampled) {
                        log::warn!("Audio resample failed: {error}");
                        continue;
                    }
                    let floats = self.resampled.samples() * 2;
                    samples.extend(
                        self.resampled
                            .data(0)
                            .chunks_exact(4)
                            .take(floats)
                            .map(|bytes| f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
                    );
                    continue;
                }
                if self.eof_sent {
                    break;
                }

                let mut packet = Packet::empty();
                match packet.read(&mut self.input) {
                    Ok(()) => {
                        if packet.stream() == self.stream_index {
                            if let Err(error) = self.decoder.send_packet(&packet) {
                                log::warn!("Audio packet rejected: {error}");
                            }
                        }
                    }
                    Err(FfmpegError::Eof) => {
                        let _ = self.decoder.send_eof();
                        self.eof_sent = true;
                    }
                    Err(_) => {}
                }
            }
            (!samples.is_empty()).then_some(samples)
        }
    }

    struct AudioThread {
        _stream: OutputStream,
        sink: Sink,
        track: TrackDecoder,
        clock: Arc<AudioClock>,
        chunk_starts: VecDeque<f64>,
        next_chunk_start: f64,
        playing: bool,
        volume: f32,
        muted: bool,
    }

    impl AudioThread {
        fn apply_volume(&self) {
            self.sink.set_volume(if self.muted { 0.0 } else { self.volume });
        }

        fn handle(&mut self, command: AudioCommand) -> bool {
            match command {
                AudioCommand::Start(position) => {
                    self.sink.clear();
                    self.chunk_starts.clear();
                    self.track.seek(position);
                    self.next_chunk_start = position;
                    self.clock.publish(position);
                    self.refill();
                    self.sink.play();
                    self.playing = true;
                }
                AudioCommand::Pause => {
                    self.sink.pause();
                    self.playing = false;
                    self.clock.deactivate();
                }
                AudioCommand::Stop => {
                    self.sink.clear();
                    self.chunk_starts.clear();
                    self.playing = false;
                    self.clock.deactivate();
                }
                AudioCommand::Volume(volume) => {
                    self.volume = volume.clamp(0.0, 1.0);
                    self.apply_volume();
                }
                AudioCommand::Muted(muted) => {
                    self.muted = muted;
                    self.apply_volume();
                }
                AudioCommand::Shutdown => return false,
            }
            true
        }

        fn refill(&mut self) {
            let min_frames = (self.track.sample_rate as f64 * CHUNK_SECONDS) as usize;
            while self.sink.len() < QUEUED_CHUNKS {
                let Some(samples) = self.track.next_chunk(min_frames.max(1)) else {
                    break;
                };
                let frames = samples.len() / 2;
                self.sink
                    .append(SamplesBuffer::new(2, self.track.sample_rate, samples));
                self.chunk_starts.push_back(self.next_chunk_start);
                self.next_chunk_start += frames as f64 / self.track.sample_rate.max(1) as f64;
            }
        }

        fn update_clock(&mut self) {
            while self.chunk_starts.len() > self.sink.len() {
                self.chunk_starts.pop_front();
            }
            match self.chunk_starts.front() {
                Some(start) => self.clock.publish(start + self.sink.get_pos().as_secs_f64()),
                None => self.clock.deactivate(),
            }
        }
    }

    fn run_audio_thread(
        path: PathBuf,
        commands: Receiver<AudioCommand>,
        clock: Arc<AudioClock>,
        ready: Sender<Result<(), FramestepError>>,
    ) {
        let stream = match OutputStreamBuilder::open_default_stream() {
            Ok(stream) => stream,
            Err(error) => {
                let _ = ready.send(Err(FramestepError::DecodeError(format!(
                    "No audio output device: {error}"
                ))));
                return;
            }
        };
        let track = match TrackDecoder::open(&path) {
            Ok(track) => track,
            Err(error) => {
                let _ = ready.send(Err(error));
                return;
            }
        };
        let sink = Sink::connect_new(stream.mixer());
        sink.pause();

        let mut state = AudioThread {
            _stream: stream,
            sink,
            track,
            clock,
            chunk_starts: VecDeque::new(),
            next_chunk_start: 0.0,
            playing: false,
            volume: 1.0,
            muted: false,
        };
        let _ = ready.send(Ok(()));
        log::debug!("Audio output ready for {path:?}");

        loop {
            let received = if state.playing {
                commands.recv_timeout(POLL_INTERVAL)
            } else {
                commands.recv().map_err(|_| RecvTimeoutError::Disconnected)
            };
            match received {
                Ok(command) => {
                    if !state.handle(command) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if state.playing {
                state.refill();
                state.update_clock();
            }
        }
        state.sink.clear();
        state.clock.deactivate();
    }
}
