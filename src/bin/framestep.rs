use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use framestep::{
    DurationAdvisory, ExportJob, ExportQuality, ExportSize, ExportStatus, MediaMetadata,
    PlaybackStatus, PlayerConfig, Session, SessionEvent, duration_advisory, estimate_export_size,
    format_file_size, open_source,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;

const CLI_AFTER_HELP: &str = "Examples:\n  framestep info input.mp4 --json\n  framestep frame input.mp4 --time 0:00:12.5 --out still.png\n  framestep export-gif input.mp4 --start 2 --end 5 --fps 12 --size small --out clip.gif --progress\n  framestep play input.mp4 --seconds 5\n  framestep completions zsh > _framestep";

const LARGE_ESTIMATE_BYTES: u64 = 10 * 1024 * 1024;
const VERY_LARGE_ESTIMATE_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Parser)]
#[command(
    name = "framestep",
    version,
    about = "Inspect, step through and export clips from video files",
    after_help = CLI_AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Parser, Clone, Default)]
struct GlobalOptions {
    /// Show additional output.
    #[arg(long)]
    verbose: bool,

    /// Show a progress bar where supported.
    #[arg(long)]
    progress: bool,

    /// Allow overwriting existing output files.
    #[arg(long)]
    overwrite: bool,

    /// FFmpeg log level (off, error, warn, info, debug, trace).
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print media properties (alias: probe).
    #[command(
        about = "Print media properties",
        visible_alias = "probe",
        after_help = "Examples:\n  framestep info input.mp4\n  framestep info input.gif --json"
    )]
    Info {
        /// Input media path.
        input: PathBuf,

        /// Output as machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Save a single frame as an image.
    #[command(
        about = "Save one frame",
        after_help = "Examples:\n  framestep frame input.mp4 --index 120 --out frame.png\n  framestep frame input.mp4 --time 01:02.5 --out frame.jpg"
    )]
    Frame {
        /// Input media path.
        input: PathBuf,
        /// Output image path (png, jpg, bmp, tiff).
        #[arg(long)]
        out: PathBuf,
        /// Frame index.
        #[arg(long, conflicts_with = "time")]
        index: Option<u64>,
        /// Timestamp; the last frame at or before it is saved.
        #[arg(long)]
        time: Option<String>,
    },

    /// Export a time range as an animated GIF.
    #[command(
        about = "Export an animated GIF",
        after_help = "Examples:\n  framestep export-gif input.mp4 --out clip.gif\n  framestep export-gif input.mp4 --start 00:10 --end 00:14 --fps 15 --quality high --out clip.gif"
    )]
    ExportGif {
        /// Input media path.
        input: PathBuf,
        /// Output GIF path.
        #[arg(long)]
        out: PathBuf,
        /// Range start (default 0).
        #[arg(long)]
        start: Option<String>,
        /// Range end (default start + 10s, clamped to the media).
        #[arg(long)]
        end: Option<String>,
        /// Output frames per second.
        #[arg(long)]
        fps: Option<f64>,
        /// Size preset: small, medium, large, hd, original.
        #[arg(long)]
        size: Option<String>,
        /// Explicit output width (overrides --size).
        #[arg(long)]
        width: Option<u32>,
        /// Explicit output height (overrides --size).
        #[arg(long)]
        height: Option<u32>,
        /// Quality: low, medium, high, or 1-100.
        #[arg(long)]
        quality: Option<String>,
        /// Stretch to the exact size instead of fitting inside it.
        #[arg(long)]
        stretch: bool,
        /// Play the animation this many extra times instead of forever.
        #[arg(long)]
        loops: Option<u16>,
    },

    /// Play headlessly and report pacing.
    #[command(
        about = "Play without a display and report delivered frames",
        after_help = "Examples:\n  framestep play input.mp4 --seconds 5\n  framestep play input.mp4 --from 01:00 --seconds 2 --json"
    )]
    Play {
        /// Input media path.
        input: PathBuf,
        /// Start position.
        #[arg(long)]
        from: Option<String>,
        /// How long to play, in seconds.
        #[arg(long, default_value_t = 3.0)]
        seconds: f64,
        /// Output as machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

fn parse_timecode(value: &str) -> Result<f64, Box<dyn std::error::Error>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("time value cannot be empty".into());
    }

    if let Ok(seconds) = trimmed.parse::<f64>() {
        return Ok(seconds.max(0.0));
    }

    let parts: Vec<&str> = trimmed.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(format!("invalid time format: {trimmed}").into());
    }

    let (hours, minutes, seconds_str) = if parts.len() == 3 {
        (parts[0].parse::<u64>()?, parts[1].parse::<u64>()?, parts[2])
    } else {
        (0_u64, parts[0].parse::<u64>()?, parts[1])
    };

    let seconds = seconds_str.parse::<f64>()?;
    let total_seconds = (hours as f64 * 3600.0) + (minutes as f64 * 60.0) + seconds;
    Ok(total_seconds.max(0.0))
}

fn parse_export_size(value: &str) -> Option<ExportSize> {
    match value.to_ascii_lowercase().as_str() {
        "small" | "s" => Some(ExportSize::Small),
        "medium" | "m" => Some(ExportSize::Medium),
        "large" | "l" => Some(ExportSize::Large),
        "hd" => Some(ExportSize::Hd),
        "original" | "source" => Some(ExportSize::Original),
        _ => None,
    }
}

fn parse_quality(value: &str) -> Option<u8> {
    match value.to_ascii_lowercase().as_str() {
        "low" => Some(ExportQuality::Low.level()),
        "medium" => Some(ExportQuality::Medium.level()),
        "high" => Some(ExportQuality::High.level()),
        other => other
            .parse::<u8>()
            .ok()
            .filter(|quality| (1..=100).contains(quality)),
    }
}

fn ensure_writable_path(path: &Path, overwrite: bool) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() {
        if overwrite {
            eprintln!(
                "{} {}",
                "warning:".yellow().bold(),
                format!("overwriting {}", path.display()).yellow()
            );
        } else {
            return Err(format!(
                "output already exists: {} (use --overwrite to replace)",
                path.display()
            )
            .into());
        }
    }
    Ok(())
}

fn warn(message: impl AsRef<str>) {
    eprintln!("{} {}", "warning:".yellow().bold(), message.as_ref().yellow());
}

fn apply_global_options(global: &GlobalOptions) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(level) = &global.log_level {
        let parsed: log::LevelFilter = level
            .parse()
            .map_err(|_| format!("unsupported --log-level: {level}"))?;
        #[cfg(feature = "ffmpeg")]
        framestep::set_ffmpeg_log_level(parsed);
        #[cfg(not(feature = "ffmpeg"))]
        {
            let _ = parsed;
            warn("--log-level requires building with the `ffmpeg` feature");
        }
    }
    Ok(())
}

fn print_metadata(metadata: &MediaMetadata) {
    println!("{} {}", "Container:".bold(), metadata.container);
    println!(
        "{} {}x{} ({})",
        "Video:".bold(),
        metadata.width,
        metadata.height,
        metadata.video_codec
    );
    println!(
        "{} {:.3} fps{}",
        "Frame rate:".bold(),
        metadata.frame_rate,
        if metadata.variable_frame_rate {
            " (variable)"
        } else {
            ""
        }
    );
    println!("{} {}", "Frames:".bold(), metadata.frame_count);
    println!("{} {:.3}s", "Duration:".bold(), metadata.duration_seconds);
    match &metadata.audio_codec {
        Some(codec) => println!("{} {codec}", "Audio:".bold()),
        None if metadata.has_audio => println!("{} yes", "Audio:".bold()),
        None => println!("{} none", "Audio:".bold()),
    }
}

fn wait_for_event<F>(
    events: &crossbeam_channel::Receiver<SessionEvent>,
    timeout: Duration,
    mut accept: F,
) -> Result<SessionEvent, Box<dyn std::error::Error>>
where
    F: FnMut(&SessionEvent) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let event = events.recv_deadline(deadline)?;
        if accept(&event) {
            return Ok(event);
        }
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    apply_global_options(&cli.global)?;

    match cli.command {
        Commands::Info { input, json } => {
            let source = open_source(&input)?;
            let metadata = source.metadata();
            if json {
                let payload = json!({
                    "path": input.display().to_string(),
                    "container": metadata.container,
                    "duration_seconds": metadata.duration_seconds,
                    "frame_rate": metadata.frame_rate,
                    "frame_count": metadata.frame_count,
                    "variable_frame_rate": metadata.variable_frame_rate,
                    "video": json!({
                        "codec": metadata.video_codec,
                        "width": metadata.width,
                        "height": metadata.height,
                    }),
                    "audio": metadata.has_audio.then(|| json!({
                        "codec": metadata.audio_codec,
                    })),
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_metadata(metadata);
            }
        }
        Commands::Frame {
            input,
            out,
            index,
            time,
        } => {
            ensure_writable_path(&out, cli.global.overwrite)?;
            let mut source = open_source(&input)?;
            let frame = match (index, time) {
                (Some(index), _) => source.decode_at(index)?,
                (None, Some(time)) => {
                    let seconds = parse_timecode(&time)?;
                    let landed = source.seek_near(seconds)?;
                    if cli.global.verbose {
                        eprintln!("seek to {seconds:.3}s landed on frame {landed}");
                    }
                    source.decode_next()?
                }
                (None, None) => source.decode_at(0)?,
            };
            frame.image().save(&out)?;
            println!(
                "{} frame {} ({:.3}s) -> {}",
                "saved".green().bold(),
                frame.index(),
                frame.timestamp(),
                out.display()
            );
        }
        Commands::ExportGif {
            input,
            out,
            start,
            end,
            fps,
            size,
            width,
            height,
            quality,
            stretch,
            loops,
        } => {
            ensure_writable_path(&out, cli.global.overwrite)?;

            let config = PlayerConfig::new().with_auto_build_thumbnails(false);
            let mut session = Session::new(config)?;
            let events = session.events();
            let metadata = session.open(&input)?;

            let mut job = session.default_export_job(out.clone())?;
            let start_seconds = match &start {
                Some(value) => parse_timecode(value)?,
                None => 0.0,
            };
            let end_seconds = match &end {
                Some(value) => parse_timecode(value)?,
                None => (start_seconds + framestep::export::DEFAULT_EXPORT_SPAN)
                    .min(metadata.duration_seconds),
            };
            job = job.with_range(start_seconds, end_seconds);
            if let Some(fps) = fps {
                job = job.with_fps(fps);
            }
            if let Some(size) = &size {
                let preset =
                    parse_export_size(size).ok_or(format!("unsupported --size: {size}"))?;
                job = job.with_export_size(preset);
            }
            if width.is_some() || height.is_some() {
                job = job.with_dimensions(width, height);
            }
            if let Some(quality) = &quality {
                let level =
                    parse_quality(quality).ok_or(format!("unsupported --quality: {quality}"))?;
                job = job.with_quality(level);
            }
            job = job
                .with_preserve_aspect(!stretch)
                .with_repeat(loops);

            match duration_advisory(job.span()) {
                DurationAdvisory::VeryLarge => {
                    warn(format!("{:.1}s range will produce a very large GIF", job.span()))
                }
                DurationAdvisory::Large => {
                    warn(format!("{:.1}s range may produce a large GIF", job.span()))
                }
                DurationAdvisory::Normal => {}
            }
            let estimate = estimate_export_size(&job, &metadata);
            if estimate > VERY_LARGE_ESTIMATE_BYTES {
                warn(format!("estimated size {} is very large", format_file_size(estimate)));
            } else if estimate > LARGE_ESTIMATE_BYTES {
                warn(format!("estimated size {} is large", format_file_size(estimate)));
            }
            if cli.global.verbose {
                let (out_width, out_height) = job.output_dimensions(&metadata);
                eprintln!(
                    "exporting [{:.3}s, {:.3}s) at {:.2} fps, {out_width}x{out_height}, quality {}, ~{}",
                    job.start_time,
                    job.end_time,
                    job.target_fps,
                    job.quality,
                    format_file_size(estimate)
                );
            }

            let handle = session.start_export(job)?;
            let progress_bar = if cli.global.progress {
                let pb = ProgressBar::new(0);
                let style = ProgressStyle::with_template(
                    "{spinner:.green} {bar:40.cyan/blue} {pos}/{len} {msg}",
                )?;
                pb.set_style(style.progress_chars("##-"));
                Some(pb)
            } else {
                None
            };

            let finished = loop {
                match events.recv()? {
                    SessionEvent::ExportProgress {
                        job_id,
                        frames_processed,
                        total_frames,
                    } if job_id == handle.id() => {
                        if let Some(pb) = &progress_bar {
                            pb.set_length(total_frames);
                            pb.set_position(frames_processed);
                        }
                    }
                    SessionEvent::ExportFinished(report) if report.job_id == handle.id() => {
                        break report;
                    }
                    _ => {}
                }
            };

            if let Some(pb) = progress_bar {
                pb.finish_with_message("done");
            }

            match finished.status {
                ExportStatus::Completed => {
                    let written = std::fs::metadata(&finished.output_path)
                        .map(|file| format_file_size(file.len()))
                        .unwrap_or_else(|_| "unknown size".to_string());
                    println!(
                        "{} {}",
                        "success:".green().bold(),
                        format!(
                            "Exported {} frame(s) to {} ({written})",
                            finished.frames_written,
                            finished.output_path.display()
                        )
                        .green()
                    );
                }
                ExportStatus::Cancelled => return Err("export cancelled".into()),
                _ => {
                    let (kind, message) = finished
                        .failure
                        .unwrap_or((framestep::ErrorKind::EncodeError, "unknown".to_string()));
                    return Err(format!("export failed ({kind}): {message}").into());
                }
            }
        }
        Commands::Play {
            input,
            from,
            seconds,
            json,
        } => {
            let config = PlayerConfig::new().with_auto_build_thumbnails(false);
            let mut session = Session::new(config)?;
            let events = session.events();
            let metadata = session.open(&input)?;
            wait_for_event(&events, Duration::from_secs(10), |event| {
                matches!(event, SessionEvent::FrameReady(_))
            })?;

            if let Some(from) = &from {
                session.seek(parse_timecode(from)?)?;
                session.wait_idle(Duration::from_secs(10))?;
            }
            while events.try_recv().is_ok() {}

            let started = Instant::now();
            session.play()?;
            let deadline = started + Duration::from_secs_f64(seconds.max(0.0));
            let mut delivered = 0_u64;
            let mut first_frame = None;
            let mut last_frame = None;
            let mut finished = false;
            let mut errors = Vec::new();

            while let Ok(event) = events.recv_deadline(deadline) {
                match event {
                    SessionEvent::FrameReady(frame) => {
                        delivered += 1;
                        first_frame.get_or_insert(frame.index());
                        last_frame = Some(frame.index());
                        if cli.global.verbose {
                            eprintln!("frame {} at {:.3}s", frame.index(), frame.timestamp());
                        }
                    }
                    SessionEvent::PlaybackFinished => {
                        finished = true;
                        break;
                    }
                    SessionEvent::Error { kind, message } => errors.push(format!("{kind}: {message}")),
                    _ => {}
                }
            }

            session.pause()?;
            session.wait_idle(Duration::from_secs(10))?;
            let elapsed = started.elapsed().as_secs_f64();
            let snapshot = session.snapshot();
            let stats = session.cache_stats().unwrap_or_default();
            let expected = (elapsed * metadata.frame_rate).round() as u64;

            if json {
                let payload = json!({
                    "elapsed_seconds": elapsed,
                    "frames_delivered": delivered,
                    "frames_expected": expected,
                    "first_frame": first_frame,
                    "last_frame": last_frame,
                    "position_seconds": snapshot.position_seconds,
                    "finished": finished,
                    "paused": snapshot.playback.status == PlaybackStatus::Paused,
                    "cache": json!({
                        "hits": stats.hits,
                        "misses": stats.misses,
                        "evictions": stats.evictions,
                        "peak_resident": stats.peak_resident,
                        "capacity": stats.capacity,
                    }),
                    "errors": errors,
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                println!("{} {:.2}s", "Played:".bold(), elapsed);
                println!(
                    "{} {delivered} of ~{expected}",
                    "Frames delivered:".bold()
                );
                if let (Some(first), Some(last)) = (first_frame, last_frame) {
                    println!("{} {first} -> {last}", "Frame range:".bold());
                }
                println!(
                    "{} {:.3}s ({:?})",
                    "Position:".bold(),
                    snapshot.position_seconds,
                    snapshot.playback.status
                );
                println!(
                    "{} {} hits, {} misses, {} evictions, peak {}/{}",
                    "Cache:".bold(),
                    stats.hits,
                    stats.misses,
                    stats.evictions,
                    stats.peak_resident,
                    stats.capacity
                );
                if finished {
                    println!("{}", "reached the end of the stream".cyan());
                }
                if let Some(error) = &snapshot.playback.error {
                    warn(format!("playback paused after repeated failures: {error}"));
                }
                for error in &errors {
                    warn(error);
                }
            }
        }
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "framestep", &mut std::io::stdout());
        }
    }

    Ok(())
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_export_size, parse_quality, parse_timecode};

    #[test]
    fn parse_timecode_formats() {
        assert_eq!(parse_timecode("75").unwrap(), 75.0);
        assert_eq!(parse_timecode("01:15").unwrap(), 75.0);
        assert_eq!(parse_timecode("00:01:15.5").unwrap(), 75.5);
        assert!(parse_timecode("").is_err());
        assert!(parse_timecode("1:2:3:4").is_err());
    }

    #[test]
    fn parse_export_size_aliases() {
        assert!(parse_export_size("small").is_some());
        assert!(parse_export_size("HD").is_some());
        assert!(parse_export_size("original").is_some());
        assert!(parse_export_size("huge").is_none());
    }

    #[test]
    fn parse_quality_levels() {
        assert_eq!(parse_quality("low"), Some(70));
        assert_eq!(parse_quality("High"), Some(95));
        assert_eq!(parse_quality("42"), Some(42));
        assert_eq!(parse_quality("0"), None);
        assert_eq!(parse_quality("101"), None);
    }
}
