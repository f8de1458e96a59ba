//! FFmpeg library setup.
//!
//! FFmpeg logs to stderr through its own system, independent of the Rust
//! [`log`] facade. [`set_ffmpeg_log_level`] maps a [`log::LevelFilter`] onto
//! FFmpeg's verbosity so that an application can tune both from one setting.
//!
//! # Example
//!
//! ```no_run
//! // Keep FFmpeg quiet unless something is broken.
//! framestep::set_ffmpeg_log_level(log::LevelFilter::Error);
//! ```

use std::sync::OnceLock;

use ffmpeg_next::util::log::Level;
use log::LevelFilter;

static INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// Initialise FFmpeg once per process.
pub(crate) fn ensure_initialized() -> Result<(), String> {
    INIT.get_or_init(|| ffmpeg_next::init().map_err(|error| error.to_string()))
        .clone()
}

fn to_ffmpeg_level(filter: LevelFilter) -> Level {
    match filter {
        LevelFilter::Off => Level::Quiet,
        LevelFilter::Error => Level::Error,
        LevelFilter::Warn => Level::Warning,
        LevelFilter::Info => Level::Info,
        LevelFilter::Debug => Level::Debug,
        LevelFilter::Trace => Level::Trace,
    }
}

/// Set FFmpeg's internal log verbosity.
///
/// This does not affect messages emitted through the `log` crate.
pub fn set_ffmpeg_log_level(filter: LevelFilter) {
    ffmpeg_next::util::log::set_level(to_ffmpeg_level(filter));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_map_onto_ffmpeg_levels() {
        assert!(matches!(to_ffmpeg_level(LevelFilter::Off), Level::Quiet));
        assert!(matches!(to_ffmpeg_level(LevelFilter::Warn), Level::Warning));
        assert!(matches!(to_ffmpeg_level(LevelFilter::Trace), Level::Trace));
    }
}
