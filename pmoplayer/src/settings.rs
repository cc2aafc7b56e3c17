//! Runtime settings of the playback engine.
//!
//! `PlayerSettings` is a plain value: it is normally assembled from
//! `pmoconfig` through [`crate::PlayerConfigExt::get_player_settings`], and
//! built directly (with shortened timings) in tests.

use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{PlayerError, Result};
use crate::model::Volume;

pub const DEFAULT_FADE_STEPS: u32 = 20;
pub const DEFAULT_FADE_IN: Duration = Duration::from_millis(500);
pub const DEFAULT_FADE_OUT_FALLBACK: Duration = Duration::from_millis(2000);
pub const DEFAULT_FADE_OUT_MAX: Duration = Duration::from_millis(5000);
pub const DEFAULT_DRAIN: Duration = Duration::from_millis(200);
pub const DEFAULT_GRACE: Duration = Duration::from_millis(3000);
pub const DEFAULT_STARTUP_CHECK: Duration = Duration::from_millis(200);
pub const DEFAULT_METADATA_INTERVAL: Duration = Duration::from_millis(3000);
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_CONTROL_READY: Duration = Duration::from_millis(5000);

#[derive(Clone, Debug)]
pub struct LocalSettings {
    pub mpv_path: PathBuf,
    pub audio_device: String,
    pub cache_secs: u32,
    pub user_agent: String,
    pub socket_dir: PathBuf,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            mpv_path: PathBuf::from("mpv"),
            audio_device: "pulse".to_string(),
            cache_secs: 10,
            user_agent: "PMORadio".to_string(),
            socket_dir: std::env::temp_dir(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AirPlaySettings {
    pub ffmpeg_path: PathBuf,
    /// Explicit relay executable. When `None`, the binary is looked up in
    /// `raop_bin_dir` according to the CPU architecture.
    pub raop_path: Option<PathBuf>,
    pub raop_bin_dir: PathBuf,
}

impl Default for AirPlaySettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            raop_path: None,
            raop_bin_dir: PathBuf::from("bin"),
        }
    }
}

impl AirPlaySettings {
    /// Resolves the relay executable for the running architecture.
    pub fn relay_binary(&self) -> Result<PathBuf> {
        if let Some(path) = &self.raop_path {
            return Ok(path.clone());
        }
        let name = relay_binary_name(std::env::consts::ARCH)?;
        Ok(self.raop_bin_dir.join(name))
    }
}

/// Name of the bundled `raop_play` build for a CPU architecture.
pub fn relay_binary_name(arch: &str) -> Result<&'static str> {
    match arch {
        "aarch64" | "arm64" => Ok("raop_play-aarch64"),
        "arm" | "armv7" | "armv7l" => Ok("raop_play-armv7"),
        "armv6" | "armv6l" => Ok("raop_play-armv6"),
        "x86_64" | "amd64" => Ok("raop_play"),
        other => Err(PlayerError::UnsupportedArchitecture(other.to_string())),
    }
}

#[derive(Clone, Debug)]
pub struct TimingSettings {
    pub fade_steps: u32,
    pub fade_in: Duration,
    pub fade_out_fallback: Duration,
    pub fade_out_max: Duration,
    pub drain: Duration,
    pub grace: Duration,
    pub startup_check: Duration,
    pub metadata_interval: Duration,
    pub control_timeout: Duration,
    /// How long a freshly launched renderer may take to open its control socket.
    pub control_ready: Duration,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            fade_steps: DEFAULT_FADE_STEPS,
            fade_in: DEFAULT_FADE_IN,
            fade_out_fallback: DEFAULT_FADE_OUT_FALLBACK,
            fade_out_max: DEFAULT_FADE_OUT_MAX,
            drain: DEFAULT_DRAIN,
            grace: DEFAULT_GRACE,
            startup_check: DEFAULT_STARTUP_CHECK,
            metadata_interval: DEFAULT_METADATA_INTERVAL,
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            control_ready: DEFAULT_CONTROL_READY,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PlayerSettings {
    pub initial_volume: Volume,
    pub local: LocalSettings,
    pub airplay: AirPlaySettings,
    pub timing: TimingSettings,
}
