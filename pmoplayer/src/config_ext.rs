//! Extension de `pmoconfig::Config` pour le moteur de lecture
//!
//! Le trait [`PlayerConfigExt`] ajoute à `pmoconfig::Config` les accès aux
//! clés `player.*` et l'assemblage d'un [`PlayerSettings`].
//!
//! # Auto-persist des valeurs par défaut
//!
//! Les getters écrivent la valeur par défaut dans la configuration lorsque la
//! clé n'existe pas encore, ce qui documente les réglages disponibles dans
//! `config.yaml`.
//!
//! # Exemple
//!
//! ```no_run
//! use pmoconfig::get_config;
//! use pmoplayer::{PlaybackOrchestrator, PlayerConfigExt};
//!
//! # fn main() -> anyhow::Result<()> {
//! let settings = get_config().get_player_settings()?;
//! let orchestrator = PlaybackOrchestrator::new(settings);
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use pmoconfig::Config;
use serde_yaml::{Number, Value};
use tracing::warn;

use crate::model::Volume;
use crate::settings::{
    AirPlaySettings, LocalSettings, PlayerSettings, TimingSettings, DEFAULT_CONTROL_READY,
    DEFAULT_CONTROL_TIMEOUT, DEFAULT_DRAIN, DEFAULT_FADE_IN, DEFAULT_FADE_OUT_FALLBACK, DEFAULT_FADE_OUT_MAX,
    DEFAULT_FADE_STEPS, DEFAULT_GRACE, DEFAULT_METADATA_INTERVAL, DEFAULT_STARTUP_CHECK,
};

pub trait PlayerConfigExt {
    /// Volume cible initial (0-100, défaut 75)
    fn get_player_volume(&self) -> Result<Volume>;
    fn set_player_volume(&self, volume: Volume) -> Result<()>;

    fn get_player_local_settings(&self) -> Result<LocalSettings>;
    fn get_player_airplay_settings(&self) -> Result<AirPlaySettings>;
    fn get_player_timing_settings(&self) -> Result<TimingSettings>;

    /// Assemble tous les réglages du moteur de lecture.
    fn get_player_settings(&self) -> Result<PlayerSettings> {
        Ok(PlayerSettings {
            initial_volume: self.get_player_volume()?,
            local: self.get_player_local_settings()?,
            airplay: self.get_player_airplay_settings()?,
            timing: self.get_player_timing_settings()?,
        })
    }
}

impl PlayerConfigExt for Config {
    fn get_player_volume(&self) -> Result<Volume> {
        let path = &["player", "volume"];
        match self.get_value(path) {
            Ok(Value::Number(n)) => match n.as_i64().map(Volume::new) {
                Some(Ok(volume)) => Ok(volume),
                _ => {
                    warn!(value = %n, "Invalid player.volume, using default");
                    Ok(Volume::default())
                }
            },
            _ => {
                let volume = Volume::default();
                self.set_player_volume(volume)?;
                Ok(volume)
            }
        }
    }

    fn set_player_volume(&self, volume: Volume) -> Result<()> {
        self.set_value(&["player", "volume"], Value::Number(Number::from(volume.get())))
    }

    fn get_player_local_settings(&self) -> Result<LocalSettings> {
        let defaults = LocalSettings::default();
        Ok(LocalSettings {
            mpv_path: get_path(self, &["player", "local", "mpv_path"], defaults.mpv_path)?,
            audio_device: get_string(self, &["player", "local", "audio_device"], defaults.audio_device)?,
            cache_secs: get_u64(self, &["player", "local", "cache_secs"], defaults.cache_secs as u64)?
                as u32,
            user_agent: get_string(self, &["player", "local", "user_agent"], defaults.user_agent)?,
            socket_dir: get_path(self, &["player", "local", "socket_dir"], defaults.socket_dir)?,
        })
    }

    fn get_player_airplay_settings(&self) -> Result<AirPlaySettings> {
        let defaults = AirPlaySettings::default();
        // Pas de valeur par défaut persistée : absent = résolution par architecture
        let raop_path = match self.get_value(&["player", "airplay", "raop_path"]) {
            Ok(Value::String(s)) if !s.trim().is_empty() => Some(PathBuf::from(s)),
            _ => None,
        };
        Ok(AirPlaySettings {
            ffmpeg_path: get_path(self, &["player", "airplay", "ffmpeg_path"], defaults.ffmpeg_path)?,
            raop_path,
            raop_bin_dir: get_path(self, &["player", "airplay", "raop_bin_dir"], defaults.raop_bin_dir)?,
        })
    }

    fn get_player_timing_settings(&self) -> Result<TimingSettings> {
        let ms = |key: &str, default: Duration| -> Result<Duration> {
            get_u64(self, &["player", "timing", key], default.as_millis() as u64)
                .map(Duration::from_millis)
        };
        Ok(TimingSettings {
            fade_steps: get_u64(self, &["player", "timing", "fade_steps"], DEFAULT_FADE_STEPS as u64)?
                .max(1) as u32,
            fade_in: ms("fade_in_ms", DEFAULT_FADE_IN)?,
            fade_out_fallback: ms("fade_out_fallback_ms", DEFAULT_FADE_OUT_FALLBACK)?,
            fade_out_max: ms("fade_out_max_ms", DEFAULT_FADE_OUT_MAX)?,
            drain: ms("drain_ms", DEFAULT_DRAIN)?,
            grace: ms("grace_ms", DEFAULT_GRACE)?,
            startup_check: ms("startup_check_ms", DEFAULT_STARTUP_CHECK)?,
            metadata_interval: ms("metadata_interval_ms", DEFAULT_METADATA_INTERVAL)?,
            control_timeout: ms("control_timeout_ms", DEFAULT_CONTROL_TIMEOUT)?,
            control_ready: ms("control_ready_ms", DEFAULT_CONTROL_READY)?,
        })
    }
}

fn get_u64(config: &Config, path: &[&str], default: u64) -> Result<u64> {
    match config.get_value(path) {
        Ok(value) => {
            let parsed = match &value {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.trim().parse::<u64>().ok(),
                _ => None,
            };
            Ok(parsed.unwrap_or_else(|| {
                warn!(key = %path.join("."), ?value, default, "Invalid value, using default");
                default
            }))
        }
        Err(_) => {
            config.set_value(path, Value::Number(Number::from(default)))?;
            Ok(default)
        }
    }
}

fn get_string(config: &Config, path: &[&str], default: String) -> Result<String> {
    match config.get_value(path) {
        Ok(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        _ => {
            config.set_value(path, Value::String(default.clone()))?;
            Ok(default)
        }
    }
}

fn get_path(config: &Config, path: &[&str], default: PathBuf) -> Result<PathBuf> {
    get_string(config, path, default.to_string_lossy().into_owned()).map(PathBuf::from)
}
