//! # PMORadio configuration
//!
//! One YAML document shared by the whole daemon. It is built from the
//! embedded `pmoradio.yaml` defaults, overlaid with `config.yaml` from the
//! configuration directory, then with `PMORADIO_CONFIG__SECTION__KEY`
//! environment variables. Keys are case-insensitive and stored lower-cased.
//! Every change is written back to `config.yaml`.
//!
//! Subsystems read their own sections through extension traits on
//! [`Config`] (see `pmoplayer::PlayerConfigExt`).
//!
//! ```no_run
//! use pmoconfig::get_config;
//!
//! let config = get_config();
//! let level = config.get_log_min_level()?;
//! config.set_log_enable_console(false)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{anyhow, Context, Result};
use lazy_static::lazy_static;
use serde_yaml::{Mapping, Value};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{debug, info};

// Configuration par défaut intégrée
const DEFAULT_CONFIG: &str = include_str!("pmoradio.yaml");

lazy_static! {
    static ref CONFIG: Arc<Config> =
        Arc::new(Config::load().expect("Failed to load PMORadio configuration"));
}

const ENV_CONFIG_DIR: &str = "PMORADIO_CONFIG";
const ENV_PREFIX: &str = "PMORADIO_CONFIG__";
const CONFIG_DIR_NAME: &str = ".pmoradio";
const CONFIG_FILE_NAME: &str = "config.yaml";

const LOG_MIN_LEVEL: &[&str] = &["host", "logger", "min_level"];
const LOG_ENABLE_CONSOLE: &[&str] = &["host", "logger", "enable_console"];
const DEFAULT_LOG_MIN_LEVEL: &str = "INFO";
const DEFAULT_LOG_ENABLE_CONSOLE: bool = true;

/// The loaded configuration document and the file it is saved to.
#[derive(Debug)]
pub struct Config {
    dir: PathBuf,
    file: PathBuf,
    data: Mutex<Value>,
}

impl Config {
    /// Loads from the default location.
    ///
    /// The directory is, in order: `$PMORADIO_CONFIG`, `./.pmoradio` when it
    /// exists, `~/.pmoradio` when it exists, else `./.pmoradio` (created).
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_dir())
    }

    /// Loads from `dir`, creating it when needed.
    pub fn load_from(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        prepare_dir(&dir)
            .with_context(|| format!("Unusable configuration directory {}", dir.display()))?;
        let file = dir.join(CONFIG_FILE_NAME);
        info!(config_file = %file.display(), "Loading configuration");

        let mut data = lower_keys(serde_yaml::from_str(DEFAULT_CONFIG)?);
        match fs::read_to_string(&file) {
            Ok(text) if !text.trim().is_empty() => {
                let external: Value = serde_yaml::from_str(&text)
                    .with_context(|| format!("Invalid YAML in {}", file.display()))?;
                overlay(&mut data, lower_keys(external));
            }
            Ok(_) => debug!("Empty config file, using embedded defaults"),
            Err(_) => debug!("No config file yet, using embedded defaults"),
        }

        for (key, value) in env::vars() {
            if let Some(path) = key.strip_prefix(ENV_PREFIX) {
                let path: Vec<&str> = path.split("__").collect();
                debug!(variable = %key, "Applying environment override");
                // Une variable qui traverse une valeur scalaire est ignorée
                let _ = set_at(&mut data, &path, parse_env_value(&value));
            }
        }

        let config = Config {
            dir,
            file,
            data: Mutex::new(data),
        };
        config.save()?;
        Ok(config)
    }

    /// Directory holding `config.yaml`.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    fn data(&self) -> MutexGuard<'_, Value> {
        match self.data.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Writes the current document to `config.yaml`.
    pub fn save(&self) -> Result<()> {
        let yaml = serde_yaml::to_string(&*self.data())?;
        fs::write(&self.file, yaml)
            .with_context(|| format!("Cannot write {}", self.file.display()))
    }

    /// Value at `path` (e.g. `&["player", "volume"]`).
    pub fn get_value(&self, path: &[&str]) -> Result<Value> {
        let data = self.data();
        let mut current = &*data;
        for (i, key) in path.iter().enumerate() {
            current = current
                .as_mapping()
                .and_then(|map| map.get(key.to_lowercase()))
                .ok_or_else(|| anyhow!("Path {} does not exist", path[..=i].join(".")))?;
        }
        Ok(current.clone())
    }

    /// Sets the value at `path`, creating intermediate sections, and saves.
    pub fn set_value(&self, path: &[&str], value: Value) -> Result<()> {
        set_at(&mut self.data(), path, value)?;
        self.save()
    }

    pub fn get_log_min_level(&self) -> Result<String> {
        match self.get_value(LOG_MIN_LEVEL) {
            Ok(Value::String(level)) => Ok(level),
            _ => Ok(DEFAULT_LOG_MIN_LEVEL.to_string()),
        }
    }

    pub fn set_log_min_level(&self, level: impl Into<String>) -> Result<()> {
        self.set_value(LOG_MIN_LEVEL, Value::String(level.into()))
    }

    pub fn get_log_enable_console(&self) -> Result<bool> {
        match self.get_value(LOG_ENABLE_CONSOLE) {
            Ok(Value::Bool(enabled)) => Ok(enabled),
            _ => Ok(DEFAULT_LOG_ENABLE_CONSOLE),
        }
    }

    pub fn set_log_enable_console(&self, enabled: bool) -> Result<()> {
        self.set_value(LOG_ENABLE_CONSOLE, Value::Bool(enabled))
    }
}

/// Returns the process-wide configuration, loaded on first access.
pub fn get_config() -> Arc<Config> {
    CONFIG.clone()
}

fn default_config_dir() -> PathBuf {
    if let Ok(dir) = env::var(ENV_CONFIG_DIR) {
        return PathBuf::from(dir);
    }
    let local = PathBuf::from(CONFIG_DIR_NAME);
    if local.is_dir() {
        return local;
    }
    match dirs::home_dir().map(|home| home.join(CONFIG_DIR_NAME)) {
        Some(home) if home.is_dir() => home,
        _ => local,
    }
}

fn prepare_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    if !dir.is_dir() {
        return Err(anyhow!("not a directory"));
    }
    let marker = dir.join(".write_test");
    fs::write(&marker, b"")?;
    fs::remove_file(&marker)?;
    Ok(())
}

fn set_at(data: &mut Value, path: &[&str], value: Value) -> Result<()> {
    let Some((key, rest)) = path.split_first() else {
        *data = value;
        return Ok(());
    };
    let map = data
        .as_mapping_mut()
        .ok_or_else(|| anyhow!("Cannot set {}: parent is not a section", key))?;
    let key = Value::String(key.to_lowercase());
    if rest.is_empty() {
        map.insert(key, value);
        Ok(())
    } else {
        let child = map.entry(key).or_insert_with(|| Value::Mapping(Mapping::new()));
        set_at(child, rest, value)
    }
}

/// Environment values are parsed as YAML scalars (`12`, `true`, ...).
fn parse_env_value(value: &str) -> Value {
    serde_yaml::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()))
}

fn lower_keys(value: Value) -> Value {
    match value {
        Value::Mapping(map) => Value::Mapping(
            map.into_iter()
                .map(|(k, v)| {
                    let k = match k {
                        Value::String(s) => Value::String(s.to_lowercase()),
                        other => other,
                    };
                    (k, lower_keys(v))
                })
                .collect(),
        ),
        Value::Sequence(seq) => Value::Sequence(seq.into_iter().map(lower_keys).collect()),
        other => other,
    }
}

/// Overlays `external` on `base`: sections merge key by key, anything else
/// replaces the base value.
fn overlay(base: &mut Value, external: Value) {
    match (base, external) {
        (Value::Mapping(base), Value::Mapping(external)) => {
            for (key, value) in external {
                match base.get_mut(&key) {
                    Some(slot) => overlay(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
