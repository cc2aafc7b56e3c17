use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{PlayerError, Result};

/// Default RAOP port used when an AirPlay device does not announce one.
pub const DEFAULT_AIRPLAY_PORT: u16 = 5000;

/// Playback state owned by the orchestrator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackState::Stopped => write!(f, "stopped"),
            PlaybackState::Playing => write!(f, "playing"),
            PlaybackState::Paused => write!(f, "paused"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Local,
    Bluetooth,
    AirPlay,
}

/// Output device selected by the caller.
///
/// Local and Bluetooth devices share the local backend: the system sound
/// server decides where the audio physically goes. Only AirPlay devices
/// carry a network address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDevice {
    pub kind: DeviceKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl OutputDevice {
    pub fn local() -> Self {
        Self {
            kind: DeviceKind::Local,
            name: "local".to_string(),
            address: None,
            port: None,
        }
    }

    pub fn bluetooth(name: impl Into<String>) -> Self {
        Self {
            kind: DeviceKind::Bluetooth,
            name: name.into(),
            address: None,
            port: None,
        }
    }

    pub fn airplay(name: impl Into<String>, address: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            kind: DeviceKind::AirPlay,
            name: name.into(),
            address: Some(address.into()),
            port,
        }
    }

    /// Address and port of an AirPlay receiver.
    pub fn airplay_target(&self) -> Result<(String, u16)> {
        let address = self
            .address
            .clone()
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| PlayerError::MissingDeviceAddress(self.name.clone()))?;
        Ok((address, self.port.unwrap_or(DEFAULT_AIRPLAY_PORT)))
    }
}

impl Default for OutputDevice {
    fn default() -> Self {
        Self::local()
    }
}

impl fmt::Display for OutputDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, &self.address) {
            (DeviceKind::AirPlay, Some(addr)) => write!(
                f,
                "{} (airplay {}:{})",
                self.name,
                addr,
                self.port.unwrap_or(DEFAULT_AIRPLAY_PORT)
            ),
            (DeviceKind::Bluetooth, _) => write!(f, "{} (bluetooth)", self.name),
            _ => write!(f, "{}", self.name),
        }
    }
}

/// Now-playing tags reported by the local renderer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<String>,
}

impl StreamMetadata {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.artist.is_none()
            && self.station_name.is_none()
            && self.genre.is_none()
            && self.bitrate.is_none()
    }

    /// Fills title/artist from an ICY style "Artist - Title" string.
    pub fn set_combined_title(&mut self, combined: &str) {
        let combined = combined.trim();
        if combined.is_empty() {
            return;
        }
        match combined.split_once(" - ") {
            Some((artist, title)) => {
                self.artist = non_empty(artist);
                self.title = non_empty(title);
            }
            None => {
                self.title = Some(combined.to_string());
            }
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// Volume on the 0-100 scale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Volume(u8);

impl Volume {
    pub const MAX: u8 = 100;

    /// Strict constructor, used for values coming from configuration.
    pub fn new(value: i64) -> Result<Self> {
        if (0..=Self::MAX as i64).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(PlayerError::InvalidVolume(value))
        }
    }

    /// Clamping constructor, used for caller intents.
    pub fn clamped(value: i64) -> Self {
        Self(value.clamp(0, Self::MAX as i64) as u8)
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for Volume {
    fn default() -> Self {
        Self(75)
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot returned by `PlaybackOrchestrator::status`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlayerStatus {
    pub state: PlaybackState,
    pub volume: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub device: OutputDevice,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<StreamMetadata>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayerEvent {
    StateChanged { state: PlaybackState },
    VolumeChanged { volume: u8 },
    MetadataChanged { metadata: StreamMetadata },
    DeviceChanged { device: OutputDevice },
    PlaybackError { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_title_split() {
        let mut meta = StreamMetadata::default();
        meta.set_combined_title("Daft Punk - Around the World");
        assert_eq!(meta.artist.as_deref(), Some("Daft Punk"));
        assert_eq!(meta.title.as_deref(), Some("Around the World"));

        let mut meta = StreamMetadata::default();
        meta.set_combined_title("Morning Show");
        assert_eq!(meta.artist, None);
        assert_eq!(meta.title.as_deref(), Some("Morning Show"));
    }

    #[test]
    fn test_combined_title_splits_on_first_separator() {
        let mut meta = StreamMetadata::default();
        meta.set_combined_title("A - B - C");
        assert_eq!(meta.artist.as_deref(), Some("A"));
        assert_eq!(meta.title.as_deref(), Some("B - C"));
    }

    #[test]
    fn test_volume_constructors() {
        assert_eq!(Volume::new(0).unwrap().get(), 0);
        assert_eq!(Volume::new(100).unwrap().get(), 100);
        assert!(matches!(Volume::new(101), Err(PlayerError::InvalidVolume(101))));
        assert!(matches!(Volume::new(-1), Err(PlayerError::InvalidVolume(-1))));
        assert_eq!(Volume::clamped(150).get(), 100);
        assert_eq!(Volume::clamped(-20).get(), 0);
        assert_eq!(Volume::default().get(), 75);
    }

    #[test]
    fn test_airplay_target() {
        let dev = OutputDevice::airplay("Salon", "10.0.0.5", None);
        assert_eq!(dev.airplay_target().unwrap(), ("10.0.0.5".to_string(), 5000));

        let dev = OutputDevice::airplay("Salon", "10.0.0.5", Some(7000));
        assert_eq!(dev.airplay_target().unwrap().1, 7000);

        let mut dev = OutputDevice::airplay("Broken", "", None);
        assert!(matches!(
            dev.airplay_target(),
            Err(PlayerError::MissingDeviceAddress(_))
        ));
        dev.address = None;
        assert!(dev.airplay_target().is_err());
    }

    #[test]
    fn test_status_serialization_omits_absent_metadata() {
        let status = PlayerStatus {
            state: PlaybackState::Playing,
            volume: 40,
            url: None,
            device: OutputDevice::local(),
            metadata: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "playing");
        assert!(json.get("metadata").is_none());
        assert!(json.get("url").is_none());
    }
}
