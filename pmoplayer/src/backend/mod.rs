//! Output backends driven by the orchestrator.
//!
//! Every backend exposes the same capability traits ([`TransportControl`],
//! [`VolumeControl`], [`PipelineStatus`]). [`OutputBackend`] selects the
//! concrete implementation from the [`OutputDevice`] kind and delegates
//! every call with a plain `match`, so the orchestrator never branches on
//! device attributes itself.

mod airplay;
mod local;

pub use airplay::AirPlayBackend;
pub use local::LocalBackend;

use async_trait::async_trait;

use crate::control_channel::ControlChannel;
use crate::errors::Result;
use crate::metadata_poller::MetadataCallback;
use crate::model::{DeviceKind, OutputDevice};
use crate::settings::PlayerSettings;

/// What a backend can do at runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// Volume can be changed on a running pipeline, so fades are possible.
    pub live_volume: bool,
    /// Pause keeps the pipeline alive instead of tearing it down.
    pub native_pause: bool,
    /// The backend reports now-playing metadata.
    pub metadata: bool,
}

/// Transport capability of a backend (start / pause / resume / stop).
#[async_trait]
pub trait TransportControl {
    /// Launches the pipeline for `url` with `volume` as initial output level.
    /// A pipeline already running is replaced.
    async fn start(&mut self, url: &str, volume: u8) -> Result<()>;

    async fn pause(&mut self) -> Result<()>;

    async fn resume(&mut self) -> Result<()>;

    /// Tears the pipeline down. Stopping an idle backend is a no-op.
    async fn stop(&mut self) -> Result<()>;
}

/// Volume capability of a backend.
#[async_trait]
pub trait VolumeControl {
    async fn set_volume(&mut self, volume: u8) -> Result<()>;
}

/// Runtime observation of a backend's pipeline.
#[async_trait]
pub trait PipelineStatus {
    /// True while the pipeline's output stage runs.
    fn is_alive(&mut self) -> bool;

    /// Decoder buffer depth in seconds, when the backend can report it.
    async fn buffered_seconds(&self) -> Option<f64>;
}

/// Backend selected for the current output device.
#[derive(Debug)]
pub enum OutputBackend {
    /// Local renderer; also used for Bluetooth sinks routed by the sound server.
    Local(LocalBackend),
    /// Transcoder piped into a RAOP relay.
    AirPlay(AirPlayBackend),
}

impl OutputBackend {
    /// Builds the backend matching `device`.
    pub fn for_device(
        device: &OutputDevice,
        settings: &PlayerSettings,
        on_metadata: MetadataCallback,
    ) -> Self {
        match device.kind {
            DeviceKind::Local | DeviceKind::Bluetooth => OutputBackend::Local(LocalBackend::new(
                settings.local.clone(),
                settings.timing.clone(),
                on_metadata,
            )),
            DeviceKind::AirPlay => OutputBackend::AirPlay(AirPlayBackend::new(
                device.clone(),
                settings.airplay.clone(),
                settings.timing.clone(),
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OutputBackend::Local(_) => "local",
            OutputBackend::AirPlay(_) => "airplay",
        }
    }

    pub fn capabilities(&self) -> BackendCapabilities {
        match self {
            OutputBackend::Local(_) => BackendCapabilities {
                live_volume: true,
                native_pause: true,
                metadata: true,
            },
            OutputBackend::AirPlay(_) => BackendCapabilities {
                live_volume: false,
                native_pause: false,
                metadata: false,
            },
        }
    }

    /// Control channel of the running pipeline, used for fade steps.
    pub fn volume_channel(&self) -> Option<ControlChannel> {
        match self {
            OutputBackend::Local(local) => local.control_channel(),
            OutputBackend::AirPlay(_) => None,
        }
    }
}

#[async_trait]
impl TransportControl for OutputBackend {
    async fn start(&mut self, url: &str, volume: u8) -> Result<()> {
        match self {
            OutputBackend::Local(local) => local.start(url, volume).await,
            OutputBackend::AirPlay(airplay) => airplay.start(url, volume).await,
        }
    }

    async fn pause(&mut self) -> Result<()> {
        match self {
            OutputBackend::Local(local) => local.pause().await,
            OutputBackend::AirPlay(airplay) => airplay.pause().await,
        }
    }

    async fn resume(&mut self) -> Result<()> {
        match self {
            OutputBackend::Local(local) => local.resume().await,
            OutputBackend::AirPlay(airplay) => airplay.resume().await,
        }
    }

    async fn stop(&mut self) -> Result<()> {
        match self {
            OutputBackend::Local(local) => local.stop().await,
            OutputBackend::AirPlay(airplay) => airplay.stop().await,
        }
    }
}

#[async_trait]
impl VolumeControl for OutputBackend {
    async fn set_volume(&mut self, volume: u8) -> Result<()> {
        match self {
            OutputBackend::Local(local) => local.set_volume(volume).await,
            OutputBackend::AirPlay(airplay) => airplay.set_volume(volume).await,
        }
    }
}

#[async_trait]
impl PipelineStatus for OutputBackend {
    fn is_alive(&mut self) -> bool {
        match self {
            OutputBackend::Local(local) => local.is_alive(),
            OutputBackend::AirPlay(airplay) => airplay.is_alive(),
        }
    }

    async fn buffered_seconds(&self) -> Option<f64> {
        match self {
            OutputBackend::Local(local) => local.buffered_seconds().await,
            OutputBackend::AirPlay(airplay) => airplay.buffered_seconds().await,
        }
    }
}
