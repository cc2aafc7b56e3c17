//! # pmoplayer - Playback orchestration for internet radio
//!
//! This crate streams an internet audio source to one of several output
//! backends and exposes a single control surface over them:
//!
//! - **Local**: an mpv renderer on the system sound server (local or
//!   Bluetooth sinks), driven over its JSON IPC socket
//! - **AirPlay**: ffmpeg piped into a `raop_play` relay
//!
//! Each backend is a [`ProcessPipeline`] of external processes. The
//! [`PlaybackOrchestrator`] serialises playback intents, fades volume around
//! transitions with a [`VolumeFader`] so that pipeline swaps stay silent,
//! and forwards now-playing tags reported by the [`MetadataPoller`].
//!
//! # Example
//!
//! ```no_run
//! use pmoplayer::{OutputDevice, PlaybackOrchestrator, PlayerSettings};
//!
//! # #[tokio::main]
//! # async fn main() -> pmoplayer::Result<()> {
//! let orchestrator = PlaybackOrchestrator::new(PlayerSettings::default());
//! let events = orchestrator.subscribe();
//!
//! orchestrator.play("http://icecast.radiofrance.fr/fip-hifi.aac").await?;
//! orchestrator.set_volume(60).await?;
//!
//! // Move the running stream to an AirPlay receiver
//! orchestrator
//!     .set_output_device(OutputDevice::airplay("Salon", "192.168.1.20", None))
//!     .await?;
//!
//! println!("{:?}", orchestrator.status().await);
//! while let Ok(event) = events.try_recv() {
//!     println!("{:?}", event);
//! }
//! orchestrator.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config_ext;
pub mod control_channel;
pub mod errors;
pub mod events;
pub mod fader;
pub mod metadata_poller;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod settings;

pub use backend::{
    AirPlayBackend, BackendCapabilities, LocalBackend, OutputBackend, PipelineStatus,
    TransportControl, VolumeControl,
};
pub use config_ext::PlayerConfigExt;
pub use control_channel::ControlChannel;
pub use errors::{PlayerError, Result};
pub use events::PlayerEventBus;
pub use fader::VolumeFader;
pub use metadata_poller::{MetadataCallback, MetadataPoller, PollerState};
pub use model::{
    DeviceKind, OutputDevice, PlaybackState, PlayerEvent, PlayerStatus, StreamMetadata, Volume,
};
pub use orchestrator::PlaybackOrchestrator;
pub use pipeline::{ProcessPipeline, StageSpec};
pub use settings::{AirPlaySettings, LocalSettings, PlayerSettings, TimingSettings};
