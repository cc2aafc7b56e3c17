//! AirPlay backend: ffmpeg normalises the stream to raw PCM and pipes it
//! into a `raop_play` relay that streams ALAC to the receiver.
//!
//! The relay takes its volume at launch only. Changing the volume while
//! streaming therefore restarts the whole pipeline, with an audible gap.
//! Pause is a full stop; the last URL and volume are kept so that resume
//! can relaunch the same stream.

use std::fmt;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{PipelineStatus, TransportControl, VolumeControl};
use crate::errors::{PlayerError, Result};
use crate::model::OutputDevice;
use crate::pipeline::{ProcessPipeline, StageSpec};
use crate::settings::{AirPlaySettings, TimingSettings};

#[derive(Clone, Debug, PartialEq, Eq)]
struct StreamParams {
    url: String,
    volume: u8,
}

pub struct AirPlayBackend {
    device: OutputDevice,
    settings: AirPlaySettings,
    timing: TimingSettings,
    pipeline: Option<ProcessPipeline>,
    last: Option<StreamParams>,
}

impl fmt::Debug for AirPlayBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AirPlayBackend")
            .field("device", &self.device)
            .field("pipeline", &self.pipeline)
            .field("last", &self.last)
            .finish()
    }
}

impl AirPlayBackend {
    pub fn new(device: OutputDevice, settings: AirPlaySettings, timing: TimingSettings) -> Self {
        Self {
            device,
            settings,
            timing,
            pipeline: None,
            last: None,
        }
    }

    pub fn device(&self) -> &OutputDevice {
        &self.device
    }

    /// Process ids of the running transcoder and relay.
    pub fn pids(&self) -> Vec<u32> {
        self.pipeline.as_ref().map(|p| p.pids()).unwrap_or_default()
    }

    fn stages(&self, url: &str, volume: u8) -> Result<Vec<StageSpec>> {
        let (address, port) = self.device.airplay_target()?;
        let relay = self.settings.relay_binary()?;

        let transcoder = StageSpec::new("ffmpeg", &self.settings.ffmpeg_path)
            .args(["-nostdin", "-loglevel", "error", "-re", "-i"])
            .arg(url)
            .args(["-ar", "44100", "-ac", "2", "-f", "s16le", "-"]);

        let relay = StageSpec::new("raop_play", relay)
            .arg("-v")
            .arg(volume.to_string())
            .args(["-d", "0", "-a", "-p"])
            .arg(port.to_string())
            .arg(address)
            .arg("-");

        Ok(vec![transcoder, relay])
    }

    async fn launch(&mut self, params: StreamParams) -> Result<()> {
        self.shutdown_pipeline().await;

        let stages = self.stages(&params.url, params.volume)?;
        let pipeline = ProcessPipeline::start(stages, self.timing.grace, self.timing.startup_check).await?;

        info!(
            device = %self.device,
            url = %params.url,
            volume = params.volume,
            pids = ?pipeline.pids(),
            "AirPlay stream started"
        );
        self.pipeline = Some(pipeline);
        self.last = Some(params);
        Ok(())
    }

    async fn shutdown_pipeline(&mut self) {
        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.stop().await;
            debug!(device = %self.device, "AirPlay pipeline torn down");
        }
    }
}

#[async_trait]
impl TransportControl for AirPlayBackend {
    async fn start(&mut self, url: &str, volume: u8) -> Result<()> {
        self.launch(StreamParams {
            url: url.to_string(),
            volume,
        })
        .await
    }

    async fn pause(&mut self) -> Result<()> {
        self.shutdown_pipeline().await;
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        let params = self.last.clone().ok_or(PlayerError::NoPausedSession)?;
        self.launch(params).await
    }

    async fn stop(&mut self) -> Result<()> {
        self.shutdown_pipeline().await;
        self.last = None;
        Ok(())
    }
}

#[async_trait]
impl VolumeControl for AirPlayBackend {
    async fn set_volume(&mut self, volume: u8) -> Result<()> {
        let Some(mut params) = self.last.clone() else {
            debug!(volume, "No AirPlay session, volume change ignored");
            return Ok(());
        };
        if params.volume == volume {
            return Ok(());
        }
        params.volume = volume;

        if self.pipeline.is_some() {
            info!(volume, "Restarting AirPlay stream with new volume");
            self.launch(params).await
        } else {
            self.last = Some(params);
            Ok(())
        }
    }
}

#[async_trait]
impl PipelineStatus for AirPlayBackend {
    fn is_alive(&mut self) -> bool {
        self.pipeline
            .as_mut()
            .map(|p| p.is_alive())
            .unwrap_or(false)
    }

    async fn buffered_seconds(&self) -> Option<f64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn backend(device: OutputDevice) -> AirPlayBackend {
        AirPlayBackend::new(
            device,
            AirPlaySettings {
                raop_path: Some(PathBuf::from("/opt/raop/raop_play")),
                ..Default::default()
            },
            TimingSettings::default(),
        )
    }

    fn args(stage: &StageSpec) -> Vec<String> {
        stage
            .arguments()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_pipeline_stages() {
        let airplay = backend(OutputDevice::airplay("Salon", "10.0.0.5", None));
        let stages = airplay.stages("http://stream.example/a", 75).unwrap();

        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].name(), "ffmpeg");
        assert_eq!(
            args(&stages[0]),
            [
                "-nostdin", "-loglevel", "error", "-re", "-i", "http://stream.example/a",
                "-ar", "44100", "-ac", "2", "-f", "s16le", "-"
            ]
        );
        assert_eq!(stages[1].program(), PathBuf::from("/opt/raop/raop_play").as_path());
        assert_eq!(
            args(&stages[1]),
            ["-v", "75", "-d", "0", "-a", "-p", "5000", "10.0.0.5", "-"]
        );
    }

    #[tokio::test]
    async fn test_device_without_address_fails_at_start() {
        let mut airplay = backend(OutputDevice {
            address: None,
            ..OutputDevice::airplay("Ghost", "", None)
        });
        let err = airplay.start("http://stream.example/a", 50).await.unwrap_err();
        assert!(matches!(err, PlayerError::MissingDeviceAddress(name) if name == "Ghost"));
    }

    #[tokio::test]
    async fn test_resume_without_session() {
        let mut airplay = backend(OutputDevice::airplay("Salon", "10.0.0.5", None));
        assert!(matches!(
            airplay.resume().await,
            Err(PlayerError::NoPausedSession)
        ));
    }

    #[tokio::test]
    async fn test_volume_without_session_is_ignored() {
        let mut airplay = backend(OutputDevice::airplay("Salon", "10.0.0.5", None));
        airplay.set_volume(30).await.unwrap();
        assert!(airplay.last.is_none());
        assert!(!airplay.is_alive());
    }
}
