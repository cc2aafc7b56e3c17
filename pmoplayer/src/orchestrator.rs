//! Backend-agnostic playback control surface.
//!
//! ## Intent queue
//!
//! Every intent (`play`, `pause`, `resume`, `stop`, `set_volume`,
//! `set_output_device`) locks the engine for its whole duration, fades and
//! drain waits included. Intents therefore run one at a time and never
//! interleave two fades or two pipeline swaps.
//!
//! ## Status
//!
//! The engine publishes a [`PlayerStatus`] snapshot after every transition.
//! [`PlaybackOrchestrator::status`] only try-locks the engine: when an intent
//! is in flight it returns the last snapshot immediately, otherwise it first
//! checks that the pipeline is still alive.
//!
//! ## Metadata
//!
//! The local backend's poller reports through a callback that writes the
//! snapshot's metadata and broadcasts [`PlayerEvent::MetadataChanged`]. It
//! never touches the engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crossbeam_channel::Receiver;
use tracing::{debug, error, info, warn};

use crate::backend::{OutputBackend, PipelineStatus, TransportControl, VolumeControl};
use crate::errors::{PlayerError, Result};
use crate::events::PlayerEventBus;
use crate::fader::VolumeFader;
use crate::metadata_poller::MetadataCallback;
use crate::model::{OutputDevice, PlaybackState, PlayerEvent, PlayerStatus, StreamMetadata, Volume};
use crate::settings::PlayerSettings;

type SharedStatus = Arc<RwLock<PlayerStatus>>;

pub struct PlaybackOrchestrator {
    engine: tokio::sync::Mutex<Engine>,
    snapshot: SharedStatus,
    events: PlayerEventBus,
}

impl PlaybackOrchestrator {
    /// Creates an orchestrator bound to the local output.
    pub fn new(settings: PlayerSettings) -> Self {
        Self::with_device(settings, OutputDevice::local())
    }

    pub fn with_device(settings: PlayerSettings, device: OutputDevice) -> Self {
        let events = PlayerEventBus::new();
        let snapshot: SharedStatus = Arc::new(RwLock::new(PlayerStatus {
            state: PlaybackState::Stopped,
            volume: settings.initial_volume.get(),
            url: None,
            device: device.clone(),
            metadata: None,
        }));

        let on_metadata = metadata_callback(snapshot.clone(), events.clone());
        let backend = OutputBackend::for_device(&device, &settings, on_metadata.clone());
        info!(device = %device, backend = backend.name(), "Playback orchestrator ready");

        let engine = Engine {
            backend,
            device,
            url: None,
            volume: settings.initial_volume,
            state: PlaybackState::Stopped,
            resume_restarts: false,
            fader: VolumeFader::new(&settings.timing),
            settings,
            on_metadata,
            snapshot: snapshot.clone(),
            events: events.clone(),
        };

        Self {
            engine: tokio::sync::Mutex::new(engine),
            snapshot,
            events,
        }
    }

    pub fn subscribe(&self) -> Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &PlayerEventBus {
        &self.events
    }

    /// Starts `url` on the current device. Playing again while already
    /// playing restarts the stream, which is how stations are switched.
    pub async fn play(&self, url: &str) -> Result<()> {
        self.engine.lock().await.play(url).await
    }

    /// Pausing anything but a playing session is a no-op.
    pub async fn pause(&self) -> Result<()> {
        self.engine.lock().await.pause().await
    }

    /// Resuming a playing session is a no-op; resuming without a paused
    /// session fails with [`PlayerError::NoPausedSession`].
    pub async fn resume(&self) -> Result<()> {
        self.engine.lock().await.resume().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.engine.lock().await.stop().await
    }

    /// Sets the target volume, clamped to 0-100.
    ///
    /// On AirPlay a change while streaming restarts the relay.
    pub async fn set_volume(&self, volume: i64) -> Result<()> {
        self.engine.lock().await.set_volume(volume).await
    }

    pub async fn set_output_device(&self, device: OutputDevice) -> Result<()> {
        self.engine.lock().await.set_output_device(device).await
    }

    /// Current status, never waiting on an in-flight intent.
    pub async fn status(&self) -> PlayerStatus {
        if let Ok(mut engine) = self.engine.try_lock() {
            engine.check_liveness().await;
        }
        read_status(&self.snapshot)
    }

    /// Stops playback before the process exits.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down playback");
        self.engine.lock().await.stop().await
    }
}

fn read_status(snapshot: &SharedStatus) -> PlayerStatus {
    match snapshot.read() {
        Ok(status) => status.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn update_status(snapshot: &SharedStatus, update: impl FnOnce(&mut PlayerStatus)) {
    match snapshot.write() {
        Ok(mut status) => update(&mut status),
        Err(poisoned) => update(&mut poisoned.into_inner()),
    }
}

fn metadata_callback(snapshot: SharedStatus, events: PlayerEventBus) -> MetadataCallback {
    Arc::new(move |metadata: StreamMetadata| {
        let stored = (!metadata.is_empty()).then(|| metadata.clone());
        update_status(&snapshot, |status| status.metadata = stored);
        events.broadcast(PlayerEvent::MetadataChanged { metadata });
    })
}

struct Engine {
    backend: OutputBackend,
    device: OutputDevice,
    url: Option<String>,
    volume: Volume,
    state: PlaybackState,
    /// Set when the device changed while paused: resume starts the stream
    /// on the new backend instead of resuming the old one.
    resume_restarts: bool,
    fader: VolumeFader,
    settings: PlayerSettings,
    on_metadata: MetadataCallback,
    snapshot: SharedStatus,
    events: PlayerEventBus,
}

impl Engine {
    fn live_volume(&self) -> bool {
        self.backend.capabilities().live_volume
    }

    async fn play(&mut self, url: &str) -> Result<()> {
        info!(url = %url, device = %self.device, "Play requested");
        if let Err(err) = self.teardown().await {
            warn!(error = %err, "Previous stream did not stop cleanly");
        }
        self.url = Some(url.to_string());
        self.resume_restarts = false;
        self.publish();
        self.start_stream().await
    }

    async fn pause(&mut self) -> Result<()> {
        if self.state != PlaybackState::Playing {
            debug!(state = %self.state, "Pause ignored");
            return Ok(());
        }
        self.fade_out().await;
        if let Err(err) = self.backend.pause().await {
            return Err(self.fail(err).await);
        }
        self.set_state(PlaybackState::Paused);
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        match self.state {
            PlaybackState::Playing => {
                debug!("Resume ignored, already playing");
                Ok(())
            }
            PlaybackState::Stopped => Err(PlayerError::NoPausedSession),
            PlaybackState::Paused if self.resume_restarts => {
                self.resume_restarts = false;
                self.start_stream().await
            }
            PlaybackState::Paused => {
                if let Err(err) = self.backend.resume().await {
                    return Err(self.fail(err).await);
                }
                self.set_state(PlaybackState::Playing);
                self.fade_in().await;
                Ok(())
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        let result = self.teardown().await;
        self.url = None;
        self.resume_restarts = false;
        self.set_state(PlaybackState::Stopped);
        self.publish();
        result
    }

    async fn set_volume(&mut self, requested: i64) -> Result<()> {
        let volume = Volume::clamped(requested);
        if volume.get() as i64 != requested {
            debug!(requested, clamped = volume.get(), "Volume clamped");
        }
        self.volume = volume;
        self.publish();
        self.events.broadcast(PlayerEvent::VolumeChanged {
            volume: volume.get(),
        });

        // A paused local renderer sits at volume 0 until the resume fade.
        if self.state == PlaybackState::Playing || !self.live_volume() {
            if let Err(err) = self.backend.set_volume(volume.get()).await {
                return Err(self.fail(err).await);
            }
        }
        Ok(())
    }

    async fn set_output_device(&mut self, device: OutputDevice) -> Result<()> {
        if device == self.device {
            debug!(device = %device, "Output device unchanged");
            return Ok(());
        }
        let previous = self.state;
        info!(from = %self.device, to = %device, state = %previous, "Switching output device");

        if let Err(err) = self.teardown().await {
            warn!(error = %err, "Previous backend did not stop cleanly");
        }
        self.backend = OutputBackend::for_device(&device, &self.settings, self.on_metadata.clone());
        self.device = device.clone();
        self.publish();
        self.events.broadcast(PlayerEvent::DeviceChanged { device });

        match previous {
            PlaybackState::Playing => self.start_stream().await,
            PlaybackState::Paused => {
                self.resume_restarts = true;
                Ok(())
            }
            PlaybackState::Stopped => Ok(()),
        }
    }

    /// Stops the pipeline, fading out first when playing. Keeps the URL.
    async fn teardown(&mut self) -> Result<()> {
        if self.state == PlaybackState::Playing {
            self.fade_out().await;
        }
        let result = self.backend.stop().await;
        self.clear_metadata();
        result
    }

    /// Launches the stored URL on the current backend and fades in.
    async fn start_stream(&mut self) -> Result<()> {
        let Some(url) = self.url.clone() else {
            return Err(PlayerError::NoPausedSession);
        };
        let target = self.volume.get();
        let initial = if self.live_volume() { 0 } else { target };

        if let Err(err) = self.backend.start(&url, initial).await {
            return Err(self.fail(err).await);
        }
        self.set_state(PlaybackState::Playing);
        self.fade_in().await;
        Ok(())
    }

    async fn fade_in(&mut self) {
        let target = self.volume.get();
        if self.fade(0, target, self.fader.fade_in_duration()).await {
            return;
        }
        // Le renderer reste muet tant que le volume cible n'est pas reçu
        warn!(volume = target, "Fade-in did not reach the target volume, retrying");
        if let Err(err) = self.backend.set_volume(target).await {
            warn!(volume = target, error = %err, "Target volume not restored");
        }
    }

    async fn fade_out(&self) {
        if !self.live_volume() {
            return;
        }
        let buffered = self.backend.buffered_seconds().await;
        let duration = self.fader.fade_out_duration(buffered);
        debug!(?buffered, ?duration, "Fading out");
        self.fade(self.volume.get(), 0, duration).await;
        self.fader.drain().await;
    }

    /// Runs a fade through the control channel. Returns whether the final
    /// step, carrying exactly `to`, was delivered.
    async fn fade(&self, from: u8, to: u8, duration: std::time::Duration) -> bool {
        let Some(channel) = self.backend.volume_channel() else {
            return true;
        };
        let delivered = Arc::new(AtomicBool::new(true));
        let last_step = delivered.clone();
        self.fader
            .fade_to(from, to, duration, move |volume| {
                let channel = channel.clone();
                let last_step = last_step.clone();
                async move {
                    let ok = match channel.set_volume(volume).await {
                        Ok(()) => true,
                        Err(err) => {
                            debug!(volume, error = %err, "Fade step not delivered");
                            false
                        }
                    };
                    last_step.store(ok, Ordering::Relaxed);
                }
            })
            .await;
        delivered.load(Ordering::Relaxed)
    }

    /// Brings the engine back to `Stopped` after a failed transition.
    async fn fail(&mut self, err: PlayerError) -> PlayerError {
        error!(error = %err, device = %self.device, "Playback intent failed");
        if let Err(stop_err) = self.backend.stop().await {
            warn!(error = %stop_err, "Cleanup after failure did not complete");
        }
        self.url = None;
        self.resume_restarts = false;
        self.clear_metadata();
        self.set_state(PlaybackState::Stopped);
        self.publish();
        self.events.broadcast(PlayerEvent::PlaybackError {
            message: err.to_string(),
        });
        err
    }

    /// Forces `Stopped` when the pipeline that should be running is gone.
    async fn check_liveness(&mut self) {
        let expects_pipeline = match self.state {
            PlaybackState::Playing => true,
            PlaybackState::Paused => {
                self.backend.capabilities().native_pause && !self.resume_restarts
            }
            PlaybackState::Stopped => false,
        };
        if !expects_pipeline || self.backend.is_alive() {
            return;
        }

        warn!(device = %self.device, state = %self.state, "Pipeline exited unexpectedly");
        if let Err(err) = self.backend.stop().await {
            warn!(error = %err, "Cleanup of dead pipeline did not complete");
        }
        self.url = None;
        self.clear_metadata();
        self.set_state(PlaybackState::Stopped);
        self.publish();
        self.events.broadcast(PlayerEvent::PlaybackError {
            message: "playback pipeline exited".to_string(),
        });
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.state == state {
            return;
        }
        info!(from = %self.state, to = %state, "Playback state changed");
        self.state = state;
        self.publish();
        self.events.broadcast(PlayerEvent::StateChanged { state });
    }

    /// Drops the now-playing info of a backend that reports it, and tells
    /// subscribers with an empty [`PlayerEvent::MetadataChanged`].
    fn clear_metadata(&self) {
        if !self.backend.capabilities().metadata {
            return;
        }
        let mut had_metadata = false;
        update_status(&self.snapshot, |status| {
            had_metadata = status.metadata.take().is_some();
        });
        if had_metadata {
            self.events.broadcast(PlayerEvent::MetadataChanged {
                metadata: StreamMetadata::default(),
            });
        }
    }

    fn publish(&self) {
        update_status(&self.snapshot, |status| {
            status.state = self.state;
            status.volume = self.volume.get();
            status.url = self.url.clone();
            status.device = self.device.clone();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_status() {
        let orchestrator = PlaybackOrchestrator::new(PlayerSettings::default());
        let status = orchestrator.status().await;

        assert_eq!(status.state, PlaybackState::Stopped);
        assert_eq!(status.volume, 75);
        assert_eq!(status.device, OutputDevice::local());
        assert_eq!(status.url, None);
        assert_eq!(status.metadata, None);
    }

    #[tokio::test]
    async fn test_intents_without_session() {
        let orchestrator = PlaybackOrchestrator::new(PlayerSettings::default());

        orchestrator.pause().await.unwrap();
        assert!(matches!(
            orchestrator.resume().await,
            Err(PlayerError::NoPausedSession)
        ));
        tokio_test::assert_ok!(orchestrator.stop().await);
        assert_eq!(orchestrator.status().await.state, PlaybackState::Stopped);
    }

    #[tokio::test]
    async fn test_volume_is_clamped_and_published() {
        let orchestrator = PlaybackOrchestrator::new(PlayerSettings::default());
        let events = orchestrator.subscribe();

        orchestrator.set_volume(140).await.unwrap();
        assert_eq!(orchestrator.status().await.volume, 100);
        orchestrator.set_volume(-3).await.unwrap();
        assert_eq!(orchestrator.status().await.volume, 0);

        assert_eq!(events.try_recv().unwrap(), PlayerEvent::VolumeChanged { volume: 100 });
        assert_eq!(events.try_recv().unwrap(), PlayerEvent::VolumeChanged { volume: 0 });
    }

    #[tokio::test]
    async fn test_device_switch_while_stopped() {
        let orchestrator = PlaybackOrchestrator::new(PlayerSettings::default());
        let events = orchestrator.subscribe();
        let salon = OutputDevice::airplay("Salon", "10.0.0.5", Some(5000));

        orchestrator.set_output_device(salon.clone()).await.unwrap();

        let status = orchestrator.status().await;
        assert_eq!(status.device, salon);
        assert_eq!(status.state, PlaybackState::Stopped);
        assert_eq!(
            events.try_recv().unwrap(),
            PlayerEvent::DeviceChanged { device: salon }
        );
    }

    #[test]
    fn test_metadata_callback_updates_snapshot() {
        let snapshot: SharedStatus = Arc::new(RwLock::new(PlayerStatus {
            state: PlaybackState::Playing,
            volume: 75,
            url: None,
            device: OutputDevice::local(),
            metadata: None,
        }));
        let events = PlayerEventBus::new();
        let rx = events.subscribe();
        let callback = metadata_callback(snapshot.clone(), events);

        let mut meta = StreamMetadata::default();
        meta.set_combined_title("Air - La femme d'argent");
        callback(meta.clone());
        assert_eq!(read_status(&snapshot).metadata, Some(meta.clone()));
        assert_eq!(rx.try_recv().unwrap(), PlayerEvent::MetadataChanged { metadata: meta });

        callback(StreamMetadata::default());
        assert_eq!(read_status(&snapshot).metadata, None);
    }
}
