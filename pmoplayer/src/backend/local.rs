//! Local renderer backend: a single mpv process driven over its JSON IPC
//! socket. Bluetooth devices use the same path, the sound server routes
//! the sink.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, trace, warn};

use super::{PipelineStatus, TransportControl, VolumeControl};
use crate::control_channel::{ControlChannel, PROP_IDLE};
use crate::errors::{PlayerError, Result};
use crate::metadata_poller::{MetadataCallback, MetadataPoller};
use crate::pipeline::{ProcessPipeline, StageSpec};
use crate::settings::{LocalSettings, TimingSettings};

static SOCKET_SEQ: AtomicU64 = AtomicU64::new(0);
const READY_POLL: Duration = Duration::from_millis(50);

struct LocalSession {
    pipeline: ProcessPipeline,
    channel: ControlChannel,
    poller: MetadataPoller,
}

pub struct LocalBackend {
    settings: LocalSettings,
    timing: TimingSettings,
    on_metadata: MetadataCallback,
    session: Option<LocalSession>,
}

impl fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBackend")
            .field("renderer", &self.settings.mpv_path)
            .field("audio_device", &self.settings.audio_device)
            .field("pipeline", &self.session.as_ref().map(|s| &s.pipeline))
            .finish()
    }
}

impl LocalBackend {
    pub fn new(settings: LocalSettings, timing: TimingSettings, on_metadata: MetadataCallback) -> Self {
        Self {
            settings,
            timing,
            on_metadata,
            session: None,
        }
    }

    pub fn control_channel(&self) -> Option<ControlChannel> {
        self.session.as_ref().map(|s| s.channel.clone())
    }

    /// Process ids of the running renderer, if any.
    pub fn pids(&self) -> Vec<u32> {
        self.session
            .as_ref()
            .map(|s| s.pipeline.pids())
            .unwrap_or_default()
    }

    fn next_socket_path(&self) -> PathBuf {
        let seq = SOCKET_SEQ.fetch_add(1, Ordering::Relaxed);
        self.settings
            .socket_dir
            .join(format!("pmoradio-mpv-{}-{}.sock", std::process::id(), seq))
    }

    fn renderer_stage(&self, url: &str, volume: u8, socket: &Path) -> StageSpec {
        StageSpec::new("mpv", &self.settings.mpv_path)
            .args([
                "--no-config",
                "--no-terminal",
                "--no-audio-display",
                "--force-window=no",
                "--ytdl=no",
            ])
            .arg(format!("--audio-device={}", self.settings.audio_device))
            .arg("--cache=yes")
            .arg(format!("--cache-secs={}", self.settings.cache_secs))
            .arg(format!("--volume={}", volume))
            .arg(format!("--input-ipc-server={}", socket.display()))
            .arg(format!("--user-agent={}", self.settings.user_agent))
            .arg(url)
    }

    /// Waits until the renderer answers on its control socket.
    ///
    /// The renderer starts muted and only the control channel can raise its
    /// volume: a renderer that never opens the socket is a failed start.
    async fn wait_for_control(&self, pipeline: &mut ProcessPipeline, channel: &ControlChannel) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.timing.control_ready;
        loop {
            let err = match channel.get_property(PROP_IDLE).await {
                Ok(_) => return Ok(()),
                Err(err) => err,
            };
            if !pipeline.is_alive() {
                return Err(PlayerError::start_failure(
                    "mpv",
                    "exited before opening its control socket",
                ));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PlayerError::start_failure(
                    "mpv",
                    format!(
                        "control socket not ready after {:?}: {}",
                        self.timing.control_ready, err
                    ),
                ));
            }
            trace!(error = %err, "Control socket not ready yet");
            tokio::time::sleep(READY_POLL).await;
        }
    }

    /// Stops the poller before the pipeline so it never queries a removed socket.
    async fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.poller.stop().await;
            session.pipeline.stop().await;
            info!("Local renderer stopped");
        }
    }
}

#[async_trait]
impl TransportControl for LocalBackend {
    async fn start(&mut self, url: &str, volume: u8) -> Result<()> {
        self.close_session().await;

        let socket = self.next_socket_path();
        match std::fs::remove_file(&socket) {
            Ok(()) => debug!(socket = %socket.display(), "Removed stale control socket"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(PlayerError::start_failure("mpv", err)),
        }

        let stage = self.renderer_stage(url, volume, &socket);
        let mut pipeline = ProcessPipeline::start(vec![stage], self.timing.grace, self.timing.startup_check)
            .await?
            .with_control_socket(&socket);

        let channel = ControlChannel::new(&socket, self.timing.control_timeout);
        if let Err(err) = self.wait_for_control(&mut pipeline, &channel).await {
            warn!(socket = %socket.display(), error = %err, "Renderer control socket never came up");
            pipeline.stop().await;
            return Err(err);
        }

        let poller = MetadataPoller::spawn(
            channel.clone(),
            self.timing.metadata_interval,
            self.on_metadata.clone(),
        );

        info!(url = %url, volume, socket = %socket.display(), "Local renderer started");
        self.session = Some(LocalSession {
            pipeline,
            channel,
            poller,
        });
        Ok(())
    }

    async fn pause(&mut self) -> Result<()> {
        if let Some(session) = &self.session {
            if let Err(err) = session.channel.set_pause(true).await {
                warn!(error = %err, "Pause command not delivered to renderer");
            }
        }
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        let session = self.session.as_ref().ok_or(PlayerError::NoPausedSession)?;
        if let Err(err) = session.channel.set_pause(false).await {
            warn!(error = %err, "Resume command not delivered to renderer");
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.close_session().await;
        Ok(())
    }
}

#[async_trait]
impl VolumeControl for LocalBackend {
    async fn set_volume(&mut self, volume: u8) -> Result<()> {
        match &self.session {
            Some(session) => {
                if let Err(err) = session.channel.set_volume(volume).await {
                    warn!(volume, error = %err, "Volume command not delivered to renderer");
                }
            }
            None => debug!(volume, "No local pipeline, volume change ignored"),
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineStatus for LocalBackend {
    fn is_alive(&mut self) -> bool {
        self.session
            .as_mut()
            .map(|s| s.pipeline.is_alive())
            .unwrap_or(false)
    }

    async fn buffered_seconds(&self) -> Option<f64> {
        let channel = self.session.as_ref()?.channel.clone();
        match channel.buffered_seconds().await {
            Ok(secs) => Some(secs),
            Err(err) => {
                debug!(error = %err, "Buffer depth unavailable");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;
    use tokio::sync::Notify;

    const URL: &str = "http://stream.example/a";

    fn timing() -> TimingSettings {
        TimingSettings {
            grace: Duration::from_millis(500),
            startup_check: Duration::from_millis(50),
            metadata_interval: Duration::from_secs(60),
            control_timeout: Duration::from_millis(500),
            control_ready: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn backend(mpv: &Path, socket_dir: &Path, timing: TimingSettings) -> LocalBackend {
        LocalBackend::new(
            LocalSettings {
                mpv_path: mpv.to_path_buf(),
                socket_dir: socket_dir.to_path_buf(),
                ..Default::default()
            },
            timing,
            Arc::new(|_| {}),
        )
    }

    /// Faux mpv : écrit ses arguments (un par ligne) puis dort.
    fn fake_mpv(dir: &Path) -> PathBuf {
        let script = dir.join("fake-mpv");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nprintf '%s\\n' \"$@\" > {}\nexec sleep 30\n",
                dir.join("mpv.args").display()
            ),
        )
        .unwrap();
        make_executable(&script);
        script
    }

    #[derive(Default)]
    struct RendererLog {
        commands: Mutex<Vec<Value>>,
        /// Existence du socket au moment de chaque réponse `metadata`.
        socket_at_reply: Mutex<Vec<bool>>,
        metadata_requested: Notify,
    }

    /// Sert le socket de contrôle du faux mpv une fois ses arguments écrits.
    fn serve_renderer(dir: &Path, bind_delay: Duration, reply_delay: Duration) -> Arc<RendererLog> {
        let log = Arc::new(RendererLog::default());
        let args = dir.join("mpv.args");
        let shared = log.clone();
        tokio::spawn(async move {
            let socket = loop {
                let content = std::fs::read_to_string(&args).unwrap_or_default();
                if content.lines().last() == Some(URL) {
                    if let Some(path) = content
                        .lines()
                        .find_map(|l| l.strip_prefix("--input-ipc-server="))
                    {
                        break PathBuf::from(path);
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            };
            tokio::time::sleep(bind_delay).await;
            let listener = UnixListener::bind(&socket).unwrap();
            while let Ok((stream, _)) = listener.accept().await {
                let log = shared.clone();
                let socket = socket.clone();
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut lines = BufReader::new(read_half).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let request: Value = serde_json::from_str(&line).unwrap();
                        let command = request["command"].clone();
                        log.commands.lock().unwrap().push(command.clone());
                        let data = match command[1].as_str() {
                            Some("metadata") => {
                                log.metadata_requested.notify_one();
                                tokio::time::sleep(reply_delay).await;
                                log.socket_at_reply.lock().unwrap().push(socket.exists());
                                json!({"icy-name": "Test FM"})
                            }
                            Some("demuxer-cache-duration") => json!(1.5),
                            Some("idle-active") => json!(false),
                            _ => Value::Null,
                        };
                        let reply = json!({
                            "request_id": request["request_id"],
                            "error": "success",
                            "data": data,
                        });
                        let _ = write_half.write_all(format!("{}\n", reply).as_bytes()).await;
                    }
                });
            }
        });
        log
    }

    #[test]
    fn test_renderer_launch_flags() {
        let local = backend(Path::new("mpv"), Path::new("/run/pmo"), timing());
        let socket = PathBuf::from("/run/pmo/a.sock");
        let stage = local.renderer_stage(URL, 0, socket.as_path());

        let args: Vec<String> = stage
            .arguments()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(stage.program(), PathBuf::from("mpv").as_path());
        assert!(args.contains(&"--no-terminal".to_string()));
        assert!(args.contains(&"--audio-device=pulse".to_string()));
        assert!(args.contains(&"--cache-secs=10".to_string()));
        assert!(args.contains(&"--volume=0".to_string()));
        assert!(args.contains(&"--input-ipc-server=/run/pmo/a.sock".to_string()));
        assert_eq!(args.last().map(String::as_str), Some(URL));
    }

    #[tokio::test]
    async fn test_missing_renderer_is_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut local = backend(Path::new("/nonexistent/mpv"), dir.path(), timing());

        let err = local.start(URL, 0).await.unwrap_err();
        assert!(matches!(err, PlayerError::BackendStartFailure { .. }));
        assert!(!local.is_alive());
    }

    #[tokio::test]
    async fn test_start_waits_for_late_control_socket() {
        let dir = tempfile::tempdir().unwrap();
        let mpv = fake_mpv(dir.path());
        let renderer = serve_renderer(dir.path(), Duration::from_millis(400), Duration::ZERO);
        let mut local = backend(&mpv, dir.path(), timing());

        let started = std::time::Instant::now();
        local.start(URL, 0).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(400));
        assert!(local.is_alive());

        local.set_volume(75).await.unwrap();
        assert!(
            renderer
                .commands
                .lock()
                .unwrap()
                .contains(&json!(["set_property", "volume", 75]))
        );
        local.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_without_control_socket() {
        let dir = tempfile::tempdir().unwrap();
        let mpv = fake_mpv(dir.path());
        let mut local = backend(
            &mpv,
            dir.path(),
            TimingSettings {
                control_ready: Duration::from_millis(300),
                ..timing()
            },
        );

        let err = local.start(URL, 0).await.unwrap_err();
        assert!(matches!(err, PlayerError::BackendStartFailure { ref stage, .. } if stage == "mpv"));
        assert!(!local.is_alive());
        assert!(local.pids().is_empty());
        assert!(local.control_channel().is_none());
    }

    #[tokio::test]
    async fn test_commands_reach_renderer() {
        let dir = tempfile::tempdir().unwrap();
        let mpv = fake_mpv(dir.path());
        let renderer = serve_renderer(dir.path(), Duration::ZERO, Duration::ZERO);
        let mut local = backend(&mpv, dir.path(), timing());

        local.start(URL, 0).await.unwrap();
        local.set_volume(40).await.unwrap();
        local.pause().await.unwrap();
        local.resume().await.unwrap();
        assert_eq!(local.buffered_seconds().await, Some(1.5));

        let commands = renderer.commands.lock().unwrap().clone();
        assert!(commands.contains(&json!(["set_property", "volume", 40])));
        assert!(commands.contains(&json!(["set_property", "pause", true])));
        assert!(commands.contains(&json!(["set_property", "pause", false])));

        let socket = local.control_channel().unwrap().path().to_path_buf();
        local.stop().await.unwrap();
        assert!(!local.is_alive());
        assert!(local.pids().is_empty());
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_poller_stops_before_socket_removal() {
        let dir = tempfile::tempdir().unwrap();
        let mpv = fake_mpv(dir.path());
        let renderer = serve_renderer(dir.path(), Duration::ZERO, Duration::from_millis(150));
        let mut local = backend(
            &mpv,
            dir.path(),
            TimingSettings {
                metadata_interval: Duration::from_millis(20),
                ..timing()
            },
        );

        local.start(URL, 0).await.unwrap();
        // Arrêt pendant qu'une requête du poller est en vol
        renderer.metadata_requested.notified().await;
        local.stop().await.unwrap();

        let replies = renderer.socket_at_reply.lock().unwrap().clone();
        assert!(!replies.is_empty());
        assert!(replies.iter().all(|exists| *exists));
    }

    #[tokio::test]
    async fn test_resume_without_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut local = backend(Path::new("mpv"), dir.path(), timing());
        assert!(matches!(
            local.resume().await,
            Err(PlayerError::NoPausedSession)
        ));
    }

    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).unwrap();
    }
}
