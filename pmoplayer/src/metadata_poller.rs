//! Background now-playing watcher for the local renderer.
//!
//! ## Architecture
//!
//! Each local pipeline gets its own poller task that:
//! - Queries the renderer's tag map over the control channel at a fixed interval
//! - Compares the result with the last reported value
//! - Invokes the update callback only when something changed
//! - Exits on cancellation, once the renderer reports it is idle, or once
//!   a renderer that already answered can no longer be reached
//!
//! The task never touches orchestrator state: everything it learns goes
//! through the callback.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::control_channel::{ControlChannel, PROP_METADATA};
use crate::errors::PlayerError;
use crate::model::StreamMetadata;

/// Consecutive refused connections after which the renderer is considered gone.
const UNREACHABLE_LIMIT: u32 = 2;

/// Callback receiving every metadata change.
pub type MetadataCallback = Arc<dyn Fn(StreamMetadata) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Polling,
}

/// Owner handle of a running poller task.
pub struct MetadataPoller {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl fmt::Debug for MetadataPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataPoller")
            .field("state", &self.state())
            .finish()
    }
}

impl MetadataPoller {
    /// Starts polling `channel` every `interval`.
    pub fn spawn(channel: ControlChannel, interval: Duration, on_change: MetadataCallback) -> Self {
        let token = CancellationToken::new();
        let task = tokio::spawn(poll_loop(channel, interval, on_change, token.clone()));
        Self {
            token,
            task: Some(task),
        }
    }

    pub fn state(&self) -> PollerState {
        match &self.task {
            Some(task) if !task.is_finished() => PollerState::Polling,
            _ => PollerState::Idle,
        }
    }

    /// Cancels the task and waits for it to finish.
    pub async fn stop(&mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                debug!(error = %err, "Metadata poller task ended abnormally");
            }
        }
    }
}

impl Drop for MetadataPoller {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn poll_loop(
    channel: ControlChannel,
    interval: Duration,
    on_change: MetadataCallback,
    token: CancellationToken,
) {
    debug!(socket = %channel.path().display(), ?interval, "Metadata poller started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last: Option<StreamMetadata> = None;
    let mut reached = false;
    let mut unreachable = 0u32;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let current = match channel.get_property(PROP_METADATA).await {
            Ok(Value::Object(tags)) => extract_stream_metadata(&tags),
            Ok(_) => StreamMetadata::default(),
            Err(err) if err.is_transient() => {
                trace!(error = %err, "Metadata poll failed, retrying next tick");
                if let Ok(true) = channel.is_idle().await {
                    debug!("Renderer idle, metadata poller exiting");
                    break;
                }
                continue;
            }
            Err(err) => {
                // Avant la première réponse, le socket peut ne pas exister encore
                if !reached {
                    trace!(error = %err, "Renderer not reachable yet");
                    continue;
                }
                unreachable += 1;
                if renderer_gone(&err) || unreachable >= UNREACHABLE_LIMIT {
                    debug!(error = %err, "Renderer gone, metadata poller exiting");
                    break;
                }
                continue;
            }
        };
        reached = true;
        unreachable = 0;

        if token.is_cancelled() {
            break;
        }
        if last.as_ref() != Some(&current) {
            debug!(?current, "Stream metadata changed");
            last = Some(current.clone());
            on_change(current);
        }
    }
    debug!("Metadata poller stopped");
}

/// A removed socket file means the pipeline was torn down.
fn renderer_gone(err: &PlayerError) -> bool {
    matches!(
        err,
        PlayerError::ControlUnavailable { source, .. } if source.kind() == std::io::ErrorKind::NotFound
    )
}

/// Builds [`StreamMetadata`] from a renderer tag map.
///
/// Keys are matched case-insensitively. ICY tags take precedence over
/// plain container tags; a combined `icy-title` of the form
/// "Artist - Title" is split.
pub fn extract_stream_metadata(tags: &Map<String, Value>) -> StreamMetadata {
    let lookup = |key: &str| -> Option<String> {
        tags.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .and_then(|(_, v)| match v {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
    };

    let mut meta = StreamMetadata::default();

    if let Some(combined) = lookup("icy-title") {
        meta.set_combined_title(&combined);
    } else {
        meta.title = lookup("title");
        meta.artist = lookup("artist");
    }
    meta.station_name = lookup("icy-name");
    meta.genre = lookup("icy-genre").or_else(|| lookup("genre"));
    meta.bitrate = lookup("icy-br");

    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    fn tags(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_extract_icy_tags() {
        let meta = extract_stream_metadata(&tags(json!({
            "icy-title": "Nina Simone - Feeling Good",
            "icy-name": "Jazz FM",
            "icy-genre": "Jazz",
            "icy-br": "128",
        })));
        assert_eq!(meta.artist.as_deref(), Some("Nina Simone"));
        assert_eq!(meta.title.as_deref(), Some("Feeling Good"));
        assert_eq!(meta.station_name.as_deref(), Some("Jazz FM"));
        assert_eq!(meta.genre.as_deref(), Some("Jazz"));
        assert_eq!(meta.bitrate.as_deref(), Some("128"));
    }

    #[test]
    fn test_extract_is_case_insensitive_and_falls_back() {
        let meta = extract_stream_metadata(&tags(json!({
            "ICY-NAME": "News Radio",
            "Title": "Evening bulletin",
            "GENRE": "News",
            "icy-br": 64,
        })));
        assert_eq!(meta.title.as_deref(), Some("Evening bulletin"));
        assert_eq!(meta.artist, None);
        assert_eq!(meta.station_name.as_deref(), Some("News Radio"));
        assert_eq!(meta.genre.as_deref(), Some("News"));
        assert_eq!(meta.bitrate.as_deref(), Some("64"));
    }

    #[test]
    fn test_extract_ignores_blank_values() {
        let meta = extract_stream_metadata(&tags(json!({"icy-title": "  ", "icy-name": ""})));
        assert!(meta.is_empty());
    }

    /// Fake renderer answering metadata requests from a shared script.
    fn fake_renderer(listener: UnixListener, script: Arc<Mutex<Value>>) {
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let script = script.clone();
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut lines = BufReader::new(read_half).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let request: Value = serde_json::from_str(&line).unwrap();
                        let data = if request["command"][1] == "metadata" {
                            script.lock().unwrap().clone()
                        } else {
                            json!(false)
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
    }

    #[tokio::test]
    async fn test_poller_reports_only_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mpv.sock");
        let script = Arc::new(Mutex::new(json!({"icy-title": "A - One"})));
        fake_renderer(UnixListener::bind(&path).unwrap(), script.clone());

        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let mut poller = MetadataPoller::spawn(
            ControlChannel::new(&path, Duration::from_millis(500)),
            Duration::from_millis(20),
            Arc::new(move |meta| sink.lock().unwrap().push(meta)),
        );
        assert_eq!(poller.state(), PollerState::Polling);

        tokio::time::sleep(Duration::from_millis(150)).await;
        *script.lock().unwrap() = json!({"icy-title": "B - Two"});
        tokio::time::sleep(Duration::from_millis(150)).await;

        poller.stop().await;
        assert_eq!(poller.state(), PollerState::Idle);

        let updates = updates.lock().unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].title.as_deref(), Some("One"));
        assert_eq!(updates[1].artist.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn test_poller_survives_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.sock");

        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let mut poller = MetadataPoller::spawn(
            ControlChannel::new(&path, Duration::from_millis(200)),
            Duration::from_millis(20),
            Arc::new(move |meta| sink.lock().unwrap().push(meta)),
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(poller.state(), PollerState::Polling);

        let script = Arc::new(Mutex::new(json!({"icy-name": "Late Station"})));
        fake_renderer(UnixListener::bind(&path).unwrap(), script);
        tokio::time::sleep(Duration::from_millis(150)).await;

        poller.stop().await;
        let updates = updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].station_name.as_deref(), Some("Late Station"));
    }

    #[tokio::test]
    async fn test_poller_exits_when_renderer_vanishes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mpv.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let poller = MetadataPoller::spawn(
            ControlChannel::new(&path, Duration::from_millis(200)),
            Duration::from_millis(20),
            Arc::new(move |meta| sink.lock().unwrap().push(meta)),
        );

        // Une seule réponse, puis le renderer disparaît avec son socket
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let request: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        let reply = json!({
            "request_id": request["request_id"],
            "error": "success",
            "data": {"icy-name": "Gone FM"},
        });
        write_half.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
        drop(write_half);
        drop(lines);
        drop(listener);
        std::fs::remove_file(&path).unwrap();

        let mut exited = false;
        for _ in 0..50 {
            if poller.state() == PollerState::Idle {
                exited = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(exited);
        assert_eq!(updates.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_refused_connections_end_polling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mpv.sock");
        let script = Arc::new(Mutex::new(json!({"icy-name": "Refused FM"})));
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        listener.set_nonblocking(true).unwrap();
        fake_renderer(UnixListener::from_std(listener).unwrap(), script);

        let poller = MetadataPoller::spawn(
            ControlChannel::new(&path, Duration::from_millis(200)),
            Duration::from_millis(20),
            Arc::new(|_| {}),
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(poller.state(), PollerState::Polling);

        // Renderer tué sans nettoyage : le fichier reste mais plus personne n'écoute
        let sock = std::os::unix::net::UnixListener::bind(dir.path().join("other.sock")).unwrap();
        drop(sock);
        std::fs::rename(dir.path().join("other.sock"), &path).unwrap();

        let mut exited = false;
        for _ in 0..50 {
            if poller.state() == PollerState::Idle {
                exited = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(exited);
    }
}
