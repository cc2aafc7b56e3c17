//! Client for the renderer's JSON IPC control socket.
//!
//! Each request opens a connection, writes one JSON line
//! `{"command": [...], "request_id": n}` and reads lines until the reply with
//! the same `request_id`. Unsolicited `{"event": ...}` lines are skipped.
//! Requests on one channel are serialized.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::trace;

use crate::errors::{PlayerError, Result};

/// Property holding the decoder's buffered audio, in seconds.
pub const PROP_CACHE_DURATION: &str = "demuxer-cache-duration";
/// Property holding the stream tag map.
pub const PROP_METADATA: &str = "metadata";
/// True when the renderer has nothing loaded.
pub const PROP_IDLE: &str = "idle-active";

#[derive(Clone, Debug)]
pub struct ControlChannel {
    path: PathBuf,
    timeout: Duration,
    request_id: Arc<AtomicU64>,
    in_flight: Arc<Mutex<()>>,
}

impl ControlChannel {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            request_id: Arc::new(AtomicU64::new(1)),
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sends `command` and returns the reply's `data` field.
    pub async fn request(&self, command: Value) -> Result<Value> {
        let _guard = self.in_flight.lock().await;
        let request_id = self.request_id.fetch_add(1, Ordering::Relaxed);

        match tokio::time::timeout(self.timeout, self.exchange(command, request_id)).await {
            Ok(result) => result,
            Err(_) => Err(PlayerError::control_channel(format!(
                "request {} timed out after {:?}",
                request_id, self.timeout
            ))),
        }
    }

    async fn exchange(&self, command: Value, request_id: u64) -> Result<Value> {
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|source| PlayerError::ControlUnavailable {
                path: self.path.clone(),
                source,
            })?;
        let (read_half, mut write_half) = stream.into_split();

        let mut line = serde_json::to_string(&json!({
            "command": command,
            "request_id": request_id,
        }))?;
        trace!(request = %line, "Control channel request");
        line.push('\n');
        write_half
            .write_all(line.as_bytes())
            .await
            .map_err(|err| PlayerError::control_channel(format!("write: {}", err)))?;

        let mut lines = BufReader::new(read_half).lines();
        loop {
            let reply = lines
                .next_line()
                .await
                .map_err(|err| PlayerError::control_channel(format!("read: {}", err)))?
                .ok_or_else(|| PlayerError::control_channel("connection closed before reply"))?;

            let reply: Value = match serde_json::from_str(&reply) {
                Ok(value) => value,
                Err(_) => continue,
            };
            if reply.get("event").is_some() {
                continue;
            }
            if reply.get("request_id").and_then(Value::as_u64) != Some(request_id) {
                continue;
            }
            return parse_reply(reply);
        }
    }

    pub async fn set_property(&self, name: &str, value: Value) -> Result<()> {
        self.request(json!(["set_property", name, value])).await.map(|_| ())
    }

    pub async fn get_property(&self, name: &str) -> Result<Value> {
        self.request(json!(["get_property", name])).await
    }

    pub async fn set_volume(&self, volume: u8) -> Result<()> {
        self.set_property("volume", json!(volume)).await
    }

    pub async fn set_pause(&self, paused: bool) -> Result<()> {
        self.set_property("pause", json!(paused)).await
    }

    /// Seconds of audio buffered ahead of the output.
    pub async fn buffered_seconds(&self) -> Result<f64> {
        let value = self.get_property(PROP_CACHE_DURATION).await?;
        value.as_f64().ok_or_else(|| {
            PlayerError::control_channel(format!("{} is not a number: {}", PROP_CACHE_DURATION, value))
        })
    }

    pub async fn is_idle(&self) -> Result<bool> {
        let value = self.get_property(PROP_IDLE).await?;
        value.as_bool().ok_or_else(|| {
            PlayerError::control_channel(format!("{} is not a boolean: {}", PROP_IDLE, value))
        })
    }
}

fn parse_reply(reply: Value) -> Result<Value> {
    match reply.get("error").and_then(Value::as_str) {
        Some("success") => Ok(reply.get("data").cloned().unwrap_or(Value::Null)),
        Some(other) => Err(PlayerError::control_channel(other.to_string())),
        None => Err(PlayerError::control_channel(format!(
            "reply without status: {}",
            reply
        ))),
    }
}
