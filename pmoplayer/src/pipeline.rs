//! Chains of external processes realising one backend's audio path.
//!
//! A [`ProcessPipeline`] launches its stages in declared order and connects
//! each stage's standard output directly to the next stage's standard input.
//! The last stage is the one producing audible or network output: the
//! pipeline is alive exactly as long as that stage runs.
//!
//! # Shutdown
//!
//! - `stop()` signals the stages downstream first, so upstream stages never
//!   see a broken pipe before being asked to exit cleanly.
//! - Each stage gets `grace` to exit after SIGTERM, then is force-killed.
//! - A pipeline dropped without `stop()` runs the same sequence on the
//!   current tokio runtime, or force-kills immediately when there is none.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::errors::{PlayerError, Result};

/// Launch description of one pipeline stage.
#[derive(Clone, Debug)]
pub struct StageSpec {
    name: String,
    program: PathBuf,
    args: Vec<OsString>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }
}

struct RunningStage {
    name: String,
    child: Child,
}

/// Exclusively owned handle on 0-N running processes plus an optional
/// control socket that is removed when the pipeline goes away.
pub struct ProcessPipeline {
    stages: Vec<RunningStage>,
    control_socket: Option<PathBuf>,
    grace: Duration,
}

impl fmt::Debug for ProcessPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessPipeline")
            .field(
                "stages",
                &self.stages.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            )
            .field("control_socket", &self.control_socket)
            .field("grace", &self.grace)
            .finish()
    }
}

impl ProcessPipeline {
    /// Launches `specs` in order, piping stdout of each stage into the next.
    ///
    /// After launch the pipeline waits `startup_check` and fails if the last
    /// stage has already exited. On any failure the stages already started
    /// are terminated before the error is returned.
    pub async fn start(
        specs: Vec<StageSpec>,
        grace: Duration,
        startup_check: Duration,
    ) -> Result<Self> {
        let mut pipeline = ProcessPipeline {
            stages: Vec::with_capacity(specs.len()),
            control_socket: None,
            grace,
        };

        let count = specs.len();
        let mut upstream: Option<Stdio> = None;

        for (index, spec) in specs.into_iter().enumerate() {
            let is_last = index + 1 == count;

            let mut cmd = Command::new(&spec.program);
            cmd.args(&spec.args)
                .stdin(upstream.take().unwrap_or_else(Stdio::null))
                .stdout(if is_last { Stdio::null() } else { Stdio::piped() })
                .stderr(Stdio::null());

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(err) => {
                    warn!(stage = %spec.name, program = %spec.program.display(), error = %err, "Failed to launch pipeline stage");
                    pipeline.stop().await;
                    return Err(PlayerError::start_failure(&spec.name, err));
                }
            };

            if !is_last {
                let stdout = match child.stdout.take() {
                    Some(out) => out,
                    None => {
                        pipeline.stages.push(RunningStage {
                            name: spec.name.clone(),
                            child,
                        });
                        pipeline.stop().await;
                        return Err(PlayerError::start_failure(
                            &spec.name,
                            "standard output was not captured",
                        ));
                    }
                };
                match TryInto::<Stdio>::try_into(stdout) {
                    Ok(stdio) => upstream = Some(stdio),
                    Err(err) => {
                        pipeline.stages.push(RunningStage {
                            name: spec.name.clone(),
                            child,
                        });
                        pipeline.stop().await;
                        return Err(PlayerError::start_failure(&spec.name, err));
                    }
                }
            }

            info!(stage = %spec.name, pid = ?child.id(), "Pipeline stage started");
            pipeline.stages.push(RunningStage {
                name: spec.name,
                child,
            });
        }

        if !startup_check.is_zero() && !pipeline.stages.is_empty() {
            tokio::time::sleep(startup_check).await;
            if let Some(last) = pipeline.stages.last_mut() {
                if let Ok(Some(status)) = last.child.try_wait() {
                    let name = last.name.clone();
                    warn!(stage = %name, %status, "Pipeline stage exited right after launch");
                    pipeline.stop().await;
                    return Err(PlayerError::start_failure(
                        name,
                        format!("exited immediately ({})", status),
                    ));
                }
            }
        }

        Ok(pipeline)
    }

    /// Attaches a control socket path removed on stop/drop.
    pub fn with_control_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.control_socket = Some(path.into());
        self
    }

    pub fn control_socket(&self) -> Option<&Path> {
        self.control_socket.as_deref()
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Process ids of the running stages, in launch order.
    pub fn pids(&self) -> Vec<u32> {
        self.stages.iter().filter_map(|s| s.child.id()).collect()
    }

    /// True while the last stage is still running.
    pub fn is_alive(&mut self) -> bool {
        match self.stages.last_mut() {
            Some(last) => matches!(last.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Terminates every stage (downstream first) and removes the control
    /// socket. Calling it on an already stopped pipeline is a no-op.
    pub async fn stop(&mut self) {
        let grace = self.grace;
        while let Some(stage) = self.stages.pop() {
            terminate_stage(stage, grace).await;
        }
        self.remove_control_socket();
    }

    fn remove_control_socket(&mut self) {
        if let Some(path) = self.control_socket.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(socket = %path.display(), "Removed control socket"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(socket = %path.display(), error = %err, "Failed to remove control socket")
                }
            }
        }
    }
}

impl Drop for ProcessPipeline {
    fn drop(&mut self) {
        if self.stages.is_empty() {
            self.remove_control_socket();
            return;
        }

        let mut stages = std::mem::take(&mut self.stages);
        let grace = self.grace;
        debug!(stages = stages.len(), "Pipeline dropped while running, terminating");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    while let Some(stage) = stages.pop() {
                        terminate_stage(stage, grace).await;
                    }
                });
            }
            Err(_) => {
                while let Some(mut stage) = stages.pop() {
                    let _ = stage.child.start_kill();
                }
            }
        }
        self.remove_control_socket();
    }
}

async fn terminate_stage(mut stage: RunningStage, grace: Duration) {
    if let Ok(Some(status)) = stage.child.try_wait() {
        debug!(stage = %stage.name, %status, "Stage already exited");
        return;
    }

    send_terminate(&mut stage.child);

    match tokio::time::timeout(grace, stage.child.wait()).await {
        Ok(Ok(status)) => debug!(stage = %stage.name, %status, "Stage terminated"),
        Ok(Err(err)) => warn!(stage = %stage.name, error = %err, "Failed to wait for stage"),
        Err(_) => {
            let err = PlayerError::PipelineTerminationTimeout {
                stage: stage.name.clone(),
                timeout: grace,
            };
            warn!(error = %err, "Escalating to force-kill");
            if let Err(err) = stage.child.kill().await {
                warn!(stage = %stage.name, error = %err, "Force-kill failed");
            }
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain signal delivery to a child we own and have not reaped.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            debug!(pid, "SIGTERM delivery failed, force-killing");
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.start_kill();
}
